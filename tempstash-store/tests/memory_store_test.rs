// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use bytes::Bytes;
use tempstash_config::stores::MemoryBlobStore as MemoryBlobStoreConfig;
use tempstash_error::{Code, Error};
use tempstash_store::memory_store::MemoryStore;
use tempstash_util::buf_channel::make_buf_channel_pair;
use tempstash_util::store_trait::{BlobStore, UploadSizeInfo};

#[cfg(test)]
mod memory_store_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    const KEY1: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[tokio::test]
    async fn insert_one_item_then_read() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());

        const VALUE1: &str = "13";
        store
            .put_oneshot(KEY1, VALUE1.into(), "text/plain", &BTreeMap::new())
            .await?;
        let head = store.head(KEY1).await?;
        assert!(head.is_some(), "Expected memory store to have key {KEY1}");
        assert_eq!(head.unwrap().size, VALUE1.len() as u64);

        let data = store.get_all(KEY1).await?;
        assert_eq!(data, Bytes::from(VALUE1), "Expected stored bytes back");
        Ok(())
    }

    #[tokio::test]
    async fn multi_chunk_stream_update() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());

        let (mut tx, rx) = make_buf_channel_pair();
        let send_fut = async move {
            tx.send("foo".into()).await?;
            tx.send("bar".into()).await?;
            tx.send_eof()?;
            Result::<(), Error>::Ok(())
        };
        let metadata = BTreeMap::new();
        let put_fut = store.put(
            KEY1,
            rx,
            "application/octet-stream",
            UploadSizeInfo::MaxSize(1024),
            &metadata,
        );
        let (send_result, put_result) = tokio::join!(send_fut, put_fut);
        send_result?;
        put_result?;

        assert_eq!(store.get_all(KEY1).await?, Bytes::from("foobar"));
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());
        let err = store.get_all("missing").await.unwrap_err();
        assert_eq!(err.code, Code::NotFound, "Expected NotFound, got: {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn head_returns_user_meta() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());
        let mut user_meta = BTreeMap::new();
        user_meta.insert("original-name".to_string(), "a.txt".to_string());
        store
            .put_oneshot(KEY1, "abc".into(), "text/plain", &user_meta)
            .await?;

        let head = store.head(KEY1).await?.expect("Expected key to exist");
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
        assert_eq!(head.user_meta.get("original-name").map(String::as_str), Some("a.txt"));
        assert!(head.modified.is_some(), "Memory store should track modified time");
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());
        store
            .put_oneshot(KEY1, "x".into(), "text/plain", &BTreeMap::new())
            .await?;
        store.delete(KEY1).await?;
        assert_eq!(store.head(KEY1).await?, None, "Expected key to be gone");
        // A second delete of a missing key must not error.
        store.delete(KEY1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn list_is_prefix_filtered_and_sorted() -> Result<(), Error> {
        let store = MemoryStore::new(&MemoryBlobStoreConfig::default());
        for key in ["metadata/2__b", "metadata/1__a", "blob-1", "metadata/3__c"] {
            store
                .put_oneshot(key, "x".into(), "text/plain", &BTreeMap::new())
                .await?;
        }
        let keys = store.list("metadata/").await?;
        assert_eq!(
            keys,
            vec!["metadata/1__a", "metadata/2__b", "metadata/3__c"],
            "Expected sorted keys under the prefix only"
        );
        let all = store.list("").await?;
        assert_eq!(all.len(), 4, "Empty prefix must list everything");
        Ok(())
    }
}
