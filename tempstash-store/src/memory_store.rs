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

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempstash_config::stores::MemoryBlobStore as MemoryBlobStoreConfig;
use tempstash_error::{make_err, Code, Error, ResultExt};
use tempstash_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use tempstash_util::store_trait::{BlobHead, BlobStore, UploadSizeInfo};

struct MemoryEntry {
    data: Bytes,
    content_type: String,
    user_meta: BTreeMap<String, String>,
    modified: DateTime<Utc>,
}

/// Keeps every blob in a sorted in-memory map. The sorted map matters: the
/// blob-encoded metadata store relies on `list()` returning keys in
/// lexicographic order.
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(_config: &MemoryBlobStoreConfig) -> Self {
        MemoryStore {
            map: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        reader: DropCloserReadHalf,
        content_type: &str,
        size_info: UploadSizeInfo,
        user_meta: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let data = reader
            .collect_all_with_size_hint(usize::try_from(size_info.max_size()).unwrap_or(0))
            .await
            .err_tip(|| "Failed to collect stream in MemoryStore::put")?;
        let mut map = self.map.lock();
        map.insert(
            key.to_string(),
            MemoryEntry {
                data,
                content_type: content_type.to_string(),
                user_meta: user_meta.clone(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let data = {
            let map = self.map.lock();
            map.get(key)
                .err_tip_with_code(|_| (Code::NotFound, format!("Key {key} not found")))?
                .data
                .clone()
        };
        if !data.is_empty() {
            writer
                .send(data)
                .await
                .err_tip(|| "Failed to write data in MemoryStore::get")?;
        }
        writer
            .send_eof()
            .err_tip(|| "Failed to write EOF in MemoryStore::get")
    }

    async fn head(&self, key: &str) -> Result<Option<BlobHead>, Error> {
        let map = self.map.lock();
        Ok(map.get(key).map(|entry| BlobHead {
            size: entry.data.len() as u64,
            content_type: Some(entry.content_type.clone()),
            modified: Some(entry.modified),
            user_meta: entry.user_meta.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let map = self.map.lock();
        Ok(map
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

impl MemoryStore {
    /// Backdates an entry's modified time. Test hook for orphan
    /// reclamation paths.
    pub fn set_modified(&self, key: &str, modified: DateTime<Utc>) -> Result<(), Error> {
        let mut map = self.map.lock();
        let entry = map
            .get_mut(key)
            .ok_or_else(|| make_err!(Code::NotFound, "Key {key} not found"))?;
        entry.modified = modified;
        Ok(())
    }
}
