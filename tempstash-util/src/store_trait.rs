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
use tempstash_error::{Error, ResultExt};

use crate::buf_channel::{make_buf_channel_pair, DropCloserReadHalf, DropCloserWriteHalf};
use crate::file_record::{FileRecord, SearchFilter, SearchResults, StoreStats};

/// User metadata key for the MIME type attached to a blob at upload time.
pub const META_MIME_TYPE: &str = "mime-type";
/// User metadata key for the original client-supplied name.
pub const META_ORIGINAL_NAME: &str = "original-name";
pub const META_STORED_NAME: &str = "stored-name";
pub const META_SIZE: &str = "size";
pub const META_HASH: &str = "hash";
pub const META_UPLOADED_AT: &str = "uploaded-at";
pub const META_TTL: &str = "ttl";
pub const META_EXPIRES_AT: &str = "expires-at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSizeInfo {
    /// Exact size of the payload. Enables length-framed uploads on
    /// backends that want a Content-Length up front.
    ExactSize(u64),

    /// Upper bound when the exact size is unknown; the backend must buffer
    /// or use its chunked upload protocol.
    MaxSize(u64),
}

impl UploadSizeInfo {
    pub fn max_size(&self) -> u64 {
        match self {
            UploadSizeInfo::ExactSize(size) | UploadSizeInfo::MaxSize(size) => *size,
        }
    }
}

/// Result of a `head()` call: what the backend knows about a key without
/// reading the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobHead {
    pub size: u64,
    pub content_type: Option<String>,
    /// Last-modified instant, when the backend tracks one. Used by the
    /// reaper's orphan grace check.
    pub modified: Option<DateTime<Utc>>,
    pub user_meta: BTreeMap<String, String>,
}

/// Byte-level object store. Operations on distinct keys are unordered;
/// operations on the same key serialize by backend semantics. Failures are
/// returned as values, never panics.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Exhausts `reader` and stores the payload under `key`.
    async fn put(
        &self,
        key: &str,
        reader: DropCloserReadHalf,
        content_type: &str,
        size_info: UploadSizeInfo,
        user_meta: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Streams the payload of `key` into `writer`, ending with an EOF.
    /// A missing key is `Code::NotFound`.
    async fn get(&self, key: &str, writer: DropCloserWriteHalf) -> Result<(), Error>;

    /// `Ok(None)` when the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<BlobHead>, Error>;

    /// Idempotent; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// All keys starting with `prefix`, sorted ascending. Backends page
    /// through their native listing internally; callers see the flat
    /// sequence.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;

    async fn healthy(&self) -> bool;

    /// Convenience for small payloads that fit in one buffer.
    async fn put_oneshot(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        user_meta: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let size = data.len() as u64;
        let (mut tx, rx) = make_buf_channel_pair();
        // The channel buffers this single chunk, so the sends cannot block
        // before put() starts draining.
        if !data.is_empty() {
            tx.send(data).await.err_tip(|| "In put_oneshot")?;
        }
        tx.send_eof().err_tip(|| "In put_oneshot")?;
        self.put(key, rx, content_type, UploadSizeInfo::ExactSize(size), user_meta)
            .await
    }

    /// Convenience that materializes the whole payload.
    async fn get_all(&self, key: &str) -> Result<Bytes, Error> {
        let (tx, rx) = make_buf_channel_pair();
        let (get_result, data_result) = futures::join!(
            self.get(key, tx),
            rx.collect_all_with_size_hint(0),
        );
        get_result.err_tip(|| "In get_all")?;
        data_result
    }
}

/// Store of the descriptors written by ingest. Both variants (key-value
/// backend, metadata-in-blob-store) satisfy this same contract.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn save_record(&self, record: &FileRecord) -> Result<(), Error>;

    /// `Ok(None)` when no record exists for `id`. Expiry is not checked
    /// here; callers own visibility rules.
    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>, Error>;

    /// Idempotent; deleting a missing record is not an error.
    async fn delete_record(&self, id: &str) -> Result<(), Error>;

    async fn search_records(&self, filter: &SearchFilter) -> Result<SearchResults, Error>;

    async fn stats(&self) -> Result<StoreStats, Error>;

    async fn list_all_ids(&self) -> Result<Vec<String>, Error>;

    async fn healthy(&self) -> bool;
}
