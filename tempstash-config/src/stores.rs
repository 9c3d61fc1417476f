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

use serde::{Deserialize, Serialize};

#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BlobStoreConfig {
    /// Memory store keeps all blobs in a sorted in-memory map. Contents do
    /// not survive a restart; intended for tests and small single-node
    /// deployments.
    memory(MemoryBlobStore),

    /// Stores blobs as files under a content directory. Uploads are first
    /// written to a temporary directory on the same filesystem and then
    /// atomically renamed into place, so readers never observe a partial
    /// blob.
    filesystem(FilesystemBlobStore),

    /// S3 (or any S3-compatible service) as the backing object store. This
    /// configuration can be shared across multiple instances of the
    /// service.
    s3(S3BlobStore),
}

#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum MetadataStoreConfig {
    /// Records stored in a key-value store with native TTL support. The
    /// backend evicts stale entries on its own; the reaper still runs to
    /// reconcile the blob store.
    redis(RedisMetadataStore),

    /// Records serialized as JSON objects inside the blob store itself,
    /// under a reserved key prefix that encodes the expiry instant. Removes
    /// the need for a separate metadata dependency and makes expired-only
    /// scans cheap when the blob store lists keys in sorted order.
    blob_encoded(BlobEncodedMetadataStore),
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemoryBlobStore {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilesystemBlobStore {
    /// Path where blob content is stored. Keys may contain `/` separators
    /// and map to nested directories below this root.
    pub content_path: String,

    /// Directory used to stage uploads before they are renamed into
    /// `content_path`. Must be on the same block device as `content_path`
    /// so the rename is atomic. Defaults to `<content_path>/.tmp`.
    #[serde(default)]
    pub temp_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct S3BlobStore {
    /// S3 region. Usually us-east-1, us-west-2, af-south-1, etc...
    #[serde(default)]
    pub region: String,

    /// Bucket name to use as the backend.
    #[serde(default)]
    pub bucket: String,

    /// If you wish to prefix the location on s3. If None, no prefix will be used.
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Retry configuration to use when a network request fails.
    #[serde(default)]
    pub retry: Retry,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisMetadataStore {
    /// Connection string, eg. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Number of keys requested per SCAN page when enumerating records.
    /// The listing is always paged; a single unbounded listing is never
    /// attempted.
    ///
    /// Default: 1000.
    #[serde(default)]
    pub scan_page_size: usize,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct BlobEncodedMetadataStore {
    /// Whether the underlying blob store lists keys in lexicographic order.
    /// When set, expired-only scans stop at the first metadata key whose
    /// encoded expiry lies in the future. When unset every metadata key is
    /// read. All in-tree blob stores list sorted, so this defaults to true.
    #[serde(default = "default_sorted_listing")]
    pub assume_sorted_listing: bool,
}

fn default_sorted_listing() -> bool {
    true
}

/// Retry configuration. The delay is exponential and each iteration applies
/// a jitter as a percentage of the calculated delay, eg:
/// ```text
/// Retry{
///   max_retries: 7,
///   delay: .1,
///   jitter: .5,
/// }
/// ```
/// will result in the first retry sleeping 75ms - 125ms, doubling each
/// attempt after that.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default)]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form.
    #[serde(default)]
    pub jitter: f32,
}
