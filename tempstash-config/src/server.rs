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
use tempstash_error::{make_input_err, Error, ResultExt};

use crate::stores::{
    BlobEncodedMetadataStore, BlobStoreConfig, FilesystemBlobStore, MemoryBlobStore,
    MetadataStoreConfig, RedisMetadataStore, S3BlobStore,
};

/// Records may never outlive their TTL, and a TTL may never be shorter than
/// this many seconds.
pub const MIN_TTL_SECONDS: u64 = 60;

/// Default TTL ceiling in minutes (~31 days).
pub const DEFAULT_MAX_TTL_MINUTES: u64 = 44_640;

/// Default TTL applied when the client does not specify one, in minutes.
pub const DEFAULT_TTL_MINUTES: u64 = 1_440;

const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;
const DEFAULT_CLEANUP_INTERVAL_MINS: i64 = 10;
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:3000";
const DEFAULT_CLEANUP_BATCH_SIZE: usize = 1000;
const DEFAULT_ORPHAN_GRACE_SECONDS: u64 = 3600;
const DEFAULT_MAX_REDIRECTS: usize = 5;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Optional path segment prefixed to all routes, eg. `/storage` turns
    /// `/api/v1/files` into `/storage/api/v1/files`.
    #[serde(default)]
    pub base_path: Option<String>,

    /// Optional absolute prefix used when building download URLs in
    /// responses. When unset, response URLs are paths relative to the
    /// service root.
    #[serde(default)]
    pub download_base_url: Option<String>,

    /// Blob backend holding the raw bytes.
    pub blob_store: BlobStoreConfig,

    /// Metadata backend holding the file records.
    pub metadata_store: MetadataStoreConfig,

    #[serde(default)]
    pub limits: UploadLimits,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub url_fetch: UrlFetchConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadLimits {
    /// Maximum number of bytes a single upload may contain. Ingest fails
    /// with a size error as soon as the stream exceeds this count.
    pub max_file_size: u64,

    /// MIME types accepted for upload. Empty means any type is accepted.
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,

    /// Upper bound on the per-file TTL, in seconds. The lower bound is
    /// fixed at [`MIN_TTL_SECONDS`].
    pub max_ttl_seconds: u64,

    /// TTL applied when the client does not supply one, in seconds.
    pub default_ttl_seconds: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        UploadLimits {
            max_file_size: DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024,
            allowed_mime_types: Vec::new(),
            max_ttl_seconds: DEFAULT_MAX_TTL_MINUTES * 60,
            default_ttl_seconds: DEFAULT_TTL_MINUTES * 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CleanupConfig {
    /// How often the reaper wakes up, in seconds. Zero or negative
    /// disables the periodic task; `POST /maintenance/run` still works.
    pub interval_seconds: i64,

    /// Maximum number of expired records processed per run.
    pub batch_size: usize,

    /// Blobs without a record are only reclaimed once they are at least
    /// this old. An ingest writes the blob before the record, so a fresh
    /// record-less blob may simply be an upload still in flight.
    pub orphan_grace_seconds: u64,

    /// Whether runs also scan for record-less blobs. The scan lists every
    /// blob key, so very large deployments may prefer to leave it off.
    pub reap_orphans: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            interval_seconds: DEFAULT_CLEANUP_INTERVAL_MINS * 60,
            batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            orphan_grace_seconds: DEFAULT_ORPHAN_GRACE_SECONDS,
            reap_orphans: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UrlFetchConfig {
    /// Maximum number of redirects followed before the fetch is aborted.
    pub max_redirects: usize,

    /// Timeout for establishing the connection to the remote host, in
    /// seconds. Zero disables the timeout.
    pub connect_timeout_seconds: u64,
}

impl Default for UrlFetchConfig {
    fn default() -> Self {
        UrlFetchConfig {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout_seconds: 30,
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

impl ServiceConfig {
    /// Builds a config from the operator environment. The variable names
    /// are contractual:
    ///
    /// * `MAX_FILE_SIZE_MB` - ingest cap (default 100).
    /// * `ALLOWED_MIME_TYPES` - comma-separated allow-list; empty allows all.
    /// * `MAX_TTL_MIN` - TTL ceiling in minutes (default 44640).
    /// * `CLEANUP_INTERVAL_MINS` - reaper period; `<= 0` disables.
    /// * `DOWNLOAD_BASE_URL` - optional absolute prefix for download URLs.
    /// * `BASE_PATH` - optional path segment prefixed to all routes.
    ///
    /// Backend selection: `BLOB_BACKEND` (`memory` | `filesystem` | `s3`,
    /// default `filesystem`) with `STORAGE_ROOT`, `S3_BUCKET`, `S3_REGION`
    /// and `S3_KEY_PREFIX`; `METADATA_BACKEND` (`redis` | `storage`,
    /// default `storage`) with `REDIS_URL`. `LISTEN_ADDRESS` overrides the
    /// bind address.
    pub fn from_env() -> Result<Self, Error> {
        let max_file_size_mb = parse_env_or("MAX_FILE_SIZE_MB", DEFAULT_MAX_FILE_SIZE_MB)?;
        let max_ttl_min = parse_env_or("MAX_TTL_MIN", DEFAULT_MAX_TTL_MINUTES)?;
        let cleanup_interval_mins =
            parse_env_or("CLEANUP_INTERVAL_MINS", DEFAULT_CLEANUP_INTERVAL_MINS)?;
        let allowed_mime_types = env_var("ALLOWED_MIME_TYPES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let blob_store = match env_var("BLOB_BACKEND").as_deref() {
            None | Some("filesystem") => BlobStoreConfig::filesystem(FilesystemBlobStore {
                content_path: env_var("STORAGE_ROOT").unwrap_or_else(|| "./data".to_string()),
                temp_path: None,
            }),
            Some("memory") => BlobStoreConfig::memory(MemoryBlobStore::default()),
            Some("s3") => BlobStoreConfig::s3(S3BlobStore {
                region: env_var("S3_REGION").unwrap_or_default(),
                bucket: env_var("S3_BUCKET")
                    .err_tip(|| "S3_BUCKET is required when BLOB_BACKEND=s3")?,
                key_prefix: env_var("S3_KEY_PREFIX"),
                retry: Default::default(),
            }),
            Some(other) => {
                return Err(make_input_err!("Unknown BLOB_BACKEND '{other}'"));
            }
        };

        let metadata_store = match env_var("METADATA_BACKEND").as_deref() {
            None | Some("storage") => {
                MetadataStoreConfig::blob_encoded(BlobEncodedMetadataStore {
                    assume_sorted_listing: true,
                })
            }
            Some("redis") => MetadataStoreConfig::redis(RedisMetadataStore {
                url: env_var("REDIS_URL")
                    .err_tip(|| "REDIS_URL is required when METADATA_BACKEND=redis")?,
                scan_page_size: 0,
            }),
            Some(other) => {
                return Err(make_input_err!("Unknown METADATA_BACKEND '{other}'"));
            }
        };

        Ok(ServiceConfig {
            listen_address: env_var("LISTEN_ADDRESS")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            base_path: env_var("BASE_PATH"),
            download_base_url: env_var("DOWNLOAD_BASE_URL"),
            blob_store,
            metadata_store,
            limits: UploadLimits {
                max_file_size: max_file_size_mb * 1024 * 1024,
                allowed_mime_types,
                max_ttl_seconds: max_ttl_min * 60,
                default_ttl_seconds: DEFAULT_TTL_MINUTES * 60,
            },
            cleanup: CleanupConfig {
                interval_seconds: cleanup_interval_mins * 60,
                ..Default::default()
            },
            url_fetch: UrlFetchConfig::default(),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| make_input_err!("Could not parse {name}='{raw}': {e}")),
        None => Ok(default),
    }
}
