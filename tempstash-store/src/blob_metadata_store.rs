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
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempstash_config::stores::BlobEncodedMetadataStore as BlobEncodedMetadataStoreConfig;
use tempstash_error::{make_err, Code, Error, ResultExt};
use tempstash_util::file_record::{
    aggregate_stats, filter_and_page, FileRecord, SearchFilter, SearchResults, StoreStats,
};
use tempstash_util::store_trait::{
    BlobStore, MetadataStore, META_EXPIRES_AT, META_HASH, META_MIME_TYPE, META_ORIGINAL_NAME,
    META_SIZE, META_STORED_NAME, META_TTL, META_UPLOADED_AT,
};
use tracing::{event, Level};

/// Reserved key prefix for record objects inside the blob store. Ingest
/// generates UUID blob keys, so the prefix can never collide with a blob.
pub const METADATA_PREFIX: &str = "metadata/";

const RECORD_CONTENT_TYPE: &str = "application/json";

/// Builds `metadata/<expires_at_millis>__<id>.json`. The millisecond
/// prefix is fixed-width so lexicographic key order equals expiry order;
/// 13 digits covers dates into the year 2286.
pub fn record_key(expires_at: DateTime<Utc>, id: &str) -> String {
    format!(
        "{METADATA_PREFIX}{:013}__{id}.json",
        expires_at.timestamp_millis().max(0)
    )
}

/// Inverse of [`record_key`]. Returns the encoded expiry and the id.
pub fn parse_record_key(key: &str) -> Option<(i64, &str)> {
    let rest = key.strip_prefix(METADATA_PREFIX)?;
    let rest = rest.strip_suffix(".json")?;
    let (millis, id) = rest.split_once("__")?;
    Some((millis.parse::<i64>().ok()?, id))
}

/// Variant B of the metadata contract: records are JSON objects stored in
/// the blob store itself under [`METADATA_PREFIX`], which removes the
/// separate metadata dependency and makes expired-only scans cheap.
pub struct BlobEncodedMetadataStore {
    store: Arc<dyn BlobStore>,
    /// When the underlying store lists keys sorted, an expired-only scan
    /// stops at the first key whose encoded expiry is in the future.
    assume_sorted_listing: bool,
}

impl BlobEncodedMetadataStore {
    pub fn new(config: &BlobEncodedMetadataStoreConfig, store: Arc<dyn BlobStore>) -> Self {
        BlobEncodedMetadataStore {
            store,
            assume_sorted_listing: config.assume_sorted_listing,
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<FileRecord>, Error> {
        let raw = match self.store.get_all(key).await {
            Ok(raw) => raw,
            // The record can be deleted between list() and get(); that is
            // the same as it never having been listed.
            Err(e) if e.code == Code::NotFound => return Ok(None),
            Err(e) => return Err(e).err_tip(|| "Failed to read metadata object"),
        };
        match serde_json::from_slice::<FileRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                event!(Level::WARN, key, ?err, "Skipping undecodable metadata object");
                Ok(None)
            }
        }
    }

    /// Reads the records selected by `filter`, exploiting key order for
    /// expired-only scans when the backend lists sorted.
    async fn load_records(&self, expired_only_scan: bool) -> Result<Vec<FileRecord>, Error> {
        let keys = self
            .store
            .list(METADATA_PREFIX)
            .await
            .err_tip(|| "Failed to list metadata objects")?;
        let now_millis = Utc::now().timestamp_millis();
        let mut records = Vec::new();
        for key in keys {
            if expired_only_scan && self.assume_sorted_listing {
                if let Some((expires_millis, _)) = parse_record_key(&key) {
                    if expires_millis > now_millis {
                        // Keys are expiry-ordered, everything after this
                        // one is still live.
                        break;
                    }
                }
            }
            if let Some(record) = self.read_record(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Tries to rebuild a record from the user metadata attached to the
    /// blob itself, avoiding the metadata listing when an upload path
    /// stored every decisive field.
    fn synthesize_from_user_meta(
        id: &str,
        user_meta: &BTreeMap<String, String>,
    ) -> Option<FileRecord> {
        let uploaded_at = user_meta
            .get(META_UPLOADED_AT)?
            .parse::<DateTime<Utc>>()
            .ok()?;
        let expires_at = user_meta
            .get(META_EXPIRES_AT)?
            .parse::<DateTime<Utc>>()
            .ok()?;
        Some(FileRecord {
            id: id.to_string(),
            original_name: user_meta.get(META_ORIGINAL_NAME)?.clone(),
            stored_name: user_meta.get(META_STORED_NAME)?.clone(),
            mime_type: user_meta.get(META_MIME_TYPE)?.clone(),
            size: user_meta.get(META_SIZE)?.parse().ok()?,
            hash: user_meta.get(META_HASH)?.clone(),
            uploaded_at,
            ttl_seconds: user_meta.get(META_TTL)?.parse().ok()?,
            expires_at,
            file_path: id.to_string(),
            metadata: BTreeMap::new(),
        })
    }

    async fn find_record_keys(&self, id: &str) -> Result<Vec<String>, Error> {
        let keys = self
            .store
            .list(METADATA_PREFIX)
            .await
            .err_tip(|| "Failed to list metadata objects")?;
        Ok(keys
            .into_iter()
            .filter(|key| matches!(parse_record_key(key), Some((_, key_id)) if key_id == id))
            .collect())
    }
}

#[async_trait]
impl MetadataStore for BlobEncodedMetadataStore {
    async fn save_record(&self, record: &FileRecord) -> Result<(), Error> {
        let encoded = serde_json::to_vec(record)
            .map_err(|e| make_err!(Code::Internal, "Failed to encode record: {e}"))?;
        self.store
            .put_oneshot(
                &record_key(record.expires_at, &record.id),
                Bytes::from(encoded),
                RECORD_CONTENT_TYPE,
                &BTreeMap::new(),
            )
            .await
            .err_tip(|| "Failed to save metadata object")
    }

    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>, Error> {
        // The per-blob user metadata may hold everything we need, which
        // saves listing the whole metadata prefix.
        if let Some(head) = self.store.head(id).await? {
            if let Some(record) = Self::synthesize_from_user_meta(id, &head.user_meta) {
                return Ok(Some(record));
            }
        }
        for key in self.find_record_keys(id).await? {
            if let Some(record) = self.read_record(&key).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn delete_record(&self, id: &str) -> Result<(), Error> {
        // A retried save can leave more than one metadata object for the
        // same id; delete every match.
        for key in self.find_record_keys(id).await? {
            self.store
                .delete(&key)
                .await
                .err_tip(|| "Failed to delete metadata object")?;
        }
        Ok(())
    }

    async fn search_records(&self, filter: &SearchFilter) -> Result<SearchResults, Error> {
        let records = self.load_records(filter.expired_only).await?;
        Ok(filter_and_page(records, filter, Utc::now()))
    }

    async fn stats(&self) -> Result<StoreStats, Error> {
        let records = self.load_records(false).await?;
        let now = Utc::now();
        Ok(aggregate_stats(
            records.into_iter().filter(|r| !r.is_expired(now)),
        ))
    }

    async fn list_all_ids(&self) -> Result<Vec<String>, Error> {
        let keys = self
            .store
            .list(METADATA_PREFIX)
            .await
            .err_tip(|| "Failed to list metadata objects")?;
        Ok(keys
            .iter()
            .filter_map(|key| parse_record_key(key).map(|(_, id)| id.to_string()))
            .collect())
    }

    async fn healthy(&self) -> bool {
        self.store.healthy().await
    }
}
