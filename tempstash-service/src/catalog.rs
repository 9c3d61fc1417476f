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

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempstash_error::{make_err, make_input_err, Code, Error, ResultExt};
use tempstash_util::buf_channel::{make_buf_channel_pair, DropCloserReadHalf};
use tempstash_util::file_record::{
    is_valid_file_id, FileRecord, SearchFilter, SearchResults, StoreStats,
};
use tempstash_util::store_trait::{BlobStore, MetadataStore};
use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Existence {
    pub exists: bool,
    pub is_expired: bool,
}

/// Facade over the two stores that the rest of the system consumes.
/// Every read path checks expiry, so the reaper is never on the critical
/// path for correctness: a record whose TTL passed a moment ago is already
/// invisible here.
pub struct CatalogService {
    blob_store: Arc<dyn BlobStore>,
    metadata_store: Arc<dyn MetadataStore>,
}

impl CatalogService {
    pub fn new(blob_store: Arc<dyn BlobStore>, metadata_store: Arc<dyn MetadataStore>) -> Self {
        CatalogService {
            blob_store,
            metadata_store,
        }
    }

    fn validate_id(id: &str) -> Result<(), Error> {
        if !is_valid_file_id(id) {
            return Err(make_input_err!("Invalid file id '{id}'"));
        }
        Ok(())
    }

    /// Expired records collapse into `NotFound` on all read paths.
    pub async fn get_info(&self, id: &str) -> Result<FileRecord, Error> {
        Self::validate_id(id)?;
        let record = self
            .metadata_store
            .get_record(id)
            .await
            .err_tip(|| "Failed to load record in get_info")?
            .ok_or_else(|| make_err!(Code::NotFound, "File {id} not found"))?;
        if record.is_expired(Utc::now()) {
            return Err(make_err!(Code::NotFound, "File {id} not found"));
        }
        Ok(record)
    }

    pub async fn read(&self, id: &str) -> Result<Bytes, Error> {
        let record = self.get_info(id).await?;
        self.blob_store
            .get_all(&record.file_path)
            .await
            .err_tip(|| format!("Failed to read blob for {id}"))
    }

    /// Streaming read that never materializes the blob. The store fetch
    /// runs on a detached task; a mid-stream failure reaches the consumer
    /// as a stream error through the channel's drop semantics.
    pub async fn open_stream(
        &self,
        id: &str,
    ) -> Result<(FileRecord, DropCloserReadHalf), Error> {
        let record = self.get_info(id).await?;
        let (tx, rx) = make_buf_channel_pair();
        let blob_store = self.blob_store.clone();
        let key = record.file_path.clone();
        tokio::spawn(async move {
            if let Err(err) = blob_store.get(&key, tx).await {
                event!(Level::WARN, key, ?err, "Blob stream failed mid-download");
            }
        });
        Ok((record, rx))
    }

    /// Deletes the blob, then the record. No expiry filter here: the
    /// reaper deletes expired records through this same path. A missing
    /// blob with a present record is not an error, the record is still
    /// removed.
    pub async fn delete(&self, id: &str) -> Result<DateTime<Utc>, Error> {
        Self::validate_id(id)?;
        let record = self
            .metadata_store
            .get_record(id)
            .await
            .err_tip(|| "Failed to load record in delete")?
            .ok_or_else(|| make_err!(Code::NotFound, "File {id} not found"))?;
        self.blob_store
            .delete(&record.file_path)
            .await
            .err_tip(|| format!("Failed to delete blob for {id}"))?;
        self.metadata_store
            .delete_record(id)
            .await
            .err_tip(|| format!("Failed to delete record for {id}"))?;
        Ok(Utc::now())
    }

    pub async fn search(&self, filter: &SearchFilter) -> Result<SearchResults, Error> {
        self.metadata_store.search_records(filter).await
    }

    pub async fn stats(&self) -> Result<StoreStats, Error> {
        self.metadata_store.stats().await
    }

    /// True iff `get_info` would succeed.
    pub async fn file_exists(&self, id: &str) -> Result<bool, Error> {
        match self.get_info(id).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(err.code, Code::NotFound | Code::InvalidArgument) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Existence plus the expired flag for the HTTP exists endpoint.
    pub async fn existence(&self, id: &str) -> Result<Existence, Error> {
        Self::validate_id(id)?;
        match self
            .metadata_store
            .get_record(id)
            .await
            .err_tip(|| "Failed to load record in existence")?
        {
            None => Ok(Existence {
                exists: false,
                is_expired: false,
            }),
            Some(record) => {
                let is_expired = record.is_expired(Utc::now());
                Ok(Existence {
                    exists: !is_expired,
                    is_expired,
                })
            }
        }
    }

    pub async fn healthy(&self) -> bool {
        self.blob_store.healthy().await && self.metadata_store.healthy().await
    }
}
