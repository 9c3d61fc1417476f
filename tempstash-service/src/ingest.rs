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

use chrono::{Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempstash_config::server::{UploadLimits, MIN_TTL_SECONDS};
use tempstash_error::{make_err, make_input_err, Code, Error, ResultExt};
use tempstash_util::buf_channel::make_buf_channel_pair;
use tempstash_util::file_record::{
    make_stored_name, validate_user_metadata, FileRecord, UploadedFile,
};
use tempstash_util::store_trait::{
    BlobStore, MetadataStore, UploadSizeInfo, META_MIME_TYPE, META_ORIGINAL_NAME, META_SIZE,
};
use tracing::{event, Level};

const FALLBACK_MIME: &str = "application/octet-stream";

/// Bytes peeled off the front of the stream for content-based MIME
/// detection. Magic numbers live well within this window.
pub const MIME_DETECT_WINDOW: usize = 4096;

/// The upload pipeline: one streaming pass that size-caps, hashes,
/// MIME-sniffs, stores the blob and persists its record. Any partial
/// side-effect is compensated before an error is returned.
pub struct IngestPipeline {
    blob_store: Arc<dyn BlobStore>,
    metadata_store: Arc<dyn MetadataStore>,
    limits: UploadLimits,
}

impl IngestPipeline {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        metadata_store: Arc<dyn MetadataStore>,
        limits: UploadLimits,
    ) -> Self {
        IngestPipeline {
            blob_store,
            metadata_store,
            limits,
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub async fn upload_file(
        &self,
        file: UploadedFile,
        ttl_seconds: u64,
        user_metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<FileRecord, Error> {
        // Everything checkable without touching the stream fails before any
        // side effect exists.
        if file.original_name.is_empty() {
            return Err(make_input_err!("originalName must not be empty"));
        }
        if ttl_seconds < MIN_TTL_SECONDS || ttl_seconds > self.limits.max_ttl_seconds {
            return Err(make_input_err!(
                "ttl must be between {MIN_TTL_SECONDS} and {} seconds, got {ttl_seconds}",
                self.limits.max_ttl_seconds
            ));
        }
        let metadata = user_metadata.unwrap_or_default();
        validate_user_metadata(&metadata)?;
        let max_file_size = self.limits.max_file_size;
        if let Some(size_hint) = file.size_hint {
            if size_hint > max_file_size {
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "Declared size {size_hint} exceeds the maximum file size of {max_file_size} bytes"
                ));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut reader = file.reader;

        // Peel the detection window off the stream. The peeled bytes are
        // re-sent ahead of the remainder below, so the store receives the
        // original byte sequence exactly once.
        let head_bytes = reader
            .take(MIME_DETECT_WINDOW)
            .await
            .err_tip(|| "Failed to read upload stream")?;

        let mime_type = resolve_mime(&head_bytes, file.declared_mime.as_deref());
        if !self.limits.allowed_mime_types.is_empty()
            && !self.limits.allowed_mime_types.iter().any(|m| m == &mime_type)
        {
            return Err(make_err!(
                Code::FailedPrecondition,
                "MIME type '{mime_type}' is not allowed"
            ));
        }

        let mut blob_user_meta = BTreeMap::new();
        blob_user_meta.insert(META_MIME_TYPE.to_string(), mime_type.clone());
        blob_user_meta.insert(META_ORIGINAL_NAME.to_string(), file.original_name.clone());
        if let Some(size_hint) = file.size_hint {
            blob_user_meta.insert(META_SIZE.to_string(), size_hint.to_string());
        }
        let size_info = match file.size_hint {
            Some(size_hint) => UploadSizeInfo::ExactSize(size_hint),
            None => UploadSizeInfo::MaxSize(max_file_size),
        };

        let (mut store_tx, store_rx) = make_buf_channel_pair();
        let put_fut = {
            let blob_store = self.blob_store.clone();
            let key = id.clone();
            let content_type = mime_type.clone();
            tokio::spawn(async move {
                blob_store
                    .put(&key, store_rx, &content_type, size_info, &blob_user_meta)
                    .await
            })
        };

        // The tee: every chunk updates the hasher and the byte counter
        // before it is forwarded, and the counter fails fast the moment the
        // cap is crossed. Only accepted bytes reach the store, so
        // backpressure stays intact.
        let pump_result = async {
            let mut hasher = Sha256::new();
            let mut total: u64 = 0;
            let mut chunk = head_bytes;
            while !chunk.is_empty() {
                total += chunk.len() as u64;
                if total > max_file_size {
                    return Err(make_err!(
                        Code::ResourceExhausted,
                        "Upload exceeds the maximum file size of {max_file_size} bytes"
                    ));
                }
                hasher.update(&chunk);
                store_tx
                    .send(chunk)
                    .await
                    .err_tip(|| "Failed to forward upload chunk to blob store")?;
                chunk = reader
                    .recv()
                    .await
                    .err_tip(|| "Failed to read upload stream")?;
            }
            store_tx
                .send_eof()
                .err_tip(|| "Failed to finish blob store stream")?;
            Ok((total, hex::encode(hasher.finalize())))
        }
        .await;

        let (size, hash) = match pump_result {
            Ok(totals) => totals,
            Err(err) => {
                // Dropping the writer aborts the in-flight put; whatever it
                // managed to write is compensated below.
                drop(store_tx);
                let _ = put_fut.await;
                self.compensate_delete(&id).await;
                return Err(err);
            }
        };

        match put_fut.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.compensate_delete(&id).await;
                return Err(err.append("Failed to store blob"));
            }
            Err(join_err) => {
                self.compensate_delete(&id).await;
                return Err(Error::from(join_err));
            }
        }

        let uploaded_at = Utc::now();
        let record = FileRecord {
            id: id.clone(),
            original_name: file.original_name.clone(),
            stored_name: make_stored_name(&file.original_name),
            mime_type,
            size,
            hash,
            uploaded_at,
            ttl_seconds,
            expires_at: uploaded_at + Duration::seconds(ttl_seconds as i64),
            file_path: id.clone(),
            metadata,
        };
        // The record is written only after the blob write succeeded; the
        // reverse order could leave a record pointing at nothing.
        if let Err(err) = self.metadata_store.save_record(&record).await {
            self.compensate_delete(&id).await;
            return Err(err.append("Failed to save file record"));
        }
        Ok(record)
    }

    /// Best-effort orphan compensation. If this fails the blob stays
    /// behind until the reaper reconciles it.
    async fn compensate_delete(&self, id: &str) {
        if let Err(err) = self.blob_store.delete(id).await {
            event!(
                Level::ERROR,
                id,
                ?err,
                "Compensating delete failed, potential orphan"
            );
        }
    }
}

/// Content detection first, then the client declaration, then the fallback.
fn resolve_mime(head_bytes: &[u8], declared: Option<&str>) -> String {
    if let Some(kind) = infer::get(head_bytes) {
        return kind.mime_type().to_string();
    }
    declared
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}
