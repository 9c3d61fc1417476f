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

use tempstash_config::stores::{BlobStoreConfig, MetadataStoreConfig};
use tempstash_error::{Error, ResultExt};
use tempstash_util::store_trait::{BlobStore, MetadataStore};

use crate::blob_metadata_store::BlobEncodedMetadataStore;
use crate::filesystem_store::FilesystemStore;
use crate::memory_store::MemoryStore;
use crate::redis_metadata_store::RedisMetadataStore;
use crate::s3_store::S3Store;

pub async fn blob_store_factory(config: &BlobStoreConfig) -> Result<Arc<dyn BlobStore>, Error> {
    Ok(match config {
        BlobStoreConfig::memory(config) => Arc::new(MemoryStore::new(config)),
        BlobStoreConfig::filesystem(config) => Arc::new(
            FilesystemStore::new(config)
                .await
                .err_tip(|| "Failed to initialize filesystem store")?,
        ),
        BlobStoreConfig::s3(config) => Arc::new(
            S3Store::new(config)
                .await
                .err_tip(|| "Failed to initialize s3 store")?,
        ),
    })
}

/// The blob-encoded variant stores its records inside `blob_store`, which
/// is why the factory takes the already-built blob store.
pub fn metadata_store_factory(
    config: &MetadataStoreConfig,
    blob_store: &Arc<dyn BlobStore>,
) -> Result<Arc<dyn MetadataStore>, Error> {
    Ok(match config {
        MetadataStoreConfig::redis(config) => Arc::new(
            RedisMetadataStore::new(config).err_tip(|| "Failed to initialize redis store")?,
        ),
        MetadataStoreConfig::blob_encoded(config) => Arc::new(BlobEncodedMetadataStore::new(
            config,
            blob_store.clone(),
        )),
    })
}
