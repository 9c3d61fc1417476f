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
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempstash_config::stores::FilesystemBlobStore as FilesystemBlobStoreConfig;
use tempstash_error::{make_err, make_input_err, Code, Error, ResultExt};
use tempstash_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use tempstash_util::store_trait::{BlobHead, BlobStore, UploadSizeInfo};
use tokio::io::AsyncWriteExt;

/// Suffix of the sidecar file holding content type and user metadata for a
/// blob. Sidecars are an implementation detail and never appear in
/// listings.
const SIDECAR_SUFFIX: &str = ".meta.json";

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Default)]
struct SidecarMeta {
    content_type: String,
    #[serde(default)]
    user_meta: BTreeMap<String, String>,
}

/// Stores blobs as files below a content root. Uploads are staged in a
/// temp directory on the same filesystem and renamed into place, so a
/// reader can never observe a partially written blob.
pub struct FilesystemStore {
    content_path: PathBuf,
    temp_path: PathBuf,
}

impl FilesystemStore {
    pub async fn new(config: &FilesystemBlobStoreConfig) -> Result<Self, Error> {
        let content_path = PathBuf::from(&config.content_path);
        let temp_path = config
            .temp_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| content_path.join(".tmp"));
        tokio::fs::create_dir_all(&content_path)
            .await
            .err_tip(|| format!("Failed to create {}", content_path.display()))?;
        tokio::fs::create_dir_all(&temp_path)
            .await
            .err_tip(|| format!("Failed to create {}", temp_path.display()))?;
        Ok(FilesystemStore {
            content_path,
            temp_path,
        })
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf, Error> {
        if key.is_empty()
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(make_input_err!("Invalid blob key '{key}'"));
        }
        Ok(self.content_path.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(SIDECAR_SUFFIX);
        PathBuf::from(os)
    }

    async fn read_sidecar(path: &Path) -> Result<SidecarMeta, Error> {
        match tokio::fs::read(Self::sidecar_path(path)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| make_err!(Code::Internal, "Corrupt blob sidecar: {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SidecarMeta::default()),
            Err(e) => Err(Error::from(e)).err_tip(|| "Failed to read blob sidecar"),
        }
    }
}

#[async_trait]
impl BlobStore for FilesystemStore {
    async fn put(
        &self,
        key: &str,
        mut reader: DropCloserReadHalf,
        content_type: &str,
        _size_info: UploadSizeInfo,
        user_meta: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let final_path = self.key_to_path(key)?;
        let temp_file = self.temp_path.join(uuid::Uuid::new_v4().to_string());

        let write_result = async {
            let mut file = tokio::fs::File::create(&temp_file)
                .await
                .err_tip(|| "Failed to create temp file in FilesystemStore::put")?;
            loop {
                let chunk = reader
                    .recv()
                    .await
                    .err_tip(|| "Failed to read chunk in FilesystemStore::put")?;
                if chunk.is_empty() {
                    break; // EOF.
                }
                file.write_all(&chunk)
                    .await
                    .err_tip(|| "Failed to write chunk in FilesystemStore::put")?;
            }
            file.flush()
                .await
                .err_tip(|| "Failed to flush in FilesystemStore::put")?;
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .err_tip(|| "Failed to create parent directory")?;
            }
            tokio::fs::rename(&temp_file, &final_path)
                .await
                .err_tip(|| "Failed to move blob into place")?;
            Ok(())
        }
        .await;

        if write_result.is_err() {
            // The temp file is worthless once the upload failed.
            let _ = tokio::fs::remove_file(&temp_file).await;
            return write_result;
        }

        if !user_meta.is_empty() || !content_type.is_empty() {
            let sidecar = SidecarMeta {
                content_type: content_type.to_string(),
                user_meta: user_meta.clone(),
            };
            let encoded = serde_json::to_vec(&sidecar)
                .map_err(|e| make_err!(Code::Internal, "Failed to encode sidecar: {e}"))?;
            tokio::fs::write(Self::sidecar_path(&final_path), encoded)
                .await
                .err_tip(|| "Failed to write blob sidecar")?;
        }
        Ok(())
    }

    async fn get(&self, key: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let path = self.key_to_path(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(make_err!(Code::NotFound, "Key {key} not found"));
            }
            Err(e) => {
                return Err(Error::from(e)).err_tip(|| "Failed to open blob file");
            }
        };
        loop {
            let mut buf = bytes::BytesMut::with_capacity(READ_BUFFER_SIZE);
            let read = tokio::io::AsyncReadExt::read_buf(&mut file, &mut buf)
                .await
                .err_tip(|| "Failed to read blob file")?;
            if read == 0 {
                break;
            }
            writer
                .send(buf.freeze())
                .await
                .err_tip(|| "Failed to forward blob chunk")?;
        }
        writer
            .send_eof()
            .err_tip(|| "Failed to send EOF in FilesystemStore::get")
    }

    async fn head(&self, key: &str) -> Result<Option<BlobHead>, Error> {
        let path = self.key_to_path(key)?;
        let file_meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::from(e)).err_tip(|| "Failed to stat blob file");
            }
        };
        let sidecar = Self::read_sidecar(&path).await?;
        let modified = file_meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Some(BlobHead {
            size: file_meta.len(),
            content_type: if sidecar.content_type.is_empty() {
                None
            } else {
                Some(sidecar.content_type)
            },
            modified,
            user_meta: sidecar.user_meta,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let path = self.key_to_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e)).err_tip(|| "Failed to delete blob file");
            }
        }
        let _ = tokio::fs::remove_file(Self::sidecar_path(&path)).await;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        let mut pending = vec![self.content_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::from(e)).err_tip(|| "Failed to list blob directory");
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .err_tip(|| "Failed to read directory entry")?
            {
                let path = entry.path();
                if path == self.temp_path {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .err_tip(|| "Failed to stat directory entry")?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.content_path) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                if key.ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn healthy(&self) -> bool {
        tokio::fs::metadata(&self.content_path).await.is_ok()
    }
}
