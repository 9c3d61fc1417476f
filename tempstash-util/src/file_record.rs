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

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempstash_error::{make_input_err, Error};

use crate::buf_channel::DropCloserReadHalf;

pub const MAX_ID_LENGTH: usize = 255;
pub const MAX_METADATA_KEYS: usize = 50;
pub const MAX_METADATA_KEY_LENGTH: usize = 100;
pub const MAX_METADATA_STRING_LENGTH: usize = 1000;

/// The descriptor persisted for every stored blob. Never mutated after
/// creation; destroyed by an explicit delete or by the reaper once
/// `expires_at` has passed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Unique identifier, also used as the blob store key.
    pub id: String,

    /// Name exactly as given by the client.
    pub original_name: String,

    /// Sanitized display name with a random suffix, eg `report_a1b2c3d4.pdf`.
    pub stored_name: String,

    pub mime_type: String,

    /// Authoritative byte count observed by the ingest stream.
    pub size: u64,

    /// Lowercase hex SHA-256 of the stored bytes.
    pub hash: String,

    pub uploaded_at: DateTime<Utc>,

    /// Time-to-live in seconds; `expires_at == uploaded_at + ttl`.
    #[serde(rename = "ttl")]
    pub ttl_seconds: u64,

    pub expires_at: DateTime<Utc>,

    /// Blob store key. Always equals `id` in this design, but persisted
    /// separately so records survive a future key-scheme change.
    pub file_path: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl FileRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn time_remaining_mins(&self, now: DateTime<Utc>) -> i64 {
        ((self.expires_at - now).num_seconds().max(0) + 59) / 60
    }
}

/// A producer of a finite byte sequence plus the client-declared facts
/// about it. Every upload path (multipart, raw body, remote URL) is
/// normalized into this shape before it reaches the ingest pipeline.
pub struct UploadedFile {
    pub original_name: String,

    /// MIME type declared by the client. Content detection takes priority
    /// over this.
    pub declared_mime: Option<String>,

    /// Declared size. A hint only; the authoritative size comes from the
    /// stream.
    pub size_hint: Option<u64>,

    pub reader: DropCloserReadHalf,
}

/// Ids are generated by the service, but every externally supplied id is
/// still validated before being used as a store key.
pub fn is_valid_file_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Replaces every character outside `[letters, digits, '.', '_', '-']`
/// with an underscore and collapses runs. An input that sanitizes to
/// nothing falls back to `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_replacement = false;
    for c in name.chars() {
        if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_was_replacement = false;
        } else if !last_was_replacement {
            out.push('_');
            last_was_replacement = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.chars().all(|c| c == '.' || c == '_') {
        return "file".to_string();
    }
    trimmed.to_string()
}

/// Builds the display name stored alongside a blob: sanitized stem, a
/// random 8-hex-digit suffix, and the original extension.
pub fn make_stored_name(original_name: &str) -> String {
    let (stem, extension) = match original_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (original_name, None),
    };
    let suffix: u32 = rand::thread_rng().gen();
    match extension {
        Some(ext) => format!("{}_{suffix:08x}.{ext}", sanitize_file_name(stem)),
        None => format!("{}_{suffix:08x}", sanitize_file_name(stem)),
    }
}

/// Validates the shape of client-supplied metadata: at most
/// [`MAX_METADATA_KEYS`] entries, keys up to [`MAX_METADATA_KEY_LENGTH`]
/// chars, values restricted to string | number | boolean | null |
/// array-of-string, strings up to [`MAX_METADATA_STRING_LENGTH`] chars.
pub fn validate_user_metadata(metadata: &BTreeMap<String, Value>) -> Result<(), Error> {
    if metadata.len() > MAX_METADATA_KEYS {
        return Err(make_input_err!(
            "Metadata has {} keys, maximum is {MAX_METADATA_KEYS}",
            metadata.len()
        ));
    }
    for (key, value) in metadata {
        if key.is_empty() || key.chars().count() > MAX_METADATA_KEY_LENGTH {
            return Err(make_input_err!(
                "Metadata key '{key}' must be 1..={MAX_METADATA_KEY_LENGTH} characters"
            ));
        }
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
            Value::String(s) => {
                if s.chars().count() > MAX_METADATA_STRING_LENGTH {
                    return Err(make_input_err!(
                        "Metadata value for '{key}' exceeds {MAX_METADATA_STRING_LENGTH} characters"
                    ));
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) if s.chars().count() <= MAX_METADATA_STRING_LENGTH => {}
                        Value::String(_) => {
                            return Err(make_input_err!(
                                "Metadata value for '{key}' contains a string over {MAX_METADATA_STRING_LENGTH} characters"
                            ));
                        }
                        _ => {
                            return Err(make_input_err!(
                                "Metadata arrays may only contain strings (key '{key}')"
                            ));
                        }
                    }
                }
            }
            Value::Object(_) => {
                return Err(make_input_err!(
                    "Metadata value for '{key}' must be a string, number, boolean, null or array of strings"
                ));
            }
        }
    }
    Ok(())
}

/// Filter applied by `search_records`. All bounds are optional; `expired_only`
/// selects which side of the expiry instant is visible.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub mime_type: Option<String>,
    /// Inclusive bounds.
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Strict bounds.
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    /// When false expired records are filtered out; when true only expired
    /// records are returned.
    pub expired_only: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SearchFilter {
    pub fn matches(&self, record: &FileRecord, now: DateTime<Utc>) -> bool {
        if record.is_expired(now) != self.expired_only {
            return false;
        }
        if let Some(mime_type) = &self.mime_type {
            if &record.mime_type != mime_type {
                return false;
            }
        }
        if let Some(min_size) = self.min_size {
            if record.size < min_size {
                return false;
            }
        }
        if let Some(max_size) = self.max_size {
            if record.size > max_size {
                return false;
            }
        }
        if let Some(uploaded_after) = self.uploaded_after {
            if record.uploaded_at <= uploaded_after {
                return false;
            }
        }
        if let Some(uploaded_before) = self.uploaded_before {
            if record.uploaded_at >= uploaded_before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub records: Vec<FileRecord>,
    /// Count after filtering but before offset/limit.
    pub total: u64,
}

/// Shared filter/sort/paginate routine used by every metadata backend:
/// newest first, ties broken by id ascending, offset applied before limit.
pub fn filter_and_page(
    records: impl IntoIterator<Item = FileRecord>,
    filter: &SearchFilter,
    now: DateTime<Utc>,
) -> SearchResults {
    let mut matched: Vec<FileRecord> = records
        .into_iter()
        .filter(|record| filter.matches(record, now))
        .collect();
    matched.sort_by(|a, b| {
        b.uploaded_at
            .cmp(&a.uploaded_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let total = matched.len() as u64;
    let offset = filter.offset.unwrap_or(0).min(matched.len());
    let mut records: Vec<FileRecord> = matched.drain(offset..).collect();
    if let Some(limit) = filter.limit {
        records.truncate(limit);
    }
    SearchResults { records, total }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_files: u64,
    pub total_size: u64,
    pub files_by_mime: BTreeMap<String, u64>,
    /// Upload-day buckets, keyed `YYYY-MM-DD`.
    pub files_by_date: BTreeMap<String, u64>,
}

pub fn aggregate_stats(records: impl IntoIterator<Item = FileRecord>) -> StoreStats {
    let mut stats = StoreStats::default();
    for record in records {
        stats.total_files += 1;
        stats.total_size += record.size;
        *stats.files_by_mime.entry(record.mime_type).or_insert(0) += 1;
        let day = record.uploaded_at.format("%Y-%m-%d").to_string();
        *stats.files_by_date.entry(day).or_insert(0) += 1;
    }
    stats
}
