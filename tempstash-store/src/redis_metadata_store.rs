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

use std::cmp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use redis::aio::{ConnectionLike, ConnectionManager};
use tempstash_config::server::MIN_TTL_SECONDS;
use tempstash_config::stores::RedisMetadataStore as RedisMetadataStoreConfig;
use tempstash_error::{make_err, Code, Error, ResultExt};
use tempstash_util::file_record::{
    aggregate_stats, filter_and_page, FileRecord, SearchFilter, SearchResults, StoreStats,
};
use tempstash_util::store_trait::MetadataStore;

const KEY_PREFIX: &str = "file:";
const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

/// Injectable clock so command-level tests can pin the backend TTL args.
type NowFn = fn() -> DateTime<Utc>;

fn from_redis_err(err: redis::RedisError) -> Error {
    make_err!(Code::Unavailable, "Redis error: {err}")
}

fn file_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Connection established on first use so construction stays synchronous
/// and a down backend surfaces as `Unavailable` instead of a crash at boot.
pub enum LazyConnection<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    Connection(Result<C, Error>),
    Future(Shared<BoxFuture<'static, Result<C, Error>>>),
}

/// Variant A of the metadata contract: records live in a key-value store
/// with a native TTL, so the backend evicts stale entries on its own. The
/// reaper still runs to reconcile the blob store.
pub struct RedisMetadataStore<C = ConnectionManager>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    connection: LazyConnection<C>,
    scan_page_size: usize,
    now_fn: NowFn,
}

impl RedisMetadataStore<ConnectionManager> {
    pub fn new(config: &RedisMetadataStoreConfig) -> Result<Self, Error> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| make_err!(Code::InvalidArgument, "Invalid redis url: {e}"))?;
        let connection_fut = async move {
            client
                .get_connection_manager()
                .await
                .map_err(from_redis_err)
        }
        .boxed()
        .shared();
        Ok(Self::new_with_conn_and_now_fn(
            LazyConnection::Future(connection_fut),
            config.scan_page_size,
            Utc::now,
        ))
    }
}

impl<C> RedisMetadataStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn new_with_conn_and_now_fn(
        connection: LazyConnection<C>,
        scan_page_size: usize,
        now_fn: NowFn,
    ) -> Self {
        RedisMetadataStore {
            connection,
            scan_page_size: if scan_page_size == 0 {
                DEFAULT_SCAN_PAGE_SIZE
            } else {
                scan_page_size
            },
            now_fn,
        }
    }

    async fn get_conn(&self) -> Result<C, Error> {
        match &self.connection {
            LazyConnection::Connection(result) => result.clone(),
            LazyConnection::Future(fut) => fut.clone().await,
        }
    }

    /// Pages through `file:*` with SCAN. A single unbounded listing is
    /// never requested from the backend.
    async fn scan_record_keys(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.get_conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(self.scan_page_size)
                .query_async(&mut conn)
                .await
                .map_err(from_redis_err)
                .err_tip(|| "Failed to scan record keys")?;
            keys.extend(page);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }

    async fn load_all_records(&self) -> Result<Vec<FileRecord>, Error> {
        let keys = self.scan_record_keys().await?;
        let mut conn = self.get_conn().await?;
        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.scan_page_size) {
            if chunk.is_empty() {
                continue;
            }
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(from_redis_err)
                .err_tip(|| "Failed to fetch record batch")?;
            for value in values.into_iter().flatten() {
                match serde_json::from_str::<FileRecord>(&value) {
                    Ok(record) => records.push(record),
                    // A corrupt record must not take down listings; skip it.
                    Err(err) => {
                        tracing::event!(
                            tracing::Level::WARN,
                            ?err,
                            "Skipping undecodable metadata record"
                        );
                    }
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl<C> MetadataStore for RedisMetadataStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn save_record(&self, record: &FileRecord) -> Result<(), Error> {
        let json = serde_json::to_string(record)
            .map_err(|e| make_err!(Code::Internal, "Failed to encode record: {e}"))?;
        let now = (self.now_fn)();
        // The backend TTL tracks the record expiry so stale entries vanish
        // on their own; never below the floor so a clock skew cannot evict
        // a record that was just written.
        let backend_ttl = cmp::max(
            MIN_TTL_SECONDS as i64,
            (record.expires_at - now).num_seconds(),
        );
        let mut conn = self.get_conn().await?;
        redis::cmd("SET")
            .arg(file_key(&record.id))
            .arg(&json)
            .arg("EX")
            .arg(backend_ttl)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(from_redis_err)
            .err_tip(|| "Failed to save record")
    }

    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>, Error> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(file_key(id))
            .query_async(&mut conn)
            .await
            .map_err(from_redis_err)
            .err_tip(|| "Failed to load record")?;
        match value {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .map_err(|e| make_err!(Code::Internal, "Corrupt record for {id}: {e}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn delete_record(&self, id: &str) -> Result<(), Error> {
        let mut conn = self.get_conn().await?;
        redis::cmd("DEL")
            .arg(file_key(id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(from_redis_err)
            .err_tip(|| "Failed to delete record")
    }

    async fn search_records(&self, filter: &SearchFilter) -> Result<SearchResults, Error> {
        let records = self.load_all_records().await?;
        Ok(filter_and_page(records, filter, (self.now_fn)()))
    }

    async fn stats(&self) -> Result<StoreStats, Error> {
        let records = self.load_all_records().await?;
        let now = (self.now_fn)();
        Ok(aggregate_stats(
            records.into_iter().filter(|r| !r.is_expired(now)),
        ))
    }

    async fn list_all_ids(&self) -> Result<Vec<String>, Error> {
        let keys = self.scan_record_keys().await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    async fn healthy(&self) -> bool {
        let Ok(mut conn) = self.get_conn().await else {
            return false;
        };
        matches!(
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .as_deref(),
            Ok("PONG")
        )
    }
}
