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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempstash_config::server::CleanupConfig;
use tempstash_error::{Code, Error, ResultExt};
use tempstash_store::blob_metadata_store::METADATA_PREFIX;
use tempstash_util::file_record::SearchFilter;
use tempstash_util::spawn;
use tempstash_util::store_trait::{BlobStore, MetadataStore};
use tempstash_util::task::JoinHandleDropGuard;
use tokio::sync::Notify;
use tracing::{event, Level};

use crate::catalog::CatalogService;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapSummary {
    pub deleted: u64,
    pub freed_bytes: u64,
    pub failed: u64,
    pub orphans_removed: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    Completed(ReapSummary),
    /// A run was already in flight, or shutdown began. Never queued.
    Skipped,
}

/// Background task that deletes expired records with their blobs and
/// reclaims record-less blobs. At most one run per process at a time;
/// shutdown is cooperative and observed between per-file deletions.
pub struct Reaper {
    catalog: Arc<CatalogService>,
    metadata_store: Arc<dyn MetadataStore>,
    blob_store: Arc<dyn BlobStore>,
    config: CleanupConfig,
    is_running: AtomicBool,
    is_shutting_down: AtomicBool,
    run_complete: Notify,
}

impl Reaper {
    pub fn new(
        catalog: Arc<CatalogService>,
        metadata_store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        config: CleanupConfig,
    ) -> Arc<Self> {
        Arc::new(Reaper {
            catalog,
            metadata_store,
            blob_store,
            config,
            is_running: AtomicBool::new(false),
            is_shutting_down: AtomicBool::new(false),
            run_complete: Notify::new(),
        })
    }

    /// Runs one cleanup batch. A second caller while a run is in flight is
    /// skipped, not queued.
    pub async fn run_once(&self) -> Result<ReapOutcome, Error> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Ok(ReapOutcome::Skipped);
        }
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(ReapOutcome::Skipped);
        }
        let result = self.run_batch().await;
        self.is_running.store(false, Ordering::Release);
        self.run_complete.notify_waiters();
        result.map(ReapOutcome::Completed)
    }

    async fn run_batch(&self) -> Result<ReapSummary, Error> {
        let started = Instant::now();
        let mut summary = ReapSummary::default();

        // A search failure aborts the whole run; the next tick retries
        // from scratch.
        let filter = SearchFilter {
            expired_only: true,
            limit: Some(self.config.batch_size),
            ..Default::default()
        };
        let expired = self
            .metadata_store
            .search_records(&filter)
            .await
            .err_tip(|| "Reaper failed to list expired records")?;

        for record in expired.records {
            // Shutdown interrupts between iterations, never mid-delete.
            if self.is_shutting_down.load(Ordering::Acquire) {
                break;
            }
            match self.catalog.delete(&record.id).await {
                Ok(_) => {
                    summary.deleted += 1;
                    summary.freed_bytes += record.size;
                }
                // Lost a race with an explicit delete; nothing to count.
                Err(err) if err.code == Code::NotFound => {}
                Err(err) => {
                    summary.failed += 1;
                    event!(
                        Level::WARN,
                        id = %record.id,
                        ?err,
                        "Failed to delete expired file"
                    );
                }
            }
        }

        if self.config.reap_orphans && !self.is_shutting_down.load(Ordering::Acquire) {
            self.reap_orphans(&mut summary).await;
        }

        summary.duration = started.elapsed();
        event!(
            Level::INFO,
            deleted = summary.deleted,
            freed_bytes = summary.freed_bytes,
            failed = summary.failed,
            orphans_removed = summary.orphans_removed,
            duration_ms = summary.duration.as_millis() as u64,
            "Cleanup run finished"
        );
        Ok(summary)
    }

    /// Deletes blobs that have no record, once they are older than the
    /// grace period. Ingest writes the blob before the record, so a young
    /// record-less blob may be an upload still in flight.
    async fn reap_orphans(&self, summary: &mut ReapSummary) {
        let keys = match self.blob_store.list("").await {
            Ok(keys) => keys,
            Err(err) => {
                event!(Level::WARN, ?err, "Orphan scan failed to list blobs");
                return;
            }
        };
        let grace = chrono::Duration::seconds(self.config.orphan_grace_seconds as i64);
        let now = Utc::now();
        for key in keys {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return;
            }
            if key.starts_with(METADATA_PREFIX) {
                continue;
            }
            match self.metadata_store.get_record(&key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    event!(Level::WARN, key, ?err, "Orphan scan failed to check record");
                    continue;
                }
            }
            let Ok(Some(head)) = self.blob_store.head(&key).await else {
                continue;
            };
            // Without a modification timestamp the age is unknowable, so
            // the blob is left alone.
            let Some(modified) = head.modified else {
                continue;
            };
            if now - modified < grace {
                continue;
            }
            match self.blob_store.delete(&key).await {
                Ok(()) => {
                    summary.orphans_removed += 1;
                    summary.freed_bytes += head.size;
                    event!(Level::INFO, key, "Reclaimed orphaned blob");
                }
                Err(err) => {
                    event!(Level::WARN, key, ?err, "Failed to delete orphaned blob");
                }
            }
        }
    }

    /// Starts the periodic loop. Returns `None` when the interval is zero
    /// or negative (disabled). Dropping the guard stops the loop.
    pub fn spawn_periodic(self: &Arc<Self>) -> Option<JoinHandleDropGuard<()>> {
        if self.config.interval_seconds <= 0 {
            return None;
        }
        let period = Duration::from_secs(self.config.interval_seconds as u64);
        let weak_self = Arc::downgrade(self);
        Some(spawn!("reaper_periodic", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so boot is quiet.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(reaper) = weak_self.upgrade() else {
                    return;
                };
                if reaper.is_shutting_down.load(Ordering::Acquire) {
                    return;
                }
                if let Err(err) = reaper.run_once().await {
                    // Swallowed on purpose; the next tick retries.
                    event!(Level::ERROR, ?err, "Cleanup run failed");
                }
            }
        }))
    }

    /// Flips the terminal shutdown state and waits (bounded) for an
    /// in-flight run to observe it and drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.is_shutting_down.store(true, Ordering::Release);
        // Register interest before the running check, otherwise a run that
        // finishes in between would leave us waiting for the full timeout.
        let notified = self.run_complete.notified();
        if self.is_running.load(Ordering::Acquire) {
            if tokio::time::timeout(timeout, notified).await.is_err() {
                event!(Level::WARN, "Timed out waiting for cleanup run to drain");
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }
}
