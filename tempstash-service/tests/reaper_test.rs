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
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempstash_config::server::CleanupConfig;
use tempstash_config::stores::{
    BlobEncodedMetadataStore as BlobEncodedMetadataStoreConfig,
    MemoryBlobStore as MemoryBlobStoreConfig,
};
use tempstash_error::Error;
use tempstash_service::catalog::CatalogService;
use tempstash_service::reaper::{ReapOutcome, Reaper};
use tempstash_store::blob_metadata_store::BlobEncodedMetadataStore;
use tempstash_store::memory_store::MemoryStore;
use tempstash_util::file_record::{
    FileRecord, SearchFilter, SearchResults, StoreStats,
};
use tempstash_util::store_trait::{BlobStore, MetadataStore};
use tokio::sync::{mpsc, Notify};

fn make_record(id: &str, uploaded_at: DateTime<Utc>, ttl_seconds: u64, size: u64) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        original_name: format!("{id}.bin"),
        stored_name: format!("{id}_0a0a0a0a.bin"),
        mime_type: "application/octet-stream".to_string(),
        size,
        hash: "ef".repeat(32),
        uploaded_at,
        ttl_seconds,
        expires_at: uploaded_at + Duration::seconds(ttl_seconds as i64),
        file_path: id.to_string(),
        metadata: BTreeMap::new(),
    }
}

fn cleanup_config() -> CleanupConfig {
    CleanupConfig {
        interval_seconds: 0,
        batch_size: 1000,
        orphan_grace_seconds: 3600,
        reap_orphans: true,
    }
}

struct Fixture {
    blob_store: Arc<MemoryStore>,
    metadata_store: Arc<BlobEncodedMetadataStore>,
    reaper: Arc<Reaper>,
}

fn make_fixture(config: CleanupConfig) -> Fixture {
    let blob_store = Arc::new(MemoryStore::new(&MemoryBlobStoreConfig::default()));
    let metadata_store = Arc::new(BlobEncodedMetadataStore::new(
        &BlobEncodedMetadataStoreConfig {
            assume_sorted_listing: true,
        },
        blob_store.clone(),
    ));
    let catalog = Arc::new(CatalogService::new(
        blob_store.clone(),
        metadata_store.clone(),
    ));
    let reaper = Reaper::new(catalog, metadata_store.clone(), blob_store.clone(), config);
    Fixture {
        blob_store,
        metadata_store,
        reaper,
    }
}

async fn seed_file(
    fixture: &Fixture,
    record: &FileRecord,
    data: &'static str,
) -> Result<(), Error> {
    fixture
        .blob_store
        .put_oneshot(&record.id, data.into(), &record.mime_type, &BTreeMap::new())
        .await?;
    fixture.metadata_store.save_record(record).await
}

#[cfg(test)]
mod reaper_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn expired_files_are_reaped_with_their_blobs() -> Result<(), Error> {
        let fixture = make_fixture(cleanup_config());
        let now = Utc::now();
        let expired = make_record("expired", now - Duration::hours(2), 3600, 5);
        let live = make_record("live", now, 3600, 7);
        seed_file(&fixture, &expired, "hello").await?;
        seed_file(&fixture, &live, "staying").await?;

        let outcome = fixture.reaper.run_once().await?;
        let ReapOutcome::Completed(summary) = outcome else {
            panic!("Expected a completed run, got: {outcome:?}");
        };
        assert_eq!(summary.deleted, 1, "Exactly the expired file is deleted");
        assert_eq!(summary.freed_bytes, 5);
        assert_eq!(summary.failed, 0);

        assert_eq!(fixture.metadata_store.get_record("expired").await?, None);
        assert_eq!(fixture.blob_store.head("expired").await?, None);
        assert!(
            fixture.metadata_store.get_record("live").await?.is_some(),
            "Live file must survive the reap"
        );
        assert!(fixture.blob_store.head("live").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn aged_orphan_blobs_are_reclaimed() -> Result<(), Error> {
        let fixture = make_fixture(cleanup_config());
        // A blob with no record, modified two hours ago: a dead ingest.
        fixture
            .blob_store
            .put_oneshot("orphan", "dead".into(), "text/plain", &BTreeMap::new())
            .await?;
        fixture
            .blob_store
            .set_modified("orphan", Utc::now() - Duration::hours(2))?;
        // A record-less blob modified just now: an upload in flight.
        fixture
            .blob_store
            .put_oneshot("fresh", "inflight".into(), "text/plain", &BTreeMap::new())
            .await?;

        let outcome = fixture.reaper.run_once().await?;
        let ReapOutcome::Completed(summary) = outcome else {
            panic!("Expected a completed run, got: {outcome:?}");
        };
        assert_eq!(summary.orphans_removed, 1);
        assert_eq!(fixture.blob_store.head("orphan").await?, None);
        assert!(
            fixture.blob_store.head("fresh").await?.is_some(),
            "Blobs inside the grace period must not be reclaimed"
        );
        Ok(())
    }

    #[tokio::test]
    async fn orphan_scan_can_be_disabled() -> Result<(), Error> {
        let mut config = cleanup_config();
        config.reap_orphans = false;
        let fixture = make_fixture(config);
        fixture
            .blob_store
            .put_oneshot("orphan", "dead".into(), "text/plain", &BTreeMap::new())
            .await?;
        fixture
            .blob_store
            .set_modified("orphan", Utc::now() - Duration::hours(2))?;

        let outcome = fixture.reaper.run_once().await?;
        let ReapOutcome::Completed(summary) = outcome else {
            panic!("Expected a completed run, got: {outcome:?}");
        };
        assert_eq!(summary.orphans_removed, 0);
        assert!(fixture.blob_store.head("orphan").await?.is_some());
        Ok(())
    }

    /// Wraps a metadata store and blocks `search_records` until released,
    /// so tests can hold a reaper run in flight deterministically.
    struct GatedMetadataStore {
        inner: Arc<dyn MetadataStore>,
        entered_tx: mpsc::UnboundedSender<()>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MetadataStore for GatedMetadataStore {
        async fn save_record(&self, record: &FileRecord) -> Result<(), Error> {
            self.inner.save_record(record).await
        }
        async fn get_record(&self, id: &str) -> Result<Option<FileRecord>, Error> {
            self.inner.get_record(id).await
        }
        async fn delete_record(&self, id: &str) -> Result<(), Error> {
            self.inner.delete_record(id).await
        }
        async fn search_records(&self, filter: &SearchFilter) -> Result<SearchResults, Error> {
            let _ = self.entered_tx.send(());
            self.release.notified().await;
            self.inner.search_records(filter).await
        }
        async fn stats(&self) -> Result<StoreStats, Error> {
            self.inner.stats().await
        }
        async fn list_all_ids(&self) -> Result<Vec<String>, Error> {
            self.inner.list_all_ids().await
        }
        async fn healthy(&self) -> bool {
            self.inner.healthy().await
        }
    }

    fn make_gated_fixture() -> (Arc<Reaper>, mpsc::UnboundedReceiver<()>, Arc<Notify>) {
        let blob_store = Arc::new(MemoryStore::new(&MemoryBlobStoreConfig::default()));
        let inner = Arc::new(BlobEncodedMetadataStore::new(
            &BlobEncodedMetadataStoreConfig {
                assume_sorted_listing: true,
            },
            blob_store.clone(),
        ));
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let gated = Arc::new(GatedMetadataStore {
            inner,
            entered_tx,
            release: release.clone(),
        });
        let catalog = Arc::new(CatalogService::new(blob_store.clone(), gated.clone()));
        let mut config = cleanup_config();
        config.reap_orphans = false;
        let reaper = Reaper::new(catalog, gated, blob_store, config);
        (reaper, entered_rx, release)
    }

    #[tokio::test]
    async fn second_run_is_skipped_while_one_is_in_flight() -> Result<(), Error> {
        let (reaper, mut entered_rx, release) = make_gated_fixture();

        let running = {
            let reaper = reaper.clone();
            tokio::spawn(async move { reaper.run_once().await })
        };
        entered_rx.recv().await.expect("Run never started");

        // Single-flight: the overlapping call is skipped, not queued.
        assert_eq!(reaper.run_once().await?, ReapOutcome::Skipped);

        release.notify_one();
        let outcome = running.await.unwrap()?;
        assert!(
            matches!(outcome, ReapOutcome::Completed(_)),
            "First run must complete normally, got: {outcome:?}"
        );

        // With the first run drained, the next one goes through again.
        release.notify_one();
        assert!(matches!(
            reaper.run_once().await?,
            ReapOutcome::Completed(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_inflight_run() -> Result<(), Error> {
        let (reaper, mut entered_rx, release) = make_gated_fixture();

        let running = {
            let reaper = reaper.clone();
            tokio::spawn(async move { reaper.run_once().await })
        };
        entered_rx.recv().await.expect("Run never started");

        let shutdown = {
            let reaper = reaper.clone();
            tokio::spawn(async move {
                reaper.shutdown(StdDuration::from_secs(5)).await;
            })
        };
        // The shutdown must be blocked on the in-flight run.
        release.notify_one();
        shutdown.await.unwrap();
        assert!(reaper.is_shutting_down());
        assert!(matches!(running.await.unwrap()?, ReapOutcome::Completed(_)));

        // After shutdown every new run is rejected immediately.
        assert_eq!(reaper.run_once().await?, ReapOutcome::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn runs_after_shutdown_are_skipped() -> Result<(), Error> {
        let fixture = make_fixture(cleanup_config());
        fixture.reaper.shutdown(StdDuration::from_millis(10)).await;
        assert_eq!(fixture.reaper.run_once().await?, ReapOutcome::Skipped);
        Ok(())
    }
}
