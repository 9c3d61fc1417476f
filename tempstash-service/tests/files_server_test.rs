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

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempstash_config::server::{
    CleanupConfig, ServiceConfig, UploadLimits, UrlFetchConfig,
};
use tempstash_config::stores::{
    BlobEncodedMetadataStore as BlobEncodedMetadataStoreConfig, BlobStoreConfig,
    MemoryBlobStore as MemoryBlobStoreConfig, MetadataStoreConfig,
};
use tempstash_service::catalog::CatalogService;
use tempstash_service::files_server::{make_router, AppState};
use tempstash_service::ingest::IngestPipeline;
use tempstash_service::reaper::Reaper;
use tempstash_service::url_fetcher::UrlFetcher;
use tempstash_store::blob_metadata_store::BlobEncodedMetadataStore;
use tempstash_store::memory_store::MemoryStore;
use tower::util::ServiceExt;

/// sha256("hello").
const HELLO_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn make_config() -> ServiceConfig {
    ServiceConfig {
        listen_address: "127.0.0.1:0".to_string(),
        base_path: None,
        download_base_url: Some("https://files.example.com".to_string()),
        blob_store: BlobStoreConfig::memory(MemoryBlobStoreConfig::default()),
        metadata_store: MetadataStoreConfig::blob_encoded(
            BlobEncodedMetadataStoreConfig {
                assume_sorted_listing: true,
            },
        ),
        limits: UploadLimits {
            max_file_size: 1024 * 1024,
            allowed_mime_types: Vec::new(),
            max_ttl_seconds: 86_400,
            default_ttl_seconds: 1440 * 60,
        },
        cleanup: CleanupConfig {
            interval_seconds: 0,
            batch_size: 1000,
            orphan_grace_seconds: 3600,
            reap_orphans: false,
        },
        url_fetch: UrlFetchConfig::default(),
    }
}

fn make_app() -> Router {
    let config = Arc::new(make_config());
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
    let ingest = Arc::new(IngestPipeline::new(
        blob_store.clone(),
        metadata_store.clone(),
        config.limits.clone(),
    ));
    let reaper = Reaper::new(
        catalog.clone(),
        metadata_store,
        blob_store,
        config.cleanup.clone(),
    );
    let url_fetcher = Arc::new(
        UrlFetcher::new(&config.url_fetch, config.limits.max_file_size).unwrap(),
    );
    make_router(AppState {
        catalog,
        ingest,
        reaper,
        url_fetcher,
        config,
    })
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn upload_hello(app: &Router) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/files")
        .header("x-file-name", "greet.txt")
        .header(header::CONTENT_TYPE, "text/plain")
        .header("x-ttl-mins", "10")
        .body(Body::from("hello"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await
}

#[cfg(test)]
mod files_server_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn raw_body_upload_returns_upload_response() {
        let app = make_app();
        let body = upload_hello(&app).await;

        assert_eq!(body["file"]["size"], 5);
        assert_eq!(body["file"]["hash"], HELLO_HASH);
        assert_eq!(body["file"]["mimeType"], "text/plain");
        assert_eq!(body["file"]["originalName"], "greet.txt");
        assert_eq!(body["file"]["ttlMins"], 10);
        assert_eq!(body["file"]["isExpired"], false);
        let id = body["file"]["id"].as_str().unwrap();
        assert_eq!(
            body["downloadUrl"],
            format!("https://files.example.com/download/{id}")
        );
        assert_eq!(body["downloadPath"], format!("/download/{id}"));
        assert_eq!(body["infoUrl"], format!("/api/v1/files/{id}"));
    }

    #[tokio::test]
    async fn multipart_upload_honors_preceding_text_fields() {
        let app = make_app();
        let boundary = "xBOUNDARYx";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"ttlMins\"\r\n\r\n\
             10\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"greet.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["file"]["size"], 5);
        assert_eq!(body["file"]["hash"], HELLO_HASH);
        assert_eq!(body["file"]["ttlMins"], 10);
        assert_eq!(body["file"]["originalName"], "greet.txt");
    }

    #[tokio::test]
    async fn info_download_and_delete_flow() {
        let app = make_app();
        let uploaded = upload_hello(&app).await;
        let id = uploaded["file"]["id"].as_str().unwrap().to_string();

        // Info.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info = response_json(response).await;
        assert_eq!(info["file"]["id"], id.as_str());

        // Download with the contractual headers.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/download/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        // Exists.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/files/{id}/exists"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let exists = response_json(response).await;
        assert_eq!(exists["exists"], true);
        assert_eq!(exists["isExpired"], false);

        // Delete, then a second delete is NotFound.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let deleted = response_json(response).await;
        assert_eq!(deleted["fileId"], id.as_str());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_file_yields_the_error_envelope() {
        let app = make_app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/files/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response_json(response).await;
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["path"], "/api/v1/files/does-not-exist");
        assert_eq!(body["method"], "GET");
        assert_eq!(body["error"], "Not Found");
        assert!(
            body["message"].as_str().unwrap().contains("does-not-exist"),
            "Message should name the id, got: {body}"
        );
    }

    #[tokio::test]
    async fn search_filters_and_paginates() {
        let app = make_app();
        let _ = upload_hello(&app).await;

        let request = Request::builder()
            .uri("/api/v1/files?mimeType=text/plain&minSize=1&limit=10&offset=0")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["files"].as_array().unwrap().len(), 1);
        assert_eq!(body["pagination"]["limit"], 10);
        assert_eq!(body["pagination"]["offset"], 0);

        // A filter that matches nothing.
        let request = Request::builder()
            .uri("/api/v1/files?mimeType=image/png")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let body = response_json(response).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn stats_and_health_and_maintenance() {
        let app = make_app();
        let _ = upload_hello(&app).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/files/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["stats"]["totalFiles"], 1);
        assert_eq!(body["stats"]["totalSize"], 5);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/maintenance/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn oversized_upload_maps_to_413() {
        let app = make_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/files")
            .header("x-file-name", "big.bin")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(vec![0u8; 2 * 1024 * 1024]))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = response_json(response).await;
        assert_eq!(body["statusCode"], 413);
    }
}
