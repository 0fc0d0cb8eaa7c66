//! Integration tests for the export workflow
//!
//! Covers every submission shape Podio returns, batch polling and blob
//! download from both absolute links and API paths.

use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use podsync_core::domain::{BatchId, ExportStatus, RemoteId};
use podsync_core::ports::{ApiError, ExportSubmission, IRemoteApi};

use crate::common;

async fn mount_submit(server: &wiremock::MockServer, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/item/app/100/export/xlsx/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_submit_returns_batch_id() {
    let (server, remote) = common::setup_podio_mock().await;
    mount_submit(&server, serde_json::json!({ "batch_id": 900 })).await;

    let reply = remote.submit_export(RemoteId::new(100)).await.unwrap();
    assert_eq!(reply.value, ExportSubmission::Batch(BatchId::new(900)));
}

#[tokio::test]
async fn test_submit_nested_batch_and_bare_id() {
    let (server, remote) = common::setup_podio_mock().await;
    mount_submit(&server, serde_json::json!({ "batch": { "batch_id": 901 } })).await;
    assert_eq!(
        remote.submit_export(RemoteId::new(100)).await.unwrap().value,
        ExportSubmission::Batch(BatchId::new(901))
    );

    let (server, remote) = common::setup_podio_mock().await;
    mount_submit(&server, serde_json::json!({ "id": 902 })).await;
    assert_eq!(
        remote.submit_export(RemoteId::new(100)).await.unwrap().value,
        ExportSubmission::Batch(BatchId::new(902))
    );
}

#[tokio::test]
async fn test_submit_with_immediate_file() {
    let (server, remote) = common::setup_podio_mock().await;
    mount_submit(
        &server,
        serde_json::json!({
            "file": {
                "file_id": 77,
                "name": "Deals.xlsx",
                "size": 4096,
                "link": "https://files.podio.com/77"
            }
        }),
    )
    .await;

    let ExportSubmission::Immediate(file) =
        remote.submit_export(RemoteId::new(100)).await.unwrap().value
    else {
        panic!("expected an immediate file");
    };
    assert_eq!(file.file_id, RemoteId::new(77));
    assert_eq!(file.download_url, "https://files.podio.com/77");
    assert_eq!(file.size_bytes, Some(4096));
}

#[tokio::test]
async fn test_submit_without_batch_or_file_is_invalid() {
    let (server, remote) = common::setup_podio_mock().await;
    mount_submit(&server, serde_json::json!({ "status": "ok" })).await;

    let err = remote.submit_export(RemoteId::new(100)).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_poll_processing_then_completed() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/batch/900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "processing",
            "completed": 10,
            "failed": 0,
            "skipped": 0
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/batch/900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "completed",
            "file": {
                "file_id": 77,
                "perma_link": "https://podio.com/file/77",
                "size": 4096
            }
        })))
        .mount(&server)
        .await;

    let first = remote.poll_export(BatchId::new(900)).await.unwrap().value;
    assert_eq!(first.status, ExportStatus::Processing);
    assert!(first.file.is_none());

    let second = remote.poll_export(BatchId::new(900)).await.unwrap().value;
    assert_eq!(second.status, ExportStatus::Completed);
    let file = second.file.unwrap();
    assert_eq!(file.download_url, "https://podio.com/file/77");
    assert_eq!(file.name, "export_900.xlsx");
}

#[tokio::test]
async fn test_poll_failed_and_unknown_status() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/batch/901",
        200,
        serde_json::json!({ "status": "failed", "completed": 3, "failed": 7 }),
    )
    .await;
    common::mount_json(
        &server,
        "/batch/902",
        200,
        serde_json::json!({ "status": "queued" }),
    )
    .await;

    let failed = remote.poll_export(BatchId::new(901)).await.unwrap().value;
    assert_eq!(failed.status, ExportStatus::Failed);
    assert!(failed.failure.unwrap().contains("7 failed"));

    let unknown = remote.poll_export(BatchId::new(902)).await.unwrap().value;
    assert_eq!(unknown.status, ExportStatus::Processing);
}

#[tokio::test]
async fn test_download_blob_from_absolute_link() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/files/77"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"PK\x03\x04xlsx".to_vec())
                .insert_header("X-Rate-Limit-Remaining", "249"),
        )
        .mount(&server)
        .await;

    let link = format!("{}/files/77", server.uri());
    let reply = remote.download_blob(&link).await.unwrap();
    assert_eq!(reply.value, b"PK\x03\x04xlsx");
    assert_eq!(reply.quota.unwrap().remaining, Some(249));
}

#[tokio::test]
async fn test_download_blob_by_api_path() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/file/77/download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bytes".to_vec()))
        .mount(&server)
        .await;

    let reply = remote.download_blob("/file/77/download").await.unwrap();
    assert_eq!(reply.value, b"bytes");
}
