//! Integration tests for hierarchy listings
//!
//! Verifies organization, workspace, app, item count and file listings
//! against a wiremock-based Podio mock, including quota header capture
//! and pagination parameters.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use podsync_core::domain::{QuotaHeaders, RemoteId};
use podsync_core::ports::{ApiError, IRemoteApi, PageRequest};
use podsync_remote::{PodioClient, PodioRemote};

use crate::common;

#[tokio::test]
async fn test_list_organizations_with_quota_headers() {
    let (_server, remote) = common::setup_podio_mock().await;

    let reply = remote
        .list_organizations()
        .await
        .expect("organization listing failed");

    assert_eq!(reply.value.len(), 2);
    assert_eq!(reply.value[0].id, RemoteId::new(1));
    assert_eq!(reply.value[0].name, "Acme");
    assert_eq!(
        reply.quota,
        Some(QuotaHeaders {
            limit: Some(1000),
            remaining: Some(997),
        })
    );
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let (server, _) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/org/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "invalid_token",
            "error_description": "The token is invalid"
        })))
        .mount(&server)
        .await;
    let remote = PodioRemote::new(PodioClient::with_base_url("wrong-token", server.uri()));

    let err = remote.list_organizations().await.unwrap_err();
    assert_eq!(err, ApiError::Unauthorized("The token is invalid".to_string()));
}

#[tokio::test]
async fn test_list_workspaces_and_apps() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/space/org/1/",
        200,
        serde_json::json!([
            { "space_id": 10, "name": "Sales", "url": "https://podio.com/acme/sales" },
            { "space_id": 11, "name": "Ops" }
        ]),
    )
    .await;
    common::mount_json(
        &server,
        "/app/space/10/",
        200,
        serde_json::json!([
            { "app_id": 100, "config": { "name": "Deals" }, "link": "https://podio.com/a/100" },
            { "app_id": 101 }
        ]),
    )
    .await;

    let workspaces = remote.list_workspaces(RemoteId::new(1)).await.unwrap().value;
    assert_eq!(workspaces.len(), 2);
    assert_eq!(workspaces[1].id, RemoteId::new(11));
    assert_eq!(workspaces[1].name, "Ops");

    let apps = remote.list_apps(RemoteId::new(10)).await.unwrap().value;
    assert_eq!(apps[0].name, "Deals");
    assert_eq!(apps[1].id, RemoteId::new(101));
    assert_eq!(apps[1].name, "Unnamed app");
}

#[tokio::test]
async fn test_count_items() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/item/app/100/count",
        200,
        serde_json::json!({ "count": 1234 }),
    )
    .await;

    let reply = remote.count_items(RemoteId::new(100)).await.unwrap();
    assert_eq!(reply.value, 1234);
    assert_eq!(reply.quota, None);
}

#[tokio::test]
async fn test_list_files_sends_page_parameters() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/file/app/100/"))
        .and(query_param("limit", "100"))
        .and(query_param("offset", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "file_id": 5001,
                "name": "contract.pdf",
                "size": 2048,
                "mimetype": "application/pdf",
                "link": "https://files.podio.com/5001"
            },
            { "file_id": 5002, "perma_link": "https://podio.com/file/5002" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let page = PageRequest::first(100).next();
    let files = remote
        .list_files(RemoteId::new(100), page)
        .await
        .unwrap()
        .value;

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "contract.pdf");
    assert_eq!(files[0].size_bytes, 2048);
    assert_eq!(files[0].mime_type.as_deref(), Some("application/pdf"));
    assert_eq!(
        files[0].download_url.as_deref(),
        Some("https://files.podio.com/5001")
    );
    assert_eq!(files[1].name, "file_5002");
    assert_eq!(
        files[1].download_url.as_deref(),
        Some("https://podio.com/file/5002")
    );
}

#[tokio::test]
async fn test_list_files_wrapped_shape() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/file/app/100/",
        200,
        serde_json::json!({ "files": [ { "file_id": 1 } ] }),
    )
    .await;

    let files = remote
        .list_files(RemoteId::new(100), PageRequest::first(100))
        .await
        .unwrap()
        .value;
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/item/app/100/count",
        200,
        serde_json::json!({ "total": "many" }),
    )
    .await;

    let err = remote.count_items(RemoteId::new(100)).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_not_found_and_server_errors() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/space/org/9/",
        404,
        serde_json::json!({ "error": "not_found", "error_description": "Object not found" }),
    )
    .await;
    common::mount_json(&server, "/space/org/8/", 503, serde_json::json!({})).await;

    assert_eq!(
        remote.list_workspaces(RemoteId::new(9)).await.unwrap_err(),
        ApiError::NotFound("Object not found".to_string())
    );
    assert!(matches!(
        remote.list_workspaces(RemoteId::new(8)).await.unwrap_err(),
        ApiError::Server { status: 503, .. }
    ));
}
