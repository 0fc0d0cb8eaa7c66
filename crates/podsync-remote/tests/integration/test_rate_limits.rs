//! Integration tests for rate-limit classification
//!
//! Podio signals exhausted quotas in several ways; every one of them must
//! surface as `ApiError::RateLimited` with the best available wait, while
//! an over-large page size stays an invalid request.

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use podsync_core::domain::{QuotaHeaders, RemoteId};
use podsync_core::ports::{ApiError, IRemoteApi, PageRequest};

use crate::common;

#[tokio::test]
async fn test_429_with_retry_after_header() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/space/org/1/"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "42")
                .insert_header("X-Rate-Limit-Limit", "1000")
                .insert_header("X-Rate-Limit-Remaining", "0"),
        )
        .mount(&server)
        .await;

    let err = remote.list_workspaces(RemoteId::new(1)).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(42)),
            quota: Some(QuotaHeaders {
                limit: Some(1000),
                remaining: Some(0),
            }),
        }
    );
}

#[tokio::test]
async fn test_420_with_wait_in_description() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/app/space/10/",
        420,
        serde_json::json!({
            "error": "rate_limit",
            "error_description": "You have hit the rate limit. Please wait 300 seconds before trying again"
        }),
    )
    .await;

    let err = remote.list_apps(RemoteId::new(10)).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(300)),
            quota: None,
        }
    );
}

#[tokio::test]
async fn test_429_without_any_wait_leaves_default_to_engine() {
    let (server, remote) = common::setup_podio_mock().await;
    Mock::given(method("GET"))
        .and(path("/item/app/100/count"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = remote.count_items(RemoteId::new(100)).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::RateLimited {
            retry_after: None,
            quota: None,
        }
    );
}

#[tokio::test]
async fn test_400_rate_limit_code() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/item/app/100/count",
        400,
        serde_json::json!({
            "error": "rate_limit",
            "error_description": "Rate limit exceeded, try again in 2 minutes"
        }),
    )
    .await;

    let err = remote.count_items(RemoteId::new(100)).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
            quota: None,
        }
    );
}

#[tokio::test]
async fn test_400_limit_too_large_is_not_a_rate_limit() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/file/app/100/",
        400,
        serde_json::json!({
            "error": "invalid_value",
            "error_description": "limit must not be larger than 100"
        }),
    )
    .await;

    let err = remote
        .list_files(RemoteId::new(100), PageRequest::first(500))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApiError::InvalidRequest {
            code: Some("invalid_value".to_string()),
            message: "limit must not be larger than 100".to_string(),
        }
    );
}

#[tokio::test]
async fn test_other_400_is_invalid_request() {
    let (server, remote) = common::setup_podio_mock().await;
    common::mount_json(
        &server,
        "/app/space/10/",
        400,
        serde_json::json!({ "error": "invalid_value", "error_description": "Bad space" }),
    )
    .await;

    let err = remote.list_apps(RemoteId::new(10)).await.unwrap_err();
    assert!(matches!(
        err,
        ApiError::InvalidRequest { code: Some(code), .. } if code == "invalid_value"
    ));
}
