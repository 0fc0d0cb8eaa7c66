//! Shared test helpers for Podio integration tests
//!
//! Each helper mounts mock endpoints on a wiremock server; `setup_podio_mock`
//! returns a PodioRemote pointing at it.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podsync_remote::{PodioClient, PodioRemote};

pub const TOKEN: &str = "test-access-token";

/// Starts a mock server with `GET /org/` mounted and returns a remote for it
///
/// The organization listing only answers requests carrying the expected
/// `OAuth2` authorization header.
pub async fn setup_podio_mock() -> (MockServer, PodioRemote) {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/org/"))
        .and(header("authorization", format!("OAuth2 {TOKEN}").as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Rate-Limit-Limit", "1000")
                .insert_header("X-Rate-Limit-Remaining", "997")
                .set_body_json(serde_json::json!([
                    { "org_id": 1, "name": "Acme", "url": "https://podio.com/acme" },
                    { "org_id": 2, "name": "Beta", "url": "https://podio.com/beta" }
                ])),
        )
        .mount(&server)
        .await;

    let remote = PodioRemote::new(PodioClient::with_base_url(TOKEN, server.uri()));
    (server, remote)
}

/// Mounts a GET endpoint answering with `status` and a JSON body
pub async fn mount_json(
    server: &MockServer,
    endpoint: &str,
    status: u16,
    body: serde_json::Value,
) {
    Mock::given(method("GET"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}
