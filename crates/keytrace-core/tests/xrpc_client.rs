//! Integration tests for XrpcClient.
//!
//! Uses wiremock for the AppView, the PLC directory and the PDS; all three
//! are served by the same mock server.

use keytrace_core::{
    HandleResolver, KeytraceConfig, KeytraceError, ProfileLookup, RecordSource, XrpcClient,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DID: &str = "did:plc:usertest123";

fn create_test_client(mock_server: &MockServer) -> XrpcClient {
    let config = KeytraceConfig::default()
        .with_public_api_url(mock_server.uri())
        .with_plc_directory_url(mock_server.uri())
        .with_max_retries(0);
    XrpcClient::new(&config).expect("failed to create client")
}

async fn mount_did_document(mock_server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{DID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": DID,
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": mock_server.uri()
            }]
        })))
        .expect(expected_calls)
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_resolve_handle() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.identity.resolveHandle"))
        .and(query_param("handle", "alice.test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "did": DID })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    assert_eq!(client.resolve_handle("@alice.test").await.unwrap(), DID);
}

#[tokio::test]
async fn test_resolve_handle_passes_dids_through() {
    let mock_server = MockServer::start().await;
    let client = create_test_client(&mock_server);

    assert_eq!(client.resolve_handle(DID).await.unwrap(), DID);
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_unknown_handle_is_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.identity.resolveHandle"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "InvalidRequest",
            "message": "Unable to resolve handle"
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client.resolve_handle("nobody.test").await.unwrap_err();
    assert!(matches!(err, KeytraceError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_invalid_handle_is_rejected_locally() {
    let mock_server = MockServer::start().await;
    let client = create_test_client(&mock_server);

    let err = client.resolve_handle("not a handle").await.unwrap_err();
    assert!(matches!(err, KeytraceError::MalformedInput { .. }));
}

#[tokio::test]
async fn test_list_claim_records_follows_cursor() {
    let mock_server = MockServer::start().await;
    mount_did_document(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.listRecords"))
        .and(query_param("repo", DID))
        .and(query_param("collection", "dev.keytrace.claim"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                { "uri": format!("at://{DID}/dev.keytrace.claim/3ka"), "cid": "bafy1", "value": { "type": "dns" } }
            ],
            "cursor": "3ka"
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.listRecords"))
        .and(query_param("cursor", "3ka"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                { "uri": format!("at://{DID}/dev.keytrace.claim/3kb"), "cid": "bafy2", "value": { "type": "github" } }
            ]
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let records = client.list_claim_records(DID).await.unwrap();

    let rkeys: Vec<&str> = records.iter().map(|r| r.record_key()).collect();
    assert_eq!(rkeys, vec!["3ka", "3kb"]);
    assert_eq!(records[1].value["type"], "github");

    // The PDS endpoint is cached per DID.
    client.list_claim_records(DID).await.unwrap();
}

#[tokio::test]
async fn test_get_record_by_uri() {
    let mock_server = MockServer::start().await;
    mount_did_document(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .and(query_param("repo", DID))
        .and(query_param("collection", "dev.keytrace.key"))
        .and(query_param("rkey", "2026-01-15"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": format!("at://{DID}/dev.keytrace.key/2026-01-15"),
            "value": { "publicJwk": "{}" }
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let value = client
        .get_record_by_uri(&format!("at://{DID}/dev.keytrace.key/2026-01-15"))
        .await
        .unwrap();
    assert_eq!(value, json!({ "publicJwk": "{}" }));
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let mock_server = MockServer::start().await;
    mount_did_document(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "RecordNotFound",
            "message": "Could not locate record"
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client
        .get_record_by_uri(&format!("at://{DID}/dev.keytrace.key/2026-01-15"))
        .await
        .unwrap_err();
    assert!(matches!(err, KeytraceError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_server_error_without_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.identity.resolveHandle"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client.resolve_handle("alice.test").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test]
async fn test_get_profile() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/app.bsky.actor.getProfile"))
        .and(query_param("actor", DID))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "did": DID,
            "handle": "alice.test",
            "displayName": "Alice",
            "followersCount": 3
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let profile = client.get_profile(DID).await.unwrap();
    assert_eq!(profile.handle, "alice.test");
    assert_eq!(profile.display_name.as_deref(), Some("Alice"));
    assert!(profile.avatar.is_none());
}
