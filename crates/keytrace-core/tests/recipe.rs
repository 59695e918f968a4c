//! Integration tests for recipe execution.
//!
//! Runs the built-in tangled recipe against a wiremock server standing in
//! for the hosted proof file.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keytrace_core::{
    Bindings, ClaimRecord, ClaimStatus, ClaimVerifier, Clock, DailyKeyManager, FetchOptions,
    FetcherSet, HandleResolver, HttpFetcher, KeytraceError, KeytraceResult, ListedRecord,
    MemoryBlobStore, Recipe, RecipeBook, RecipeRunner, RecordSource, VerifyOptions,
    DEFAULT_SIGNED_FIELDS,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DID: &str = "did:plc:usertest123";
const SIGNER_DID: &str = "did:plc:trustedkeytrace";
const CLAIM_ID: &str = "3kclaim1";

fn runner() -> RecipeRunner {
    let fetchers = FetcherSet::new().with(Arc::new(HttpFetcher::new().unwrap()));
    RecipeRunner::new(fetchers, FetchOptions::default())
}

async fn mount_proof(mock_server: &MockServer, body: Value) {
    Mock::given(method("GET"))
        .and(path("/alice/keytrace/keytrace.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(mock_server)
        .await;
}

fn tangled_bindings(mock_server: &MockServer) -> Bindings {
    Bindings::for_claim(CLAIM_ID, DID).with(
        "tangledUrl",
        format!("{}/alice/keytrace/keytrace.json", mock_server.uri()),
    )
}

#[tokio::test]
async fn test_tangled_recipe_passes() {
    let mock_server = MockServer::start().await;
    mount_proof(&mock_server, json!({ "keytrace": CLAIM_ID, "did": DID })).await;

    let recipe = RecipeBook::builtin().get("tangled").unwrap();
    let run = runner().run(recipe, &tangled_bindings(&mock_server)).await;

    assert!(run.passed(), "steps: {:?}", run.steps);
    let names: Vec<&str> = run.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(
        names,
        vec!["http-get", "json-path:$.keytrace", "json-path:$.did"]
    );
    assert_eq!(run.document.unwrap()["did"], DID);
}

#[tokio::test]
async fn test_wrong_claim_id_fails_that_step() {
    let mock_server = MockServer::start().await;
    mount_proof(&mock_server, json!({ "keytrace": "3kother", "did": DID })).await;

    let recipe = RecipeBook::builtin().get("tangled").unwrap();
    let run = runner().run(recipe, &tangled_bindings(&mock_server)).await;

    assert!(!run.passed());
    assert_eq!(run.steps.len(), 2);
    assert!(run.steps[0].success);
    assert_eq!(run.steps[1].step, "json-path:$.keytrace");
    assert!(!run.steps[1].success);
    assert!(matches!(
        run.failure,
        Some(KeytraceError::AssertionMismatch { .. })
    ));
}

#[tokio::test]
async fn test_missing_proof_file_fails_fetch() {
    let mock_server = MockServer::start().await;

    let recipe = RecipeBook::builtin().get("tangled").unwrap();
    let run = runner().run(recipe, &tangled_bindings(&mock_server)).await;

    assert_eq!(run.steps.len(), 1);
    assert!(!run.steps[0].success);
    assert!(matches!(run.failure, Some(KeytraceError::NotFound { .. })));
}

#[tokio::test]
async fn test_unbound_placeholder_fails() {
    let recipe = RecipeBook::builtin().get("tangled").unwrap();
    let run = runner().run(recipe, &Bindings::for_claim(CLAIM_ID, DID)).await;

    assert!(!run.passed());
    assert!(run.steps[0]
        .detail
        .as_deref()
        .unwrap()
        .contains("unknown placeholder"));
}

struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        "2026-01-15T12:00:00Z".parse().unwrap()
    }
}

struct Repo {
    records: Vec<ListedRecord>,
    keys: HashMap<String, Value>,
}

#[async_trait]
impl HandleResolver for Repo {
    async fn resolve_handle(&self, handle: &str) -> KeytraceResult<String> {
        match handle {
            "keytrace.dev" => Ok(SIGNER_DID.to_string()),
            other => Err(KeytraceError::NotFound {
                what: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RecordSource for Repo {
    async fn resolve_pds(&self, _did: &str) -> KeytraceResult<String> {
        Ok("https://pds.test".to_string())
    }

    async fn list_claim_records(&self, _did: &str) -> KeytraceResult<Vec<ListedRecord>> {
        Ok(self.records.clone())
    }

    async fn get_record_by_uri(&self, uri: &str) -> KeytraceResult<Value> {
        self.keys.get(uri).cloned().ok_or_else(|| KeytraceError::NotFound {
            what: uri.to_string(),
        })
    }
}

#[tokio::test]
async fn test_recipe_claim_verifies_end_to_end() {
    let mock_server = MockServer::start().await;
    mount_proof(&mock_server, json!({ "keytrace": CLAIM_ID, "did": DID })).await;

    // Same steps as tangled, bound to the mock server's address.
    let recipe = Recipe::from_json_str(
        &json!({
            "type": "selfhosted",
            "version": 1,
            "params": [{
                "key": "proofUrl",
                "label": "Proof URL",
                "type": "url",
                "pattern": "^http://127\\.0\\.0\\.1:[0-9]+/([^/]+)/keytrace/keytrace\\.json$",
                "extractFrom": "^http://127\\.0\\.0\\.1:[0-9]+/([^/]+)/"
            }],
            "verification": { "steps": [
                { "action": "http-get", "url": "{proofUrl}" },
                { "action": "json-path", "selector": "$.keytrace", "expect": "equals:{claimId}" },
                { "action": "json-path", "selector": "$.did", "expect": "equals:{did}" }
            ]}
        })
        .to_string(),
    )
    .unwrap();

    let claim_uri = format!("{}/alice/keytrace/keytrace.json", mock_server.uri());
    let mut record: ClaimRecord = serde_json::from_value(json!({
        "type": "selfhosted",
        "claimUri": claim_uri,
        "identity": { "subject": "alice" },
        "createdAt": "2026-01-15T11:00:00.000Z"
    }))
    .unwrap();

    let manager = DailyKeyManager::new(SIGNER_DID, Arc::new(MemoryBlobStore::new()))
        .with_clock(Arc::new(FixedClock));
    let sig = manager.attest(DID, &record, DEFAULT_SIGNED_FIELDS).await.unwrap();
    record.sigs.push(sig);
    let key = manager.todays_key().await.unwrap();

    let repo = Arc::new(Repo {
        records: vec![ListedRecord {
            uri: format!("at://{DID}/dev.keytrace.claim/{CLAIM_ID}"),
            rkey: CLAIM_ID.to_string(),
            value: serde_json::to_value(&record).unwrap(),
        }],
        keys: HashMap::from([(
            key.src.to_string(),
            serde_json::to_value(&key.record).unwrap(),
        )]),
    });

    let verifier = ClaimVerifier::new(repo.clone(), repo)
        .with_recipes(RecipeBook::new().with(recipe).unwrap())
        .with_fetchers(FetcherSet::new().with(Arc::new(HttpFetcher::new().unwrap())));

    let result = verifier
        .claims_for_did(DID, &VerifyOptions::default())
        .await
        .unwrap();

    let claim = &result.claims[0];
    assert!(claim.verified, "steps: {:?}", claim.steps);
    assert_eq!(claim.status(), ClaimStatus::Verified);
    assert!(claim.step("json-path:$.did").unwrap().success);
    assert!(claim.step("verify_signature").unwrap().success);
}
