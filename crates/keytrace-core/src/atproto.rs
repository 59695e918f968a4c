//! Record store collaborators and their XRPC implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::KeytraceConfig;
use crate::did::{is_valid_did, is_valid_handle, validate_did, AtUri};
use crate::error::{KeytraceError, KeytraceResult};
use crate::keys::KeyPublisher;
use crate::types::{DisplayProfile, KeyRecord, ListedRecord, CLAIM_COLLECTION, KEY_COLLECTION};

/// Records requested per listRecords page.
const PAGE_SIZE: u32 = 100;

/// Upper bound on listRecords pages followed.
const MAX_PAGES: usize = 10;

/// Service id suffix of a PDS entry in a DID document.
const PDS_SERVICE_SUFFIX: &str = "#atproto_pds";

const USER_AGENT_VALUE: &str = concat!("keytrace/", env!("CARGO_PKG_VERSION"));

/// Resolves handles to DIDs.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> KeytraceResult<String>;
}

/// Reads repositories.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Service endpoint hosting the repository of `did`.
    async fn resolve_pds(&self, did: &str) -> KeytraceResult<String>;

    /// Every claim record in the repository of `did`.
    async fn list_claim_records(&self, did: &str) -> KeytraceResult<Vec<ListedRecord>>;

    /// The value of the record at an AT URI.
    async fn get_record_by_uri(&self, uri: &str) -> KeytraceResult<Value>;
}

/// Optional display-profile enrichment.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn get_profile(&self, actor: &str) -> KeytraceResult<DisplayProfile>;
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<ListedRecord>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRecordResponse {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    service_endpoint: Value,
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    did: String,
}

/// XRPC client for the public network.
#[derive(Debug, Clone)]
pub struct XrpcClient {
    client: reqwest::Client,
    public_api_url: String,
    plc_directory_url: String,
    max_retries: u32,
    /// DID -> PDS endpoint
    pds_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl XrpcClient {
    pub fn new(config: &KeytraceConfig) -> KeytraceResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(default_headers)
            .build()
            .map_err(|e| KeytraceError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            public_api_url: config.public_api_url.trim_end_matches('/').to_string(),
            plc_directory_url: config.plc_directory_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            pds_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn from_env() -> KeytraceResult<Self> {
        Self::new(&KeytraceConfig::from_env())
    }

    pub fn public_api_url(&self) -> &str {
        &self.public_api_url
    }

    /// GET an XRPC method (or plain document) and decode the JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> KeytraceResult<T> {
        let response = self
            .request(|| self.client.get(url).query(query), url)
            .await?;
        response
            .json()
            .await
            .map_err(|e| KeytraceError::InvalidResponse {
                message: format!("failed to parse response from {url}: {e}"),
            })
    }

    /// Send with retry and exponential backoff.
    async fn request(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        url: &str,
    ) -> KeytraceResult<reqwest::Response> {
        let mut retries = 0;

        loop {
            match self.request_once(build(), url).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let backoff = retry_backoff(retries, &mut rand::thread_rng());

                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> KeytraceResult<reqwest::Response> {
        debug!(url = %url, "xrpc request");
        let response = request.send().await?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => Ok(response),

            400 | 404 => {
                let body: XrpcErrorBody = response.json().await.unwrap_or(XrpcErrorBody {
                    error: None,
                    message: None,
                });
                if status.as_u16() == 404 || is_not_found(&body) {
                    Err(KeytraceError::NotFound {
                        what: body
                            .message
                            .or(body.error)
                            .unwrap_or_else(|| url.to_string()),
                    })
                } else {
                    Err(KeytraceError::InvalidResponse {
                        message: format!(
                            "HTTP 400 from {url}: {}",
                            body.message.or(body.error).unwrap_or_default()
                        ),
                    })
                }
            }

            429 | 500..=599 => Err(KeytraceError::FetchTransport {
                message: format!("HTTP {} from {}", status.as_u16(), url),
            }),

            _ => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(KeytraceError::InvalidResponse {
                    message: format!("HTTP {} from {}: {}", status.as_u16(), url, message),
                })
            }
        }
    }

    async fn fetch_did_document(&self, did: &str) -> KeytraceResult<DidDocument> {
        if did.starts_with("did:plc:") {
            let url = format!("{}/{}", self.plc_directory_url, did);
            return self.get_json(&url, &[]).await;
        }
        if let Some(host) = did.strip_prefix("did:web:") {
            let host = host.replace("%3A", ":").replace("%3a", ":");
            let url = format!("https://{host}/.well-known/did.json");
            return self.get_json(&url, &[]).await;
        }
        Err(KeytraceError::malformed(format!("unsupported DID method: {did}")))
    }
}

/// Full-jitter exponential backoff: uniform in `[10ms, 2^retry s]`, capped at 30s.
fn retry_backoff(retry: u32, rng: &mut impl rand::Rng) -> Duration {
    let base = Duration::from_secs(1u64 << retry.min(5)).min(Duration::from_secs(30));
    let jittered_ms = rng.gen_range(0..=base.as_millis() as u64);
    Duration::from_millis(jittered_ms.max(10))
}

/// A PDS endpoint must be an absolute http(s) URL.
fn parse_service_endpoint(raw: &str) -> KeytraceResult<String> {
    let url = url::Url::parse(raw)
        .map_err(|e| KeytraceError::InvalidResponse {
            message: format!("invalid PDS endpoint {raw:?}: {e}"),
        })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(KeytraceError::InvalidResponse {
            message: format!("unsupported PDS endpoint {raw:?}"),
        });
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn is_not_found(body: &XrpcErrorBody) -> bool {
    matches!(
        body.error.as_deref(),
        Some("RecordNotFound") | Some("RepoNotFound") | Some("HandleNotFound")
    ) || body
        .message
        .as_deref()
        .is_some_and(|m| m.contains("Unable to resolve handle"))
}

#[async_trait]
impl HandleResolver for XrpcClient {
    async fn resolve_handle(&self, handle: &str) -> KeytraceResult<String> {
        let handle = handle.trim().trim_start_matches('@');
        if is_valid_did(handle) {
            return Ok(handle.to_string());
        }
        if !is_valid_handle(handle) {
            return Err(KeytraceError::malformed(format!("invalid handle: {handle:?}")));
        }

        let url = format!("{}/xrpc/com.atproto.identity.resolveHandle", self.public_api_url);
        let response: ResolveHandleResponse = self.get_json(&url, &[("handle", handle)]).await?;
        validate_did(&response.did)?;
        debug!(handle, did = %response.did, "resolved handle");
        Ok(response.did)
    }
}

#[async_trait]
impl RecordSource for XrpcClient {
    async fn resolve_pds(&self, did: &str) -> KeytraceResult<String> {
        if let Some(pds) = self.pds_cache.read().await.get(did) {
            return Ok(pds.clone());
        }

        let doc = self.fetch_did_document(did).await?;
        let pds = doc
            .service
            .iter()
            .find(|s| s.id.ends_with(PDS_SERVICE_SUFFIX))
            .and_then(|s| s.service_endpoint.as_str())
            .ok_or_else(|| KeytraceError::NotFound {
                what: format!("PDS service for {did}"),
            })
            .and_then(parse_service_endpoint)?;

        self.pds_cache
            .write()
            .await
            .insert(did.to_string(), pds.clone());
        Ok(pds)
    }

    async fn list_claim_records(&self, did: &str) -> KeytraceResult<Vec<ListedRecord>> {
        validate_did(did)?;
        let pds = self.resolve_pds(did).await?;
        let url = format!("{pds}/xrpc/com.atproto.repo.listRecords");
        let limit = PAGE_SIZE.to_string();

        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("repo", did),
                ("collection", CLAIM_COLLECTION),
                ("limit", limit.as_str()),
            ];
            if let Some(cursor) = cursor.as_deref() {
                query.push(("cursor", cursor));
            }

            let page: ListRecordsResponse = self.get_json(&url, &query).await?;
            let empty = page.records.is_empty();
            records.extend(page.records);

            match page.cursor {
                Some(next) if !empty => cursor = Some(next),
                _ => break,
            }
        }

        debug!(did, count = records.len(), "listed claim records");
        Ok(records)
    }

    async fn get_record_by_uri(&self, uri: &str) -> KeytraceResult<Value> {
        let at: AtUri = uri.parse()?;
        let repo = self.resolve_handle(&at.authority).await?;
        let pds = self.resolve_pds(&repo).await?;

        let url = format!("{pds}/xrpc/com.atproto.repo.getRecord");
        let response: GetRecordResponse = self
            .get_json(
                &url,
                &[
                    ("repo", repo.as_str()),
                    ("collection", at.collection.as_str()),
                    ("rkey", at.rkey.as_str()),
                ],
            )
            .await
            .map_err(|e| match e {
                KeytraceError::NotFound { .. } => KeytraceError::NotFound {
                    what: format!("record {uri}"),
                },
                other => other,
            })?;
        Ok(response.value)
    }
}

#[async_trait]
impl ProfileLookup for XrpcClient {
    async fn get_profile(&self, actor: &str) -> KeytraceResult<DisplayProfile> {
        let url = format!("{}/xrpc/app.bsky.actor.getProfile", self.public_api_url);
        self.get_json(&url, &[("actor", actor)]).await
    }
}

/// Publishes key records with an app password session.
#[derive(Clone)]
pub struct XrpcKeyPublisher {
    client: XrpcClient,
    service_url: String,
    identifier: String,
    password: String,
}

impl std::fmt::Debug for XrpcKeyPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XrpcKeyPublisher")
            .field("service_url", &self.service_url)
            .field("identifier", &self.identifier)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl XrpcKeyPublisher {
    pub fn new(
        client: XrpcClient,
        service_url: impl Into<String>,
        identifier: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            service_url: service_url.into().trim_end_matches('/').to_string(),
            identifier: identifier.into(),
            password: password.into(),
        }
    }

    async fn create_session(&self) -> KeytraceResult<SessionResponse> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.service_url);
        let body = json!({ "identifier": self.identifier, "password": self.password });
        let response = self
            .client
            .request(|| self.client.client.post(&url).json(&body), &url)
            .await?;
        response
            .json()
            .await
            .map_err(|e| KeytraceError::InvalidResponse {
                message: format!("failed to parse session: {e}"),
            })
    }
}

#[async_trait]
impl KeyPublisher for XrpcKeyPublisher {
    async fn publish(&self, date: &str, record: &KeyRecord) -> KeytraceResult<()> {
        let session = self.create_session().await?;
        let url = format!("{}/xrpc/com.atproto.repo.putRecord", self.service_url);
        let body = json!({
            "repo": session.did,
            "collection": KEY_COLLECTION,
            "rkey": date,
            "record": record,
        });
        let bearer = format!("Bearer {}", session.access_jwt);

        self.client
            .request(
                || {
                    self.client
                        .client
                        .post(&url)
                        .header(AUTHORIZATION, bearer.as_str())
                        .json(&body)
                },
                &url,
            )
            .await?;
        debug!(date, repo = %session.did, "published key record");
        Ok(())
    }
}
