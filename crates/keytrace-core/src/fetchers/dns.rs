//! DNS TXT proof fetcher.
//!
//! Lookups go through a [`TxtResolver`]; the default resolver speaks the
//! DNS-over-HTTPS JSON API so the fetcher needs no system resolver.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::http::{build_client, race_timeout};
use super::{FetchOptions, Fetcher, FetcherKind, ProofDocument};
use crate::error::{KeytraceError, KeytraceResult};
use crate::providers::ProofRequest;

/// DNS response code for a name that does not exist.
const RCODE_NXDOMAIN: u32 = 3;

/// TXT resource record type.
const TYPE_TXT: u16 = 16;

/// Failure of a TXT lookup.
#[derive(Debug, thiserror::Error)]
pub enum TxtLookupError {
    /// The name has no TXT records (NXDOMAIN or NODATA).
    #[error("no TXT records for {domain}")]
    NotFound { domain: String },

    #[error("DNS lookup failed: {message}")]
    Transport { message: String },
}

/// Resolves TXT records for a domain.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT character-strings, flattened across records.
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, TxtLookupError>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,

    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DNS-over-HTTPS (JSON API) resolver.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>) -> KeytraceResult<Self> {
        Ok(Self::with_client(build_client()?, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TxtResolver for DohResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, TxtLookupError> {
        let transport = |e: reqwest::Error| TxtLookupError::Transport {
            message: e.to_string(),
        };

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", domain), ("type", "TXT")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(TxtLookupError::Transport {
                message: format!("HTTP {} from resolver", response.status().as_u16()),
            });
        }

        let body: DohResponse = response.json().await.map_err(transport)?;
        match body.status {
            0 => {}
            RCODE_NXDOMAIN => {
                return Err(TxtLookupError::NotFound {
                    domain: domain.to_string(),
                })
            }
            rcode => {
                return Err(TxtLookupError::Transport {
                    message: format!("resolver returned rcode {rcode}"),
                })
            }
        }

        let records: Vec<String> = body
            .answer
            .iter()
            .filter(|a| a.record_type == TYPE_TXT)
            .flat_map(|a| parse_txt_data(&a.data))
            .collect();

        if records.is_empty() {
            return Err(TxtLookupError::NotFound {
                domain: domain.to_string(),
            });
        }
        Ok(records)
    }
}

/// Split TXT presentation data into its character-strings.
///
/// `"a" "b"` yields `["a", "b"]`; unquoted data is returned as is.
fn parse_txt_data(data: &str) -> Vec<String> {
    let data = data.trim();
    if !data.starts_with('"') {
        return vec![data.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                chunks.push(std::mem::take(&mut current));
                in_quotes = false;
            }
            '"' => in_quotes = true,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if in_quotes => current.push(c),
            _ => {}
        }
    }
    chunks
}

/// Fetches TXT records as `{"domain": .., "records": {"txt": [..]}}`.
#[derive(Clone)]
pub struct DnsFetcher {
    resolver: Arc<dyn TxtResolver>,
}

impl DnsFetcher {
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self { resolver }
    }
}

impl std::fmt::Debug for DnsFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsFetcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl Fetcher for DnsFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::Dns
    }

    fn is_available(&self) -> bool {
        cfg!(not(target_arch = "wasm32"))
    }

    async fn fetch(
        &self,
        request: &ProofRequest,
        options: &FetchOptions,
    ) -> KeytraceResult<Option<ProofDocument>> {
        let domain = request.uri.as_str();
        let lookup = async {
            match self.resolver.resolve_txt(domain).await {
                Ok(txt) => Ok(Some(txt)),
                Err(TxtLookupError::NotFound { .. }) => Ok(None),
                Err(TxtLookupError::Transport { message }) => {
                    Err(KeytraceError::FetchTransport { message })
                }
            }
        };

        let txt = race_timeout(domain, options.timeout, lookup).await?;
        debug!(domain, found = txt.is_some(), "TXT lookup finished");

        Ok(txt.map(|txt| {
            ProofDocument::Json(json!({
                "domain": domain,
                "records": { "txt": txt },
            }))
        }))
    }
}
