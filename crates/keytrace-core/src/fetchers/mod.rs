//! Proof retrieval backends.
//!
//! Every fetcher answers a [`ProofRequest`] with `Ok(Some(doc))` when the
//! proof document exists, `Ok(None)` when the lookup definitively found
//! nothing, and an error when the answer is unknown (timeout, transport).

mod dns;
mod http;

pub use dns::{DnsFetcher, DohResolver, TxtLookupError, TxtResolver};
pub use http::HttpFetcher;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::KeytraceConfig;
use crate::error::{KeytraceError, KeytraceResult};
use crate::providers::ProofRequest;

/// Identifier of a retrieval backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    Http,
    Dns,
}

impl fmt::Display for FetcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Dns => write!(f, "dns"),
        }
    }
}

/// Per-fetch options.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
        }
    }
}

/// A retrieved proof document.
#[derive(Debug, Clone, PartialEq)]
pub enum ProofDocument {
    Json(serde_json::Value),
    Text(String),
}

impl ProofDocument {
    /// The document as JSON; text documents become a JSON string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Text(text) => serde_json::Value::String(text.clone()),
        }
    }
}

/// A retrieval backend.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn kind(&self) -> FetcherKind;

    /// Whether the backend can run in this environment.
    fn is_available(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        request: &ProofRequest,
        options: &FetchOptions,
    ) -> KeytraceResult<Option<ProofDocument>>;
}

/// Fetchers keyed by kind.
#[derive(Clone, Default)]
pub struct FetcherSet {
    fetchers: HashMap<FetcherKind, Arc<dyn Fetcher>>,
}

impl FetcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP and DNS-over-HTTPS fetchers built from configuration.
    pub fn from_config(config: &KeytraceConfig) -> KeytraceResult<Self> {
        let client = http::build_client()?;
        let resolver = DohResolver::with_client(client.clone(), config.doh_url.clone());

        Ok(Self::new()
            .with(Arc::new(HttpFetcher::with_client(client)))
            .with(Arc::new(DnsFetcher::new(Arc::new(resolver)))))
    }

    /// Register a fetcher, replacing any of the same kind.
    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(fetcher.kind(), fetcher);
        self
    }

    /// The fetcher for `kind`, if registered and available.
    pub fn get(&self, kind: FetcherKind) -> KeytraceResult<&Arc<dyn Fetcher>> {
        match self.fetchers.get(&kind) {
            Some(fetcher) if fetcher.is_available() => Ok(fetcher),
            _ => Err(KeytraceError::FetcherUnavailable {
                fetcher: kind.to_string(),
            }),
        }
    }

    /// Dispatch `request` to its fetcher.
    pub async fn fetch(
        &self,
        request: &ProofRequest,
        options: &FetchOptions,
    ) -> KeytraceResult<Option<ProofDocument>> {
        self.get(request.fetcher)?.fetch(request, options).await
    }
}

impl fmt::Debug for FetcherSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherSet")
            .field("kinds", &self.fetchers.keys().collect::<Vec<_>>())
            .finish()
    }
}
