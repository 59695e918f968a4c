//! HTTP proof fetcher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use tracing::debug;

use super::{FetchOptions, Fetcher, FetcherKind, ProofDocument};
use crate::error::{KeytraceError, KeytraceResult};
use crate::providers::{ProofFormat, ProofRequest};

/// User agent for outbound fetches.
pub(crate) const USER_AGENT_VALUE: &str = concat!("keytrace/", env!("CARGO_PKG_VERSION"));

const ACCEPT_JSON: &str = "application/activity+json, application/json;q=0.9, */*;q=0.1";

pub(crate) fn build_client() -> KeytraceResult<reqwest::Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .map_err(|e| KeytraceError::FetchTransport {
            message: format!("failed to create HTTP client: {}", e),
        })
}

/// Fetches proof documents over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> KeytraceResult<Self> {
        Ok(Self::with_client(build_client()?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_inner(&self, request: &ProofRequest) -> KeytraceResult<Option<ProofDocument>> {
        let mut builder = self.client.get(&request.uri);
        if request.format == ProofFormat::Json {
            builder = builder.header(ACCEPT, ACCEPT_JSON);
        }

        let response = builder.send().await?;
        let status = response.status();
        debug!(url = %request.uri, status = status.as_u16(), "proof fetched");

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(KeytraceError::FetchTransport {
                message: format!("HTTP {} from {}", status.as_u16(), request.uri),
            });
        }

        let body = response.text().await?;
        match request.format {
            ProofFormat::Text => Ok(Some(ProofDocument::Text(body))),
            ProofFormat::Json => serde_json::from_str(&body)
                .map(|value| Some(ProofDocument::Json(value)))
                .map_err(|e| KeytraceError::InvalidResponse {
                    message: format!("proof at {} is not JSON: {}", request.uri, e),
                }),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::Http
    }

    async fn fetch(
        &self,
        request: &ProofRequest,
        options: &FetchOptions,
    ) -> KeytraceResult<Option<ProofDocument>> {
        race_timeout(&request.uri, options.timeout, self.fetch_inner(request)).await
    }
}

/// Run `fut`, failing with `FetchTimeout` once `timeout` elapses.
pub(crate) async fn race_timeout<T>(
    target: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = KeytraceResult<T>>,
) -> KeytraceResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| match e {
            KeytraceError::FetchTimeout { .. } => KeytraceError::FetchTimeout {
                target: target.to_string(),
                timeout,
            },
            other => other,
        }),
        Err(_) => Err(KeytraceError::FetchTimeout {
            target: target.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_race_timeout_elapses() {
        let err = race_timeout("slow.example", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, KeytraceError>(())
        })
        .await
        .unwrap_err();

        match err {
            KeytraceError::FetchTimeout { target, timeout } => {
                assert_eq!(target, "slow.example");
                assert_eq!(timeout, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_race_timeout_passes_result() {
        let value = race_timeout("fast.example", Duration::from_secs(1), async {
            Ok::<_, KeytraceError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
