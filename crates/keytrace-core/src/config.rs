//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trust::DEFAULT_TRUSTED_SIGNER;

/// Keytrace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeytraceConfig {
    /// AppView used for handle resolution and profile lookups.
    #[serde(default = "default_public_api_url")]
    pub public_api_url: String,

    /// PLC directory for `did:plc` documents.
    #[serde(default = "default_plc_directory_url")]
    pub plc_directory_url: String,

    /// DNS-over-HTTPS JSON endpoint.
    #[serde(default = "default_doh_url")]
    pub doh_url: String,

    /// Timeout for a single proof fetch, in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Timeout for collaborator requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum retries for transient collaborator failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Trusted signer handles.
    #[serde(default = "default_trusted_signers")]
    pub trusted_signers: Vec<String>,

    /// Directory backing the file blob store.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
}

fn default_public_api_url() -> String {
    "https://public.api.bsky.app".to_string()
}

fn default_plc_directory_url() -> String {
    "https://plc.directory".to_string()
}

fn default_doh_url() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_trusted_signers() -> Vec<String> {
    vec![DEFAULT_TRUSTED_SIGNER.to_string()]
}

fn default_key_dir() -> PathBuf {
    PathBuf::from(".data")
}

impl Default for KeytraceConfig {
    fn default() -> Self {
        Self {
            public_api_url: default_public_api_url(),
            plc_directory_url: default_plc_directory_url(),
            doh_url: default_doh_url(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            trusted_signers: default_trusted_signers(),
            key_dir: default_key_dir(),
        }
    }
}

impl KeytraceConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `KEYTRACE_PUBLIC_API_URL` | AppView base URL |
    /// | `KEYTRACE_PLC_DIRECTORY` | PLC directory base URL |
    /// | `KEYTRACE_DOH_URL` | DNS-over-HTTPS endpoint |
    /// | `KEYTRACE_FETCH_TIMEOUT_MS` | Proof fetch timeout |
    /// | `KEYTRACE_REQUEST_TIMEOUT_SECS` | Collaborator request timeout |
    /// | `KEYTRACE_MAX_RETRIES` | Retries for transient failures |
    /// | `KEYTRACE_TRUSTED_SIGNERS` | Comma separated trusted handles |
    /// | `KEYTRACE_KEY_DIR` | File blob store directory |
    pub fn from_env() -> Self {
        Self {
            public_api_url: std::env::var("KEYTRACE_PUBLIC_API_URL")
                .unwrap_or_else(|_| default_public_api_url()),
            plc_directory_url: std::env::var("KEYTRACE_PLC_DIRECTORY")
                .unwrap_or_else(|_| default_plc_directory_url()),
            doh_url: std::env::var("KEYTRACE_DOH_URL").unwrap_or_else(|_| default_doh_url()),
            fetch_timeout_ms: std::env::var("KEYTRACE_FETCH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_timeout_ms),
            request_timeout_secs: std::env::var("KEYTRACE_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_request_timeout_secs),
            max_retries: std::env::var("KEYTRACE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            trusted_signers: std::env::var("KEYTRACE_TRUSTED_SIGNERS")
                .ok()
                .map(|v| parse_signer_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_trusted_signers),
            key_dir: std::env::var("KEYTRACE_KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_key_dir()),
        }
    }

    /// Proof fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Collaborator request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Set the AppView URL.
    pub fn with_public_api_url(mut self, url: impl Into<String>) -> Self {
        self.public_api_url = url.into();
        self
    }

    /// Set the PLC directory URL.
    pub fn with_plc_directory_url(mut self, url: impl Into<String>) -> Self {
        self.plc_directory_url = url.into();
        self
    }

    /// Set the DNS-over-HTTPS endpoint.
    pub fn with_doh_url(mut self, url: impl Into<String>) -> Self {
        self.doh_url = url.into();
        self
    }

    /// Set the proof fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Replace the trusted signer handles.
    pub fn with_trusted_signers(mut self, handles: Vec<String>) -> Self {
        self.trusted_signers = handles;
        self
    }
}

fn parse_signer_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
