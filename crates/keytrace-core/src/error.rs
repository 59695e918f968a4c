//! Error types for claim verification.

use std::time::Duration;

/// Verification errors.
#[derive(Debug, thiserror::Error)]
pub enum KeytraceError {
    /// Bad identifier, handle or URI syntax.
    #[error("malformed input: {message}")]
    MalformedInput { message: String },

    /// No provider or recipe recognised the claim URI.
    #[error("no service provider matched: {uri}")]
    NoProviderMatch { uri: String },

    /// The claim's signer is outside the trusted set.
    #[error("claim is not from a trusted signer: {signer}")]
    UntrustedSigner { signer: String },

    /// The signature record lacks required fields.
    #[error("missing signature fields: {}", fields.join(", "))]
    MissingSignatureFields { fields: Vec<String> },

    /// The signing key record could not be found.
    #[error("signing key not found: {uri}")]
    KeyNotFound { uri: String },

    /// The signature was made outside the key's validity window.
    #[error(
        "key expired/not yet valid at signing time: signed at {signed_at}, valid {valid_from} to {valid_until}"
    )]
    KeyExpired {
        signed_at: String,
        valid_from: String,
        valid_until: String,
    },

    /// Signature verification failed.
    #[error("signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    /// A network-bound fetch did not finish in time.
    #[error("fetch timed out after {timeout:?}: {target}")]
    FetchTimeout { target: String, timeout: Duration },

    /// A network-bound fetch failed in transport.
    #[error("fetch failed: {message}")]
    FetchTransport { message: String },

    /// The requested fetcher is not available in this environment.
    #[error("fetcher unavailable: {fetcher}")]
    FetcherUnavailable { fetcher: String },

    /// A recipe or proof assertion did not hold.
    #[error("assertion failed at {selector}: {reason}")]
    AssertionMismatch { selector: String, reason: String },

    /// A collaborator reported that a record or identity does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A collaborator answered with something unparseable.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Blob store failure.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Claim status machine misuse.
    #[error("invalid claim transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl KeytraceError {
    /// Exit code for CLI.
    ///
    /// Codes start at 3; 1 and 2 belong to the CLI's own verdicts.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Input / config issues
            Self::MalformedInput { .. } => 3,
            Self::Config { .. } => 3,
            Self::NoProviderMatch { .. } => 3,
            Self::InvalidTransition { .. } => 3,

            // Not found
            Self::NotFound { .. } => 4,
            Self::KeyNotFound { .. } => 4,

            // Trust and signature failures
            Self::UntrustedSigner { .. } => 5,
            Self::MissingSignatureFields { .. } => 5,
            Self::KeyExpired { .. } => 5,
            Self::SignatureInvalid { .. } => 5,
            Self::AssertionMismatch { .. } => 5,

            // Network/transient
            Self::FetchTimeout { .. } => 6,
            Self::FetchTransport { .. } => 6,
            Self::FetcherUnavailable { .. } => 6,

            // Other
            Self::InvalidResponse { .. } => 7,
            Self::Storage { .. } => 7,
        }
    }

    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchTimeout { .. } | Self::FetchTransport { .. }
        )
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    pub(crate) fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for KeytraceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::FetchTimeout {
                target: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "request".to_string()),
                timeout: Duration::ZERO,
            }
        } else {
            Self::FetchTransport {
                message: err.to_string(),
            }
        }
    }
}

/// Result type for verification operations.
pub type KeytraceResult<T> = Result<T, KeytraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrusted_message() {
        let err = KeytraceError::UntrustedSigner {
            signer: "did:plc:evil".to_string(),
        };
        assert!(err.to_string().contains("not from a trusted signer"));
        assert_eq!(err.exit_code(), 5);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_fields_message() {
        let err = KeytraceError::MissingSignatureFields {
            fields: vec!["src".to_string(), "kid".to_string()],
        };
        assert_eq!(err.to_string(), "missing signature fields: src, kid");
    }

    #[test]
    fn test_exit_codes_leave_cli_verdicts_free() {
        let errors = [
            KeytraceError::malformed("bad"),
            KeytraceError::NotFound { what: "x".to_string() },
            KeytraceError::signature("bad"),
            KeytraceError::Storage { message: "x".to_string() },
        ];
        for err in errors {
            assert!(err.exit_code() >= 3, "{err} exits with {}", err.exit_code());
        }
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = KeytraceError::FetchTimeout {
            target: "example.com".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), 6);
    }
}
