//! Identifier syntax: DIDs, handles and AT URIs.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{KeytraceError, KeytraceResult};

static DID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^did:[a-z]+:[A-Za-z0-9._:%-]*[A-Za-z0-9._-]$").expect("DID pattern"));

static HANDLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
        .expect("handle pattern")
});

/// Whether `s` is a syntactically valid DID.
pub fn is_valid_did(s: &str) -> bool {
    DID_RE.is_match(s)
}

/// Validate a DID, failing with `MalformedInput`.
pub fn validate_did(s: &str) -> KeytraceResult<()> {
    if is_valid_did(s) {
        Ok(())
    } else {
        Err(KeytraceError::malformed(format!("invalid DID format: {s:?}")))
    }
}

/// Whether `s` is a syntactically valid handle (a domain name).
pub fn is_valid_handle(s: &str) -> bool {
    s.len() <= 253 && HANDLE_RE.is_match(s)
}

/// An `at://authority/collection/rkey` record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        authority: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }
}

impl FromStr for AtUri {
    type Err = KeytraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| KeytraceError::malformed(format!("not an AT URI: {s:?}")))?;

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [authority, collection, rkey]
                if !authority.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
            {
                Ok(Self::new(*authority, *collection, *rkey))
            }
            _ => Err(KeytraceError::malformed(format!(
                "AT URI must be at://authority/collection/rkey: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}
