//! Trusted signer resolution.
//!
//! Trust is configured by handle but decided by DID: handles are mutable,
//! so each configured handle is resolved once per verification batch and
//! signers are compared against the resolved identifiers.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::atproto::HandleResolver;
use crate::did::is_valid_did;
use crate::error::{KeytraceError, KeytraceResult};

/// Signer trusted when the caller configures none.
pub const DEFAULT_TRUSTED_SIGNER: &str = "keytrace.dev";

/// Configured trusted signer handles (or DIDs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedSigners {
    handles: Vec<String>,
}

impl Default for TrustedSigners {
    fn default() -> Self {
        Self {
            handles: vec![DEFAULT_TRUSTED_SIGNER.to_string()],
        }
    }
}

impl TrustedSigners {
    /// Trusted signers from a list; an empty list means the default signer.
    pub fn new<I, S>(handles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let handles: Vec<String> = handles
            .into_iter()
            .map(|h| {
                let h: String = h.into();
                normalize(&h)
            })
            .filter(|h| !h.is_empty() && seen.insert(h.clone()))
            .collect();

        if handles.is_empty() {
            Self::default()
        } else {
            Self { handles }
        }
    }

    pub fn handles(&self) -> &[String] {
        &self.handles
    }

    /// Resolve every handle to its DID, concurrently.
    ///
    /// Handles that fail to resolve are logged and left out of the trusted
    /// set; entries that already are DIDs resolve to themselves.
    pub async fn resolve(&self, resolver: &dyn HandleResolver) -> ResolvedTrust {
        let lookups = self.handles.iter().map(|handle| async move {
            if is_valid_did(handle) {
                return (handle.clone(), Ok(handle.clone()));
            }
            (handle.clone(), resolver.resolve_handle(handle).await)
        });

        let mut trust = ResolvedTrust::default();
        for (handle, result) in join_all(lookups).await {
            match result {
                Ok(did) => {
                    debug!(handle = %handle, did = %did, "resolved trusted signer");
                    trust.insert(handle, did);
                }
                Err(e) => {
                    warn!(handle = %handle, error = %e, "could not resolve trusted signer");
                }
            }
        }
        trust
    }
}

fn normalize(entry: &str) -> String {
    let entry = entry.trim().trim_start_matches('@');
    if is_valid_did(entry) {
        entry.to_string()
    } else {
        entry.to_lowercase()
    }
}

/// Trusted DIDs with the handles they were configured as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTrust {
    aliases: BTreeMap<String, String>,
    dids: BTreeSet<String>,
}

impl ResolvedTrust {
    /// Trust `did` directly, recorded under `handle`.
    pub fn insert(&mut self, handle: impl Into<String>, did: impl Into<String>) {
        let did = did.into();
        self.dids.insert(did.clone());
        self.aliases.insert(handle.into(), did);
    }

    pub fn contains(&self, did: &str) -> bool {
        self.dids.contains(did)
    }

    /// Fail with `UntrustedSigner` unless `signer` is trusted.
    pub fn check(&self, signer: &str) -> KeytraceResult<()> {
        if self.contains(signer) {
            Ok(())
        } else {
            Err(KeytraceError::UntrustedSigner {
                signer: signer.to_string(),
            })
        }
    }

    /// A configured handle naming `did`, for display.
    pub fn alias_of(&self, did: &str) -> Option<&str> {
        self.aliases
            .iter()
            .find(|(_, d)| d.as_str() == did)
            .map(|(handle, _)| handle.as_str())
    }

    pub fn dids(&self) -> impl Iterator<Item = &str> {
        self.dids.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.dids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapResolver {
        map: HashMap<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    impl MapResolver {
        fn new(pairs: &[(&'static str, &'static str)]) -> Self {
            Self {
                map: pairs.iter().copied().collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HandleResolver for MapResolver {
        async fn resolve_handle(&self, handle: &str) -> KeytraceResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.map
                .get(handle)
                .map(|d| d.to_string())
                .ok_or_else(|| KeytraceError::NotFound {
                    what: format!("handle {handle}"),
                })
        }
    }

    #[test]
    fn test_empty_means_default() {
        let signers = TrustedSigners::new(Vec::<String>::new());
        assert_eq!(signers.handles(), &["keytrace.dev".to_string()]);
    }

    #[test]
    fn test_handles_are_normalized_and_deduplicated() {
        let signers = TrustedSigners::new(["@Keytrace.dev", "keytrace.dev", " npmx.dev "]);
        assert_eq!(signers.handles(), &["keytrace.dev".to_string(), "npmx.dev".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_once_per_handle() {
        let resolver = MapResolver::new(&[("keytrace.dev", "did:plc:trusted")]);
        let trust = TrustedSigners::new(["keytrace.dev", "KEYTRACE.dev"])
            .resolve(&resolver)
            .await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert!(trust.contains("did:plc:trusted"));
        assert_eq!(trust.alias_of("did:plc:trusted"), Some("keytrace.dev"));
    }

    #[tokio::test]
    async fn test_dids_skip_resolution() {
        let resolver = MapResolver::new(&[]);
        let trust = TrustedSigners::new(["did:plc:direct"]).resolve(&resolver).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert!(trust.check("did:plc:direct").is_ok());
    }

    #[tokio::test]
    async fn test_unresolvable_handle_is_skipped() {
        let resolver = MapResolver::new(&[("keytrace.dev", "did:plc:trusted")]);
        let trust = TrustedSigners::new(["keytrace.dev", "gone.example"])
            .resolve(&resolver)
            .await;
        assert_eq!(trust.dids().count(), 1);

        let err = trust.check("did:plc:other").unwrap_err();
        assert!(err.to_string().contains("not from a trusted signer"));
    }
}
