//! Service provider registry.
//!
//! A provider is a capability bundle: a URI pattern plus a fixed set of
//! functions describing where its proof lives and how to read it. Providers
//! are plain data registered in order; lookup is a linear scan over their
//! patterns.

mod activitypub;
mod bsky;
mod dns;
mod github;

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KeytraceError, KeytraceResult};
use crate::fetchers::FetcherKind;

/// Regex capture groups of a matched URI; index 0 is the whole match.
pub type MatchGroups = [String];

/// Capture group `i`, or `""` when absent.
pub fn group(groups: &MatchGroups, i: usize) -> &str {
    groups.get(i).map(String::as_str).unwrap_or_default()
}

/// Document format expected from a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofFormat {
    Json,
    Text,
}

/// Comparison applied between a proof value and the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Equals,
    Contains,
}

impl Relation {
    /// Apply the relation to a found value.
    ///
    /// `Contains` only accepts an occurrence that ends on an identifier
    /// boundary, so `did:web:example.co` is not found in
    /// `did:web:example.com`.
    pub fn holds(self, found: &str, expected: &str) -> bool {
        match self {
            Self::Equals => found.trim() == expected.trim(),
            Self::Contains => contains_token(found, expected),
        }
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '%' | ':' | '-')
}

/// Whether `expected` occurs in `found` not directly followed by more
/// identifier text. A `.` counts as a boundary only when no identifier
/// character follows it (end of a sentence).
fn contains_token(found: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    found.match_indices(expected).any(|(start, _)| {
        let mut rest = found[start + expected.len()..].chars();
        match rest.next() {
            None => true,
            Some('.') => !rest.next().is_some_and(|c| is_identifier_char(c) || c == '.'),
            Some(c) => !is_identifier_char(c),
        }
    })
}

impl FromStr for Relation {
    type Err = KeytraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Self::Equals),
            "contains" => Ok(Self::Contains),
            other => Err(KeytraceError::malformed(format!(
                "unknown relation {other:?}, expected equals or contains"
            ))),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals => write!(f, "equals"),
            Self::Contains => write!(f, "contains"),
        }
    }
}

/// Where inside a proof document an expected value must appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofTarget {
    /// Ordered field accesses into the document.
    pub path: Vec<String>,
    pub relation: Relation,
    pub format: ProofFormat,
}

impl ProofTarget {
    pub fn new(path: &[&str], relation: Relation) -> Self {
        Self {
            path: path.iter().map(|s| s.to_string()).collect(),
            relation,
            format: ProofFormat::Text,
        }
    }
}

/// Retrieval descriptor consumed by a fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub uri: String,
    pub fetcher: FetcherKind,
    pub format: ProofFormat,
}

/// Public profile shown for a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileLink {
    pub display: String,
    pub uri: String,
    pub qrcode: bool,
}

/// Proof location and targets for a claim URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofSpec {
    pub request: ProofRequest,
    pub targets: Vec<ProofTarget>,
}

/// Output of [`ServiceProvider::process_uri`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedUri {
    pub profile: ProfileLink,
    pub proof: ProofSpec,
}

/// Identity fields extracted from a fetched proof.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFields {
    pub subject: String,
    pub profile_url: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Provider self-test vector.
#[derive(Debug, Clone, Copy)]
pub struct SelfTest {
    pub uri: &'static str,
    pub should_match: bool,
}

/// A service provider capability bundle.
pub struct ServiceProvider {
    pub id: &'static str,
    pub name: &'static str,
    pub homepage: &'static str,
    pub uri_pattern: &'static str,
    /// The proof cannot tell apart users sharing the same infrastructure.
    pub is_ambiguous: bool,
    pub process_uri: fn(&str, &MatchGroups) -> ProcessedUri,
    pub postprocess: fn(&serde_json::Value, &MatchGroups) -> IdentityFields,
    pub proof_text: fn(&str) -> String,
    pub proof_location: fn(&MatchGroups) -> String,
    pub self_tests: &'static [SelfTest],
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("id", &self.id)
            .field("uri_pattern", &self.uri_pattern)
            .field("is_ambiguous", &self.is_ambiguous)
            .finish()
    }
}

/// Proof text shared by the web-profile providers.
pub(crate) fn default_proof_text(did: &str) -> String {
    format!("Verifying my identity on keytrace: {did}")
}

struct Registered {
    provider: &'static ServiceProvider,
    pattern: Regex,
}

/// A self-test that did not behave as declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestFailure {
    pub provider: &'static str,
    pub uri: &'static str,
    pub expected_match: bool,
}

/// Ordered provider registry.
pub struct ProviderRegistry {
    entries: Vec<Registered>,
}

static BUILTIN: Lazy<ProviderRegistry> = Lazy::new(|| {
    ProviderRegistry::new(&[
        &github::PROVIDER,
        &dns::PROVIDER,
        &activitypub::PROVIDER,
        &bsky::PROVIDER,
    ])
    .expect("built-in provider patterns compile")
});

impl ProviderRegistry {
    /// Build a registry; registration order is lookup order.
    pub fn new(providers: &[&'static ServiceProvider]) -> KeytraceResult<Self> {
        let entries = providers
            .iter()
            .map(|&provider| {
                Regex::new(provider.uri_pattern)
                    .map(|pattern| Registered { provider, pattern })
                    .map_err(|e| KeytraceError::Config {
                        message: format!("invalid pattern for provider {}: {e}", provider.id),
                    })
            })
            .collect::<KeytraceResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// The built-in providers.
    pub fn builtin() -> &'static ProviderRegistry {
        &BUILTIN
    }

    pub fn providers(&self) -> impl Iterator<Item = &'static ServiceProvider> + '_ {
        self.entries.iter().map(|e| e.provider)
    }

    pub fn get(&self, id: &str) -> Option<&'static ServiceProvider> {
        self.providers().find(|p| p.id == id)
    }

    /// Capture groups if `provider` matches `uri`.
    pub fn captures(&self, provider_id: &str, uri: &str) -> Option<Vec<String>> {
        let entry = self.entries.iter().find(|e| e.provider.id == provider_id)?;
        capture_groups(&entry.pattern, uri)
    }

    /// Every provider matching `uri`, in registration order.
    pub fn find_all(&self, uri: &str) -> Vec<(&'static ServiceProvider, Vec<String>)> {
        self.entries
            .iter()
            .filter_map(|e| capture_groups(&e.pattern, uri).map(|g| (e.provider, g)))
            .collect()
    }

    /// First provider matching `uri`.
    pub fn find_first(&self, uri: &str) -> Option<(&'static ServiceProvider, Vec<String>)> {
        self.entries
            .iter()
            .find_map(|e| capture_groups(&e.pattern, uri).map(|g| (e.provider, g)))
    }

    /// Run every provider's self-test vectors.
    pub fn run_self_tests(&self) -> Vec<SelfTestFailure> {
        let mut failures = Vec::new();
        for entry in &self.entries {
            for test in entry.provider.self_tests {
                if entry.pattern.is_match(test.uri) != test.should_match {
                    failures.push(SelfTestFailure {
                        provider: entry.provider.id,
                        uri: test.uri,
                        expected_match: test.should_match,
                    });
                }
            }
        }
        failures
    }
}

fn capture_groups(pattern: &Regex, uri: &str) -> Option<Vec<String>> {
    pattern.captures(uri).map(|caps| {
        caps.iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_self_tests_pass() {
        let failures = ProviderRegistry::builtin().run_self_tests();
        assert!(failures.is_empty(), "self-test failures: {failures:?}");
    }

    #[test]
    fn test_registration_order() {
        let ids: Vec<_> = ProviderRegistry::builtin().providers().map(|p| p.id).collect();
        assert_eq!(ids, vec!["github", "dns", "activitypub", "bsky"]);
    }

    #[test]
    fn test_each_uri_matches_one_provider() {
        let registry = ProviderRegistry::builtin();
        for (uri, id) in [
            ("https://gist.github.com/alice/abc123def456", "github"),
            ("dns:example.com", "dns"),
            ("https://mastodon.social/@alice", "activitypub"),
            ("https://bsky.app/profile/alice.bsky.social", "bsky"),
        ] {
            let found = registry.find_all(uri);
            assert_eq!(found.len(), 1, "{uri}");
            assert_eq!(found[0].0.id, id);
        }
        assert!(registry.find_first("https://unknown.site/alice").is_none());
    }

    #[test]
    fn test_relation_parse() {
        assert_eq!("equals".parse::<Relation>().unwrap(), Relation::Equals);
        assert_eq!("contains".parse::<Relation>().unwrap(), Relation::Contains);
        assert!("startsWith".parse::<Relation>().is_err());
    }

    #[test]
    fn test_relation_holds() {
        assert!(Relation::Equals.holds(" did:plc:a\n", "did:plc:a"));
        assert!(!Relation::Equals.holds("did:plc:ab", "did:plc:a"));
        assert!(Relation::Contains.holds("proof: did:plc:a", "did:plc:a"));
    }

    #[test]
    fn test_contains_stops_at_identifier_boundary() {
        let relation = Relation::Contains;
        assert!(!relation.holds("did:web:example.com", "did:web:example.co"));
        assert!(!relation.holds("did:web:example.co.uk", "did:web:example.co"));
        assert!(!relation.holds("did:plc:abc123", "did:plc:abc"));
        assert!(relation.holds("see did:web:example.co.", "did:web:example.co"));
        assert!(relation.holds("did:plc:abc\nnext", "did:plc:abc"));
        assert!(relation.holds("did:plc:abc123 and did:plc:abc", "did:plc:abc"));
        assert!(!relation.holds("anything", ""));
    }
}
