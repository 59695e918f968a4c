//! Claims and their matching state machine.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::did::validate_did;
use crate::error::{KeytraceError, KeytraceResult};
use crate::providers::{ProviderRegistry, ServiceProvider};
use crate::recipe::{Bindings, Recipe, RecipeBook, RecipeMatch};

/// Claim lifecycle.
///
/// `Init -> Matched | Error | Failed`, then `Matched -> Verified | Failed |
/// Error`. `Verified`, `Failed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Init,
    Matched,
    Verified,
    Failed,
    Error,
}

impl ClaimStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::Error)
    }

    pub fn can_transition(self, to: ClaimStatus) -> bool {
        use ClaimStatus::*;
        matches!(
            (self, to),
            (Init, Matched) | (Init, Error) | (Init, Failed) | (Matched, Verified | Failed | Error)
        )
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Matched => "MATCHED",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What produced a match.
#[derive(Debug, Clone)]
pub enum MatchSource {
    Provider(&'static ServiceProvider),
    Recipe(Box<Recipe>),
}

impl MatchSource {
    /// Provider id or recipe type.
    pub fn id(&self) -> &str {
        match self {
            Self::Provider(p) => p.id,
            Self::Recipe(r) => &r.recipe_type,
        }
    }
}

/// One candidate binding of a claim URI.
#[derive(Debug, Clone)]
pub struct ServiceProviderMatch {
    pub source: MatchSource,
    /// Provider capture groups; empty for recipes.
    pub captures: Vec<String>,
    /// Recipe parameter binding; `None` for providers.
    pub recipe_match: Option<RecipeMatch>,
    pub is_ambiguous: bool,
}

impl ServiceProviderMatch {
    pub fn provider(&self) -> Option<&'static ServiceProvider> {
        match self.source {
            MatchSource::Provider(p) => Some(p),
            MatchSource::Recipe(_) => None,
        }
    }

    pub fn recipe(&self) -> Option<&Recipe> {
        match &self.source {
            MatchSource::Recipe(r) => Some(&**r),
            MatchSource::Provider(_) => None,
        }
    }

    /// The proof the owner of `did` must publish.
    ///
    /// Recipe templates may reference the claim id; placeholders that cannot
    /// be filled make this `None`.
    pub fn proof_text(&self, did: &str, claim_id: &str, uri: &str) -> Option<String> {
        match &self.source {
            MatchSource::Provider(p) => Some((p.proof_text)(did)),
            MatchSource::Recipe(r) => r.proof_text(&r.bindings_for(claim_id, did, uri))?.ok(),
        }
    }

    /// Where the proof must be published.
    pub fn proof_location(&self) -> Option<String> {
        match &self.source {
            MatchSource::Provider(p) => Some((p.proof_location)(&self.captures)),
            MatchSource::Recipe(r) => r.instructions.proof_location.clone(),
        }
    }
}

/// How strongly a claim's matches identify one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambiguity {
    None,
    /// The only match is a provider whose proofs live on shared infrastructure.
    SharedInfrastructure,
    /// More than one provider or recipe matched.
    MultipleMatches,
}

/// An identity claim: `did` claims to control `uri`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "ClaimInit")]
pub struct Claim {
    uri: String,
    did: String,
    status: ClaimStatus,
    matches: Vec<ServiceProviderMatch>,
    errors: Vec<String>,
    /// Set once verification moved the claim past matching.
    verifying: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimInit {
    uri: String,
    did: String,
}

impl TryFrom<ClaimInit> for Claim {
    type Error = KeytraceError;

    fn try_from(init: ClaimInit) -> Result<Self, Self::Error> {
        Self::new(init.uri, init.did)
    }
}

impl Claim {
    /// Create a claim; fails with `MalformedInput` on a bad DID.
    pub fn new(uri: impl Into<String>, did: impl Into<String>) -> KeytraceResult<Self> {
        let did = did.into();
        validate_did(&did)?;
        Ok(Self {
            uri: uri.into(),
            did,
            status: ClaimStatus::Init,
            matches: Vec::new(),
            errors: Vec::new(),
            verifying: false,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn status(&self) -> ClaimStatus {
        self.status
    }

    pub fn matches(&self) -> &[ServiceProviderMatch] {
        &self.matches
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Match against the built-in providers and recipes.
    pub fn match_builtin(&mut self) -> KeytraceResult<()> {
        self.match_with(ProviderRegistry::builtin(), RecipeBook::builtin())
    }

    /// Bind the URI to every matching provider and recipe.
    ///
    /// Re-running recomputes the matches from scratch, so identical input
    /// yields identical state. Once verification has begun matching is
    /// rejected with `InvalidTransition`.
    pub fn match_with(
        &mut self,
        providers: &ProviderRegistry,
        recipes: &RecipeBook,
    ) -> KeytraceResult<()> {
        if self.verifying || matches!(self.status, ClaimStatus::Verified | ClaimStatus::Failed) {
            return Err(KeytraceError::InvalidTransition {
                from: self.status.to_string(),
                to: ClaimStatus::Matched.to_string(),
            });
        }

        self.status = ClaimStatus::Init;
        self.errors.clear();
        self.matches = providers
            .find_all(&self.uri)
            .into_iter()
            .map(|(provider, captures)| ServiceProviderMatch {
                source: MatchSource::Provider(provider),
                captures,
                recipe_match: None,
                is_ambiguous: provider.is_ambiguous,
            })
            .chain(recipes.find_all(&self.uri).into_iter().map(|(recipe, m)| {
                ServiceProviderMatch {
                    source: MatchSource::Recipe(Box::new(recipe.clone())),
                    captures: Vec::new(),
                    recipe_match: Some(m),
                    is_ambiguous: false,
                }
            }))
            .collect();

        if self.matches.is_empty() {
            self.errors
                .push(format!("No service provider matched the claim URI: {}", self.uri));
            self.status = ClaimStatus::Error;
        } else {
            self.status = ClaimStatus::Matched;
        }
        Ok(())
    }

    /// Move to `to`, enforcing the lifecycle.
    pub fn transition(&mut self, to: ClaimStatus) -> KeytraceResult<()> {
        if !self.status.can_transition(to) {
            return Err(KeytraceError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if self.status == ClaimStatus::Matched {
            self.verifying = true;
        }
        self.status = to;
        Ok(())
    }

    /// Record an error message without changing status.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Whether any match is weak evidence.
    pub fn is_ambiguous(&self) -> bool {
        self.ambiguity() != Ambiguity::None
    }

    pub fn ambiguity(&self) -> Ambiguity {
        match self.matches.as_slice() {
            [] => Ambiguity::None,
            [only] if only.is_ambiguous => Ambiguity::SharedInfrastructure,
            [_] => Ambiguity::None,
            _ => Ambiguity::MultipleMatches,
        }
    }

    /// The first match, the one verification uses.
    pub fn primary_match(&self) -> Option<&ServiceProviderMatch> {
        self.matches.first()
    }

    /// Bindings for running a recipe match of this claim.
    pub fn recipe_bindings(&self, recipe: &Recipe, claim_id: &str) -> Bindings {
        recipe.bindings_for(claim_id, &self.did, &self.uri)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchSummary<'a> {
    provider: &'a str,
    is_ambiguous: bool,
}

impl Serialize for Claim {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let matches: Vec<MatchSummary<'_>> = self
            .matches
            .iter()
            .map(|m| MatchSummary {
                provider: m.source.id(),
                is_ambiguous: m.is_ambiguous,
            })
            .collect();

        let mut state = serializer.serialize_struct("Claim", 5)?;
        state.serialize_field("uri", &self.uri)?;
        state.serialize_field("did", &self.did)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("matches", &matches)?;
        state.serialize_field("errors", &self.errors)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matched(uri: &str) -> Claim {
        let mut claim = Claim::new(uri, "did:plc:test").unwrap();
        claim.match_builtin().unwrap();
        claim
    }

    #[test]
    fn test_rejects_invalid_did() {
        for did in ["invalid", ""] {
            let err = Claim::new("https://gist.github.com/alice/abc123", did).unwrap_err();
            assert!(err.to_string().contains("invalid DID format"));
        }
        assert!(Claim::new("dns:example.com", "did:web:example.com").is_ok());
    }

    #[test]
    fn test_matches_each_provider() {
        for (uri, id) in [
            ("https://gist.github.com/alice/abc123def456", "github"),
            ("dns:example.com", "dns"),
            ("https://mastodon.social/@alice", "activitypub"),
            ("https://bsky.app/profile/alice.bsky.social", "bsky"),
            ("https://tangled.org/alice/keytrace/keytrace.json", "tangled"),
        ] {
            let claim = matched(uri);
            assert_eq!(claim.status(), ClaimStatus::Matched, "{uri}");
            assert_eq!(claim.matches().len(), 1, "{uri}");
            assert_eq!(claim.matches()[0].source.id(), id);
        }
    }

    #[test]
    fn test_unknown_uri_is_error() {
        let claim = matched("https://unknown.site/alice");
        assert_eq!(claim.status(), ClaimStatus::Error);
        assert_eq!(claim.errors().len(), 1);
        assert!(claim.errors()[0].contains("No service provider matched"));
    }

    #[test]
    fn test_match_is_idempotent() {
        let mut claim = matched("https://gist.github.com/alice/abc123def456/");
        let first = serde_json::to_value(&claim).unwrap();
        claim.match_builtin().unwrap();
        assert_eq!(serde_json::to_value(&claim).unwrap(), first);

        let mut failed = matched("https://unknown.site/alice");
        failed.match_builtin().unwrap();
        assert_eq!(failed.errors().len(), 1);
    }

    #[test]
    fn test_ambiguity() {
        assert!(!matched("https://gist.github.com/alice/abc123def456").is_ambiguous());
        let ap = matched("https://mastodon.social/@alice");
        assert!(ap.is_ambiguous());
        assert_eq!(ap.ambiguity(), Ambiguity::SharedInfrastructure);
    }

    #[test]
    fn test_multiple_matches_are_explicit() {
        let extra = Recipe::from_json_str(
            r#"{"type":"gist-mirror","version":1,
                "params":[{"key":"url","pattern":"^https://gist\\.github\\.com/"}],
                "verification":{"steps":[{"action":"http-get","url":"{url}"}]}}"#,
        )
        .unwrap();
        let recipes = RecipeBook::new().with(extra).unwrap();

        let mut claim = Claim::new("https://gist.github.com/alice/abc123", "did:plc:test").unwrap();
        claim.match_with(ProviderRegistry::builtin(), &recipes).unwrap();
        assert_eq!(claim.matches().len(), 2);
        assert_eq!(claim.ambiguity(), Ambiguity::MultipleMatches);
    }

    #[test]
    fn test_transitions() {
        let mut claim = matched("dns:example.com");
        claim.transition(ClaimStatus::Verified).unwrap();
        assert!(claim.status().is_terminal());

        let err = claim.transition(ClaimStatus::Failed).unwrap_err();
        assert!(matches!(err, KeytraceError::InvalidTransition { .. }));
        assert!(claim.match_builtin().is_err());

        let mut fresh = Claim::new("dns:example.com", "did:plc:test").unwrap();
        assert!(fresh.transition(ClaimStatus::Verified).is_err());
        fresh.transition(ClaimStatus::Failed).unwrap();
    }

    #[test]
    fn test_serialize() {
        let claim = matched("https://gist.github.com/alice/abc123def456");
        assert_eq!(
            serde_json::to_value(&claim).unwrap(),
            json!({
                "uri": "https://gist.github.com/alice/abc123def456",
                "did": "did:plc:test",
                "status": "MATCHED",
                "matches": [{ "provider": "github", "isAmbiguous": false }],
                "errors": []
            })
        );
    }

    #[test]
    fn test_deserialize_starts_at_init() {
        let claim: Claim = serde_json::from_value(json!({
            "uri": "https://gist.github.com/alice/abc123def456",
            "did": "did:plc:test123"
        }))
        .unwrap();
        assert_eq!(claim.status(), ClaimStatus::Init);
        assert_eq!(claim.did(), "did:plc:test123");

        let bad: Result<Claim, _> = serde_json::from_value(json!({ "uri": "x", "did": "nope" }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_proof_text_and_location() {
        let claim = matched("dns:example.com");
        let m = claim.primary_match().unwrap();
        assert_eq!(
            m.proof_text("did:plc:test", "3kabc", claim.uri()).unwrap(),
            "keytrace-verification=did:plc:test"
        );
        assert_eq!(m.proof_location().unwrap(), "Add a TXT record to example.com");

        let tangled = matched("https://tangled.org/alice/keytrace/keytrace.json");
        let text = tangled
            .primary_match()
            .unwrap()
            .proof_text("did:plc:test", "3kabc", tangled.uri())
            .unwrap();
        assert!(text.contains("\"keytrace\": \"3kabc\""));
    }
}
