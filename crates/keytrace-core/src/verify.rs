//! Claim verification orchestration.
//!
//! Each claim record runs through an ordered step log:
//!
//! 1. `parse_record`
//! 2. `check_retraction`
//! 3. `check_signature_fields`
//! 4. `validate_signer`
//! 5. `match_claim`
//! 6. `fetch_proof` and `check_proof` for providers, or the recipe's steps
//! 7. `verify_signature`
//!
//! The first failing step ends the claim. Trust is settled before any key
//! material is fetched.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::atproto::{HandleResolver, ProfileLookup, RecordSource, XrpcClient};
use crate::canonical::{attestation_data, canonical_payload};
use crate::claim::{Ambiguity, Claim, ClaimStatus, MatchSource, ServiceProviderMatch};
use crate::config::KeytraceConfig;
use crate::did::{validate_did, AtUri};
use crate::error::{KeytraceError, KeytraceResult};
use crate::fetchers::{FetchOptions, FetcherSet};
use crate::proof::check_targets;
use crate::providers::{IdentityFields, ProviderRegistry, ServiceProvider};
use crate::recipe::{RecipeBook, RecipeRunner};
use crate::signature::{verify_attestation, PublicKeyMaterial};
use crate::trust::{ResolvedTrust, TrustedSigners};
use crate::types::{
    ClaimIdentity, ClaimRecord, DisplayProfile, KeyRecord, ListedRecord, SignatureRecord,
    KEY_COLLECTION,
};

/// One entry of a claim's step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationStep {
    pub step: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VerificationStep {
    pub fn passed(step: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            step: step.into(),
            success: true,
            detail,
        }
    }

    pub fn failed(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Options for a verification batch.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub trusted_signers: TrustedSigners,
    /// Fetch and check proofs; when off only signatures are checked.
    pub check_proofs: bool,
    /// Budget for each claim, measured from the start of the batch.
    pub deadline: Option<Duration>,
    pub fetch_timeout: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            trusted_signers: TrustedSigners::default(),
            check_proofs: true,
            deadline: None,
            fetch_timeout: FetchOptions::default().timeout,
        }
    }
}

impl VerifyOptions {
    pub fn with_trusted_signers<I, S>(mut self, handles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_signers = TrustedSigners::new(handles);
        self
    }

    pub fn with_check_proofs(mut self, check: bool) -> Self {
        self.check_proofs = check;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Verification outcome of one claim record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedClaim {
    /// AT URI of the claim record.
    pub record_uri: String,
    pub rkey: String,
    #[serde(flatten)]
    pub claim: Option<Claim>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub claim_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<ClaimIdentity>,
    /// Identity read from the fetched proof.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_identity: Option<IdentityFields>,
    pub verified: bool,
    pub ambiguity: Ambiguity,
    pub steps: Vec<VerificationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifiedClaim {
    fn new(listed: &ListedRecord) -> Self {
        Self {
            record_uri: listed.uri.clone(),
            rkey: listed.record_key().to_string(),
            claim: None,
            claim_type: None,
            identity: None,
            proof_identity: None,
            verified: false,
            ambiguity: Ambiguity::None,
            steps: Vec::new(),
            error: None,
        }
    }

    /// Claim status; `INIT` when the record never parsed.
    pub fn status(&self) -> ClaimStatus {
        self.claim.as_ref().map_or(ClaimStatus::Init, Claim::status)
    }

    /// The named step, if it ran.
    pub fn step(&self, name: &str) -> Option<&VerificationStep> {
        self.steps.iter().find(|s| s.step == name)
    }

    /// Log `result` as step `name` and pass the value through.
    fn record<T>(&mut self, name: &str, result: KeytraceResult<(T, Option<String>)>) -> KeytraceResult<T> {
        match result {
            Ok((value, detail)) => {
                self.steps.push(VerificationStep::passed(name, detail));
                Ok(value)
            }
            Err(e) => {
                self.steps.push(VerificationStep::failed(name, e.to_string()));
                Err(e)
            }
        }
    }

    fn finish(&mut self, outcome: Result<(), String>, unknown: bool) {
        match outcome {
            Ok(()) => {
                self.verified = true;
                self.set_status(ClaimStatus::Verified);
            }
            Err(message) => {
                let status = match self.status() {
                    ClaimStatus::Matched if unknown => ClaimStatus::Error,
                    ClaimStatus::Matched | ClaimStatus::Init => ClaimStatus::Failed,
                    other => other,
                };
                self.set_status(status);
                if let Some(claim) = self.claim.as_mut() {
                    claim.push_error(message.clone());
                }
                self.error = Some(message);
            }
        }
    }

    fn set_status(&mut self, to: ClaimStatus) {
        if let Some(claim) = self.claim.as_mut() {
            if claim.status() != to {
                if let Err(e) = claim.transition(to) {
                    debug!(error = %e, "claim status unchanged");
                }
            }
        }
    }
}

/// Aggregate counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub verified: usize,
    pub failed: usize,
}

impl Summary {
    fn of(claims: &[VerifiedClaim]) -> Self {
        let verified = claims.iter().filter(|c| c.verified).count();
        Self {
            total: claims.len(),
            verified,
            failed: claims.len() - verified,
        }
    }
}

/// Verification of every claim of one DID.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimVerificationResult {
    pub did: String,
    pub claims: Vec<VerifiedClaim>,
    pub summary: Summary,
}

impl ClaimVerificationResult {
    pub fn all_verified(&self) -> bool {
        self.summary.failed == 0
    }
}

/// Verification of a handle's claims.
#[derive(Debug, Clone, Serialize)]
pub struct HandleVerificationResult {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<DisplayProfile>,
    #[serde(flatten)]
    pub result: ClaimVerificationResult,
}

/// Runs claim verification against injected collaborators.
pub struct ClaimVerifier {
    resolver: Arc<dyn HandleResolver>,
    records: Arc<dyn RecordSource>,
    profiles: Option<Arc<dyn ProfileLookup>>,
    providers: &'static ProviderRegistry,
    recipes: RecipeBook,
    fetchers: FetcherSet,
}

impl std::fmt::Debug for ClaimVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimVerifier")
            .field("recipes", &self.recipes.recipes().len())
            .field("fetchers", &self.fetchers)
            .finish_non_exhaustive()
    }
}

impl ClaimVerifier {
    /// A verifier with the built-in providers and recipes and no fetchers.
    pub fn new(resolver: Arc<dyn HandleResolver>, records: Arc<dyn RecordSource>) -> Self {
        Self {
            resolver,
            records,
            profiles: None,
            providers: ProviderRegistry::builtin(),
            recipes: RecipeBook::builtin().clone(),
            fetchers: FetcherSet::new(),
        }
    }

    /// A verifier talking to the public network.
    pub fn from_config(config: &KeytraceConfig) -> KeytraceResult<Self> {
        let client = Arc::new(XrpcClient::new(config)?);
        Ok(Self::new(client.clone(), client.clone())
            .with_profiles(client)
            .with_fetchers(FetcherSet::from_config(config)?))
    }

    pub fn with_fetchers(mut self, fetchers: FetcherSet) -> Self {
        self.fetchers = fetchers;
        self
    }

    pub fn with_recipes(mut self, recipes: RecipeBook) -> Self {
        self.recipes = recipes;
        self
    }

    pub fn with_providers(mut self, providers: &'static ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Verify every claim in the repository of `did`.
    pub async fn claims_for_did(
        &self,
        did: &str,
        options: &VerifyOptions,
    ) -> KeytraceResult<ClaimVerificationResult> {
        validate_did(did)?;
        let started = Instant::now();

        let (trust, records) = futures::join!(
            options.trusted_signers.resolve(self.resolver.as_ref()),
            self.records.list_claim_records(did)
        );
        let records = records?;
        debug!(did, records = records.len(), trusted = trust.dids().count(), "verifying claims");

        let deadline = options.deadline.map(|budget| started + budget);
        let claims = join_all(
            records
                .iter()
                .map(|listed| self.verify_with_deadline(did, listed, &trust, options, deadline)),
        )
        .await;

        let summary = Summary::of(&claims);
        info!(
            did,
            total = summary.total,
            verified = summary.verified,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "claims verified"
        );

        Ok(ClaimVerificationResult {
            did: did.to_string(),
            claims,
            summary,
        })
    }

    /// Resolve `handle` and verify its claims.
    pub async fn claims_for_handle(
        &self,
        handle: &str,
        options: &VerifyOptions,
    ) -> KeytraceResult<HandleVerificationResult> {
        let handle = handle.trim().trim_start_matches('@');
        let did = self.resolver.resolve_handle(handle).await?;

        let (result, profile) = futures::join!(
            self.claims_for_did(&did, options),
            self.display_profile(&did)
        );

        Ok(HandleVerificationResult {
            handle: handle.to_string(),
            profile,
            result: result?,
        })
    }

    /// Enrichment only: failures are logged and dropped.
    async fn display_profile(&self, did: &str) -> Option<DisplayProfile> {
        let profiles = self.profiles.as_ref()?;
        match profiles.get_profile(did).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(did, error = %e, "profile lookup failed");
                None
            }
        }
    }

    async fn verify_with_deadline(
        &self,
        did: &str,
        listed: &ListedRecord,
        trust: &ResolvedTrust,
        options: &VerifyOptions,
        deadline: Option<Instant>,
    ) -> VerifiedClaim {
        let mut out = VerifiedClaim::new(listed);

        let outcome = match deadline {
            Some(at) => {
                match tokio::time::timeout_at(at, self.run_steps(did, listed, trust, options, &mut out)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let budget = options.deadline.unwrap_or_default();
                        out.steps.push(VerificationStep::failed(
                            "deadline",
                            format!("verification exceeded {budget:?}"),
                        ));
                        Err(KeytraceError::FetchTimeout {
                            target: listed.uri.clone(),
                            timeout: budget,
                        })
                    }
                }
            }
            None => self.run_steps(did, listed, trust, options, &mut out).await,
        };

        let unknown = outcome.as_ref().err().is_some_and(|e| {
            e.is_retryable() || matches!(e, KeytraceError::FetcherUnavailable { .. })
        });
        if let Err(e) = &outcome {
            debug!(record = %listed.uri, error = %e, "claim failed verification");
        }
        out.finish(outcome.map_err(|e| e.to_string()), unknown);
        out
    }

    async fn run_steps(
        &self,
        did: &str,
        listed: &ListedRecord,
        trust: &ResolvedTrust,
        options: &VerifyOptions,
        out: &mut VerifiedClaim,
    ) -> KeytraceResult<()> {
        let record = out.record("parse_record", parse_record(did, listed))?;
        out.claim_type = Some(record.claim_type.clone());
        out.identity = Some(record.identity.clone());
        out.claim = Some(Claim::new(&record.claim_uri, did)?);

        let sig = out.record("check_retraction", check_retraction(&record, trust))?;
        out.record("check_signature_fields", check_signature_fields(&sig))?;
        let signer = out.record("validate_signer", validate_signer(&sig, trust))?;

        let matched = self.match_claim(out);
        let primary = out.record("match_claim", matched)?;
        if options.check_proofs {
            self.check_proof(did, listed, &record, &primary, options, out).await?;
        }

        let result = self.verify_signature(did, &record, &sig, &signer).await;
        out.record("verify_signature", result)?;
        Ok(())
    }

    fn match_claim(
        &self,
        out: &mut VerifiedClaim,
    ) -> KeytraceResult<(ServiceProviderMatch, Option<String>)> {
        let claim = out
            .claim
            .as_mut()
            .ok_or_else(|| KeytraceError::malformed("claim record was not parsed"))?;
        claim.match_with(self.providers, &self.recipes)?;

        let primary = claim.primary_match().cloned().ok_or_else(|| KeytraceError::NoProviderMatch {
            uri: claim.uri().to_string(),
        })?;
        let ambiguity = claim.ambiguity();
        let ids: Vec<&str> = claim.matches().iter().map(|m| m.source.id()).collect();
        let detail = match ambiguity {
            Ambiguity::None => ids.join(", "),
            other => format!("{} ({other:?})", ids.join(", ")),
        };
        out.ambiguity = ambiguity;
        Ok((primary, Some(detail)))
    }

    async fn check_proof(
        &self,
        did: &str,
        listed: &ListedRecord,
        record: &ClaimRecord,
        primary: &ServiceProviderMatch,
        options: &VerifyOptions,
        out: &mut VerifiedClaim,
    ) -> KeytraceResult<()> {
        let fetch = FetchOptions {
            timeout: options.fetch_timeout,
        };

        match &primary.source {
            MatchSource::Provider(provider) => {
                self.check_provider_proof(did, provider, &primary.captures, &record.claim_uri, &fetch, out)
                    .await
            }
            MatchSource::Recipe(recipe) => {
                let claim_id = record.nonce.as_deref().unwrap_or_else(|| listed.record_key());
                let bindings = recipe.bindings_for(claim_id, did, &record.claim_uri);
                let run = RecipeRunner::new(self.fetchers.clone(), fetch)
                    .run(recipe, &bindings)
                    .await;
                out.steps.extend(run.steps);
                match run.failure {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    async fn check_provider_proof(
        &self,
        did: &str,
        provider: &ServiceProvider,
        captures: &[String],
        uri: &str,
        fetch: &FetchOptions,
        out: &mut VerifiedClaim,
    ) -> KeytraceResult<()> {
        let processed = (provider.process_uri)(uri, captures);
        let request = &processed.proof.request;

        let fetched = self.fetchers.fetch(request, fetch).await.and_then(|doc| {
            doc.ok_or_else(|| KeytraceError::NotFound {
                what: format!("proof at {}", request.uri),
            })
        });
        let doc = out.record("fetch_proof", fetched.map(|doc| (doc, Some(request.uri.clone()))))?;

        let proof_text = (provider.proof_text)(did);
        let checked = check_targets(&doc, &processed.proof.targets, &[proof_text.as_str(), did]);
        out.record("check_proof", checked.map(|path| ((), Some(path))))?;

        out.proof_identity = Some((provider.postprocess)(&doc.to_json(), captures));
        Ok(())
    }

    async fn verify_signature(
        &self,
        did: &str,
        record: &ClaimRecord,
        sig: &SignatureRecord,
        signer: &AtUri,
    ) -> KeytraceResult<((), Option<String>)> {
        let kid = sig.kid.as_deref().unwrap_or_default();
        if signer.collection != KEY_COLLECTION || signer.rkey != kid {
            return Err(KeytraceError::signature(format!(
                "key reference {signer} does not match kid {kid}"
            )));
        }

        let key_uri = signer.to_string();
        let value = self.records.get_record_by_uri(&key_uri).await.map_err(|e| match e {
            KeytraceError::NotFound { .. } => KeytraceError::KeyNotFound { uri: key_uri.clone() },
            other => other,
        })?;
        let key_record: KeyRecord = serde_json::from_value(value)
            .map_err(|e| KeytraceError::signature(format!("invalid key record {key_uri}: {e}")))?;

        let signed_at = sig
            .signed_at
            .ok_or_else(|| KeytraceError::MissingSignatureFields {
                fields: vec!["signedAt".to_string()],
            })?;
        if !key_record.is_valid_at(signed_at) {
            return Err(KeytraceError::KeyExpired {
                signed_at: signed_at.to_rfc3339(),
                valid_from: key_record.valid_from.to_rfc3339(),
                valid_until: key_record.valid_until.to_rfc3339(),
            });
        }

        let key = PublicKeyMaterial::from_jwk_str(&key_record.public_jwk)?;
        let signed_fields = sig.signed_fields.as_deref().unwrap_or_default();
        let payload = canonical_payload(&attestation_data(did, record, signed_at), signed_fields)?;
        verify_attestation(
            sig.attestation.as_deref().unwrap_or_default(),
            &payload,
            &key,
            Some(kid),
        )?;

        let fingerprint = key.fingerprint()?;
        debug!(key = %key_uri, fingerprint = %fingerprint, "attestation verified");
        Ok(((), Some(format!("{} {}", key.algorithm(), fingerprint))))
    }
}

fn parse_record(did: &str, listed: &ListedRecord) -> KeytraceResult<(ClaimRecord, Option<String>)> {
    let record: ClaimRecord = serde_json::from_value(listed.value.clone())
        .map_err(|e| KeytraceError::malformed(format!("invalid claim record: {e}")))?;
    Claim::new(&record.claim_uri, did)?;
    Ok((record, None))
}

/// The signer DID named by a signature's key reference.
fn signer_of(sig: &SignatureRecord) -> Option<AtUri> {
    sig.src.as_deref()?.parse().ok()
}

/// Pick the signature to verify.
///
/// The first active signature from a trusted signer wins, else the first
/// active one. A record without signatures yields an empty one so the
/// field check reports everything missing.
fn check_retraction(
    record: &ClaimRecord,
    trust: &ResolvedTrust,
) -> KeytraceResult<(SignatureRecord, Option<String>)> {
    if let Some(at) = &record.retracted_at {
        return Err(KeytraceError::signature(format!("claim was retracted at {at}")));
    }

    let active: Vec<&SignatureRecord> = record.active_signatures().collect();
    if active.is_empty() && record.signatures().next().is_some() {
        return Err(KeytraceError::signature("every signature has been retracted"));
    }

    let chosen = active
        .iter()
        .find(|sig| signer_of(sig).is_some_and(|src| trust.contains(&src.authority)))
        .or_else(|| active.first())
        .map(|sig| (*sig).clone())
        .unwrap_or_default();
    Ok((chosen, None))
}

fn check_signature_fields(sig: &SignatureRecord) -> KeytraceResult<((), Option<String>)> {
    let missing = sig.missing_fields();
    if missing.is_empty() {
        Ok(((), None))
    } else {
        Err(KeytraceError::MissingSignatureFields { fields: missing })
    }
}

fn validate_signer(sig: &SignatureRecord, trust: &ResolvedTrust) -> KeytraceResult<(AtUri, Option<String>)> {
    let src: AtUri = sig.src.as_deref().unwrap_or_default().parse()?;
    trust.check(&src.authority)?;
    let detail = trust
        .alias_of(&src.authority)
        .map_or_else(|| src.authority.clone(), |alias| format!("{} ({alias})", src.authority));
    Ok((src, Some(detail)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trust_of(did: &str) -> ResolvedTrust {
        let mut trust = ResolvedTrust::default();
        trust.insert("keytrace.dev", did);
        trust
    }

    fn sig_from(signer: &str) -> SignatureRecord {
        SignatureRecord {
            kid: Some("2026-01-15".to_string()),
            src: Some(format!("at://{signer}/dev.keytrace.key/2026-01-15")),
            signed_at: Some("2026-01-15T12:00:00Z".parse().unwrap()),
            attestation: Some("a.b.c".to_string()),
            signed_fields: Some(vec!["did".to_string()]),
            retracted_at: None,
        }
    }

    fn record_with(sigs: Vec<SignatureRecord>) -> ClaimRecord {
        serde_json::from_value(json!({
            "type": "dns",
            "claimUri": "dns:example.com",
            "identity": { "subject": "example.com" },
            "sigs": sigs,
            "createdAt": "2026-01-15T12:00:00.000Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_prefers_trusted_signature() {
        let record = record_with(vec![sig_from("did:plc:other"), sig_from("did:plc:trusted")]);
        let (chosen, _) = check_retraction(&record, &trust_of("did:plc:trusted")).unwrap();
        assert_eq!(signer_of(&chosen).unwrap().authority, "did:plc:trusted");

        let (fallback, _) = check_retraction(&record, &trust_of("did:plc:nobody")).unwrap();
        assert_eq!(signer_of(&fallback).unwrap().authority, "did:plc:other");
    }

    #[test]
    fn test_all_retracted_fails() {
        let mut sig = sig_from("did:plc:trusted");
        sig.retracted_at = Some("2026-02-01T00:00:00Z".to_string());
        let err = check_retraction(&record_with(vec![sig]), &trust_of("did:plc:trusted")).unwrap_err();
        assert!(err.to_string().contains("retracted"));
    }

    #[test]
    fn test_unsigned_record_reports_all_fields() {
        let (sig, _) = check_retraction(&record_with(vec![]), &ResolvedTrust::default()).unwrap();
        let err = check_signature_fields(&sig).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing signature fields: src, kid, attestation, signedFields, signedAt"
        );
    }

    #[test]
    fn test_validate_signer_compares_dids() {
        let sig = sig_from("did:plc:trusted");
        let (src, detail) = validate_signer(&sig, &trust_of("did:plc:trusted")).unwrap();
        assert_eq!(src.rkey, "2026-01-15");
        assert_eq!(detail.unwrap(), "did:plc:trusted (keytrace.dev)");

        let err = validate_signer(&sig_from("did:plc:evil"), &trust_of("did:plc:trusted")).unwrap_err();
        assert!(err.to_string().contains("not from a trusted signer: did:plc:evil"));
    }

    #[test]
    fn test_summary_counts() {
        let listed = ListedRecord {
            uri: "at://did:plc:a/dev.keytrace.claim/1".to_string(),
            rkey: "1".to_string(),
            value: json!({}),
        };
        let mut ok = VerifiedClaim::new(&listed);
        ok.verified = true;
        let failed = VerifiedClaim::new(&listed);

        assert_eq!(
            Summary::of(&[ok.clone(), failed, ok]),
            Summary { total: 3, verified: 2, failed: 1 }
        );
    }

    #[test]
    fn test_step_serialization_omits_empty_detail() {
        let step = VerificationStep::passed("parse_record", None);
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({ "step": "parse_record", "success": true })
        );
    }
}
