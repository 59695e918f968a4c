//! Record shapes exchanged with the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection holding identity claims.
pub const CLAIM_COLLECTION: &str = "dev.keytrace.claim";

/// Collection holding published signing keys.
pub const KEY_COLLECTION: &str = "dev.keytrace.key";

/// A record as returned by a repository listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedRecord {
    /// AT URI of the record.
    pub uri: String,

    /// Record key.
    #[serde(default)]
    pub rkey: String,

    /// Raw record value.
    pub value: serde_json::Value,
}

impl ListedRecord {
    /// Record key, falling back to the last URI segment.
    pub fn record_key(&self) -> &str {
        if self.rkey.is_empty() {
            self.uri.rsplit('/').next().unwrap_or_default()
        } else {
            &self.rkey
        }
    }
}

/// Identity data for the claimed account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimIdentity {
    /// Primary identifier (username, domain, handle).
    pub subject: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A `dev.keytrace.claim` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,

    /// Claim type (e.g. "github", "dns", "tangled").
    #[serde(rename = "type")]
    pub claim_type: String,

    /// The claimed external account URI.
    pub claim_uri: String,

    #[serde(default)]
    pub identity: ClaimIdentity,

    /// Single signature (legacy records).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<SignatureRecord>,

    /// Attestation signatures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sigs: Vec<SignatureRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default)]
    pub created_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retracted_at: Option<String>,
}

impl ClaimRecord {
    /// All signatures, `sigs` first, then the legacy `sig`.
    pub fn signatures(&self) -> impl Iterator<Item = &SignatureRecord> {
        self.sigs.iter().chain(self.sig.iter())
    }

    /// Signatures that have not been retracted.
    pub fn active_signatures(&self) -> impl Iterator<Item = &SignatureRecord> {
        self.signatures().filter(|s| s.retracted_at.is_none())
    }
}

/// A `dev.keytrace.signature` object.
///
/// Every field is optional on the wire so that missing fields surface as
/// verification failures rather than parse errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    /// Key identifier (the UTC date the key is valid for).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// AT URI of the signing key record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,

    /// Compact JWS over the canonical payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_fields: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retracted_at: Option<String>,
}

impl SignatureRecord {
    /// Names of required fields that are absent or empty.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.src.as_deref().map_or(true, str::is_empty) {
            missing.push("src".to_string());
        }
        if self.kid.as_deref().map_or(true, str::is_empty) {
            missing.push("kid".to_string());
        }
        if self.attestation.as_deref().map_or(true, str::is_empty) {
            missing.push("attestation".to_string());
        }
        if self.signed_fields.as_ref().map_or(true, Vec::is_empty) {
            missing.push("signedFields".to_string());
        }
        if self.signed_at.is_none() {
            missing.push("signedAt".to_string());
        }
        missing
    }
}

/// A `dev.keytrace.key` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,

    /// Public JWK, serialized as a JSON string.
    pub public_jwk: String,

    pub valid_from: DateTime<Utc>,

    pub valid_until: DateTime<Utc>,
}

impl KeyRecord {
    /// Whether `at` lies within `[valid_from, valid_until]`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_until
    }
}

/// Display information for a DID, used for enrichment only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayProfile {
    pub handle: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}
