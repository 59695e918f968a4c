//! Canonical attestation payloads.
//!
//! The signed bytes are a JSON object holding exactly the signed fields, in
//! the order the signature lists them, each value serialized with RFC 8785
//! (JCS) rules and no whitespace. Signer and verifier both build the payload
//! here and nowhere else.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{KeytraceError, KeytraceResult};
use crate::types::ClaimRecord;

/// Field names an attestation may cover.
pub const ATTESTATION_FIELDS: &[&str] = &[
    "did",
    "type",
    "claimUri",
    "subject",
    "displayName",
    "profileUrl",
    "avatarUrl",
    "createdAt",
    "nonce",
    "verifiedAt",
    "signedAt",
];

/// Fields signed by default when issuing an attestation.
pub const DEFAULT_SIGNED_FIELDS: &[&str] =
    &["did", "type", "claimUri", "subject", "createdAt", "verifiedAt"];

/// Timestamp format used inside payloads.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The attestable view of a claim owned by `did`, signed at `signed_at`.
///
/// Optional record fields that are absent stay absent, so a signature
/// covering them fails to reconstruct.
pub fn attestation_data(did: &str, record: &ClaimRecord, signed_at: DateTime<Utc>) -> Map<String, Value> {
    let mut data = Map::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            data.insert(key.to_string(), Value::String(value.to_string()));
        }
    };

    let signed_at = format_timestamp(signed_at);
    put("did", Some(did));
    put("type", Some(&record.claim_type));
    put("claimUri", Some(&record.claim_uri));
    put("subject", Some(&record.identity.subject));
    put("displayName", record.identity.display_name.as_deref());
    put("profileUrl", record.identity.profile_url.as_deref());
    put("avatarUrl", record.identity.avatar_url.as_deref());
    put("createdAt", Some(&record.created_at).filter(|s| !s.is_empty()).map(String::as_str));
    put("nonce", record.nonce.as_deref());
    put("verifiedAt", Some(&signed_at));
    put("signedAt", Some(&signed_at));
    data
}

/// Serialize `signed_fields` of `data` canonically.
pub fn canonical_payload(data: &Map<String, Value>, signed_fields: &[String]) -> KeytraceResult<Vec<u8>> {
    if signed_fields.is_empty() {
        return Err(KeytraceError::signature("no signed fields"));
    }

    let mut out = Vec::with_capacity(256);
    out.push(b'{');
    for (i, name) in signed_fields.iter().enumerate() {
        if !ATTESTATION_FIELDS.contains(&name.as_str()) {
            return Err(KeytraceError::signature(format!("unknown signed field {name:?}")));
        }
        if signed_fields[..i].contains(name) {
            return Err(KeytraceError::signature(format!("signed field {name:?} listed twice")));
        }
        let value = data
            .get(name)
            .ok_or_else(|| KeytraceError::signature(format!("signed field {name:?} is absent from the claim")))?;

        if i > 0 {
            out.push(b',');
        }
        out.extend(jcs(&Value::String(name.clone()))?);
        out.push(b':');
        out.extend(jcs(value)?);
    }
    out.push(b'}');
    Ok(out)
}

fn jcs(value: &Value) -> KeytraceResult<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|e| KeytraceError::signature(format!("canonicalization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClaimIdentity;

    fn record() -> ClaimRecord {
        ClaimRecord {
            record_type: Some("dev.keytrace.claim".to_string()),
            claim_type: "github".to_string(),
            claim_uri: "https://gist.github.com/alice/abc123".to_string(),
            identity: ClaimIdentity {
                subject: "alice".to_string(),
                display_name: Some("Alice \u{e9}".to_string()),
                ..Default::default()
            },
            sig: None,
            sigs: Vec::new(),
            comment: Some("not signed".to_string()),
            status: None,
            created_at: "2026-01-15T11:59:00.000Z".to_string(),
            nonce: None,
            retracted_at: None,
        }
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn signed_at() -> DateTime<Utc> {
        "2026-01-15T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_payload_follows_declared_order() {
        let data = attestation_data("did:plc:alice", &record(), signed_at());
        let payload = canonical_payload(&data, &fields(&["subject", "did", "signedAt"])).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"subject":"alice","did":"did:plc:alice","signedAt":"2026-01-15T12:00:00.000Z"}"#
        );
    }

    #[test]
    fn test_extra_record_fields_do_not_change_payload() {
        let mut changed = record();
        changed.comment = Some("edited later".to_string());
        changed.status = Some("verified".to_string());

        let names = fields(DEFAULT_SIGNED_FIELDS);
        let a = canonical_payload(&attestation_data("did:plc:alice", &record(), signed_at()), &names);
        let b = canonical_payload(&attestation_data("did:plc:alice", &changed, signed_at()), &names);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn test_non_ascii_is_not_escaped() {
        let data = attestation_data("did:plc:alice", &record(), signed_at());
        let payload = canonical_payload(&data, &fields(&["displayName"])).unwrap();
        assert_eq!(String::from_utf8(payload).unwrap(), "{\"displayName\":\"Alice \u{e9}\"}");
    }

    #[test]
    fn test_rejects_bad_field_lists() {
        let data = attestation_data("did:plc:alice", &record(), signed_at());
        assert!(canonical_payload(&data, &[]).is_err());
        assert!(canonical_payload(&data, &fields(&["comment"])).is_err());
        assert!(canonical_payload(&data, &fields(&["did", "did"])).is_err());
        // nonce is attestable but absent on this record
        assert!(canonical_payload(&data, &fields(&["nonce"])).is_err());
    }
}
