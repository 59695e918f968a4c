//! ActivityPub accounts (Mastodon and compatible servers).
//!
//! The proof lives in the actor document's bio or profile metadata. Many
//! users share one instance, so a match here is weaker evidence.

use serde_json::Value;

use super::{
    default_proof_text, group, IdentityFields, MatchGroups, ProcessedUri, ProfileLink,
    ProofFormat, ProofRequest, ProofSpec, ProofTarget, Relation, SelfTest, ServiceProvider,
};
use crate::fetchers::FetcherKind;

pub(super) static PROVIDER: ServiceProvider = ServiceProvider {
    id: "activitypub",
    name: "ActivityPub",
    homepage: "https://www.w3.org/TR/activitypub/",
    uri_pattern: r"^https://((?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,})/@([A-Za-z0-9_]+)/?$",
    is_ambiguous: true,
    process_uri,
    postprocess,
    proof_text: default_proof_text,
    proof_location,
    self_tests: &[
        SelfTest { uri: "https://mastodon.social/@alice", should_match: true },
        SelfTest { uri: "https://fosstodon.org/@bob_42/", should_match: true },
        SelfTest { uri: "https://mastodon.social/@alice/1234", should_match: false },
        SelfTest { uri: "https://mastodon.social/alice", should_match: false },
    ],
};

fn process_uri(uri: &str, groups: &MatchGroups) -> ProcessedUri {
    let instance = group(groups, 1);
    let username = group(groups, 2);

    ProcessedUri {
        profile: ProfileLink {
            display: format!("@{username}@{instance}"),
            uri: uri.trim_end_matches('/').to_string(),
            qrcode: true,
        },
        proof: ProofSpec {
            request: ProofRequest {
                uri: format!("https://{instance}/users/{username}"),
                fetcher: FetcherKind::Http,
                format: ProofFormat::Json,
            },
            targets: vec![
                ProofTarget::new(&["summary"], Relation::Contains),
                ProofTarget::new(&["attachment", "value"], Relation::Contains),
            ],
        },
    }
}

fn postprocess(data: &Value, groups: &MatchGroups) -> IdentityFields {
    let instance = group(groups, 1);
    let username = data
        .get("preferredUsername")
        .and_then(Value::as_str)
        .unwrap_or_else(|| group(groups, 2));

    IdentityFields {
        subject: format!("@{username}@{instance}"),
        profile_url: data.get("url").and_then(Value::as_str).map(String::from),
        display_name: data.get("name").and_then(Value::as_str).map(String::from),
        avatar_url: data
            .pointer("/icon/url")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn proof_location(groups: &MatchGroups) -> String {
    format!(
        "Add the proof to your bio or a profile field on {}",
        group(groups, 1)
    )
}
