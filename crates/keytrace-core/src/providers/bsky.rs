//! Bluesky profiles, proven through the profile description.

use serde_json::Value;

use super::{
    default_proof_text, group, IdentityFields, MatchGroups, ProcessedUri, ProfileLink,
    ProofFormat, ProofRequest, ProofSpec, ProofTarget, Relation, SelfTest, ServiceProvider,
};
use crate::fetchers::FetcherKind;

pub(super) static PROVIDER: ServiceProvider = ServiceProvider {
    id: "bsky",
    name: "Bluesky",
    homepage: "https://bsky.app",
    uri_pattern: r"^https://bsky\.app/profile/([A-Za-z0-9.:-]+)/?$",
    is_ambiguous: false,
    process_uri,
    postprocess,
    proof_text: default_proof_text,
    proof_location,
    self_tests: &[
        SelfTest { uri: "https://bsky.app/profile/alice.bsky.social", should_match: true },
        SelfTest { uri: "https://bsky.app/profile/did:plc:abc123/", should_match: true },
        SelfTest { uri: "https://bsky.app/profile/alice.bsky.social/post/3k", should_match: false },
        SelfTest { uri: "https://bsky.app/alice", should_match: false },
    ],
};

fn process_uri(_uri: &str, groups: &MatchGroups) -> ProcessedUri {
    let actor = group(groups, 1);

    ProcessedUri {
        profile: ProfileLink {
            display: format!("@{actor}"),
            uri: format!("https://bsky.app/profile/{actor}"),
            qrcode: true,
        },
        proof: ProofSpec {
            request: ProofRequest {
                uri: format!(
                    "https://public.api.bsky.app/xrpc/app.bsky.actor.getProfile?actor={actor}"
                ),
                fetcher: FetcherKind::Http,
                format: ProofFormat::Json,
            },
            targets: vec![ProofTarget::new(&["description"], Relation::Contains)],
        },
    }
}

fn postprocess(data: &Value, groups: &MatchGroups) -> IdentityFields {
    let handle = data
        .get("handle")
        .and_then(Value::as_str)
        .unwrap_or_else(|| group(groups, 1));

    IdentityFields {
        subject: handle.to_string(),
        profile_url: Some(format!("https://bsky.app/profile/{handle}")),
        display_name: data.get("displayName").and_then(Value::as_str).map(String::from),
        avatar_url: data.get("avatar").and_then(Value::as_str).map(String::from),
    }
}

fn proof_location(_groups: &MatchGroups) -> String {
    "Add the proof to your Bluesky profile description".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderRegistry;

    #[test]
    fn test_process_uri() {
        let uri = "https://bsky.app/profile/alice.bsky.social";
        let groups = ProviderRegistry::builtin().captures("bsky", uri).unwrap();
        let result = (PROVIDER.process_uri)(uri, &groups);
        assert_eq!(result.profile.display, "@alice.bsky.social");
        assert!(result
            .proof
            .request
            .uri
            .ends_with("getProfile?actor=alice.bsky.social"));
        assert_eq!(result.proof.targets[0].path, vec!["description".to_string()]);
    }
}
