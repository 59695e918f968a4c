//! GitHub gists.
//!
//! The proof is a public gist whose `proof.md` file or description carries
//! the proof text.

use serde_json::Value;

use super::{
    default_proof_text, group, IdentityFields, MatchGroups, ProcessedUri, ProfileLink,
    ProofFormat, ProofRequest, ProofSpec, ProofTarget, Relation, SelfTest, ServiceProvider,
};
use crate::fetchers::FetcherKind;

pub(super) static PROVIDER: ServiceProvider = ServiceProvider {
    id: "github",
    name: "GitHub",
    homepage: "https://github.com",
    uri_pattern: r"^https://gist\.github\.com/([A-Za-z0-9](?:[A-Za-z0-9-]{0,38}))/([A-Za-z0-9]+)/?$",
    is_ambiguous: false,
    process_uri,
    postprocess,
    proof_text: default_proof_text,
    proof_location,
    self_tests: &[
        SelfTest { uri: "https://gist.github.com/alice/abc123def456", should_match: true },
        SelfTest { uri: "https://gist.github.com/alice/abc123def456/", should_match: true },
        SelfTest { uri: "https://gist.github.com/alice", should_match: false },
        SelfTest { uri: "https://github.com/alice/abc123", should_match: false },
        SelfTest { uri: "https://gist.github.com.evil.com/alice/abc", should_match: false },
    ],
};

fn process_uri(_uri: &str, groups: &MatchGroups) -> ProcessedUri {
    let username = group(groups, 1);
    let gist_id = group(groups, 2);

    ProcessedUri {
        profile: ProfileLink {
            display: format!("@{username}"),
            uri: format!("https://github.com/{username}"),
            qrcode: true,
        },
        proof: ProofSpec {
            request: ProofRequest {
                uri: format!("https://api.github.com/gists/{gist_id}"),
                fetcher: FetcherKind::Http,
                format: ProofFormat::Json,
            },
            targets: vec![
                ProofTarget::new(&["files", "proof.md", "content"], Relation::Contains),
                ProofTarget::new(&["description"], Relation::Contains),
            ],
        },
    }
}

fn postprocess(data: &Value, groups: &MatchGroups) -> IdentityFields {
    let owner = data.get("owner");
    let login = owner
        .and_then(|o| o.get("login"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| group(groups, 1));

    IdentityFields {
        subject: login.to_string(),
        profile_url: Some(format!("https://github.com/{login}")),
        display_name: None,
        avatar_url: owner
            .and_then(|o| o.get("avatar_url"))
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn proof_location(groups: &MatchGroups) -> String {
    format!(
        "Create a public gist as {} containing a proof.md file",
        group(groups, 1)
    )
}
