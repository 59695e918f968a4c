//! DNS domains, proven through a TXT record.

use serde_json::Value;

use super::{
    group, IdentityFields, MatchGroups, ProcessedUri, ProfileLink, ProofFormat, ProofRequest,
    ProofSpec, ProofTarget, Relation, SelfTest, ServiceProvider,
};
use crate::fetchers::FetcherKind;

pub(super) static PROVIDER: ServiceProvider = ServiceProvider {
    id: "dns",
    name: "DNS",
    homepage: "https://en.wikipedia.org/wiki/TXT_record",
    uri_pattern: r"^dns:((?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63})\.?$",
    is_ambiguous: false,
    process_uri,
    postprocess,
    proof_text,
    proof_location,
    self_tests: &[
        SelfTest { uri: "dns:example.com", should_match: true },
        SelfTest { uri: "dns:sub.example.com", should_match: true },
        SelfTest { uri: "dns:localhost", should_match: false },
        SelfTest { uri: "https://example.com", should_match: false },
        SelfTest { uri: "dns:exa mple.com", should_match: false },
    ],
};

fn process_uri(_uri: &str, groups: &MatchGroups) -> ProcessedUri {
    let domain = group(groups, 1);

    ProcessedUri {
        profile: ProfileLink {
            display: domain.to_string(),
            uri: format!("https://{domain}"),
            qrcode: false,
        },
        proof: ProofSpec {
            request: ProofRequest {
                uri: domain.to_string(),
                fetcher: FetcherKind::Dns,
                format: ProofFormat::Json,
            },
            targets: vec![ProofTarget::new(&["records", "txt"], Relation::Equals)],
        },
    }
}

fn postprocess(_data: &Value, groups: &MatchGroups) -> IdentityFields {
    let domain = group(groups, 1);
    IdentityFields {
        subject: domain.to_string(),
        profile_url: Some(format!("https://{domain}")),
        ..Default::default()
    }
}

fn proof_text(did: &str) -> String {
    format!("keytrace-verification={did}")
}

fn proof_location(groups: &MatchGroups) -> String {
    format!("Add a TXT record to {}", group(groups, 1))
}
