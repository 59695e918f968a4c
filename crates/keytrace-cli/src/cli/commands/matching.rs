use keytrace_core::{Claim, ClaimStatus, KeytraceError};
use serde::Serialize;

use crate::cli::args::MatchArgs;
use crate::exit_codes::SUCCESS;

/// Stand-in owner when no `--did` is given; proof text is then omitted.
const PREVIEW_DID: &str = "did:plc:preview";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchReport {
    uri: String,
    ambiguity: keytrace_core::Ambiguity,
    matches: Vec<MatchEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchEntry {
    id: String,
    is_ambiguous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    proof_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proof_location: Option<String>,
}

pub fn run(args: MatchArgs) -> anyhow::Result<i32> {
    let did = args.did.as_deref().unwrap_or(PREVIEW_DID);
    let mut claim = Claim::new(&args.uri, did)?;
    claim.match_builtin()?;

    if claim.status() == ClaimStatus::Error {
        return Err(KeytraceError::NoProviderMatch { uri: args.uri }.into());
    }

    let report = MatchReport {
        uri: args.uri.clone(),
        ambiguity: claim.ambiguity(),
        matches: claim
            .matches()
            .iter()
            .map(|m| MatchEntry {
                id: m.source.id().to_string(),
                is_ambiguous: m.is_ambiguous,
                proof_text: args
                    .did
                    .as_deref()
                    .and_then(|did| m.proof_text(did, &args.claim_id, &args.uri)),
                proof_location: m.proof_location(),
            })
            .collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(SUCCESS);
    }

    let ambiguity = serde_json::to_value(report.ambiguity)?;
    println!(
        "{} (ambiguity: {})",
        report.uri,
        ambiguity.as_str().unwrap_or_default()
    );
    for entry in &report.matches {
        let flag = if entry.is_ambiguous { " (ambiguous)" } else { "" };
        println!("  {}{flag}", entry.id);
        if let Some(location) = &entry.proof_location {
            println!("    where: {location}");
        }
        if let Some(text) = &entry.proof_text {
            println!("    proof: {text}");
        }
    }
    Ok(SUCCESS)
}
