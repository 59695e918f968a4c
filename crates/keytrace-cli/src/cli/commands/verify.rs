use std::time::Duration;

use keytrace_core::{
    is_valid_did, ClaimVerificationResult, ClaimVerifier, KeytraceConfig, VerifiedClaim,
    VerifyOptions,
};

use crate::cli::args::VerifyArgs;
use crate::exit_codes::{NOT_VERIFIED, SUCCESS};

pub async fn run(args: VerifyArgs) -> anyhow::Result<i32> {
    let config = KeytraceConfig::from_env();
    let trusted = if args.trusted_signers.is_empty() {
        config.trusted_signers.clone()
    } else {
        args.trusted_signers.clone()
    };

    let mut options = VerifyOptions::default()
        .with_trusted_signers(trusted)
        .with_check_proofs(!args.skip_proofs)
        .with_fetch_timeout(config.fetch_timeout());
    if let Some(secs) = args.deadline_secs {
        options = options.with_deadline(Duration::from_secs(secs));
    }

    let verifier = ClaimVerifier::from_config(&config)?;
    let subject = args.subject.trim().trim_start_matches('@');

    let result = if is_valid_did(subject) {
        let result = verifier.claims_for_did(subject, &options).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("{}", result.did);
            print_claims(&result);
        }
        result
    } else {
        let found = verifier.claims_for_handle(subject, &options).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&found)?);
        } else {
            match found.profile.as_ref().and_then(|p| p.display_name.as_deref()) {
                Some(name) => println!("@{} ({}) {}", found.handle, name, found.result.did),
                None => println!("@{} {}", found.handle, found.result.did),
            }
            print_claims(&found.result);
        }
        found.result
    };

    Ok(if result.all_verified() { SUCCESS } else { NOT_VERIFIED })
}

fn print_claims(result: &ClaimVerificationResult) {
    for claim in &result.claims {
        println!("{}", claim_line(claim));
        if let Some(error) = &claim.error {
            println!("      {error}");
        }
    }
    let summary = result.summary;
    println!(
        "{} claims: {} verified, {} failed",
        summary.total, summary.verified, summary.failed
    );
}

fn claim_line(claim: &VerifiedClaim) -> String {
    let mark = if claim.verified { "PASS" } else { "FAIL" };
    let uri = claim.claim.as_ref().map_or(claim.record_uri.as_str(), |c| c.uri());
    let kind = claim.claim_type.as_deref().unwrap_or("?");
    format!("  {mark} {kind:<12} {uri} [{}]", claim.status())
}
