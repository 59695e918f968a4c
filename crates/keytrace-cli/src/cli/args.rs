use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "keytrace",
    version,
    about = "Verify identity claims linking a DID to external accounts"
)]
pub struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Verify every claim published by a DID or handle
    Verify(VerifyArgs),
    /// Show which providers and recipes accept a claim URI
    Match(MatchArgs),
    /// List providers and recipes
    Providers(ProvidersArgs),
    /// Run recipe files
    Recipe(RecipeArgs),
    /// Daily signing keys
    Keys(KeysArgs),
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// DID or handle whose claims to verify
    pub subject: String,

    /// Trusted signer handle (repeatable; default: keytrace.dev)
    #[arg(long = "trusted-signer", value_name = "HANDLE")]
    pub trusted_signers: Vec<String>,

    /// Check signatures only, without fetching proofs
    #[arg(long)]
    pub skip_proofs: bool,

    /// Time budget per claim, in seconds
    #[arg(long, value_name = "SECS")]
    pub deadline_secs: Option<u64>,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MatchArgs {
    /// Claim URI (e.g. https://gist.github.com/alice/abc123, dns:example.com)
    pub uri: String,

    /// Claimant DID; enables proof text output
    #[arg(long)]
    pub did: Option<String>,

    /// Claim id used by recipe proof templates
    #[arg(long, default_value = "<rkey>")]
    pub claim_id: String,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ProvidersArgs {
    /// Run every provider's URI self-tests
    #[arg(long)]
    pub self_test: bool,
}

#[derive(Parser, Debug)]
pub struct RecipeArgs {
    #[command(subcommand)]
    pub cmd: RecipeSub,
}

#[derive(Subcommand, Debug)]
pub enum RecipeSub {
    /// Run a recipe file against live data
    Run(RecipeRunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RecipeRunArgs {
    /// Recipe file (.json, .yaml or .yml)
    pub file: PathBuf,

    /// Claimant DID
    #[arg(long)]
    pub did: String,

    /// Claim id bound to {claimId}
    #[arg(long)]
    pub claim_id: String,

    /// Claim URI, bound to the first recipe param whose pattern accepts it
    #[arg(long)]
    pub uri: Option<String>,

    /// Extra placeholder binding
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct KeysArgs {
    #[command(subcommand)]
    pub cmd: KeysSub,
}

#[derive(Subcommand, Debug)]
pub enum KeysSub {
    /// Get or create today's signing key
    Today(KeysTodayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct KeysTodayArgs {
    /// DID of the signing service
    #[arg(long)]
    pub signer_did: String,

    /// Key store directory (default: KEYTRACE_KEY_DIR or .data)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// PDS to publish a newly created key record to
    #[arg(long, value_name = "URL")]
    pub publish_to: Option<String>,

    /// Account identifier for publishing
    #[arg(long, requires = "publish_to")]
    pub identifier: Option<String>,

    /// App password for publishing
    #[arg(long, env = "KEYTRACE_APP_PASSWORD", hide_env_values = true)]
    pub app_password: Option<String>,

    #[arg(long)]
    pub json: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("tangledUrl=https://tangled.org/a=b").unwrap(),
            ("tangledUrl".to_string(), "https://tangled.org/a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_verify_args() {
        let cli = Cli::try_parse_from([
            "keytrace",
            "verify",
            "alice.bsky.social",
            "--trusted-signer",
            "keytrace.dev",
            "--trusted-signer",
            "npmx.dev",
            "--skip-proofs",
        ])
        .unwrap();

        match cli.cmd {
            Command::Verify(args) => {
                assert_eq!(args.trusted_signers, vec!["keytrace.dev", "npmx.dev"]);
                assert!(args.skip_proofs);
                assert!(args.deadline_secs.is_none());
            }
            _ => panic!("expected verify"),
        }
    }
}
