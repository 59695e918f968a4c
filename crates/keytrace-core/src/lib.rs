//! Identity claim verification for keytrace.
//!
//! A claim links a decentralized identifier (DID) to an account on an
//! external service. This crate covers the full path from a claim record to
//! a verdict:
//!
//! - Matching claim URIs against service providers and declarative recipes
//! - Fetching proofs over HTTP and DNS with per-fetch timeouts
//! - Canonical attestation payloads and JWS verification (ES256, EdDSA)
//! - Trusted signer resolution and per-day signing key management
//! - Batch verification with an ordered step log per claim
//!
//! # Quick Start
//!
//! ```no_run
//! use keytrace_core::{ClaimVerifier, KeytraceConfig, VerifyOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = KeytraceConfig::from_env();
//! let verifier = ClaimVerifier::from_config(&config)?;
//!
//! let options = VerifyOptions::default().with_trusted_signers(config.trusted_signers.clone());
//! let result = verifier.claims_for_handle("alice.bsky.social", &options).await?;
//! println!("{}/{} claims verified", result.result.summary.verified, result.result.summary.total);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `KEYTRACE_PUBLIC_API_URL` | AppView base URL (default: `https://public.api.bsky.app`) |
//! | `KEYTRACE_PLC_DIRECTORY` | PLC directory (default: `https://plc.directory`) |
//! | `KEYTRACE_DOH_URL` | DNS-over-HTTPS endpoint (default: Cloudflare) |
//! | `KEYTRACE_FETCH_TIMEOUT_MS` | Proof fetch timeout (default: 5000) |
//! | `KEYTRACE_TRUSTED_SIGNERS` | Comma separated trusted handles (default: `keytrace.dev`) |

pub mod atproto;
pub mod canonical;
pub mod claim;
pub mod config;
pub mod did;
pub mod error;
pub mod fetchers;
pub mod keys;
pub mod proof;
pub mod providers;
pub mod recipe;
pub mod signature;
pub mod trust;
pub mod types;
pub mod verify;

// Re-export main types
pub use atproto::{HandleResolver, ProfileLookup, RecordSource, XrpcClient, XrpcKeyPublisher};
pub use canonical::{attestation_data, canonical_payload, ATTESTATION_FIELDS, DEFAULT_SIGNED_FIELDS};
pub use claim::{Ambiguity, Claim, ClaimStatus, MatchSource, ServiceProviderMatch};
pub use config::KeytraceConfig;
pub use did::{is_valid_did, is_valid_handle, validate_did, AtUri};
pub use error::{KeytraceError, KeytraceResult};
pub use fetchers::{
    DnsFetcher, DohResolver, FetchOptions, Fetcher, FetcherKind, FetcherSet, HttpFetcher,
    ProofDocument, TxtLookupError, TxtResolver,
};
pub use keys::{
    BlobStore, Clock, DailyKey, DailyKeyManager, FsBlobStore, KeyPublisher, MemoryBlobStore,
    SystemClock,
};
pub use providers::{ProviderRegistry, ServiceProvider};
pub use recipe::{Bindings, Recipe, RecipeBook, RecipeRun, RecipeRunner, RecipeStep};
pub use signature::{sign_attestation, verify_attestation, KeyAlgorithm, PublicKeyMaterial};
pub use trust::{ResolvedTrust, TrustedSigners, DEFAULT_TRUSTED_SIGNER};
pub use types::{
    ClaimIdentity, ClaimRecord, DisplayProfile, KeyRecord, ListedRecord, SignatureRecord,
    CLAIM_COLLECTION, KEY_COLLECTION,
};
pub use verify::{
    ClaimVerificationResult, ClaimVerifier, HandleVerificationResult, Summary, VerificationStep,
    VerifiedClaim, VerifyOptions,
};
