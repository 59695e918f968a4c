//! Daily signing keys.
//!
//! One P-256 key per UTC date. The private key is kept as a JWK blob at
//! `keys/YYYY-MM-DD.jwk`; the public half is published as a
//! `dev.keytrace.key` record whose validity window is that whole day.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::canonical::{attestation_data, canonical_payload};
use crate::did::AtUri;
use crate::error::{KeytraceError, KeytraceResult};
use crate::signature::{sign_attestation, signing_key_from_jwk, signing_key_to_jwk, Jwk, PublicKeyMaterial};
use crate::types::{ClaimRecord, KeyRecord, SignatureRecord, KEY_COLLECTION};

/// Key-value store for private key material.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> KeytraceResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> KeytraceResult<()>;
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> KeytraceResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> KeytraceResult<()> {
        self.blobs.write().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Blob store backed by a directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> KeytraceResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(KeytraceError::Storage {
                message: format!("invalid blob key {key:?}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> KeytraceResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeytraceError::Storage {
                message: format!("failed to read {}: {}", path.display(), e),
            }),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> KeytraceResult<()> {
        let path = self.path_for(key)?;
        let storage = |e: std::io::Error| KeytraceError::Storage {
            message: format!("failed to write {}: {}", path.display(), e),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage)?;
        }

        // Atomic write: temp file + rename
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        tokio::fs::write(&tmp, bytes).await.map_err(storage)?;
        tokio::fs::rename(&tmp, &path).await.map_err(storage)?;
        Ok(())
    }
}

/// Publishes public key records.
#[async_trait]
pub trait KeyPublisher: Send + Sync {
    /// Publish `record` under record key `date`.
    async fn publish(&self, date: &str, record: &KeyRecord) -> KeytraceResult<()>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Record key for a date.
pub fn key_id(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Blob key holding the private JWK for a date.
pub fn blob_key(date: NaiveDate) -> String {
    format!("keys/{}.jwk", key_id(date))
}

/// The key record publishing `public` for `date`.
pub fn key_record_for(date: NaiveDate, public: &PublicKeyMaterial) -> KeytraceResult<KeyRecord> {
    let window = |h, m, s, ms| {
        date.and_hms_milli_opt(h, m, s, ms)
            .map(|t| t.and_utc())
            .ok_or_else(|| KeytraceError::Storage {
                message: format!("invalid key window for {date}"),
            })
    };

    Ok(KeyRecord {
        record_type: Some(KEY_COLLECTION.to_string()),
        public_jwk: serde_json::to_string(&public.to_jwk()).map_err(|e| KeytraceError::Storage {
            message: format!("failed to encode public JWK: {e}"),
        })?,
        valid_from: window(0, 0, 0, 0)?,
        valid_until: window(23, 59, 59, 999)?,
    })
}

/// A day's signing key.
#[derive(Debug, Clone)]
pub struct DailyKey {
    pub date: NaiveDate,
    pub record: KeyRecord,
    /// AT URI of the published key record.
    pub src: AtUri,
    signing_key: p256::ecdsa::SigningKey,
}

impl DailyKey {
    pub fn kid(&self) -> String {
        key_id(self.date)
    }

    pub fn public_key(&self) -> PublicKeyMaterial {
        PublicKeyMaterial::P256(*self.signing_key.verifying_key())
    }

    pub fn fingerprint(&self) -> KeytraceResult<String> {
        self.public_key().fingerprint()
    }
}

/// Gets or creates the signing key for the current UTC date.
///
/// The cached key sits behind a mutex held across the whole
/// check-then-generate sequence, so at most one key is generated and
/// published per date in this process. After a restart the key is reloaded
/// from the blob store.
pub struct DailyKeyManager {
    signer_did: String,
    store: Arc<dyn BlobStore>,
    publisher: Option<Arc<dyn KeyPublisher>>,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<Arc<DailyKey>>>,
}

impl DailyKeyManager {
    pub fn new(signer_did: impl Into<String>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            signer_did: signer_did.into(),
            store,
            publisher: None,
            clock: Arc::new(SystemClock),
            cache: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn KeyPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn signer_did(&self) -> &str {
        &self.signer_did
    }

    /// Today's key, generating and publishing it on first use.
    pub async fn todays_key(&self) -> KeytraceResult<Arc<DailyKey>> {
        self.key_for(self.clock.now().date_naive()).await
    }

    async fn key_for(&self, date: NaiveDate) -> KeytraceResult<Arc<DailyKey>> {
        let mut cache = self.cache.lock().await;
        if let Some(key) = cache.as_ref().filter(|k| k.date == date) {
            return Ok(Arc::clone(key));
        }

        let key = Arc::new(self.load_or_create(date).await?);
        *cache = Some(Arc::clone(&key));
        Ok(key)
    }

    async fn load_or_create(&self, date: NaiveDate) -> KeytraceResult<DailyKey> {
        let blob = blob_key(date);

        if let Some(bytes) = self.store.get(&blob).await? {
            let jwk: Jwk = serde_json::from_slice(&bytes).map_err(|e| KeytraceError::Storage {
                message: format!("corrupt key blob {blob}: {e}"),
            })?;
            let key = self.daily_key(date, signing_key_from_jwk(&jwk)?)?;
            debug!(date = %key.kid(), "loaded signing key from store");
            return Ok(key);
        }

        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let jwk = serde_json::to_vec(&signing_key_to_jwk(&signing_key)).map_err(|e| {
            KeytraceError::Storage {
                message: format!("failed to encode key: {e}"),
            }
        })?;
        self.store.put(&blob, &jwk).await?;

        let key = self.daily_key(date, signing_key)?;
        info!(
            date = %key.kid(),
            fingerprint = %key.fingerprint().unwrap_or_default(),
            "generated signing key"
        );

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&key.kid(), &key.record).await {
                warn!(date = %key.kid(), error = %e, "failed to publish signing key");
            }
        }
        Ok(key)
    }

    fn daily_key(&self, date: NaiveDate, signing_key: p256::ecdsa::SigningKey) -> KeytraceResult<DailyKey> {
        let public = PublicKeyMaterial::P256(*signing_key.verifying_key());
        Ok(DailyKey {
            date,
            record: key_record_for(date, &public)?,
            src: AtUri::new(&self.signer_did, KEY_COLLECTION, key_id(date)),
            signing_key,
        })
    }

    /// Sign `signed_fields` of a claim owned by `did` with today's key.
    ///
    /// The key is chosen by the date of `signedAt`, so the stamp always
    /// lies inside the key's validity window.
    pub async fn attest(
        &self,
        did: &str,
        record: &ClaimRecord,
        signed_fields: &[&str],
    ) -> KeytraceResult<SignatureRecord> {
        let signed_at = self.clock.now().trunc_subsecs(3);
        let key = self.key_for(signed_at.date_naive()).await?;
        let signed_fields: Vec<String> = signed_fields.iter().map(|f| f.to_string()).collect();

        let data = attestation_data(did, record, signed_at);
        let payload = canonical_payload(&data, &signed_fields)?;
        let attestation = sign_attestation(&key.signing_key, &key.kid(), &payload);

        Ok(SignatureRecord {
            kid: Some(key.kid()),
            src: Some(key.src.to_string()),
            signed_at: Some(signed_at),
            attestation: Some(attestation),
            signed_fields: Some(signed_fields),
            retracted_at: None,
        })
    }
}

impl std::fmt::Debug for DailyKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyKeyManager")
            .field("signer_did", &self.signer_did)
            .field("publishes", &self.publisher.is_some())
            .finish()
    }
}
