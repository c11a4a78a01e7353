//! Signing credentials for zome calls
//!
//! The conductor only accepts zome calls signed by a key that was granted
//! a capability on the target cell. The client keeps one ed25519 key pair
//! and one capability secret for its whole lifetime, persisted through the
//! [`KeyValueStore`] so a restart does not need a new grant.
//!
//! # Signed call layout
//!
//! ```text
//! bytes     = msgpack { provenance, cell_id: [dna, agent], zome_name, fn_name,
//!                       cap_secret, payload, nonce, expires_at }
//! signature = ed25519(sha512(bytes))
//! ```

use base64::prelude::*;
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rmpv::Value;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::backend::CellId;
use super::protocol::encode_value;
use crate::error::{ConnectError, Result};
use crate::store::{KeyValueStore, CREDENTIALS_KEY};

/// Three-byte prefix of a 39-byte agent public key
pub const AGENT_KEY_PREFIX: [u8; 3] = [0x84, 0x20, 0x24];

/// Capability secret length
pub const CAP_SECRET_LEN: usize = 64;

/// How long a signed call stays valid
const CALL_VALIDITY: Duration = Duration::from_secs(5 * 60);

type Blake2b128 = Blake2b<U16>;

/// 4-byte DHT location: 16-byte blake2b digest, xor-folded.
pub fn dht_location(core: &[u8]) -> [u8; 4] {
    let digest = Blake2b128::digest(core);
    let mut loc = [0u8; 4];
    for chunk in digest.chunks(4) {
        for (l, b) in loc.iter_mut().zip(chunk) {
            *l ^= b;
        }
    }
    loc
}

/// Wrap a raw ed25519 public key as a 39-byte agent key.
pub fn agent_key_from_ed25519(public_key: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(39);
    key.extend_from_slice(&AGENT_KEY_PREFIX);
    key.extend_from_slice(public_key);
    key.extend_from_slice(&dht_location(public_key));
    key
}

/// URL-safe display form of a 39-byte hash: `u` + base64url.
pub fn encode_hash(bytes: &[u8]) -> String {
    format!("u{}", BASE64_URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    signing_key: String,
    cap_secret: String,
}

/// Key pair plus capability secret.
pub struct SigningCredentials {
    signing_key: SigningKey,
    cap_secret: [u8; CAP_SECRET_LEN],
}

impl SigningCredentials {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut cap_secret = [0u8; CAP_SECRET_LEN];
        OsRng.fill_bytes(&mut cap_secret);
        Self {
            signing_key,
            cap_secret,
        }
    }

    /// Restore the persisted credentials, or generate and persist new ones.
    pub fn load_or_generate(store: &dyn KeyValueStore) -> Result<Self> {
        if let Some(raw) = store.get(CREDENTIALS_KEY)? {
            match Self::decode(&raw) {
                Ok(credentials) => {
                    debug!("Restored signing credentials");
                    return Ok(credentials);
                }
                Err(e) => {
                    info!(error = %e, "Stored signing credentials unusable, generating new ones");
                }
            }
        }

        let credentials = Self::generate();
        store.set(CREDENTIALS_KEY, &credentials.encode()?)?;
        info!(
            signing_key = %encode_hash(&credentials.signing_agent_key()),
            "Generated signing credentials"
        );
        Ok(credentials)
    }

    fn encode(&self) -> Result<String> {
        let stored = StoredCredentials {
            signing_key: BASE64_STANDARD.encode(self.signing_key.to_bytes()),
            cap_secret: BASE64_STANDARD.encode(self.cap_secret),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    fn decode(raw: &str) -> Result<Self> {
        let stored: StoredCredentials = serde_json::from_str(raw)?;
        let key_bytes: [u8; 32] = decode_fixed(&stored.signing_key, "signing key")?;
        let cap_secret: [u8; CAP_SECRET_LEN] = decode_fixed(&stored.cap_secret, "cap secret")?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
            cap_secret,
        })
    }

    /// The signing public key as a 39-byte agent key; this is the call provenance.
    pub fn signing_agent_key(&self) -> Vec<u8> {
        agent_key_from_ed25519(self.signing_key.verifying_key().as_bytes())
    }

    pub fn cap_secret(&self) -> &[u8] {
        &self.cap_secret
    }

    /// ed25519 over the sha512 digest of `data`.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let digest = Sha512::digest(data);
        self.signing_key.sign(&digest).to_bytes()
    }
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| ConnectError::Auth(format!("Invalid {} encoding: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| ConnectError::Auth(format!("Invalid {} length", what)))
}

/// A zome call ready for the `call_zome` request.
#[derive(Debug, Clone)]
pub struct SignedZomeCall {
    pub bytes: Vec<u8>,
    pub signature: [u8; 64],
}

/// Signs calls for the cells it was authorized against during connect.
pub struct CallSigner {
    credentials: Arc<SigningCredentials>,
    provenance: Vec<u8>,
    authorized: HashSet<CellId>,
}

impl CallSigner {
    pub fn new(credentials: Arc<SigningCredentials>, cells: impl IntoIterator<Item = CellId>) -> Self {
        let provenance = credentials.signing_agent_key();
        Self {
            credentials,
            provenance,
            authorized: cells.into_iter().collect(),
        }
    }

    pub fn is_authorized(&self, cell: &CellId) -> bool {
        self.authorized.contains(cell)
    }

    pub fn provenance(&self) -> &[u8] {
        &self.provenance
    }

    pub fn sign_call(
        &self,
        cell: &CellId,
        zome_name: &str,
        fn_name: &str,
        payload: &[u8],
    ) -> Result<SignedZomeCall> {
        if !self.is_authorized(cell) {
            return Err(ConnectError::Auth(format!(
                "No signing credentials for cell {}",
                encode_hash(&cell.dna_hash)
            )));
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let expires_at = SystemTime::now()
            .checked_add(CALL_VALIDITY)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as i64)
            .ok_or_else(|| ConnectError::Internal("System clock before epoch".into()))?;

        let unsigned = Value::Map(vec![
            (Value::String("provenance".into()), Value::Binary(self.provenance.clone())),
            (Value::String("cell_id".into()), cell.to_value()),
            (Value::String("zome_name".into()), Value::String(zome_name.into())),
            (Value::String("fn_name".into()), Value::String(fn_name.into())),
            (
                Value::String("cap_secret".into()),
                Value::Binary(self.credentials.cap_secret().to_vec()),
            ),
            (Value::String("payload".into()), Value::Binary(payload.to_vec())),
            (Value::String("nonce".into()), Value::Binary(nonce.to_vec())),
            (Value::String("expires_at".into()), Value::Integer(expires_at.into())),
        ]);

        let bytes = encode_value(&unsigned)?;
        let signature = self.credentials.sign(&bytes);
        Ok(SignedZomeCall { bytes, signature })
    }
}
