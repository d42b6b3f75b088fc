//! Detached Ed25519 signatures over human-auditable messages
//!
//! Every signed message embeds a correlation id so a signature produced for
//! one request cannot be replayed against another. Keys and signatures
//! travel as lowercase hex.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;

use crate::{PulseError, Result};

const SEED_LEN: usize = 32;
const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// Message an agent signs to prove key ownership during signup
pub fn signup_message(callback_id: &str, public_key: &str) -> String {
    format!("Signed message for {}, {}", callback_id, public_key)
}

/// Message an agent signs when replying to an assignment
pub fn report_message(callback_id: &str) -> String {
    format!("Replying to {}", callback_id)
}

/// Wraps an Ed25519 keypair
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Build a signer from a hex-encoded 32-byte seed
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| PulseError::InvalidKey(format!("private key is not hex: {}", e)))?;
        let seed: [u8; SEED_LEN] = bytes.as_slice().try_into().map_err(|_| {
            PulseError::InvalidKey(format!(
                "private key must be {} bytes, found {}",
                SEED_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded public key
    pub fn public_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Hex-encoded private seed (for `pulse keygen`)
    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Produce a hex-encoded detached signature over `message`
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verify a hex signature against a claimed hex public key
///
/// Malformed keys or signatures yield `false`, never an error. Callers treat
/// `false` as a hard rejection.
pub fn verify(message: &[u8], signature: &str, public_key: &str) -> bool {
    let Some(key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; SIGNATURE_LEN]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_arr);
    key.verify(message, &sig).is_ok()
}

/// Whether `public_key` is a well-formed Ed25519 public key
pub fn is_valid_public_key(public_key: &str) -> bool {
    decode_public_key(public_key).is_some()
}

fn decode_public_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes = hex::decode(public_key).ok()?;
    let arr = <[u8; PUBLIC_KEY_LEN]>::try_from(bytes.as_slice()).ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}
