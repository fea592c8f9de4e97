//! Cryptographic facade for the tunnel.
//!
//! Two primitives back the whole protocol: AES-256-GCM for the per-session
//! symmetric channel, and RSA-OAEP (SHA-256) for the one-shot session-key
//! bootstrap. Sealed blobs are `nonce || ciphertext`; callers never handle
//! nonces. All failures collapse to [`TunnelError::Crypto`] so no plaintext
//! or cause detail leaks toward the wire.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::errors::TunnelError;

pub const SESSION_KEY_SIZE: usize = 32;

// 96-bit nonce prefix plus 128-bit auth tag.
const SEAL_OVERHEAD: usize = 12 + 16;

/// Symmetric key for one session's AEAD channel.
#[derive(Clone)]
pub struct SessionKey {
    cipher: Aes256Gcm,
}

impl SessionKey {
    /// Adopts raw bytes as a session key. Fails unless exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TunnelError> {
        if bytes.len() != SESSION_KEY_SIZE {
            return Err(TunnelError::Crypto);
        }
        let cipher = Aes256Gcm::new_from_slice(bytes).map_err(|_| TunnelError::Crypto)?;
        Ok(SessionKey { cipher })
    }

    /// Seals plaintext under a fresh random nonce; returns `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TunnelError::Crypto)?;
        Ok([nonce.to_vec(), ciphertext].concat())
    }

    /// Opens a `nonce || ciphertext` blob produced by [`SessionKey::seal`].
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if blob.len() < SEAL_OVERHEAD {
            return Err(TunnelError::Crypto);
        }
        let (nonce, ciphertext) = blob.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TunnelError::Crypto)
    }
}

/// Long-lived RSA keypair for the apex. Generated once at startup; a
/// generation failure is fatal to the process.
pub struct ServerKeyPair {
    name: String,
    private: RsaPrivateKey,
    public_pem: String,
}

impl ServerKeyPair {
    pub fn generate(name: &str, bits: usize) -> Result<Self> {
        log::info!("provisioning {}-bit RSA keypair '{}'", bits, name);
        let mut rng = rand::thread_rng();
        let private =
            RsaPrivateKey::new(&mut rng, bits).context("failed to generate apex RSA keypair")?;
        let public_pem = RsaPublicKey::from(&private)
            .to_pkcs1_pem(LineEnding::LF)
            .context("failed to encode apex public key")?;
        Ok(ServerKeyPair {
            name: name.to_string(),
            private,
            public_pem,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// PKCS#1 PEM of the public half, as served through `_domainkey`.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Recovers a raw key blob sealed to the apex public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| TunnelError::Crypto)
    }
}
