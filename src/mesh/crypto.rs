//! Key manager for mesh encryption
//!
//! Each process owns one X25519 key pair. Shared secrets are the SHA-256
//! hash of the raw Diffie-Hellman output and are cached per remote public
//! key, so a peer that restarts with a fresh key simply derives a new
//! secret. Payloads are sealed with ChaCha20-Poly1305 under a fresh random
//! 12-byte nonce. A separate Ed25519 key signs presence announcements so
//! that a mesh identity cannot be claimed by anyone else on the segment.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore, TryRngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::{MeshError, MeshResult};

/// Size of an X25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a derived symmetric key
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of an AEAD nonce
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of an Ed25519 verifying key
pub const SIGNING_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Raw X25519 public key bytes
pub type PublicKeyBytes = [u8; PUBLIC_KEY_SIZE];

/// Raw Ed25519 verifying key bytes
pub type VerifyingKeyBytes = [u8; SIGNING_KEY_SIZE];

/// Raw Ed25519 signature bytes
pub type SignatureBytes = [u8; SIGNATURE_SIZE];

/// Derived symmetric key bytes
pub type SharedSecret = [u8; SHARED_SECRET_SIZE];

/// Generate a fresh random AEAD nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Verify an Ed25519 signature made by [`KeyManager::sign`]
pub fn verify_signature(
    signing_key: &VerifyingKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> MeshResult<()> {
    let key = VerifyingKey::from_bytes(signing_key)
        .map_err(|e| MeshError::InvalidPublicKey(format!("bad signing key: {}", e)))?;

    key.verify_strict(message, &Signature::from_bytes(signature))
        .map_err(|_| MeshError::Authentication("signature verification failed".to_string()))
}

/// Owns the local key pairs and the per-peer secret cache
pub struct KeyManager {
    /// Ed25519 key for signing announcements
    signing_key: SigningKey,

    /// X25519 static key pair for encryption
    private_key: StaticSecret,
    public_key: PublicKey,

    /// Cached shared secrets (peer public key -> secret)
    shared_secrets: Mutex<HashMap<PublicKeyBytes, SharedSecret>>,
}

impl KeyManager {
    /// Generate fresh key pairs from the operating system RNG
    pub fn generate() -> MeshResult<Self> {
        let private_key = StaticSecret::from(os_seed()?);
        let public_key = PublicKey::from(&private_key);
        let signing_key = SigningKey::from_bytes(&os_seed()?);

        Ok(Self {
            signing_key,
            private_key,
            public_key,
            shared_secrets: Mutex::new(HashMap::new()),
        })
    }

    /// Get the local public key
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        self.public_key.to_bytes()
    }

    /// Get the local Ed25519 verifying key
    pub fn signing_key_bytes(&self) -> VerifyingKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `message` with the local Ed25519 key
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes()
    }

    /// Derive (or fetch from cache) the symmetric key shared with a peer
    pub fn derive_shared_secret(&self, peer_public_key: &PublicKeyBytes) -> MeshResult<SharedSecret> {
        let mut cache = self
            .shared_secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(secret) = cache.get(peer_public_key) {
            return Ok(*secret);
        }

        let agreement = self
            .private_key
            .diffie_hellman(&PublicKey::from(*peer_public_key));
        if !agreement.was_contributory() {
            return Err(MeshError::InvalidPublicKey(
                "peer key has low order".to_string(),
            ));
        }

        let secret: SharedSecret = Sha256::digest(agreement.as_bytes()).into();
        cache.insert(*peer_public_key, secret);
        tracing::trace!("Derived shared secret for peer key {}", short_key(peer_public_key));

        Ok(secret)
    }

    /// Number of cached shared secrets
    pub fn cached_secrets(&self) -> usize {
        self.shared_secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Encrypt for a peer. Returns `nonce || ciphertext || tag`.
    pub fn encrypt(&self, peer_public_key: &PublicKeyBytes, plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let nonce = generate_nonce();
        let ciphertext = self.encrypt_with_aad(peer_public_key, &nonce, plaintext, &[])?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Inverse of [`KeyManager::encrypt`]
    pub fn decrypt(&self, peer_public_key: &PublicKeyBytes, sealed: &[u8]) -> MeshResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(MeshError::Authentication(format!(
                "envelope too short ({} bytes)",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        self.decrypt_with_aad(peer_public_key, &nonce_bytes, ciphertext, &[])
    }

    /// Encrypt with an explicit nonce and associated data. The caller must
    /// never reuse a nonce for the same peer.
    pub fn encrypt_with_aad(
        &self,
        peer_public_key: &PublicKeyBytes,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> MeshResult<Vec<u8>> {
        let cipher = self.cipher_for(peer_public_key)?;

        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|e| MeshError::Authentication(format!("encryption failed: {}", e)))
    }

    /// Decrypt a ciphertext produced by [`KeyManager::encrypt_with_aad`]
    pub fn decrypt_with_aad(
        &self,
        peer_public_key: &PublicKeyBytes,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> MeshResult<Vec<u8>> {
        let cipher = self.cipher_for(peer_public_key)?;

        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| MeshError::Authentication("tag verification failed".to_string()))
    }

    fn cipher_for(&self, peer_public_key: &PublicKeyBytes) -> MeshResult<ChaCha20Poly1305> {
        let secret = self.derive_shared_secret(peer_public_key)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&secret)))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("public_key", &short_key(&self.public_key_bytes()))
            .field("signing_key", &short_key(&self.signing_key_bytes()))
            .field("cached_secrets", &self.cached_secrets())
            .finish()
    }
}

fn os_seed() -> MeshResult<[u8; 32]> {
    let mut seed = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| MeshError::Rng(e.to_string()))?;
    Ok(seed)
}

/// Abbreviated hex form of a public key for logs
pub fn short_key(key: &PublicKeyBytes) -> String {
    hex::encode(&key[..6])
}
