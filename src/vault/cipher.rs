// Conduit — AES-256-GCM credential cipher
//
// Credential values are sealed client-side with a 256-bit key and stored as
// base64 ciphertext (GCM tag appended) plus a base64 96-bit nonce. The key
// arrives per call as hex, base64 or a passphrase stretched with Argon2id.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::VaultError;
use crate::store::EncryptedValue;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Argon2id memory cost in KiB (64 MiB).
const ARGON2_M_COST: u32 = 65_536;

/// Argon2id iterations.
const ARGON2_T_COST: u32 = 3;

/// Argon2id lanes.
const ARGON2_P_COST: u32 = 4;

/// Domain separator mixed into the passphrase salt.
const SALT_PREFIX: &[u8] = b"conduit::";

/// A caller-supplied decryption key. Zeroed on drop and never printed.
#[derive(Clone)]
pub struct DecryptionKey(Zeroizing<Vec<u8>>);

impl DecryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    /// Parse a raw key: 64 hex characters or base64 of 32 bytes.
    pub fn parse(input: &str) -> Result<Self, VaultError> {
        let input = input.trim();

        if input.len() == KEY_LEN * 2 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
            let bytes = Zeroizing::new(
                hex::decode(input).map_err(|e| VaultError::InvalidKey(e.to_string()))?,
            );
            return Self::from_bytes(&bytes);
        }

        let bytes = Zeroizing::new(
            B64.decode(input)
                .map_err(|_| VaultError::InvalidKey("expected 64 hex chars or base64".into()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Stretch a passphrase into a key with Argon2id, salted per owner.
    pub fn derive_from_passphrase(passphrase: &str, owner_id: &str) -> Result<Self, VaultError> {
        let salt = Self::build_salt(owner_id);

        let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_LEN))
            .map_err(|e| VaultError::InvalidKey(format!("invalid Argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut derived = Zeroizing::new(vec![0u8; KEY_LEN]);
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut derived)
            .map_err(|e| VaultError::InvalidKey(format!("Argon2id hash failed: {}", e)))?;

        Ok(Self(derived))
    }

    /// A fresh random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Base64 form, for handing a generated key to the user once.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(self.0.as_slice()))
    }

    fn build_salt(owner_id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SALT_PREFIX);
        hasher.update(owner_id.as_bytes());
        hasher.finalize().into()
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| VaultError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionKey([REDACTED])")
    }
}

/// Decrypt one stored value.
pub fn open(key: &DecryptionKey, value: &EncryptedValue) -> Result<Zeroizing<String>, VaultError> {
    let ciphertext = B64
        .decode(&value.ciphertext)
        .map_err(|e| VaultError::Decrypt(format!("ciphertext is not base64: {}", e)))?;
    let nonce = B64
        .decode(&value.iv)
        .map_err(|e| VaultError::Decrypt(format!("iv is not base64: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Decrypt(format!(
            "iv must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }

    let plaintext = Zeroizing::new(
        key.cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| VaultError::Decrypt("wrong key or corrupt ciphertext".into()))?,
    );

    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| VaultError::Decrypt("plaintext is not UTF-8".into()))?;
    Ok(Zeroizing::new(text.to_string()))
}

/// Encrypt a plaintext value under `key` with a random nonce.
pub fn seal(key: &DecryptionKey, plaintext: &str) -> Result<EncryptedValue, VaultError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| VaultError::Encrypt(e.to_string()))?;

    Ok(EncryptedValue {
        ciphertext: B64.encode(ciphertext),
        iv: B64.encode(nonce),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
