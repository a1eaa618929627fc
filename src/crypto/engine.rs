use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
#[error("crypto error: {0}")]
pub struct CryptoError(String);

/// AES-256-GCM encryption for OAuth tokens stored in the database.
pub struct CryptoEngine {
    cipher: Aes256Gcm,
}

impl CryptoEngine {
    /// Create a new CryptoEngine from a base64-encoded 32-byte key.
    pub fn new(master_key_b64: &str) -> Result<Self, CryptoError> {
        let master_key = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| CryptoError(format!("Invalid MASTER_KEY base64: {e}")))?;

        if master_key.len() != 32 {
            return Err(CryptoError(format!(
                "MASTER_KEY must be 32 bytes, got {}",
                master_key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| CryptoError(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher })
    }

    /// Encrypt plaintext. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError(format!("Encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt base64(nonce || ciphertext) back to plaintext.
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, CryptoError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| CryptoError(format!("Invalid base64: {e}")))?;

        if combined.len() < NONCE_LEN {
            return Err(CryptoError("Ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError(format!("Invalid UTF-8 after decrypt: {e}")))
    }
}
