//! AES-256-GCM envelope encryption for webhook signing secrets and destination
//! credentials at rest.
//!
//! Unlike passphrase-derived encryption, the key here is a fixed 256-bit value
//! sourced once from configuration (`DELIVERY_ENCRYPTION_KEY` / `secrets.encryption_key`,
//! 64 hex characters) rather than derived per-secret with PBKDF2: destination
//! configs are read far more often than they are written, so paying a KDF on
//! every decrypt is wasted cost for no added security in this threat model.
//!
//! Envelope format: `hex(nonce) ":" hex(ciphertext_and_tag)`.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Context, Result, bail};

/// Size of the AES-GCM nonce (96 bits, the standard size).
const NONCE_SIZE: usize = 12;

/// A parsed 256-bit encryption key, ready to construct ciphers from.
#[derive(Clone)]
pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    /// Parse a 64-character hex string into a 256-bit key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key).context("encryption key must be valid hex")?;
        if bytes.len() != 32 {
            bail!("encryption key must decode to exactly 32 bytes, got {}", bytes.len());
        }
        Ok(Self(*Key::<Aes256Gcm>::from_slice(&bytes)))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(&self.0);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e:?}"))?;

        Ok(format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>> {
        let (nonce_hex, ciphertext_hex) = envelope
            .split_once(':')
            .context("ciphertext envelope must be nonce:ciphertext")?;

        let nonce_bytes = hex::decode(nonce_hex).context("invalid nonce hex")?;
        if nonce_bytes.len() != NONCE_SIZE {
            bail!("nonce must be {NONCE_SIZE} bytes, got {}", nonce_bytes.len());
        }
        let ciphertext = hex::decode(ciphertext_hex).context("invalid ciphertext hex")?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = Aes256Gcm::new(&self.0);
        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("decryption failed (wrong key or tampered ciphertext): {e:?}"))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, envelope: &str) -> Result<String> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes).context("decrypted payload is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let key = test_key();
        let envelope = key.encrypt_str("whsec_abc123").unwrap();
        assert_eq!(key.decrypt_str(&envelope).unwrap(), "whsec_abc123");
    }

    #[test]
    fn envelope_has_hex_nonce_and_ciphertext_parts() {
        let key = test_key();
        let envelope = key.encrypt_str("hello").unwrap();
        let (nonce_hex, ciphertext_hex) = envelope.split_once(':').unwrap();
        assert_eq!(hex::decode(nonce_hex).unwrap().len(), NONCE_SIZE);
        assert!(hex::decode(ciphertext_hex).is_ok());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = test_key();
        let mut envelope = key.encrypt_str("hello").unwrap();
        envelope.push('0');
        assert!(key.decrypt_str(&envelope).is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let key = test_key();
        let other = EncryptionKey::from_hex(&"cd".repeat(32)).unwrap();
        let envelope = key.encrypt_str("hello").unwrap();
        assert!(other.decrypt_str(&envelope).is_err());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(EncryptionKey::from_hex("abcd").is_err());
    }
}
