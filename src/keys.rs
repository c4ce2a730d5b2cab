//! Key-material decryption for sink credentials.
//!
//! Registrations may carry an encrypted private key for mutual-TLS or
//! JWT-signed destinations. Workers call [`KeyDecrypter::decrypt`] once per
//! build; a failure rejects the registration.

use crate::pipeline::AesCipher;

/// Errors returned by key decryption.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key material is empty")]
    Empty,

    #[error("failed to decrypt key: {0}")]
    Decrypt(String),
}

/// Turns stored key ciphertext into usable key bytes.
pub trait KeyDecrypter: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, KeyError>;
}

/// Keys are stored in the clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextKeys;

impl KeyDecrypter for PlaintextKeys {
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, KeyError> {
        if ciphertext.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(ciphertext.as_bytes().to_vec())
    }
}

/// Keys are base64 AES-128-CBC payloads sealed with a service passphrase.
#[derive(Debug, Clone)]
pub struct PassphraseKeys {
    cipher: AesCipher,
}

impl PassphraseKeys {
    pub fn new(passphrase: &str, iv: &str) -> Result<Self, KeyError> {
        let cipher =
            AesCipher::new(passphrase, iv).map_err(|e| KeyError::Decrypt(e.to_string()))?;
        Ok(Self { cipher })
    }
}

impl KeyDecrypter for PassphraseKeys {
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, KeyError> {
        if ciphertext.is_empty() {
            return Err(KeyError::Empty);
        }
        self.cipher
            .decrypt_base64(ciphertext.trim().as_bytes())
            .map_err(|e| KeyError::Decrypt(e.to_string()))
    }
}
