//! AES encryption transformer.
//!
//! AES-128-CBC with PKCS#7 padding. The cipher key is the first 16 bytes of
//! SHA-1 over the configured key string; the IV is the configured vector,
//! zero-padded or truncated to the block size. Output is base64 text.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::{Digest, Sha1};

use super::{Result, StageError, Transformer};
use crate::models::{EncryptionAlgorithm, EncryptionDetails};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// Key material for AES-128-CBC.
#[derive(Clone, PartialEq, Eq)]
pub struct AesCipher {
    key: [u8; BLOCK_SIZE],
    iv: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for AesCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCipher").finish_non_exhaustive()
    }
}

impl AesCipher {
    pub fn new(key: &str, iv: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(StageError::Invalid {
                stage: "encryption",
                message: "AES key is empty".to_string(),
            });
        }

        let digest = Sha1::digest(key.as_bytes());
        let mut derived = [0u8; BLOCK_SIZE];
        derived.copy_from_slice(&digest[..BLOCK_SIZE]);

        let mut vector = [0u8; BLOCK_SIZE];
        let iv = iv.as_bytes();
        let n = iv.len().min(BLOCK_SIZE);
        vector[..n].copy_from_slice(&iv[..n]);

        Ok(Self {
            key: derived,
            iv: vector,
        })
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|e| StageError::Decrypt(e.to_string()))
    }

    /// Inverse of [`Transformer::transform`]: base64 decode, then decrypt.
    pub fn decrypt_base64(&self, data: &[u8]) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(data)
            .map_err(|e| StageError::Decrypt(e.to_string()))?;
        self.decrypt(&raw)
    }
}

impl Transformer for AesCipher {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(STANDARD.encode(self.encrypt(data)).into_bytes())
    }
}

/// Encryption stage resolved from a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    Aes(AesCipher),
}

impl Encryption {
    /// Resolve the encryption stage; `NONE` installs nothing.
    pub fn from_details(details: &EncryptionDetails) -> Result<Option<Self>> {
        match &details.encryption_algorithm {
            EncryptionAlgorithm::None => Ok(None),
            EncryptionAlgorithm::Aes => Ok(Some(Encryption::Aes(AesCipher::new(
                &details.encryption_key,
                &details.initializing_vector,
            )?))),
            EncryptionAlgorithm::Unsupported(value) => Err(StageError::Unsupported {
                stage: "encryption",
                value: value.clone(),
            }),
        }
    }
}

impl Transformer for Encryption {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encryption::Aes(cipher) => cipher.transform(data),
        }
    }
}
