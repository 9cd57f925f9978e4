//! Frame-level AES-256-GCM encryption for backup artifacts.
//!
//! An encrypted artifact is `magic || version || salt || iv` followed by a stream of
//! `(frame_len: u32 BE, sealed_frame)` pairs. The per-frame key is derived once via HKDF-SHA256
//! from a per-backup salt and the backup id; the per-frame nonce is the artifact IV with the
//! frame index folded into its low 8 bytes, so no nonce is ever reused under the same key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"VLT1";
pub const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
pub const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + IV_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("frame encryption failed")]
    Seal,
    #[error("frame decryption failed: integrity check did not pass")]
    Open,
    #[error("artifact header is malformed or from an unsupported version")]
    Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionMetadata {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
}

impl EncryptionMetadata {
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5..5 + SALT_LEN].copy_from_slice(&self.salt);
        buf[5 + SALT_LEN..].copy_from_slice(&self.iv);
        buf
    }

    pub fn parse_header(bytes: &[u8; HEADER_LEN]) -> Result<Self, CryptoError> {
        if &bytes[0..4] != MAGIC || bytes[4] != VERSION {
            return Err(CryptoError::Header);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[5..5 + SALT_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[5 + SALT_LEN..]);
        Ok(Self { salt, iv })
    }
}

fn derive_key(master_key: &[u8], salt: &[u8], backup_id: Uuid) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
    let mut okm = [0u8; 32];
    hk.expand(backup_id.as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

fn frame_nonce(iv: &[u8; IV_LEN], frame_index: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    let idx = frame_index.to_be_bytes();
    for i in 0..8 {
        nonce[IV_LEN - 8 + i] ^= idx[i];
    }
    nonce
}

pub struct FrameEncryptor {
    cipher: Aes256Gcm,
    pub metadata: EncryptionMetadata,
}

impl FrameEncryptor {
    pub fn new(master_key: &[u8], backup_id: Uuid) -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);
        let key = derive_key(master_key, &salt, backup_id);
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("derived key is 32 bytes"),
            metadata: EncryptionMetadata { salt, iv },
        }
    }

    pub fn seal_frame(&self, frame_index: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = frame_nonce(&self.metadata.iv, frame_index);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &frame_index.to_be_bytes(),
                },
            )
            .map_err(|_| CryptoError::Seal)
    }
}

pub struct FrameDecryptor {
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
}

impl FrameDecryptor {
    pub fn new(master_key: &[u8], metadata: &EncryptionMetadata, backup_id: Uuid) -> Self {
        let key = derive_key(master_key, &metadata.salt, backup_id);
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("derived key is 32 bytes"),
            iv: metadata.iv,
        }
    }

    pub fn open_frame(&self, frame_index: u64, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = frame_nonce(&self.iv, frame_index);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: &frame_index.to_be_bytes(),
                },
            )
            .map_err(|_| CryptoError::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let master_key = [7u8; 32];
        let backup_id = Uuid::new_v4();
        let encryptor = FrameEncryptor::new(&master_key, backup_id);
        let sealed = encryptor.seal_frame(0, b"hello backup world").unwrap();

        let decryptor = FrameDecryptor::new(&master_key, &encryptor.metadata, backup_id);
        let plain = decryptor.open_frame(0, &sealed).unwrap();
        assert_eq!(plain, b"hello backup world");
    }

    #[test]
    fn wrong_frame_index_fails_integrity_check() {
        let master_key = [7u8; 32];
        let backup_id = Uuid::new_v4();
        let encryptor = FrameEncryptor::new(&master_key, backup_id);
        let sealed = encryptor.seal_frame(0, b"data").unwrap();

        let decryptor = FrameDecryptor::new(&master_key, &encryptor.metadata, backup_id);
        let err = decryptor.open_frame(1, &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Open));
    }

    #[test]
    fn header_round_trips() {
        let metadata = EncryptionMetadata {
            salt: [1u8; SALT_LEN],
            iv: [2u8; IV_LEN],
        };
        let bytes = metadata.header_bytes();
        let parsed = EncryptionMetadata::parse_header(&bytes).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = EncryptionMetadata {
            salt: [0u8; SALT_LEN],
            iv: [0u8; IV_LEN],
        }
        .header_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            EncryptionMetadata::parse_header(&bytes),
            Err(CryptoError::Header)
        ));
    }
}
