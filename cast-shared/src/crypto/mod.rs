use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const AES_KEY_SIZE: usize = 16;
pub const AES_BLOCK_SIZE: usize = 16;

/// Encrypts and decrypts frame payloads with AES-128 in counter mode.
///
/// Every frame uses its own nonce, the IV mask XOR-ed with the big-endian
/// frame id at bytes 8..12. The low 64 bits of the counter block advance
/// through the frame.
#[derive(Clone)]
pub struct FrameEncryptor {
    key: [u8; AES_KEY_SIZE],
    iv_mask: [u8; AES_BLOCK_SIZE],
}

impl std::fmt::Debug for FrameEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEncryptor").finish_non_exhaustive()
    }
}

impl FrameEncryptor {
    pub fn new(key: &[u8], iv_mask: &[u8]) -> Result<Self> {
        if key.len() != AES_KEY_SIZE || iv_mask.len() != AES_BLOCK_SIZE {
            return Err(Error::ErrInvalidCryptoConfig);
        }
        let mut k = [0u8; AES_KEY_SIZE];
        k.copy_from_slice(key);
        let mut m = [0u8; AES_BLOCK_SIZE];
        m.copy_from_slice(iv_mask);
        Ok(FrameEncryptor { key: k, iv_mask: m })
    }

    /// Builds an encryptor from optional key material: both empty means
    /// payloads travel in the clear.
    pub fn from_config(key: &[u8], iv_mask: &[u8]) -> Result<Option<Self>> {
        if key.is_empty() && iv_mask.is_empty() {
            Ok(None)
        } else {
            FrameEncryptor::new(key, iv_mask).map(Some)
        }
    }

    fn nonce(&self, frame_id: u32) -> [u8; AES_BLOCK_SIZE] {
        let mut nonce = self.iv_mask;
        for (n, b) in nonce[8..12].iter_mut().zip(frame_id.to_be_bytes()) {
            *n ^= b;
        }
        nonce
    }

    fn apply(&self, frame_id: u32, data: &mut [u8]) {
        let nonce = self.nonce(frame_id);
        let mut stream = Aes128Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&nonce),
        );
        stream.apply_keystream(data);
    }

    pub fn encrypt(&self, frame_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        self.apply(frame_id, &mut out);
        out
    }

    pub fn decrypt(&self, frame_id: u32, ciphertext: &[u8]) -> Vec<u8> {
        self.encrypt(frame_id, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x65, 0x23, 0xcd, 0x1a, 0x2e, 0x0f, 0x77, 0x7c, 0x12, 0x44, 0x9b, 0x3c, 0xa8, 0x51, 0x0e,
        0x2d,
    ];
    const MASK: [u8; 16] = [0x5a; 16];

    #[test]
    fn test_encrypt_decrypt() -> Result<()> {
        let encryptor = FrameEncryptor::new(&KEY, &MASK)?;
        let payload = b"cast frame payload that spans more than one block".to_vec();

        let ciphertext = encryptor.encrypt(7, &payload);
        assert_ne!(ciphertext, payload);
        assert_eq!(ciphertext.len(), payload.len());
        assert_eq!(encryptor.decrypt(7, &ciphertext), payload);

        // a different frame id yields a different keystream
        assert_ne!(encryptor.encrypt(8, &payload), ciphertext);
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(
            FrameEncryptor::new(&KEY[..8], &MASK).unwrap_err(),
            Error::ErrInvalidCryptoConfig
        );
        assert_eq!(
            FrameEncryptor::from_config(&KEY, &[]).unwrap_err(),
            Error::ErrInvalidCryptoConfig
        );
        assert!(FrameEncryptor::from_config(&[], &[]).unwrap().is_none());
    }
}
