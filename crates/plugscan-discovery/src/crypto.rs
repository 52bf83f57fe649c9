//! AES-128-ECB with PKCS#7 padding, as used by encrypted discovery beacons
//!
//! Every device of the family encrypts its beacon with the same well-known
//! key: the MD5 digest of a fixed 16-byte passphrase.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use std::sync::OnceLock;
use thiserror::Error;

const BLOCK_SIZE: usize = 16;

/// Passphrase the discovery key is derived from
pub const DISCOVERY_PASSPHRASE: &[u8; 16] = b"yGAdlopoPVldABfn";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext length {0} is not a positive multiple of 16")]
    InvalidLength(usize),
    #[error("invalid PKCS#7 padding")]
    InvalidPadding,
}

/// The protocol-wide beacon key, `MD5(DISCOVERY_PASSPHRASE)`
pub fn discovery_key() -> &'static [u8; 16] {
    static KEY: OnceLock<[u8; 16]> = OnceLock::new();
    KEY.get_or_init(|| md5::compute(DISCOVERY_PASSPHRASE).0)
}

/// Encrypt with AES-128-ECB after PKCS#7 padding
pub fn encrypt_ecb(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let padding_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
    let mut data = plaintext.to_vec();
    data.extend(std::iter::repeat(padding_len as u8).take(padding_len));

    let cipher = Aes128::new(GenericArray::from_slice(key));
    for chunk in data.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    data
}

/// Decrypt AES-128-ECB and strip PKCS#7 padding
pub fn decrypt_ecb(key: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(ciphertext.len()));
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut data = ciphertext.to_vec();
    for chunk in data.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    let padding_len = data.last().copied().unwrap_or(0) as usize;
    if padding_len == 0 || padding_len > BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }
    data.truncate(data.len() - padding_len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_key_is_md5_of_passphrase() {
        // md5("yGAdlopoPVldABfn") = 6c1ec8e2bb9bb59ab50b0daf649b410a
        assert_eq!(
            discovery_key(),
            &[
                0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64,
                0x9b, 0x41, 0x0a
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let key = discovery_key();
        let plaintext = br#"{"ip":"10.0.1.99","gwId":"abc","productKey":"k","version":"3.3"}"#;
        let encrypted = encrypt_ecb(key, plaintext);
        assert_eq!(encrypted.len() % 16, 0);
        assert_ne!(&encrypted[..plaintext.len().min(16)], &plaintext[..16]);
        assert_eq!(decrypt_ecb(key, &encrypted).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_full_block_of_padding() {
        let key = discovery_key();
        let plaintext = [b'a'; 16];
        let encrypted = encrypt_ecb(key, &plaintext);
        assert_eq!(encrypted.len(), 32);
        assert_eq!(decrypt_ecb(key, &encrypted).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_rejects_partial_block() {
        assert_eq!(
            decrypt_ecb(discovery_key(), &[0u8; 17]),
            Err(CryptoError::InvalidLength(17))
        );
        assert_eq!(
            decrypt_ecb(discovery_key(), &[]),
            Err(CryptoError::InvalidLength(0))
        );
    }
}
