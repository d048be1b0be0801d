//! Symmetric encryption of the shared payload.
//!
//! The payload is encrypted once per stanza. Only the resulting 48-byte
//! wrapped secret (master secret followed by the truncated MAC) is handed to
//! the ratchet for every recipient device.

use crate::{DecryptError, Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const HKDF_INFO: &[u8] = b"OMEMO Payload";
const HKDF_SALT: [u8; 32] = [0; 32];
const HKDF_OUTPUT_SIZE: usize = 80;
pub const MASTER_SECRET_SIZE: usize = 32;
pub const MAC_SIZE: usize = 16;
pub const WRAPPED_SECRET_SIZE: usize = MASTER_SECRET_SIZE + MAC_SIZE;
const CIPHER_KEY_SIZE: usize = 32;
const MAC_KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub wrapped_secret: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

struct PayloadKeys {
    cipher_key: Zeroizing<[u8; CIPHER_KEY_SIZE]>,
    mac_key: Zeroizing<[u8; MAC_KEY_SIZE]>,
    iv: [u8; IV_SIZE],
}

pub struct PayloadCipher;

impl PayloadCipher {
    pub fn encrypt(plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut master = Zeroizing::new([0u8; MASTER_SECRET_SIZE]);
        OsRng.fill_bytes(&mut master[..]);
        Self::encrypt_with_secret(&master, plaintext)
    }

    fn encrypt_with_secret(master: &[u8; MASTER_SECRET_SIZE], plaintext: &[u8]) -> Result<EncryptedPayload> {
        let keys = derive_keys(master)?;
        let ciphertext = Aes256CbcEnc::new_from_slices(&keys.cipher_key[..], &keys.iv)
            .map_err(|e| Error::Payload(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let tag = mac(&keys.mac_key, &ciphertext)?;

        let mut wrapped_secret = Vec::with_capacity(WRAPPED_SECRET_SIZE);
        wrapped_secret.extend_from_slice(master);
        wrapped_secret.extend_from_slice(&tag[..MAC_SIZE]);
        Ok(EncryptedPayload {
            wrapped_secret,
            ciphertext,
        })
    }

    /// Verifies the MAC over `ciphertext` before decrypting it.
    pub fn decrypt(wrapped_secret: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if wrapped_secret.len() != WRAPPED_SECRET_SIZE {
            return Err(DecryptError::InvalidPayload(format!(
                "wrapped secret has {} bytes instead of {WRAPPED_SECRET_SIZE}",
                wrapped_secret.len()
            ))
            .into());
        }
        let (master, tag) = wrapped_secret.split_at(MASTER_SECRET_SIZE);
        let mut master_secret = Zeroizing::new([0u8; MASTER_SECRET_SIZE]);
        master_secret.copy_from_slice(master);
        let keys = derive_keys(&master_secret)?;

        let mut verifier = HmacSha256::new_from_slice(&keys.mac_key[..])
            .map_err(|e| Error::Payload(e.to_string()))?;
        verifier.update(ciphertext);
        verifier
            .verify_truncated_left(tag)
            .map_err(|_| DecryptError::InvalidMac)?;

        let plaintext = Aes256CbcDec::new_from_slices(&keys.cipher_key[..], &keys.iv)
            .map_err(|e| Error::Payload(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| DecryptError::InvalidPayload(e.to_string()))?;
        Ok(plaintext)
    }
}

fn derive_keys(master: &[u8; MASTER_SECRET_SIZE]) -> Result<PayloadKeys> {
    let hk = Hkdf::<Sha256>::new(Some(&HKDF_SALT[..]), master);
    let mut okm = Zeroizing::new([0u8; HKDF_OUTPUT_SIZE]);
    hk.expand(HKDF_INFO, &mut okm[..])
        .map_err(|e| Error::Payload(e.to_string()))?;

    let mut cipher_key = Zeroizing::new([0u8; CIPHER_KEY_SIZE]);
    let mut mac_key = Zeroizing::new([0u8; MAC_KEY_SIZE]);
    let mut iv = [0u8; IV_SIZE];
    cipher_key.copy_from_slice(&okm[..CIPHER_KEY_SIZE]);
    mac_key.copy_from_slice(&okm[CIPHER_KEY_SIZE..CIPHER_KEY_SIZE + MAC_KEY_SIZE]);
    iv.copy_from_slice(&okm[CIPHER_KEY_SIZE + MAC_KEY_SIZE..]);
    Ok(PayloadKeys {
        cipher_key,
        mac_key,
        iv,
    })
}

fn mac(mac_key: &[u8; MAC_KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(mac_key).map_err(|e| Error::Payload(e.to_string()))?;
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_auth_failure(result: Result<Vec<u8>>) -> bool {
        matches!(result, Err(Error::Decrypt(DecryptError::InvalidMac)))
    }

    #[test]
    fn round_trip() {
        let encrypted = PayloadCipher::encrypt(b"hello world").unwrap();
        assert_eq!(encrypted.wrapped_secret.len(), WRAPPED_SECRET_SIZE);
        assert_eq!(encrypted.ciphertext.len(), 16);

        let plaintext = PayloadCipher::decrypt(&encrypted.wrapped_secret, &encrypted.ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn empty_plaintext_still_produces_one_block() {
        let encrypted = PayloadCipher::encrypt(b"").unwrap();
        assert_eq!(encrypted.ciphertext.len(), 16);
        assert!(PayloadCipher::decrypt(&encrypted.wrapped_secret, &encrypted.ciphertext)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn same_secret_derives_same_ciphertext() {
        let master = [7u8; MASTER_SECRET_SIZE];
        let a = PayloadCipher::encrypt_with_secret(&master, b"payload").unwrap();
        let b = PayloadCipher::encrypt_with_secret(&master, b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(&a.wrapped_secret[..MASTER_SECRET_SIZE], &master);
    }

    #[test]
    fn flipped_ciphertext_bits_are_rejected() {
        let encrypted = PayloadCipher::encrypt(b"attack at dawn, not at dusk").unwrap();
        for byte in 0..encrypted.ciphertext.len() {
            for bit in 0..8 {
                let mut ciphertext = encrypted.ciphertext.clone();
                ciphertext[byte] ^= 1 << bit;
                assert!(is_auth_failure(PayloadCipher::decrypt(
                    &encrypted.wrapped_secret,
                    &ciphertext
                )));
            }
        }
    }

    #[test]
    fn flipped_wrapped_secret_bits_are_rejected() {
        let encrypted = PayloadCipher::encrypt(b"attack at dawn").unwrap();
        for byte in 0..encrypted.wrapped_secret.len() {
            for bit in 0..8 {
                let mut wrapped = encrypted.wrapped_secret.clone();
                wrapped[byte] ^= 1 << bit;
                assert!(is_auth_failure(PayloadCipher::decrypt(&wrapped, &encrypted.ciphertext)));
            }
        }
    }

    #[test]
    fn truncated_wrapped_secret_is_rejected() {
        let encrypted = PayloadCipher::encrypt(b"x").unwrap();
        let result = PayloadCipher::decrypt(&encrypted.wrapped_secret[..40], &encrypted.ciphertext);
        assert!(matches!(result, Err(Error::Decrypt(DecryptError::InvalidPayload(_)))));
    }
}
