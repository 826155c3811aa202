//! Tuya protocol encryption and decryption logic.
//! Supports AES-128-ECB (v3.1, v3.3) and AES-128-GCM (v3.4, v3.5).

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};
use rand::RngCore;

/// ASCII literal the fixed UDP broadcast key is derived from.
const UDP_BROADCAST_SEED: &[u8] = b"yGAdlopoPVldABfn";

/// Converts raw key bytes into a 16-byte AES-128 key by right-padding
/// with `0x00` (short keys) or truncating (long keys). Operates on raw
/// bytes only — never a text transcoding that could alter bytes > 127.
pub fn prepare_key(raw: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    let n = raw.len().min(16);
    key[..n].copy_from_slice(&raw[..n]);
    key
}

/// The fixed shared secret used to decrypt UDP discovery broadcasts:
/// MD5 of the ASCII literal `yGAdlopoPVldABfn`.
pub fn udp_broadcast_key() -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(UDP_BROADCAST_SEED);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

/// Generates a fresh random 12-byte GCM nonce. Preferred over the
/// timestamp-derived scheme below for frames this process originates,
/// since a random nonce carries no collision risk under high send rates.
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Derives a 12-byte ASCII nonce from hundredths-of-a-second-since-epoch,
/// right-padded with `'0'`. Kept for compatibility with the reference
/// scheme; `random_nonce` is used by default because this derivation can
/// collide under very high send rates on one key (the wire contract only
/// requires per-(key, message) uniqueness, not this particular scheme).
pub fn timestamp_nonce() -> [u8; 12] {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let centis = now.as_millis() / 10;
    let s = centis.to_string();
    let mut nonce = [b'0'; 12];
    let bytes = s.as_bytes();
    let n = bytes.len().min(12);
    nonce[..n].copy_from_slice(&bytes[bytes.len() - n..]);
    nonce
}

/// AES-128 encryption/decryption in the two modes the protocol uses:
/// ECB with PKCS#7 padding (3.1-3.4) and GCM with a 12-byte nonce and
/// 16-byte tag (3.5).
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
    /// Cached GCM cipher
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::EncryptionFailed(format!(
                "AES-128 key must be 16 bytes, got {}",
                key.len()
            )));
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// Encrypt data.
    /// * `iv`: 12-byte nonce. If provided, uses GCM mode; otherwise ECB.
    /// * `aad`: Additional authenticated data (GCM mode only).
    /// * `padding`: If true, applies PKCS7 padding for ECB mode.
    ///
    /// GCM output is `nonce || ciphertext || tag`.
    pub fn encrypt(
        &self,
        data: &[u8],
        iv: Option<&[u8]>,
        aad: Option<&[u8]>,
        padding: bool,
    ) -> Result<Vec<u8>> {
        if let Some(iv_bytes) = iv {
            let nonce = Nonce::from_slice(&iv_bytes[..12]);
            let payload = Payload {
                msg: data,
                aad: aad.unwrap_or(&[]),
            };

            let mut ciphertext = self
                .gcm
                .encrypt(nonce, payload)
                .map_err(|_| TuyaError::EncryptionFailed("GCM encrypt failed".into()))?;

            let mut result = Vec::with_capacity(iv_bytes.len() + ciphertext.len());
            result.extend_from_slice(iv_bytes);
            result.append(&mut ciphertext);
            Ok(result)
        } else {
            let mut padded_data = if padding {
                pkcs7_pad(data)
            } else {
                if !data.len().is_multiple_of(16) {
                    return Err(TuyaError::EncryptionFailed(
                        "ECB input not block-aligned and padding disabled".into(),
                    ));
                }
                data.to_vec()
            };

            let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
            for chunk in padded_data.chunks_mut(16) {
                let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
                encryptor.encrypt_block_mut(block);
            }

            Ok(padded_data)
        }
    }

    /// Decrypt data.
    /// * `iv`: 12-byte nonce. If provided, uses GCM mode; otherwise ECB.
    /// * `aad`: Additional authenticated data (GCM mode only).
    ///
    /// For GCM, `data` is ciphertext+tag (the nonce is passed separately
    /// via `iv`, matching how the codec splits a 6699 frame apart).
    pub fn decrypt(&self, data: &[u8], iv: Option<&[u8]>, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        if let Some(iv_bytes) = iv {
            let nonce = Nonce::from_slice(&iv_bytes[..12]);
            let payload = Payload {
                msg: data,
                aad: aad.unwrap_or(&[]),
            };

            self.gcm
                .decrypt(nonce, payload)
                .map_err(|_| TuyaError::GcmTagInvalid)
        } else {
            if data.is_empty() {
                return Ok(Vec::new());
            }
            if data.len() % 16 != 0 {
                return Err(TuyaError::BadPadding);
            }

            let mut plaintext = data.to_vec();
            let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
            for chunk in plaintext.chunks_mut(16) {
                let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
                decryptor.decrypt_block_mut(block);
            }

            pkcs7_unpad(plaintext)
        }
    }
}

/// Pads `data` to a multiple of 16 bytes using PKCS#7.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let remainder = data.len() % 16;
    let padding_len = 16 - remainder;
    let mut p = data.to_vec();
    p.extend(std::iter::repeat_n(padding_len as u8, padding_len));
    p
}

/// Removes and validates PKCS#7 padding. Verifies every padding byte
/// equals the pad length (not just the final byte), and rejects a pad
/// length of 0 or greater than 16.
pub fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(data);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > 16 || pad_len > data.len() {
        return Err(TuyaError::BadPadding);
    }
    if data[data.len() - pad_len..]
        .iter()
        .any(|&b| b as usize != pad_len)
    {
        return Err(TuyaError::BadPadding);
    }
    data.truncate(data.len() - pad_len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 16] {
        prepare_key(b"0123456789abcdef")
    }

    #[test]
    fn ecb_round_trip() {
        let cipher = TuyaCipher::new(&key()).unwrap();
        for msg in [&b""[..], b"a", b"hello world", b"{\"dps\":{\"1\":true}}"] {
            let enc = cipher.encrypt(msg, None, None, true).unwrap();
            assert_eq!(enc.len() % 16, 0);
            let dec = cipher.decrypt(&enc, None, None).unwrap();
            assert_eq!(dec, msg);
        }
    }

    #[test]
    fn pkcs7_pad_length_is_correct() {
        for len in 0..40 {
            let data = vec![0xABu8; len];
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % 16, 0);
            let pad_len = *padded.last().unwrap();
            assert_eq!(pad_len as usize, padded.len() - len);
        }
    }

    #[test]
    fn unpad_all_0x10_block_is_empty() {
        let block = vec![0x10u8; 16];
        let unpadded = pkcs7_unpad(block).unwrap();
        assert!(unpadded.is_empty());
    }

    #[test]
    fn unpad_rejects_bad_padding() {
        assert!(pkcs7_unpad(vec![0u8; 16]).is_err());
        let mut bad_len = vec![1u8; 16];
        bad_len[15] = 17;
        assert!(pkcs7_unpad(bad_len).is_err());
        let mut mismatched = vec![0u8; 16];
        mismatched[15] = 3;
        mismatched[14] = 3;
        mismatched[13] = 9; // should be 3
        assert!(pkcs7_unpad(mismatched).is_err());
    }

    #[test]
    fn gcm_round_trip_and_tamper_detection() {
        let cipher = TuyaCipher::new(&key()).unwrap();
        let nonce = random_nonce();
        let aad = b"header-aad";
        let mut enc = cipher
            .encrypt(b"secret dps", Some(&nonce), Some(aad), false)
            .unwrap();
        let (n, ct) = enc.split_at(12);
        let dec = cipher.decrypt(ct, Some(n), Some(aad)).unwrap();
        assert_eq!(dec, b"secret dps");

        let last = enc.len() - 1;
        enc[last] ^= 0xFF;
        let (n, ct) = enc.split_at(12);
        assert!(matches!(
            cipher.decrypt(ct, Some(n), Some(aad)),
            Err(TuyaError::GcmTagInvalid)
        ));
    }

    #[test]
    fn gcm_different_nonces_differ_for_same_plaintext() {
        let cipher = TuyaCipher::new(&key()).unwrap();
        let n1 = random_nonce();
        let mut n2 = n1;
        n2[0] ^= 1;
        let c1 = cipher.encrypt(b"same plaintext", Some(&n1), None, false).unwrap();
        let c2 = cipher.encrypt(b"same plaintext", Some(&n2), None, false).unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn udp_broadcast_key_matches_known_value() {
        let key = udp_broadcast_key();
        let expected = [
            0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b,
            0x41, 0x0a,
        ];
        assert_eq!(key, expected);
    }

    #[test]
    fn prepare_key_pads_and_truncates() {
        let mut expected = [0u8; 16];
        expected[..5].copy_from_slice(b"short");
        assert_eq!(prepare_key(b"short"), expected);
        assert_eq!(
            &prepare_key(b"0123456789abcdefEXTRA")[..],
            b"0123456789abcdef"
        );
    }
}
