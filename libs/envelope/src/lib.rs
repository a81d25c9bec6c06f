//! OpenSSL-compatible envelope cipher for client payloads.
//!
//! The wire format is `base64("Salted__" || salt[8] || AES-256-CBC(json))`
//! with PKCS7 padding, where key and IV come from a single round of the
//! `EVP_BytesToKey` KDF over MD5. This matches the defaults of the widely
//! deployed browser-side crypto library, which is the whole point: the
//! passphrase is a shared secret, not transport security.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use rand::RngCore as _;
use serde_json::Value;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is missing the `Salted__` header")]
    MissingHeader,
    #[error("ciphertext is truncated, misaligned or was sealed with a different passphrase")]
    BadCiphertext,
    #[error("decrypted payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON error inside the envelope")]
    Json(#[from] serde_json::Error),
}

/// Seals and opens envelopes for a fixed passphrase.
#[derive(Clone)]
pub struct EnvelopeCipher {
    passphrase: Vec<u8>,
}

impl EnvelopeCipher {
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.as_bytes().to_vec(),
        }
    }

    /// Serialize `value` and seal it under a fresh random salt.
    pub fn encrypt(&self, value: &Value) -> Result<String, EnvelopeError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        self.encrypt_with_salt(value, salt)
    }

    fn encrypt_with_salt(&self, value: &Value, salt: [u8; SALT_LEN]) -> Result<String, EnvelopeError> {
        let plaintext = serde_json::to_vec(value)?;
        let (key, iv) = evp_bytes_to_key(&self.passphrase, &salt);

        let ciphertext =
            Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut envelope = Vec::with_capacity(MAGIC.len() + SALT_LEN + ciphertext.len());
        envelope.extend_from_slice(MAGIC);
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(envelope))
    }

    /// Open an envelope and parse the plaintext as JSON.
    pub fn decrypt(&self, payload: &str) -> Result<Value, EnvelopeError> {
        let envelope = BASE64.decode(payload.trim())?;

        let Some(rest) = envelope.strip_prefix(MAGIC) else {
            return Err(EnvelopeError::MissingHeader);
        };
        if rest.len() < SALT_LEN {
            return Err(EnvelopeError::BadCiphertext);
        }
        let (salt, ciphertext) = rest.split_at(SALT_LEN);
        let salt: [u8; SALT_LEN] = salt.try_into().map_err(|_| EnvelopeError::BadCiphertext)?;

        let (key, iv) = evp_bytes_to_key(&self.passphrase, &salt);
        let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| EnvelopeError::BadCiphertext)?;

        let json = String::from_utf8(plaintext)?;

        Ok(serde_json::from_str(&json)?)
    }
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher").finish_non_exhaustive()
    }
}

/// One-round `EVP_BytesToKey` over MD5, the OpenSSL `enc` default.
fn evp_bytes_to_key(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut derived = Vec::with_capacity(KEY_LEN + IV_LEN);
    let mut block: Vec<u8> = Vec::new();

    while derived.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(passphrase);
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        derived.extend_from_slice(&block);
    }

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&derived[..KEY_LEN]);
    iv.copy_from_slice(&derived[KEY_LEN..KEY_LEN + IV_LEN]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PASSPHRASE: &str = "ROBOT_CONTROL_SYSTEM";

    /// Produced by `openssl enc -aes-256-cbc -md md5` with salt
    /// `0102030405060708` over `{"cmd":"ping","seq":1}`.
    const OPENSSL_VECTOR: &str = "U2FsdGVkX18BAgMEBQYHCA/ORITI0ibuNGTYm5u1w4VikWFZCBxui/Y8+NEkvjCY";

    #[test]
    fn kdf_matches_openssl() {
        let salt = [1, 2, 3, 4, 5, 6, 7, 8];
        let (key, iv) = evp_bytes_to_key(PASSPHRASE.as_bytes(), &salt);

        assert_eq!(
            hex::encode(key),
            "6af36e3e7bad6c4fecca51d620584ac4975f7c462b72f3e8a15a333f4ff3e7ec"
        );
        assert_eq!(hex::encode(iv), "a4f4cb6db51fc973bf0a726590f5567f");
    }

    #[test]
    fn decrypts_reference_envelope() {
        let cipher = EnvelopeCipher::new(PASSPHRASE);

        let value = cipher.decrypt(OPENSSL_VECTOR).unwrap();

        assert_eq!(value, json!({"cmd": "ping", "seq": 1}));
    }

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let cipher = EnvelopeCipher::new(PASSPHRASE);
        let value = json!({
            "command": "process",
            "params": {"object": "c", "method": "greet", "args": {}},
            "nested": [1, 2.5, null, "text", {"k": true}],
        });

        let sealed = cipher.encrypt(&value).unwrap();
        assert_ne!(sealed, cipher.encrypt(&value).unwrap(), "salt must be random");

        assert_eq!(cipher.decrypt(&sealed).unwrap(), value);
    }

    #[test]
    fn fixed_salt_envelope_matches_reference() {
        let cipher = EnvelopeCipher::new(PASSPHRASE);

        let sealed = cipher
            .encrypt_with_salt(&json!({"cmd": "ping", "seq": 1}), [1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        assert_eq!(sealed, OPENSSL_VECTOR);
    }

    #[test]
    fn rejects_payload_without_header() {
        let cipher = EnvelopeCipher::new(PASSPHRASE);
        let payload = BASE64.encode(b"not an envelope at all");

        assert!(matches!(
            cipher.decrypt(&payload),
            Err(EnvelopeError::MissingHeader)
        ));
    }

    #[test]
    fn rejects_invalid_base64() {
        let cipher = EnvelopeCipher::new(PASSPHRASE);

        assert!(matches!(
            cipher.decrypt("%%% not base64 %%%"),
            Err(EnvelopeError::Base64(_))
        ));
    }

    #[test]
    fn wrong_passphrase_fails_to_open() {
        let cipher = EnvelopeCipher::new("WRONG_PASSPHRASE");

        assert!(matches!(
            cipher.decrypt(OPENSSL_VECTOR),
            Err(EnvelopeError::BadCiphertext)
        ));
    }
}
