//! AES-128-CBC payload encryption.
//!
//! An encrypted payload is `iv(16) ∥ ciphertext`, with a fresh random IV
//! per message and PKCS#7 padding. There is no authentication tag: CBC
//! ciphertext is malleable, and tampering surfaces downstream as a padding
//! or message-decode failure. The key is generated by the server per
//! session, travels base64-encoded inside `KEY_EXCHANGE`, and is wiped
//! from memory when the session drops it.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;
/// CBC initialization vector size in bytes.
pub const IV_SIZE: usize = 16;
/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// A 16-byte session key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh random key from the OS entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Encode for the `KEY_EXCHANGE` message.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Decode from a `KEY_EXCHANGE` message.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::crypto(format!("key is not valid base64: {e}")))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::crypto(format!("key must be {KEY_SIZE} bytes")))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SessionKey(..)")
    }
}

/// Symmetric cipher applied around the message codec.
pub struct PayloadCipher {
    key: SessionKey,
}

impl PayloadCipher {
    /// Create a cipher using `key`.
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    /// Encrypt a serialized message. Returns `iv ∥ ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new(&self.key.0.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt `iv ∥ ciphertext` back into the serialized message.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_SIZE + BLOCK_SIZE {
            return Err(Error::crypto(format!(
                "encrypted payload of {} bytes is shorter than IV plus one block",
                data.len()
            )));
        }
        let (iv, ciphertext) = data.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(Error::crypto("ciphertext is not block-aligned"));
        }

        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| Error::crypto("bad IV"))?;
        Aes128CbcDec::new(&self.key.0.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::crypto("padding check failed (corrupt data or wrong key)"))
    }
}
