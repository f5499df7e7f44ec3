//! `CryptoContext`: password-derived symmetric encryption for secret
//! values embedded in source YAML.
//!
//! Derivation is PBKDF2-HMAC-SHA512 over the `OCTOPLOY_KEY` password with
//! a fixed salt, producing a 32-byte AES-256 key. Encryption is AES-256-CBC
//! with a random IV; a SHA-256 digest of the plaintext is appended before
//! PKCS7 padding so decryption can detect a wrong key or corrupted
//! ciphertext instead of returning garbage.

use aes::Aes256;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use snafu::Snafu;

const TOKEN_PREFIX: &str = "OctoCrypt!";
const PBKDF2_SALT: &[u8; 16] = b"octoploy-v1-salt";
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("OCTOPLOY_KEY environment variable is not set"))]
    MissingKey,

    #[snafu(display("value is not a recognized {TOKEN_PREFIX} token"))]
    NotAToken,

    #[snafu(display("Could not decrypt value"))]
    IntegrityCheckFailed,

    #[snafu(display("malformed encrypted token: {message}"))]
    Malformed { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Holds the derived key for one run. Constructed once from `OCTOPLOY_KEY`
/// and threaded by reference through the pipeline; never a global.
pub struct CryptoContext {
    key: [u8; KEY_LEN],
}

impl CryptoContext {
    pub fn from_env() -> Result<Self> {
        let password = std::env::var("OCTOPLOY_KEY").map_err(|_| Error::MissingKey)?;
        Ok(Self::from_password(&password))
    }

    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<sha2::Sha512>(password.as_bytes(), PBKDF2_SALT, PBKDF2_ITERATIONS, &mut key);
        CryptoContext { key }
    }

    pub fn is_token(value: &str) -> bool {
        value.starts_with(TOKEN_PREFIX)
    }

    /// Encrypts `plaintext`, returning an `OctoCrypt!`-prefixed token.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut buf = Vec::with_capacity(plaintext.len() + DIGEST_LEN + 16);
        buf.extend_from_slice(plaintext.as_bytes());
        buf.extend_from_slice(&Sha256::digest(plaintext.as_bytes()));

        let encryptor = Aes256CbcEnc::new(&self.key.into(), &iv.into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(&buf);

        let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);

        format!(
            "{TOKEN_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        )
    }

    /// Decrypts a token previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let encoded = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(Error::NotAToken)?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Malformed {
                message: e.to_string(),
            })?;
        if payload.len() < IV_LEN {
            return Err(Error::Malformed {
                message: "token shorter than IV".to_string(),
            });
        }
        let (iv, ciphertext) = payload.split_at(IV_LEN);

        let decryptor = Aes256CbcDec::new(&self.key.into(), iv.into());
        let mut buf = ciphertext.to_vec();
        let plaintext_with_digest = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| Error::IntegrityCheckFailed)?;

        if plaintext_with_digest.len() < DIGEST_LEN {
            return Err(Error::IntegrityCheckFailed);
        }
        let split_at = plaintext_with_digest.len() - DIGEST_LEN;
        let (plaintext, digest) = plaintext_with_digest.split_at(split_at);
        if Sha256::digest(plaintext).as_slice() != digest {
            return Err(Error::IntegrityCheckFailed);
        }

        String::from_utf8(plaintext.to_vec()).map_err(|_| Error::Malformed {
            message: "decrypted plaintext is not valid utf-8".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let ctx = CryptoContext::from_password("correct horse battery staple");
        let token = ctx.encrypt("s3cr3t");
        assert!(CryptoContext::is_token(&token));
        assert_eq!(ctx.decrypt(&token).unwrap(), "s3cr3t");
    }

    #[test]
    fn wrong_key_fails_integrity_check() {
        let ctx = CryptoContext::from_password("correct horse battery staple");
        let token = ctx.encrypt("s3cr3t");

        let wrong = CryptoContext::from_password("wrong password");
        let err = wrong.decrypt(&token).unwrap_err();
        matches!(err, Error::IntegrityCheckFailed);
    }

    #[test]
    fn non_token_is_rejected() {
        let ctx = CryptoContext::from_password("x");
        let err = ctx.decrypt("plain text").unwrap_err();
        matches!(err, Error::NotAToken);
    }

    #[test]
    fn each_encryption_uses_a_fresh_iv() {
        let ctx = CryptoContext::from_password("x");
        let a = ctx.encrypt("same plaintext");
        let b = ctx.encrypt("same plaintext");
        assert_ne!(a, b);
    }
}
