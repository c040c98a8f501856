//! RSA-2048 key primitives: generation, PEM ser/de, PSS-SHA256 signatures,
//! and chunked OAEP-SHA256 encryption.
//!
//! Encryption splits plaintext into 190-byte blocks (each block yields
//! exactly 256 bytes of ciphertext); decryption splits ciphertext into
//! 256-byte blocks (each block yields up to 190 bytes of plaintext). A
//! short tail block is still encrypted/decrypted as its own final chunk.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

pub const KEY_BITS: usize = 2048;
const ENCRYPT_CHUNK: usize = 190;
const DECRYPT_CHUNK: usize = 256;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    Generation(rsa::Error),
    #[error("PEM encode/decode failed: {0}")]
    Pem(String),
    #[error("unrecognized PEM banner: not a public or private key")]
    UnknownPemKind,
    #[error("decryption failed: {0}")]
    Decrypt(rsa::Error),
    #[error("encryption failed: {0}")]
    Encrypt(rsa::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Either half of an RSA key pair, as deserialized from PEM. `deserialize`
/// auto-detects which one it got from the PEM banner.
pub enum AnyKey {
    Private(RsaPrivateKey),
    Public(RsaPublicKey),
}

pub fn generate() -> Result<RsaPrivateKey> {
    let mut rng = OsRng;
    RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(CryptoError::Generation)
}

pub fn sign(key: &RsaPrivateKey, data: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let mut rng = OsRng;
    let signature: Signature = signing_key.sign_with_rng(&mut rng, data);
    signature.to_vec()
}

/// Never raises: any signature-verification error (bad signature, malformed
/// bytes) collapses to `false`, matching the source's `try/except
/// InvalidSignature` wrapper.
pub fn verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
    let sig = match Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verifying_key.verify(data, &sig).is_ok()
}

pub fn serialize_private(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let pem = key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))?;
    Ok(pem.as_bytes().to_vec())
}

pub fn serialize_public(key: &RsaPublicKey) -> Result<Vec<u8>> {
    let pem = key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))?;
    Ok(pem.into_bytes())
}

/// Auto-detects public vs private key from the PEM banner.
pub fn deserialize(pem: &[u8]) -> Result<AnyKey> {
    let text = std::str::from_utf8(pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
    if text.contains("PRIVATE KEY") {
        let key = RsaPrivateKey::from_pkcs1_pem(text).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(AnyKey::Private(key))
    } else if text.contains("PUBLIC KEY") {
        let key = RsaPublicKey::from_pkcs1_pem(text).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(AnyKey::Public(key))
    } else {
        Err(CryptoError::UnknownPemKind)
    }
}

pub fn deserialize_public(pem: &[u8]) -> Result<RsaPublicKey> {
    match deserialize(pem)? {
        AnyKey::Public(key) => Ok(key),
        AnyKey::Private(key) => Ok(RsaPublicKey::from(&key)),
    }
}

pub fn deserialize_private(pem: &[u8]) -> Result<RsaPrivateKey> {
    match deserialize(pem)? {
        AnyKey::Private(key) => Ok(key),
        AnyKey::Public(_) => Err(CryptoError::UnknownPemKind),
    }
}

pub fn encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut rng = OsRng;
    let mut out = Vec::with_capacity((data.len() / ENCRYPT_CHUNK + 1) * DECRYPT_CHUNK);
    for chunk in data.chunks(ENCRYPT_CHUNK) {
        let padding = Oaep::new::<Sha256>();
        let block = key
            .encrypt(&mut rng, padding, chunk)
            .map_err(CryptoError::Encrypt)?;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

pub fn decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(DECRYPT_CHUNK) {
        let padding = Oaep::new::<Sha256>();
        let block = key.decrypt(padding, chunk).map_err(CryptoError::Decrypt)?;
        out.extend_from_slice(&block);
    }
    Ok(out)
}
