use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to read key {path}: {source}")]
    ReadKey {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse key {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature does not match")]
    Mismatch,
}

impl SignError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::ReadKey { .. } | Self::InvalidKey { .. })
    }
}

/// Produces detached signatures in the encoded form stored in part records
/// and `.sig` files.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<String, SignError>;
}

/// Ed25519 signer; signatures are base64 of the 64 raw signature bytes.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Load a PKCS#8 PEM private key.
    pub fn load_pem(path: &Path) -> Result<Self, SignError> {
        use pkcs8::DecodePrivateKey;

        let pem = fs::read_to_string(path).map_err(|source| SignError::ReadKey {
            path: path.to_path_buf(),
            source,
        })?;
        let key = SigningKey::from_pkcs8_pem(&pem).map_err(|e| SignError::InvalidKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { key })
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, data: &[u8]) -> Result<String, SignError> {
        use ed25519_dalek::Signer as _;

        Ok(BASE64.encode(self.key.sign(data).to_bytes()))
    }
}

/// Load an SPKI PEM public key.
pub fn load_public_key_pem(path: &Path) -> Result<VerifyingKey, SignError> {
    use pkcs8::DecodePublicKey;

    let pem = fs::read_to_string(path).map_err(|source| SignError::ReadKey {
        path: path.to_path_buf(),
        source,
    })?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|e| SignError::InvalidKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Check an encoded signature produced by [`Ed25519Signer`].
pub fn verify_signature(key: &VerifyingKey, data: &[u8], encoded: &str) -> Result<(), SignError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| SignError::MalformedSignature(e.to_string()))?;
    let signature =
        Signature::from_slice(&raw).map_err(|e| SignError::MalformedSignature(e.to_string()))?;
    key.verify_strict(data, &signature)
        .map_err(|_| SignError::Mismatch)
}
