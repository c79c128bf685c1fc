use crate::codec;
use crate::signer::{verify_signature, SignError};
use bale_schema::{Codec, PackageId, PackageManifest, Part, SchemaError};
use ed25519_dalek::VerifyingKey;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid manifest: {0}")]
    Manifest(#[from] SchemaError),
    #[error("manifest signature: {0}")]
    ManifestSignature(SignError),
    #[error("image {0} has no part")]
    MissingPart(String),
    #[error("part {part}: source URL '{url}' does not name a part file")]
    BadSource { part: String, url: String },
    #[error("part {part}: stored size {actual} differs from recorded {expected}")]
    SizeMismatch {
        part: String,
        expected: i64,
        actual: u64,
    },
    #[error("part {part}: content digest is {actual}")]
    DigestMismatch { part: String, actual: String },
    #[error("part {part}: no signature verifies against the given key")]
    PartSignature { part: String },
}

/// What a successful verification covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub id: PackageId,
    pub package_dir: PathBuf,
    pub parts: usize,
    /// Sum of the stored part sizes.
    pub stored_bytes: u64,
}

/// `<manifest>.sig`
pub fn signature_path(manifest_file: &Path) -> PathBuf {
    let mut name = OsString::from(manifest_file.as_os_str());
    name.push(".sig");
    PathBuf::from(name)
}

/// Check a committed package against the public key it was signed with.
///
/// Verifies the manifest signature, that every declared image has a part, and
/// for each part its stored size, the digest of its decompressed content, and
/// its signature over that digest.
pub fn verify_package(manifest_file: &Path, key: &VerifyingKey) -> Result<VerifyReport, VerifyError> {
    let bytes = read(manifest_file)?;
    let sig_file = signature_path(manifest_file);
    let signature = String::from_utf8_lossy(&read(&sig_file)?).into_owned();
    verify_signature(key, &bytes, &signature).map_err(VerifyError::ManifestSignature)?;

    let manifest = PackageManifest::from_slice(&bytes)?;
    for image in &manifest.meta.images {
        if !manifest.parts.values().any(|p| p.description == *image) {
            return Err(VerifyError::MissingPart(image.clone()));
        }
    }

    let package_dir = manifest_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(manifest.id.as_str());
    let mut stored_bytes = 0;
    for part in manifest.parts.values() {
        stored_bytes += verify_part(&package_dir, part, key)?;
    }

    Ok(VerifyReport {
        id: manifest.id,
        parts: manifest.parts.len(),
        package_dir,
        stored_bytes,
    })
}

fn verify_part(package_dir: &Path, part: &Part, key: &VerifyingKey) -> Result<u64, VerifyError> {
    let bad_source = || VerifyError::BadSource {
        part: part.id.to_string(),
        url: part.source.url.clone(),
    };
    let file_name = Url::parse(&part.source.url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back()).map(str::to_owned))
        .ok_or_else(bad_source)?;
    let part_codec = Codec::from_file_name(&file_name).ok_or_else(bad_source)?;
    if file_name != format!("{}.{}", part.digest, part_codec.extension()) {
        return Err(bad_source());
    }

    let path = package_dir.join(&file_name);
    let actual_size = fs::metadata(&path)
        .map_err(|source| VerifyError::Read {
            path: path.clone(),
            source,
        })?
        .len();
    if i64::try_from(actual_size).ok() != Some(part.size_bytes) {
        return Err(VerifyError::SizeMismatch {
            part: part.id.to_string(),
            expected: part.size_bytes,
            actual: actual_size,
        });
    }

    let read_err = |source| VerifyError::Read {
        path: path.clone(),
        source,
    };
    let file = File::open(&path).map_err(read_err)?;
    let mut reader = codec::decoder(part_codec, BufReader::new(file)).map_err(read_err)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher).map_err(read_err)?;
    let digest = hasher.finalize();

    let hex = digest.to_hex();
    if hex.as_str() != part.digest || part.id.as_str() != part.digest {
        return Err(VerifyError::DigestMismatch {
            part: part.id.to_string(),
            actual: hex.to_string(),
        });
    }

    if !part
        .signatures
        .iter()
        .any(|s| verify_signature(key, digest.as_bytes(), s).is_ok())
    {
        return Err(VerifyError::PartSignature {
            part: part.id.to_string(),
        });
    }

    debug!("verified part {} ({actual_size} bytes)", part.id);
    Ok(actual_size)
}

fn read(path: &Path) -> Result<Vec<u8>, VerifyError> {
    fs::read(path).map_err(|source| VerifyError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_sits_next_to_manifest() {
        assert_eq!(
            signature_path(Path::new("/out/abc.json")),
            PathBuf::from("/out/abc.json.sig")
        );
    }

    #[test]
    fn missing_manifest_is_read_error() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]).verifying_key();
        assert!(matches!(
            verify_package(Path::new("/nonexistent/bale/x.json"), &key),
            Err(VerifyError::Read { .. })
        ));
    }
}
