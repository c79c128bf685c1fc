use crate::types::PackageId;
use chrono::{DateTime, SecondsFormat, Utc};

/// Derive the identifier for one package build.
///
/// The id covers the author, the declared images in input order, and the build
/// timestamp. It is not content-derived: two builds of identical images at
/// different instants yield different package ids, while their part ids stay
/// equal.
pub fn compute_package_id(author: &str, images: &[String], created: DateTime<Utc>) -> PackageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"bale-package-v1\0");
    hasher.update(format!("author:{author}\0").as_bytes());
    for image in images {
        hasher.update(format!("image:{image}\0").as_bytes());
    }
    hasher.update(
        format!(
            "created:{}",
            created.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
        .as_bytes(),
    );
    PackageId::new(hasher.finalize().to_hex().to_string())
}
