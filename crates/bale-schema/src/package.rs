use crate::identity::compute_package_id;
use crate::image_ref::ImageRef;
use crate::types::{PackageId, PartId};
use crate::{SchemaError, MANIFEST_FORMAT_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartSource {
    pub url: String,
}

/// One exported, compressed, and signed image inside a package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Part {
    pub id: PartId,
    /// Hex digest of the uncompressed image stream.
    pub digest: String,
    /// The image reference this part was exported from.
    pub description: String,
    pub signatures: Vec<String>,
    /// Size of the stored (compressed) artifact in bytes.
    pub size_bytes: i64,
    pub source: PartSource,
}

impl Part {
    /// Build a part whose id is its content digest.
    pub fn from_digest(
        digest: impl Into<String>,
        image: &ImageRef,
        signatures: Vec<String>,
        size_bytes: i64,
        source_url: impl Into<String>,
    ) -> Self {
        let digest = digest.into();
        Self {
            id: PartId::new(digest.clone()),
            digest,
            description: image.to_string(),
            signatures,
            size_bytes,
            source: PartSource {
                url: source_url.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageMeta {
    pub author: String,
    pub created: DateTime<Utc>,
    pub images: Vec<String>,
}

/// Serialized package document, written next to the package directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub format_version: u32,
    pub id: PackageId,
    pub meta: PackageMeta,
    pub parts: BTreeMap<PartId, Part>,
}

impl PackageManifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaError> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(SchemaError::UnsupportedVersion(manifest.format_version));
        }
        Ok(manifest)
    }
}

/// Accumulates parts registered by concurrent workers and produces the final
/// manifest once all of them are in.
///
/// `add_part` takes `&self` and is safe to call from any number of threads.
#[derive(Debug)]
pub struct PackageBuilder {
    id: PackageId,
    author: String,
    created: DateTime<Utc>,
    images: Vec<String>,
    parts: Mutex<BTreeMap<PartId, Part>>,
}

impl PackageBuilder {
    /// Create a builder for the given image references. Surrounding
    /// whitespace is trimmed, blank entries are dropped, and repeated
    /// references are collapsed, keeping first-seen order.
    ///
    /// References are not parsed here; each part worker validates its own.
    pub fn new<S: AsRef<str>>(author: &str, images: &[S]) -> Result<Self, SchemaError> {
        Self::with_created(author, images, Utc::now())
    }

    pub fn with_created<S: AsRef<str>>(
        author: &str,
        images: &[S],
        created: DateTime<Utc>,
    ) -> Result<Self, SchemaError> {
        let author = author.trim();
        if author.is_empty() {
            return Err(SchemaError::EmptyAuthor);
        }

        let mut unique: Vec<String> = Vec::with_capacity(images.len());
        for image in images.iter().map(|i| i.as_ref().trim()) {
            if !image.is_empty() && !unique.iter().any(|u| u == image) {
                unique.push(image.to_owned());
            }
        }
        if unique.is_empty() {
            return Err(SchemaError::NoImages);
        }

        Ok(Self {
            id: compute_package_id(author, &unique, created),
            author: author.to_owned(),
            created,
            images: unique,
            parts: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> &PackageId {
        &self.id
    }

    #[inline]
    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn add_part(&self, part: Part) -> Result<Part, SchemaError> {
        if !self.images.iter().any(|i| *i == part.description) {
            return Err(SchemaError::UndeclaredImage(part.description));
        }

        let mut parts = self.parts.lock().map_err(|_| SchemaError::Poisoned)?;
        if let Some(existing) = parts.get(&part.id) {
            return Err(SchemaError::DuplicatePart {
                id: part.id.to_string(),
                existing: existing.description.clone(),
            });
        }
        if let Some(existing) = parts.values().find(|p| p.description == part.description) {
            return Err(SchemaError::DuplicatePart {
                id: existing.id.to_string(),
                existing: existing.description.clone(),
            });
        }
        parts.insert(part.id.clone(), part.clone());
        Ok(part)
    }

    pub fn part_count(&self) -> Result<usize, SchemaError> {
        Ok(self.parts.lock().map_err(|_| SchemaError::Poisoned)?.len())
    }

    /// Snapshot the registered parts into a manifest and its serialized bytes.
    ///
    /// Every declared image must have exactly one registered part.
    pub fn build(&self) -> Result<(PackageManifest, Vec<u8>), SchemaError> {
        let parts = self
            .parts
            .lock()
            .map_err(|_| SchemaError::Poisoned)?
            .clone();

        for image in &self.images {
            if !parts.values().any(|p| p.description == *image) {
                return Err(SchemaError::MissingPart(image.clone()));
            }
        }

        let manifest = PackageManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            id: self.id.clone(),
            meta: PackageMeta {
                author: self.author.clone(),
                created: self.created,
                images: self.images.clone(),
            },
            parts,
        };
        let mut bytes = serde_json::to_vec_pretty(&manifest)?;
        bytes.push(b'\n');
        Ok((manifest, bytes))
    }
}
