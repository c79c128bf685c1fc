//! Image references, package manifests, and package identity for Bale.
//!
//! This crate defines the schema layer: container image reference parsing
//! (`ImageRef`), the signed part record (`Part`), the serialized package
//! manifest (`PackageManifest`), the concurrent part accumulator
//! (`PackageBuilder`), package identifier derivation, and the optional TOML
//! build configuration (`BuildConfig`).

pub mod config;
pub mod identity;
pub mod image_ref;
pub mod package;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, BuildConfig, Codec, ConfigError, PullPolicy,
};
pub use identity::compute_package_id;
pub use image_ref::ImageRef;
pub use package::{PackageBuilder, PackageManifest, PackageMeta, Part, PartSource};
pub use types::{PackageId, PartId};

use thiserror::Error;

/// Version of the manifest document written by [`PackageBuilder::build`].
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unable to parse image reference '{0}': expected '<repository>:<tag>'")]
    InvalidImageRef(String),
    #[error("package author must not be empty")]
    EmptyAuthor,
    #[error("package must declare at least one image")]
    NoImages,
    #[error(
        "part '{id}' already registered for image '{existing}': images whose exports are \
         byte-identical cannot appear in one package"
    )]
    DuplicatePart { id: String, existing: String },
    #[error("part description '{0}' does not name a declared image")]
    UndeclaredImage(String),
    #[error("no part registered for declared image '{0}'")]
    MissingPart(String),
    #[error("accumulator lock poisoned")]
    Poisoned,
    #[error("unsupported manifest format_version: {0}, expected {MANIFEST_FORMAT_VERSION}")]
    UnsupportedVersion(u32),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchemaError {
    /// Whether the error stems from operator input rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidImageRef(_) | Self::EmptyAuthor | Self::NoImages
        )
    }
}
