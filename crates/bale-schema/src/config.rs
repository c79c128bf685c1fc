//! Optional TOML build configuration, merged under command-line flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull only when the image is absent locally.
    #[default]
    IfMissing,
    /// Pull even when a local copy exists.
    Always,
    /// Assume every image is already present.
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    #[default]
    Gzip,
    Zstd,
    None,
}

impl Codec {
    /// File extension of an artifact stored with this codec.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "tgz",
            Self::Zstd => "tar.zst",
            Self::None => "tar",
        }
    }

    /// Recover the codec from an artifact file name written by [`Codec::extension`].
    pub fn from_file_name(name: &str) -> Option<Self> {
        [Self::Zstd, Self::Gzip, Self::None]
            .into_iter()
            .find(|codec| {
                name.strip_suffix(codec.extension())
                    .is_some_and(|stem| stem.ends_with('.'))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub url_base: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub credentials: Option<PathBuf>,
    #[serde(default)]
    pub pull: Option<PullPolicy>,
    #[serde(default)]
    pub allow_anonymous_pull: Option<bool>,
    #[serde(default)]
    pub codec: Option<Codec>,
    #[serde(default)]
    pub keep_failed: Option<bool>,
}

pub fn parse_config_str(input: &str) -> Result<BuildConfig, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<BuildConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
