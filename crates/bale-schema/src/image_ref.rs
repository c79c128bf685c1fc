use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A container image reference of the form `<repository>:<tag>`.
///
/// The repository may carry a registry host with a port
/// (`registry.local:5000/team/app:1.2`); the tag is whatever follows the last
/// `:` after the last `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    raw: String,
    tag_at: usize,
}

impl ImageRef {
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let raw = input.trim();
        let name_start = raw.rfind('/').map_or(0, |i| i + 1);
        let tag_sep = raw[name_start..]
            .rfind(':')
            .map(|i| name_start + i)
            .ok_or_else(|| SchemaError::InvalidImageRef(raw.to_owned()))?;

        let repository = &raw[..tag_sep];
        let tag = &raw[tag_sep + 1..];
        if repository.is_empty()
            || tag.is_empty()
            || repository.ends_with('/')
            || raw.contains(char::is_whitespace)
        {
            return Err(SchemaError::InvalidImageRef(raw.to_owned()));
        }

        Ok(Self {
            raw: raw.to_owned(),
            tag_at: tag_sep,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn repository(&self) -> &str {
        &self.raw[..self.tag_at]
    }

    pub fn tag(&self) -> &str {
        &self.raw[self.tag_at + 1..]
    }

    /// Registry host the repository lives on, if the repository names one.
    ///
    /// `xy.io/app` yields `xy.io`; a bare `app` yields `None`.
    pub fn server_address(&self) -> Option<&str> {
        let repo = self.repository();
        repo.split_once('/').map(|(server, _)| server)
    }

    /// Flat name usable as a file name prefix.
    pub fn file_stem(&self) -> String {
        self.raw.replace(['/', ':'], "_")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for ImageRef {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.raw
    }
}
