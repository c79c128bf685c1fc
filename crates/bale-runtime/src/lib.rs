//! Container runtime backends and registry credentials for Bale.
//!
//! This crate implements the image source side of a build: the pluggable
//! `ContainerRuntime` trait with a `docker` CLI backend and an in-memory mock
//! backend, plus lookup of registry credentials from a docker-style
//! `config.json`.

pub mod backend;
pub mod credentials;
pub mod docker;
pub mod mock;

pub use backend::{select_runtime, ContainerRuntime};
pub use credentials::{Credential, CredentialSet};
pub use docker::DockerCliRuntime;
pub use mock::MockRuntime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available")]
    BackendUnavailable(String),
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),
    #[error("image not found locally or in any registry: {0}")]
    ImageNotFound(String),
    #[error("pull of '{image}' failed: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("export of '{image}' failed: {reason}")]
    ExportFailed { image: String, reason: String },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("invalid credentials file: {0}")]
    InvalidCredentials(String),
}

impl RuntimeError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::InvalidCredentials(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_unreachable_read_differently() {
        let nf = RuntimeError::ImageNotFound("xy.io/a:1".to_owned()).to_string();
        let un = RuntimeError::Unreachable("connection refused".to_owned()).to_string();
        assert!(nf.contains("not found"));
        assert!(un.contains("unreachable"));
        assert_ne!(nf, un);
    }

    #[test]
    fn runtime_failures_are_system_errors() {
        assert!(!RuntimeError::ImageNotFound("a:1".to_owned()).is_user_error());
        assert!(!RuntimeError::Unreachable("x".to_owned()).is_user_error());
        assert!(RuntimeError::InvalidCredentials("x".to_owned()).is_user_error());
    }
}
