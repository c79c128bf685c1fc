//! Package build pipeline for Bale.
//!
//! This crate ties the schema, store, and runtime crates together into the
//! `Orchestrator`, which fans one worker out per image, collects their parts
//! into a signed manifest, and commits the package atomically. It also holds
//! the `Reporter` every component prints through, the signing and codec
//! layers, and offline package verification.

pub mod codec;
pub mod concurrency;
pub mod lifecycle;
pub mod orchestrator;
pub mod reporter;
pub mod signer;
pub mod verify;
pub mod worker;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use lifecycle::{validate_transition, BuildPhase};
pub use orchestrator::{
    AbortSummary, BuildOptions, BuildOutcome, BuildRequest, CommittedPackage, Orchestrator,
};
pub use reporter::{DelegateError, RegisterError, Reporter, Stream};
pub use signer::{load_public_key_pem, verify_signature, Ed25519Signer, SignError, Signer};
pub use verify::{signature_path, verify_package, VerifyError, VerifyReport};
pub use worker::{run_part_worker, WorkerContext, WorkerError, WorkerOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] bale_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] bale_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] bale_runtime::RuntimeError),
    #[error("signing error: {0}")]
    Sign(#[from] SignError),
    #[error("reporter error: {0}")]
    Reporter(#[from] RegisterError),
    #[error("invalid URL base '{url}': {reason}")]
    InvalidUrlBase { url: String, reason: String },
    #[error("invalid build phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True when the caller's input, not the environment, caused the failure.
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Schema(e) => e.is_user_error(),
            Self::Store(e) => e.is_user_error(),
            Self::Runtime(e) => e.is_user_error(),
            Self::Sign(e) => e.is_user_error(),
            Self::InvalidUrlBase { .. } => true,
            Self::Reporter(_) | Self::InvalidTransition { .. } | Self::Io(_) => false,
        }
    }
}
