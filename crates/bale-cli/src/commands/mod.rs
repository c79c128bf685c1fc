pub mod completions;
pub mod create;
pub mod keygen;
pub mod man_pages;
pub mod verify;

use bale_core::CoreError;
use std::fmt;

pub const EXIT_SUCCESS: u8 = 0;
/// Environment or system failure: daemon down, disk full, signing broke.
pub const EXIT_FAILURE: u8 = 1;
/// The caller's input was wrong: bad reference, missing setting, unreadable key.
pub const EXIT_USER_ERROR: u8 = 2;
/// A package failed verification.
pub const EXIT_VERIFY_FAILED: u8 = 3;

/// A command failure carrying the exit code it should produce.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_USER_ERROR,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for CliError {
    fn from(e: CoreError) -> Self {
        if e.is_user_error() {
            Self::user(e.to_string())
        } else {
            Self::system(e.to_string())
        }
    }
}

pub fn json_pretty(value: &serde_json::Value) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::system(format!("JSON serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_exit_codes() {
        let user: CliError = CoreError::Schema(bale_schema::SchemaError::NoImages).into();
        assert_eq!(user.code, EXIT_USER_ERROR);
        let system: CliError = CoreError::Io(std::io::Error::other("disk")).into();
        assert_eq!(system.code, EXIT_FAILURE);
    }
}
