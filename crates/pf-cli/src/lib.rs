//! Portal Fusion CLI
//!
//! Command-line access to the local device's trust state:
//! - Inspecting the device identity and certificate
//! - Exporting, importing and verifying certificates
//! - Listing and removing paired devices
//! - Running an in-process pairing between two devices

pub mod cli;
pub mod config;
pub mod output;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{OutputFormat, OutputFormatter};

use pf_core::CoreError;

/// Process exit codes, stable for scripting.
///
/// - 0: Success
/// - 1: General error
/// - 2: Authentication failed (wrong PIN, bad proof)
/// - 3: Timeout (pairing session expired)
/// - 5: Invalid input
/// - 6: Not paired
/// - 7: Trust failure (certificate rejected)
/// - 8: Rate limited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AuthenticationFailed = 2,
    Timeout = 3,
    InvalidInput = 5,
    NotPaired = 6,
    TrustFailure = 7,
    RateLimited = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&CoreError> for ExitCode {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::Authentication(_) => ExitCode::AuthenticationFailed,
            CoreError::SessionExpired(_) => ExitCode::Timeout,
            CoreError::CryptoInput(_) | CoreError::InvalidPayload(_) | CoreError::Config(_) => {
                ExitCode::InvalidInput
            }
            CoreError::Trust(_) => ExitCode::TrustFailure,
            CoreError::RateLimitExceeded { .. } => ExitCode::RateLimited,
            _ => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NotPaired => "NOT_PAIRED",
            ExitCode::TrustFailure => "TRUST_FAILURE",
            ExitCode::RateLimited => "RATE_LIMITED",
        }
    }
}
