//! qpatch - command-line front end for the deployment pipeline
//!
//! This crate provides:
//! - Argument parsing and config resolution
//! - Console progress output for every pipeline stage
//! - Wiring of the ADB client, signer and patch registry into one run

pub mod cli;
pub mod config;
pub mod console;

pub use cli::Cli;
pub use config::{load_config, CliOverrides, ConfigError, LoadedConfig};

/// Exit codes for CLI operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Every stage completed (exit code 0)
    Success = 0,
    /// A stage or the setup failed (exit code 1)
    Failure = 1,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as u8, 0);
        assert_eq!(ExitCode::Failure as u8, 1);
    }
}
