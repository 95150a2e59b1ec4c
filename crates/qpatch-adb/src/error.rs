//! Error types for the device link.

use thiserror::Error;

/// Errors raised while talking to the ADB server or a device.
#[derive(Debug, Error)]
pub enum AdbError {
    /// TCP connection to the ADB server could not be established
    #[error("failed to connect to adb server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Server answered a request with FAIL
    #[error("adb request failed: {0}")]
    Refused(String),

    /// Server or device answered with something the protocol does not allow
    #[error("unexpected adb response: {0}")]
    UnexpectedResponse(String),

    /// Request or reply could not be framed
    #[error("malformed adb frame: {0}")]
    Framing(String),

    /// A device-side command ran but reported failure
    #[error("device command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    /// The sync service rejected a file transfer
    #[error("file transfer failed for {path}: {message}")]
    Sync { path: String, message: String },

    /// The local ADB server process could not be started
    #[error("failed to start adb server: {0}")]
    ServerStart(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdbError {
    pub(crate) fn command_failed(command: impl Into<String>, output: impl AsRef<str>) -> Self {
        AdbError::CommandFailed {
            command: command.into(),
            output: output.as_ref().trim().to_string(),
        }
    }
}
