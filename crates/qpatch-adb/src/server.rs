//! Local ADB server bootstrap.
//!
//! The server binary itself is provided externally (platform-tools). This
//! module only makes sure a server is listening, starting one if needed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::client::AdbClient;
use crate::error::AdbError;
use crate::traits::DeviceLink;

const START_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolve the ADB executable: the configured path, or `adb` from `PATH`.
pub fn locate_adb(configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(path) => path.to_path_buf(),
        None if cfg!(windows) => PathBuf::from("adb.exe"),
        None => PathBuf::from("adb"),
    }
}

/// Handle on the local ADB server process.
pub struct AdbServer {
    adb_path: PathBuf,
    client: AdbClient,
    start_timeout: Duration,
}

impl AdbServer {
    pub fn new(adb_path: PathBuf, client: AdbClient) -> Self {
        Self {
            adb_path,
            client,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    /// Make sure a server is reachable, starting one if none answers.
    ///
    /// Idempotent: when a server is already running this only queries its version.
    /// Returns the server's protocol version.
    pub async fn ensure_running(&self) -> Result<u32, AdbError> {
        match self.client.server_version().await {
            Ok(version) => {
                debug!(version, addr = %self.client.addr(), "ADB server already running");
                return Ok(version);
            }
            Err(e) => debug!(error = %e, "ADB server not reachable, starting it"),
        }

        self.start().await?;

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            match self.client.server_version().await {
                Ok(version) => {
                    info!(version, addr = %self.client.addr(), "ADB server started");
                    return Ok(version);
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    warn!(error = %e, "ADB server did not come up in time");
                    return Err(AdbError::ServerStart(format!(
                        "server not reachable at {} after start: {}",
                        self.client.addr(),
                        e
                    )));
                }
                Err(_) => tokio::time::sleep(START_POLL_INTERVAL).await,
            }
        }
    }

    async fn start(&self) -> Result<(), AdbError> {
        info!(adb = %self.adb_path.display(), "Starting ADB server");
        let output = Command::new(&self.adb_path)
            .arg("-P")
            .arg(self.client.config().port.to_string())
            .arg("start-server")
            .output()
            .await
            .map_err(|e| {
                AdbError::ServerStart(format!("failed to run {}: {}", self.adb_path.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdbError::ServerStart(format!(
                "{} start-server exited with {}: {}",
                self.adb_path.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
