//! The device-link seam used by the pipeline.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::device::{Device, PackageVersion};
use crate::error::AdbError;

/// Default permission bits for pushed files (regular file, 0644).
pub const DEFAULT_FILE_MODE: u32 = 0o100644;

/// Remote directory used to stage archives for `pm install`.
pub const INSTALL_STAGING_DIR: &str = "/data/local/tmp";

/// Operations the pipeline performs against one remote device.
///
/// Implementors provide transport-level primitives (listing, shell,
/// push, pull). Package management is layered on top of `shell` so every
/// implementation shares the same command syntax and output checks.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Protocol version reported by the server.
    async fn server_version(&self) -> Result<u32, AdbError>;

    /// All devices currently known to the server.
    async fn list_devices(&self) -> Result<Vec<Device>, AdbError>;

    /// Run a shell command and return its combined output.
    async fn shell(&self, device: &Device, command: &str) -> Result<String, AdbError>;

    /// Stream `source` to `remote_path` on the device.
    async fn push(
        &self,
        device: &Device,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> Result<u64, AdbError>;

    /// Stream `remote_path` from the device into `sink`.
    async fn pull(
        &self,
        device: &Device,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, AdbError>;

    /// Installed version of `package`, or `None` if it is not installed.
    async fn package_version(
        &self,
        device: &Device,
        package: &str,
    ) -> Result<Option<PackageVersion>, AdbError> {
        let output = self
            .shell(device, &format!("dumpsys package {}", shell_quote(package)))
            .await?;
        Ok(PackageVersion::parse_dumpsys(&output))
    }

    /// Path of the installed base archive of `package`.
    async fn package_path(
        &self,
        device: &Device,
        package: &str,
    ) -> Result<Option<String>, AdbError> {
        let output = self
            .shell(device, &format!("pm path {}", shell_quote(package)))
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .find(|path| path.ends_with("base.apk"))
            .or_else(|| {
                output
                    .lines()
                    .find_map(|line| line.trim().strip_prefix("package:"))
            })
            .map(str::to_string))
    }

    /// Uninstall `package`. Fails unless the package manager reports success.
    async fn uninstall(&self, device: &Device, package: &str) -> Result<(), AdbError> {
        let command = format!("pm uninstall {}", shell_quote(package));
        let output = self.shell(device, &command).await?;
        expect_success(&command, &output)
    }

    /// Install an archive already present on the device.
    async fn install_remote(&self, device: &Device, remote_path: &str) -> Result<(), AdbError> {
        let command = format!("pm install -r {}", shell_quote(remote_path));
        let output = self.shell(device, &command).await?;
        expect_success(&command, &output)
    }

    /// Install an archive streamed from the host.
    ///
    /// The archive is pushed to the staging directory, installed from there
    /// and the staged copy removed whether or not the install succeeded.
    async fn install(
        &self,
        device: &Device,
        archive: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
    ) -> Result<(), AdbError> {
        let staged = format!("{}/{}", INSTALL_STAGING_DIR, name);
        self.push(device, &staged, archive, DEFAULT_FILE_MODE).await?;
        let result = self.install_remote(device, &staged).await;
        if let Err(e) = self.remove(device, &staged).await {
            debug!(path = %staged, error = %e, "Failed to remove staged archive");
        }
        result
    }

    /// `mkdir -p` on the device.
    async fn mkdir_p(&self, device: &Device, dir: &str) -> Result<(), AdbError> {
        let command = format!("mkdir -p {}", shell_quote(dir));
        let output = self.shell(device, &command).await?;
        if output.trim().is_empty() {
            Ok(())
        } else {
            Err(AdbError::command_failed(command, output))
        }
    }

    /// `rm -f` on the device.
    async fn remove(&self, device: &Device, path: &str) -> Result<(), AdbError> {
        let command = format!("rm -f {}", shell_quote(path));
        let output = self.shell(device, &command).await?;
        if output.trim().is_empty() {
            Ok(())
        } else {
            Err(AdbError::command_failed(command, output))
        }
    }

    /// Size in bytes of a remote file.
    async fn remote_size(&self, device: &Device, path: &str) -> Result<u64, AdbError> {
        let command = format!("stat -c %s {}", shell_quote(path));
        let output = self.shell(device, &command).await?;
        output
            .trim()
            .parse::<u64>()
            .map_err(|_| AdbError::command_failed(command, output))
    }
}

fn expect_success(command: &str, output: &str) -> Result<(), AdbError> {
    if output.lines().any(|line| line.trim() == "Success") {
        Ok(())
    } else {
        Err(AdbError::command_failed(command, output))
    }
}

/// Quote an argument for the device shell when it contains anything but
/// path-safe characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:@%+=,-~".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
