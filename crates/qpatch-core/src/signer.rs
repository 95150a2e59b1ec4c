//! Archive signing.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::SigningConfig;
use crate::error::PatcherError;

/// Re-signs a repacked archive in place.
pub trait ArchiveSigner: Send + Sync {
    fn sign(&self, archive: &Path) -> Result<(), PatcherError>;

    /// Short human-readable name of the signing backend.
    fn description(&self) -> String;
}

/// Signs with the Android build tools (`zipalign` + `apksigner`).
#[derive(Debug, Clone)]
pub struct ApkSignerTool {
    apksigner: PathBuf,
    zipalign: Option<PathBuf>,
    keystore: PathBuf,
    keystore_password: String,
    key_alias: Option<String>,
    key_password: Option<String>,
    verify: bool,
}

impl ApkSignerTool {
    pub fn from_config(config: &SigningConfig) -> Result<Self, PatcherError> {
        let keystore = config.keystore_path().ok_or_else(|| {
            PatcherError::Config("no keystore configured and no home directory found".to_string())
        })?;
        Ok(Self {
            apksigner: config.apksigner.clone(),
            zipalign: config.zipalign.clone(),
            keystore,
            keystore_password: config.keystore_password.clone(),
            key_alias: config.key_alias.clone(),
            key_password: config.key_password.clone(),
            verify: config.verify,
        })
    }

    pub fn keystore(&self) -> &Path {
        &self.keystore
    }

    fn align(&self, zipalign: &Path, archive: &Path) -> Result<(), PatcherError> {
        let mut aligned = archive.as_os_str().to_os_string();
        aligned.push(".aligned");
        let aligned = PathBuf::from(aligned);

        let mut args: Vec<OsString> = ["-f", "-p", "4"].iter().map(OsString::from).collect();
        args.push(archive.as_os_str().to_os_string());
        args.push(aligned.as_os_str().to_os_string());

        if let Err(e) = run_tool(zipalign, &args) {
            let _ = fs::remove_file(&aligned);
            return Err(e);
        }
        fs::rename(&aligned, archive)?;
        debug!(archive = %archive.display(), "Aligned archive");
        Ok(())
    }

    fn sign_args(&self, archive: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> =
            vec!["sign".into(), "--ks".into(), self.keystore.clone().into()];
        args.push("--ks-pass".into());
        args.push(format!("pass:{}", self.keystore_password).into());
        if let Some(alias) = &self.key_alias {
            args.push("--ks-key-alias".into());
            args.push(alias.into());
        }
        if let Some(password) = &self.key_password {
            args.push("--key-pass".into());
            args.push(format!("pass:{password}").into());
        }
        args.push(archive.as_os_str().to_os_string());
        args
    }
}

impl ArchiveSigner for ApkSignerTool {
    fn sign(&self, archive: &Path) -> Result<(), PatcherError> {
        if !archive.is_file() {
            return Err(PatcherError::SignFailed(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }
        if !self.keystore.is_file() {
            return Err(PatcherError::SignFailed(format!(
                "keystore {} does not exist",
                self.keystore.display()
            )));
        }

        if let Some(zipalign) = &self.zipalign {
            self.align(zipalign, archive)?;
        }

        run_tool(&self.apksigner, &self.sign_args(archive))?;

        if self.verify {
            run_tool(
                &self.apksigner,
                &["verify".into(), archive.as_os_str().to_os_string()],
            )?;
        }

        info!(archive = %archive.display(), keystore = %self.keystore.display(), "Archive signed");
        Ok(())
    }

    fn description(&self) -> String {
        format!("apksigner ({})", self.keystore.display())
    }
}

fn run_tool(program: &Path, args: &[OsString]) -> Result<(), PatcherError> {
    debug!(program = %program.display(), "Running signing tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| {
            PatcherError::SignFailed(format!("failed to run {}: {}", program.display(), e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(PatcherError::SignFailed(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            detail.trim()
        )));
    }
    Ok(())
}
