//! CLI argument parsing and pipeline wiring

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use qpatch_adb::{locate_adb, AdbClient, AdbServer};
use qpatch_core::{ApkSignerTool, PatchRegistry, Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CliOverrides, LoadedConfig};
use crate::console;
use crate::ExitCode;

/// Patch, re-sign and deploy the application to a connected headset
#[derive(Parser, Debug)]
#[command(name = "qpatch")]
#[command(version, about = "Patch, re-sign and deploy the application to a connected headset")]
pub struct Cli {
    /// Config file path
    #[arg(long, env = "QPATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug mode (protocol-level tracing)
    #[arg(long)]
    pub debug: bool,

    /// Exit without waiting for Enter
    #[arg(long)]
    pub no_pause: bool,

    /// Give up device discovery after this many seconds
    #[arg(long, value_name = "SECS")]
    pub discovery_timeout: Option<u64>,
}

impl Cli {
    /// Overrides the flags apply to the loaded configuration.
    pub fn overrides(&self) -> CliOverrides {
        let log_level = if self.debug {
            Some("debug".to_string())
        } else if self.verbose {
            Some("info".to_string())
        } else {
            None
        };
        CliOverrides {
            discovery_timeout_secs: self.discovery_timeout,
            log_level,
        }
    }

    /// Run the pipeline once with a resolved configuration.
    pub async fn execute_with_config(
        &self,
        loaded: &LoadedConfig,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExitCode> {
        let patches = PatchRegistry::from_config(&config.patch, &loaded.base_dir())
            .context("failed to load bundled patches")?;
        if patches.is_empty() {
            warn!("No patches configured; every library will fail verification");
        }

        let signer =
            ApkSignerTool::from_config(&config.signing).context("failed to set up signing")?;
        let client = AdbClient::with_config(config.adb_client_config());
        let server = AdbServer::new(locate_adb(config.device.adb_path.as_deref()), client.clone());

        let pipeline = Pipeline::new(config, client, Box::new(signer))
            .with_patches(patches)
            .with_server(server)
            .with_observer(console::stdout_observer());

        println!("Waiting for a supported headset. Connect it over USB and allow debugging.");
        match pipeline.run(&cancel).await {
            Ok(report) => {
                info!(
                    serial = %report.device.serial,
                    host = %report.host_value,
                    "Pipeline finished"
                );
                println!();
                println!("Patched application installed on {}.", report.device.serial);
                Ok(ExitCode::Success)
            }
            Err(failure) => {
                println!();
                println!("Error: {failure}");
                Ok(ExitCode::Failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "qpatch",
            "--config",
            "custom.toml",
            "--no-pause",
            "--discovery-timeout",
            "45",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(cli.no_pause);
        assert_eq!(cli.discovery_timeout, Some(45));

        let overrides = cli.overrides();
        assert_eq!(overrides.discovery_timeout_secs, Some(45));
        assert_eq!(overrides.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_debug_wins_over_verbose() {
        let cli = Cli::try_parse_from(["qpatch", "--verbose", "--debug"]).unwrap();
        assert_eq!(cli.overrides().log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_no_flags() {
        let cli = Cli::try_parse_from(["qpatch"]).unwrap();
        assert!(!cli.no_pause);
        assert!(cli.overrides().log_level.is_none());
    }

    #[test]
    fn test_rejects_bad_timeout() {
        assert!(Cli::try_parse_from(["qpatch", "--discovery-timeout", "soon"]).is_err());
    }
}
