//! qpatch CLI entry point

use clap::Parser;
use qpatch_cli::config::resolve;
use qpatch_cli::console;
use qpatch_cli::{load_config, Cli, ExitCode};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    println!("qpatch {}", env!("CARGO_PKG_VERSION"));

    let code = run(&cli).await;
    if !cli.no_pause {
        console::pause("Press Enter to exit...");
    }
    code.to_exit_code()
}

async fn run(cli: &Cli) -> ExitCode {
    let loaded = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::Failure;
        }
    };

    let config = match resolve(loaded.config.clone(), &cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::Failure;
        }
    };

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(source) = &loaded.source {
        tracing::info!(path = %source.display(), "Loaded configuration");
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.execute_with_config(&loaded, config, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::Failure
        }
    }
}
