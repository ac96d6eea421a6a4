//! Puenkaset updater CLI entry point

use clap::Parser;
use pks_cli::{Cli, ExitCode, OutputFormatter};
use pks_updater::UpdaterSettings;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();
    let formatter = OutputFormatter::new(cli.output, cli.verbose);

    // Load settings, creating the file with defaults on first run
    let config_path = cli.config_path();
    let mut settings = match UpdaterSettings::load_or_create(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: Config error in {}: {e}", config_path.display());
            eprintln!("Using default configuration.");
            UpdaterSettings::default()
        }
    };
    settings.apply_env_overrides();

    // Initialize logging: --verbose, then RUST_LOG, then the config file
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&settings.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"))
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Execute command with resolved settings
    match cli.execute_with_settings(settings).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            let code = ExitCode::from_error(&e);
            let message = formatter.format_error_with_code(&e, code);
            if !message.is_empty() {
                eprintln!("{message}");
            }
            code.to_exit_code()
        }
    }
}
