//! CLI command definitions and argument parsing

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use semver::Version;
use tokio::sync::broadcast;
use tracing::{info, warn};

use pks_updater::events::UpdateEvent;
use pks_updater::install::{ProcessRestarter, Restarter};
use pks_updater::manager::DEFAULT_RESTART_DELAY;
use pks_updater::{UpdateConfigPatch, UpdateError, UpdateManager, UpdaterSettings};

use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

/// Extra time allowed for the scheduled restart before the CLI gives up waiting.
const RESTART_GRACE: Duration = Duration::from_secs(5);

/// Puenkaset POS update manager
#[derive(Parser, Debug)]
#[command(name = "puenkaset-updater")]
#[command(version, about = "Puenkaset POS update manager")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true, env = "PKS_UPDATER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Version of the installed POS application
    #[arg(long, global = true, env = "PKS_APP_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub app_version: Version,

    /// Program to launch after an install (defaults to this tool's status command)
    #[arg(long, global = true, env = "PKS_APP_EXE")]
    pub app_exe: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the registry for a newer release
    Check,
    /// Download the latest release package
    Download,
    /// Install a downloaded package
    Install(InstallArgs),
    /// Check, download and install in one go
    Update(RestartArgs),
    /// Cancel the running operation
    Cancel,
    /// Restore the database from the newest backup
    Rollback,
    /// Relaunch the application
    Restart,
    /// Show update status
    Status,
    /// Read or change update settings
    Config(ConfigArgs),
    /// Manage the registry access token
    Token(TokenArgs),
    /// Show schema versions and applied migrations
    SchemaVersion,
    /// Run the database integrity check
    ValidateDb,
    /// Back up the database
    Backup,
    /// Check registry reachability and rate limit
    RegistryCheck,
    /// Run automatic updates and print every event until Ctrl-C
    Watch,
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RestartArgs {
    /// Do not relaunch the application after installing
    #[arg(long)]
    pub no_restart: bool,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Package file (defaults to the last download of the latest release)
    #[arg(long)]
    pub package: Option<PathBuf>,

    #[command(flatten)]
    pub restart: RestartArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the update settings
    Get,
    /// Change update settings; omitted options keep their value
    Set(ConfigSetArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConfigSetArgs {
    #[arg(long)]
    pub auto_check: Option<bool>,
    /// Milliseconds between automatic checks
    #[arg(long)]
    pub check_interval_ms: Option<u64>,
    #[arg(long)]
    pub auto_download: Option<bool>,
    #[arg(long)]
    pub auto_install: Option<bool>,
    #[arg(long)]
    pub allow_prerelease: Option<bool>,
    #[arg(long)]
    pub backup_before_update: Option<bool>,
    #[arg(long)]
    pub max_backups: Option<usize>,
}

impl From<&ConfigSetArgs> for UpdateConfigPatch {
    fn from(args: &ConfigSetArgs) -> Self {
        UpdateConfigPatch {
            auto_check: args.auto_check,
            check_interval_ms: args.check_interval_ms,
            auto_download: args.auto_download,
            auto_install: args.auto_install,
            allow_prerelease: args.allow_prerelease,
            backup_before_update: args.backup_before_update,
            max_backups: args.max_backups,
        }
    }
}

#[derive(Args, Debug)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommand,
}

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Validate and store a token
    Set {
        /// Registry personal access token
        token: String,
    },
    /// Check a token, or the stored one
    Validate { token: Option<String> },
    /// Delete the stored token
    Remove,
}

/// Restarter used with `--no-restart`.
struct SkipRestart;

#[async_trait]
impl Restarter for SkipRestart {
    async fn restart(&self) -> Result<(), UpdateError> {
        info!("Restart skipped");
        Ok(())
    }
}

/// Everything a command needs.
struct Context {
    manager: Arc<UpdateManager>,
    formatter: OutputFormatter,
    config_path: PathBuf,
}

impl Cli {
    /// Settings file in use.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(UpdaterSettings::default_path)
    }

    /// Whether the command may relaunch the application.
    fn restarts(&self) -> bool {
        match &self.command {
            Commands::Update(args) => !args.no_restart,
            Commands::Install(args) => !args.restart.no_restart,
            Commands::Restart | Commands::Watch => true,
            _ => false,
        }
    }

    fn build_restarter(&self) -> Result<Arc<dyn Restarter>, UpdateError> {
        if !self.restarts() {
            return Ok(Arc::new(SkipRestart));
        }
        let restarter = match &self.app_exe {
            Some(program) => ProcessRestarter::new(program.clone(), Vec::new()),
            None => ProcessRestarter::for_current_exe(vec![OsString::from("status")])?,
        };
        Ok(Arc::new(restarter))
    }

    /// Execute the CLI command with resolved settings
    pub async fn execute_with_settings(self, settings: UpdaterSettings) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose);
        let manager = UpdateManager::new(self.app_version.clone(), &settings)?
            .with_restarter(self.build_restarter()?);
        let ctx = Context {
            manager: Arc::new(manager),
            formatter,
            config_path: self.config_path(),
        };

        match self.command {
            Commands::Check => check(&ctx).await,
            Commands::Download => download(&ctx).await,
            Commands::Install(args) => install(&ctx, args).await,
            Commands::Update(args) => update(&ctx, args).await,
            Commands::Cancel => cancel(&ctx).await,
            Commands::Rollback => rollback(&ctx).await,
            Commands::Restart => restart(&ctx).await,
            Commands::Status => status(&ctx).await,
            Commands::Config(args) => config(&ctx, args).await,
            Commands::Token(args) => token(&ctx, args).await,
            Commands::SchemaVersion => schema_version(&ctx).await,
            Commands::ValidateDb => validate_db(&ctx).await,
            Commands::Backup => backup(&ctx).await,
            Commands::RegistryCheck => registry_check(&ctx).await,
            Commands::Watch => watch(&ctx).await,
        }
    }
}

fn print(text: String) {
    if !text.is_empty() {
        println!("{text}");
    }
}

/// Run `op` on its own task; Ctrl-C cancels it and waits for it to stop.
async fn run_cancellable<T, F, Fut>(manager: &Arc<UpdateManager>, op: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<UpdateManager>) -> Fut,
    Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
{
    let mut task = tokio::spawn(op(Arc::clone(manager)));
    tokio::select! {
        result = &mut task => Ok(result??),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            manager.cancel_update().await;
            Ok(task.await??)
        }
    }
}

/// Print download and install progress while a command runs.
fn spawn_progress_printer(ctx: &Context) -> Option<tokio::task::JoinHandle<()>> {
    if ctx.formatter.format() != OutputFormat::Table {
        return None;
    }
    let mut rx = ctx.manager.subscribe();
    Some(tokio::spawn(async move {
        let mut last_bucket = None;
        loop {
            match rx.recv().await {
                Ok(UpdateEvent::DownloadProgress(p)) => {
                    let bucket = (p.progress / 10.0) as u32;
                    if last_bucket != Some(bucket) {
                        last_bucket = Some(bucket);
                        eprintln!("Downloading... {:.0}%", p.progress);
                    }
                }
                Ok(UpdateEvent::InstallProgress {
                    progress, message, ..
                }) => eprintln!("[{progress:>3}%] {message}"),
                Ok(UpdateEvent::UpdateRolledBack) => {
                    eprintln!("Database restored from backup")
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }))
}

async fn with_progress<T>(
    ctx: &Context,
    run: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    let printer = spawn_progress_printer(ctx);
    let result = run.await;
    if let Some(printer) = printer {
        // Let queued events print before returning
        tokio::time::sleep(Duration::from_millis(50)).await;
        printer.abort();
    }
    result
}

/// Give the scheduled restart time to run; it ends this process on success.
async fn await_restart(ctx: &Context, restart: RestartArgs) {
    if restart.no_restart {
        return;
    }
    ctx.formatter.progress("Waiting for restart");
    tokio::time::sleep(DEFAULT_RESTART_DELAY + RESTART_GRACE).await;
    warn!("Application did not restart");
}

async fn check(ctx: &Context) -> anyhow::Result<ExitCode> {
    ctx.formatter.progress("Checking for updates");
    let info = ctx.manager.check_for_updates().await?;
    print(ctx.formatter.format_update_info(&info));
    Ok(ExitCode::Success)
}

async fn download(ctx: &Context) -> anyhow::Result<ExitCode> {
    let info = ctx.manager.check_for_updates().await?;
    if !info.available {
        print(ctx.formatter.format_message(
            &format!("Already up to date ({})", info.current_version),
            &info,
            "download",
        ));
        return Ok(ExitCode::Success);
    }

    let path = with_progress(
        ctx,
        run_cancellable(&ctx.manager, |m| async move { m.download_update().await }),
    )
    .await?;
    print(ctx.formatter.format_message(
        &format!("Downloaded {} to {}", info.latest_version, path.display()),
        &serde_json::json!({ "version": info.latest_version, "path": path }),
        "download",
    ));
    Ok(ExitCode::Success)
}

async fn install(ctx: &Context, args: InstallArgs) -> anyhow::Result<ExitCode> {
    let info = ctx.manager.check_for_updates().await?;
    if !info.available {
        print(ctx.formatter.format_message(
            &format!("Already up to date ({})", info.current_version),
            &info,
            "install",
        ));
        return Ok(ExitCode::Success);
    }

    ctx.manager.use_downloaded_package(args.package).await?;
    with_progress(
        ctx,
        run_cancellable(&ctx.manager, |m| async move { m.install_update().await }),
    )
    .await?;
    print(ctx.formatter.format_message(
        &format!("Installed {}", info.latest_version),
        &serde_json::json!({ "version": info.latest_version }),
        "install",
    ));
    await_restart(ctx, args.restart).await;
    Ok(ExitCode::Success)
}

async fn update(ctx: &Context, args: RestartArgs) -> anyhow::Result<ExitCode> {
    let info = ctx.manager.check_for_updates().await?;
    if !info.available {
        print(ctx.formatter.format_message(
            &format!("Already up to date ({})", info.current_version),
            &info,
            "update",
        ));
        return Ok(ExitCode::Success);
    }

    with_progress(
        ctx,
        run_cancellable(&ctx.manager, |m| async move { m.download_and_install().await }),
    )
    .await?;
    print(ctx.formatter.format_message(
        &format!("Updated {} -> {}", info.current_version, info.latest_version),
        &serde_json::json!({ "from": info.current_version, "to": info.latest_version }),
        "update",
    ));
    await_restart(ctx, args).await;
    Ok(ExitCode::Success)
}

async fn cancel(ctx: &Context) -> anyhow::Result<ExitCode> {
    // Long-running commands cancel on Ctrl-C; here only this process's own work is visible.
    let cancelled = ctx.manager.cancel_update().await;
    let message = if cancelled {
        "Update cancelled"
    } else {
        "No update in progress"
    };
    print(ctx.formatter.format_message(
        message,
        &serde_json::json!({ "cancelled": cancelled }),
        "cancel",
    ));
    Ok(ExitCode::Success)
}

async fn rollback(ctx: &Context) -> anyhow::Result<ExitCode> {
    let backup = ctx.manager.rollback_update().await?;
    print(ctx.formatter.format_message(
        &format!("Database restored from {}", backup.display()),
        &serde_json::json!({ "backup": backup }),
        "rollback",
    ));
    Ok(ExitCode::Success)
}

async fn restart(ctx: &Context) -> anyhow::Result<ExitCode> {
    ctx.formatter.progress("Restarting application");
    ctx.manager.restart_application().await?;
    Ok(ExitCode::Success)
}

async fn status(ctx: &Context) -> anyhow::Result<ExitCode> {
    let status = ctx.manager.get_update_status().await;
    print(ctx.formatter.format_status(&status));
    Ok(ExitCode::Success)
}

async fn config(ctx: &Context, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.command {
        ConfigCommand::Get => {
            let config = ctx.manager.get_update_config().await;
            print(ctx.formatter.format_config(&config, "config get"));
        }
        ConfigCommand::Set(set) => {
            let patch = UpdateConfigPatch::from(&set);
            if patch.is_empty() {
                anyhow::bail!(UpdateError::InvalidInput(
                    "no settings given; see `config set --help`".to_string()
                ));
            }
            let updated = ctx.manager.set_update_config(&patch).await?;

            // Re-read the file so environment overrides are not written back
            let mut on_disk = UpdaterSettings::load_or_create(&ctx.config_path)?;
            on_disk.update = updated.clone();
            on_disk.save_to_file(&ctx.config_path)?;
            info!("Saved settings to {:?}", ctx.config_path);

            print(ctx.formatter.format_config(&updated, "config set"));
        }
    }
    Ok(ExitCode::Success)
}

async fn token(ctx: &Context, args: TokenArgs) -> anyhow::Result<ExitCode> {
    match args.command {
        TokenCommand::Set { token } => {
            ctx.manager.set_github_token(&token).await?;
            print(ctx.formatter.format_message(
                "Token validated and stored",
                &serde_json::json!({ "stored": true }),
                "token set",
            ));
            Ok(ExitCode::Success)
        }
        TokenCommand::Validate { token } => {
            let valid = ctx.manager.validate_github_token(token.as_deref()).await;
            print(ctx.formatter.format_message(
                if valid { "Token is valid" } else { "Token is not valid" },
                &serde_json::json!({ "valid": valid }),
                "token validate",
            ));
            Ok(if valid {
                ExitCode::Success
            } else {
                ExitCode::AuthenticationFailed
            })
        }
        TokenCommand::Remove => {
            ctx.manager.remove_github_token().await?;
            print(ctx.formatter.format_message(
                "Token removed",
                &serde_json::json!({ "removed": true }),
                "token remove",
            ));
            Ok(ExitCode::Success)
        }
    }
}

async fn schema_version(ctx: &Context) -> anyhow::Result<ExitCode> {
    let schema = ctx.manager.schema_version().await?;
    print(ctx.formatter.format_schema(&schema));
    Ok(ExitCode::Success)
}

async fn validate_db(ctx: &Context) -> anyhow::Result<ExitCode> {
    let valid = ctx.manager.validate_database().await;
    print(ctx.formatter.format_message(
        if valid {
            "Database integrity check passed"
        } else {
            "Database integrity check FAILED"
        },
        &serde_json::json!({ "valid": valid }),
        "validate-db",
    ));
    Ok(if valid {
        ExitCode::Success
    } else {
        ExitCode::DatabaseError
    })
}

async fn backup(ctx: &Context) -> anyhow::Result<ExitCode> {
    let path = ctx.manager.create_database_backup().await?;
    print(ctx.formatter.format_message(
        &format!("Backup written to {}", path.display()),
        &serde_json::json!({ "backup": path }),
        "backup",
    ));
    Ok(ExitCode::Success)
}

async fn registry_check(ctx: &Context) -> anyhow::Result<ExitCode> {
    let registry = ctx.manager.check_registry_connection().await;
    print(ctx.formatter.format_registry(&registry));
    Ok(if registry.connected {
        ExitCode::Success
    } else {
        ExitCode::ConnectionFailed
    })
}

async fn watch(ctx: &Context) -> anyhow::Result<ExitCode> {
    let mut rx = ctx.manager.subscribe();
    let worker = ctx.manager.spawn_auto_update();
    ctx.formatter.progress("Watching for updates (Ctrl-C to stop)");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => print(ctx.formatter.format_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                ctx.manager.cancel_update().await;
                break;
            }
        }
    }

    worker.abort();
    Ok(ExitCode::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "puenkaset-updater",
            "status",
            "--output",
            "json",
            "--app-version",
            "1.0.1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.app_version, Version::new(1, 0, 1));
        assert!(!cli.restarts());
    }

    #[test]
    fn test_parse_config_set() {
        let cli = Cli::try_parse_from([
            "puenkaset-updater",
            "config",
            "set",
            "--auto-download",
            "true",
            "--max-backups",
            "3",
        ])
        .unwrap();
        let Commands::Config(ConfigArgs {
            command: ConfigCommand::Set(set),
        }) = cli.command
        else {
            panic!("expected config set");
        };
        let patch = UpdateConfigPatch::from(&set);
        assert_eq!(patch.auto_download, Some(true));
        assert_eq!(patch.max_backups, Some(3));
        assert_eq!(patch.auto_check, None);
    }

    #[test]
    fn test_restart_flags() {
        let update = Cli::try_parse_from(["puenkaset-updater", "update"]).unwrap();
        assert!(update.restarts());

        let quiet = Cli::try_parse_from(["puenkaset-updater", "install", "--no-restart"]).unwrap();
        assert!(!quiet.restarts());
    }

    #[test]
    fn test_rejects_bad_version() {
        assert!(Cli::try_parse_from(["puenkaset-updater", "check", "--app-version", "one"]).is_err());
    }

    #[test]
    fn test_token_commands() {
        let cli = Cli::try_parse_from(["puenkaset-updater", "token", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Token(TokenArgs {
                command: TokenCommand::Validate { token: None }
            })
        ));
    }
}
