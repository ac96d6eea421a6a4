//! Package installation and application restart.
//!
//! A downloaded package is handed to the first [`PackageInstaller`] that
//! supports it. Archives are extracted and swapped into the install
//! directory; installer executables are run silently. [`Restarter`]
//! relaunches the application once the install has finished.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::transfer::archive;

/// Suffix for files displaced during an archive install.
const DISPLACED_SUFFIX: &str = ".old";

/// Installs a downloaded package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this installer handles `payload`.
    fn supports(&self, payload: &Path) -> bool;

    /// Install `payload`, using `staging` as scratch space.
    ///
    /// On failure the install target must be left as it was.
    async fn install(&self, payload: &Path, staging: &Path) -> Result<(), UpdateError>;
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

/// Extracts a zip package and swaps its files into the install directory.
///
/// Files that get replaced are first renamed with an `.old` suffix. If any
/// copy fails, every touched file is put back.
#[derive(Debug, Clone)]
pub struct ArchiveInstaller {
    install_dir: PathBuf,
}

impl ArchiveInstaller {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }
}

#[async_trait]
impl PackageInstaller for ArchiveInstaller {
    fn name(&self) -> &str {
        "archive"
    }

    fn supports(&self, payload: &Path) -> bool {
        has_extension(payload, "zip")
    }

    async fn install(&self, payload: &Path, staging: &Path) -> Result<(), UpdateError> {
        let payload = payload.to_path_buf();
        let staging = staging.to_path_buf();
        let install_dir = self.install_dir.clone();

        tokio::task::spawn_blocking(move || {
            let files = archive::extract_zip(&payload, &staging)?;
            swap_into(&staging, &files, &install_dir)
        })
        .await?
    }
}

/// One file placed by [`swap_into`].
struct Placed {
    target: PathBuf,
    displaced: Option<PathBuf>,
}

fn displaced_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(DISPLACED_SUFFIX);
    target.with_file_name(name)
}

/// Copy `files` (under `staging`) into `install_dir`, preserving relative paths.
fn swap_into(staging: &Path, files: &[PathBuf], install_dir: &Path) -> Result<(), UpdateError> {
    info!(
        "Installing {} file(s) into {:?}",
        files.len(),
        install_dir
    );

    let mut placed: Vec<Placed> = Vec::with_capacity(files.len());
    for source in files {
        if let Err(e) = place_one(staging, source, install_dir, &mut placed) {
            warn!("Install failed at {:?}, restoring previous files", source);
            restore_placed(&placed);
            return Err(UpdateError::InstallationFailed(e.to_string()));
        }
    }

    for entry in &placed {
        if let Some(old) = &entry.displaced {
            if let Err(e) = std::fs::remove_file(old) {
                // A running executable may refuse deletion; it is cleaned up on the next install.
                debug!("Leaving {:?} in place: {}", old, e);
            }
        }
    }

    info!("Installed {} file(s)", placed.len());
    Ok(())
}

fn place_one(
    staging: &Path,
    source: &Path,
    install_dir: &Path,
    placed: &mut Vec<Placed>,
) -> std::io::Result<()> {
    let relative = source
        .strip_prefix(staging)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "file outside staging"))?;
    let target = install_dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let displaced = if target.exists() {
        let old = displaced_path(&target);
        if old.exists() {
            std::fs::remove_file(&old)?;
        }
        std::fs::rename(&target, &old)?;
        Some(old)
    } else {
        None
    };
    placed.push(Placed {
        target: target.clone(),
        displaced,
    });

    std::fs::copy(source, &target)?;
    debug!("Installed {:?}", target);
    Ok(())
}

fn restore_placed(placed: &[Placed]) {
    for entry in placed.iter().rev() {
        if entry.target.exists() {
            if let Err(e) = std::fs::remove_file(&entry.target) {
                warn!("Could not remove {:?}: {}", entry.target, e);
            }
        }
        if let Some(old) = &entry.displaced {
            if let Err(e) = std::fs::rename(old, &entry.target) {
                warn!("Could not restore {:?}: {}", entry.target, e);
            }
        }
    }
}

/// Runs an installer executable silently.
#[derive(Debug, Clone)]
pub struct ExecutableInstaller {
    args: Vec<String>,
}

impl Default for ExecutableInstaller {
    fn default() -> Self {
        Self {
            args: vec!["/S".to_string()],
        }
    }
}

impl ExecutableInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the silent-install arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl PackageInstaller for ExecutableInstaller {
    fn name(&self) -> &str {
        "executable"
    }

    fn supports(&self, payload: &Path) -> bool {
        has_extension(payload, "exe")
    }

    async fn install(&self, payload: &Path, _staging: &Path) -> Result<(), UpdateError> {
        info!("Running installer {:?} {:?}", payload, self.args);
        let status = tokio::process::Command::new(payload)
            .args(&self.args)
            .status()
            .await
            .map_err(|e| {
                UpdateError::InstallationFailed(format!("failed to launch installer: {}", e))
            })?;

        if !status.success() {
            return Err(UpdateError::InstallationFailed(format!(
                "installer exited with {}",
                status
            )));
        }
        Ok(())
    }
}

/// Relaunches the application after an update.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self) -> Result<(), UpdateError>;
}

/// Spawns a program and terminates the current process.
#[derive(Debug, Clone)]
pub struct ProcessRestarter {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessRestarter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Relaunch the running executable with its original arguments.
    pub fn for_current_process() -> Result<Self, UpdateError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1).collect()))
    }

    /// Relaunch the running executable with `args`.
    pub fn for_current_exe(args: Vec<OsString>) -> Result<Self, UpdateError> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Restarter for ProcessRestarter {
    async fn restart(&self) -> Result<(), UpdateError> {
        info!("Restarting application: {:?}", self.program);
        std::process::Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| UpdateError::InstallationFailed(format!("failed to relaunch: {}", e)))?;
        std::process::exit(0);
    }
}
