//! Zip extraction confined to a destination directory.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::UpdateError;

/// Resolve an archive entry name beneath `dest`.
///
/// Backslashes are treated as separators. `..` may only climb back out of
/// directories the entry itself descended into.
///
/// # Errors
///
/// Returns `PathTraversal` for absolute names or names that escape `dest`.
pub fn resolve_entry_path(dest: &Path, entry_name: &str) -> Result<PathBuf, UpdateError> {
    let normalized = entry_name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(UpdateError::PathTraversal(entry_name.to_string()));
    }

    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(UpdateError::PathTraversal(entry_name.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(UpdateError::PathTraversal(entry_name.to_string()));
            }
        }
    }

    // Drive-qualified names such as "C:evil" are a single Normal component on unix.
    if relative
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .map_or(false, |first| first.contains(':'))
    {
        return Err(UpdateError::PathTraversal(entry_name.to_string()));
    }

    Ok(dest.join(relative))
}

/// Extract every entry of `archive` into `dest`.
///
/// All entry names are validated before anything is written, so a rejected
/// archive leaves the destination untouched.
///
/// # Returns
///
/// Paths of the extracted files.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, UpdateError> {
    info!("Extracting {:?} -> {:?}", archive, dest);

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut plan = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            return Err(UpdateError::PathTraversal(name));
        }
        let target = resolve_entry_path(dest, &name)?;
        plan.push((i, target, entry.is_dir()));
    }

    fs::create_dir_all(dest)?;
    let mut written = Vec::new();

    for (i, target, is_dir) in plan {
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry = zip.by_index(i)?;
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode().map(|m| m & 0o777).filter(|m| *m != 0) {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }

        debug!("Extracted {:?}", target);
        written.push(target);
    }

    info!("Extracted {} files", written.len());
    Ok(written)
}
