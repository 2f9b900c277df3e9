//! Removal that only touches what the package still owns. Files whose content changed
//! since install are left on disk and reported rather than destroyed; directories are
//! removed only once empty.

use crate::config::Config;
use crate::db::Database;
use crate::manifest::{sha256_file, ManifestEntry};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::io::ErrorKind;

#[derive(Debug, Default)]
pub(crate) struct RemovalReport {
    pub(crate) removed: Vec<String>,
    /// Files preserved because their current hash no longer matches the manifest.
    pub(crate) kept_modified: Vec<String>,
}

pub(crate) fn uninstall_package(
    config: &Config,
    full_name: &str,
    db: &mut Database,
) -> Result<RemovalReport> {
    let Some(record) = db.installed.get(full_name) else {
        bail!("Package not installed: '{full_name}'");
    };
    let manifest = record.manifest.clone();

    // Deepest entries first so files go before their directories.
    let mut paths: Vec<&String> = manifest.entries.keys().collect();
    paths.sort_by(|a, b| {
        (a.matches('/').count(), a.as_str()).cmp(&(b.matches('/').count(), b.as_str()))
    });
    paths.reverse();

    let mut report = RemovalReport::default();
    for path in paths {
        let entry = &manifest.entries[path];
        if entry.is_owned() && db.owners.get(path).map(String::as_str) != Some(full_name) {
            // Not ours anymore; leave it alone.
            continue;
        }
        let dest = config.dest_path(path);
        if config.dry_run {
            info!("[dry-run] remove {}", dest.display());
            continue;
        }

        match entry {
            ManifestEntry::Symlink { .. } => {
                if dest.symlink_metadata().map_or(false, |m| m.file_type().is_symlink()) {
                    remove_file(&dest)?;
                    report.removed.push(path.clone());
                }
            }
            ManifestEntry::File { sha256 } => {
                if dest.is_file() {
                    let current = sha256_file(&dest)?;
                    if !current.eq_ignore_ascii_case(sha256) {
                        report.kept_modified.push(path.clone());
                    } else {
                        remove_file(&dest)?;
                        report.removed.push(path.clone());
                    }
                }
            }
            ManifestEntry::Dir => {
                // Only empty directories go; shared ones stay behind.
                let _ = fs::remove_dir(&dest);
            }
            ManifestEntry::Special => {}
        }
    }

    if !config.dry_run {
        for path in &report.removed {
            if db.owners.get(path).map(String::as_str) == Some(full_name) {
                db.owners.remove(path);
            }
        }
        db.installed.remove(full_name);
        db.save(&config.db_path())?;
    }

    if !report.kept_modified.is_empty() {
        warn!(
            "Preserved {} modified file(s) of '{}':",
            report.kept_modified.len(),
            full_name
        );
        for path in &report.kept_modified {
            warn!("  {path}");
        }
    }
    Ok(report)
}

fn remove_file(dest: &std::path::Path) -> Result<()> {
    match fs::remove_file(dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            Err(err).context(format!(
                "Permission denied removing '{}'; re-run with elevated privileges",
                dest.display()
            ))
        }
        Err(err) => Err(err).context(format!("Unable to remove '{}'", dest.display())),
    }
}
