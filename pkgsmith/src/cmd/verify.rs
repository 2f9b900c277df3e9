use crate::config::Config;
use crate::db::Database;
use crate::manifest::{sha256_file, ManifestEntry};
use anyhow::{ensure, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;

/// Check the filesystem against the manifests in the database: files must exist, be
/// regular, and hash-match; symlinks must exist with their recorded target.
#[derive(Debug, Parser)]
pub(crate) struct Verify {
    /// Package to verify, as 'category/name'. All installed packages when absent.
    pub(crate) pkg: Option<String>,
}

impl Verify {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        // Read-only: no lock needed, the database file is replaced atomically.
        let db = Database::load(&config.db_path());
        if let Some(pkg) = &self.pkg {
            ensure!(
                db.installed.contains_key(pkg),
                "'{pkg}' is not installed"
            );
        }
        let targets: Vec<&String> = match &self.pkg {
            Some(pkg) => db.installed.keys().filter(|name| *name == pkg).collect(),
            None => db.installed.keys().collect(),
        };

        let mut problems = 0usize;
        for full_name in targets {
            let record = &db.installed[full_name];
            for (path, entry) in &record.manifest.entries {
                let dest = config.dest_path(path);
                match entry {
                    ManifestEntry::File { sha256 } => {
                        if !dest.exists() {
                            problems += 1;
                            warn!("[{full_name}] missing: {path}");
                        } else if !dest.is_file() {
                            problems += 1;
                            warn!("[{full_name}] wrong type: {path}");
                        } else if !sha256_file(&dest)?.eq_ignore_ascii_case(sha256) {
                            problems += 1;
                            warn!("[{full_name}] modified: {path}");
                        }
                    }
                    ManifestEntry::Symlink { target } => {
                        let is_symlink = dest
                            .symlink_metadata()
                            .map_or(false, |meta| meta.file_type().is_symlink());
                        if !is_symlink {
                            problems += 1;
                            warn!("[{full_name}] symlink missing or wrong type: {path}");
                        } else if fs::read_link(&dest)?.to_string_lossy() != target.as_str() {
                            problems += 1;
                            warn!("[{full_name}] symlink target differs: {path}");
                        }
                    }
                    ManifestEntry::Dir | ManifestEntry::Special => {}
                }
            }
        }

        ensure!(problems == 0, "Verify found {problems} problem(s)");
        info!("Verify OK.");
        Ok(())
    }
}
