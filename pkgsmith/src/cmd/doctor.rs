use crate::config::Config;
use crate::db::Database;
use anyhow::{ensure, Result};
use clap::Parser;
use log::{info, warn};

/// Audit the database against the caches: installed records whose artifact or manifest is
/// gone, owner entries pointing at uninstalled packages, and history records whose
/// artifact disappeared.
#[derive(Debug, Parser)]
pub(crate) struct Doctor {}

impl Doctor {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        // Read-only: no lock needed, the database file is replaced atomically.
        let db = Database::load(&config.db_path());
        let mut issues = 0usize;

        for (full_name, record) in &db.installed {
            if !record.artifact.as_os_str().is_empty() && !record.artifact.is_file() {
                issues += 1;
                warn!(
                    "[{full_name}] artifact missing from the cache: '{}'",
                    record.artifact.display()
                );
            }
            if record.manifest.is_empty() {
                issues += 1;
                warn!("[{full_name}] manifest missing or empty in the database");
            }
        }

        for (path, owner) in &db.owners {
            if !db.installed.contains_key(owner) {
                issues += 1;
                warn!("[owners] {path} points at an uninstalled package: {owner}");
            }
        }

        for (full_name, stack) in &db.history {
            for record in stack.iter().take(config.history_limit) {
                if !record.artifact.as_os_str().is_empty() && !record.artifact.is_file() {
                    issues += 1;
                    warn!(
                        "[history:{full_name}] artifact missing: '{}'",
                        record.artifact.display()
                    );
                }
            }
        }

        ensure!(issues == 0, "Doctor found {issues} issue(s)");
        info!("Doctor OK.");
        Ok(())
    }
}
