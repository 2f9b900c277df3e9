use crate::config::Config;
use crate::db::Database;
use crate::install::{install_artifact, PackageIdentity};
use crate::locks::LockFile;
use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::info;

/// Reinstall the previous version of a package from its history and cached artifact. The
/// currently installed version takes its place at the head of the history stack.
#[derive(Debug, Parser)]
pub(crate) struct Rollback {
    /// Package to roll back, as 'category/name'.
    pub(crate) pkg: String,
}

impl Rollback {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());

        let current = db
            .installed
            .get(&self.pkg)
            .cloned()
            .context(format!("'{}' is not installed", self.pkg))?;
        let stack = db.history.get_mut(&self.pkg);
        let target = match stack {
            Some(stack) if !stack.is_empty() => stack.remove(0),
            _ => anyhow::bail!("No history to roll back for '{}'", self.pkg),
        };
        db.push_history(&self.pkg, current, config.history_limit);

        // The record remembers where its artifact was; fall back to the well-known cache
        // name when that file moved.
        let mut artifact = target.artifact.clone();
        if !artifact.is_file() {
            let (fallback, _, _) = config.artifact_paths(&target.id, &target.version);
            artifact = fallback;
        }
        ensure!(
            artifact.is_file(),
            "Rollback artifact for '{}' is not in the cache: '{}'",
            self.pkg,
            artifact.display()
        );
        ensure!(
            !target.manifest.is_empty(),
            "No manifest recorded in history for '{}'",
            self.pkg
        );

        info!("Rolling back {} to {}", self.pkg, target.version);
        let identity = PackageIdentity::from_record(&self.pkg, &target);
        install_artifact(
            config,
            &identity,
            &artifact,
            &target.manifest,
            &mut db,
            target.explicit,
        )
    }
}
