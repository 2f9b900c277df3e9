use crate::config::Config;
use crate::db::Database;
use crate::locks::LockFile;
use crate::uninstall::uninstall_package;
use anyhow::Result;
use clap::Parser;
use log::info;

/// Remove a package: only paths it still owns, and only files whose content is unchanged
/// since install. Modified files are preserved and reported.
#[derive(Debug, Parser)]
pub(crate) struct Uninstall {
    /// Package to remove, as 'category/name'.
    pub(crate) pkg: String,
}

impl Uninstall {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());
        let report = uninstall_package(config, &self.pkg, &mut db)?;
        info!(
            "Removed {} path(s) of '{}'",
            report.removed.len(),
            self.pkg
        );
        Ok(())
    }
}
