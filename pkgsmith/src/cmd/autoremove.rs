use crate::config::Config;
use crate::db::Database;
use crate::locks::LockFile;
use crate::uninstall::uninstall_package;
use anyhow::Result;
use clap::Parser;
use log::info;
use std::collections::BTreeSet;

/// Uninstall packages that are not explicit and are not required, directly or
/// transitively, by any explicit package. The candidate set is computed once, up front.
#[derive(Debug, Parser)]
pub(crate) struct Autoremove {}

impl Autoremove {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());
        if db.installed.is_empty() {
            info!("No packages installed.");
            return Ok(());
        }

        let roots: Vec<String> = db
            .installed
            .iter()
            .filter(|(_, record)| record.explicit)
            .map(|(name, _)| name.clone())
            .collect();
        if roots.is_empty() {
            info!("No packages are marked explicit; nothing to do.");
            return Ok(());
        }

        let mut required = BTreeSet::new();
        let mut stack = roots;
        while let Some(name) = stack.pop() {
            if !required.insert(name.clone()) {
                continue;
            }
            if let Some(record) = db.installed.get(&name) {
                for dep in &record.depends {
                    if db.installed.contains_key(dep) && !required.contains(dep) {
                        stack.push(dep.clone());
                    }
                }
            }
        }

        let candidates: Vec<String> = db
            .installed
            .iter()
            .filter(|(name, record)| !record.explicit && !required.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        if candidates.is_empty() {
            info!("No orphans detected.");
            return Ok(());
        }

        for name in candidates {
            info!("Autoremove: {name}");
            uninstall_package(config, &name, &mut db)?;
        }
        Ok(())
    }
}
