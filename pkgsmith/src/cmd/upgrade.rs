use crate::build;
use crate::config::Config;
use crate::db::Database;
use crate::install::{install_artifact, PackageIdentity};
use crate::locks::LockFile;
use crate::recipe;
use crate::resolver;
use anyhow::{ensure, Result};
use clap::Parser;
use log::info;
use std::collections::BTreeMap;

/// For each installed package whose recipe now declares a different version, rebuild and
/// reinstall it. The outgoing version lands on the history stack for rollback.
#[derive(Debug, Parser)]
pub(crate) struct Upgrade {}

impl Upgrade {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());
        if db.installed.is_empty() {
            info!("No packages installed.");
            return Ok(());
        }

        let mut metas = BTreeMap::new();
        for (full_name, record) in &db.installed {
            let (meta, recipe_dir) = recipe::load_package_meta(&config.tree, full_name)?;
            if meta.version != record.version {
                metas.insert(full_name.clone(), (meta, recipe_dir));
            }
        }
        if metas.is_empty() {
            info!("No pending upgrades (versions match).");
            return Ok(());
        }

        let graph = metas
            .iter()
            .map(|(name, (meta, _))| (name.clone(), meta.depends.clone()))
            .collect();
        for full_name in resolver::topo_sort(&graph)? {
            let (meta, recipe_dir) = &metas[&full_name];
            let (artifact, manifest) = build::build_package(config, meta, recipe_dir).await?;
            ensure!(
                config.dry_run || !manifest.is_empty(),
                "Manifest missing after upgrade of '{full_name}'"
            );
            let explicit = db
                .installed
                .get(&full_name)
                .map_or(false, |record| record.explicit);
            install_artifact(
                config,
                &PackageIdentity::from(meta),
                &artifact,
                &manifest,
                &mut db,
                explicit,
            )?;
        }
        Ok(())
    }
}
