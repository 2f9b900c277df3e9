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

/// Rebuild every installed package from its current recipe and reinstall it, in dependency
/// order. Explicit markings are preserved.
#[derive(Debug, Parser)]
pub(crate) struct RebuildAll {}

impl RebuildAll {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());
        if db.installed.is_empty() {
            info!("No packages installed.");
            return Ok(());
        }

        let names: Vec<String> = db.installed.keys().cloned().collect();
        let mut metas = BTreeMap::new();
        for full_name in &names {
            metas.insert(
                full_name.clone(),
                recipe::load_package_meta(&config.tree, full_name)?,
            );
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
                "Manifest missing after rebuild of '{full_name}'"
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
