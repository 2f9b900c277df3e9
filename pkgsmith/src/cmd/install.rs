use crate::build;
use crate::config::Config;
use crate::db::Database;
use crate::install::{install_artifact, PackageIdentity};
use crate::locks::LockFile;
use crate::manifest::Manifest;
use crate::resolver;
use anyhow::{Context, Result};
use clap::Parser;
use log::info;

/// Install a package and its dependencies, building whatever is not already in the binary
/// cache. The named package is recorded as explicit; dependencies are not.
#[derive(Debug, Parser)]
pub(crate) struct Install {
    /// Package to install, as 'category/name'.
    pub(crate) pkg: String,
}

impl Install {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        config.ensure_dirs()?;
        let _db_lock = LockFile::acquire(&config.db_lock_path())?;
        let mut db = Database::load(&config.db_path());
        let resolution = resolver::resolve(&config.tree, &self.pkg)?;

        for full_name in &resolution.order {
            let (meta, recipe_dir) = &resolution.metas[full_name];
            let (cached_artifact, manifest_path, _) =
                config.artifact_paths(&meta.id(), &meta.version);

            let mut artifact = cached_artifact.clone();
            let mut manifest = Manifest::default();
            if cached_artifact.is_file() && manifest_path.is_file() && !config.dry_run {
                manifest = Manifest::load(&manifest_path).unwrap_or_default();
                let installed_version = db
                    .installed
                    .get(full_name)
                    .map(|record| record.version.as_str());
                if installed_version == Some(meta.version.as_str()) {
                    info!("Already installed (same version): {full_name}");
                    continue;
                }
            }

            if manifest.is_empty() {
                let (built, built_manifest) =
                    build::build_package(config, meta, recipe_dir).await?;
                artifact = built;
                manifest = built_manifest;
                if manifest.is_empty() && !config.dry_run {
                    // Cached artifact with an unreadable manifest: the record from the
                    // previous install of this package is the last resort.
                    manifest = db
                        .installed
                        .get(full_name)
                        .map(|record| record.manifest.clone())
                        .filter(|manifest| !manifest.is_empty())
                        .context(format!(
                            "No manifest available for '{full_name}'; rebuild required"
                        ))?;
                }
            }

            install_artifact(
                config,
                &PackageIdentity::from(meta),
                &artifact,
                &manifest,
                &mut db,
                full_name == &self.pkg,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::seed_buildable;
    use std::fs;
    use tempfile::TempDir;

    fn installed_file(config: &Config, name: &str) -> std::path::PathBuf {
        config.install_root.join("usr/local/bin").join(name)
    }

    #[tokio::test]
    async fn install_pulls_dependencies_in_as_implicit() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        seed_buildable(&config, "lib/zeta", "1.0", &[]);
        seed_buildable(&config, "app/foo", "2.3", &["lib/zeta"]);

        Install {
            pkg: "app/foo".to_string(),
        }
        .run(&config)
        .await
        .unwrap();

        let db = Database::load(&config.db_path());
        assert_eq!(db.installed["app/foo"].version, "2.3");
        assert!(db.installed["app/foo"].explicit);
        assert_eq!(db.installed["lib/zeta"].version, "1.0");
        assert!(!db.installed["lib/zeta"].explicit);
        assert_eq!(
            db.owners.get("/usr/local/bin/zeta"),
            Some(&"lib/zeta".to_string())
        );
        assert_eq!(
            fs::read_to_string(installed_file(&config, "foo")).unwrap(),
            "foo 2.3"
        );
        assert_eq!(
            fs::read_to_string(installed_file(&config, "zeta")).unwrap(),
            "zeta 1.0"
        );
    }

    #[tokio::test]
    async fn reinstalling_the_same_version_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        seed_buildable(&config, "lib/zeta", "1.0", &[]);

        let install = Install {
            pkg: "lib/zeta".to_string(),
        };
        install.run(&config).await.unwrap();
        let before = fs::read(config.db_path()).unwrap();
        install.run(&config).await.unwrap();
        assert_eq!(before, fs::read(config.db_path()).unwrap());
    }

    #[tokio::test]
    async fn conflicting_packages_do_not_both_install() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        seed_buildable(&config, "lib/zeta", "1.0", &[]);
        // Ships the same binary name, so the same installed path.
        seed_buildable(&config, "fork/zeta", "1.0", &[]);

        Install {
            pkg: "lib/zeta".to_string(),
        }
        .run(&config)
        .await
        .unwrap();
        let err = Install {
            pkg: "fork/zeta".to_string(),
        }
        .run(&config)
        .await
        .unwrap_err();
        assert!(err.to_string().contains("is owned by 'lib/zeta'"));

        let db = Database::load(&config.db_path());
        assert!(!db.installed.contains_key("fork/zeta"));
        assert_eq!(
            fs::read_to_string(installed_file(&config, "zeta")).unwrap(),
            "zeta 1.0"
        );
    }

    // Keep the helper honest about where it writes.
    #[test]
    fn seeded_recipes_parse() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        seed_buildable(&config, "lib/zeta", "1.0", &["lib/eta"]);
        let (meta, _) = crate::recipe::load_package_meta(&config.tree, "lib/zeta").unwrap();
        assert_eq!(meta.depends, vec!["lib/eta"]);
        assert_eq!(meta.id(), "lib-zeta-1.0");
    }
}
