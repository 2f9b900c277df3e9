//! All of the paths and knobs one invocation operates with, resolved once from the command
//! line and the environment and threaded through every operation. Keeping this in a single
//! value (rather than globals) lets tests point the whole tool at a temporary root.

use anyhow::{Context, Result};
use std::fs;
#[cfg(test)]
use std::path::Path;
use std::path::PathBuf;

pub(crate) const HOME_ENV: &str = "PKGSMITH_HOME";
pub(crate) const HISTORY_LIMIT_ENV: &str = "PKGSMITH_HISTORY_LIMIT";
pub(crate) const CMAKE_GENERATOR_ENV: &str = "PKGSMITH_CMAKE_GENERATOR";

const DEFAULT_HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Root of the content store (`~/.pkgsmith` unless overridden).
    pub(crate) home: PathBuf,
    /// Recipe tree, indexed by `category/name`.
    pub(crate) tree: PathBuf,
    /// Install prefix handed to build backends.
    pub(crate) prefix: PathBuf,
    /// Build parallelism.
    pub(crate) jobs: usize,
    /// How many prior records to keep per package for rollback.
    pub(crate) history_limit: usize,
    /// The filesystem root that installs mutate. Always `/` from the command line; tests
    /// substitute a temporary directory.
    pub(crate) install_root: PathBuf,
    /// Optional CMake generator override.
    pub(crate) cmake_generator: Option<String>,

    pub(crate) dry_run: bool,
    pub(crate) force: bool,
    pub(crate) keep_perms: bool,
    pub(crate) staging: bool,
}

impl Config {
    pub(crate) fn new(
        tree: PathBuf,
        prefix: PathBuf,
        jobs: usize,
        dry_run: bool,
        force: bool,
        keep_perms: bool,
        staging: bool,
    ) -> Result<Self> {
        let home = match std::env::var_os(HOME_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => home::home_dir()
                .context("Unable to determine the user's home directory")?
                .join(".pkgsmith"),
        };
        let history_limit = match std::env::var(HISTORY_LIMIT_ENV) {
            Ok(raw) => raw.parse().context(format!(
                "{} must be a non-negative integer, got '{}'",
                HISTORY_LIMIT_ENV, raw
            ))?,
            Err(_) => DEFAULT_HISTORY_LIMIT,
        };
        Ok(Self {
            home,
            tree,
            prefix,
            jobs,
            history_limit,
            install_root: PathBuf::from("/"),
            cmake_generator: std::env::var(CMAKE_GENERATOR_ENV).ok(),
            dry_run,
            force,
            keep_perms,
            staging,
        })
    }

    pub(crate) fn src_cache(&self) -> PathBuf {
        self.home.join("src")
    }

    pub(crate) fn vcs_cache(&self) -> PathBuf {
        self.src_cache().join("vcs")
    }

    pub(crate) fn bin_cache(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub(crate) fn build_root(&self) -> PathBuf {
        self.home.join("build")
    }

    pub(crate) fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub(crate) fn lock_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    pub(crate) fn db_path(&self) -> PathBuf {
        self.home.join("db.json")
    }

    pub(crate) fn db_lock_path(&self) -> PathBuf {
        self.home.join("db.lock")
    }

    pub(crate) fn lockfile_path(&self) -> PathBuf {
        self.home.join("lockfile.json")
    }

    pub(crate) fn build_log(&self, id: &str) -> PathBuf {
        self.log_dir().join(format!("{id}.log"))
    }

    pub(crate) fn build_lock_path(&self, id: &str) -> PathBuf {
        self.lock_dir().join(format!("{id}.lock"))
    }

    /// Versioned artifact, its manifest, and the unversioned "latest" symlink for a package.
    pub(crate) fn artifact_paths(&self, id: &str, version: &str) -> (PathBuf, PathBuf, PathBuf) {
        let bin = self.bin_cache();
        (
            bin.join(format!("{id}-{version}.tar.zst")),
            bin.join(format!("{id}-{version}.manifest.json")),
            bin.join(format!("{id}.tar.zst")),
        )
    }

    /// Create the store layout. Directories are created on demand; this is cheap to repeat.
    pub(crate) fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.src_cache(),
            self.vcs_cache(),
            self.bin_cache(),
            self.build_root(),
            self.log_dir(),
            self.lock_dir(),
        ] {
            fs::create_dir_all(&dir)
                .context(format!("Unable to create store dir '{}'", dir.display()))?;
        }
        Ok(())
    }

    /// Map a manifest path (POSIX, leading `/`) onto the install root.
    pub(crate) fn dest_path(&self, manifest_path: &str) -> PathBuf {
        self.install_root.join(manifest_path.trim_start_matches('/'))
    }

    #[cfg(test)]
    pub(crate) fn for_test(root: &Path) -> Self {
        Self {
            home: root.join("store"),
            tree: root.join("packages"),
            prefix: PathBuf::from("/usr/local"),
            jobs: 1,
            history_limit: DEFAULT_HISTORY_LIMIT,
            install_root: root.join("rootfs"),
            cmake_generator: None,
            dry_run: false,
            force: false,
            keep_perms: false,
            staging: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_layout_is_rooted_at_home() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        assert_eq!(config.vcs_cache(), config.home.join("src").join("vcs"));
        assert_eq!(config.db_path(), config.home.join("db.json"));

        let (artifact, manifest, latest) = config.artifact_paths("lib-zeta-1.0", "1.0");
        assert_eq!(artifact, config.home.join("bin/lib-zeta-1.0-1.0.tar.zst"));
        assert_eq!(
            manifest,
            config.home.join("bin/lib-zeta-1.0-1.0.manifest.json")
        );
        assert_eq!(latest, config.home.join("bin/lib-zeta-1.0.tar.zst"));
    }

    #[test]
    fn ensure_dirs_creates_the_layout() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        config.ensure_dirs().unwrap();
        assert!(config.vcs_cache().is_dir());
        assert!(config.bin_cache().is_dir());
        assert!(config.lock_dir().is_dir());
    }

    #[test]
    fn dest_path_strips_the_leading_slash() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        assert_eq!(
            config.dest_path("/usr/local/bin/zeta"),
            config.install_root.join("usr/local/bin/zeta")
        );
    }
}
