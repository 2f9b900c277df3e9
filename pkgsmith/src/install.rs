//! The staged installer. An artifact is never unpacked straight onto the live root:
//! conflicts are detected before any mutation, the artifact is extracted into a temporary
//! stage, every file is applied with a rename so readers never see a half-written file,
//! anything overwritten is saved into a per-operation backup tree, and a failure mid-apply
//! restores those backups before the error propagates. Only after the filesystem is fully
//! applied does the database commit.

use crate::archive::unpack_tar_zst;
use crate::config::Config;
use crate::db::{Database, InstalledRecord};
use crate::manifest::{Manifest, ManifestEntry};
use crate::recipe::PackageMeta;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const TMP_SUFFIX: &str = "tmp.pkgsmith";
const SYMLINK_SIDECAR_SUFFIX: &str = ".symlink";

/// What install needs to know about a package. Built from a recipe for normal installs, or
/// from an installed record when rollback replays an older artifact with no recipe around.
#[derive(Debug, Clone)]
pub(crate) struct PackageIdentity {
    pub(crate) full_name: String,
    pub(crate) version: String,
    pub(crate) id: String,
    pub(crate) depends: Vec<String>,
}

impl From<&PackageMeta> for PackageIdentity {
    fn from(meta: &PackageMeta) -> Self {
        Self {
            full_name: meta.full_name(),
            version: meta.version.clone(),
            id: meta.id(),
            depends: meta.depends.clone(),
        }
    }
}

impl PackageIdentity {
    /// Rebuild an identity from an installed record, e.g. when rollback replays an older
    /// artifact whose recipe may no longer exist.
    pub(crate) fn from_record(full_name: &str, record: &InstalledRecord) -> Self {
        Self {
            full_name: full_name.to_string(),
            version: record.version.clone(),
            id: record.id.clone(),
            depends: record.depends.clone(),
        }
    }
}

/// Install an artifact and commit it to the database. `explicit` marks a package the user
/// asked for by name, which protects it from autoremove.
pub(crate) fn install_artifact(
    config: &Config,
    identity: &PackageIdentity,
    artifact: &Path,
    manifest: &Manifest,
    db: &mut Database,
    explicit: bool,
) -> Result<()> {
    let full_name = &identity.full_name;

    // Conflict detection happens before anything on disk changes. A path owned by another
    // package is always fatal; an unowned path that already exists is fatal unless forced.
    for (path, entry) in &manifest.entries {
        if !entry.is_owned() {
            continue;
        }
        match db.owners.get(path) {
            Some(owner) if owner != full_name => bail!(
                "Conflict: '{path}' is owned by '{owner}' (while installing '{full_name}')"
            ),
            Some(_) => {}
            None => {
                let dest = config.dest_path(path);
                if dest.symlink_metadata().is_ok() && !config.force {
                    bail!(
                        "Conflict: '{path}' already exists on the filesystem and no package \
                         owns it (use --force to overwrite)"
                    );
                }
            }
        }
    }

    // Upgrades move the current record onto the history stack for rollback.
    if let Some(existing) = db.installed.get(full_name).cloned() {
        db.push_history(full_name, existing, config.history_limit);
    }

    if config.dry_run {
        info!("[dry-run] install {} ({})", full_name, identity.version);
    } else if config.staging {
        let temp = tempfile::Builder::new()
            .prefix("pkgsmith-stage-")
            .tempdir()
            .context("Unable to create the staging directory")?;
        let stage = temp.path().join("rootfs");
        let backups = temp.path().join("backups");
        unpack_tar_zst(artifact, &stage, config.keep_perms)?;
        if let Err(err) = apply_stage(config, &stage, manifest, &backups) {
            warn!("Install of '{full_name}' failed, restoring overwritten files");
            restore_backups(config, &backups);
            return Err(err);
        }
    } else {
        // Legacy mode: extract straight onto the root. No backups, no rollback.
        unpack_tar_zst(artifact, &config.install_root, config.keep_perms)?;
    }

    for (path, entry) in &manifest.entries {
        if entry.is_owned() {
            db.owners.insert(path.clone(), full_name.clone());
        }
    }
    db.installed.insert(
        full_name.clone(),
        InstalledRecord {
            version: identity.version.clone(),
            id: identity.id.clone(),
            depends: identity.depends.clone(),
            manifest: manifest.clone(),
            explicit,
            artifact: artifact.to_path_buf(),
        },
    );
    if !config.dry_run {
        db.save(&config.db_path())?;
    }
    Ok(())
}

/// Apply the staged tree onto the install root: directories shallowest-first so parents
/// exist, then files and symlinks in sorted order, each preceded by a backup of whatever
/// it replaces.
fn apply_stage(config: &Config, stage: &Path, manifest: &Manifest, backups: &Path) -> Result<()> {
    let mut dirs: Vec<&String> = manifest
        .entries
        .iter()
        .filter(|(_, entry)| matches!(entry, ManifestEntry::Dir))
        .map(|(path, _)| path)
        .collect();
    dirs.sort_by_key(|path| path.matches('/').count());
    for path in dirs {
        let dst = config.dest_path(path);
        fs::create_dir_all(&dst)
            .context(format!("Unable to create '{}'", dst.display()))?;
    }

    for (path, entry) in &manifest.entries {
        if !entry.is_owned() {
            continue;
        }
        let dst = config.dest_path(path);
        let src = stage.join(path.trim_start_matches('/'));
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .context(format!("Unable to create '{}'", parent.display()))?;
        }
        back_up_existing(&dst, path, backups);

        match entry {
            ManifestEntry::Symlink { .. } => {
                if dst.symlink_metadata().is_ok() {
                    fs::remove_file(&dst)
                        .context(format!("Unable to replace '{}'", dst.display()))?;
                }
                let target = fs::read_link(&src)
                    .context(format!("Unable to read staged link '{}'", src.display()))?;
                std::os::unix::fs::symlink(&target, &dst)
                    .context(format!("Unable to create link '{}'", dst.display()))?;
            }
            ManifestEntry::File { .. } => {
                let name = dst
                    .file_name()
                    .context("Install path has no file name")?
                    .to_string_lossy();
                let tmp = dst.with_file_name(format!("{name}.{TMP_SUFFIX}"));
                if tmp.exists() {
                    fs::remove_file(&tmp)
                        .context(format!("Unable to clear '{}'", tmp.display()))?;
                }
                fs::copy(&src, &tmp).context(format!(
                    "Unable to stage '{}' into place",
                    dst.display()
                ))?;
                fs::rename(&tmp, &dst)
                    .context(format!("Unable to install '{}'", dst.display()))?;
            }
            ManifestEntry::Dir | ManifestEntry::Special => {}
        }
    }
    Ok(())
}

/// Save whatever currently sits at `dst` into the backup tree. Symlinks are recorded as a
/// sidecar file holding the target; directories need no backup. Best-effort: a path we
/// cannot back up is not worth failing the install over, it only narrows rollback.
fn back_up_existing(dst: &Path, manifest_path: &str, backups: &Path) {
    let Ok(meta) = dst.symlink_metadata() else {
        return;
    };
    let backup = backups.join(manifest_path.trim_start_matches('/'));
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        if meta.file_type().is_symlink() {
            let target = fs::read_link(dst)?;
            let name = backup.file_name().unwrap_or_default().to_string_lossy();
            let sidecar = backup.with_file_name(format!("{name}{SYMLINK_SIDECAR_SUFFIX}"));
            fs::write(sidecar, target.to_string_lossy().as_bytes())?;
        } else if meta.is_file() {
            fs::copy(dst, &backup)?;
        }
        Ok(())
    })();
    if let Err(err) = result {
        warn!("Unable to back up '{}': {err}", dst.display());
    }
}

/// Undo a failed apply by restoring every saved entry. Best-effort by design: this runs on
/// the error path and restores as much as it can.
fn restore_backups(config: &Config, backups: &Path) {
    if !backups.exists() {
        return;
    }
    for entry in WalkDir::new(backups).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(backups) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(link_name) = name.strip_suffix(SYMLINK_SIDECAR_SUFFIX) {
            let dst = config
                .install_root
                .join(rel.parent().unwrap_or(Path::new("")))
                .join(link_name);
            let Ok(target) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if dst.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&dst);
            }
            let _ = std::os::unix::fs::symlink(PathBuf::from(target), &dst);
        } else {
            let dst = config.install_root.join(rel);
            if let Some(parent) = dst.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = fs::copy(entry.path(), &dst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::pack_tar_zst;
    use crate::manifest::sha256_file;
    use tempfile::TempDir;

    fn identity(full_name: &str, version: &str) -> PackageIdentity {
        PackageIdentity {
            full_name: full_name.to_string(),
            version: version.to_string(),
            id: format!("{}-{version}", full_name.replace('/', "-")),
            depends: vec![],
        }
    }

    /// Build an artifact shipping the given `(path, contents)` files.
    fn make_artifact(
        temp: &Path,
        name: &str,
        files: &[(&str, &str)],
    ) -> (PathBuf, Manifest) {
        let destdir = temp.join(format!("destdir-{name}"));
        for (path, contents) in files {
            let dst = destdir.join(path.trim_start_matches('/'));
            fs::create_dir_all(dst.parent().unwrap()).unwrap();
            fs::write(&dst, contents).unwrap();
        }
        let manifest = Manifest::from_destdir(&destdir).unwrap();
        let artifact = temp.join(format!("{name}.tar.zst"));
        pack_tar_zst(&destdir, &artifact, 1).unwrap();
        (artifact, manifest)
    }

    #[test]
    fn fresh_install_lands_files_and_owners() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let (artifact, manifest) = make_artifact(
            temp.path(),
            "zeta-1.0",
            &[("/usr/local/bin/zeta", "zeta 1.0")],
        );
        let mut db = Database::default();

        install_artifact(
            &config,
            &identity("lib/zeta", "1.0"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap();

        let installed = config.install_root.join("usr/local/bin/zeta");
        assert_eq!(fs::read_to_string(&installed).unwrap(), "zeta 1.0");
        assert_eq!(
            db.owners.get("/usr/local/bin/zeta"),
            Some(&"lib/zeta".to_string())
        );
        let record = &db.installed["lib/zeta"];
        assert_eq!(record.version, "1.0");
        assert!(record.explicit);
        assert_eq!(record.artifact, artifact);

        // The database hit the disk atomically; a fresh load sees the commit.
        let reloaded = Database::load(&config.db_path());
        assert!(reloaded.installed.contains_key("lib/zeta"));
    }

    #[test]
    fn path_owned_by_another_package_is_fatal_even_with_force() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::for_test(temp.path());
        config.force = true;
        let (artifact, manifest) = make_artifact(
            temp.path(),
            "fork-1.0",
            &[("/usr/local/bin/zeta", "fork")],
        );
        let mut db = Database::default();
        db.owners
            .insert("/usr/local/bin/zeta".to_string(), "lib/zeta".to_string());

        let err = install_artifact(
            &config,
            &identity("lib/zeta-fork", "1.0"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("is owned by 'lib/zeta'"));
        assert!(!db.installed.contains_key("lib/zeta-fork"));
        assert!(!config.install_root.join("usr/local/bin/zeta").exists());
    }

    #[test]
    fn unowned_existing_file_conflicts_unless_forced() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let (artifact, manifest) = make_artifact(
            temp.path(),
            "zeta-1.0",
            &[("/usr/local/bin/zeta", "zeta 1.0")],
        );
        let unmanaged = config.install_root.join("usr/local/bin/zeta");
        fs::create_dir_all(unmanaged.parent().unwrap()).unwrap();
        fs::write(&unmanaged, "hand-built").unwrap();

        let mut db = Database::default();
        let err = install_artifact(
            &config,
            &identity("lib/zeta", "1.0"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("use --force"));
        assert_eq!(fs::read_to_string(&unmanaged).unwrap(), "hand-built");

        let mut forced = Config::for_test(temp.path());
        forced.force = true;
        install_artifact(
            &forced,
            &identity("lib/zeta", "1.0"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap();
        assert_eq!(fs::read_to_string(&unmanaged).unwrap(), "zeta 1.0");
    }

    #[test]
    fn upgrade_pushes_the_old_record_onto_history() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let (v1, m1) = make_artifact(
            temp.path(),
            "zeta-1.0",
            &[("/usr/local/bin/zeta", "zeta 1.0")],
        );
        let (v2, m2) = make_artifact(
            temp.path(),
            "zeta-1.1",
            &[("/usr/local/bin/zeta", "zeta 1.1")],
        );
        let mut db = Database::default();

        install_artifact(&config, &identity("lib/zeta", "1.0"), &v1, &m1, &mut db, true)
            .unwrap();
        install_artifact(&config, &identity("lib/zeta", "1.1"), &v2, &m2, &mut db, true)
            .unwrap();

        assert_eq!(db.installed["lib/zeta"].version, "1.1");
        assert_eq!(db.history["lib/zeta"][0].version, "1.0");
        assert_eq!(
            fs::read_to_string(config.install_root.join("usr/local/bin/zeta")).unwrap(),
            "zeta 1.1"
        );
    }

    #[test]
    fn failed_apply_restores_overwritten_files() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let (artifact, mut manifest) = make_artifact(
            temp.path(),
            "zeta-1.1",
            &[("/usr/local/bin/zeta", "zeta 1.1")],
        );
        // An entry the stage cannot satisfy: applying it fails after 'zeta' was replaced.
        manifest.entries.insert(
            "/usr/local/bin/zzz-missing".to_string(),
            ManifestEntry::File {
                sha256: "0".repeat(64),
            },
        );

        let existing = config.install_root.join("usr/local/bin/zeta");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "zeta 1.0").unwrap();

        let mut forced = config.clone();
        forced.force = true;
        let mut db = Database::default();
        let err = install_artifact(
            &forced,
            &identity("lib/zeta", "1.1"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("zzz-missing"));

        // The overwritten file came back, and nothing was committed.
        assert_eq!(fs::read_to_string(&existing).unwrap(), "zeta 1.0");
        assert!(!db.installed.contains_key("lib/zeta"));
        assert!(!config.db_path().exists());
    }

    #[test]
    fn file_replacement_goes_through_a_sibling_rename() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let (artifact, manifest) = make_artifact(
            temp.path(),
            "zeta-1.0",
            &[("/usr/local/bin/zeta", "zeta 1.0")],
        );
        let mut db = Database::default();
        install_artifact(
            &config,
            &identity("lib/zeta", "1.0"),
            &artifact,
            &manifest,
            &mut db,
            true,
        )
        .unwrap();

        // No temp droppings remain next to installed files.
        let dir = config.install_root.join("usr/local/bin");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());

        let hash = sha256_file(&dir.join("zeta")).unwrap();
        match &manifest.entries["/usr/local/bin/zeta"] {
            ManifestEntry::File { sha256 } => assert_eq!(&hash, sha256),
            other => panic!("expected a file entry, got {other:?}"),
        }
    }
}
