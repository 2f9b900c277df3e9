//! The canonical listing of an artifact's contents. One entry per path beneath the staged
//! DESTDIR, keyed by the absolute POSIX path the entry will occupy once installed.
//! Determinism comes from the content, not the traversal: entries live in a sorted map,
//! file hashes are SHA-256 over raw bytes, and symlink targets are captured verbatim.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ManifestEntry {
    File { sha256: String },
    Symlink { target: String },
    Dir,
    /// Device, fifo, or socket. Recorded so the entry is visible, never installed.
    Special,
}

impl ManifestEntry {
    /// Whether this entry lands on the filesystem and takes an owner.
    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, ManifestEntry::File { .. } | ManifestEntry::Symlink { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub(crate) entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walk a staged DESTDIR and record every entry beneath it. The walk is sorted and does
    /// not follow symlinks; an entry that is neither file, dir, nor symlink is `special`.
    pub(crate) fn from_destdir(destdir: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(destdir)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.context(format!(
                "Unable to walk staged dir '{}'",
                destdir.display()
            ))?;
            let path = entry.path();
            if path == destdir {
                continue;
            }
            let rel = path
                .strip_prefix(destdir)
                .context("Walked path escaped the staged dir")?;
            let key = format!("/{}", rel.display());

            let file_type = entry.file_type();
            let record = if file_type.is_symlink() {
                let target = std::fs::read_link(path)
                    .context(format!("Unable to read link '{}'", path.display()))?;
                ManifestEntry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            } else if file_type.is_dir() {
                ManifestEntry::Dir
            } else if file_type.is_file() {
                ManifestEntry::File {
                    sha256: sha256_file(path)?,
                }
            } else {
                ManifestEntry::Special
            };
            entries.insert(key, record);
        }
        Ok(Self { entries })
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .context(format!("Unable to read manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .context(format!("Unable to parse manifest '{}'", path.display()))
    }
}

/// SHA-256 of a file's raw bytes, hex-encoded.
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).context(format!("Unable to open '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .context(format!("Unable to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn records_files_dirs_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let stage = temp.path();
        fs::create_dir_all(stage.join("usr/local/bin")).unwrap();
        fs::write(stage.join("usr/local/bin/zeta"), b"#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink("zeta", stage.join("usr/local/bin/z")).unwrap();

        let manifest = Manifest::from_destdir(stage).unwrap();
        assert_eq!(manifest.entries.get("/usr"), Some(&ManifestEntry::Dir));
        assert_eq!(
            manifest.entries.get("/usr/local/bin/z"),
            Some(&ManifestEntry::Symlink {
                target: "zeta".to_string()
            })
        );
        let expected = sha256_file(&stage.join("usr/local/bin/zeta")).unwrap();
        assert_eq!(
            manifest.entries.get("/usr/local/bin/zeta"),
            Some(&ManifestEntry::File { sha256: expected })
        );
    }

    #[test]
    fn serialization_is_stable_and_sorted() {
        let temp = TempDir::new().unwrap();
        let stage = temp.path();
        fs::create_dir_all(stage.join("b")).unwrap();
        fs::create_dir_all(stage.join("a")).unwrap();
        fs::write(stage.join("a/one"), b"one").unwrap();
        fs::write(stage.join("b/two"), b"two").unwrap();

        let first = Manifest::from_destdir(stage).unwrap();
        let second = Manifest::from_destdir(stage).unwrap();
        assert_eq!(
            serde_json::to_string_pretty(&first).unwrap(),
            serde_json::to_string_pretty(&second).unwrap()
        );

        let keys: Vec<&String> = first.entries.keys().collect();
        assert_eq!(keys, vec!["/a", "/a/one", "/b", "/b/two"]);
    }

    #[test]
    fn unknown_entry_types_are_rejected() {
        let raw = r#"{"entries": {"/x": {"type": "block-device"}}}"#;
        assert!(serde_json::from_str::<Manifest>(raw).is_err());
    }

    #[test]
    fn symlink_targets_are_not_resolved() {
        let temp = TempDir::new().unwrap();
        let stage = temp.path();
        std::os::unix::fs::symlink("../relative/target", stage.join("link")).unwrap();
        let manifest = Manifest::from_destdir(stage).unwrap();
        assert_eq!(
            manifest.entries.get("/link"),
            Some(&ManifestEntry::Symlink {
                target: "../relative/target".to_string()
            })
        );
    }
}
