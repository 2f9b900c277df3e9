//! Persistent record of what is installed, which package owns each path, and the per-package
//! history stack that backs rollback.
//!
//! The on-disk format is schema 3. Loaders for schemas 1 (a bare `full_name -> record` map)
//! and 2 (no history) migrate in memory; the saver always writes schema 3, atomically.
//! An unreadable database is treated as empty so a damaged install can still be operated
//! on; `doctor` is the place where that damage becomes visible.

use crate::manifest::Manifest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_VERSION: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct InstalledRecord {
    pub(crate) version: String,
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) depends: Vec<String>,
    #[serde(default)]
    pub(crate) manifest: Manifest,
    #[serde(default)]
    pub(crate) explicit: bool,
    #[serde(default)]
    pub(crate) artifact: PathBuf,
}

#[derive(Debug, Default)]
pub(crate) struct Database {
    pub(crate) installed: BTreeMap<String, InstalledRecord>,
    pub(crate) owners: BTreeMap<String, String>,
    pub(crate) history: BTreeMap<String, Vec<InstalledRecord>>,
}

#[derive(Serialize)]
struct OnDisk<'a> {
    schema: u64,
    installed: &'a BTreeMap<String, InstalledRecord>,
    owners: &'a BTreeMap<String, String>,
    history: &'a BTreeMap<String, Vec<InstalledRecord>>,
}

impl Database {
    /// Load the database, migrating legacy schemas. Damage of any kind yields an empty
    /// database rather than an error.
    pub(crate) fn load(path: &Path) -> Self {
        let Ok(bytes) = fs::read(path) else {
            return Self::default();
        };
        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
            return Self::default();
        };
        Self::from_value(value).unwrap_or_default()
    }

    fn from_value(value: Value) -> Option<Self> {
        let obj = value.as_object()?;
        let schema = obj.get("schema").and_then(Value::as_u64).unwrap_or(1);
        match schema {
            3 => Some(Self {
                installed: parse_field(obj.get("installed")),
                owners: parse_field(obj.get("owners")),
                history: parse_field(obj.get("history")),
            }),
            2 => Some(Self {
                installed: parse_field(obj.get("installed")),
                owners: parse_field(obj.get("owners")),
                history: BTreeMap::new(),
            }),
            1 => {
                // Schema 1 was the installed map itself at top level.
                let mut installed = BTreeMap::new();
                for (name, record) in obj {
                    if record.get("version").is_some() {
                        if let Ok(record) = serde_json::from_value(record.clone()) {
                            installed.insert(name.clone(), record);
                        }
                    }
                }
                Some(Self {
                    installed,
                    owners: BTreeMap::new(),
                    history: BTreeMap::new(),
                })
            }
            _ => None,
        }
    }

    /// Write schema 3 atomically: serialize to a sibling temp file, then rename over.
    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Unable to create '{}'", parent.display()))?;
        }
        let on_disk = OnDisk {
            schema: SCHEMA_VERSION,
            installed: &self.installed,
            owners: &self.owners,
            history: &self.history,
        };
        let json = serde_json::to_string_pretty(&on_disk)
            .context("Unable to serialize the package database")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .context(format!("Unable to write '{}'", tmp.display()))?;
        fs::rename(&tmp, path).context(format!(
            "Unable to move the package database into place at '{}'",
            path.display()
        ))?;
        Ok(())
    }

    /// Push a record onto a package's history stack, truncating to `limit`.
    pub(crate) fn push_history(&mut self, full_name: &str, record: InstalledRecord, limit: usize) {
        let stack = self.history.entry(full_name.to_string()).or_default();
        stack.insert(0, record);
        stack.truncate(limit);
    }
}

fn parse_field<T: Default + for<'de> Deserialize<'de>>(value: Option<&Value>) -> T {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
