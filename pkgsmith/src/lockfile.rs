//! The reproducibility lockfile: for every git-sourced package, the commit its checkout
//! last resolved to. When an entry is present (and still matches the recipe's repo), the
//! checkout is pinned to that commit instead of chasing the branch or tag.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PinnedSource {
    pub(crate) repo: String,
    pub(crate) commit: String,
    #[serde(rename = "ref")]
    pub(crate) reference: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Lockfile {
    #[serde(default)]
    schema: u64,
    #[serde(default)]
    packages: BTreeMap<String, PinnedSource>,
}

impl Lockfile {
    /// Load the lockfile; a missing or damaged file is an empty one.
    pub(crate) fn load(path: &Path) -> Self {
        fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, full_name: &str) -> Option<&PinnedSource> {
        self.packages.get(full_name)
    }

    pub(crate) fn pin(&mut self, full_name: &str, pin: PinnedSource) {
        self.packages.insert(full_name.to_string(), pin);
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Unable to create '{}'", parent.display()))?;
        }
        let on_disk = Lockfile {
            schema: SCHEMA_VERSION,
            packages: self.packages.clone(),
        };
        let json = serde_json::to_string_pretty(&on_disk)
            .context("Unable to serialize the lockfile")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).context(format!("Unable to write '{}'", tmp.display()))?;
        fs::rename(&tmp, path).context(format!(
            "Unable to move the lockfile into place at '{}'",
            path.display()
        ))?;
        Ok(())
    }
}
