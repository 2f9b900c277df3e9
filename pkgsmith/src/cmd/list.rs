use crate::config::Config;
use crate::db::Database;
use anyhow::Result;
use clap::Parser;

/// List installed packages with their versions.
#[derive(Debug, Parser)]
pub(crate) struct List {}

impl List {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        // Read-only: no lock needed, the database file is replaced atomically.
        let db = Database::load(&config.db_path());
        if db.installed.is_empty() {
            println!("(none)");
            return Ok(());
        }
        for (full_name, record) in &db.installed {
            println!("{} {}", full_name, record.version);
        }
        Ok(())
    }
}
