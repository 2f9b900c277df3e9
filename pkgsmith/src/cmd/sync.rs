use crate::common::{require_tools, run_step};
use crate::config::Config;
use anyhow::{ensure, Result};
use clap::Parser;
use tokio::process::Command;

/// Pull the recipe tree from its upstream VCS, optionally pushing local commits back.
#[derive(Debug, Parser)]
pub(crate) struct Sync {
    /// Push after pulling.
    #[clap(long = "push")]
    pub(crate) push: bool,
}

impl Sync {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        require_tools(&["git"])?;
        ensure!(
            config.tree.is_dir(),
            "Recipe tree not found: '{}'",
            config.tree.display()
        );
        run_step(
            Command::new("git")
                .args(["pull", "--rebase"])
                .current_dir(&config.tree),
            None,
            config.dry_run,
        )
        .await?;
        if self.push {
            run_step(
                Command::new("git").arg("push").current_dir(&config.tree),
                None,
                config.dry_run,
            )
            .await?;
        }
        Ok(())
    }
}
