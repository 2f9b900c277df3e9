use crate::build;
use crate::config::Config;
use crate::resolver;
use anyhow::Result;
use clap::Parser;

/// Build a package and everything it depends on, leaving the artifacts in the binary
/// cache.
#[derive(Debug, Parser)]
pub(crate) struct Build {
    /// Package to build, as 'category/name'.
    pub(crate) pkg: String,
}

impl Build {
    pub(super) async fn run(&self, config: &Config) -> Result<()> {
        let resolution = resolver::resolve(&config.tree, &self.pkg)?;
        for full_name in &resolution.order {
            let (meta, recipe_dir) = &resolution.metas[full_name];
            build::build_package(config, meta, recipe_dir).await?;
        }
        Ok(())
    }
}
