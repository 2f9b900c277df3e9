mod autoremove;
mod build;
mod doctor;
mod install;
mod list;
mod rebuild;
mod rollback;
mod sync;
mod uninstall;
mod upgrade;
mod verify;

use crate::config::Config;
use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::num::NonZeroUsize;
use std::path::PathBuf;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// A source-based package manager: build packages from recipes and install them with
/// staged, reversible filesystem transactions.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Recipe tree directory, indexed by category/name.
    #[clap(long = "tree", env = "PKGSMITH_TREE", default_value = "packages", global = true)]
    tree: PathBuf,

    /// Install prefix handed to build backends (e.g. /usr/local).
    #[clap(long = "prefix", env = "PKGSMITH_PREFIX", default_value = "/usr/local", global = true)]
    prefix: PathBuf,

    /// Build parallelism. Defaults to the number of CPUs.
    #[clap(short = 'j', long = "jobs", env = "PKGSMITH_JOBS", global = true)]
    jobs: Option<usize>,

    /// Log the commands that would run without executing them.
    #[clap(long = "dry-run", global = true)]
    dry_run: bool,

    /// Allow overwriting files that exist on the filesystem but are owned by no package.
    #[clap(long = "force", global = true)]
    force: bool,

    /// Legacy install mode: extract straight onto the root with no staging, backups, or
    /// rollback. Discouraged.
    #[clap(long = "no-staging", global = true)]
    no_staging: bool,

    /// Preserve the permissions recorded in the artifact when installing.
    #[clap(long = "keep-perms", global = true)]
    keep_perms: bool,

    /// More logs (-v for debug, -vv for trace). You can also leave this unset and use the
    /// RUST_LOG env variable. See https://github.com/rust-cli/env_logger/
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Build a package and its dependencies; do not install.
    #[clap(name = "b")]
    Build(build::Build),

    /// Build if needed, then install a package and its dependencies.
    #[clap(name = "i")]
    Install(install::Install),

    /// Rebuild and reinstall every installed package in dependency order.
    #[clap(name = "rb")]
    RebuildAll(rebuild::RebuildAll),

    /// Rebuild and reinstall each installed package whose recipe version changed.
    #[clap(name = "u")]
    Upgrade(upgrade::Upgrade),

    /// List installed packages.
    #[clap(name = "l")]
    List(list::List),

    Uninstall(uninstall::Uninstall),

    Rollback(rollback::Rollback),

    /// Uninstall packages that were pulled in as dependencies and are no longer needed.
    Autoremove(autoremove::Autoremove),

    Verify(verify::Verify),

    /// Audit the database and caches for missing artifacts and dangling references.
    Doctor(doctor::Doctor),

    /// Update the recipe tree from its upstream VCS.
    Sync(sync::Sync),
}

/// Entrypoint for the `pkgsmith` command line program.
pub(super) async fn run(args: Args) -> Result<()> {
    let jobs = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    });
    let config = Config::new(
        args.tree,
        args.prefix,
        jobs,
        args.dry_run,
        args.force,
        args.keep_perms,
        !args.no_staging,
    )?;
    match args.subcommand {
        Subcommand::Build(cmd) => cmd.run(&config).await,
        Subcommand::Install(cmd) => cmd.run(&config).await,
        Subcommand::RebuildAll(cmd) => cmd.run(&config).await,
        Subcommand::Upgrade(cmd) => cmd.run(&config).await,
        Subcommand::List(cmd) => cmd.run(&config).await,
        Subcommand::Uninstall(cmd) => cmd.run(&config).await,
        Subcommand::Rollback(cmd) => cmd.run(&config).await,
        Subcommand::Autoremove(cmd) => cmd.run(&config).await,
        Subcommand::Verify(cmd) => cmd.run(&config).await,
        Subcommand::Doctor(cmd) => cmd.run(&config).await,
        Subcommand::Sync(cmd) => cmd.run(&config).await,
    }
}

/// Use `-v` flags if present, or else use `RUST_LOG` if present, or else use a default.
pub(super) fn init_logger(verbose: u8) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), verbose) {
        (Some(_), 0) => {
            // RUST_LOG exists and no -v was given; use the environment variable.
            Builder::from_default_env().init();
        }
        (_, v) => {
            let level = match v {
                0 => DEFAULT_LEVEL_FILTER,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            };
            // Use the derived log level for this crate only.
            Builder::new()
                .filter(Some(env!("CARGO_CRATE_NAME")), level)
                .init();
        }
    }
}
