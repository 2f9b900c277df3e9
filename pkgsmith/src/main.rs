use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod archive;
mod build;
mod cmd;
mod common;
mod config;
mod db;
mod fetch;
mod install;
mod lockfile;
mod locks;
mod manifest;
mod recipe;
mod resolver;
/// Test code that should only be compiled when running tests.
#[cfg(test)]
mod test;
mod uninstall;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can return a result
/// from the `main` function. Modeled failures exit 1; an interrupt kills the process with
/// the usual 130.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);
    cmd::run(args).await
}
