use anyhow::{ensure, Context, Result};
use log::{self, debug, info, LevelFilter};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Render a command the way a user would type it, for logs and dry-run output.
pub(crate) fn pretty_command(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

/// Run a `tokio::process::Command` and return a `Result` letting us know whether or not it
/// worked. Pipes stdout/stderr when the logging `LevelFilter` is more verbose than `Warn`.
pub(crate) async fn exec_log(cmd: &mut Command) -> Result<()> {
    let quiet = matches!(
        log::max_level(),
        LevelFilter::Off | LevelFilter::Error | LevelFilter::Warn
    );
    exec(cmd, quiet).await
}

/// Run a `tokio::process::Command` and return a `Result` letting us know whether or not it
/// worked. `quiet` determines whether or not the command output will be piped to
/// `stdout/stderr`. When `quiet=true`, no output will be shown.
pub(crate) async fn exec(cmd: &mut Command, quiet: bool) -> Result<()> {
    debug!("Running: {}", pretty_command(cmd));
    if quiet {
        // For quiet levels of logging we capture stdout and stderr
        let output = cmd
            .output()
            .await
            .context(format!("Unable to start '{}'", pretty_command(cmd)))?;
        ensure!(
            output.status.success(),
            "Command was unsuccessful, exit code {}: {}\n{}\n{}",
            output.status.code().unwrap_or(1),
            pretty_command(cmd),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    } else {
        // For less quiet log levels we stream to stdout and stderr.
        let status = cmd
            .status()
            .await
            .context(format!("Unable to start '{}'", pretty_command(cmd)))?;
        ensure!(
            status.success(),
            "Command was unsuccessful, exit code {}: {}",
            status.code().unwrap_or(1),
            pretty_command(cmd),
        );
    }
    Ok(())
}

/// Run a command as one step of a package operation. The command line is appended to
/// `log_file` along with everything the command prints. With `dry_run` the command is only
/// announced, never started.
pub(crate) async fn run_step(
    cmd: &mut Command,
    log_file: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let pretty = pretty_command(cmd);
    if dry_run {
        info!("[dry-run] {}", pretty);
        return Ok(());
    }

    let log_file = match log_file {
        Some(path) => path,
        None => return exec_log(cmd).await,
    };

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Unable to create log dir '{}'", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .context(format!("Unable to open log file '{}'", log_file.display()))?;
    writeln!(file, "\n$ {}", pretty)?;

    let stdout = file
        .try_clone()
        .context("Unable to duplicate log file handle")?;
    let stderr = file
        .try_clone()
        .context("Unable to duplicate log file handle")?;
    let status = cmd
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .await
        .context(format!("Unable to start '{}'", pretty))?;
    ensure!(
        status.success(),
        "Command was unsuccessful, exit code {}: {} (see the log at '{}')",
        status.code().unwrap_or(1),
        pretty,
        log_file.display(),
    );
    Ok(())
}

/// Fail early when a required external tool is not on the `PATH`.
pub(crate) fn require_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|t| which::which(t).is_err())
        .collect();
    ensure!(
        missing.is_empty(),
        "Missing required tools on PATH: {}",
        missing.join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pretty_command_renders_program_and_args() {
        let mut cmd = Command::new("tar");
        cmd.args(["-xpf", "-", "--no-same-owner"]);
        assert_eq!(pretty_command(&cmd), "tar -xpf - --no-same-owner");
    }

    #[tokio::test]
    async fn run_step_dry_run_does_not_execute() {
        // A nonexistent program would fail to start if it were actually run.
        let mut cmd = Command::new("definitely-not-a-real-program");
        run_step(&mut cmd, None, true).await.unwrap();
    }
}
