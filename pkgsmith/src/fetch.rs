//! Source retrieval: HTTPS tarballs validated against their recipe hash, and git checkouts
//! pinned through the lockfile. Both land in the store's source caches; the build runner
//! asks for a ready-to-build source directory inside its workdir.

use crate::archive;
use crate::common::{require_tools, run_step};
use crate::config::Config;
use crate::lockfile::{Lockfile, PinnedSource};
use crate::manifest::sha256_file;
use crate::recipe::{GitRef, GitReference, PackageMeta, SourceInfo};
use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Produce a source directory for `meta` inside `workdir`, downloading or checking out
/// into the store caches as needed.
pub(crate) async fn fetch_source(
    config: &Config,
    meta: &PackageMeta,
    workdir: &Path,
) -> Result<PathBuf> {
    match &meta.source {
        SourceInfo::Tar { url, sha256 } => {
            let tarball = download_tarball(config, meta, url, sha256).await?;
            if config.dry_run {
                return Ok(workdir.join("src"));
            }
            archive::extract_tarball(&tarball, workdir)
        }
        SourceInfo::Git(git) => {
            let checkout = checkout_git(config, meta, git).await?;
            let src_dir = workdir.join("src");
            if config.dry_run {
                return Ok(src_dir);
            }
            copy_checkout(&checkout, &src_dir)?;
            Ok(src_dir)
        }
    }
}

/// Download a tarball into the source cache, reusing a cached copy whose hash still
/// matches. Partial or corrupt downloads never survive: content is fetched to a dot-tmp
/// sibling, verified, and only then renamed into place.
pub(crate) async fn download_tarball(
    config: &Config,
    meta: &PackageMeta,
    url: &str,
    sha256: &str,
) -> Result<PathBuf> {
    config.ensure_dirs()?;
    let file_name = tarball_file_name(url);
    let cache_path = config
        .src_cache()
        .join(format!("{}-{}", meta.id(), file_name));

    if cache_path.is_file() {
        if sha256_file(&cache_path)?.eq_ignore_ascii_case(sha256) {
            info!("Source cached: '{}'", cache_path.display());
            return Ok(cache_path);
        }
        warn!(
            "Cached source has a stale hash, fetching again: '{}'",
            cache_path.display()
        );
        if !config.dry_run {
            fs::remove_file(&cache_path).context(format!(
                "Unable to remove stale source '{}'",
                cache_path.display()
            ))?;
        }
    }

    if config.dry_run {
        info!("[dry-run] download {} -> {}", url, cache_path.display());
        return Ok(cache_path);
    }

    info!("Downloading: {url}");
    let tmp = cache_path.with_file_name(format!(".{}", file_name));
    if let Err(err) = fetch_to_file(url, &tmp).await {
        let _ = fs::remove_file(&tmp);
        return Err(err.context(format!("Download failed: {url}")));
    }

    let got = sha256_file(&tmp)?;
    if !got.eq_ignore_ascii_case(sha256) {
        let _ = fs::remove_file(&tmp);
        bail!(
            "Checksum mismatch for '{}': expected sha256 {}, got {}",
            meta.full_name(),
            sha256,
            got
        );
    }
    fs::rename(&tmp, &cache_path).context(format!(
        "Unable to move download into place at '{}'",
        cache_path.display()
    ))?;
    Ok(cache_path)
}

async fn fetch_to_file(url: &str, path: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("Unable to build the HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .await
        .context("Request failed")?
        .error_for_status()
        .context("Server returned an error")?;

    let mut file =
        File::create(path).context(format!("Unable to create '{}'", path.display()))?;
    while let Some(chunk) = response.chunk().await.context("Transfer interrupted")? {
        file.write_all(&chunk)
            .context(format!("Unable to write '{}'", path.display()))?;
    }
    Ok(())
}

/// The cache file name for a tarball URL: its final path segment with any query stripped.
fn tarball_file_name(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    let name = without_query.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "source.tar".to_string()
    } else {
        name.to_string()
    }
}

/// Clone or update a git checkout in the VCS cache and put it on the requested ref. When
/// the lockfile pins this package to a commit of the same repo, the pin wins; otherwise
/// the resulting HEAD commit is recorded as the new pin.
pub(crate) async fn checkout_git(
    config: &Config,
    meta: &PackageMeta,
    git: &GitRef,
) -> Result<PathBuf> {
    require_tools(&["git"])?;
    config.ensure_dirs()?;
    let repo_dir = config
        .vcs_cache()
        .join(format!("{}-{}", meta.id(), git.reference.label()));

    if config.dry_run {
        info!(
            "[dry-run] git checkout {} ({}) -> {}",
            git.repo,
            git.reference.resolved(),
            repo_dir.display()
        );
        return Ok(repo_dir);
    }

    if repo_dir.is_dir() {
        info!("Updating cached repo: '{}'", repo_dir.display());
        run_step(
            Command::new("git")
                .args(["fetch", "--all", "--tags"])
                .current_dir(&repo_dir),
            None,
            false,
        )
        .await?;
    } else {
        info!("Cloning: {} -> {}", git.repo, repo_dir.display());
        let mut cmd = Command::new("git");
        cmd.arg("clone");
        match &git.reference {
            GitReference::Tag(name) | GitReference::Branch(name) => {
                if git.shallow {
                    cmd.args(["--depth", "1"]);
                }
                cmd.args(["--branch", name]);
            }
            GitReference::Commit(_) | GitReference::Head => {}
        }
        cmd.arg(&git.repo).arg(&repo_dir);
        run_step(&mut cmd, None, false).await?;
    }

    let lockfile_path = config.lockfile_path();
    let mut lockfile = Lockfile::load(&lockfile_path);
    let pinned_commit = lockfile
        .get(&meta.full_name())
        .filter(|pin| pin.repo == git.repo)
        .map(|pin| pin.commit.clone());

    if let Some(commit) = &pinned_commit {
        info!(
            "Using lockfile commit for '{}': {commit}",
            meta.full_name()
        );
        git_in(&repo_dir, &["checkout", "--detach", commit.as_str()]).await?;
    } else {
        match &git.reference {
            GitReference::Commit(commit) => {
                git_in(&repo_dir, &["checkout", "--detach", commit.as_str()]).await?;
            }
            GitReference::Tag(tag) => {
                git_in(&repo_dir, &["checkout", "--detach", tag.as_str()]).await?;
            }
            GitReference::Branch(branch) => {
                git_in(&repo_dir, &["checkout", branch.as_str()]).await?;
                git_in(&repo_dir, &["pull", "--ff-only"]).await?;
            }
            GitReference::Head => {
                git_in(&repo_dir, &["checkout", "--detach"]).await?;
            }
        }
    }

    // Record the commit we actually ended up on, so the next run reproduces it.
    let head = git_head(&repo_dir).await?;
    lockfile.pin(
        &meta.full_name(),
        PinnedSource {
            repo: git.repo.clone(),
            commit: head,
            reference: git.reference.resolved(),
        },
    );
    if let Err(err) = lockfile.save(&lockfile_path) {
        warn!("Unable to update the lockfile: {err:#}");
    }

    if git.submodules {
        git_in(&repo_dir, &["submodule", "update", "--init", "--recursive"]).await?;
    }

    Ok(repo_dir)
}

async fn git_in(repo_dir: &Path, args: &[&str]) -> Result<()> {
    run_step(
        Command::new("git").args(args).current_dir(repo_dir),
        None,
        false,
    )
    .await
}

async fn git_head(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .await
        .context("Unable to run git rev-parse")?;
    ensure!(
        output.status.success(),
        "git rev-parse failed in '{}'",
        repo_dir.display()
    );
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Copy a cached checkout into the build workdir, leaving the top-level `.git` behind so
/// builds cannot dirty the cache or mistake themselves for a repo.
fn copy_checkout(checkout: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(checkout).follow_links(false) {
        let entry = entry.context(format!("Unable to walk '{}'", checkout.display()))?;
        let rel = entry
            .path()
            .strip_prefix(checkout)
            .context("Walked path escaped the checkout")?;
        if rel.as_os_str().is_empty() {
            fs::create_dir_all(dst)?;
            continue;
        }
        if rel.components().next().map_or(false, |c| c.as_os_str() == ".git") {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .context(format!("Unable to create '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)
                .context(format!("Unable to link '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .context(format!("Unable to copy to '{}'", target.display()))?;
        }
    }
    Ok(())
}
