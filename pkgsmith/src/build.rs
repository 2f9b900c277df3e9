//! The build runner: drive one package from source to a binary artifact. Fetch, extract,
//! patch, run the recipe's build backend against a DESTDIR, then record a manifest and
//! pack the result into the binary cache. The per-package lock is held for the whole
//! operation, and a previously built `(id, version)` artifact short-circuits everything.

use crate::archive;
use crate::common::{require_tools, run_step};
use crate::config::Config;
use crate::fetch;
use crate::locks::LockFile;
use crate::manifest::Manifest;
use crate::recipe::{BuildSystem, PackageMeta};
use anyhow::{ensure, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Build `meta` if its versioned artifact is not already cached, returning the artifact
/// path and its manifest. The unversioned "latest" symlink is refreshed either way.
pub(crate) async fn build_package(
    config: &Config,
    meta: &PackageMeta,
    recipe_dir: &Path,
) -> Result<(PathBuf, Manifest)> {
    config.ensure_dirs()?;
    let id = meta.id();
    let log_file = config.build_log(&id);
    let _build_lock = LockFile::acquire(&config.build_lock_path(&id))?;

    let (artifact, manifest_path, latest) = config.artifact_paths(&id, &meta.version);

    if artifact.is_file() && manifest_path.is_file() && !config.dry_run {
        info!("Artifact cached: '{}'", artifact.display());
        let manifest = Manifest::load(&manifest_path).unwrap_or_else(|err| {
            warn!("Ignoring unreadable cached manifest: {err:#}");
            Manifest::default()
        });
        refresh_latest_symlink(&artifact, &latest);
        return Ok((artifact, manifest));
    }

    let workdir = config.build_root().join(&id);
    let destdir = workdir.join("dest");
    if !config.dry_run {
        if workdir.exists() {
            fs::remove_dir_all(&workdir).context(format!(
                "Unable to clear the build workdir '{}'",
                workdir.display()
            ))?;
        }
        fs::create_dir_all(&destdir)
            .context(format!("Unable to create '{}'", destdir.display()))?;
    }

    let src_dir = fetch::fetch_source(config, meta, &workdir).await?;
    apply_patches(config, &src_dir, recipe_dir, &log_file).await?;

    let env = base_env(config, &destdir);
    info!("Building {} ({})", meta.full_name(), meta.build.system);
    run_backend(config, meta, &src_dir, &destdir, &env, &log_file).await?;

    let manifest = if config.dry_run {
        Manifest::default()
    } else {
        Manifest::from_destdir(&destdir)?
    };
    if !config.dry_run {
        ensure!(
            !manifest.is_empty(),
            "Build of '{}' left nothing in DESTDIR (see the log at '{}')",
            meta.full_name(),
            log_file.display()
        );
    }

    info!("Packaging: '{}'", artifact.display());
    if !config.dry_run {
        archive::pack_tar_zst(&destdir, &artifact, config.jobs)?;
        write_manifest(&manifest, &manifest_path)?;
        refresh_latest_symlink(&artifact, &latest);
    }
    Ok((artifact, manifest))
}

fn write_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let json =
        serde_json::to_string_pretty(manifest).context("Unable to serialize the manifest")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).context(format!("Unable to write '{}'", tmp.display()))?;
    fs::rename(&tmp, path).context(format!(
        "Unable to move the manifest into place at '{}'",
        path.display()
    ))?;
    Ok(())
}

fn refresh_latest_symlink(artifact: &Path, latest: &Path) {
    let Some(name) = artifact.file_name() else {
        return;
    };
    let _ = fs::remove_file(latest);
    let _ = std::os::unix::fs::symlink(name, latest);
}

async fn apply_patches(
    config: &Config,
    src_dir: &Path,
    recipe_dir: &Path,
    log_file: &Path,
) -> Result<()> {
    let patches_dir = recipe_dir.join("patches");
    if !patches_dir.is_dir() {
        return Ok(());
    }
    require_tools(&["patch"])?;
    let mut patches: Vec<PathBuf> = fs::read_dir(&patches_dir)
        .context(format!("Unable to list '{}'", patches_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "patch"))
        .collect();
    patches.sort();

    for patch in patches {
        info!(
            "Applying patch: {}",
            patch.file_name().unwrap_or_default().to_string_lossy()
        );
        run_step(
            Command::new("patch")
                .args(["-p1", "-i"])
                .arg(&patch)
                .current_dir(src_dir),
            Some(log_file),
            config.dry_run,
        )
        .await?;
    }
    Ok(())
}

fn base_env(config: &Config, destdir: &Path) -> Vec<(String, String)> {
    let prefix = config.prefix.display().to_string();
    let mut env = vec![
        ("PREFIX".to_string(), prefix.clone()),
        ("DESTDIR".to_string(), destdir.display().to_string()),
        ("MAKEFLAGS".to_string(), format!("-j{}", config.jobs)),
    ];
    if std::env::var_os("PKG_CONFIG_PATH").is_none() {
        env.push((
            "PKG_CONFIG_PATH".to_string(),
            format!("{prefix}/lib/pkgconfig:{prefix}/share/pkgconfig"),
        ));
    }
    env
}

fn step(program: &str, cwd: &Path, env: &[(String, String)]) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(cwd);
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd
}

/// The DESTDIR-relative location the prefix maps to (e.g. `dest/usr/local`).
fn dest_prefix(config: &Config, destdir: &Path) -> PathBuf {
    destdir.join(
        config
            .prefix
            .display()
            .to_string()
            .trim_start_matches('/'),
    )
}

async fn run_backend(
    config: &Config,
    meta: &PackageMeta,
    src_dir: &Path,
    destdir: &Path,
    env: &[(String, String)],
    log_file: &Path,
) -> Result<()> {
    let build = &meta.build;
    let log = Some(log_file);
    let jobs = config.jobs.to_string();

    match build.system {
        BuildSystem::Autotools => {
            if !config.dry_run && !src_dir.join("configure").is_file() {
                ensure!(
                    src_dir.join("configure.ac").is_file()
                        || src_dir.join("configure.in").is_file(),
                    "autotools: no configure script and nothing to generate one from"
                );
                require_tools(&["autoreconf"])?;
                run_step(
                    step("autoreconf", src_dir, env).arg("-fi"),
                    log,
                    false,
                )
                .await?;
            }
            run_step(
                step("./configure", src_dir, env)
                    .arg(format!("--prefix={}", config.prefix.display()))
                    .args(&build.configure_flags),
                log,
                config.dry_run,
            )
            .await?;
            run_step(
                step("make", src_dir, env)
                    .arg(format!("-j{jobs}"))
                    .args(&build.make_flags),
                log,
                config.dry_run,
            )
            .await?;
            run_step(
                step("make", src_dir, env)
                    .arg("install")
                    .arg(format!("DESTDIR={}", destdir.display()))
                    .args(&build.make_flags),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Cmake => {
            require_tools(&["cmake"])?;
            let build_dir = src_dir.join("build");
            if !config.dry_run {
                fs::create_dir_all(&build_dir)
                    .context(format!("Unable to create '{}'", build_dir.display()))?;
            }
            let mut configure = step("cmake", src_dir, env);
            configure
                .arg("-S")
                .arg(src_dir)
                .arg("-B")
                .arg(&build_dir)
                .arg(format!(
                    "-DCMAKE_INSTALL_PREFIX={}",
                    config.prefix.display()
                ));
            if let Some(generator) = &config.cmake_generator {
                configure.args(["-G", generator]);
            }
            configure.args(&build.cmake_flags);
            run_step(&mut configure, log, config.dry_run).await?;
            run_step(
                step("cmake", src_dir, env)
                    .arg("--build")
                    .arg(&build_dir)
                    .args(["--parallel", &jobs]),
                log,
                config.dry_run,
            )
            .await?;
            // DESTDIR is honored from the environment.
            run_step(
                step("cmake", src_dir, env).arg("--install").arg(&build_dir),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Make => {
            require_tools(&["make"])?;
            run_step(
                step("make", src_dir, env)
                    .arg(format!("-j{jobs}"))
                    .args(&build.make_flags),
                log,
                config.dry_run,
            )
            .await?;
            run_step(
                step("make", src_dir, env)
                    .arg("install")
                    .arg(format!("DESTDIR={}", destdir.display()))
                    .arg(format!("PREFIX={}", config.prefix.display()))
                    .args(&build.make_flags),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Meson => {
            require_tools(&["meson", "ninja"])?;
            let build_dir = src_dir.join("build");
            if !config.dry_run {
                fs::create_dir_all(&build_dir)
                    .context(format!("Unable to create '{}'", build_dir.display()))?;
            }
            run_step(
                step("meson", src_dir, env)
                    .arg("setup")
                    .arg(&build_dir)
                    .arg(src_dir)
                    .arg(format!("--prefix={}", config.prefix.display()))
                    .args(&build.meson_flags),
                log,
                config.dry_run,
            )
            .await?;
            run_step(
                step("ninja", src_dir, env)
                    .arg("-C")
                    .arg(&build_dir)
                    .arg(format!("-j{jobs}")),
                log,
                config.dry_run,
            )
            .await?;
            run_step(
                step("ninja", src_dir, env)
                    .arg("-C")
                    .arg(&build_dir)
                    .arg("install"),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Cargo => {
            require_tools(&["cargo"])?;
            run_step(
                step("cargo", src_dir, env)
                    .args(["install", "--path", "."])
                    .arg("--root")
                    .arg(dest_prefix(config, destdir))
                    .args(&build.cargo_flags),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Go => {
            require_tools(&["go"])?;
            let out_dir = dest_prefix(config, destdir).join("bin");
            if !config.dry_run {
                fs::create_dir_all(&out_dir)
                    .context(format!("Unable to create '{}'", out_dir.display()))?;
            }
            // The binary is named after the source root; the first flag names the
            // package to build, the rest pass through.
            let binary = src_dir
                .file_name()
                .context("Source dir has no name")?
                .to_os_string();
            let target = build.go_flags.first().map(String::as_str).unwrap_or(".");
            let extra = build.go_flags.get(1..).unwrap_or_default();
            run_step(
                step("go", src_dir, env)
                    .arg("build")
                    .arg("-o")
                    .arg(out_dir.join(binary))
                    .args(extra)
                    .arg(target),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Python => {
            require_tools(&["python3"])?;
            run_step(
                step("python3", src_dir, env)
                    .args(["-m", "pip", "install", ".", "--no-deps"])
                    .arg(format!("--prefix={}", config.prefix.display()))
                    .arg(format!("--root={}", destdir.display()))
                    .args(&build.python_flags),
                log,
                config.dry_run,
            )
            .await
        }
        BuildSystem::Custom => {
            run_step(
                step("sh", src_dir, env).arg(&build.custom_script),
                log,
                config.dry_run,
            )
            .await
        }
    }
}
