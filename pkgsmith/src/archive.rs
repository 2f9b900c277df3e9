//! Tar handling: hardened extraction of upstream source tarballs, and the zstd-compressed
//! binary artifact format.
//!
//! Source tarballs come from the network, so every member is vetted before anything is
//! written: names must stay inside the extraction root after stripping any leading `/`, and
//! link members must not point at absolute targets, contain `..`, or resolve outside the
//! root relative to the link's parent directory. A single bad member aborts the whole
//! extraction.
//!
//! Binary artifacts are our own tar streams compressed with zstd. Restoring one never
//! preserves ownership, and only preserves permissions when asked to.

use anyhow::{ensure, Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Extract a source tarball into `workdir` and return the source root: the single
/// top-level directory when the archive has one, otherwise a fresh `src/` subdirectory
/// holding all entries.
pub(crate) fn extract_tarball(tar_path: &Path, workdir: &Path) -> Result<PathBuf> {
    // Vet every member before writing anything.
    let mut archive = open_archive(tar_path)?;
    for entry in archive
        .entries()
        .context(format!("Unable to read archive '{}'", tar_path.display()))?
    {
        let entry = entry.context(format!(
            "Unable to read archive member in '{}'",
            tar_path.display()
        ))?;
        check_member_safety(&entry, workdir)?;
    }

    fs::create_dir_all(workdir).context(format!(
        "Unable to create extraction dir '{}'",
        workdir.display()
    ))?;
    let mut archive = open_archive(tar_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);
    archive.unpack(workdir).context(format!(
        "Unable to extract '{}' into '{}'",
        tar_path.display(),
        workdir.display()
    ))?;

    source_root(workdir)
}

fn check_member_safety<R: Read>(entry: &tar::Entry<'_, R>, root: &Path) -> Result<()> {
    let raw = entry.path().context("Archive member has an unusable name")?;
    let name = raw
        .strip_prefix("/")
        .unwrap_or(&raw)
        .to_path_buf();
    let display = raw.display().to_string();

    ensure!(
        !name.components().any(|c| c == Component::ParentDir),
        "Unsafe tar member (name contains '..'): {display}"
    );
    let dest = lexical_join(root, &name);
    ensure!(
        dest.starts_with(root),
        "Unsafe tar member (escapes extraction root): {display}"
    );

    let entry_type = entry.header().entry_type();
    if entry_type.is_symlink() || entry_type.is_hard_link() {
        let target = entry
            .link_name()
            .context("Link member has an unusable target")?
            .context(format!("Link member has no target: {display}"))?
            .to_path_buf();
        let target_display = target.display().to_string();
        ensure!(
            !target.is_absolute(),
            "Unsafe link member (absolute target): {display} -> {target_display}"
        );
        ensure!(
            !target.components().any(|c| c == Component::ParentDir),
            "Unsafe link member (target contains '..'): {display} -> {target_display}"
        );
        // Resolve from the link's parent directory and require the result to stay inside.
        let parent = dest.parent().unwrap_or(root).to_path_buf();
        let resolved = lexical_join(&parent, &target);
        ensure!(
            resolved.starts_with(root),
            "Unsafe link member (target outside extraction root): {display} -> {target_display}"
        );
    }
    Ok(())
}

/// Join without touching the filesystem, collapsing `.` and `..` components.
fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Decide where the extracted source actually starts.
fn source_root(workdir: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(workdir)
        .context(format!("Unable to list '{}'", workdir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    if entries.len() == 1 && entries[0].is_dir() {
        return Ok(entries[0].clone());
    }
    let gathered = workdir.join("src");
    fs::create_dir(&gathered).context(format!(
        "Unable to create source dir '{}'",
        gathered.display()
    ))?;
    for path in entries {
        let file_name = path
            .file_name()
            .context("Extracted entry has no file name")?;
        fs::rename(&path, gathered.join(file_name)).context(format!(
            "Unable to move '{}' into '{}'",
            path.display(),
            gathered.display()
        ))?;
    }
    Ok(gathered)
}

/// Open a tarball for reading, sniffing gzip / xz / zstd compression from magic bytes.
fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut file =
        File::open(path).context(format!("Unable to open archive '{}'", path.display()))?;
    let mut magic = [0u8; 6];
    let n = file.read(&mut magic).unwrap_or(0);
    file.seek(SeekFrom::Start(0))
        .context("Unable to rewind archive")?;
    let reader = BufReader::new(file);

    let decoder: Box<dyn Read> = if n >= 2 && magic[..2] == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(reader))
    } else if n >= 4 && magic[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        Box::new(zstd::stream::Decoder::new(reader)?)
    } else if n >= 6 && magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(tar::Archive::new(decoder))
}

/// Archive the contents of `src_dir` (a DESTDIR) into a zstd-compressed tar at `out_path`.
/// The entry order is a sorted walk so the artifact bytes are reproducible; symlinks are
/// stored as symlinks. The output appears atomically via a sibling temp file.
pub(crate) fn pack_tar_zst(src_dir: &Path, out_path: &Path, jobs: usize) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .context(format!("Unable to create '{}'", parent.display()))?;
    }
    let file_name = out_path
        .file_name()
        .context("Artifact path has no file name")?
        .to_string_lossy();
    let tmp = out_path.with_file_name(format!(".{file_name}.tmp"));

    let file =
        File::create(&tmp).context(format!("Unable to create '{}'", tmp.display()))?;
    let mut encoder = zstd::stream::Encoder::new(file, 3)
        .context("Unable to initialize zstd compression")?;
    encoder
        .multithread(jobs as u32)
        .context("Unable to enable multithreaded zstd compression")?;

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    for entry in WalkDir::new(src_dir).follow_links(false).sort_by_file_name() {
        let entry =
            entry.context(format!("Unable to walk '{}'", src_dir.display()))?;
        let path = entry.path();
        if path == src_dir {
            continue;
        }
        let rel = path
            .strip_prefix(src_dir)
            .context("Walked path escaped the archive root")?;
        builder
            .append_path_with_name(path, rel)
            .context(format!("Unable to archive '{}'", path.display()))?;
    }
    let encoder = builder
        .into_inner()
        .context("Unable to finish writing the archive")?;
    encoder
        .finish()
        .context("Unable to finish zstd compression")?;

    fs::rename(&tmp, out_path).context(format!(
        "Unable to move artifact into place at '{}'",
        out_path.display()
    ))?;
    Ok(())
}

/// Restore a binary artifact into `out_dir`. Ownership is never preserved; permissions
/// only when `keep_perms` is set.
pub(crate) fn unpack_tar_zst(artifact: &Path, out_dir: &Path, keep_perms: bool) -> Result<()> {
    fs::create_dir_all(out_dir)
        .context(format!("Unable to create '{}'", out_dir.display()))?;
    let file = File::open(artifact)
        .context(format!("Unable to open artifact '{}'", artifact.display()))?;
    let decoder = zstd::stream::Decoder::new(BufReader::new(file))
        .context("Unable to initialize zstd decompression")?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(keep_perms);
    archive.set_preserve_ownerships(false);
    archive.unpack(out_dir).context(format!(
        "Unable to extract artifact '{}' into '{}'",
        artifact.display(),
        out_dir.display()
    ))?;
    Ok(())
}
