//! Recipe loading and validation. A recipe lives at `<tree>/<category>/<name>/package.yml`
//! and declares where the source comes from and how to build it. Everything is validated up
//! front so later stages can assume a well-formed [`PackageMeta`].

use anyhow::{bail, ensure, Context, Result};
use serde_yaml::Value;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PackageMeta {
    pub(crate) category: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) source: SourceInfo,
    pub(crate) build: BuildConfig,
    pub(crate) depends: Vec<String>,
}

impl PackageMeta {
    pub(crate) fn full_name(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Filesystem-safe identifier used for cache entries, workdirs, logs, and locks.
    pub(crate) fn id(&self) -> String {
        format!(
            "{}-{}-{}",
            sanitize(&self.category),
            sanitize(&self.name),
            sanitize(&self.version)
        )
    }
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SourceInfo {
    Tar { url: String, sha256: String },
    Git(GitRef),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GitRef {
    pub(crate) repo: String,
    pub(crate) reference: GitReference,
    pub(crate) submodules: bool,
    pub(crate) shallow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GitReference {
    Tag(String),
    Commit(String),
    Branch(String),
    Head,
}

impl GitReference {
    /// The full ref name recorded in the lockfile.
    pub(crate) fn resolved(&self) -> String {
        match self {
            GitReference::Commit(commit) => commit.clone(),
            GitReference::Tag(tag) => format!("refs/tags/{tag}"),
            GitReference::Branch(branch) => format!("refs/heads/{branch}"),
            GitReference::Head => "HEAD".to_string(),
        }
    }

    /// A short label that keys the checkout directory in the VCS cache.
    pub(crate) fn label(&self) -> String {
        match self {
            GitReference::Commit(commit) => {
                format!("commit-{}", &commit[..commit.len().min(12)])
            }
            GitReference::Tag(tag) => format!("tag-{tag}"),
            GitReference::Branch(branch) => format!("branch-{branch}"),
            GitReference::Head => "head".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildSystem {
    Autotools,
    Cmake,
    Make,
    Meson,
    Cargo,
    Go,
    Python,
    Custom,
}

impl FromStr for BuildSystem {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "autotools" => BuildSystem::Autotools,
            "cmake" => BuildSystem::Cmake,
            "make" => BuildSystem::Make,
            "meson" => BuildSystem::Meson,
            "cargo" => BuildSystem::Cargo,
            "go" => BuildSystem::Go,
            "python" => BuildSystem::Python,
            "custom" => BuildSystem::Custom,
            other => bail!("Unknown build system '{other}'"),
        })
    }
}

impl Display for BuildSystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildSystem::Autotools => "autotools",
            BuildSystem::Cmake => "cmake",
            BuildSystem::Make => "make",
            BuildSystem::Meson => "meson",
            BuildSystem::Cargo => "cargo",
            BuildSystem::Go => "go",
            BuildSystem::Python => "python",
            BuildSystem::Custom => "custom",
        };
        f.write_str(name)
    }
}

pub(crate) const DEFAULT_CUSTOM_SCRIPT: &str = "build.sh";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BuildConfig {
    pub(crate) system: BuildSystem,
    pub(crate) configure_flags: Vec<String>,
    pub(crate) make_flags: Vec<String>,
    pub(crate) cmake_flags: Vec<String>,
    pub(crate) meson_flags: Vec<String>,
    pub(crate) cargo_flags: Vec<String>,
    pub(crate) go_flags: Vec<String>,
    pub(crate) python_flags: Vec<String>,
    pub(crate) custom_script: String,
}

/// Split a `category/name` package reference, rejecting anything else.
pub(crate) fn split_full_name(full_name: &str) -> Result<(&str, &str)> {
    let mut parts = full_name.splitn(2, '/');
    let (category, name) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
    ensure!(
        !category.is_empty() && !name.is_empty() && !name.contains('/'),
        "Invalid package reference '{full_name}': expected 'category/name'"
    );
    Ok((category, name))
}

/// Load and validate a recipe, returning the metadata and the recipe directory (which also
/// holds `patches/` and any custom build script).
pub(crate) fn load_package_meta(tree: &Path, full_name: &str) -> Result<(PackageMeta, PathBuf)> {
    let (category, name) = split_full_name(full_name)?;
    let recipe_dir = tree.join(category).join(name);
    let recipe_path = recipe_dir.join("package.yml");
    ensure!(
        recipe_path.is_file(),
        "Recipe not found: '{}'",
        recipe_path.display()
    );

    let raw = std::fs::read_to_string(&recipe_path)
        .context(format!("Unable to read '{}'", recipe_path.display()))?;
    let value: Value = serde_yaml::from_str(&raw)
        .context(format!("Unable to parse '{}'", recipe_path.display()))?;
    let meta = parse_recipe(&value)
        .context(format!("Invalid recipe '{}'", recipe_path.display()))?;

    ensure!(
        meta.category == category && meta.name == name,
        "Recipe '{}' declares '{}' but lives at '{}'",
        recipe_path.display(),
        meta.full_name(),
        full_name
    );
    Ok((meta, recipe_dir))
}

fn parse_recipe(value: &Value) -> Result<PackageMeta> {
    let map = value
        .as_mapping()
        .context("Recipe must be a YAML mapping")?;
    for key in ["category", "name", "version", "source", "build"] {
        ensure!(map.get(key).is_some(), "Missing required field '{key}'");
    }

    let category = required_scalar(map, "category")?;
    let name = required_scalar(map, "name")?;
    let version = required_scalar(map, "version")?;
    let source = parse_source(map.get("source").unwrap()).context("Invalid 'source' field")?;
    let build = parse_build(map.get("build").unwrap()).context("Invalid 'build' field")?;

    let depends = match map.get("depends") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => scalar_list(value).context("'depends' must be a list of strings")?,
    };
    for dep in &depends {
        split_full_name(dep).context(format!("Invalid dependency '{dep}'"))?;
    }

    Ok(PackageMeta {
        category,
        name,
        version,
        source,
        build,
        depends,
    })
}

fn parse_source(value: &Value) -> Result<SourceInfo> {
    let map = value.as_mapping().context("'source' must be a mapping")?;

    let kind = match map.get("kind") {
        Some(value) => scalar(value)
            .context("'kind' must be a string")?
            .to_lowercase(),
        // Back-compat: a bare `{url, sha256}` mapping is a tarball source.
        None if map.get("url").is_some() => "tar".to_string(),
        None => bail!("Missing 'kind' (expected tar|git)"),
    };

    match kind.as_str() {
        "tar" | "archive" => {
            let url = map
                .get("url")
                .and_then(|v| scalar(v).ok())
                .filter(|s| !s.is_empty())
                .context("Tarball sources require 'url'")?;
            let sha256 = map
                .get("sha256")
                .and_then(|v| scalar(v).ok())
                .filter(|s| !s.is_empty())
                .context("Tarball sources require 'sha256'")?;
            Ok(SourceInfo::Tar { url, sha256 })
        }
        "git" | "vcs" => {
            let repo = map
                .get("repo")
                .or_else(|| map.get("url"))
                .and_then(|v| scalar(v).ok())
                .filter(|s| !s.is_empty())
                .context("Git sources require 'repo' (or 'url')")?;

            let mut references = Vec::new();
            if let Some(tag) = optional_scalar(map, "tag")? {
                references.push(GitReference::Tag(tag));
            }
            if let Some(commit) = optional_scalar(map, "commit")? {
                references.push(GitReference::Commit(commit));
            }
            if let Some(branch) = optional_scalar(map, "branch")? {
                references.push(GitReference::Branch(branch));
            }
            ensure!(
                references.len() <= 1,
                "Git sources take at most one of 'tag', 'commit', or 'branch'"
            );
            let reference = references.pop().unwrap_or(GitReference::Head);

            Ok(SourceInfo::Git(GitRef {
                repo,
                reference,
                submodules: bool_field(map, "submodules", false)?,
                shallow: bool_field(map, "shallow", true)?,
            }))
        }
        other => bail!("Invalid source kind '{other}' (expected tar|git)"),
    }
}

fn parse_build(value: &Value) -> Result<BuildConfig> {
    let map = value.as_mapping().context("'build' must be a mapping")?;
    let system = map
        .get("system")
        .and_then(|v| scalar(v).ok())
        .filter(|s| !s.is_empty())
        .context("Missing required field 'system'")?
        .to_lowercase()
        .parse()?;

    let flags = |key: &str| -> Result<Vec<String>> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => {
                scalar_list(value).context(format!("'{key}' must be a list of strings"))
            }
        }
    };

    let custom_script = optional_scalar(map, "custom_script")?
        .unwrap_or_else(|| DEFAULT_CUSTOM_SCRIPT.to_string());

    Ok(BuildConfig {
        system,
        configure_flags: flags("configure_flags")?,
        make_flags: flags("make_flags")?,
        cmake_flags: flags("cmake_flags")?,
        meson_flags: flags("meson_flags")?,
        cargo_flags: flags("cargo_flags")?,
        go_flags: flags("go_flags")?,
        python_flags: flags("python_flags")?,
        custom_script,
    })
}

fn required_scalar(map: &serde_yaml::Mapping, key: &str) -> Result<String> {
    let value = map.get(key).context(format!("Missing field '{key}'"))?;
    let value = scalar(value).context(format!("'{key}' must be a string"))?;
    ensure!(!value.is_empty(), "'{key}' must not be empty");
    Ok(value)
}

fn optional_scalar(map: &serde_yaml::Mapping, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let value = scalar(value).context(format!("'{key}' must be a string"))?;
            Ok(Some(value).filter(|s| !s.is_empty()))
        }
    }
}

fn bool_field(map: &serde_yaml::Mapping, key: &str, default: bool) -> Result<bool> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => bail!("'{key}' must be a boolean"),
    }
}

/// A YAML scalar rendered as a trimmed string; recipes may spell versions and flags as
/// numbers and still mean text.
fn scalar(value: &Value) -> Result<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => bail!("Expected a scalar value"),
    };
    Ok(text.trim().to_string())
}

/// Accept either a single scalar or a list of scalars.
fn scalar_list(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .map(scalar)
            .filter(|item| !matches!(item, Ok(s) if s.is_empty()))
            .collect(),
        other => Ok(vec![scalar(other)?]),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_recipe(tree: &Path, full_name: &str, body: &str) {
        let (category, name) = split_full_name(full_name).unwrap();
        let dir = tree.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.yml"), body).unwrap();
    }

    #[test]
    fn legacy_tar_source_is_accepted() {
        let temp = TempDir::new().unwrap();
        write_recipe(
            temp.path(),
            "lib/zeta",
            r#"
category: lib
name: zeta
version: "1.0"
source:
  url: https://example.com/zeta-1.0.tar.gz
  sha256: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
build:
  system: autotools
  configure_flags: --enable-shared
depends: lib/alpha
"#,
        );
        let (meta, dir) = load_package_meta(temp.path(), "lib/zeta").unwrap();
        assert_eq!(meta.full_name(), "lib/zeta");
        assert_eq!(meta.id(), "lib-zeta-1.0");
        assert!(matches!(meta.source, SourceInfo::Tar { .. }));
        assert_eq!(meta.build.system, BuildSystem::Autotools);
        assert_eq!(meta.build.configure_flags, vec!["--enable-shared"]);
        assert_eq!(meta.depends, vec!["lib/alpha"]);
        assert_eq!(dir, temp.path().join("lib/zeta"));
    }

    #[test]
    fn git_source_with_tag() {
        let temp = TempDir::new().unwrap();
        write_recipe(
            temp.path(),
            "app/foo",
            r#"
category: app
name: foo
version: 2.3
source:
  kind: git
  repo: https://example.com/foo.git
  tag: v2.3
  submodules: true
build:
  system: cargo
"#,
        );
        let (meta, _) = load_package_meta(temp.path(), "app/foo").unwrap();
        assert_eq!(meta.version, "2.3");
        match &meta.source {
            SourceInfo::Git(git) => {
                assert_eq!(git.reference, GitReference::Tag("v2.3".to_string()));
                assert_eq!(git.reference.resolved(), "refs/tags/v2.3");
                assert_eq!(git.reference.label(), "tag-v2.3");
                assert!(git.submodules);
                assert!(git.shallow);
            }
            other => panic!("expected a git source, got {other:?}"),
        }
        assert_eq!(meta.build.custom_script, DEFAULT_CUSTOM_SCRIPT);
    }

    #[test]
    fn conflicting_git_refs_are_rejected() {
        let temp = TempDir::new().unwrap();
        write_recipe(
            temp.path(),
            "app/foo",
            r#"
category: app
name: foo
version: "1"
source: {kind: git, repo: "https://example.com/foo.git", tag: v1, branch: main}
build: {system: make}
"#,
        );
        let err = load_package_meta(temp.path(), "app/foo").unwrap_err();
        assert!(format!("{err:#}").contains("at most one of"));
    }

    #[test]
    fn path_and_recipe_must_agree() {
        let temp = TempDir::new().unwrap();
        write_recipe(
            temp.path(),
            "lib/zeta",
            r#"
category: lib
name: other
version: "1.0"
source: {url: "https://example.com/x.tar.gz", sha256: ffff}
build: {system: make}
"#,
        );
        let err = load_package_meta(temp.path(), "lib/zeta").unwrap_err();
        assert!(err.to_string().contains("lives at"));
    }

    #[test]
    fn missing_fields_and_bad_names_are_fatal() {
        let temp = TempDir::new().unwrap();
        write_recipe(temp.path(), "lib/zeta", "category: lib\nname: zeta\n");
        let err = load_package_meta(temp.path(), "lib/zeta").unwrap_err();
        assert!(format!("{err:#}").contains("Missing required field"));

        assert!(split_full_name("no-slash").is_err());
        assert!(split_full_name("too/many/parts").is_err());
        assert!(split_full_name("/empty").is_err());
    }

    #[test]
    fn unknown_build_system_and_source_kind_are_fatal() {
        let temp = TempDir::new().unwrap();
        write_recipe(
            temp.path(),
            "lib/zeta",
            r#"
category: lib
name: zeta
version: "1.0"
source: {url: "https://example.com/x.tar.gz", sha256: ffff}
build: {system: scons}
"#,
        );
        let err = load_package_meta(temp.path(), "lib/zeta").unwrap_err();
        assert!(format!("{err:#}").contains("Unknown build system"));

        write_recipe(
            temp.path(),
            "lib/eta",
            r#"
category: lib
name: eta
version: "1.0"
source: {kind: svn, url: "svn://example.com/x"}
build: {system: make}
"#,
        );
        let err = load_package_meta(temp.path(), "lib/eta").unwrap_err();
        assert!(format!("{err:#}").contains("Invalid source kind"));
    }

    #[test]
    fn ids_are_path_safe() {
        let meta = PackageMeta {
            category: "x11 libs".to_string(),
            name: "gtk+".to_string(),
            version: "2.0/beta".to_string(),
            source: SourceInfo::Tar {
                url: "https://example.com/x.tar.gz".to_string(),
                sha256: "ffff".to_string(),
            },
            build: BuildConfig {
                system: BuildSystem::Make,
                configure_flags: vec![],
                make_flags: vec![],
                cmake_flags: vec![],
                meson_flags: vec![],
                cargo_flags: vec![],
                go_flags: vec![],
                python_flags: vec![],
                custom_script: DEFAULT_CUSTOM_SCRIPT.to_string(),
            },
            depends: vec![],
        };
        assert_eq!(meta.id(), "x11_libs-gtk_-2.0_beta");
    }
}
