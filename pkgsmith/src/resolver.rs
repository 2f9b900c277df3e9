//! Dependency resolution: load a package and everything it transitively depends on, then
//! order the set so dependencies come before dependents. Cycles and missing recipes are
//! fatal. There is no version solving here; a dependency names exactly one recipe.

use crate::recipe::{self, PackageMeta};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) metas: BTreeMap<String, (PackageMeta, PathBuf)>,
    /// Dependency order: every package appears after all of its dependencies.
    pub(crate) order: Vec<String>,
}

/// Load `root` and its transitive dependencies from the recipe tree and topologically
/// order them.
pub(crate) fn resolve(tree: &Path, root: &str) -> Result<Resolution> {
    let mut metas = BTreeMap::new();
    load_recursive(tree, root, &mut metas)?;

    let graph = metas
        .iter()
        .map(|(name, (meta, _))| (name.clone(), meta.depends.clone()))
        .collect();
    let order = topo_sort(&graph)?;
    Ok(Resolution { metas, order })
}

fn load_recursive(
    tree: &Path,
    full_name: &str,
    metas: &mut BTreeMap<String, (PackageMeta, PathBuf)>,
) -> Result<()> {
    if metas.contains_key(full_name) {
        return Ok(());
    }
    let (meta, recipe_dir) = recipe::load_package_meta(tree, full_name)
        .context(format!("While resolving dependencies of '{full_name}'"))?;
    let depends = meta.depends.clone();
    metas.insert(full_name.to_string(), (meta, recipe_dir));
    for dep in depends {
        load_recursive(tree, &dep, metas)?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first topological sort with cycle detection. Only names present in `graph` appear
/// in the result; edges to absent names are ignored (callers operating on a subset of the
/// installed set rely on this).
pub(crate) fn topo_sort(graph: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut order = Vec::with_capacity(graph.len());
    for name in graph.keys() {
        visit(name, graph, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    name: &'a str,
    graph: &'a BTreeMap<String, Vec<String>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => bail!("Dependency cycle detected at '{name}'"),
        None => {}
    }
    let Some(depends) = graph.get(name) else {
        return Ok(());
    };
    marks.insert(name, Mark::Visiting);
    for dep in depends {
        visit(dep, graph, marks, order)?;
    }
    marks.insert(name, Mark::Done);
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_recipe(tree: &Path, full_name: &str, depends: &[&str]) {
        let (category, name) = full_name.split_once('/').unwrap();
        let dir = tree.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        let depends_yaml = if depends.is_empty() {
            String::new()
        } else {
            format!("depends: [{}]\n", depends.join(", "))
        };
        fs::write(
            dir.join("package.yml"),
            format!(
                "category: {category}\nname: {name}\nversion: \"1.0\"\n\
                 source: {{url: \"https://example.com/{name}.tar.gz\", sha256: ffff}}\n\
                 build: {{system: make}}\n{depends_yaml}"
            ),
        )
        .unwrap();
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let temp = TempDir::new().unwrap();
        write_recipe(temp.path(), "app/foo", &["lib/zeta", "lib/eta"]);
        write_recipe(temp.path(), "lib/zeta", &["lib/eta"]);
        write_recipe(temp.path(), "lib/eta", &[]);

        let resolution = resolve(temp.path(), "app/foo").unwrap();
        assert_eq!(resolution.metas.len(), 3);
        let position = |name: &str| {
            resolution
                .order
                .iter()
                .position(|n| n == name)
                .unwrap()
        };
        assert!(position("lib/eta") < position("lib/zeta"));
        assert!(position("lib/zeta") < position("app/foo"));
        assert_eq!(resolution.order.len(), 3);
    }

    #[test]
    fn cycles_are_fatal() {
        let temp = TempDir::new().unwrap();
        write_recipe(temp.path(), "lib/a", &["lib/b"]);
        write_recipe(temp.path(), "lib/b", &["lib/a"]);

        let err = resolve(temp.path(), "lib/a").unwrap_err();
        assert!(err.to_string().contains("Dependency cycle"));
    }

    #[test]
    fn missing_transitive_recipe_is_fatal() {
        let temp = TempDir::new().unwrap();
        write_recipe(temp.path(), "app/foo", &["lib/ghost"]);

        let err = resolve(temp.path(), "app/foo").unwrap_err();
        assert!(format!("{err:#}").contains("Recipe not found"));
    }

    #[test]
    fn edges_to_absent_nodes_are_ignored() {
        let graph: BTreeMap<String, Vec<String>> = [
            ("app/foo".to_string(), vec!["lib/unmanaged".to_string()]),
        ]
        .into();
        let order = topo_sort(&graph).unwrap();
        assert_eq!(order, vec!["app/foo"]);
    }
}
