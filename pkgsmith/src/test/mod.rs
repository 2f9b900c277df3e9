/*!

Re-usable test code. This module should only be compiled for `cfg(test)`, which is
accomplished at its declaration in `main.rs`.

!*/

use crate::config::Config;
use crate::manifest::sha256_file;
use std::fs;
use std::io::Write;

/// Write a recipe for a package whose (already cached) tarball carries a custom build
/// script installing a single binary named after the package. No network is ever touched:
/// the tarball sits in the source cache with a matching hash before the build starts.
pub(crate) fn seed_buildable(config: &Config, full_name: &str, version: &str, depends: &[&str]) {
    let (category, name) = full_name.split_once('/').unwrap();
    let id = format!("{category}-{name}-{version}");
    let script = format!(
        "#!/bin/sh\nmkdir -p \"$DESTDIR$PREFIX/bin\"\n\
         printf '{name} {version}' > \"$DESTDIR$PREFIX/bin/{name}\"\n"
    );

    let mut header = tar::Header::new_gnu();
    header
        .set_path(format!("{name}-{version}/build.sh"))
        .unwrap();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o755);
    header.set_size(script.len() as u64);
    header.set_cksum();
    let mut tar_bytes = Vec::new();
    tar_bytes.extend_from_slice(header.as_bytes());
    tar_bytes.extend_from_slice(script.as_bytes());
    let pad = (512 - script.len() % 512) % 512;
    tar_bytes.resize(tar_bytes.len() + pad + 1024, 0);

    config.ensure_dirs().unwrap();
    let cached = config
        .src_cache()
        .join(format!("{id}-{name}-{version}.tar"));
    let mut file = fs::File::create(&cached).unwrap();
    file.write_all(&tar_bytes).unwrap();
    let sha256 = sha256_file(&cached).unwrap();

    let depends_yaml = if depends.is_empty() {
        String::new()
    } else {
        format!("depends: [{}]\n", depends.join(", "))
    };
    let recipe_dir = config.tree.join(category).join(name);
    fs::create_dir_all(&recipe_dir).unwrap();
    fs::write(
        recipe_dir.join("package.yml"),
        format!(
            "category: {category}\nname: {name}\nversion: \"{version}\"\n\
             source:\n  url: https://unreachable.invalid/{name}-{version}.tar\n\
             \x20 sha256: {sha256}\nbuild:\n  system: custom\n{depends_yaml}"
        ),
    )
    .unwrap();
}
