#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Repository policy tests for the netplay client.
//!
//! These check that the manifest, demos, fuzz crate and library sources
//! still follow the project's rules. All checks are synchronous filesystem
//! reads.

use std::path::{Path, PathBuf};

fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn read_project_file(relative_path: &str) -> String {
    let path = project_root().join(relative_path);
    std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!(
            "Failed to read '{}': {}. This file is required by project policy.",
            path.display(),
            e
        )
    })
}

/// Values of every `path = "..."` line inside the given table headers.
fn table_paths(manifest: &str, header: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut inside = false;
    for line in manifest.lines().map(str::trim) {
        if line.starts_with('[') {
            inside = line == header;
            continue;
        }
        if inside {
            if let Some(rest) = line.strip_prefix("path = ") {
                paths.push(rest.trim_matches('"').to_owned());
            }
        }
    }
    paths
}

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_has_all_panic_free_lints() {
        let cargo = read_project_file("Cargo.toml");
        assert!(
            cargo.contains("[lints.clippy]"),
            "Cargo.toml is missing the [lints.clippy] section."
        );
        for lint in REQUIRED_DENY_LINTS {
            let pattern = format!("{lint} = \"deny\"");
            assert!(
                cargo.contains(&pattern),
                "Cargo.toml is missing `{pattern}` in [lints.clippy]. \
                 Library code must stay panic-free."
            );
        }
    }

    #[test]
    fn library_code_outside_tests_never_unwraps() {
        let mut files = Vec::new();
        rust_files(&project_root().join("src"), &mut files);
        assert!(!files.is_empty());

        for file in files {
            let source = std::fs::read_to_string(&file).unwrap();
            let library_part = source.split("#[cfg(test)]").next().unwrap_or_default();
            for (n, line) in library_part.lines().enumerate() {
                let code = line.trim_start();
                if code.starts_with("//") {
                    continue;
                }
                for banned in [".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("] {
                    assert!(
                        !code.contains(banned),
                        "{}:{} uses `{banned}` outside test code",
                        file.display(),
                        n + 1
                    );
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: manifest_policy
// ─────────────────────────────────────────────────────────────────────────────

mod manifest_policy {
    use super::*;

    #[test]
    fn msrv_is_declared() {
        let cargo = read_project_file("Cargo.toml");
        let msrv = cargo
            .lines()
            .find_map(|line| line.trim().strip_prefix("rust-version = "))
            .expect("Cargo.toml must declare rust-version");
        let msrv = msrv.trim_matches('"');
        assert!(
            read_project_file("README.md").contains(msrv),
            "README.md must state the MSRV ({msrv}) declared in Cargo.toml"
        );
    }

    #[test]
    fn every_demo_is_registered_and_exists() {
        let cargo = read_project_file("Cargo.toml");
        let registered = table_paths(&cargo, "[[example]]");
        assert!(!registered.is_empty(), "no demos registered in Cargo.toml");
        for path in &registered {
            assert!(
                project_root().join(path).is_file(),
                "demo '{path}' is registered but missing"
            );
        }

        let mut on_disk = Vec::new();
        rust_files(&project_root().join("demos"), &mut on_disk);
        for file in on_disk {
            let relative = file
                .strip_prefix(project_root())
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            assert!(
                registered.contains(&relative),
                "'{relative}' is not registered as an [[example]] in Cargo.toml"
            );
        }
    }

    #[test]
    fn websocket_transport_is_the_default_feature() {
        let cargo = read_project_file("Cargo.toml");
        assert!(cargo.contains("default = [\"transport-websocket\"]"));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: fuzz_policy
// ─────────────────────────────────────────────────────────────────────────────

mod fuzz_policy {
    use super::*;

    #[test]
    fn fuzz_crate_targets_this_library() {
        let fuzz = read_project_file("fuzz/Cargo.toml");
        assert!(fuzz.contains("[dependencies.netplay-client]"));
        assert!(fuzz.contains("path = \"..\""));
    }

    #[test]
    fn every_fuzz_target_exists() {
        let fuzz = read_project_file("fuzz/Cargo.toml");
        let targets = table_paths(&fuzz, "[[bin]]");
        assert!(!targets.is_empty(), "fuzz crate has no targets");
        for path in targets {
            assert!(
                project_root().join("fuzz").join(&path).is_file(),
                "fuzz target '{path}' is missing"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: source_policy
// ─────────────────────────────────────────────────────────────────────────────

mod source_policy {
    use super::*;

    const MAX_WIDTH: usize = 100;

    #[test]
    fn every_public_session_method_is_documented() {
        let source = read_project_file("src/session.rs");
        let library_part = source.split("#[cfg(test)]").next().unwrap_or_default();
        let lines: Vec<&str> = library_part.lines().collect();

        for (n, line) in lines.iter().enumerate() {
            if !(line.starts_with("    pub fn ") || line.starts_with("    pub async fn ")) {
                continue;
            }
            let doc = lines[..n]
                .iter()
                .rev()
                .map(|l| l.trim())
                .find(|l| !l.starts_with("#["))
                .unwrap_or_default();
            assert!(
                doc.starts_with("///"),
                "src/session.rs:{} `{}` has no doc comment",
                n + 1,
                line.trim()
            );
        }
    }

    #[test]
    fn code_lines_fit_rustfmt_width() {
        let mut files = Vec::new();
        rust_files(&project_root().join("src"), &mut files);

        for file in files {
            let source = std::fs::read_to_string(&file).unwrap();
            for (n, line) in source.lines().enumerate() {
                let code = line.trim_start();
                // rustfmt leaves comments and string literals alone.
                if code.starts_with("//") || line.contains('"') {
                    continue;
                }
                assert!(
                    line.chars().count() <= MAX_WIDTH,
                    "{}:{} is wider than {MAX_WIDTH} columns",
                    file.display(),
                    n + 1
                );
            }
        }
    }
}
