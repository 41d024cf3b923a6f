//! Build-metadata input types
//!
//! The shape of the workspace/package/target payload the symbol source hands
//! us. The payload is already filtered to the caller's own packages; we only
//! map cargo's raw target-kind strings onto the three kinds the test model
//! cares about.

use std::path::PathBuf;

use serde::Deserialize;

/// One cargo workspace, with its member packages.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceMetadata {
    pub workspace_root: PathBuf,
    pub packages: Vec<PackageMetadata>,
}

/// A member package and its declared build targets.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub manifest_path: PathBuf,
    pub targets: Vec<TargetMetadata>,
}

/// A declared target as reported by the build tool.
///
/// `kind` is cargo's raw kind list (e.g. `["lib"]`, `["bin"]`); use
/// [`TargetKind::from_raw_kinds`] to collapse it.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetMetadata {
    pub name: String,
    pub kind: Vec<String>,
    pub src_path: PathBuf,
}

/// The target kinds that can carry tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Library,
    IntegrationTest,
    Binary,
}

impl TargetKind {
    /// Collapse cargo's raw kind strings into a test-relevant kind.
    ///
    /// Returns `None` for targets that never carry runnable tests
    /// (examples, benches, build scripts) and for kinds we do not know.
    pub fn from_raw_kinds(kinds: &[String]) -> Option<TargetKind> {
        if kinds.len() == 1 {
            match kinds[0].as_str() {
                "bin" => Some(TargetKind::Binary),
                "lib" | "rlib" | "dylib" | "cdylib" | "staticlib" => Some(TargetKind::Library),
                "test" => Some(TargetKind::IntegrationTest),
                _ => None,
            }
        } else if kinds.iter().all(|k| is_library_like(k)) {
            Some(TargetKind::Library)
        } else {
            None
        }
    }
}

fn is_library_like(kind: &str) -> bool {
    matches!(kind, "lib" | "rlib" | "dylib" | "cdylib" | "staticlib")
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetKind::Library => "lib",
            TargetKind::IntegrationTest => "test",
            TargetKind::Binary => "bin",
        };
        f.write_str(s)
    }
}

/// A declared target after kind collapsing, as retained on a package node.
#[derive(Debug, Clone)]
pub struct DeclaredTarget {
    pub name: String,
    pub kind: TargetKind,
    pub src_path: PathBuf,
}

impl DeclaredTarget {
    /// Convert raw metadata, dropping targets that cannot carry tests.
    pub fn from_metadata(targets: &[TargetMetadata]) -> Vec<DeclaredTarget> {
        targets
            .iter()
            .filter_map(|t| {
                TargetKind::from_raw_kinds(&t.kind).map(|kind| DeclaredTarget {
                    name: t.name.clone(),
                    kind,
                    src_path: t.src_path.clone(),
                })
            })
            .collect()
    }
}
