//! Runnable descriptors
//!
//! The symbol source reports tests and test modules as loosely structured
//! "runnable" records: a `"<marker> <a::b::c>"` label plus the build
//! invocation that would run them. [`RunnableSpec`] parses that encoding
//! once, at the boundary, and exposes typed fields; nothing downstream
//! re-splits strings.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metadata::TargetKind;

/// A zero-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// A source range, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct TextRange {
    pub start: Position,
    pub end: Position,
}

impl TextRange {
    pub fn zero() -> TextRange {
        TextRange::default()
    }
}

/// Where a test or test module lives in source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestLocation {
    pub file: PathBuf,
    pub range: TextRange,
}

/// Source location attached to a runnable: the full extent of the item and
/// the smaller range of its name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableLocation {
    pub file: PathBuf,
    pub declaration_range: TextRange,
    pub selection_range: TextRange,
}

/// The build invocation that selects and runs this runnable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableArgs {
    pub workspace_root: PathBuf,
    pub build_args: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub program_args: Vec<String>,
}

/// One runnable record as received from the symbol source.
#[derive(Debug, Clone, Deserialize)]
pub struct Runnable {
    pub label: String,
    pub location: Option<RunnableLocation>,
    #[serde(rename = "invocationArgs")]
    pub args: RunnableArgs,
}

/// Whether a runnable denotes a single test or a test module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Test,
    Module,
}

/// How a test-module runnable relates to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleShape {
    /// A reference like `mod foo;`, defined elsewhere.
    Declaration,
    /// The module is the file itself (full range equals the name range).
    FileDefinition,
    /// An inline `mod foo { .. }` with its body in the same file.
    WithItems,
}

/// A runnable with its label and invocation args parsed into typed fields.
///
/// Label format: `"test a::b::c"` for a test (the path is never empty) and
/// `"test-mod a::b"` for a module (empty path iff it is a target's root
/// module). Identity for matching purposes is the full test path.
#[derive(Debug, Clone)]
pub struct RunnableSpec {
    raw: Runnable,
    kind: TestKind,
    path: Vec<String>,
    target_kind: TargetKind,
    package: String,
    target_file: Option<String>,
}

impl RunnableSpec {
    pub fn parse(raw: Runnable) -> Result<RunnableSpec> {
        let (marker, path_str) = raw
            .label
            .split_once(' ')
            .with_context(|| format!("runnable label has no marker: {:?}", raw.label))?;

        let kind = match marker {
            "test" => TestKind::Test,
            "test-mod" => TestKind::Module,
            other => bail!("unknown runnable marker {:?}", other),
        };

        let path: Vec<String> = if path_str.is_empty() {
            Vec::new()
        } else {
            path_str.split("::").map(|s| s.to_string()).collect()
        };

        let build_args = &raw.args.build_args;

        let target_kind = if build_args.iter().any(|a| a == "--lib") {
            TargetKind::Library
        } else if build_args.iter().any(|a| a == "--test") {
            TargetKind::IntegrationTest
        } else if build_args.iter().any(|a| a == "--bin") {
            TargetKind::Binary
        } else {
            bail!("runnable {:?} selects no target", raw.label);
        };

        let package = arg_value(build_args, "--package")
            .with_context(|| format!("runnable {:?} has no --package value", raw.label))?
            // The value is a "name:version" qualifier; only the name matters.
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();

        let target_file = match target_kind {
            TargetKind::Library => None,
            TargetKind::IntegrationTest => Some(
                arg_value(build_args, "--test")
                    .context("integration-test runnable has no --test value")?
                    .to_string(),
            ),
            TargetKind::Binary => Some(
                arg_value(build_args, "--bin")
                    .context("binary runnable has no --bin value")?
                    .to_string(),
            ),
        };

        Ok(RunnableSpec { raw, kind, path, target_kind, package, target_file })
    }

    /// Synthetic runnable scoping a whole target (its root test module).
    pub fn target_scope(
        package: &str,
        target_kind: TargetKind,
        target_name: &str,
        workspace_root: &Path,
        src_path: &Path,
    ) -> RunnableSpec {
        let mut build_args = vec!["test".to_string(), "--package".to_string(), package.to_string()];
        match target_kind {
            TargetKind::Library => build_args.push("--lib".to_string()),
            TargetKind::IntegrationTest => {
                build_args.push("--test".to_string());
                build_args.push(target_name.to_string());
            }
            TargetKind::Binary => {
                build_args.push("--bin".to_string());
                build_args.push(target_name.to_string());
            }
        }
        Self::synthetic(build_args, workspace_root, src_path)
    }

    /// Synthetic runnable scoping every target of a package at once.
    pub fn package_scope(package: &str, workspace_root: &Path, manifest_path: &Path) -> RunnableSpec {
        let build_args = vec![
            "test".to_string(),
            "--package".to_string(),
            package.to_string(),
            "--lib".to_string(),
            "--bins".to_string(),
            "--tests".to_string(),
        ];
        Self::synthetic(build_args, workspace_root, manifest_path)
    }

    fn synthetic(build_args: Vec<String>, workspace_root: &Path, file: &Path) -> RunnableSpec {
        let raw = Runnable {
            label: "test-mod ".to_string(),
            location: Some(RunnableLocation {
                file: file.to_path_buf(),
                declaration_range: TextRange::zero(),
                selection_range: TextRange::zero(),
            }),
            args: RunnableArgs {
                workspace_root: workspace_root.to_path_buf(),
                build_args,
                extra_args: Vec::new(),
                program_args: Vec::new(),
            },
        };
        RunnableSpec::parse(raw).expect("synthetic runnable is well formed")
    }

    pub fn raw(&self) -> &Runnable {
        &self.raw
    }

    pub fn label(&self) -> &str {
        &self.raw.label
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    /// Test path from the target's root module down to this item; empty for
    /// a root module.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Name of the test or module itself; empty for a root module.
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    pub fn parent_path(&self) -> &[String] {
        if self.path.is_empty() {
            &[]
        } else {
            &self.path[..self.path.len() - 1]
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        self.target_kind
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// The target's name: the package name for libraries, the `--test` /
    /// `--bin` file name otherwise.
    pub fn target_name(&self) -> &str {
        match self.target_kind {
            TargetKind::Library => &self.package,
            _ => self.target_file.as_deref().expect("checked at parse time"),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.raw.args.workspace_root
    }

    pub fn location(&self) -> &RunnableLocation {
        self.raw.location.as_ref().expect("runnable has no location")
    }

    /// Location used on the tree node: the file plus the name's range.
    pub fn test_location(&self) -> TestLocation {
        let loc = self.location();
        TestLocation { file: loc.file.clone(), range: loc.selection_range }
    }

    pub fn file(&self) -> &Path {
        &self.location().file
    }

    /// Classify a test-module runnable. Panics on a test runnable; shape is
    /// only meaningful for modules.
    pub fn module_shape(&self) -> ModuleShape {
        assert_eq!(self.kind, TestKind::Module, "shape is only defined for test modules");
        let loc = self.location();

        if loc.declaration_range == loc.selection_range {
            return ModuleShape::FileDefinition;
        }

        // A `mod foo;` reference ends on the same line as its name. Inline
        // one-line `mod foo { .. }` bodies are misclassified, tolerated.
        if loc.declaration_range.end.line == loc.selection_range.end.line {
            ModuleShape::Declaration
        } else {
            ModuleShape::WithItems
        }
    }

    /// Composite identity used to drop duplicated descriptors, first wins.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.workspace_root().display(),
            self.package,
            self.target_kind,
            self.target_name(),
            self.raw.label,
        )
    }

    pub fn matches_path(&self, path: &[String]) -> bool {
        self.path == path
    }
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1).map(String::as_str)
}
