//! External collaborators
//!
//! The symbol source (a language server behind some transport) and the
//! debug adapter are consumed through these traits; their plumbing is not
//! this crate's business. Tests substitute in-memory fakes.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::metadata::WorkspaceMetadata;
use crate::runnable::{Runnable, RunnableLocation, RunnableSpec, TestLocation};

/// The authoritative source of runnables and build metadata.
pub trait SymbolSource {
    /// Ordered list of runnable records for one file. An empty list means
    /// the file currently defines no tests.
    fn runnables_in_file(&mut self, file: &Path) -> Result<Vec<Runnable>>;

    /// Resolve a module declaration (`mod foo;`) to its one definition
    /// location. The source guarantees exactly one result; more or fewer is
    /// a protocol mismatch on its side.
    fn module_definition(&mut self, declaration: &RunnableLocation) -> Result<TestLocation>;

    /// Workspace/package/target metadata, already filtered to the caller's
    /// own (non-dependency) packages.
    fn workspace_metadata(&mut self) -> Result<Vec<WorkspaceMetadata>>;
}

/// A resolved debug configuration. Opaque to this crate beyond the adapter
/// kind and the optional output redirection.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Session name; used to correlate lifecycle events. Only one debug
    /// session runs at a time, so names do not collide.
    pub name: String,
    /// Adapter kind (e.g. "lldb"). Output analysis only works for adapters
    /// known to honor the stdio redirection below.
    pub kind: String,
    /// Where the debuggee's stdout goes. When unset the orchestrator
    /// redirects it to a scratch file so the output can be analyzed.
    pub output_redirect: Option<std::path::PathBuf>,
    /// Everything else the debugger needs, passed through untouched.
    pub settings: Value,
}

/// Debugger integration, driven by the execution orchestrator.
pub trait DebugAdapter {
    /// Build a launch configuration for the given runnable.
    fn resolve_configuration(&mut self, runnable: &RunnableSpec) -> Result<DebugConfig>;

    /// Start the session described by `config`.
    fn launch(&mut self, config: &DebugConfig) -> Result<()>;

    /// Whether the named session has terminated.
    fn is_terminated(&mut self, session_name: &str) -> Result<bool>;

    /// Ask the adapter to disconnect the named session. Cooperative; the
    /// session reports termination through [`DebugAdapter::is_terminated`].
    fn disconnect(&mut self, session_name: &str) -> Result<()>;
}
