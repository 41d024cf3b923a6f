//! Testmap - live test model for Cargo workspaces
//!
//! A library for keeping a hierarchical model of a workspace's test surface
//! (workspace → package → target → test module → test) in sync with a
//! changing source tree, and for running what the model contains:
//! - Incremental per-file reconciliation against a symbol source, with lazy
//!   target creation; never a full rebuild on edit
//! - Debounced file watching tuned around the symbol source's re-indexing
//! - Streaming analysis of the test runner's JSON event output
//! - Run and debug execution paths converging on one reporting contract

pub mod analyzer;
pub mod config;
pub mod items;
pub mod metadata;
pub mod model;
pub mod orchestrate;
pub mod reconcile;
pub mod runnable;
pub mod sources;
pub mod watch;

pub use analyzer::{OutputAnalyzer, RunObserver, SuiteContext};
pub use config::SyncConfig;
pub use items::{ItemBindings, ItemId};
pub use metadata::{TargetKind, WorkspaceMetadata};
pub use model::{NodeId, NodeKind, TestModelTree};
pub use orchestrate::{CancellationToken, ExecutionOrchestrator, RunProfileKind, RunRequest, RunSummary};
pub use reconcile::{ReconcileStats, ReconcileTrigger, Reconciler};
pub use runnable::{Runnable, RunnableSpec, TestKind};
pub use sources::{DebugAdapter, DebugConfig, SymbolSource};
pub use watch::{FsWatcher, TriggerScheduler};
