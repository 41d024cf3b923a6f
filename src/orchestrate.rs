//! Execution orchestration
//!
//! Takes a run request for exactly one chosen node, decides run-vs-debug,
//! spawns accordingly and wires the output analyzer. Whatever happens after
//! the process or debug session starts (completion, crash, cancellation),
//! the run is finalized exactly once so the editor never hangs in a
//! "running" state.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer::{OutputAnalyzer, RunObserver};
use crate::model::{NodeId, TestModelTree};
use crate::runnable::RunnableSpec;
use crate::sources::DebugAdapter;

/// Cooperative cancellation. The contract is "the run will be marked
/// ended", not that the child process or debug session is confirmed dead
/// first.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunProfileKind {
    Run,
    Debug,
    Coverage,
}

/// A request to run one chosen test-like node.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub include: Vec<NodeId>,
    pub profile: RunProfileKind,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

pub struct ExecutionOrchestrator<D> {
    debug_adapter: D,
    cargo_path: PathBuf,
}

impl<D: DebugAdapter> ExecutionOrchestrator<D> {
    pub fn new(debug_adapter: D) -> ExecutionOrchestrator<D> {
        ExecutionOrchestrator { debug_adapter, cargo_path: PathBuf::from("cargo") }
    }

    pub fn with_cargo_path(mut self, path: PathBuf) -> ExecutionOrchestrator<D> {
        self.cargo_path = path;
        self
    }

    /// Entry point for a run request. Selection problems and unsupported
    /// profiles warn and return `None` before anything is started; once a
    /// process or session launches, a summary is always produced.
    pub fn execute<O: RunObserver>(
        &mut self,
        tree: &TestModelTree,
        request: &RunRequest,
        observer: &mut O,
        cancel: &CancellationToken,
    ) -> Result<Option<RunSummary>> {
        let node = match request.include.as_slice() {
            [] => {
                observer.warning("There are no tests to run");
                return Ok(None);
            }
            [single] => *single,
            _ => {
                observer.warning("Exactly one test item must be picked per run");
                return Ok(None);
            }
        };

        match request.profile {
            RunProfileKind::Coverage => {
                observer.warning("Coverage runs are not supported");
                Ok(None)
            }
            RunProfileKind::Run => self.run_process(tree, node, observer, cancel).map(Some),
            RunProfileKind::Debug => self.run_debug(tree, node, observer, cancel),
        }
    }

    /// Direct path: spawn the build tool's test command with both pipes
    /// captured and stream them through the analyzer.
    fn run_process<O: RunObserver>(
        &mut self,
        tree: &TestModelTree,
        node: NodeId,
        observer: &mut O,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let spec = tree.runnable_for(node);
        let args = compose_test_args(&spec);

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        for leaf in tree.leaf_tests_under(node) {
            observer.enqueued(leaf);
        }
        observer.raw_output(&format!("{} {}", self.cargo_path.display(), args.join(" ")));
        info!(%run_id, "spawning test process");

        let mut child = Command::new(&self.cargo_path)
            .args(&args)
            .current_dir(spec.workspace_root())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn test process")?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;

        // The banner lines land on stderr, the events on stdout; both feed
        // the same analyzer in arrival order.
        let (tx, rx) = mpsc::channel::<String>();
        let stdout_reader = spawn_line_reader(stdout, tx.clone());
        let stderr_reader = spawn_line_reader(stderr, tx);

        let mut killed = false;
        {
            let mut analyzer = OutputAnalyzer::new(tree, node, observer);
            loop {
                if cancel.is_cancelled() && !killed {
                    debug!(%run_id, "cancellation requested, killing test process");
                    child.kill().ok();
                    killed = true;
                }
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(line) => analyzer.process_line(&line),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        stdout_reader.join().ok();
        stderr_reader.join().ok();
        let status = child.wait().context("failed to wait for test process")?;

        observer.finished();
        Ok(RunSummary {
            id: run_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            success: status.success() && !killed,
        })
    }

    /// Debug path: the debugger owns the child process, so output is
    /// redirected to a file and analyzed in one pass after the session
    /// terminates.
    fn run_debug<O: RunObserver>(
        &mut self,
        tree: &TestModelTree,
        node: NodeId,
        observer: &mut O,
        cancel: &CancellationToken,
    ) -> Result<Option<RunSummary>> {
        let spec = tree.runnable_for(node);
        let mut config = self
            .debug_adapter
            .resolve_configuration(&spec)
            .context("failed to resolve debug configuration")?;

        if config.kind != "lldb" {
            observer.warning(&format!(
                "Debugger kind {:?} is not supported for test output analysis",
                config.kind
            ));
            return Ok(None);
        }

        let mut redirect_guard: Option<tempfile::TempDir> = None;
        let capture_path = match &config.output_redirect {
            Some(_) => {
                // A user-provided redirection is respected, but then the
                // output is theirs, not ours.
                observer.warning(
                    "The debug configuration already redirects output; results will not be analyzed",
                );
                None
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("testmap-redirect-")
                    .tempdir()
                    .context("failed to create output redirect directory")?;
                let path = dir.path().join("output.txt");
                config.output_redirect = Some(path.clone());
                redirect_guard = Some(dir);
                Some(path)
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        for leaf in tree.leaf_tests_under(node) {
            observer.enqueued(leaf);
        }

        let session_name = config.name.clone();
        self.debug_adapter
            .launch(&config)
            .context("failed to start debug session")?;
        info!(%run_id, session = %session_name, "debug session started");

        // The session is live now; finalize no matter how it ends.
        let wait_result = self.wait_for_debug_end(&session_name, cancel);

        if let Some(path) = capture_path {
            match std::fs::read_to_string(&path) {
                Ok(output) => {
                    let mut analyzer = OutputAnalyzer::new(tree, node, observer);
                    analyzer.process_all(&output);
                }
                Err(e) => warn!(error = %e, "could not read captured debug output"),
            }
        }
        drop(redirect_guard);

        observer.finished();
        wait_result?;
        Ok(Some(RunSummary {
            id: run_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            success: !cancel.is_cancelled(),
        }))
    }

    fn wait_for_debug_end(&mut self, session: &str, cancel: &CancellationToken) -> Result<()> {
        let mut disconnect_requested = false;
        loop {
            if self.debug_adapter.is_terminated(session)? {
                return Ok(());
            }
            if cancel.is_cancelled() && !disconnect_requested {
                debug!(session, "cancellation requested, disconnecting debug session");
                self.debug_adapter.disconnect(session)?;
                disconnect_requested = true;
            }
            thread::sleep(Duration::from_millis(25));
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    pipe: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Build the final invocation: build args, extra args, then the test
/// binary's own args, forced into structured, timed, capture-everything
/// output. `--nocapture` is stripped; uncaptured parallel test output
/// interleaves arbitrarily and cannot be analyzed.
fn compose_test_args(spec: &RunnableSpec) -> Vec<String> {
    let raw = spec.raw();
    let mut args: Vec<String> = raw.args.build_args.clone();
    args.extend(raw.args.extra_args.iter().cloned());
    args.push("--".to_string());
    args.extend(raw.args.program_args.iter().cloned());
    args.retain(|a| a != "--nocapture");

    assert_eq!(args[0], "test", "only `cargo test` invocations are supported");

    args.extend(
        ["-Z", "unstable-options", "--format=json", "--report-time", "--show-output"]
            .into_iter()
            .map(String::from),
    );
    args
}
