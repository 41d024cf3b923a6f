//! Test-runner output analysis
//!
//! A test run's output interleaves human-readable build chatter with one
//! JSON event per line (the runner is invoked with `--format=json`). Each
//! event is resolved to a concrete node in the tree and reported against
//! the run. Two modes share this logic: streaming (live process pipes) and
//! buffered (a captured file read after a debug session ends, since the
//! debugger's child process is not under our observation).

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::model::{NodeId, NodeKind, TestModelTree};
use crate::runnable::TestKind;

/// The editor-side test run: everything the analyzer and orchestrator
/// report goes through this. `finished` is called exactly once per run, no
/// matter how the run terminated.
pub trait RunObserver {
    fn enqueued(&mut self, test: NodeId);
    fn started(&mut self, test: NodeId);
    fn passed(&mut self, test: NodeId, duration_ms: Option<u64>);
    fn failed(&mut self, test: NodeId, message: Option<String>, duration_ms: Option<u64>);
    fn skipped(&mut self, test: NodeId);
    fn raw_output(&mut self, line: &str);
    fn warning(&mut self, message: &str);
    fn finished(&mut self);
}

/// Parsed from the runner's per-target banner, e.g.
/// `Running unittests src/lib.rs (target/debug/deps/mylib-1f2e3d4c)`.
/// Disambiguates which target's events are currently streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteContext {
    /// Target entry file relative to the package, platform separators.
    pub relative_path: String,
    /// Binary-name form of the target name, `-` replaced by `_`.
    pub normalized_target_name: String,
}

impl SuiteContext {
    pub fn try_parse(line: &str) -> Option<SuiteContext> {
        let captures = banner_pattern().captures(line)?;
        Some(SuiteContext {
            relative_path: captures[1].to_string(),
            normalized_target_name: captures[2].to_string(),
        })
    }
}

fn banner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let sep = regex::escape(std::path::MAIN_SEPARATOR_STR);
        Regex::new(&format!(r"Running (?:unittests )?(.*?) \(.*{sep}(.*?)-.*?\)"))
            .expect("banner pattern is valid")
    })
}

fn normalize_target_name(name: &str) -> String {
    name.replace('-', "_")
}

/// The runner reports seconds; the run contract wants milliseconds.
fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round() as u64
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RunnerEvent {
    Test {
        event: TestEventKind,
        name: String,
        #[serde(default)]
        exec_time: Option<f64>,
        #[serde(default)]
        stdout: Option<String>,
    },
    Suite {
        event: SuiteEventKind,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TestEventKind {
    Started,
    Ok,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SuiteEventKind {
    Started,
    Ok,
    Failed,
}

/// Maps one run's output onto tree nodes and run-state transitions.
///
/// Only the chosen node's subtree is tracked per run; every resolved node
/// lies within it by construction.
pub struct OutputAnalyzer<'a, O: RunObserver> {
    tree: &'a TestModelTree,
    scope: NodeId,
    observer: &'a mut O,
    suite_running: bool,
    suite: Option<SuiteContext>,
}

impl<'a, O: RunObserver> OutputAnalyzer<'a, O> {
    pub fn new(tree: &'a TestModelTree, scope: NodeId, observer: &'a mut O) -> OutputAnalyzer<'a, O> {
        assert!(
            matches!(
                tree.kind(scope),
                NodeKind::Package | NodeKind::Target | NodeKind::Module | NodeKind::Test
            ),
            "workspace-level analysis is not supported"
        );
        OutputAnalyzer { tree, scope, observer, suite_running: false, suite: None }
    }

    /// Streaming entry point: one line of process output, in arrival order.
    /// Stray carriage returns from CRLF pipes are stripped here.
    pub fn process_line(&mut self, line: &str) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.starts_with('{') {
            match serde_json::from_str::<RunnerEvent>(line) {
                Ok(event) => {
                    self.handle_event(event);
                    return;
                }
                Err(e) => {
                    // Best effort: anything unparsable is plain output.
                    debug!(error = %e, "line looked structured but did not parse");
                }
            }
        }

        self.observer.raw_output(line);
        if let Some(context) = SuiteContext::try_parse(line) {
            debug!(target = %context.normalized_target_name, "entering suite context");
            self.suite = Some(context);
        }
    }

    /// Buffered entry point: a complete captured output in one pass.
    pub fn process_all(&mut self, output: &str) {
        for line in output.split('\n') {
            self.process_line(line);
        }
    }

    fn handle_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Suite { event: SuiteEventKind::Started } => {
                assert!(!self.suite_running, "a suite is already running");
                self.suite_running = true;
            }
            RunnerEvent::Suite { event: SuiteEventKind::Ok | SuiteEventKind::Failed } => {
                assert!(self.suite_running, "suite end without a running suite");
                self.suite_running = false;
            }
            RunnerEvent::Test { event, name, exec_time, stdout } => {
                assert!(self.suite_running, "test events only arrive inside a suite");
                let node = self.resolve_test(&name);
                let duration_ms = exec_time.map(secs_to_ms);
                match event {
                    TestEventKind::Started => self.observer.started(node),
                    TestEventKind::Failed => self.observer.failed(node, stdout, duration_ms),
                    TestEventKind::Ignored => self.observer.skipped(node),
                    TestEventKind::Ok => self.observer.passed(node, duration_ms),
                }
            }
        }
    }

    /// An event names a test as a `::`-joined path relative to its target's
    /// root module; walk it down from the located target.
    fn resolve_test(&self, name: &str) -> NodeId {
        let target = self.locate_target();
        let path: Vec<String> = name.split("::").map(|s| s.to_string()).collect();
        self.tree
            .find_exact_under_target(target, TestKind::Test, &path)
            .unwrap_or_else(|| panic!("no test node for reported case {:?}", name))
    }

    /// The chosen node usually pins the target. When the run covers a whole
    /// package, the current suite context narrows its targets down to the
    /// unique one whose binary is producing output right now.
    fn locate_target(&self) -> NodeId {
        if let Some(target) = self.tree.target_of(self.scope) {
            return target;
        }

        let context = self
            .suite
            .as_ref()
            .expect("a test event arrived before any suite banner");
        let candidates: Vec<NodeId> = self
            .tree
            .package(self.scope)
            .targets
            .iter()
            .copied()
            .filter(|&id| {
                let target = self.tree.target(id);
                normalize_target_name(&target.name) == context.normalized_target_name
                    && target
                        .src_path
                        .to_string_lossy()
                        .contains(&context.relative_path)
            })
            .collect();

        // Same name and same relative path across two targets of one
        // package would be ambiguous; it has no sane cargo layout.
        assert_eq!(candidates.len(), 1, "suite context must match exactly one target");
        candidates[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, MAIN_SEPARATOR};

    use crate::metadata::{PackageMetadata, TargetKind, TargetMetadata, WorkspaceMetadata};
    use crate::runnable::{RunnableSpec, TestLocation, TextRange};

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Started(NodeId),
        Passed(NodeId, Option<u64>),
        Failed(NodeId, Option<String>, Option<u64>),
        Skipped(NodeId),
        Raw(String),
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Vec<Recorded>,
    }

    impl RunObserver for RecordingObserver {
        fn enqueued(&mut self, _test: NodeId) {}
        fn started(&mut self, test: NodeId) {
            self.events.push(Recorded::Started(test));
        }
        fn passed(&mut self, test: NodeId, duration_ms: Option<u64>) {
            self.events.push(Recorded::Passed(test, duration_ms));
        }
        fn failed(&mut self, test: NodeId, message: Option<String>, duration_ms: Option<u64>) {
            self.events.push(Recorded::Failed(test, message, duration_ms));
        }
        fn skipped(&mut self, test: NodeId) {
            self.events.push(Recorded::Skipped(test));
        }
        fn raw_output(&mut self, line: &str) {
            self.events.push(Recorded::Raw(line.to_string()));
        }
        fn warning(&mut self, _message: &str) {}
        fn finished(&mut self) {}
    }

    fn spec(label: &str) -> RunnableSpec {
        RunnableSpec::target_scope(
            "mylib",
            TargetKind::Library,
            label,
            Path::new("/ws"),
            Path::new("/ws/src/lib.rs"),
        )
    }

    fn location() -> TestLocation {
        TestLocation { file: "/ws/src/lib.rs".into(), range: TextRange::zero() }
    }

    /// mylib with Target mylib → Module mymod → Test case_a.
    fn tree_with_case_a() -> (TestModelTree, NodeId, NodeId) {
        let mut tree = TestModelTree::new();
        tree.init_from_metadata(&[WorkspaceMetadata {
            workspace_root: "/ws".into(),
            packages: vec![PackageMetadata {
                name: "mylib".into(),
                manifest_path: "/ws/Cargo.toml".into(),
                targets: vec![TargetMetadata {
                    name: "mylib".into(),
                    kind: vec!["lib".into()],
                    src_path: "/ws/src/lib.rs".into(),
                }],
            }],
        }]);
        let ws = tree.workspaces()[0];
        let pkg = tree.find_package(ws, "mylib").unwrap();
        let target = tree.create_target(pkg, TargetKind::Library, "mylib", Path::new("/ws/src/lib.rs"));
        let root = tree.target(target).root_module;
        let module = tree.insert_module(
            root,
            "mymod",
            location(),
            "/ws/src/lib.rs".into(),
            spec("mylib"),
        );
        let test = tree.insert_test(module, "case_a", location(), spec("mylib"));
        (tree, target, test)
    }

    fn banner(relative: &str, binary: &str) -> String {
        let sep = MAIN_SEPARATOR;
        let relative = relative.replace('/', &sep.to_string());
        format!("Running unittests {relative} (target{sep}debug{sep}deps{sep}{binary})")
    }

    #[test]
    fn test_banner_parsing() {
        let context = SuiteContext::try_parse(&banner("src/lib.rs", "mylib-abcdef12")).unwrap();
        assert_eq!(context.normalized_target_name, "mylib");
        assert!(context.relative_path.ends_with("lib.rs"));

        assert!(SuiteContext::try_parse("Compiling mylib v0.1.0").is_none());
    }

    #[test]
    fn test_event_sequence_drives_test_to_passed() {
        let (tree, target, test) = tree_with_case_a();
        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, target, &mut observer);

        analyzer.process_line(&banner("src/lib.rs", "mylib-abcdef12"));
        analyzer.process_line(r#"{"type":"suite","event":"started","test_count":1}"#);
        analyzer.process_line(r#"{"type":"test","event":"started","name":"mymod::case_a"}"#);
        analyzer.process_line(r#"{"type":"test","event":"ok","name":"mymod::case_a","exec_time":0.002}"#);
        analyzer.process_line(r#"{"type":"suite","event":"ok","passed":1,"failed":0}"#);

        let events: Vec<&Recorded> = observer
            .events
            .iter()
            .filter(|e| !matches!(e, Recorded::Raw(_)))
            .collect();
        assert_eq!(events, [&Recorded::Started(test), &Recorded::Passed(test, Some(2))]);
    }

    #[test]
    fn test_failure_carries_stdout_and_duration() {
        let (tree, target, test) = tree_with_case_a();
        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, target, &mut observer);

        analyzer.process_line(r#"{"type":"suite","event":"started"}"#);
        analyzer.process_line(
            r#"{"type":"test","event":"failed","name":"mymod::case_a","exec_time":1.5,"stdout":"assertion failed"}"#,
        );
        analyzer.process_line(r#"{"type":"suite","event":"failed"}"#);

        assert_eq!(
            observer.events,
            [Recorded::Failed(test, Some("assertion failed".into()), Some(1500))]
        );
    }

    #[test]
    fn test_ignored_reports_skipped() {
        let (tree, target, test) = tree_with_case_a();
        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, target, &mut observer);

        analyzer.process_line(r#"{"type":"suite","event":"started"}"#);
        analyzer.process_line(r#"{"type":"test","event":"ignored","name":"mymod::case_a"}"#);
        analyzer.process_line(r#"{"type":"suite","event":"ok"}"#);

        assert_eq!(observer.events, [Recorded::Skipped(test)]);
    }

    #[test]
    fn test_plain_and_malformed_lines_pass_through() {
        let (tree, target, _test) = tree_with_case_a();
        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, target, &mut observer);

        analyzer.process_line("Finished test [unoptimized + debuginfo] target(s) in 0.07s");
        analyzer.process_line("{not json at all");

        assert_eq!(
            observer.events,
            [
                Recorded::Raw("Finished test [unoptimized + debuginfo] target(s) in 0.07s".into()),
                Recorded::Raw("{not json at all".into()),
            ]
        );
    }

    #[test]
    fn test_package_scope_resolves_target_through_suite_context() {
        let (mut tree, _target, test) = tree_with_case_a();
        let ws = tree.workspaces()[0];
        let pkg = tree.find_package(ws, "mylib").unwrap();

        // A second target with a different entry file; the banner must pick
        // the library, not this one.
        let other = tree.create_target(
            pkg,
            TargetKind::IntegrationTest,
            "integration",
            Path::new("/ws/tests/integration.rs"),
        );
        let other_root = tree.target(other).root_module;
        tree.insert_test(
            other_root,
            "smoke",
            TestLocation { file: "/ws/tests/integration.rs".into(), range: TextRange::zero() },
            spec("integration"),
        );

        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, pkg, &mut observer);

        analyzer.process_line(&banner("src/lib.rs", "mylib-abcdef12"));
        analyzer.process_line(r#"{"type":"suite","event":"started"}"#);
        analyzer.process_line(r#"{"type":"test","event":"ok","name":"mymod::case_a","exec_time":0.01}"#);
        analyzer.process_line(r#"{"type":"suite","event":"ok"}"#);

        let passes: Vec<&Recorded> = observer
            .events
            .iter()
            .filter(|e| matches!(e, Recorded::Passed(..)))
            .collect();
        assert_eq!(passes, [&Recorded::Passed(test, Some(10))]);
    }

    #[test]
    fn test_buffered_pass_handles_crlf() {
        let (tree, target, test) = tree_with_case_a();
        let mut observer = RecordingObserver::default();
        let mut analyzer = OutputAnalyzer::new(&tree, target, &mut observer);

        let captured = concat!(
            "{\"type\":\"suite\",\"event\":\"started\"}\r\n",
            "{\"type\":\"test\",\"event\":\"started\",\"name\":\"mymod::case_a\"}\r\n",
            "{\"type\":\"test\",\"event\":\"ok\",\"name\":\"mymod::case_a\",\"exec_time\":0.25}\r\n",
            "{\"type\":\"suite\",\"event\":\"ok\"}\r\n",
        );
        analyzer.process_all(captured);

        let events: Vec<&Recorded> = observer
            .events
            .iter()
            .filter(|e| !matches!(e, Recorded::Raw(_)))
            .collect();
        assert_eq!(events, [&Recorded::Started(test), &Recorded::Passed(test, Some(250))]);
    }
}
