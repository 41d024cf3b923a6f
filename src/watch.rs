//! File watching and trigger scheduling
//!
//! Source edits must not reconcile on every keystroke, and the symbol
//! source needs time to re-index before we ask it about a file. Changes and
//! manifest events are debounced (coalesced per file, restarted by every
//! new event); creates and deletes get a short fixed delay that is never
//! restarted. The scheduler is clock-injected so it can be tested without
//! sleeping.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::orchestrate::CancellationToken;
use crate::reconcile::{ReconcileTrigger, Reconciler};
use crate::sources::SymbolSource;

const EXCLUDED_DIRS: &[&str] = &["target", "node_modules", "dist", "out", ".git"];

#[derive(Debug, PartialEq, Eq)]
enum DebounceKey {
    Change(PathBuf),
    Manifest,
}

#[derive(Debug)]
struct Pending {
    trigger: ReconcileTrigger,
    due: Instant,
    key: Option<DebounceKey>,
}

/// Orders triggers in time. Debounced entries are keyed and coalesce;
/// fixed-delay entries always fire.
#[derive(Debug)]
pub struct TriggerScheduler {
    debounce: Duration,
    fixed_delay: Duration,
    pending: Vec<Pending>,
}

impl TriggerScheduler {
    pub fn new(config: &SyncConfig) -> TriggerScheduler {
        TriggerScheduler {
            debounce: config.change_debounce(),
            fixed_delay: config.create_delete_delay(),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, trigger: ReconcileTrigger, now: Instant) {
        let (key, delay) = match &trigger {
            ReconcileTrigger::FileChanged(path) => {
                (Some(DebounceKey::Change(path.clone())), self.debounce)
            }
            ReconcileTrigger::ManifestChanged => (Some(DebounceKey::Manifest), self.debounce),
            ReconcileTrigger::FileCreated(_) | ReconcileTrigger::FileDeleted(_) => {
                (None, self.fixed_delay)
            }
        };
        let due = now + delay;

        if let Some(key) = key {
            if let Some(existing) = self.pending.iter_mut().find(|p| p.key.as_ref() == Some(&key)) {
                // Restart the window, keep one trigger.
                existing.due = due;
                existing.trigger = trigger;
                return;
            }
            self.pending.push(Pending { trigger, due, key: Some(key) });
        } else {
            self.pending.push(Pending { trigger, due, key: None });
        }
    }

    /// Take every trigger whose delay has elapsed, in due order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<ReconcileTrigger> {
        let mut due: Vec<Pending> = Vec::new();
        let mut remaining = Vec::new();
        for pending in self.pending.drain(..) {
            if pending.due <= now {
                due.push(pending);
            } else {
                remaining.push(pending);
            }
        }
        self.pending = remaining;
        due.sort_by_key(|p| p.due);
        due.into_iter().map(|p| p.trigger).collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.due).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Map one filesystem event onto reconcile triggers, applying the
/// excluded-dir, ignore-glob and file-type filters.
fn classify_event(event: &Event, root: &Path, ignore: &[glob::Pattern]) -> Vec<ReconcileTrigger> {
    let mut triggers = Vec::new();

    for path in &event.paths {
        let relative = path.strip_prefix(root).unwrap_or(path);

        if relative
            .components()
            .any(|c| EXCLUDED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
        {
            continue;
        }
        if ignore.iter().any(|p| p.matches_path(relative)) {
            continue;
        }

        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if file_name.as_deref() == Some("Cargo.toml") {
            // Any manifest event can change packages or targets.
            triggers.push(ReconcileTrigger::ManifestChanged);
            continue;
        }

        if path.extension().map(|e| e == "rs").unwrap_or(false) {
            let trigger = match event.kind {
                EventKind::Create(_) => ReconcileTrigger::FileCreated(path.clone()),
                EventKind::Remove(_) => ReconcileTrigger::FileDeleted(path.clone()),
                _ => ReconcileTrigger::FileChanged(path.clone()),
            };
            triggers.push(trigger);
        }
    }

    triggers
}

/// Watches a workspace root and drives a reconciler from its events, on the
/// calling thread.
pub struct FsWatcher {
    root: PathBuf,
    // Kept alive for the duration of the watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    scheduler: TriggerScheduler,
    ignore: Vec<glob::Pattern>,
}

impl FsWatcher {
    pub fn new(root: &Path, config: &SyncConfig) -> Result<FsWatcher> {
        let (tx, rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let ignore = config
            .ignore
            .iter()
            .filter_map(|pattern| match glob::Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(%pattern, error = %e, "ignoring unparsable ignore pattern");
                    None
                }
            })
            .collect();

        Ok(FsWatcher {
            root: root.to_path_buf(),
            _watcher: watcher,
            rx,
            scheduler: TriggerScheduler::new(config),
            ignore,
        })
    }

    /// Event loop: collect filesystem events, let their delays elapse, then
    /// hand the due triggers to the reconciler one at a time. Returns when
    /// the token is cancelled.
    pub fn run<S: SymbolSource>(
        &mut self,
        reconciler: &mut Reconciler<S>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(root = %self.root.display(), "watching for changes");

        while !cancel.is_cancelled() {
            let wait = self
                .scheduler
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(100))
                .min(Duration::from_millis(100));

            match self.rx.recv_timeout(wait) {
                Ok(Ok(event)) => {
                    let now = Instant::now();
                    for trigger in classify_event(&event, &self.root, &self.ignore) {
                        self.scheduler.push(trigger, now);
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "watch error"),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            for trigger in self.scheduler.pop_due(Instant::now()) {
                if let Err(e) = reconciler.handle_trigger(trigger) {
                    warn!(error = %e, "reconciliation failed");
                }
            }
            reconciler.drain_resolve_queue()?;
        }

        Ok(())
    }
}
