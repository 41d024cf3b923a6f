//! Incremental reconciliation
//!
//! Keeps the test module/test subtree for one file consistent with what the
//! symbol source currently reports for it, as a minimal diff against the
//! tree, never a rebuild. Workspace and package nodes only change on a
//! full metadata refresh; targets spring into existence when their first
//! test shows up.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::items::ItemBindings;
use crate::metadata::TargetKind;
use crate::model::{NodeId, NodeKind, TestModelTree};
use crate::runnable::{ModuleShape, RunnableSpec, TestKind};
use crate::sources::SymbolSource;

/// File lifecycle events that drive reconciliation. Scheduling (debounce /
/// fixed delay) happens in the watch layer; by the time a trigger arrives
/// here its delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileTrigger {
    FileChanged(PathBuf),
    FileCreated(PathBuf),
    FileDeleted(PathBuf),
    /// Any build-manifest create/delete/change; packages or targets may
    /// have changed, so the whole metadata is refreshed.
    ManifestChanged,
}

/// What one reconciliation pass did to the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    /// Nodes whose cached location actually changed. Refreshing an
    /// unchanged node does not count, so reconciling an unchanged file is
    /// observably a no-op.
    pub updated: usize,
    pub deleted: usize,
}

pub struct Reconciler<S> {
    source: S,
    tree: TestModelTree,
    bindings: ItemBindings,
    /// Lazy child-resolution requests, strictly first-in first-out so two
    /// rapid expansions cannot interleave their diffs.
    resolve_queue: VecDeque<NodeId>,
}

impl<S: SymbolSource> Reconciler<S> {
    pub fn new(source: S) -> Reconciler<S> {
        Reconciler {
            source,
            tree: TestModelTree::new(),
            bindings: ItemBindings::new(),
            resolve_queue: VecDeque::new(),
        }
    }

    pub fn tree(&self) -> &TestModelTree {
        &self.tree
    }

    pub fn bindings(&self) -> &ItemBindings {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut ItemBindings {
        &mut self.bindings
    }

    pub fn handle_trigger(&mut self, trigger: ReconcileTrigger) -> Result<()> {
        match trigger {
            ReconcileTrigger::FileChanged(path) | ReconcileTrigger::FileCreated(path) => {
                self.reconcile_file(&path)?;
            }
            ReconcileTrigger::FileDeleted(path) => {
                let removed = self.tree.remove_subtree_for_file(&path);
                self.bindings.purge(&removed);
            }
            ReconcileTrigger::ManifestChanged => self.refresh()?,
        }
        Ok(())
    }

    /// Full refresh: drop everything, re-fetch metadata, reconcile every
    /// declared target's entry file once. Targets that do have tests spring
    /// back into existence through the per-file pass; the rest stay absent.
    pub fn refresh(&mut self) -> Result<()> {
        info!("refreshing test model from build metadata");
        self.tree.clear();
        self.bindings.clear();
        self.resolve_queue.clear();

        let metadata = self.source.workspace_metadata().context("failed to fetch workspace metadata")?;
        self.tree.init_from_metadata(&metadata);

        let mut entry_files = Vec::new();
        for &ws in self.tree.workspaces() {
            for &pkg in &self.tree.workspace(ws).members {
                for declared in &self.tree.package(pkg).declared_targets {
                    entry_files.push(declared.src_path.clone());
                }
            }
        }

        for file in entry_files {
            self.reconcile_file(&file)
                .with_context(|| format!("failed to reconcile {}", file.display()))?;
        }
        Ok(())
    }

    /// Reconcile one file's subtree against the symbol source's current
    /// report for it.
    pub fn reconcile_file(&mut self, file: &Path) -> Result<ReconcileStats> {
        debug!(file = %file.display(), "reconciling");

        let specs = self.fetch_specs(file)?;

        if specs.is_empty() {
            let removed = self.tree.remove_subtree_for_file(file);
            self.bindings.purge(&removed);
            return Ok(ReconcileStats { deleted: removed.len(), ..Default::default() });
        }

        // The file's own defining module: the first file-definition module
        // descriptor names it. Extra file-definition descriptors should not
        // happen; the first one wins. Some reports omit the descriptor
        // entirely, in which case the shortest parent path among the
        // remaining descriptors identifies the same module.
        let mut module_specs: Vec<&RunnableSpec> =
            specs.iter().filter(|s| s.kind() == TestKind::Module).collect();
        module_specs.sort_by(|a, b| a.path().cmp(b.path()));

        let file_definition = module_specs
            .iter()
            .copied()
            .find(|s| s.module_shape() == ModuleShape::FileDefinition);

        let (anchor, parent_path): (RunnableSpec, Vec<String>) = match file_definition {
            Some(spec) => (spec.clone(), spec.path().to_vec()),
            None => {
                let shortest = specs
                    .iter()
                    .map(|s| s.parent_path())
                    .min_by_key(|p| p.len())
                    .expect("specs are non-empty")
                    .to_vec();
                (specs[0].clone(), shortest)
            }
        };

        self.ensure_target(&anchor, file);
        self.ensure_ancestors(&anchor, &parent_path)?;

        let parent = self.tree.find_nearest(
            anchor.workspace_root(),
            anchor.package(),
            anchor.target_kind(),
            anchor.target_name(),
            &parent_path,
            TestKind::Module,
        );
        assert_eq!(self.tree.kind(parent), NodeKind::Module, "the file's defining parent is a module");
        assert_eq!(self.tree.test_path(parent), parent_path, "the defining parent module exists by now");

        // File-definition modules are not materialized as their own nodes:
        // the file's module is represented by its declaration elsewhere, or
        // by the target's root module.
        let diff_specs: Vec<RunnableSpec> = specs
            .into_iter()
            .filter(|s| s.kind() == TestKind::Test || s.module_shape() != ModuleShape::FileDefinition)
            .collect();

        self.update_module_children(parent, diff_specs)
    }

    /// Queue a lazy child resolution for a module (typically a declaration
    /// module the UI is expanding).
    pub fn request_resolve(&mut self, module: NodeId) {
        self.resolve_queue.push_back(module);
    }

    /// Serve queued resolutions in arrival order.
    pub fn drain_resolve_queue(&mut self) -> Result<()> {
        while let Some(id) = self.resolve_queue.pop_front() {
            if !self.tree.contains(id) || self.tree.kind(id) != NodeKind::Module {
                continue;
            }
            if !self.tree.module(id).children.is_empty() {
                // Already resolved.
                continue;
            }
            let file = self.tree.module(id).definition_file.clone();
            self.reconcile_file(&file)?;
        }
        Ok(())
    }

    fn fetch_specs(&mut self, file: &Path) -> Result<Vec<RunnableSpec>> {
        let raw = self
            .source
            .runnables_in_file(file)
            .with_context(|| format!("failed to fetch runnables for {}", file.display()))?;

        // Copy-pasted tests can produce identically named duplicates; keep
        // the first of each and tolerate the rest.
        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        for runnable in raw {
            let label = runnable.label.clone();
            let spec = RunnableSpec::parse(runnable)
                .with_context(|| format!("malformed runnable {:?} in {}", label, file.display()))?;
            if seen.insert(spec.dedup_key()) {
                specs.push(spec);
            } else {
                debug!(label = spec.label(), "dropping duplicated runnable");
            }
        }
        Ok(specs)
    }

    /// Create the target node for this file's descriptors if it does not
    /// exist yet, together with its synthetic root module.
    fn ensure_target(&mut self, anchor: &RunnableSpec, file: &Path) {
        let ws = self
            .tree
            .find_workspace(anchor.workspace_root())
            .unwrap_or_else(|| panic!("unknown workspace root {}", anchor.workspace_root().display()));
        let pkg = self
            .tree
            .find_package(ws, anchor.package())
            .expect("package nodes only change on a full refresh");

        if self
            .tree
            .find_target(pkg, anchor.target_kind(), anchor.target_name())
            .is_some()
        {
            return;
        }

        // Entry path comes from declared metadata; when the metadata does
        // not know the target, the reconciled file itself is only correct
        // for a root-module report.
        let declared = self
            .tree
            .package(pkg)
            .declared_targets
            .iter()
            .find(|d| {
                d.kind == anchor.target_kind()
                    && (anchor.target_kind() == TargetKind::Library || d.name == anchor.target_name())
            })
            .map(|d| d.src_path.clone());
        let src_path = declared.unwrap_or_else(|| {
            debug!(
                target = anchor.target_name(),
                fallback = %file.display(),
                "target not in declared metadata, using the reconciled file as entry path"
            );
            file.to_path_buf()
        });

        debug!(target = anchor.target_name(), kind = %anchor.target_kind(), "creating target lazily");
        self.tree.create_target(pkg, anchor.target_kind(), anchor.target_name(), &src_path);
    }

    /// Make every ancestor module on the way down to `parent_path` exist,
    /// by reconciling each missing ancestor's own defining file first.
    /// Ancestors may be declared in different files than they are defined.
    fn ensure_ancestors(&mut self, anchor: &RunnableSpec, parent_path: &[String]) -> Result<()> {
        loop {
            let target = self.target_for(anchor);
            let nearest = self.tree.find_test_like_under_target(target, TestKind::Module, parent_path);
            let nearest_path = self.tree.test_path(nearest);
            if nearest_path == parent_path {
                return Ok(());
            }

            let definition_file = self.tree.module(nearest).definition_file.clone();
            self.reconcile_file(&definition_file)?;

            let after = self.tree.find_test_like_under_target(target, TestKind::Module, parent_path);
            assert!(
                self.tree.test_path(after).len() > nearest_path.len(),
                "ancestor module for {:?} did not materialize from {}",
                parent_path,
                definition_file.display(),
            );
        }
    }

    fn target_for(&self, anchor: &RunnableSpec) -> NodeId {
        let ws = self
            .tree
            .find_workspace(anchor.workspace_root())
            .expect("workspace exists");
        let pkg = self.tree.find_package(ws, anchor.package()).expect("package exists");
        self.tree
            .find_target(pkg, anchor.target_kind(), anchor.target_name())
            .expect("target was just ensured")
    }

    /// Diff a module's same-file children against freshly fetched
    /// descriptors and apply the add/update/delete edits.
    fn update_module_children(
        &mut self,
        parent: NodeId,
        specs: Vec<RunnableSpec>,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let file = self.tree.module(parent).definition_file.clone();

        // Everything below the parent that this file defines, at any depth:
        // inline modules nest, and their contents still live in this file.
        let current: Vec<NodeId> = self
            .tree
            .test_likes_under(parent)
            .into_iter()
            .filter(|&n| match self.tree.kind(n) {
                NodeKind::Module => self.tree.module(n).declaration.file == file,
                NodeKind::Test => self.tree.test(n).location.file == file,
                _ => unreachable!("test_likes_under yields only tests and modules"),
            })
            .collect();

        let mut matched: HashSet<NodeId> = HashSet::new();
        let mut added: Vec<RunnableSpec> = Vec::new();

        for spec in &specs {
            let node = self.tree.find_nearest_for(spec);
            assert!(self.tree.is_test_like(node), "diff walks never leave the target subtree");

            if self.tree.test_path(node) == spec.path() {
                stats.updated += self.refresh_node(node, spec) as usize;
                matched.insert(node);
            } else {
                added.push(spec.clone());
            }
        }

        for &node in &current {
            if matched.contains(&node) || !self.tree.contains(node) {
                // An earlier deletion may have taken a nested node with it.
                continue;
            }
            let removed = self.tree.detach_test_like(node);
            stats.deleted += removed.len();
            self.bindings.purge(&removed);
        }

        // Insert modules before the tests that live in them, each group in
        // path order so parents always precede their children.
        let mut inline_modules: Vec<RunnableSpec> = Vec::new();
        let mut tests: Vec<RunnableSpec> = Vec::new();
        let mut declarations: Vec<RunnableSpec> = Vec::new();
        for spec in added {
            match spec.kind() {
                TestKind::Test => tests.push(spec),
                TestKind::Module => match spec.module_shape() {
                    ModuleShape::WithItems => inline_modules.push(spec),
                    ModuleShape::Declaration => declarations.push(spec),
                    ModuleShape::FileDefinition => {
                        unreachable!("file-definition modules are filtered before diffing")
                    }
                },
            }
        }
        inline_modules.sort_by(|a, b| a.path().cmp(b.path()));
        tests.sort_by(|a, b| a.path().cmp(b.path()));

        for spec in inline_modules {
            let parent = self.parent_module_for(&spec);
            let name = spec.name().to_string();
            let location = spec.test_location();
            let definition_file = spec.file().to_path_buf();
            self.tree.insert_module(parent, &name, location, definition_file, spec);
            stats.added += 1;
        }
        for spec in tests {
            let parent = self.parent_module_for(&spec);
            let name = spec.name().to_string();
            let location = spec.test_location();
            self.tree.insert_test(parent, &name, location, spec);
            stats.added += 1;
        }
        for spec in declarations {
            // A module that is merely referenced here; its definition lives
            // in another file, found through the definition lookup.
            let definition = self
                .source
                .module_definition(spec.location())
                .with_context(|| format!("no definition for module {:?}", spec.name()))?;
            let parent = self.parent_module_for(&spec);
            let name = spec.name().to_string();
            let location = spec.test_location();
            self.tree.insert_module(parent, &name, location, definition.file, spec);
            stats.added += 1;
        }

        Ok(stats)
    }

    fn parent_module_for(&self, spec: &RunnableSpec) -> NodeId {
        let node = self.tree.find_nearest_for(spec);
        assert_eq!(self.tree.kind(node), NodeKind::Module, "new nodes are inserted under a module");
        assert_eq!(
            self.tree.test_path(node),
            spec.parent_path(),
            "parent modules are inserted before their children"
        );
        node
    }

    /// Refresh a matched node's cached location and descriptor association.
    /// Returns whether the location actually changed.
    fn refresh_node(&mut self, node: NodeId, spec: &RunnableSpec) -> bool {
        let location = spec.test_location();
        match self.tree.kind(node) {
            NodeKind::Module => {
                let module = self.tree.module_mut(node);
                let changed = module.declaration != location;
                module.declaration = location;
                module.runnable = Some(spec.clone());
                changed
            }
            NodeKind::Test => {
                let test = self.tree.test_mut(node);
                let changed = test.location != location;
                test.location = location;
                test.runnable = Some(spec.clone());
                changed
            }
            other => panic!("cannot refresh node of kind {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::metadata::{PackageMetadata, TargetMetadata, WorkspaceMetadata};
    use crate::runnable::{Position, Runnable, RunnableArgs, RunnableLocation, TestLocation, TextRange};

    #[derive(Default)]
    struct FakeSource {
        runnables: HashMap<PathBuf, Vec<Runnable>>,
        /// Declaration file + declaration line → definition location.
        definitions: HashMap<(PathBuf, u32), TestLocation>,
        metadata: Vec<WorkspaceMetadata>,
    }

    impl SymbolSource for FakeSource {
        fn runnables_in_file(&mut self, file: &Path) -> Result<Vec<Runnable>> {
            Ok(self.runnables.get(file).cloned().unwrap_or_default())
        }

        fn module_definition(&mut self, declaration: &RunnableLocation) -> Result<TestLocation> {
            self.definitions
                .get(&(declaration.file.clone(), declaration.selection_range.start.line))
                .cloned()
                .context("no definition known for declaration")
        }

        fn workspace_metadata(&mut self) -> Result<Vec<WorkspaceMetadata>> {
            Ok(self.metadata.clone())
        }
    }

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> TextRange {
        TextRange {
            start: Position { line: sl, character: sc },
            end: Position { line: el, character: ec },
        }
    }

    fn lib_runnable(label: &str, file: &str, full: TextRange, sel: TextRange) -> Runnable {
        Runnable {
            label: label.to_string(),
            location: Some(RunnableLocation {
                file: file.into(),
                declaration_range: full,
                selection_range: sel,
            }),
            args: RunnableArgs {
                workspace_root: "/ws".into(),
                build_args: vec![
                    "test".into(),
                    "--package".into(),
                    "mylib:0.1.0".into(),
                    "--lib".into(),
                ],
                extra_args: vec![],
                program_args: vec![],
            },
        }
    }

    /// `mod name { .. }` spanning several lines.
    fn inline_module(label: &str, file: &str, line: u32) -> Runnable {
        lib_runnable(label, file, range(line, 0, line + 5, 1), range(line, 4, line, 9))
    }

    /// `mod name;` on one line.
    fn declaration_module(label: &str, file: &str, line: u32) -> Runnable {
        lib_runnable(label, file, range(line, 0, line, 10), range(line, 4, line, 9))
    }

    /// The file's own module: full range equals the name range.
    fn file_module(label: &str, file: &str) -> Runnable {
        let whole = range(0, 0, 50, 0);
        lib_runnable(label, file, whole, whole)
    }

    fn test_runnable(label: &str, file: &str, line: u32) -> Runnable {
        lib_runnable(label, file, range(line, 0, line + 2, 1), range(line, 7, line, 20))
    }

    fn workspace_metadata() -> Vec<WorkspaceMetadata> {
        vec![WorkspaceMetadata {
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
        }]
    }

    fn reconciler_with(source: FakeSource) -> Reconciler<FakeSource> {
        let mut reconciler = Reconciler::new(source);
        let metadata = workspace_metadata();
        reconciler.tree.init_from_metadata(&metadata);
        reconciler
    }

    fn mylib_target(reconciler: &Reconciler<FakeSource>) -> Option<NodeId> {
        let tree = reconciler.tree();
        let ws = tree.find_workspace(Path::new("/ws"))?;
        let pkg = tree.find_package(ws, "mylib")?;
        tree.find_target(pkg, TargetKind::Library, "mylib")
    }

    #[test]
    fn test_discovery_then_removal_round_trip() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                inline_module("test-mod mymod", "/ws/src/lib.rs", 3),
                test_runnable("test mymod::case_a", "/ws/src/lib.rs", 5),
            ],
        );
        let mut reconciler = reconciler_with(source);

        // No tests discovered yet, so no target node either.
        assert!(mylib_target(&reconciler).is_none());

        let stats = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(stats.added, 2);

        let target = mylib_target(&reconciler).expect("target springs into existence");
        let tree = reconciler.tree();
        let module = tree
            .find_exact_under_target(target, TestKind::Module, &["mymod".to_string()])
            .unwrap();
        let test = tree
            .find_exact_under_target(target, TestKind::Test, &["mymod".to_string(), "case_a".to_string()])
            .unwrap();
        assert_eq!(tree.test_path(test), ["mymod", "case_a"]);
        assert_eq!(tree.parent(test), Some(module));

        // The file empties out: module and test disappear, the target's
        // root module survives with no children.
        reconciler.source.runnables.insert("/ws/src/lib.rs".into(), vec![]);
        let stats = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(stats.deleted, 2);

        let tree = reconciler.tree();
        let target = mylib_target(&reconciler).expect("the target itself is not removed");
        let root = tree.target(target).root_module;
        assert!(tree.module(root).children.is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                inline_module("test-mod mymod", "/ws/src/lib.rs", 3),
                test_runnable("test mymod::case_a", "/ws/src/lib.rs", 5),
                test_runnable("test mymod::case_b", "/ws/src/lib.rs", 9),
            ],
        );
        let mut reconciler = reconciler_with(source);

        let first = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(first.added, 3);

        let second = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(second, ReconcileStats::default());
    }

    #[test]
    fn test_duplicate_descriptors_collapse_to_first() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                test_runnable("test copied", "/ws/src/lib.rs", 4),
                test_runnable("test copied", "/ws/src/lib.rs", 12),
            ],
        );
        let mut reconciler = reconciler_with(source);

        let stats = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(stats.added, 1);

        let target = mylib_target(&reconciler).unwrap();
        let tree = reconciler.tree();
        let test = tree
            .find_exact_under_target(target, TestKind::Test, &["copied".to_string()])
            .unwrap();
        // First occurrence wins.
        assert_eq!(tree.test(test).location.range.start.line, 4);
    }

    #[test]
    fn test_location_update_counts_only_real_changes() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                test_runnable("test case_a", "/ws/src/lib.rs", 4),
            ],
        );
        let mut reconciler = reconciler_with(source);
        reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();

        // The test moved two lines down.
        reconciler.source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                test_runnable("test case_a", "/ws/src/lib.rs", 6),
            ],
        );
        let stats = reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();
        assert_eq!(stats, ReconcileStats { updated: 1, ..Default::default() });

        let target = mylib_target(&reconciler).unwrap();
        let tree = reconciler.tree();
        let test = tree
            .find_exact_under_target(target, TestKind::Test, &["case_a".to_string()])
            .unwrap();
        assert_eq!(tree.test(test).location.range.start.line, 6);
    }

    #[test]
    fn test_declaration_module_points_at_its_definition_file() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                declaration_module("test-mod outer", "/ws/src/lib.rs", 2),
            ],
        );
        source.definitions.insert(
            ("/ws/src/lib.rs".into(), 2),
            TestLocation { file: "/ws/src/outer.rs".into(), range: TextRange::zero() },
        );
        let mut reconciler = reconciler_with(source);

        reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();

        let target = mylib_target(&reconciler).unwrap();
        let tree = reconciler.tree();
        let outer = tree
            .find_exact_under_target(target, TestKind::Module, &["outer".to_string()])
            .unwrap();
        assert_eq!(tree.module(outer).definition_file, Path::new("/ws/src/outer.rs"));
        assert_eq!(tree.module(outer).declaration.file, Path::new("/ws/src/lib.rs"));
        assert!(tree.module(outer).children.is_empty());
    }

    #[test]
    fn test_missing_ancestors_are_reconciled_from_their_own_files() {
        let mut source = FakeSource::default();
        // lib.rs declares `mod outer;`, outer.rs defines the module and a test.
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                declaration_module("test-mod outer", "/ws/src/lib.rs", 2),
            ],
        );
        source.runnables.insert(
            "/ws/src/outer.rs".into(),
            vec![
                file_module("test-mod outer", "/ws/src/outer.rs"),
                test_runnable("test outer::t1", "/ws/src/outer.rs", 7),
            ],
        );
        source.definitions.insert(
            ("/ws/src/lib.rs".into(), 2),
            TestLocation { file: "/ws/src/outer.rs".into(), range: TextRange::zero() },
        );
        let mut reconciler = reconciler_with(source);

        // Reconciling outer.rs first forces the ancestor chain (the target
        // and the `outer` module) to be materialized from lib.rs.
        reconciler.reconcile_file(Path::new("/ws/src/outer.rs")).unwrap();

        let target = mylib_target(&reconciler).unwrap();
        let tree = reconciler.tree();
        let t1 = tree
            .find_exact_under_target(target, TestKind::Test, &["outer".to_string(), "t1".to_string()])
            .unwrap();
        assert_eq!(tree.test_path(t1), ["outer", "t1"]);
    }

    #[test]
    fn test_resolve_queue_fills_declaration_modules_in_order() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                declaration_module("test-mod outer", "/ws/src/lib.rs", 2),
            ],
        );
        source.runnables.insert(
            "/ws/src/outer.rs".into(),
            vec![
                file_module("test-mod outer", "/ws/src/outer.rs"),
                test_runnable("test outer::t1", "/ws/src/outer.rs", 7),
            ],
        );
        source.definitions.insert(
            ("/ws/src/lib.rs".into(), 2),
            TestLocation { file: "/ws/src/outer.rs".into(), range: TextRange::zero() },
        );
        let mut reconciler = reconciler_with(source);
        reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();

        let target = mylib_target(&reconciler).unwrap();
        let outer = reconciler
            .tree()
            .find_exact_under_target(target, TestKind::Module, &["outer".to_string()])
            .unwrap();

        reconciler.request_resolve(outer);
        reconciler.request_resolve(outer); // second request is a no-op
        reconciler.drain_resolve_queue().unwrap();

        let tree = reconciler.tree();
        assert_eq!(tree.module(outer).children.len(), 1);
    }

    #[test]
    fn test_refresh_creates_only_targets_with_tests() {
        let mut source = FakeSource::default();
        let mut metadata = workspace_metadata();
        metadata[0].packages.push(PackageMetadata {
            name: "empty".into(),
            manifest_path: "/ws/empty/Cargo.toml".into(),
            targets: vec![TargetMetadata {
                name: "empty".into(),
                kind: vec!["lib".into()],
                src_path: "/ws/empty/src/lib.rs".into(),
            }],
        });
        source.metadata = metadata;
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                test_runnable("test case_a", "/ws/src/lib.rs", 4),
            ],
        );

        let mut reconciler = Reconciler::new(source);
        reconciler.refresh().unwrap();

        assert!(mylib_target(&reconciler).is_some());

        let tree = reconciler.tree();
        let ws = tree.find_workspace(Path::new("/ws")).unwrap();
        let empty = tree.find_package(ws, "empty").unwrap();
        assert!(tree.package(empty).targets.is_empty());
    }

    #[test]
    fn test_file_delete_trigger_purges_bindings() {
        let mut source = FakeSource::default();
        source.runnables.insert(
            "/ws/src/lib.rs".into(),
            vec![
                file_module("test-mod ", "/ws/src/lib.rs"),
                test_runnable("test case_a", "/ws/src/lib.rs", 4),
            ],
        );
        let mut reconciler = reconciler_with(source);
        reconciler.reconcile_file(Path::new("/ws/src/lib.rs")).unwrap();

        let target = mylib_target(&reconciler).unwrap();
        let test = reconciler
            .tree()
            .find_exact_under_target(target, TestKind::Test, &["case_a".to_string()])
            .unwrap();
        reconciler.bindings_mut().bind(test, "item-1".into());

        reconciler
            .handle_trigger(ReconcileTrigger::FileDeleted("/ws/src/lib.rs".into()))
            .unwrap();

        assert!(!reconciler.tree().contains(test));
        assert_eq!(reconciler.bindings().item_for(test), None);
    }
}
