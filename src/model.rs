//! Test model tree
//!
//! The in-memory hierarchy of everything runnable in a workspace:
//! workspace → package → target → test module → test. Nodes live in an
//! arena keyed by stable ids; a parent owns the list of its children's ids
//! and a child holds a non-owning parent id, so ownership stays
//! single-directional.
//!
//! Workspaces and packages only change on a full metadata refresh. Targets
//! appear lazily, when the first test belonging to them is discovered, and
//! each target carries one synthetic root test module (empty name) for the
//! tests written directly in the target's entry file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::metadata::{DeclaredTarget, TargetKind, WorkspaceMetadata};
use crate::runnable::{RunnableSpec, TestKind, TestLocation};

/// Stable identity of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Workspace,
    Package,
    Target,
    Module,
    Test,
}

#[derive(Debug)]
pub struct WorkspaceNode {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub members: Vec<NodeId>,
}

#[derive(Debug)]
pub struct PackageNode {
    pub name: String,
    pub manifest_path: PathBuf,
    /// Targets as declared by build metadata. Retained so lazy target
    /// creation and full refresh know each target's entry file; target
    /// *nodes* are only created once a test of theirs exists.
    pub declared_targets: Vec<DeclaredTarget>,
    pub targets: Vec<NodeId>,
}

#[derive(Debug)]
pub struct TargetNode {
    pub name: String,
    pub kind: TargetKind,
    pub src_path: PathBuf,
    pub root_module: NodeId,
}

#[derive(Debug)]
pub struct ModuleNode {
    /// Empty iff this is a target's synthetic root module.
    pub name: String,
    /// Where the module is referenced (file + name range).
    pub declaration: TestLocation,
    /// The file whose contents define the module's children. Differs from
    /// the declaration file for `mod foo;` style modules.
    pub definition_file: PathBuf,
    pub children: Vec<NodeId>,
    pub runnable: Option<RunnableSpec>,
}

#[derive(Debug)]
pub struct TestNode {
    pub name: String,
    pub location: TestLocation,
    pub runnable: Option<RunnableSpec>,
}

#[derive(Debug)]
pub enum NodeData {
    Workspace(WorkspaceNode),
    Package(PackageNode),
    Target(TargetNode),
    Module(ModuleNode),
    Test(TestNode),
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub data: NodeData,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::Workspace(_) => NodeKind::Workspace,
            NodeData::Package(_) => NodeKind::Package,
            NodeData::Target(_) => NodeKind::Target,
            NodeData::Module(_) => NodeKind::Module,
            NodeData::Test(_) => NodeKind::Test,
        }
    }
}

/// The tree itself. Explicitly constructed and owned by whoever drives
/// reconciliation and execution; never ambient state.
#[derive(Debug, Default)]
pub struct TestModelTree {
    nodes: HashMap<NodeId, Node>,
    roots: Vec<NodeId>,
    next_id: u32,
}

impl TestModelTree {
    pub fn new() -> TestModelTree {
        TestModelTree::default()
    }

    /// Drop all workspace roots. Used right before a full refresh.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    /// Populate workspace and package nodes from build metadata. Declared
    /// targets are retained as metadata on the package; no target, module
    /// or test nodes are created here.
    pub fn init_from_metadata(&mut self, workspaces: &[WorkspaceMetadata]) {
        for ws in workspaces {
            let manifest_path = ws.workspace_root.join("Cargo.toml");
            let ws_id = self.alloc(
                None,
                NodeData::Workspace(WorkspaceNode {
                    root: ws.workspace_root.clone(),
                    manifest_path,
                    members: Vec::new(),
                }),
            );
            self.roots.push(ws_id);

            for pkg in &ws.packages {
                let pkg_id = self.alloc(
                    Some(ws_id),
                    NodeData::Package(PackageNode {
                        name: pkg.name.clone(),
                        manifest_path: pkg.manifest_path.clone(),
                        declared_targets: DeclaredTarget::from_metadata(&pkg.targets),
                        targets: Vec::new(),
                    }),
                );
                self.workspace_mut(ws_id).members.push(pkg_id);
            }
        }
    }

    pub fn workspaces(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("node id is stale")
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    fn alloc(&mut self, parent: Option<NodeId>, data: NodeData) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node { id, parent, data });
        id
    }

    // Typed accessors. A kind mismatch is a walk gone wrong, not a
    // recoverable condition.

    pub fn workspace(&self, id: NodeId) -> &WorkspaceNode {
        match &self.node(id).data {
            NodeData::Workspace(w) => w,
            other => panic!("expected workspace node, found {:?}", kind_of(other)),
        }
    }

    fn workspace_mut(&mut self, id: NodeId) -> &mut WorkspaceNode {
        match &mut self.nodes.get_mut(&id).expect("node id is stale").data {
            NodeData::Workspace(w) => w,
            other => panic!("expected workspace node, found {:?}", kind_of(other)),
        }
    }

    pub fn package(&self, id: NodeId) -> &PackageNode {
        match &self.node(id).data {
            NodeData::Package(p) => p,
            other => panic!("expected package node, found {:?}", kind_of(other)),
        }
    }

    fn package_mut(&mut self, id: NodeId) -> &mut PackageNode {
        match &mut self.nodes.get_mut(&id).expect("node id is stale").data {
            NodeData::Package(p) => p,
            other => panic!("expected package node, found {:?}", kind_of(other)),
        }
    }

    pub fn target(&self, id: NodeId) -> &TargetNode {
        match &self.node(id).data {
            NodeData::Target(t) => t,
            other => panic!("expected target node, found {:?}", kind_of(other)),
        }
    }

    pub fn module(&self, id: NodeId) -> &ModuleNode {
        match &self.node(id).data {
            NodeData::Module(m) => m,
            other => panic!("expected module node, found {:?}", kind_of(other)),
        }
    }

    pub fn module_mut(&mut self, id: NodeId) -> &mut ModuleNode {
        match &mut self.nodes.get_mut(&id).expect("node id is stale").data {
            NodeData::Module(m) => m,
            other => panic!("expected module node, found {:?}", kind_of(other)),
        }
    }

    pub fn test(&self, id: NodeId) -> &TestNode {
        match &self.node(id).data {
            NodeData::Test(t) => t,
            other => panic!("expected test node, found {:?}", kind_of(other)),
        }
    }

    pub fn test_mut(&mut self, id: NodeId) -> &mut TestNode {
        match &mut self.nodes.get_mut(&id).expect("node id is stale").data {
            NodeData::Test(t) => t,
            other => panic!("expected test node, found {:?}", kind_of(other)),
        }
    }

    pub fn is_test_like(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Module | NodeKind::Test)
    }

    /// Whether `id` is the synthetic root module of a target.
    pub fn is_root_module(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Module)
            && self
                .parent(id)
                .is_some_and(|p| self.kind(p) == NodeKind::Target)
    }

    fn node_name(&self, id: NodeId) -> &str {
        match &self.node(id).data {
            NodeData::Module(m) => &m.name,
            NodeData::Test(t) => &t.name,
            other => panic!("node kind {:?} has no test-like name", kind_of(other)),
        }
    }

    // Lookups

    pub fn find_workspace(&self, root: &Path) -> Option<NodeId> {
        self.roots
            .iter()
            .copied()
            .find(|&id| self.workspace(id).root == root)
    }

    pub fn find_package(&self, workspace: NodeId, name: &str) -> Option<NodeId> {
        self.workspace(workspace)
            .members
            .iter()
            .copied()
            .find(|&id| self.package(id).name == name)
    }

    pub fn find_target(&self, package: NodeId, kind: TargetKind, name: &str) -> Option<NodeId> {
        self.package(package)
            .targets
            .iter()
            .copied()
            .find(|&id| {
                let t = self.target(id);
                t.kind == kind && t.name == name
            })
    }

    /// Deepest existing node along workspace → package → target → module
    /// segments → leaf. Stops at the first missing segment. The workspace
    /// must exist; everything below it may be missing.
    pub fn find_nearest(
        &self,
        workspace_root: &Path,
        package: &str,
        target_kind: TargetKind,
        target_name: &str,
        path: &[String],
        leaf: TestKind,
    ) -> NodeId {
        let ws = self
            .find_workspace(workspace_root)
            .unwrap_or_else(|| panic!("unknown workspace root {}", workspace_root.display()));

        let Some(pkg) = self.find_package(ws, package) else {
            return ws;
        };
        let Some(target) = self.find_target(pkg, target_kind, target_name) else {
            return pkg;
        };

        self.find_test_like_under_target(target, leaf, path)
    }

    pub fn find_nearest_for(&self, spec: &RunnableSpec) -> NodeId {
        self.find_nearest(
            spec.workspace_root(),
            spec.package(),
            spec.target_kind(),
            spec.target_name(),
            spec.path(),
            spec.kind(),
        )
    }

    /// Walk `path` down from the target's root module, matching children by
    /// (kind, name): intermediate segments must be modules, the last one
    /// matches `leaf`. Returns the deepest module reached when a segment is
    /// missing. Duplicate (kind, name) children collapse to the first one.
    pub fn find_test_like_under_target(
        &self,
        target: NodeId,
        leaf: TestKind,
        path: &[String],
    ) -> NodeId {
        let mut current = self.target(target).root_module;

        for (index, segment) in path.iter().enumerate() {
            let is_last = index == path.len() - 1;
            let wanted = if is_last { leaf } else { TestKind::Module };

            let candidate = self
                .module(current)
                .children
                .iter()
                .copied()
                .find(|&c| kind_matches(self.kind(c), wanted) && self.node_name(c) == segment);

            match candidate {
                None => return current,
                Some(c) if is_last => return c,
                Some(c) => {
                    assert_eq!(self.kind(c), NodeKind::Module, "intermediate path segment is not a module");
                    current = c;
                }
            }
        }

        current
    }

    /// Exact-path lookup under a target; `None` when any segment is missing.
    pub fn find_exact_under_target(
        &self,
        target: NodeId,
        leaf: TestKind,
        path: &[String],
    ) -> Option<NodeId> {
        let found = self.find_test_like_under_target(target, leaf, path);
        if self.test_path(found) == path && kind_matches(self.kind(found), leaf) {
            Some(found)
        } else {
            None
        }
    }

    /// Concatenation of ancestor module names down to the node itself. The
    /// synthetic root module's path is empty.
    pub fn test_path(&self, id: NodeId) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            if self.is_root_module(current) {
                break;
            }
            segments.push(self.node_name(current).to_string());
            current = self.parent(current).expect("test-like node has a parent");
        }
        segments.reverse();
        segments
    }

    /// Nearest enclosing target, if the node is at or below one.
    pub fn target_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        loop {
            match self.kind(current) {
                NodeKind::Target => return Some(current),
                NodeKind::Workspace | NodeKind::Package => return None,
                _ => current = self.parent(current)?,
            }
        }
    }

    /// Nearest enclosing package. Panics above package level.
    pub fn package_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        loop {
            match self.kind(current) {
                NodeKind::Package => return current,
                NodeKind::Workspace => panic!("node is above package level"),
                _ => current = self.parent(current).expect("node below package has a parent"),
            }
        }
    }

    // Mutation

    /// Create a target node (with its synthetic root module) under a
    /// package. The root module carries a synthetic runnable scoping the
    /// whole target so target-level runs have an invocation to build from.
    pub fn create_target(
        &mut self,
        package: NodeId,
        kind: TargetKind,
        name: &str,
        src_path: &Path,
    ) -> NodeId {
        let ws = self.parent(package).expect("package has a workspace parent");
        let workspace_root = self.workspace(ws).root.clone();
        let package_name = self.package(package).name.clone();

        let target_id = self.alloc(
            Some(package),
            NodeData::Target(TargetNode {
                name: name.to_string(),
                kind,
                src_path: src_path.to_path_buf(),
                // patched right below, once the module is allocated
                root_module: NodeId(u32::MAX),
            }),
        );

        let root_runnable =
            RunnableSpec::target_scope(&package_name, kind, name, &workspace_root, src_path);
        let root_module = self.alloc(
            Some(target_id),
            NodeData::Module(ModuleNode {
                name: String::new(),
                declaration: TestLocation {
                    file: src_path.to_path_buf(),
                    range: crate::runnable::TextRange::zero(),
                },
                definition_file: src_path.to_path_buf(),
                children: Vec::new(),
                runnable: Some(root_runnable),
            }),
        );

        match &mut self.nodes.get_mut(&target_id).expect("just created").data {
            NodeData::Target(t) => t.root_module = root_module,
            _ => unreachable!(),
        }
        self.package_mut(package).targets.push(target_id);

        target_id
    }

    /// Insert a module under a parent module, keeping children name-sorted
    /// so declaration-before-use ordering stays stable.
    pub fn insert_module(
        &mut self,
        parent: NodeId,
        name: &str,
        declaration: TestLocation,
        definition_file: PathBuf,
        runnable: RunnableSpec,
    ) -> NodeId {
        let id = self.alloc(
            Some(parent),
            NodeData::Module(ModuleNode {
                name: name.to_string(),
                declaration,
                definition_file,
                children: Vec::new(),
                runnable: Some(runnable),
            }),
        );
        self.insert_child_sorted(parent, id);
        id
    }

    pub fn insert_test(
        &mut self,
        parent: NodeId,
        name: &str,
        location: TestLocation,
        runnable: RunnableSpec,
    ) -> NodeId {
        let id = self.alloc(
            Some(parent),
            NodeData::Test(TestNode {
                name: name.to_string(),
                location,
                runnable: Some(runnable),
            }),
        );
        self.insert_child_sorted(parent, id);
        id
    }

    fn insert_child_sorted(&mut self, parent: NodeId, child: NodeId) {
        let name = self.node_name(child).to_string();
        let children = &self.module(parent).children;
        let position = children
            .iter()
            .position(|&c| self.node_name(c) > name.as_str())
            .unwrap_or(children.len());
        self.module_mut(parent).children.insert(position, child);
    }

    /// All test-like descendants of a module, the module itself excluded.
    pub fn test_likes_under(&self, module: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_test_likes(module, &mut out);
        out
    }

    fn collect_test_likes(&self, module: NodeId, out: &mut Vec<NodeId>) {
        for &child in &self.module(module).children {
            out.push(child);
            if self.kind(child) == NodeKind::Module {
                self.collect_test_likes(child, out);
            }
        }
    }

    /// Every leaf test at or below `node`.
    pub fn leaf_tests_under(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves(node, &mut out);
        out
    }

    fn collect_leaves(&self, node: NodeId, out: &mut Vec<NodeId>) {
        match &self.node(node).data {
            NodeData::Workspace(w) => {
                for &m in &w.members {
                    self.collect_leaves(m, out);
                }
            }
            NodeData::Package(p) => {
                for &t in &p.targets {
                    self.collect_leaves(t, out);
                }
            }
            NodeData::Target(t) => self.collect_leaves(t.root_module, out),
            NodeData::Module(m) => {
                for &c in &m.children {
                    self.collect_leaves(c, out);
                }
            }
            NodeData::Test(_) => out.push(node),
        }
    }

    /// Test modules whose definition file equals `file`. Matching modules
    /// are not descended into, so matches are never nested in each other.
    pub fn modules_defined_in(&self, file: &Path) -> Vec<NodeId> {
        let mut out = Vec::new();
        for &ws in &self.roots {
            for &pkg in &self.workspace(ws).members {
                for &target in &self.package(pkg).targets {
                    self.match_modules(self.target(target).root_module, file, &mut out);
                }
            }
        }
        out
    }

    fn match_modules(&self, module: NodeId, file: &Path, out: &mut Vec<NodeId>) {
        if self.module(module).definition_file == file {
            out.push(module);
            return;
        }
        for &child in &self.module(module).children {
            if self.kind(child) == NodeKind::Module {
                self.match_modules(child, file, out);
            }
        }
    }

    /// Remove a test or module (with its whole subtree) from its parent.
    /// No cascade; emptied ancestors stay. Returns the ids dropped from the
    /// arena so side tables can purge them.
    pub fn detach_test_like(&mut self, id: NodeId) -> Vec<NodeId> {
        assert!(self.is_test_like(id), "only tests and modules can be removed");
        assert!(!self.is_root_module(id), "a target's root module is never removed");

        let parent = self.parent(id).expect("test-like node has a parent");
        let index = self
            .module(parent)
            .children
            .iter()
            .position(|&c| c == id)
            .expect("node must be in its parent's children");
        self.module_mut(parent).children.remove(index);

        let mut removed = Vec::new();
        self.drop_subtree(id, &mut removed);
        removed
    }

    /// [`TestModelTree::detach_test_like`], then remove ancestor modules
    /// that became empty. Never removes a target's synthetic root module,
    /// nor anything above it.
    pub fn remove_test_like(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut current = id;
        loop {
            let parent = self.parent(current).expect("test-like node has a parent");
            removed.extend(self.detach_test_like(current));

            if self.is_root_module(parent) || !self.module(parent).children.is_empty() {
                break;
            }
            current = parent;
        }
        removed
    }

    fn drop_subtree(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        let children = match &self.node(id).data {
            NodeData::Module(m) => m.children.clone(),
            _ => Vec::new(),
        };
        for child in children {
            self.drop_subtree(child, removed);
        }
        self.nodes.remove(&id);
        removed.push(id);
    }

    /// Drop everything the file defines: each matching module loses its
    /// whole child set; non-root matches are removed themselves and empty
    /// ancestors cascade away, stopping at the target boundary. The target
    /// and its root module survive, emptied.
    pub fn remove_subtree_for_file(&mut self, file: &Path) -> Vec<NodeId> {
        let mut removed = Vec::new();
        for module in self.modules_defined_in(file) {
            if !self.contains(module) {
                continue;
            }
            if self.is_root_module(module) {
                for child in self.module(module).children.clone() {
                    removed.extend(self.remove_test_like(child));
                }
            } else {
                removed.extend(self.remove_test_like(module));
            }
        }
        removed
    }

    /// The runnable to execute for a node. Modules and tests carry their
    /// own; a target delegates to its root module; a package gets a
    /// synthetic invocation covering all its targets.
    pub fn runnable_for(&self, id: NodeId) -> RunnableSpec {
        match &self.node(id).data {
            NodeData::Workspace(_) => panic!("workspace-level runs are not supported"),
            NodeData::Package(p) => {
                let ws = self.parent(id).expect("package has a workspace parent");
                RunnableSpec::package_scope(&p.name, &self.workspace(ws).root, &p.manifest_path)
            }
            NodeData::Target(t) => self
                .module(t.root_module)
                .runnable
                .clone()
                .expect("root module carries a target-scope runnable"),
            NodeData::Module(m) => m.runnable.clone().expect("module has an associated runnable"),
            NodeData::Test(t) => t.runnable.clone().expect("test has an associated runnable"),
        }
    }
}

fn kind_matches(kind: NodeKind, wanted: TestKind) -> bool {
    match wanted {
        TestKind::Test => kind == NodeKind::Test,
        TestKind::Module => kind == NodeKind::Module,
    }
}

fn kind_of(data: &NodeData) -> NodeKind {
    match data {
        NodeData::Workspace(_) => NodeKind::Workspace,
        NodeData::Package(_) => NodeKind::Package,
        NodeData::Target(_) => NodeKind::Target,
        NodeData::Module(_) => NodeKind::Module,
        NodeData::Test(_) => NodeKind::Test,
    }
}
