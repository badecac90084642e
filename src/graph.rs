//! The build graph, a graph between nodes (files, directories, aliases and
//! values) and the builds that produce them.
//!
//! Nodes and builds live in arenas and refer to each other by id, so edges
//! can be declared before both ends are fully described.  Cycle detection is
//! a separate pass (`topo_order`) run before scheduling.

use crate::action::{self, Action};
use crate::canon::{canon_path, strip_dir};
use crate::densemap::{self, DenseMap};
use crate::scanner::Scanner;
use crate::variant::VariantDirs;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Id for Node entries in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// Id for Build entries in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BuildId(u32);
impl densemap::Index for BuildId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for BuildId {
    fn from(u: usize) -> BuildId {
        BuildId(u as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File,
    /// Building a directory builds everything beneath it.
    Dir,
    /// A phony name grouping other nodes.
    Alias,
    /// In-memory content; its signature is the digest of the bytes.
    Value(Vec<u8>),
}

/// Files and directories share one namespace; aliases and values each have
/// their own, so an alias named "docs" does not collide with a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Namespace {
    Fs,
    Alias,
    Value,
}

impl NodeKind {
    fn namespace(&self) -> Namespace {
        match self {
            NodeKind::File | NodeKind::Dir => Namespace::Fs,
            NodeKind::Alias => Namespace::Alias,
            NodeKind::Value(_) => Namespace::Value,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DepKind {
    /// Declared input; changes to it dirty the dependent.
    Explicit,
    /// Input that is not a declared source (headers, tools); also dirtying.
    Implicit,
    /// Must be built first, but changes to it do not dirty the dependent.
    OrderOnly,
    /// The dependency is a file the node's build mutates as a byproduct.
    /// Builds sharing a side effect never run concurrently.
    SideEffect,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeFlags {
    /// Do not delete the existing output before rebuilding it.
    pub precious: bool,
    /// Leave the output in place when cleaning.
    pub no_clean: bool,
    /// Rebuild on every run regardless of signatures.
    pub always_build: bool,
}

#[derive(Debug)]
pub struct Node {
    /// Canonical path for files and directories, plain name otherwise.
    pub name: String,
    pub kind: NodeKind,
    /// The build that produces this node, if any.
    pub producer: Option<BuildId>,
    pub flags: NodeFlags,
    /// For a node under a variant directory, the source-tree node it mirrors.
    pub srcnode: Option<NodeId>,
    explicit: Vec<NodeId>,
    implicit: Vec<NodeId>,
    order_only: Vec<NodeId>,
    side_effects: Vec<NodeId>,
    /// Inverse of side_effects: the nodes whose builds touch this one.
    side_effect_of: Vec<NodeId>,
}

impl Node {
    fn new(name: String, kind: NodeKind) -> Self {
        Node {
            name,
            kind,
            producer: None,
            flags: NodeFlags::default(),
            srcnode: None,
            explicit: Vec::new(),
            implicit: Vec::new(),
            order_only: Vec::new(),
            side_effects: Vec::new(),
            side_effect_of: Vec::new(),
        }
    }

    pub fn explicit_deps(&self) -> &[NodeId] {
        &self.explicit
    }
    pub fn implicit_deps(&self) -> &[NodeId] {
        &self.implicit
    }
    pub fn order_only_deps(&self) -> &[NodeId] {
        &self.order_only
    }
    pub fn side_effects(&self) -> &[NodeId] {
        &self.side_effects
    }
    /// The nodes whose builds touch this one as a side effect.
    pub fn side_effect_of(&self) -> &[NodeId] {
        &self.side_effect_of
    }
}

fn push_unique(list: &mut Vec<NodeId>, id: NodeId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// A unit of execution: one action run over a group of targets and sources.
/// A build with several targets is a batch; all of them share one outcome.
pub struct Build {
    /// None for phony groupings (aliases, directories), which never execute.
    pub action: Option<Arc<dyn Action>>,
    pub scanner: Option<Arc<dyn Scanner>>,
    /// Printed instead of the action's own description when set.
    pub desc: Option<String>,
    ins: Vec<NodeId>,
    outs: Vec<NodeId>,
    /// Created by freeze() rather than declared.
    synthetic: bool,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("phony", &self.action.is_none())
            .field("desc", &self.desc)
            .field("ins", &self.ins)
            .field("outs", &self.outs)
            .finish()
    }
}

impl Build {
    pub fn new(action: Arc<dyn Action>) -> Self {
        Build {
            action: Some(action),
            scanner: None,
            desc: None,
            ins: Vec::new(),
            outs: Vec::new(),
            synthetic: false,
        }
    }

    fn phony(out: NodeId) -> Self {
        Build {
            action: None,
            scanner: None,
            desc: None,
            ins: Vec::new(),
            outs: vec![out],
            synthetic: true,
        }
    }

    pub fn targets(mut self, outs: impl IntoIterator<Item = NodeId>) -> Self {
        self.outs.extend(outs);
        self
    }

    pub fn sources(mut self, ins: impl IntoIterator<Item = NodeId>) -> Self {
        self.ins.extend(ins);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Sources, in declaration order; these are what `$SOURCES` expands to.
    pub fn ins(&self) -> &[NodeId] {
        &self.ins
    }

    /// Targets, in declaration order.
    pub fn outs(&self) -> &[NodeId] {
        &self.outs
    }

    pub fn is_phony(&self) -> bool {
        self.action.is_none()
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("multiple builds produce {0:?}")]
    MultipleProducers(String),
    #[error("build declares no targets")]
    EmptyBuild,
    #[error("{}", missing_message(.0))]
    MissingSources(Vec<(String, String)>),
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    #[error("no path specified and no default")]
    NoTargets,
}

fn missing_message(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(src, by)| format!("source `{}' not found, needed by target `{}'", src, by))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Default)]
pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    builds: DenseMap<BuildId, Build>,
    lookup: FxHashMap<(Namespace, String), NodeId>,
    variants: VariantDirs,
    defaults: Vec<NodeId>,
    frozen: bool,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Returns the canonical node for an identity, creating it on first use.
    /// Files and directories are interned by canonical path.  Repeated calls
    /// return the same id and change nothing, even if `kind` differs.
    pub fn get_or_create(&mut self, identity: &str, kind: NodeKind) -> NodeId {
        let namespace = kind.namespace();
        let name = match namespace {
            Namespace::Fs => canon_path(identity),
            _ => identity.to_owned(),
        };
        // TODO: so many string copies; key the table by an interned symbol.
        if let Some(&id) = self.lookup.get(&(namespace, name.clone())) {
            return id;
        }
        let id = self.nodes.push(Node::new(name.clone(), kind));
        self.lookup.insert((namespace, name), id);
        self.frozen = false;
        id
    }

    pub fn file(&mut self, path: &str) -> NodeId {
        self.get_or_create(path, NodeKind::File)
    }

    pub fn dir(&mut self, path: &str) -> NodeId {
        self.get_or_create(path, NodeKind::Dir)
    }

    pub fn alias(&mut self, name: &str) -> NodeId {
        self.get_or_create(name, NodeKind::Alias)
    }

    /// Interns a value node and sets its content.
    pub fn value(&mut self, name: &str, content: impl Into<Vec<u8>>) -> NodeId {
        let content = content.into();
        let id = self.get_or_create(name, NodeKind::Value(content.clone()));
        self.nodes[id].kind = NodeKind::Value(content);
        id
    }

    /// Finds an existing node by path (canonicalized) or alias name.
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.lookup
            .get(&(Namespace::Fs, canon_path(name)))
            .or_else(|| self.lookup.get(&(Namespace::Alias, name.to_owned())))
            .copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn set_flags(&mut self, id: NodeId, flags: NodeFlags) {
        self.nodes[id].flags = flags;
    }

    /// Registers an edge from `node` to `dep`.  Cycles are not checked here;
    /// see topo_order().
    pub fn add_dependency(&mut self, node: NodeId, dep: NodeId, kind: DepKind) {
        let n = &mut self.nodes[node];
        match kind {
            DepKind::Explicit => push_unique(&mut n.explicit, dep),
            DepKind::Implicit => push_unique(&mut n.implicit, dep),
            DepKind::OrderOnly => push_unique(&mut n.order_only, dep),
            DepKind::SideEffect => {
                push_unique(&mut n.side_effects, dep);
                push_unique(&mut self.nodes[dep].side_effect_of, node);
            }
        }
        self.frozen = false;
    }

    /// Attaches a build to its targets.  Fails if a target already has a
    /// declared producer.
    pub fn add_build(&mut self, build: Build) -> Result<BuildId, GraphError> {
        if build.outs.is_empty() {
            return Err(GraphError::EmptyBuild);
        }
        for &out in &build.outs {
            if let Some(b) = self.nodes[out].producer {
                if !self.builds[b].synthetic {
                    return Err(GraphError::MultipleProducers(self.nodes[out].name.clone()));
                }
            }
        }
        let id = self.builds.next_id();
        for &out in &build.outs {
            if let Some(old) = self.nodes[out].producer {
                // Replacing a grouping that freeze() made up.
                self.builds[old].outs.retain(|&o| o != out);
            }
            self.nodes[out].producer = Some(id);
        }
        self.builds.push(build);
        self.frozen = false;
        Ok(id)
    }

    pub fn build(&self, id: BuildId) -> &Build {
        &self.builds[id]
    }

    pub fn builds(&self) -> impl Iterator<Item = (BuildId, &Build)> {
        self.builds.iter()
    }

    pub fn build_count(&self) -> usize {
        self.builds.len()
    }

    pub fn variant_dir(&mut self, variant: &str, src: &str, duplicate: bool) {
        self.variants.add(variant, src, duplicate);
        self.frozen = false;
    }

    pub fn add_default(&mut self, id: NodeId) {
        if !self.defaults.contains(&id) {
            self.defaults.push(id);
        }
    }

    pub fn defaults(&self) -> &[NodeId] {
        &self.defaults
    }

    /// Whether a real action (not a grouping) produces this node.
    pub fn is_derived(&self, id: NodeId) -> bool {
        match self.nodes[id].producer {
            Some(b) => !self.builds[b].is_phony(),
            None => false,
        }
    }

    /// The path to read for a node's current content: a variant-directory
    /// node that is not duplicated reads from its source.
    pub fn disk_path(&self, id: NodeId) -> &str {
        let node = &self.nodes[id];
        match node.srcnode {
            Some(src) if !self.is_derived(id) => &self.nodes[src].name,
            _ => &node.name,
        }
    }

    /// Resolves derived structure so the graph can be scheduled: maps
    /// variant-directory sources, attaches directory children and wraps every
    /// non-built node that has dependencies in a phony build.
    pub fn freeze(&mut self) -> Result<(), GraphError> {
        if self.frozen {
            return Ok(());
        }
        self.link_variants()?;
        self.link_dir_children();

        let ids: Vec<NodeId> = self.nodes.ids().collect();
        for id in ids {
            if self.nodes[id].producer.is_some() {
                continue;
            }
            let node = &self.nodes[id];
            let grouping = matches!(node.kind, NodeKind::Alias | NodeKind::Dir)
                || !node.explicit.is_empty()
                || !node.implicit.is_empty()
                || !node.order_only.is_empty()
                || !node.side_effect_of.is_empty()
                || node.srcnode.is_some();
            if grouping {
                let b = self.builds.push(Build::phony(id));
                self.nodes[id].producer = Some(b);
            }
        }
        self.frozen = true;
        Ok(())
    }

    fn link_variants(&mut self) -> Result<(), GraphError> {
        if self.variants.is_empty() {
            return Ok(());
        }
        let ids: Vec<NodeId> = self.nodes.ids().collect();
        for id in ids {
            let node = &self.nodes[id];
            if node.kind != NodeKind::File || node.producer.is_some() || node.srcnode.is_some() {
                continue;
            }
            let mapping = match self.variants.source_for(&node.name) {
                Some(m) => m,
                None => continue,
            };
            let src = self.file(&mapping.src_path);
            self.nodes[id].srcnode = Some(src);
            if mapping.duplicate {
                let mut copy = Build::new(Arc::new(action::Copy)).targets([id]).sources([src]);
                copy.synthetic = true;
                self.add_build(copy)?;
            }
        }
        Ok(())
    }

    fn link_dir_children(&mut self) {
        let dirs: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::Dir && n.producer.is_none())
            .map(|(id, _)| id)
            .collect();
        for dir in dirs {
            let dir_name = self.nodes[dir].name.clone();
            let children: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(id, n)| {
                    *id != dir
                        && matches!(n.kind, NodeKind::File | NodeKind::Dir)
                        && strip_dir(&n.name, &dir_name).is_some()
                })
                .map(|(id, _)| id)
                .collect();
            for child in children {
                push_unique(&mut self.nodes[dir].implicit, child);
            }
        }
    }

    /// The prerequisites of a build with the kind of each edge, deduplicated,
    /// in declaration order: sources first, then each target's own edges.
    pub fn build_prereqs(&self, id: BuildId) -> Vec<(NodeId, DepKind)> {
        let build = &self.builds[id];
        let mut seen: FxHashSet<NodeId> = build.outs.iter().copied().collect();
        let mut out = Vec::new();
        let mut add = |dep: NodeId, kind: DepKind| {
            if seen.insert(dep) {
                out.push((dep, kind));
            }
        };
        for &dep in &build.ins {
            add(dep, DepKind::Explicit);
        }
        for &target in &build.outs {
            let node = &self.nodes[target];
            if let Some(src) = node.srcnode {
                if build.is_phony() {
                    add(src, DepKind::Explicit);
                }
            }
            for &dep in &node.explicit {
                add(dep, DepKind::Explicit);
            }
            for &dep in &node.implicit {
                add(dep, DepKind::Implicit);
            }
            for &dep in &node.order_only {
                add(dep, DepKind::OrderOnly);
            }
            for &dep in &node.side_effect_of {
                add(dep, DepKind::OrderOnly);
            }
        }
        out
    }

    /// The side-effect nodes touched by running a build.
    pub fn build_side_effects(&self, id: BuildId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for &target in &self.builds[id].outs {
            for &se in &self.nodes[target].side_effects {
                push_unique(&mut out, se);
            }
        }
        out
    }

    /// Nodes a node directly waits on.
    pub fn edges(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id];
        match node.producer {
            Some(b) => self.build_prereqs(b).into_iter().map(|(d, _)| d).collect(),
            None => {
                let mut out = Vec::new();
                let groups = [
                    &node.explicit,
                    &node.implicit,
                    &node.order_only,
                    &node.side_effect_of,
                ];
                for &dep in groups.into_iter().flatten().chain(node.srcnode.iter()) {
                    if dep != id {
                        push_unique(&mut out, dep);
                    }
                }
                out
            }
        }
    }

    /// A build order (dependencies first) over everything reachable from
    /// `roots`.  Siblings are visited in declaration order, so the result is
    /// stable for a given graph.  Any cycle is an error naming its members.
    pub fn topo_order(&self, roots: &[NodeId]) -> Result<Vec<NodeId>, GraphError> {
        struct Frame {
            id: NodeId,
            children: Vec<NodeId>,
            next: usize,
        }
        // false while on the stack, true once finished.
        let mut done: FxHashMap<NodeId, bool> = FxHashMap::default();
        let mut order = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        for &root in roots {
            if done.contains_key(&root) {
                continue;
            }
            done.insert(root, false);
            stack.push(Frame {
                id: root,
                children: self.edges(root),
                next: 0,
            });
            while let Some(top) = stack.last_mut() {
                if top.next < top.children.len() {
                    let child = top.children[top.next];
                    top.next += 1;
                    match done.get(&child) {
                        None => {
                            done.insert(child, false);
                            stack.push(Frame {
                                id: child,
                                children: self.edges(child),
                                next: 0,
                            });
                        }
                        Some(false) => {
                            let start = stack.iter().position(|f| f.id == child).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|f| self.nodes[f.id].name.clone())
                                .collect();
                            cycle.push(self.nodes[child].name.clone());
                            return Err(GraphError::Cycle(cycle));
                        }
                        Some(true) => {}
                    }
                } else {
                    let id = top.id;
                    stack.pop();
                    done.insert(id, true);
                    order.push(id);
                }
            }
        }
        Ok(order)
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        self.walk(from, Order::Pre).any(|v| v.id == to)
    }

    pub fn walk(&self, root: NodeId, order: Order) -> Walk<'_> {
        Walk {
            graph: self,
            order,
            root: Some(root),
            stack: Vec::new(),
            visited: FxHashSet::default(),
        }
    }

    /// Renders the dependency tree under `root`, one node per line.  A node
    /// already shown elsewhere is printed in brackets and not expanded.
    pub fn render_tree(&self, root: NodeId) -> String {
        let mut out = String::new();
        for visit in self.walk(root, Order::Pre) {
            for _ in 0..visit.depth {
                out.push_str("  ");
            }
            out.push_str("+-");
            let name = &self.nodes[visit.id].name;
            if visit.repeat {
                out.push('[');
                out.push_str(name);
                out.push(']');
            } else {
                out.push_str(name);
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// A node before its dependencies.
    Pre,
    /// A node after its dependencies.
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    pub id: NodeId,
    pub depth: usize,
    /// Pre-order only: the node was already yielded via another path.
    pub repeat: bool,
}

struct Frame {
    id: NodeId,
    depth: usize,
    children: Vec<NodeId>,
    next: usize,
}

/// Lazy depth-first traversal over the arena with an explicit stack.  Each
/// node is expanded at most once, so it terminates on cyclic graphs too.
pub struct Walk<'a> {
    graph: &'a Graph,
    order: Order,
    root: Option<NodeId>,
    stack: Vec<Frame>,
    visited: FxHashSet<NodeId>,
}

impl Iterator for Walk<'_> {
    type Item = Visit;

    fn next(&mut self) -> Option<Visit> {
        if let Some(root) = self.root.take() {
            self.visited.insert(root);
            self.stack.push(Frame {
                id: root,
                depth: 0,
                children: self.graph.edges(root),
                next: 0,
            });
            if self.order == Order::Pre {
                return Some(Visit {
                    id: root,
                    depth: 0,
                    repeat: false,
                });
            }
        }
        loop {
            let top = self.stack.last_mut()?;
            if top.next < top.children.len() {
                let child = top.children[top.next];
                top.next += 1;
                let depth = top.depth + 1;
                if !self.visited.insert(child) {
                    if self.order == Order::Pre {
                        return Some(Visit {
                            id: child,
                            depth,
                            repeat: true,
                        });
                    }
                    continue;
                }
                self.stack.push(Frame {
                    id: child,
                    depth,
                    children: self.graph.edges(child),
                    next: 0,
                });
                if self.order == Order::Pre {
                    return Some(Visit {
                        id: child,
                        depth,
                        repeat: false,
                    });
                }
            } else {
                let frame = self.stack.pop()?;
                if self.order == Order::Post {
                    return Some(Visit {
                        id: frame.id,
                        depth: frame.depth,
                        repeat: false,
                    });
                }
            }
        }
    }
}
