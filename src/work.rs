//! Build runner, choosing and executing tasks as determined by out of date
//! inputs.
//!
//! All bookkeeping happens on the thread calling run(): wanting builds,
//! examining them against the signature store, and recording results.  Only
//! action execution is handed to the Runner's workers.

use crate::action::Invocation;
use crate::context::BuildContext;
use crate::decider::{
    BuildInfo, DecideError, DeciderKind, Decision, Inputs, NodeInfo, Reason, Sample,
};
use crate::densemap::DenseMap;
use crate::fs::{MTime, Stamp};
use crate::graph::{BuildId, DepKind, Graph, GraphError, NodeId, NodeKind, Order};
use crate::hash::{digest, ContentHash, SigHasher};
use crate::process::Termination;
use crate::progress::{Progress, TaskMessage};
use crate::scanner::Scanner;
use crate::store::SignatureStore;
use crate::task::{FinishedTask, Job, Runner};
use crate::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    /// Default initial state, for builds unneeded by the current run.
    Unknown,
    /// Builds we want to ensure are up to date, but which aren't ready yet.
    Want,
    /// Prerequisites are all finished; waiting to be examined, or examined
    /// and held back by a side-effect conflict.
    Ready,
    /// Currently executing.
    Running,
    /// Examined and found current; nothing ran.
    UpToDate,
    /// Ran successfully (or would have, in a dry run).
    Done,
    Failed,
    /// Not attempted because a prerequisite failed.
    Skipped,
}

impl BuildState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::UpToDate | BuildState::Done | BuildState::Failed | BuildState::Skipped
        )
    }

    fn is_blocked(self) -> bool {
        matches!(self, BuildState::Failed | BuildState::Skipped)
    }
}

// Counters that track builds in each state, excluding builds in the
// "unknown" state.  This is used by progress when printing.
#[derive(Clone, Debug, Default)]
pub struct StateCounts([usize; 8]);

impl StateCounts {
    pub fn add(&mut self, state: BuildState, delta: isize) {
        let slot = &mut self.0[state as usize];
        *slot = (*slot as isize + delta) as usize;
    }

    pub fn get(&self, state: BuildState) -> usize {
        self.0[state as usize]
    }

    pub fn total(&self) -> usize {
        self.0[1..].iter().sum()
    }
}

struct BuildStates {
    states: DenseMap<BuildId, BuildState>,
    counts: StateCounts,
}

impl BuildStates {
    fn new(size: usize) -> Self {
        BuildStates {
            states: DenseMap::filled(size, BuildState::Unknown),
            counts: StateCounts::default(),
        }
    }

    fn get(&self, id: BuildId) -> BuildState {
        self.states.get_or(id, BuildState::Unknown)
    }

    fn set(&mut self, id: BuildId, state: BuildState) {
        let prev = self.get(id);
        if prev != BuildState::Unknown {
            self.counts.add(prev, -1);
        }
        self.states.set_grow(id, state, BuildState::Unknown);
        self.counts.add(state, 1);
    }
}

/// A target that failed to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// The first target of the failed build.
    pub target: String,
    /// Exit code of the external process, if one ran.
    pub exit_code: Option<i32>,
    pub message: String,
}

/// The outcome of a run.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    /// Actions run (or that would run, in a dry run).
    pub executed: usize,
    /// Builds examined and found current.
    pub up_to_date: usize,
    pub failed: Vec<Failure>,
    /// Targets not attempted because a prerequisite failed.
    pub skipped: Vec<String>,
    pub interrupted: bool,
}

impl Summary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// A dirtying dependency: a graph node, or a scanned path the graph never
/// declared.
#[derive(Clone, Debug)]
struct Dep {
    name: String,
    node: Option<NodeId>,
}

/// The current state of a dependency or target, handed to the decider.
enum NodeSample<'a> {
    File {
        ctx: &'a BuildContext,
        path: String,
        stamp: Option<Stamp>,
    },
    /// Nodes without on-disk presence: aliases, directories and values.
    Fixed(ContentHash),
    /// State captured before a build's action ran.
    Recorded { name: String, info: NodeInfo },
}

impl Sample for NodeSample<'_> {
    fn stamp(&self) -> Option<Stamp> {
        match self {
            NodeSample::File { stamp, .. } => *stamp,
            NodeSample::Fixed(_) => None,
            NodeSample::Recorded { info, .. } => info.stamp,
        }
    }

    fn csig(&self) -> Result<ContentHash, DecideError> {
        match self {
            NodeSample::File { ctx, path, stamp } => {
                let stamp = stamp.ok_or_else(|| DecideError::Missing(path.clone()))?;
                ctx.digests
                    .get_or_compute(ctx.fs.as_ref(), path, stamp, ctx.algorithm)
                    .map_err(|err| DecideError::io(path, &err))
            }
            NodeSample::Fixed(hash) => Ok(hash.clone()),
            NodeSample::Recorded { name, info } => info
                .csig
                .clone()
                .ok_or_else(|| DecideError::Missing(name.clone())),
        }
    }
}

/// Outcome of waiting on freshly discovered implicit dependencies.
enum Wait {
    Clear,
    Waiting,
    Blocked(String),
}

pub struct Work<'a> {
    graph: &'a Graph,
    ctx: &'a BuildContext,
    progress: &'a dyn Progress,
    states: BuildStates,
    /// Unfinished prerequisite builds, per wanted build.
    pending: FxHashMap<BuildId, usize>,
    /// Reverse edges: the builds waiting on each build.
    dependents: FxHashMap<BuildId, Vec<BuildId>>,
    ready: VecDeque<BuildId>,
    /// Examined and stale, but sharing a side effect with a running build.
    deferred: Vec<BuildId>,
    /// Side-effect nodes of running builds.
    busy: FxHashSet<NodeId>,
    rng: Option<StdRng>,
    runner: Runner,
    /// stat() results by disk path, dropped when a build rewrites the file.
    mtimes: FxHashMap<String, MTime>,
    /// Scanner results by (path, scanner); each file is scanned once per run.
    scans: FxHashMap<(String, usize), Vec<String>>,
    /// Implicit dependencies found by scanning, per build.
    implicit: FxHashMap<BuildId, Vec<Dep>>,
    /// Dependency state of each started build as of its examination.  The
    /// action may race with edits to its inputs; recording what was seen
    /// before it ran keeps such edits visible to the next run.
    snapshots: FxHashMap<BuildId, Vec<(String, NodeInfo)>>,
    /// Signatures of aliases, directories and values.
    aggregates: FxHashMap<NodeId, ContentHash>,
    /// Dry run: nodes that would have been rebuilt.
    changed: FxHashSet<NodeId>,
    /// Stop dispatching: a failure in fail-fast mode, or an interrupt.
    stopped: bool,
    summary: Summary,
}

impl<'a> Work<'a> {
    pub fn new(graph: &'a Graph, ctx: &'a BuildContext, progress: &'a dyn Progress) -> Self {
        let policy = &ctx.policy;
        Work {
            graph,
            ctx,
            progress,
            states: BuildStates::new(graph.build_count()),
            pending: FxHashMap::default(),
            dependents: FxHashMap::default(),
            ready: VecDeque::new(),
            deferred: Vec::new(),
            busy: FxHashSet::default(),
            rng: policy.random.map(StdRng::seed_from_u64),
            runner: Runner::new(policy.parallelism),
            mtimes: FxHashMap::default(),
            scans: FxHashMap::default(),
            implicit: FxHashMap::default(),
            snapshots: FxHashMap::default(),
            aggregates: FxHashMap::default(),
            changed: FxHashSet::default(),
            stopped: false,
            summary: Summary::default(),
        }
    }

    fn store(&self) -> MutexGuard<'a, SignatureStore> {
        self.ctx.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stat(&mut self, path: &str) -> Result<MTime, DecideError> {
        if let Some(&mtime) = self.mtimes.get(path) {
            return Ok(mtime);
        }
        let mtime = self
            .ctx
            .fs
            .stat(path)
            .map_err(|err| DecideError::io(path, &err))?;
        self.mtimes.insert(path.to_owned(), mtime);
        Ok(mtime)
    }

    /// A file that must already exist: not built by any action, and not a
    /// side-effect byproduct.
    fn is_source_file(&self, id: NodeId) -> bool {
        let node = self.graph.node(id);
        node.kind == NodeKind::File
            && node.producer.is_none()
            && node.side_effect_of().is_empty()
    }

    /// Derived nodes named in the stored records of a build's targets, so a
    /// generated header found by last run's scan is built before the scan
    /// runs again.
    fn stored_implicit(&self, id: BuildId) -> Vec<NodeId> {
        let graph = self.graph;
        let mut store = self.store();
        let mut out = Vec::new();
        for &target in graph.build(id).outs() {
            let record = match store.get(graph.name(target)) {
                Some(record) => record,
                None => continue,
            };
            for name in &record.implicit {
                if let Some(dep) = graph.lookup(name) {
                    if graph.is_derived(dep) && !out.contains(&dep) {
                        out.push(dep);
                    }
                }
            }
        }
        out.retain(|&dep| !self.creates_cycle(dep, id));
        out
    }

    /// Whether making `id` wait on `dep` would close a loop.
    fn creates_cycle(&self, dep: NodeId, id: BuildId) -> bool {
        let graph = self.graph;
        graph
            .build(id)
            .outs()
            .iter()
            .any(|&out| graph.reaches(dep, out))
    }

    /// Builds that must finish before `id` can be examined.
    fn prereq_builds(&self, id: BuildId) -> Vec<BuildId> {
        let graph = self.graph;
        let mut nodes: Vec<NodeId> = graph.build_prereqs(id).into_iter().map(|(n, _)| n).collect();
        nodes.extend(self.stored_implicit(id));
        let mut out = Vec::new();
        for n in nodes {
            if let Some(b) = graph.node(n).producer {
                if b != id && !out.contains(&b) {
                    out.push(b);
                }
            }
        }
        out
    }

    /// Adds a node, and everything it depends on, to the set of things to
    /// bring up to date.
    pub fn want_node(&mut self, id: NodeId) {
        if let Some(b) = self.graph.node(id).producer {
            self.want_build(b);
        }
    }

    fn want_build(&mut self, root: BuildId) {
        // Explicit stack: prerequisites are finished (and so queued as ready)
        // before their dependents, and deep graphs cannot overflow.
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if !expanded {
                if self.states.get(id) != BuildState::Unknown {
                    continue;
                }
                self.states.set(id, BuildState::Want);
                stack.push((id, true));
                for prereq in self.prereq_builds(id).into_iter().rev() {
                    if self.states.get(prereq) == BuildState::Unknown {
                        stack.push((prereq, false));
                    }
                }
                continue;
            }
            let mut pending = 0;
            for prereq in self.prereq_builds(id) {
                self.dependents.entry(prereq).or_default().push(id);
                if !self.states.get(prereq).is_terminal() {
                    pending += 1;
                }
            }
            self.pending.insert(id, pending);
            if pending == 0 {
                self.states.set(id, BuildState::Ready);
                self.ready.push_back(id);
            }
        }
    }

    /// Checks that every source file the wanted builds read exists.  Under
    /// the content decider the sources are hashed too, all in parallel.
    pub fn check_sources(&mut self) -> Result<(), GraphError> {
        let graph = self.graph;
        let mut seen = FxHashSet::default();
        let mut sources: Vec<(NodeId, NodeId)> = Vec::new();
        for (id, build) in graph.builds() {
            if self.states.get(id) == BuildState::Unknown {
                continue;
            }
            let needed_by = build.outs()[0];
            for (dep, _) in graph.build_prereqs(id) {
                if self.is_source_file(dep) && seen.insert(dep) {
                    sources.push((dep, needed_by));
                }
            }
        }

        let fs = self.ctx.fs.as_ref();
        let digests = &self.ctx.digests;
        let algorithm = self.ctx.algorithm;
        let hash = self.ctx.decider.kind() == DeciderKind::Content;
        let stats: Vec<std::io::Result<MTime>> = trace::scope("check_sources", || {
            sources
                .par_iter()
                .map(|&(src, _)| {
                    let path = graph.disk_path(src);
                    let mtime = fs.stat(path)?;
                    if let (true, MTime::Stamp(stamp)) = (hash, mtime) {
                        // Errors resurface when the decider asks again.
                        let _ = digests.get_or_compute(fs, path, stamp, algorithm);
                    }
                    Ok(mtime)
                })
                .collect()
        });

        let mut missing = Vec::new();
        for (&(src, needed_by), stat) in sources.iter().zip(stats) {
            match stat {
                Ok(MTime::Missing) => {
                    missing.push((graph.name(src).to_owned(), graph.name(needed_by).to_owned()))
                }
                Ok(mtime) => {
                    self.mtimes.insert(graph.disk_path(src).to_owned(), mtime);
                }
                Err(err) => warn!("stat {}: {}", graph.disk_path(src), err),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GraphError::MissingSources(missing))
        }
    }

    fn pop_ready(&mut self) -> Option<BuildId> {
        loop {
            let id = match &mut self.rng {
                Some(rng) if !self.ready.is_empty() => {
                    let i = rng.gen_range(0..self.ready.len());
                    self.ready.swap_remove_back(i)?
                }
                _ => self.ready.pop_front()?,
            };
            // Builds skipped while queued stay in the queue.
            if self.states.get(id) == BuildState::Ready {
                return Some(id);
            }
        }
    }

    fn message(&self, id: BuildId) -> TaskMessage {
        let graph = self.graph;
        let build = graph.build(id);
        let targets: Vec<PathBuf> = build.outs().iter().map(|&o| graph.name(o).into()).collect();
        let sources: Vec<PathBuf> = build
            .ins()
            .iter()
            .map(|&i| graph.disk_path(i).into())
            .collect();
        let command = match &build.action {
            Some(action) => action.describe(&Invocation {
                targets: &targets,
                sources: &sources,
                cwd: std::path::Path::new("."),
            }),
            None => String::new(),
        };
        // Verbose runs show what actually runs.
        let desc = if self.ctx.policy.verbose {
            None
        } else {
            build.desc.clone()
        };
        TaskMessage { desc, command }
    }

    fn action_signature(&self, id: BuildId) -> ContentHash {
        let contribution = match &self.graph.build(id).action {
            Some(action) => action.signature_contribution(),
            None => Vec::new(),
        };
        digest(self.ctx.algorithm, &contribution)
    }

    fn file_sample(&mut self, path: &str) -> Result<NodeSample<'a>, DecideError> {
        let stamp = self.stat(path)?.stamp();
        Ok(NodeSample::File {
            ctx: self.ctx,
            path: path.to_owned(),
            stamp,
        })
    }

    fn node_sample(&mut self, id: NodeId) -> Result<NodeSample<'a>, DecideError> {
        let graph = self.graph;
        match &graph.node(id).kind {
            NodeKind::Value(_) | NodeKind::Alias => Ok(NodeSample::Fixed(self.aggregate(id)?)),
            NodeKind::Dir if !graph.is_derived(id) => Ok(NodeSample::Fixed(self.aggregate(id)?)),
            _ => self.file_sample(graph.disk_path(id)),
        }
    }

    /// The signature of a node with no content of its own: a value's is the
    /// digest of its bytes; an alias's or directory's combines what the
    /// decider would record for each of its dependencies.
    fn aggregate(&mut self, id: NodeId) -> Result<ContentHash, DecideError> {
        if let Some(hash) = self.aggregates.get(&id) {
            return Ok(hash.clone());
        }
        let graph = self.graph;
        let algorithm = self.ctx.algorithm;
        let node = graph.node(id);
        let hash = if let NodeKind::Value(content) = &node.kind {
            digest(algorithm, content)
        } else {
            let deps: Vec<NodeId> = match node.producer {
                Some(b) => graph
                    .build_prereqs(b)
                    .into_iter()
                    .filter(|&(_, kind)| kind != DepKind::OrderOnly)
                    .map(|(dep, _)| dep)
                    .collect(),
                None => graph.edges(id),
            };
            let content = self.ctx.decider.kind().uses_content();
            let mut h = SigHasher::new(algorithm);
            for dep in deps {
                let sample = self.node_sample(dep)?;
                h.write_str(graph.name(dep));
                match sample.stamp() {
                    Some(stamp) if !content => h.write_stamp(&stamp),
                    _ => h.write(&sample.csig()?.bytes),
                }
                h.write_separator();
            }
            h.finish()
        };
        self.aggregates.insert(id, hash.clone());
        Ok(hash)
    }

    /// Dirtying dependencies of a build, in order: declared edges, then
    /// scanned ones.
    fn dirtying_deps(&self, id: BuildId) -> Vec<Dep> {
        let graph = self.graph;
        let mut deps: Vec<Dep> = graph
            .build_prereqs(id)
            .into_iter()
            .filter(|&(_, kind)| kind != DepKind::OrderOnly)
            .map(|(n, _)| Dep {
                name: graph.name(n).to_owned(),
                node: Some(n),
            })
            .collect();
        if let Some(scanned) = self.implicit.get(&id) {
            for dep in scanned {
                if !deps.iter().any(|d| d.name == dep.name) {
                    deps.push(dep.clone());
                }
            }
        }
        deps
    }

    fn samples(&mut self, deps: &[Dep]) -> Result<Vec<NodeSample<'a>>, DecideError> {
        let mut out = Vec::with_capacity(deps.len());
        for dep in deps {
            out.push(match dep.node {
                Some(n) => self.node_sample(n)?,
                None => self.file_sample(&dep.name)?,
            });
        }
        Ok(out)
    }

    fn decide(&mut self, id: BuildId) -> Decision {
        let graph = self.graph;
        let build = graph.build(id);
        if self.ctx.policy.force {
            return Decision::Stale(Reason::Forced);
        }
        if build.outs().iter().any(|&o| graph.node(o).flags.always_build) {
            return Decision::Stale(Reason::AlwaysBuild);
        }
        let deps = self.dirtying_deps(id);
        if self.ctx.policy.dry_run {
            // Nothing was really rebuilt, so signatures cannot show it.
            if let Some(dep) = deps
                .iter()
                .find(|d| d.node.map_or(false, |n| self.changed.contains(&n)))
            {
                return Decision::Stale(Reason::Changed(dep.name.clone()));
            }
        }
        let samples = match self.samples(&deps) {
            Ok(samples) => samples,
            Err(err) => return Decision::Error(err),
        };
        let refs: Vec<(&str, &dyn Sample)> = deps
            .iter()
            .zip(&samples)
            .map(|(d, s)| (d.name.as_str(), s as &dyn Sample))
            .collect();
        let action = self.action_signature(id);
        let inputs = Inputs {
            action: &action,
            deps: &refs,
            algorithm: self.ctx.algorithm,
        };
        let mut checked = Vec::new();
        for &out in build.outs() {
            let target = match self.file_sample(graph.disk_path(out)) {
                Ok(target) => target,
                Err(err) => return Decision::Error(err),
            };
            let record = self.store().get(graph.name(out)).cloned();
            let decision = self.ctx.decider.is_current(&target, record.as_ref(), &inputs);
            if !decision.is_current() {
                return decision;
            }
            if let Some(record) = record {
                checked.push((out, target, record));
            }
        }
        if self.ctx.decider.kind() == DeciderKind::Hybrid && !self.ctx.policy.dry_run {
            self.refresh(checked, &inputs);
        }
        Decision::Current
    }

    /// Restamps Hybrid records that could not be trusted on stamps alone,
    /// once this run's decision has vouched for their digests, so the next
    /// run can skip the hashing.  Digests are kept as recorded: a current
    /// decision means each one still describes its file.
    fn refresh(&self, checked: Vec<(NodeId, NodeSample<'a>, BuildInfo)>, inputs: &Inputs) {
        for (out, target, old) in checked {
            let mut info = old.clone();
            info.target.stamp = target.stamp();
            for ((_, prev), (_, dep)) in info.deps.iter_mut().zip(inputs.deps) {
                prev.stamp = dep.stamp();
            }
            info.recorded_at = self.ctx.started_at;
            let restamped = info.target != old.target || info.deps != old.deps;
            if (restamped || !old.is_settled()) && info.is_settled() {
                debug!("restamping record of {}", self.graph.name(out));
                self.store().set(self.graph.name(out), info);
            }
        }
    }

    fn scan_one(&self, scanner: &dyn Scanner, name: &str) -> Option<Vec<String>> {
        let graph = self.graph;
        let fs = self.ctx.fs.as_ref();
        let path = graph.lookup(name).map_or(name, |id| graph.disk_path(id));
        let content = fs.read(path).ok()?;
        let exists = |p: &str| {
            graph.lookup(p).map_or(false, |id| graph.is_derived(id))
                || matches!(fs.stat(p), Ok(MTime::Stamp(_)))
        };
        Some(trace::scope("scan", || scanner.scan(name, &content, &exists)))
    }

    /// Runs the build's scanner over its sources and, transitively, over
    /// what they include.  Files not yet readable (generated ones not built
    /// yet) are left out and not cached.
    fn scan(&mut self, id: BuildId) -> Vec<Dep> {
        let graph = self.graph;
        let build = graph.build(id);
        let scanner: Arc<dyn Scanner> = match &build.scanner {
            Some(scanner) => scanner.clone(),
            None => return Vec::new(),
        };
        let key = Arc::as_ptr(&scanner) as *const () as usize;
        let mut found = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut queue: VecDeque<String> =
            build.ins().iter().map(|&n| graph.name(n).to_owned()).collect();
        while let Some(name) = queue.pop_front() {
            let cache_key = (name, key);
            let deps = match self.scans.get(&cache_key) {
                Some(deps) => deps.clone(),
                None => match self.scan_one(scanner.as_ref(), &cache_key.0) {
                    Some(deps) => {
                        self.scans.insert(cache_key, deps.clone());
                        deps
                    }
                    None => continue,
                },
            };
            for dep in deps {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                    found.push(Dep {
                        node: graph.lookup(&dep),
                        name: dep,
                    });
                }
            }
        }
        found
    }

    /// Makes a build wait for the producers of newly scanned dependencies.
    fn wait_on_implicit(&mut self, id: BuildId, deps: &[Dep]) -> Wait {
        let graph = self.graph;
        let mut waiting_on = Vec::new();
        for dep in deps {
            let node = match dep.node {
                Some(node) => node,
                None => continue,
            };
            let producer = match graph.node(node).producer {
                Some(b) if b != id => b,
                _ => continue,
            };
            if waiting_on.contains(&producer) {
                continue;
            }
            if self.creates_cycle(node, id) {
                warn!(
                    "ignoring scanned dependency {} of {}: it would form a cycle",
                    dep.name,
                    graph.name(graph.build(id).outs()[0])
                );
                continue;
            }
            if self.states.get(producer) == BuildState::Unknown {
                self.want_build(producer);
            }
            let state = self.states.get(producer);
            if state.is_blocked() {
                return Wait::Blocked(dep.name.clone());
            }
            if !state.is_terminal() {
                waiting_on.push(producer);
            }
        }
        if waiting_on.is_empty() {
            return Wait::Clear;
        }
        for producer in &waiting_on {
            self.dependents.entry(*producer).or_default().push(id);
        }
        *self.pending.entry(id).or_default() += waiting_on.len();
        self.states.set(id, BuildState::Want);
        Wait::Waiting
    }

    fn missing_source(&mut self, id: BuildId) -> Option<String> {
        let graph = self.graph;
        for (dep, _) in graph.build_prereqs(id) {
            if self.is_source_file(dep) {
                if let Ok(MTime::Missing) = self.stat(graph.disk_path(dep)) {
                    return Some(graph.name(dep).to_owned());
                }
            }
        }
        None
    }

    fn target_name(&self, id: BuildId) -> &'a str {
        let graph = self.graph;
        graph.name(graph.build(id).outs()[0])
    }

    fn fail(&mut self, id: BuildId, exit_code: Option<i32>, message: String) {
        self.states.set(id, BuildState::Failed);
        self.summary.failed.push(Failure {
            target: self.target_name(id).to_owned(),
            exit_code,
            message,
        });
        if !self.ctx.policy.keep_going {
            self.stopped = true;
        }
        self.skip_dependents(id);
    }

    /// Marks everything waiting on `id`, transitively, as skipped.
    fn skip_dependents(&mut self, id: BuildId) {
        let mut queue = vec![id];
        while let Some(id) = queue.pop() {
            let dependents = match self.dependents.get(&id) {
                Some(d) => d.clone(),
                None => continue,
            };
            for dep in dependents {
                if matches!(self.states.get(dep), BuildState::Want | BuildState::Ready) {
                    self.states.set(dep, BuildState::Skipped);
                    self.summary.skipped.push(self.target_name(dep).to_owned());
                    queue.push(dep);
                }
            }
        }
    }

    /// Unblocks dependents of a build that finished without failing.
    fn succeeded(&mut self, id: BuildId) {
        let dependents = match self.dependents.get(&id) {
            Some(d) => d.clone(),
            None => return,
        };
        for dep in dependents {
            let pending = self.pending.entry(dep).or_default();
            *pending = pending.saturating_sub(1);
            if *pending == 0 && self.states.get(dep) == BuildState::Want {
                self.states.set(dep, BuildState::Ready);
                self.ready.push_back(dep);
            }
        }
    }

    fn examine(&mut self, id: BuildId) {
        let graph = self.graph;
        let build = graph.build(id);

        if build.is_phony() {
            if self.ctx.policy.dry_run {
                let any_changed = graph
                    .build_prereqs(id)
                    .iter()
                    .any(|(dep, _)| self.changed.contains(dep));
                if any_changed {
                    self.changed.extend(build.outs().iter().copied());
                }
            }
            self.states.set(id, BuildState::UpToDate);
            self.succeeded(id);
            return;
        }

        if let Some(src) = self.missing_source(id) {
            let message = format!(
                "source `{}' not found, needed by target `{}'",
                src,
                self.target_name(id)
            );
            self.progress.log(&format!("s2: *** {}", message));
            self.fail(id, None, message);
            return;
        }

        if build.scanner.is_some() {
            let deps = self.scan(id);
            let wait = self.wait_on_implicit(id, &deps);
            self.implicit.insert(id, deps);
            match wait {
                Wait::Clear => {}
                Wait::Waiting => return,
                Wait::Blocked(dep) => {
                    debug!("skipping {}: {} failed", self.target_name(id), dep);
                    self.states.set(id, BuildState::Skipped);
                    self.summary.skipped.push(self.target_name(id).to_owned());
                    self.skip_dependents(id);
                    return;
                }
            }
        }

        let reason = match self.decide(id).reason() {
            None => {
                debug!("{} is up to date", self.target_name(id));
                self.states.set(id, BuildState::UpToDate);
                self.summary.up_to_date += 1;
                self.succeeded(id);
                return;
            }
            Some(reason) => reason,
        };
        debug!("{} is stale: {}", self.target_name(id), reason);
        if self.ctx.policy.explain {
            self.progress
                .log(&format!("s2: rebuilding `{}' {}", self.target_name(id), reason));
        }

        if self.ctx.policy.dry_run {
            self.progress.task_started(id, &self.message(id));
            self.changed.extend(build.outs().iter().copied());
            self.states.set(id, BuildState::Done);
            self.summary.executed += 1;
            self.succeeded(id);
            return;
        }
        match self.snapshot(id) {
            Ok(snapshot) => {
                self.snapshots.insert(id, snapshot);
            }
            Err(err) => warn!("not recording {}: {}", self.target_name(id), err),
        }
        self.start(id);
    }

    fn conflicts(&self, id: BuildId) -> bool {
        self.graph
            .build_side_effects(id)
            .iter()
            .any(|se| self.busy.contains(se))
    }

    fn job(&self, id: BuildId) -> Option<Job> {
        let graph = self.graph;
        let fs = self.ctx.fs.as_ref();
        let build = graph.build(id);
        let action = build.action.clone()?;
        Some(Job {
            buildid: id,
            action,
            targets: build.outs().iter().map(|&o| fs.resolve(graph.name(o))).collect(),
            sources: build
                .ins()
                .iter()
                .map(|&i| fs.resolve(graph.disk_path(i)))
                .collect(),
            remove_first: build
                .outs()
                .iter()
                .filter(|&&o| {
                    let node = graph.node(o);
                    node.kind == NodeKind::File && !node.flags.precious
                })
                .map(|&o| fs.resolve(graph.name(o)))
                .collect(),
            cwd: fs.resolve("."),
        })
    }

    /// Dispatches an examined, stale build, unless it shares a side effect
    /// with a running one.
    fn start(&mut self, id: BuildId) {
        if self.conflicts(id) {
            debug!("deferring {}: side effect in use", self.target_name(id));
            self.deferred.push(id);
            return;
        }
        let job = match self.job(id) {
            Some(job) => job,
            None => return,
        };
        self.busy.extend(self.graph.build_side_effects(id));
        self.states.set(id, BuildState::Running);
        self.progress.task_started(id, &self.message(id));
        self.runner.start(job);
    }

    /// Captures the state of a stale build's dependencies before its action
    /// runs.  Digests are taken now for deciders that read content.
    fn snapshot(&mut self, id: BuildId) -> Result<Vec<(String, NodeInfo)>, DecideError> {
        let deps = self.dirtying_deps(id);
        let samples = self.samples(&deps)?;
        let content = self.ctx.decider.kind().uses_content();
        let mut infos = Vec::with_capacity(deps.len());
        for (dep, sample) in deps.into_iter().zip(&samples) {
            let stamp = sample.stamp();
            let csig = if content || stamp.is_none() {
                Some(sample.csig()?)
            } else {
                None
            };
            infos.push((dep.name, NodeInfo { stamp, csig }));
        }
        Ok(infos)
    }

    /// Records the signatures of a successful build's targets, against the
    /// dependency state captured when the build was examined.
    fn record(&mut self, id: BuildId) {
        let graph = self.graph;
        let build = graph.build(id);
        for &out in build.outs() {
            let path = graph.disk_path(out);
            self.mtimes.remove(path);
            self.ctx.digests.invalidate(path);
        }
        let snapshot = match self.snapshots.remove(&id) {
            Some(snapshot) => snapshot,
            None => {
                // Without a record the targets are simply rebuilt next time.
                let mut store = self.store();
                for &out in build.outs() {
                    store.remove(graph.name(out));
                }
                return;
            }
        };
        let implicit: Vec<String> = self
            .implicit
            .get(&id)
            .map(|deps| deps.iter().map(|d| d.name.clone()).collect())
            .unwrap_or_default();
        let samples: Vec<NodeSample> = snapshot
            .iter()
            .map(|(name, info)| NodeSample::Recorded {
                name: name.clone(),
                info: info.clone(),
            })
            .collect();
        let refs: Vec<(&str, &dyn Sample)> = snapshot
            .iter()
            .zip(&samples)
            .map(|((name, _), s)| (name.as_str(), s as &dyn Sample))
            .collect();
        let action = self.action_signature(id);
        let inputs = Inputs {
            action: &action,
            deps: &refs,
            algorithm: self.ctx.algorithm,
        };
        for &out in build.outs() {
            let name = graph.name(out);
            let info = self.file_sample(graph.disk_path(out)).and_then(|target| {
                self.ctx
                    .decider
                    .compute(&target, &inputs, implicit.clone(), self.ctx.started_at)
            });
            match info {
                Ok(info) => self.store().set(name, info),
                Err(err) => {
                    warn!("not recording {}: {}", name, err);
                    self.store().remove(name);
                }
            }
        }
    }

    fn finish(&mut self, task: FinishedTask) {
        let id = task.buildid;
        for se in self.graph.build_side_effects(id) {
            self.busy.remove(&se);
        }
        let msg = self.message(id);
        trace::span(msg.message(), task.tid, task.span.0, task.span.1);
        self.progress.task_finished(id, &msg, &task.result);
        match task.result.termination {
            Termination::Success => {
                self.record(id);
                self.states.set(id, BuildState::Done);
                self.summary.executed += 1;
                self.succeeded(id);
            }
            Termination::Interrupted => {
                self.summary.interrupted = true;
                self.stopped = true;
                self.fail(id, task.result.exit_code, "interrupted".to_owned());
            }
            Termination::Failure => {
                let output = String::from_utf8_lossy(&task.result.output);
                let message = output.trim_end().to_owned();
                self.fail(id, task.result.exit_code, message);
            }
        }
    }

    /// Takes the next deferred build whose side effects are now free.
    fn take_deferred(&mut self) -> Option<BuildId> {
        let pos = self.deferred.iter().position(|&id| !self.conflicts(id))?;
        Some(self.deferred.remove(pos))
    }

    /// Runs the wanted builds to completion, or until a failure (without
    /// keep-going) or an interrupt stops dispatching.  Running tasks are
    /// always waited for.
    pub fn run(&mut self) -> anyhow::Result<Summary> {
        loop {
            while !self.stopped && self.runner.can_start_more() {
                if self.ctx.cancel.is_cancelled() {
                    self.summary.interrupted = true;
                    self.stopped = true;
                    break;
                }
                if let Some(id) = self.take_deferred() {
                    self.start(id);
                    continue;
                }
                match self.pop_ready() {
                    Some(id) => self.examine(id),
                    None => break,
                }
            }
            self.progress.update(&self.states.counts);

            if !self.runner.is_running() {
                if self.stopped || (self.ready.is_empty() && self.deferred.is_empty()) {
                    break;
                }
                continue;
            }
            if let Some(task) = self.runner.wait(Duration::from_millis(50)) {
                self.finish(task);
            }
        }
        if self.ctx.cancel.is_cancelled() {
            self.summary.interrupted = true;
        }
        Ok(std::mem::take(&mut self.summary))
    }
}

/// Removes the derived files reachable from `roots` (and the side effects of
/// their builds), along with their signature records.  Returns the number of
/// files removed, or that would be removed in a dry run.
pub fn clean(
    graph: &Graph,
    ctx: &BuildContext,
    roots: &[NodeId],
    progress: &dyn Progress,
) -> anyhow::Result<usize> {
    let mut seen = FxHashSet::default();
    let mut removed = 0;
    let mut store = ctx.store.lock().unwrap_or_else(|e| e.into_inner());
    for &root in roots {
        for visit in graph.walk(root, Order::Post) {
            let id = visit.id;
            if !graph.is_derived(id) || graph.node(id).flags.no_clean {
                continue;
            }
            let mut doomed = vec![id];
            if let Some(b) = graph.node(id).producer {
                doomed.extend(graph.build_side_effects(b));
            }
            for node in doomed {
                if !seen.insert(node) {
                    continue;
                }
                let path = graph.name(node);
                if let MTime::Missing = ctx.fs.stat(path)? {
                    store.remove(path);
                    continue;
                }
                if !ctx.policy.dry_run {
                    ctx.fs
                        .remove(path)
                        .map_err(|err| anyhow::anyhow!("remove {}: {}", path, err))?;
                    store.remove(path);
                }
                progress.log(&format!("Removed {}", path));
                removed += 1;
            }
        }
    }
    Ok(removed)
}
