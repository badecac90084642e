//! Top-level driver: resolves what to build, wires up the run context, runs
//! the scheduler and persists signatures.

use crate::context::BuildContext;
use crate::fs::{FileSystem, MTime, RealFileSystem};
use crate::graph::{Graph, GraphError, NodeId, NodeKind};
use crate::options::Options;
use crate::progress::Progress;
use crate::store::{SignatureStore, StoreError};
use crate::work::{self, Summary, Work};
use crate::{signal, trace};
use std::path::Path;
use tracing::debug;

/// Process exit status for a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// At least one build failed.
    Failed,
    /// The graph, the request or the store was unusable; nothing was built.
    Usage,
    Interrupted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failed => 1,
            ExitStatus::Usage => 2,
            ExitStatus::Interrupted => 130,
        }
    }

    /// Errors detected before any build started are usage errors.
    fn of_error(err: &anyhow::Error) -> Self {
        if err.is::<GraphError>() || err.is::<StoreError>() {
            ExitStatus::Usage
        } else {
            ExitStatus::Failed
        }
    }
}

fn resolve_targets(
    graph: &Graph,
    fs: &dyn FileSystem,
    names: &[String],
) -> anyhow::Result<Vec<NodeId>> {
    let mut targets = Vec::with_capacity(names.len());
    for name in names {
        let id = match graph.lookup(name) {
            Some(id) => id,
            None => return Err(GraphError::UnknownTarget(name.clone()).into()),
        };
        // Asking for a plain source file that isn't there is asking for
        // something nothing can build.
        let node = graph.node(id);
        if node.kind == NodeKind::File && node.producer.is_none() {
            if let MTime::Missing = fs.stat(graph.disk_path(id))? {
                return Err(GraphError::UnknownTarget(name.clone()).into());
            }
        }
        targets.push(id);
    }
    if targets.is_empty() {
        targets = graph.defaults().to_vec();
    }
    if targets.is_empty() {
        return Err(GraphError::NoTargets.into());
    }
    Ok(targets)
}

fn flush(ctx: &BuildContext) -> anyhow::Result<()> {
    let mut store = ctx.store.lock().unwrap_or_else(|e| e.into_inner());
    trace::scope("store.flush", || store.flush())?;
    Ok(())
}

/// Brings the requested targets of `graph` up to date, with `top` as the
/// root of the tree: relative paths, the store and commands are all
/// relative to it.
///
/// Configuration problems (cycles, unknown targets, missing sources, an
/// unopenable store) are returned as errors before anything runs.  Build
/// failures are reported in the Summary instead.
pub fn build(
    graph: &mut Graph,
    options: &Options,
    top: &Path,
    progress: &dyn Progress,
) -> anyhow::Result<Summary> {
    graph.freeze()?;
    let graph: &Graph = graph;
    let fs = RealFileSystem::new(top);
    let targets = resolve_targets(graph, &fs, &options.targets)?;
    trace::scope("topo_order", || graph.topo_order(&targets))?;

    let store = SignatureStore::open(top, options.store_layout)?;
    let ctx = BuildContext::new(
        Box::new(fs),
        store,
        options.decider,
        options.hash_format,
        options.policy(),
    );

    if options.prune {
        let mut store = ctx.store.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = store.prune(|name| graph.lookup(name).is_some())?;
        debug!("pruned {} stale signatures", dropped);
    }

    if options.clean {
        let removed = trace::scope("clean", || work::clean(graph, &ctx, &targets, progress))?;
        flush(&ctx)?;
        return Ok(Summary {
            executed: removed,
            ..Summary::default()
        });
    }

    let mut work = Work::new(graph, &ctx, progress);
    trace::scope("want", || {
        for &target in &targets {
            work.want_node(target);
        }
    });
    work.check_sources()?;
    let result = trace::scope("work.run", || work.run());
    // Whatever happened, keep the signatures of what did get built.
    flush(&ctx)?;
    result
}

fn report(summary: &Summary, options: &Options, progress: &dyn Progress) {
    if options.keep_going && !summary.success() {
        for failure in &summary.failed {
            match failure.exit_code {
                Some(code) => progress.log(&format!(
                    "s2: building `{}' failed (exit {})",
                    failure.target, code
                )),
                None => progress.log(&format!("s2: building `{}' failed", failure.target)),
            }
        }
        for skipped in &summary.skipped {
            progress.log(&format!("s2: `{}' not built", skipped));
        }
    }
    if summary.interrupted {
        progress.log("s2: interrupted");
    } else if !summary.failed.is_empty() {
        progress.log("s2: build failed");
    } else if options.clean {
        progress.log(&format!("s2: removed {} files", summary.executed));
    } else if summary.executed == 0 {
        // Special case: don't print numbers when no work done.
        progress.log("s2: no work to do");
    } else {
        progress.log(&format!("s2: ran {} tasks, now up to date", summary.executed));
    }
}

/// Like build(), but handles everything a front end would: SIGINT, tracing,
/// printing errors and the summary.  Returns the status to exit with.
pub fn run(
    graph: &mut Graph,
    options: &Options,
    top: &Path,
    progress: &dyn Progress,
) -> ExitStatus {
    signal::register_sigint();
    if let Some(path) = &options.trace {
        if let Err(err) = trace::open(path) {
            progress.log(&format!("s2: error: trace {}: {}", path, err));
            return ExitStatus::Usage;
        }
    }
    let status = match build(graph, options, top, progress) {
        Ok(summary) => {
            report(&summary, options, progress);
            if summary.interrupted {
                ExitStatus::Interrupted
            } else if summary.success() {
                ExitStatus::Success
            } else {
                ExitStatus::Failed
            }
        }
        Err(err) => {
            progress.log(&format!("s2: error: {}", err));
            ExitStatus::of_error(&err)
        }
    };
    // A trace that can't be finished is not worth failing the run over.
    let _ = trace::close();
    status
}
