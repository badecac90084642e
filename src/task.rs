//! Runs build actions, potentially in parallel.
//! Unaware of the build graph and signatures; just action execution.
//!
//! With parallelism N > 0 each job runs on its own thread and at most N run
//! at once.  With parallelism 0 jobs run on the calling thread inside
//! `start()`, which is the cooperative single-threaded mode.

use crate::action::{Action, Invocation};
use crate::graph::BuildId;
use crate::process::Termination;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The result of executing a build step.
pub struct TaskResult {
    pub termination: Termination,
    /// Exit code of an external process, if there was one.
    pub exit_code: Option<i32>,
    /// Console output.
    pub output: Vec<u8>,
}

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished builds in different
    /// tracks in a performance trace.
    pub tid: usize,
    pub buildid: BuildId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

/// Everything a worker needs to run one build, detached from the graph.
pub struct Job {
    pub buildid: BuildId,
    pub action: Arc<dyn Action>,
    pub targets: Vec<PathBuf>,
    pub sources: Vec<PathBuf>,
    /// Targets that should be deleted before the action runs; precious
    /// targets are left out.
    pub remove_first: Vec<PathBuf>,
    pub cwd: PathBuf,
}

/// Creates parent directories of the targets and removes stale outputs.
fn prepare_outputs(job: &Job) -> anyhow::Result<()> {
    for target in &job.targets {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| anyhow::anyhow!("mkdir {}: {}", parent.display(), err))?;
            }
        }
    }
    for target in &job.remove_first {
        match std::fs::remove_file(target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => anyhow::bail!("remove {}: {}", target.display(), err),
        }
    }
    Ok(())
}

fn run_job(job: &Job) -> TaskResult {
    let attempt = prepare_outputs(job).and_then(|()| {
        job.action.execute(&Invocation {
            targets: &job.targets,
            sources: &job.sources,
            cwd: &job.cwd,
        })
    });
    attempt.unwrap_or_else(|err| TaskResult::failed(err.to_string()))
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn new() -> Self {
        ThreadIds { slots: Vec::new() }
    }

    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::new(),
            parallelism,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism.max(1)
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, job: Job) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        let work = move || {
            let start = Instant::now();
            let result = run_job(&job);
            let finish = Instant::now();
            let task = FinishedTask {
                tid,
                buildid: job.buildid,
                span: (start, finish),
                result,
            };
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send(task);
        };
        if self.parallelism == 0 {
            work();
        } else {
            std::thread::spawn(work);
        }
        self.running += 1;
    }

    /// Wait for a build to complete, with a timeout.
    /// If the timeout elapses return None.
    pub fn wait(&mut self, dur: Duration) -> Option<FinishedTask> {
        let task = match self.finished_recv.recv_timeout(dur) {
            Err(mpsc::RecvTimeoutError::Timeout) => return None,
            // The unwrap() checks the recv() call, to panic on mpsc errors.
            r => r.unwrap(),
        };
        self.tids.release(task.tid);
        self.running -= 1;
        Some(task)
    }
}
