//! Support code for scenario tests, which drive the library against a temp
//! directory.

mod deciders;
mod failures;
mod scheduling;
mod variants;

use s2::action::{Action, Function, Invocation};
use s2::graph::{BuildId, Graph};
use s2::options::Options;
use s2::process::Termination;
use s2::progress::{Progress, TaskMessage};
use s2::task::TaskResult;
use s2::work::{StateCounts, Summary};
use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Manages a temporary directory acting as the top of a build tree.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file into the working space, creating parent directories.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    pub fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.dir.path().join(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    pub fn remove(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.dir.path().join(path))
    }

    /// Forces a file's mtime, in whole seconds since the epoch.
    pub fn set_mtime(&self, path: &str, secs: i64) -> std::io::Result<()> {
        let time = filetime::FileTime::from_unix_time(secs, 0);
        filetime::set_file_mtime(self.dir.path().join(path), time)
    }

    /// Builds `graph` with the given options, recording progress.
    pub fn build(
        &self,
        graph: &mut Graph,
        options: &Options,
    ) -> anyhow::Result<(Summary, Recorder)> {
        let recorder = Recorder::default();
        let summary = s2::run::build(graph, options, self.path(), &recorder)?;
        Ok((summary, recorder))
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// Sequential defaults, so tests see a stable task order.
pub fn options() -> Options {
    Options {
        parallelism: 1,
        ..Options::default()
    }
}

/// Progress that remembers what it was told.
#[derive(Default)]
pub struct Recorder {
    pub started: RefCell<Vec<String>>,
    pub finished: RefCell<Vec<(String, Termination)>>,
    pub logs: RefCell<Vec<String>>,
}

impl Recorder {
    pub fn started(&self) -> Vec<String> {
        self.started.borrow().clone()
    }

    pub fn logged(&self, text: &str) -> bool {
        self.logs.borrow().iter().any(|line| line.contains(text))
    }
}

impl Progress for Recorder {
    fn update(&self, _counts: &StateCounts) {}

    fn task_started(&self, _id: BuildId, msg: &TaskMessage) {
        self.started.borrow_mut().push(msg.message().to_owned());
    }

    fn task_finished(&self, _id: BuildId, msg: &TaskMessage, result: &TaskResult) {
        self.finished
            .borrow_mut()
            .push((msg.message().to_owned(), result.termination));
    }

    fn log(&self, msg: &str) {
        self.logs.borrow_mut().push(msg.to_owned());
    }
}

/// Counts how many times the actions sharing it ran.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn read_all(inv: &Invocation) -> anyhow::Result<String> {
    let mut text = String::new();
    for src in inv.sources {
        text.push_str(&std::fs::read_to_string(src)?);
    }
    Ok(text)
}

/// Concatenates the sources into every target.
pub fn cat(counter: &Counter) -> Arc<dyn Action> {
    let counter = counter.clone();
    Arc::new(Function::new("cat", move |inv| {
        counter.bump();
        let text = read_all(inv)?;
        for target in inv.targets {
            std::fs::write(target, &text)?;
        }
        Ok(())
    }))
}

/// Writes the length of the concatenated sources, so edits that keep the
/// length produce identical output.
pub fn length(counter: &Counter) -> Arc<dyn Action> {
    let counter = counter.clone();
    Arc::new(Function::new("length", move |inv| {
        counter.bump();
        let text = read_all(inv)?;
        for target in inv.targets {
            std::fs::write(target, text.len().to_string())?;
        }
        Ok(())
    }))
}

/// Fails without touching its targets.
pub fn fail(counter: &Counter) -> Arc<dyn Action> {
    let counter = counter.clone();
    Arc::new(Function::new("fail", move |_| {
        counter.bump();
        anyhow::bail!("deliberate failure")
    }))
}
