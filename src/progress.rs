//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::graph::BuildId;
use crate::process::Termination;
use crate::task::TaskResult;
use crate::work::StateCounts;
use std::cell::Cell;
use std::io::Write;

/// How a build presents itself on the console.
pub struct TaskMessage {
    /// The build's own description, if it has one.
    pub desc: Option<String>,
    /// The action's rendering, e.g. the expanded command line.
    pub command: String,
}

impl TaskMessage {
    /// Compute the message to display on the console for a given build.
    pub fn message(&self) -> &str {
        self.desc
            .as_deref()
            .filter(|desc| !desc.is_empty())
            .unwrap_or(&self.command)
    }
}

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as individual build tasks progress through build states.
    fn update(&self, counts: &StateCounts);

    /// Called when a task starts, or would start in a dry run.
    fn task_started(&self, id: BuildId, msg: &TaskMessage);

    /// Called when a task completes.
    fn task_finished(&self, id: BuildId, msg: &TaskMessage, result: &TaskResult);

    /// Log a line of output without corrupting the progress display.
    /// This line is persisted beyond further progress updates.  For example,
    /// used when a task fails; we want the final output to show that failed
    /// task's output even if we do more work after it fails.
    fn log(&self, msg: &str);
}

/// Progress implementation for "dumb" console, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// Whether to print command lines of started programs.
    verbose: bool,

    /// The id of the last command printed, used to avoid printing it twice
    /// when we have two updates from the same command in a row.
    last_started: Cell<Option<BuildId>>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_started: Default::default(),
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&self, _counts: &StateCounts) {
        // ignore
    }

    fn task_started(&self, id: BuildId, msg: &TaskMessage) {
        self.log(if self.verbose {
            msg.command.as_str()
        } else {
            msg.message()
        });
        self.last_started.set(Some(id));
    }

    fn task_finished(&self, id: BuildId, msg: &TaskMessage, result: &TaskResult) {
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started.get() == Some(id) {
                    // Output is empty, or we just printed the command, don't print it again.
                } else {
                    self.log(msg.message())
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", msg.message())),
            Termination::Failure => match result.exit_code {
                Some(code) if code != 0 => {
                    self.log(&format!("failed (exit {}): {}", code, msg.message()))
                }
                _ => self.log(&format!("failed: {}", msg.message())),
            },
        };
        if !result.output.is_empty() {
            // Nowhere to report a broken stdout to.
            let _ = std::io::stdout().write_all(&result.output);
        }
    }

    fn log(&self, msg: &str) {
        println!("{}", msg);
    }
}
