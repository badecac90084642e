//! Runs external commands for Command actions.

use crate::task::TaskResult;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// Runs argv to completion with stdout and stderr captured into one buffer.
/// Returns an Err() only if the process could not be started at all.
pub fn run_command(
    argv: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
) -> anyhow::Result<TaskResult> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => anyhow::bail!("empty command line"),
    };
    let mut cmd = std::process::Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let out = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|err| anyhow::anyhow!("spawn {:?}: {}", program, err))?;

    let mut output = out.stdout;
    output.extend_from_slice(&out.stderr);

    let mut termination = Termination::Success;
    if !out.status.success() {
        termination = Termination::Failure;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = out.status.signal() {
                match sig {
                    libc::SIGINT => {
                        let _ = write!(output, "interrupted");
                        termination = Termination::Interrupted;
                    }
                    _ => {
                        let _ = write!(output, "signal {}", sig);
                    }
                }
            }
        }
    }

    Ok(TaskResult {
        termination,
        exit_code: out.status.code(),
        output,
    })
}
