//! Actions: what actually runs to produce a build's targets.
//!
//! An action is either an external command (argv template expanded against
//! the targets and sources) or an in-process callable.  Either way it feeds a
//! byte string into the build signature, so editing the action itself makes
//! its targets stale.

use crate::process::{self, Termination};
use crate::task::TaskResult;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// The on-disk paths one execution of an action covers.  For a batch build
/// this is every target and source of the group.
pub struct Invocation<'a> {
    pub targets: &'a [PathBuf],
    pub sources: &'a [PathBuf],
    /// Directory commands are started in.
    pub cwd: &'a Path,
}

impl Invocation<'_> {
    fn joined(paths: &[PathBuf]) -> String {
        paths
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn first(paths: &[PathBuf]) -> String {
        paths
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub trait Action: Send + Sync {
    /// Bytes folded into every target's build signature.
    fn signature_contribution(&self) -> Vec<u8>;

    /// Runs the action.  Err() means the action could not be attempted;
    /// a failed attempt is an Ok(TaskResult) with a Failure termination.
    fn execute(&self, inv: &Invocation) -> anyhow::Result<TaskResult>;

    /// Human-readable form, printed when the build has no description or in
    /// verbose mode.
    fn describe(&self, inv: &Invocation) -> String;
}

/// An external command, run without a shell unless built with `shell()`.
///
/// Arguments may reference `$TARGET`, `$TARGETS`, `$SOURCE` and `$SOURCES`
/// (also spelled `${TARGET}` etc.); `$$` is a literal dollar.  An argument
/// that is exactly `$TARGETS` or `$SOURCES` expands to one argument per path.
pub struct Command {
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// A command line interpreted by the platform shell.
    pub fn shell(cmdline: &str) -> Self {
        if cfg!(windows) {
            Command::new(["cmd", "/c", cmdline])
        } else {
            Command::new(["/bin/sh", "-c", cmdline])
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn expand(&self, inv: &Invocation) -> Vec<String> {
        let mut out = Vec::with_capacity(self.argv.len());
        for arg in &self.argv {
            match arg.as_str() {
                "$TARGETS" => out.extend(inv.targets.iter().map(|p| p.to_string_lossy().into())),
                "$SOURCES" => out.extend(inv.sources.iter().map(|p| p.to_string_lossy().into())),
                _ => out.push(subst(arg, inv)),
            }
        }
        out
    }
}

fn lookup(var: &str, inv: &Invocation) -> Option<String> {
    Some(match var {
        "TARGET" => Invocation::first(inv.targets),
        "TARGETS" => Invocation::joined(inv.targets),
        "SOURCE" => Invocation::first(inv.sources),
        "SOURCES" => Invocation::joined(inv.sources),
        _ => return None,
    })
}

/// Expands variable references inside one argument.  Unknown variables are
/// left as written.
fn subst(arg: &str, inv: &Invocation) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(tail) = rest.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }
        let (name, consumed) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };
        match lookup(name, inv) {
            Some(value) if consumed > 0 => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(&rest[..consumed]);
            }
        }
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

impl Action for Command {
    fn signature_contribution(&self) -> Vec<u8> {
        let mut sig = Vec::new();
        for arg in &self.argv {
            sig.extend_from_slice(arg.as_bytes());
            sig.push(0);
        }
        for (k, v) in &self.env {
            sig.extend_from_slice(k.as_bytes());
            sig.push(b'=');
            sig.extend_from_slice(v.as_bytes());
            sig.push(0);
        }
        sig
    }

    fn execute(&self, inv: &Invocation) -> anyhow::Result<TaskResult> {
        process::run_command(&self.expand(inv), &self.env, Some(inv.cwd))
    }

    fn describe(&self, inv: &Invocation) -> String {
        self.expand(inv).join(" ")
    }
}

type Callback = dyn Fn(&Invocation) -> anyhow::Result<()> + Send + Sync;

/// An in-process action.  Returning Err() or panicking fails the build.
pub struct Function {
    name: String,
    contents: Vec<u8>,
    f: Box<Callback>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        Function {
            contents: name.clone().into_bytes(),
            name,
            f: Box::new(f),
        }
    }

    /// Overrides the bytes contributed to the signature; change them whenever
    /// the function's behavior changes.
    pub fn with_contents(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.contents = contents.into();
        self
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl Action for Function {
    fn signature_contribution(&self) -> Vec<u8> {
        self.contents.clone()
    }

    fn execute(&self, inv: &Invocation) -> anyhow::Result<TaskResult> {
        Ok(match catch_unwind(AssertUnwindSafe(|| (self.f)(inv))) {
            Ok(Ok(())) => TaskResult::success(),
            Ok(Err(err)) => TaskResult::failed(format!("{}: {:#}", self.name, err)),
            Err(payload) => {
                TaskResult::failed(format!("{}: panicked: {}", self.name, panic_message(&*payload)))
            }
        })
    }

    fn describe(&self, inv: &Invocation) -> String {
        format!(
            "{}([{}], [{}])",
            self.name,
            Invocation::joined(inv.targets),
            Invocation::joined(inv.sources)
        )
    }
}

/// Copies each source to the target at the same position.
pub struct Copy;

impl Action for Copy {
    fn signature_contribution(&self) -> Vec<u8> {
        b"Copy".to_vec()
    }

    fn execute(&self, inv: &Invocation) -> anyhow::Result<TaskResult> {
        if inv.targets.len() != inv.sources.len() {
            return Ok(TaskResult::failed(format!(
                "Copy: {} targets but {} sources",
                inv.targets.len(),
                inv.sources.len()
            )));
        }
        for (target, source) in inv.targets.iter().zip(inv.sources) {
            if let Err(err) = std::fs::copy(source, target) {
                return Ok(TaskResult::failed(format!(
                    "Copy {} -> {}: {}",
                    source.display(),
                    target.display(),
                    err
                )));
            }
        }
        Ok(TaskResult::success())
    }

    fn describe(&self, inv: &Invocation) -> String {
        format!(
            "Copy(\"{}\", \"{}\")",
            Invocation::joined(inv.targets),
            Invocation::joined(inv.sources)
        )
    }
}

impl TaskResult {
    pub fn success() -> Self {
        TaskResult {
            termination: Termination::Success,
            exit_code: None,
            output: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut output = message.into().into_bytes();
        output.push(b'\n');
        TaskResult {
            termination: Termination::Failure,
            exit_code: None,
            output,
        }
    }
}
