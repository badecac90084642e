//! Filesystem access, indirected through a trait so tests and deciders can
//! run against in-memory state.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// What stat() observed for an existing file: modification time at whatever
/// granularity the OS reports, plus size.  Size rides along so that a rewrite
/// within one coarse clock tick that changes length is still noticed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stamp {
    pub secs: i64,
    pub nanos: u32,
    pub size: u64,
}

impl Stamp {
    /// Whether this stamp's mtime is strictly later than `other`'s.
    pub fn newer_than(&self, other: &Stamp) -> bool {
        (self.secs, self.nanos) > (other.secs, other.nanos)
    }
}

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MTime {
    Missing,
    Stamp(Stamp),
}

impl MTime {
    pub fn stamp(&self) -> Option<Stamp> {
        match self {
            MTime::Missing => None,
            MTime::Stamp(s) => Some(*s),
        }
    }
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> std::io::Result<MTime>;
    /// The on-disk location of a graph path, for handing to actions.
    fn resolve(&self, path: &str) -> PathBuf;
    /// Deletes a file; an already missing file is not an error.
    fn remove(&self, path: &str) -> std::io::Result<()>;
}

/// The real filesystem, with relative graph paths resolved against `root`.
pub struct RealFileSystem {
    root: PathBuf,
}

impl RealFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RealFileSystem { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Converts std metadata into a Stamp.  Times before the epoch clamp to zero
/// rather than failing the stat.
pub fn stamp_of(meta: &std::fs::Metadata) -> std::io::Result<Stamp> {
    let mtime = meta.modified()?;
    let (secs, nanos) = match mtime.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(_) => (0, 0),
    };
    Ok(Stamp {
        secs,
        nanos,
        size: meta.len(),
    })
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        Ok(match std::fs::metadata(self.resolve(path)) {
            Ok(meta) => MTime::Stamp(stamp_of(&meta)?),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    MTime::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn remove(&self, path: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.resolve(path)) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }
}
