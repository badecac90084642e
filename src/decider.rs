//! Deciders: whether a target is up to date with respect to what was recorded
//! when it was last built, and what to record after building it.

use crate::fs::Stamp;
use crate::hash::{ContentHash, HashAlgorithm};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeciderKind {
    /// A dependency changed if its stamp (mtime and size) differs from the
    /// recorded one.  Content is never read.
    Timestamp,
    /// make(1) semantics: a dependency changed if it is newer than the target.
    TimestampNewer,
    /// A dependency changed if its content digest differs.
    Content,
    /// Content, but an unchanged stamp short-circuits hashing.
    Hybrid,
}

impl DeciderKind {
    pub fn name(self) -> &'static str {
        match self {
            DeciderKind::Timestamp => "timestamp-match",
            DeciderKind::TimestampNewer => "timestamp-newer",
            DeciderKind::Content => "content",
            DeciderKind::Hybrid => "content-timestamp",
        }
    }

    /// Tag byte used in the signature store.
    pub fn tag(self) -> u8 {
        match self {
            DeciderKind::Timestamp => 1,
            DeciderKind::TimestampNewer => 2,
            DeciderKind::Content => 3,
            DeciderKind::Hybrid => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => DeciderKind::Timestamp,
            2 => DeciderKind::TimestampNewer,
            3 => DeciderKind::Content,
            4 => DeciderKind::Hybrid,
            _ => return None,
        })
    }

    /// Whether records written under this decider carry content digests.
    pub fn uses_content(self) -> bool {
        matches!(self, DeciderKind::Content | DeciderKind::Hybrid)
    }

    /// Whether a record written under `recorded` holds what this decider
    /// needs.  Every record carries stamps, so the timestamp deciders accept
    /// anything; Hybrid needs digests; Content needs digests that were
    /// verified by hashing rather than inferred from stamps.
    pub fn can_trust(self, recorded: DeciderKind) -> bool {
        match self {
            DeciderKind::Timestamp | DeciderKind::TimestampNewer => true,
            DeciderKind::Hybrid => recorded.uses_content(),
            DeciderKind::Content => recorded == DeciderKind::Content,
        }
    }
}

impl std::str::FromStr for DeciderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "timestamp" | "timestamp-match" => DeciderKind::Timestamp,
            "timestamp-newer" | "make" => DeciderKind::TimestampNewer,
            "content" | "md5" => DeciderKind::Content,
            "content-timestamp" | "md5-timestamp" | "hybrid" => DeciderKind::Hybrid,
            _ => {
                return Err(format!(
                    "unknown decider {:?}, expected timestamp-match, timestamp-newer, content or content-timestamp",
                    s
                ))
            }
        })
    }
}

impl std::fmt::Display for DeciderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What is recorded about one node: its stamp if it is an on-disk file, and
/// its content digest if the decider reads content (always for nodes with no
/// stamp, like aliases and values).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub stamp: Option<Stamp>,
    pub csig: Option<ContentHash>,
}

/// The record kept for a target after its last successful build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub decider: DeciderKind,
    pub algorithm: HashAlgorithm,
    pub target: NodeInfo,
    /// Digest of the action's signature contribution.
    pub action: ContentHash,
    /// Every dirtying dependency (explicit then implicit), in order.
    pub deps: Vec<(String, NodeInfo)>,
    /// The subset of deps found by scanning, wanted again on the next run
    /// before the scanner gets a chance to run.
    pub implicit: Vec<String>,
    /// Wall-clock seconds when the record was made.
    pub recorded_at: i64,
}

impl BuildInfo {
    /// Whether every stamp in the record predates the record itself.  Only
    /// then may an unchanged stamp stand in for the content it was hashed
    /// from; a file stamped in the same second may have been rewritten after
    /// hashing without its stamp moving.
    pub fn is_settled(&self) -> bool {
        self.target
            .stamp
            .iter()
            .chain(self.deps.iter().filter_map(|(_, info)| info.stamp.as_ref()))
            .all(|stamp| stamp.secs < self.recorded_at)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecideError {
    #[error("{0}: no such file")]
    Missing(String),
    #[error("{path}: {message}")]
    Io { path: String, message: String },
}

impl DecideError {
    pub fn io(path: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            DecideError::Missing(path.to_owned())
        } else {
            DecideError::Io {
                path: path.to_owned(),
                message: err.to_string(),
            }
        }
    }
}

/// Why a target must be rebuilt.  Displays as the tail of an explanation,
/// e.g. "because `foo.h' changed".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    TargetMissing,
    NoRecord,
    AlwaysBuild,
    Forced,
    DeciderChanged(DeciderKind),
    HashFormatChanged(HashAlgorithm),
    ActionChanged,
    NewDependency(String),
    DependencyRemoved(String),
    DependencyOrder,
    Changed(String),
    TargetChanged,
    /// The previous state could not be determined.
    Unknown(DecideError),
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::TargetMissing => write!(f, "because it doesn't exist"),
            Reason::NoRecord => write!(f, "because there is no record of building it"),
            Reason::AlwaysBuild => write!(f, "because AlwaysBuild() is specified"),
            Reason::Forced => write!(f, "because a rebuild was forced"),
            Reason::DeciderChanged(was) => {
                write!(f, "because the decider changed (was {})", was)
            }
            Reason::HashFormatChanged(was) => {
                write!(f, "because the hash format changed (was {})", was)
            }
            Reason::ActionChanged => write!(f, "because the build action changed"),
            Reason::NewDependency(dep) => write!(f, "because `{}' is a new dependency", dep),
            Reason::DependencyRemoved(dep) => {
                write!(f, "because `{}' is no longer a dependency", dep)
            }
            Reason::DependencyOrder => write!(f, "because the dependency order changed"),
            Reason::Changed(dep) => write!(f, "because `{}' changed", dep),
            Reason::TargetChanged => write!(f, "because it changed since it was built"),
            Reason::Unknown(err) => write!(f, "because its state is unknown ({})", err),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Current,
    Stale(Reason),
    /// Deciding failed; always acted on as stale.
    Error(DecideError),
}

impl Decision {
    pub fn is_current(&self) -> bool {
        matches!(self, Decision::Current)
    }

    /// The reason to rebuild, if any.
    pub fn reason(self) -> Option<Reason> {
        match self {
            Decision::Current => None,
            Decision::Stale(reason) => Some(reason),
            Decision::Error(err) => Some(Reason::Unknown(err)),
        }
    }
}

/// The current state of a node, as seen by a decider.  Digests are pulled
/// on demand so that deciders which never read content never pay for it.
pub trait Sample {
    /// The on-disk stamp; None for missing files and for nodes that have no
    /// on-disk presence.
    fn stamp(&self) -> Option<Stamp>;
    /// The content digest.
    fn csig(&self) -> Result<ContentHash, DecideError>;
}

/// Everything besides the target itself that goes into a decision.
pub struct Inputs<'a> {
    /// Digest of the action's signature contribution.
    pub action: &'a ContentHash,
    /// Dirtying dependencies in order: explicit first, then implicit.
    pub deps: &'a [(&'a str, &'a dyn Sample)],
    pub algorithm: HashAlgorithm,
}

fn csig_differs(dep: &dyn Sample, prev: &NodeInfo) -> Result<bool, DecideError> {
    match &prev.csig {
        None => Ok(true),
        Some(prev) => Ok(dep.csig()? != *prev),
    }
}

pub trait Decider: Send + Sync {
    fn kind(&self) -> DeciderKind;

    /// Whether a dependency differs from what was recorded for it.
    /// `target` is the target's current state and `recorded_at` the time the
    /// target's record was made.
    fn changed(
        &self,
        dep: &dyn Sample,
        prev: &NodeInfo,
        target: Option<Stamp>,
        recorded_at: i64,
    ) -> Result<bool, DecideError>;

    /// Compares a target and its inputs against the target's record.  Any
    /// doubt resolves to stale.
    fn is_current(
        &self,
        target: &dyn Sample,
        record: Option<&BuildInfo>,
        inputs: &Inputs,
    ) -> Decision {
        let stamp = match target.stamp() {
            Some(stamp) => stamp,
            None => return Decision::Stale(Reason::TargetMissing),
        };
        let record = match record {
            Some(record) => record,
            None => return Decision::Stale(Reason::NoRecord),
        };
        if !self.kind().can_trust(record.decider) {
            return Decision::Stale(Reason::DeciderChanged(record.decider));
        }
        if record.algorithm != inputs.algorithm {
            return Decision::Stale(Reason::HashFormatChanged(record.algorithm));
        }
        if record.action != *inputs.action {
            return Decision::Stale(Reason::ActionChanged);
        }

        let same_deps = record.deps.len() == inputs.deps.len()
            && record
                .deps
                .iter()
                .zip(inputs.deps)
                .all(|((old, _), (new, _))| old == new);
        if !same_deps {
            if let Some((new, _)) = inputs
                .deps
                .iter()
                .find(|(name, _)| !record.deps.iter().any(|(old, _)| old == name))
            {
                return Decision::Stale(Reason::NewDependency(new.to_string()));
            }
            if let Some((old, _)) = record
                .deps
                .iter()
                .find(|(old, _)| !inputs.deps.iter().any(|(name, _)| name == old))
            {
                return Decision::Stale(Reason::DependencyRemoved(old.clone()));
            }
            return Decision::Stale(Reason::DependencyOrder);
        }

        for ((name, dep), (_, prev)) in inputs.deps.iter().zip(&record.deps) {
            match self.changed(*dep, prev, Some(stamp), record.recorded_at) {
                Ok(false) => {}
                Ok(true) => return Decision::Stale(Reason::Changed(name.to_string())),
                Err(err) => return Decision::Error(err),
            }
        }

        // The output itself may have been edited by hand.
        if self.kind() != DeciderKind::TimestampNewer {
            match self.changed(target, &record.target, Some(stamp), record.recorded_at) {
                Ok(false) => {}
                Ok(true) => return Decision::Stale(Reason::TargetChanged),
                Err(err) => return Decision::Error(err),
            }
        }
        Decision::Current
    }

    /// Builds the record to store after a successful build.
    fn compute(
        &self,
        target: &dyn Sample,
        inputs: &Inputs,
        implicit: Vec<String>,
        recorded_at: i64,
    ) -> Result<BuildInfo, DecideError> {
        let content = self.kind().uses_content();
        let target_stamp = target.stamp();
        let target_info = NodeInfo {
            stamp: target_stamp,
            csig: if content && target_stamp.is_some() {
                Some(target.csig()?)
            } else {
                None
            },
        };
        let mut deps = Vec::with_capacity(inputs.deps.len());
        for (name, dep) in inputs.deps {
            let stamp = dep.stamp();
            let csig = if content || stamp.is_none() {
                Some(dep.csig()?)
            } else {
                None
            };
            deps.push((name.to_string(), NodeInfo { stamp, csig }));
        }
        Ok(BuildInfo {
            decider: self.kind(),
            algorithm: inputs.algorithm,
            target: target_info,
            action: inputs.action.clone(),
            deps,
            implicit,
            recorded_at,
        })
    }
}

pub struct TimestampMatch;

impl Decider for TimestampMatch {
    fn kind(&self) -> DeciderKind {
        DeciderKind::Timestamp
    }

    fn changed(
        &self,
        dep: &dyn Sample,
        prev: &NodeInfo,
        _target: Option<Stamp>,
        _recorded_at: i64,
    ) -> Result<bool, DecideError> {
        match (dep.stamp(), prev.stamp) {
            (None, None) => csig_differs(dep, prev),
            (now, then) => Ok(now != then),
        }
    }
}

pub struct TimestampNewer;

impl Decider for TimestampNewer {
    fn kind(&self) -> DeciderKind {
        DeciderKind::TimestampNewer
    }

    fn changed(
        &self,
        dep: &dyn Sample,
        prev: &NodeInfo,
        target: Option<Stamp>,
        _recorded_at: i64,
    ) -> Result<bool, DecideError> {
        match (dep.stamp(), target) {
            (Some(dep), Some(target)) => Ok(dep.newer_than(&target)),
            (None, _) if prev.stamp.is_none() => csig_differs(dep, prev),
            _ => Ok(true),
        }
    }
}

pub struct Content;

impl Decider for Content {
    fn kind(&self) -> DeciderKind {
        DeciderKind::Content
    }

    fn changed(
        &self,
        dep: &dyn Sample,
        prev: &NodeInfo,
        _target: Option<Stamp>,
        _recorded_at: i64,
    ) -> Result<bool, DecideError> {
        csig_differs(dep, prev)
    }
}

pub struct Hybrid;

impl Decider for Hybrid {
    fn kind(&self) -> DeciderKind {
        DeciderKind::Hybrid
    }

    fn changed(
        &self,
        dep: &dyn Sample,
        prev: &NodeInfo,
        _target: Option<Stamp>,
        recorded_at: i64,
    ) -> Result<bool, DecideError> {
        if let (Some(now), Some(then)) = (dep.stamp(), prev.stamp) {
            // A file whose mtime falls in the same second as the record (or
            // later) may have been rewritten since without the stamp moving.
            if now == then && prev.csig.is_some() && now.secs < recorded_at {
                return Ok(false);
            }
        }
        csig_differs(dep, prev)
    }
}

pub fn decider_for(kind: DeciderKind) -> Box<dyn Decider> {
    match kind {
        DeciderKind::Timestamp => Box::new(TimestampMatch),
        DeciderKind::TimestampNewer => Box::new(TimestampNewer),
        DeciderKind::Content => Box::new(Content),
        DeciderKind::Hybrid => Box::new(Hybrid),
    }
}
