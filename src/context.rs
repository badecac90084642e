//! Run-wide state shared by the scheduler, the deciders and the executor.

use crate::decider::{decider_for, Decider, DeciderKind};
use crate::fs::FileSystem;
use crate::hash::{DigestCache, HashAlgorithm};
use crate::store::SignatureStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// How a run treats failures and what it is allowed to do.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Keep building independent work after a failure.
    pub keep_going: bool,
    /// Report what would be built without running anything.
    pub dry_run: bool,
    /// Rebuild every target regardless of signatures.
    pub force: bool,
    /// Pick randomly among ready builds, seeded for reproducibility.
    pub random: Option<u64>,
    /// Log why each target is rebuilt.
    pub explain: bool,
    /// Print full command lines rather than descriptions.
    pub verbose: bool,
    /// Worker threads; 0 runs actions on the scheduling thread.
    pub parallelism: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            keep_going: false,
            dry_run: false,
            force: false,
            random: None,
            explain: false,
            verbose: false,
            parallelism: 1,
        }
    }
}

/// A cooperative stop request, checked before each dispatch.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || crate::signal::was_interrupted()
    }
}

pub struct BuildContext {
    pub fs: Box<dyn FileSystem>,
    /// The one piece of state workers and the scheduler might both want;
    /// every access goes through the lock.
    pub store: Mutex<SignatureStore>,
    pub decider: Box<dyn Decider>,
    pub algorithm: HashAlgorithm,
    pub digests: DigestCache,
    pub policy: Policy,
    pub cancel: Cancel,
    /// Wall-clock seconds when the context was made, before any file was
    /// hashed through it.  Records written in this run carry this time.
    pub started_at: i64,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl BuildContext {
    pub fn new(
        fs: Box<dyn FileSystem>,
        store: SignatureStore,
        decider: DeciderKind,
        algorithm: HashAlgorithm,
        policy: Policy,
    ) -> Self {
        BuildContext {
            fs,
            store: Mutex::new(store),
            decider: decider_for(decider),
            algorithm,
            digests: DigestCache::new(),
            policy,
            cancel: Cancel::new(),
            started_at: unix_now(),
        }
    }
}
