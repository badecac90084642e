//! Run configuration: what to build and how.  The same struct is parsed from
//! the command line by argh and built in code by library callers.

use crate::context::Policy;
use crate::decider::DeciderKind;
use crate::hash::HashAlgorithm;
use crate::store::Layout;
use argh::FromArgs;

#[derive(FromArgs, Debug, Clone)]
/// Bring targets up to date.
pub struct Options {
    /// worker threads; 0 runs actions one at a time on the scheduling thread
    #[argh(option, short = 'j', default = "default_parallelism()")]
    pub parallelism: usize,

    /// keep building independent targets after a failure
    #[argh(switch, short = 'k')]
    pub keep_going: bool,

    /// print what would be built without building it
    #[argh(switch, short = 'n')]
    pub dry_run: bool,

    /// rebuild every requested target
    #[argh(switch)]
    pub force: bool,

    /// remove derived files instead of building them
    #[argh(switch, short = 'c')]
    pub clean: bool,

    /// how to tell a dependency changed: timestamp-match, timestamp-newer,
    /// content or content-timestamp
    #[argh(option, default = "DeciderKind::Content")]
    pub decider: DeciderKind,

    /// content digest: md5, sha1 or sha256
    #[argh(option, default = "HashAlgorithm::Sha256")]
    pub hash_format: HashAlgorithm,

    /// signature store layout: central or per-dir
    #[argh(option, default = "Layout::Central")]
    pub store_layout: Layout,

    /// pick ready tasks in random order
    #[argh(switch)]
    pub random: bool,

    /// seed for --random
    #[argh(option)]
    pub seed: Option<u64>,

    /// print why each target is rebuilt
    #[argh(switch)]
    pub explain: bool,

    /// print full command lines
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    /// drop stored signatures for nodes that are no longer in the graph
    #[argh(switch)]
    pub prune: bool,

    /// write a chrome trace to this file
    #[argh(option)]
    pub trace: Option<String>,

    /// targets to build; the defaults if none are given
    #[argh(positional)]
    pub targets: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: default_parallelism(),
            keep_going: false,
            dry_run: false,
            force: false,
            clean: false,
            decider: DeciderKind::Content,
            hash_format: HashAlgorithm::Sha256,
            store_layout: Layout::Central,
            random: false,
            seed: None,
            explain: false,
            verbose: false,
            prune: false,
            trace: None,
            targets: Vec::new(),
        }
    }
}

impl Options {
    pub fn policy(&self) -> Policy {
        let random = if self.random {
            Some(self.seed.unwrap_or_else(rand::random))
        } else {
            None
        };
        Policy {
            keep_going: self.keep_going,
            dry_run: self.dry_run,
            force: self.force,
            random,
            explain: self.explain,
            verbose: self.verbose,
            parallelism: self.parallelism,
        }
    }
}
