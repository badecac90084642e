//! s2sign: prints the contents of an s2 signature store.

use argh::FromArgs;
use s2::decider::NodeInfo;
use s2::store::{Layout, SignatureStore};
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(FromArgs)]
/// Print the records of an s2 signature store.
struct Args {
    /// directory holding the store
    #[argh(option, short = 'C', default = "String::from(\".\")")]
    dir: String,

    /// store layout: central or per-dir
    #[argh(option, default = "Layout::Central")]
    store_layout: Layout,

    /// only print the record for this target; may be repeated
    #[argh(option, short = 'e')]
    entry: Vec<String>,

    /// drop records whose target no longer exists
    #[argh(switch)]
    prune_missing: bool,
}

fn node_info(info: &NodeInfo) -> String {
    let csig = match &info.csig {
        Some(hash) => hash.hex(),
        None => "None".to_owned(),
    };
    match &info.stamp {
        Some(stamp) => format!("{} {}.{:09} {}", csig, stamp.secs, stamp.nanos, stamp.size),
        None => format!("{} None None", csig),
    }
}

fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    let top = Path::new(&args.dir);
    if !top.is_dir() {
        anyhow::bail!("{}: not a directory", top.display());
    }
    let mut store = SignatureStore::open(top, args.store_layout)?;
    store.load_all()?;

    if args.prune_missing {
        let dropped = store.prune(|name| top.join(name).exists())?;
        store.flush()?;
        println!("pruned {} records", dropped);
    }

    let mut missing = 0;
    for name in &args.entry {
        if store.get(name).is_none() {
            eprintln!("s2sign: no record for {:?}", name);
            missing += 1;
        }
    }

    for (name, info) in store.entries() {
        if !args.entry.is_empty() && !args.entry.iter().any(|e| e == name) {
            continue;
        }
        println!("{}: {}", name, node_info(&info.target));
        for (dep, dep_info) in &info.deps {
            println!("        {}: {}", dep, node_info(dep_info));
        }
        println!("        {} [{}]", info.action.hex(), info.decider);
    }
    Ok(if missing > 0 { 1 } else { 0 })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("s2sign: error: {}", err);
            2
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
