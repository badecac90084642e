use super::*;
use s2::action::Function;
use s2::decider::{BuildInfo, DeciderKind};
use s2::graph::{Build, Graph};
use s2::hash::HashAlgorithm;
use s2::options::Options;
use s2::store::{Layout, SignatureStore};

fn single(counter: &Counter) -> anyhow::Result<Graph> {
    let mut graph = Graph::new();
    let src = graph.file("a.c");
    let out = graph.file("a.o");
    graph.add_build(Build::new(cat(counter)).targets([out]).sources([src]))?;
    Ok(graph)
}

fn with(decider: DeciderKind) -> Options {
    Options {
        decider,
        targets: vec!["a.o".into()],
        ..options()
    }
}

const OLD: i64 = 1_000_000_000;

#[test]
fn timestamp_match_sees_touches() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::Timestamp);

    space.build(&mut graph, &opts)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);

    // Same content, different mtime.
    space.set_mtime("a.c", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    Ok(())
}

#[test]
fn content_ignores_touches() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::Content);

    space.build(&mut graph, &opts)?;
    space.set_mtime("a.c", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn hybrid_ignores_touches() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::Hybrid);

    space.build(&mut graph, &opts)?;
    space.set_mtime("a.c", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);

    space.write("a.c", "y")?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    Ok(())
}

#[test]
fn hybrid_trusts_settled_stamps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    space.set_mtime("a.c", OLD)?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    space.build(&mut graph, &with(DeciderKind::Hybrid))?;

    // A same-size edit that restores the old mtime goes unnoticed by the
    // stamp fast path.
    space.write("a.c", "y")?;
    space.set_mtime("a.c", OLD)?;
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Hybrid))?;
    assert_eq!(summary.executed, 0);
    // Content never trusts a hybrid record, so it rebuilds and sees the edit.
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Content))?;
    assert_eq!(summary.executed, 1);
    assert_eq!(space.read("a.o")?, "y");
    Ok(())
}

#[test]
fn hybrid_hashes_stamps_newer_than_the_record() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let future = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs() as i64
        + 3600;
    space.write("a.c", "x")?;
    space.set_mtime("a.c", future)?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::Hybrid);
    space.build(&mut graph, &opts)?;

    space.write("a.c", "y")?;
    space.set_mtime("a.c", future)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    Ok(())
}

#[test]
fn hybrid_restamps_records_it_has_verified() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::Hybrid);
    space.build(&mut graph, &opts)?;

    // Both stamps moved but no content did: hashed, found current, and the
    // record takes the new stamps.
    space.set_mtime("a.c", OLD)?;
    space.set_mtime("a.o", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);
    let mut store = SignatureStore::open(space.path(), Layout::Central)?;
    let record = store.get("a.o").expect("record").clone();
    assert_eq!(record.target.stamp.map(|s| s.secs), Some(OLD));
    assert_eq!(record.deps[0].1.stamp.map(|s| s.secs), Some(OLD));
    assert!(record.is_settled());

    // From here on the stamps alone are trusted.
    space.write("a.c", "y")?;
    space.set_mtime("a.c", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn dry_runs_do_not_restamp() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    space.build(&mut graph, &with(DeciderKind::Hybrid))?;

    space.set_mtime("a.c", OLD)?;
    let dry = Options {
        dry_run: true,
        ..with(DeciderKind::Hybrid)
    };
    let (summary, _) = space.build(&mut graph, &dry)?;
    assert_eq!(summary.executed, 0);
    let mut store = SignatureStore::open(space.path(), Layout::Central)?;
    let record = store.get("a.o").expect("record");
    assert_ne!(record.deps[0].1.stamp.map(|s| s.secs), Some(OLD));
    Ok(())
}

#[test]
fn inputs_edited_during_their_build_are_seen_next_run() -> anyhow::Result<()> {
    for decider in [DeciderKind::Hybrid, DeciderKind::Content] {
        let space = TestSpace::new()?;
        space.write("a.c", "old")?;
        let counter = Counter::default();
        let runs = counter.clone();
        // Copies its source, then edits it in place on the first run only.
        let action = Function::new("copy_then_edit", move |inv| {
            runs.bump();
            std::fs::copy(&inv.sources[0], &inv.targets[0])?;
            if runs.get() == 1 {
                std::fs::write(&inv.sources[0], "new")?;
            }
            Ok(())
        });
        let mut graph = Graph::new();
        let src = graph.file("a.c");
        let out = graph.file("a.o");
        graph.add_build(Build::new(Arc::new(action)).targets([out]).sources([src]))?;
        let opts = with(decider);

        space.build(&mut graph, &opts)?;
        assert_eq!(space.read("a.o")?, "old");
        assert_eq!(space.read("a.c")?, "new");

        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 1, "{}", decider.name());
        assert_eq!(space.read("a.o")?, "new");
        assert_eq!(counter.get(), 2);
    }
    Ok(())
}

#[test]
fn timestamp_newer_compares_against_the_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    space.set_mtime("a.c", OLD)?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let opts = with(DeciderKind::TimestampNewer);
    space.build(&mut graph, &opts)?;

    // Older than the target: not a change, whatever the content.
    space.write("a.c", "different")?;
    space.set_mtime("a.c", OLD + 1)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);

    space.set_mtime("a.o", OLD)?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    assert_eq!(space.read("a.o")?, "different");
    Ok(())
}

#[test]
fn switching_deciders() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;

    space.build(&mut graph, &with(DeciderKind::Timestamp))?;
    // Timestamp records carry no digests: content rebuilds once.
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Content))?;
    assert_eq!(summary.executed, 1);
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Content))?;
    assert_eq!(summary.executed, 0);
    // Content records carry stamps too.
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Timestamp))?;
    assert_eq!(summary.executed, 0);
    let (summary, _) = space.build(&mut graph, &with(DeciderKind::Hybrid))?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn switching_hash_format_rebuilds_once() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "x")?;
    let counter = Counter::default();
    let mut graph = single(&counter)?;
    let md5 = Options {
        hash_format: HashAlgorithm::Md5,
        ..with(DeciderKind::Content)
    };

    space.build(&mut graph, &with(DeciderKind::Content))?;
    let (summary, _) = space.build(&mut graph, &md5)?;
    assert_eq!(summary.executed, 1);
    let (summary, _) = space.build(&mut graph, &md5)?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn per_directory_store() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src/a.c", "x")?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let src = graph.file("src/a.c");
    let out = graph.file("obj/a.o");
    graph.add_build(Build::new(cat(&counter)).targets([out]).sources([src]))?;
    let opts = Options {
        store_layout: Layout::PerDirectory,
        targets: vec!["obj/a.o".into()],
        ..options()
    };

    space.build(&mut graph, &opts)?;
    assert!(space.exists("obj/.s2sign"));
    assert!(!space.exists(".s2sign"));
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);

    let mut store = SignatureStore::open(space.path(), Layout::PerDirectory)?;
    let record = store.get("obj/a.o").expect("record");
    assert_eq!(record.deps[0].0, "src/a.c");

    // The same files read as a central store hold nothing.
    let store = SignatureStore::open(space.path(), Layout::Central)?;
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn content_edits_rebuild_once_and_change_the_record() -> anyhow::Result<()> {
    for layout in [Layout::Central, Layout::PerDirectory] {
        let space = TestSpace::new()?;
        space.write("f2.in", "abc")?;
        let counter = Counter::default();
        let mut graph = Graph::new();
        let src = graph.file("f2.in");
        let out = graph.file("f2.out");
        graph.add_build(Build::new(cat(&counter)).targets([out]).sources([src]))?;
        let opts = Options {
            decider: DeciderKind::Hybrid,
            store_layout: layout,
            targets: vec!["f2.out".into()],
            ..options()
        };
        let record = || -> anyhow::Result<BuildInfo> {
            let mut store = SignatureStore::open(space.path(), layout)?;
            Ok(store.get("f2.out").expect("record").clone())
        };

        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 1);
        let first = record()?;
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 0);

        // A touch is hashed and found identical.
        space.set_mtime("f2.in", OLD)?;
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 0);

        space.write("f2.in", "abcd")?;
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 1);
        assert_eq!(counter.get(), 2);
        let second = record()?;
        assert_ne!(second.deps[0].1.csig, first.deps[0].1.csig);
        assert_ne!(second.target.csig, first.target.csig);
    }
    Ok(())
}
