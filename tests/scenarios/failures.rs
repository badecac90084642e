use super::*;
use s2::context::{BuildContext, Policy};
use s2::decider::DeciderKind;
use s2::fs::RealFileSystem;
use s2::graph::{Build, Graph, GraphError, NodeFlags};
use s2::hash::HashAlgorithm;
use s2::options::Options;
use s2::store::{Layout, SignatureStore};
use s2::work::Work;

fn want(targets: &[&str]) -> Options {
    Options {
        targets: targets.iter().map(|t| t.to_string()).collect(),
        ..options()
    }
}

#[test]
fn missing_source_is_reported_before_building() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("b.c", "")?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let a = graph.file("a.c");
    let b = graph.file("b.c");
    let out = graph.file("out");
    graph.add_build(Build::new(cat(&counter)).targets([out]).sources([a, b]))?;

    let err = space.build(&mut graph, &want(&["out"])).err().unwrap();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::MissingSources(vec![("a.c".into(), "out".into())]))
    );
    assert_eq!(
        err.to_string(),
        "source `a.c' not found, needed by target `out'"
    );
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn cycles_are_reported_before_building() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let a = graph.file("a");
    let b = graph.file("b");
    graph.add_build(Build::new(cat(&counter)).targets([a]).sources([b]))?;
    graph.add_build(Build::new(cat(&counter)).targets([b]).sources([a]))?;

    let err = space.build(&mut graph, &want(&["a"])).err().unwrap();
    match err.downcast_ref::<GraphError>() {
        Some(GraphError::Cycle(path)) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert_eq!(counter.get(), 0);
    Ok(())
}

/// bad.out fails; good.out is independent; top.out needs both.
fn mixed(bad: &Counter, good: &Counter) -> anyhow::Result<Graph> {
    let mut graph = Graph::new();
    let src = graph.file("in");
    let bad_out = graph.file("bad.out");
    let good_out = graph.file("good.out");
    let top = graph.file("top.out");
    graph.add_build(Build::new(fail(bad)).targets([bad_out]).sources([src]))?;
    graph.add_build(Build::new(cat(good)).targets([good_out]).sources([src]))?;
    graph.add_build(Build::new(cat(good)).targets([top]).sources([bad_out, good_out]))?;
    Ok(graph)
}

#[test]
fn failure_stops_the_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;
    let (bad, good) = (Counter::default(), Counter::default());
    let mut graph = mixed(&bad, &good)?;

    let (summary, recorder) = space.build(&mut graph, &want(&["top.out"]))?;
    assert!(!summary.success());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].target, "bad.out");
    assert!(summary.failed[0].message.contains("deliberate failure"));
    assert_eq!(good.get(), 0);
    assert_eq!(
        recorder.finished.borrow()[0].1,
        s2::process::Termination::Failure
    );
    Ok(())
}

#[test]
fn keep_going_builds_what_it_can() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;
    let (bad, good) = (Counter::default(), Counter::default());
    let mut graph = mixed(&bad, &good)?;

    let opts = Options {
        keep_going: true,
        ..want(&["top.out"])
    };
    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.skipped, vec!["top.out".to_string()]);
    assert_eq!(summary.executed, 1);
    assert!(space.exists("good.out"));
    assert!(!space.exists("top.out"));
    Ok(())
}

#[test]
fn failed_build_keeps_its_previous_record() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "good")?;
    let mut graph = Graph::new();
    let src = graph.file("in");
    let out = graph.file("out");
    let action = Function::new("picky", |inv| {
        let text = std::fs::read_to_string(&inv.sources[0])?;
        if text.contains("bad") {
            anyhow::bail!("refusing {:?}", text);
        }
        std::fs::write(&inv.targets[0], text)?;
        Ok(())
    });
    graph.add_build(Build::new(Arc::new(action)).targets([out]).sources([src]))?;
    // Precious, so the failed attempt leaves the old output in place.
    graph.set_flags(
        out,
        NodeFlags {
            precious: true,
            ..NodeFlags::default()
        },
    );

    space.build(&mut graph, &want(&["out"]))?;
    space.write("in", "bad")?;
    let (summary, _) = space.build(&mut graph, &want(&["out"]))?;
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(space.read("out")?, "good");

    // Back to what was last built successfully: nothing to do.
    space.write("in", "good")?;
    let (summary, _) = space.build(&mut graph, &want(&["out"]))?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn failing_command_reports_exit_code() -> anyhow::Result<()> {
    if cfg!(windows) {
        return Ok(());
    }
    let space = TestSpace::new()?;
    space.write("in", "")?;
    let mut graph = Graph::new();
    let src = graph.file("in");
    let out = graph.file("out");
    let action = s2::action::Command::shell("echo oops; exit 3");
    graph.add_build(Build::new(Arc::new(action)).targets([out]).sources([src]))?;

    let (summary, _) = space.build(&mut graph, &want(&["out"]))?;
    assert_eq!(summary.failed[0].exit_code, Some(3));
    assert_eq!(summary.failed[0].message, "oops");
    Ok(())
}

#[test]
fn cancel_stops_dispatching() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;
    let store = SignatureStore::open(space.path(), Layout::Central)?;
    let ctx = BuildContext::new(
        Box::new(RealFileSystem::new(space.path())),
        store,
        DeciderKind::Content,
        HashAlgorithm::Sha256,
        Policy::default(),
    );

    let mut graph = Graph::new();
    let src = graph.file("in");
    let first = graph.file("first");
    let second = graph.file("second");
    let cancel = ctx.cancel.clone();
    let interrupting = Function::new("interrupting", move |inv| {
        std::fs::write(&inv.targets[0], "done")?;
        cancel.cancel();
        Ok(())
    });
    let counter = Counter::default();
    graph.add_build(Build::new(Arc::new(interrupting)).targets([first]).sources([src]))?;
    graph.add_build(Build::new(cat(&counter)).targets([second]).sources([src]))?;
    graph.freeze()?;

    let recorder = Recorder::default();
    let mut work = Work::new(&graph, &ctx, &recorder);
    work.want_node(first);
    work.want_node(second);
    let summary = work.run()?;
    assert!(summary.interrupted);
    assert_eq!(summary.executed, 1);
    assert_eq!(counter.get(), 0);

    // What finished before the interrupt is recorded.
    let mut store = ctx.store.lock().unwrap();
    assert!(store.get("first").is_some());
    assert!(store.get("second").is_none());
    Ok(())
}
