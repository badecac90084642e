use super::*;
use s2::action::Function;
use s2::graph::{Build, DepKind, Graph};
use s2::options::Options;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn batch_runs_once_for_all_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.y", "grammar")?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let src = graph.file("a.y");
    let c = graph.file("a.tab.c");
    let h = graph.file("a.tab.h");
    let user = graph.file("user.o");
    graph.add_build(Build::new(cat(&counter)).targets([c, h]).sources([src]))?;
    graph.add_build(Build::new(cat(&counter)).targets([user]).sources([h]))?;
    let opts = Options {
        targets: vec!["user.o".into(), "a.tab.c".into()],
        ..options()
    };

    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 2);
    assert_eq!(space.read("a.tab.c")?, "grammar");
    assert_eq!(space.read("a.tab.h")?, "grammar");

    space.remove("a.tab.h")?;
    let (summary, _) = space.build(&mut graph, &opts)?;
    // One missing target reruns the whole batch; user.o sees identical input.
    assert_eq!(summary.executed, 1);
    assert_eq!(counter.get(), 3);
    Ok(())
}

#[test]
fn batch_covers_every_target_when_one_source_changes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f1.in", "one")?;
    space.write("f2.in", "two")?;
    let counter = Counter::default();
    let calls = counter.clone();
    let pairwise = Function::new("pairwise", move |inv| {
        calls.bump();
        for (src, target) in inv.sources.iter().zip(inv.targets) {
            std::fs::copy(src, target)?;
        }
        Ok(())
    });
    let mut graph = Graph::new();
    let ins = [graph.file("f1.in"), graph.file("f2.in")];
    let outs = [graph.file("f1.out"), graph.file("f2.out")];
    graph.add_build(Build::new(Arc::new(pairwise)).targets(outs).sources(ins))?;
    let opts = Options {
        targets: vec!["f1.out".into(), "f2.out".into()],
        ..options()
    };

    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);

    space.write("f2.in", "TWO!")?;
    let (summary, recorder) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    assert_eq!(counter.get(), 2);
    assert_eq!(recorder.started(), vec!["pairwise([f1.out f2.out], [f1.in f2.in])"]);
    assert_eq!(space.read("f1.out")?, "one");
    assert_eq!(space.read("f2.out")?, "TWO!");

    let (summary, _) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn order_only_prerequisites_do_not_dirty() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;
    space.write("gen.src", "1")?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let src = graph.file("in");
    let gen_src = graph.file("gen.src");
    let gen = graph.file("gen");
    let out = graph.file("out");
    graph.add_build(Build::new(cat(&counter)).targets([gen]).sources([gen_src]))?;
    graph.add_build(Build::new(cat(&counter)).targets([out]).sources([src]))?;
    graph.add_dependency(out, gen, DepKind::OrderOnly);
    let opts = Options {
        targets: vec!["out".into()],
        ..options()
    };

    let (_, recorder) = space.build(&mut graph, &opts)?;
    assert_eq!(recorder.started(), vec!["cat([gen], [gen.src])", "cat([out], [in])"]);

    space.write("gen.src", "2")?;
    let (summary, recorder) = space.build(&mut graph, &opts)?;
    assert_eq!(summary.executed, 1);
    assert_eq!(recorder.started(), vec!["cat([gen], [gen.src])"]);
    Ok(())
}

#[test]
fn descriptions_replace_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;
    let counter = Counter::default();
    let mut graph = Graph::new();
    let src = graph.file("in");
    let out = graph.file("out");
    graph.add_build(
        Build::new(cat(&counter))
            .targets([out])
            .sources([src])
            .desc("CAT out"),
    )?;
    let opts = Options {
        targets: vec!["out".into()],
        ..options()
    };
    let (_, recorder) = space.build(&mut graph, &opts)?;
    assert_eq!(recorder.started(), vec!["CAT out"]);

    space.write("in", "y")?;
    let verbose = Options {
        verbose: true,
        ..opts
    };
    let (_, recorder) = space.build(&mut graph, &verbose)?;
    assert_eq!(recorder.started(), vec!["cat([out], [in])"]);
    Ok(())
}

/// A diamond, wide enough that parallel workers have something to do.
fn diamond(counter: &Counter) -> anyhow::Result<Graph> {
    let mut graph = Graph::new();
    let src = graph.file("src");
    let top = graph.file("top");
    let mut mids = Vec::new();
    for i in 0..8 {
        let mid = graph.file(&format!("mid/{}", i));
        graph.add_build(Build::new(cat(counter)).targets([mid]).sources([src]))?;
        mids.push(mid);
    }
    graph.add_build(Build::new(cat(counter)).targets([top]).sources(mids))?;
    Ok(graph)
}

#[test]
fn parallel_and_inline_modes_agree() -> anyhow::Result<()> {
    for parallelism in [0, 1, 4] {
        let space = TestSpace::new()?;
        space.write("src", "s")?;
        let counter = Counter::default();
        let mut graph = diamond(&counter)?;
        let opts = Options {
            parallelism,
            targets: vec!["top".into()],
            ..options()
        };
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert!(summary.success());
        assert_eq!(summary.executed, 9);
        assert_eq!(space.read("top")?, "ssssssss");
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 0);
    }
    Ok(())
}

#[test]
fn random_order_respects_dependencies() -> anyhow::Result<()> {
    for seed in 0..4 {
        let space = TestSpace::new()?;
        space.write("src", "s")?;
        let counter = Counter::default();
        let mut graph = diamond(&counter)?;
        let opts = Options {
            parallelism: 3,
            random: true,
            seed: Some(seed),
            targets: vec!["top".into()],
            ..options()
        };
        let (summary, recorder) = space.build(&mut graph, &opts)?;
        assert!(summary.success());
        assert_eq!(
            recorder.started().last().map(String::as_str),
            Some("cat([top], [mid/0 mid/1 mid/2 mid/3 mid/4 mid/5 mid/6 mid/7])")
        );
    }
    Ok(())
}

#[test]
fn shared_side_effects_never_overlap() -> anyhow::Result<()> {
    for seed in 0..4 {
        let space = TestSpace::new()?;
        space.write("in", "x")?;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut graph = Graph::new();
        let src = graph.file("in");
        let log = graph.file("shared.log");
        let mut targets = Vec::new();
        for i in 0..4 {
            let name = format!("out{}", i);
            let out = graph.file(&name);
            let (active, peak) = (active.clone(), peak.clone());
            let action = Function::new("logged", move |inv| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
                std::fs::write(&inv.targets[0], "")?;
                Ok(())
            });
            graph.add_build(Build::new(Arc::new(action)).targets([out]).sources([src]))?;
            graph.add_dependency(out, log, DepKind::SideEffect);
            targets.push(name);
        }
        let opts = Options {
            parallelism: 4,
            random: true,
            seed: Some(seed),
            targets,
            ..options()
        };
        let (summary, _) = space.build(&mut graph, &opts)?;
        assert_eq!(summary.executed, 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
    Ok(())
}
