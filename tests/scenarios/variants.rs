use super::*;
use s2::graph::{Build, Graph};
use s2::options::Options;

fn variant(counter: &Counter, duplicate: bool) -> anyhow::Result<Graph> {
    let mut graph = Graph::new();
    graph.variant_dir("build", "src", duplicate);
    let src = graph.file("build/a.c");
    let obj = graph.file("build/a.o");
    graph.add_build(Build::new(cat(counter)).targets([obj]).sources([src]))?;
    Ok(graph)
}

fn want_obj() -> Options {
    Options {
        targets: vec!["build/a.o".into()],
        ..options()
    }
}

#[test]
fn duplicated_sources_are_copied() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src/a.c", "one")?;
    let counter = Counter::default();
    let mut graph = variant(&counter, true)?;

    let (summary, _) = space.build(&mut graph, &want_obj())?;
    assert_eq!(summary.executed, 2);
    assert_eq!(space.read("build/a.c")?, "one");
    assert_eq!(space.read("build/a.o")?, "one");

    space.write("src/a.c", "two")?;
    let (summary, _) = space.build(&mut graph, &want_obj())?;
    assert_eq!(summary.executed, 2);
    assert_eq!(space.read("build/a.o")?, "two");

    let (summary, _) = space.build(&mut graph, &want_obj())?;
    assert_eq!(summary.executed, 0);
    Ok(())
}

#[test]
fn sources_are_read_in_place() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src/a.c", "one")?;
    let counter = Counter::default();
    let mut graph = variant(&counter, false)?;

    let (summary, recorder) = space.build(&mut graph, &want_obj())?;
    assert_eq!(summary.executed, 1);
    assert_eq!(recorder.started(), vec!["cat([build/a.o], [src/a.c])"]);
    assert!(!space.exists("build/a.c"));
    assert_eq!(space.read("build/a.o")?, "one");

    space.write("src/a.c", "two")?;
    let (summary, _) = space.build(&mut graph, &want_obj())?;
    assert_eq!(summary.executed, 1);
    assert_eq!(space.read("build/a.o")?, "two");
    Ok(())
}

#[test]
fn missing_variant_source_names_the_source_tree() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let counter = Counter::default();
    let mut graph = variant(&counter, false)?;
    let err = space.build(&mut graph, &want_obj()).err().unwrap();
    assert_eq!(
        err.to_string(),
        "source `src/a.c' not found, needed by target `build/a.c'"
    );
    Ok(())
}
