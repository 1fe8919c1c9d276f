//! End-to-end driver scenarios: graph construction, execution over a pool,
//! error propagation, and artifact emission.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use cinder::args::{DriverArgs, Flavor, Target};
use cinder::pool::ThreadPool;
use cinder::step::BuildGraph;

fn write_source(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn linux_target() -> Target {
    Target::parse("x86_64-linux-gnu").unwrap()
}

#[test]
fn single_source_builds_an_executable_with_the_internal_linker() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "hello.c", "int main(void) { return 0; }\n");
    let out = dir.path().join("hello_bin");

    let mut args = DriverArgs::for_sources([&source]);
    args.target = linux_target();
    args.based = true;
    args.nocrt = true;
    args.output_name = Some(out.display().to_string());

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let cc = graph.cc(&source);
    let root = graph.ld(vec![cc]);
    let graph = Arc::new(graph);

    assert!(graph.run(root, None));
    assert_eq!(graph.step(root).error_count(), 0);

    let image = fs::read(&out).unwrap();
    assert_eq!(&image[..4], &[0x7F, b'E', b'L', b'F']);
}

#[test]
fn two_sources_feed_one_module_and_stop_at_the_object() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_source(dir.path(), "a.c", "int add(int x, int y) { return x + y; }\n");
    let b = write_source(
        dir.path(),
        "b.c",
        "int add(int x, int y);\nint main(void) { return add(1, 2); }\n",
    );
    let out = dir.path().join("x.o");

    let mut args = DriverArgs::for_sources([&a, &b]);
    args.target = linux_target();
    args.flavor = Flavor::Object;
    args.preserve_ast = true;
    args.output_name = Some(out.display().to_string());

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let cc_a = graph.cc(&a);
    let cc_b = graph.cc(&b);
    let root = graph.ld(vec![cc_a, cc_b]);
    let graph = Arc::new(graph);

    assert!(graph.run(root, None));

    // both TUs contributed to the one compilation unit, in dep order
    let units = graph.ld_get_cu(root).translation_units();
    assert_eq!(units.len(), 2);
    assert!(units[0].path.ends_with("a.c"));
    assert!(units[1].path.ends_with("b.c"));
    assert_eq!(units[0].ordinal(), 0);
    assert_eq!(units[1].ordinal(), 1);

    let object = fs::read(dir.path().join("x.o")).unwrap();
    assert_eq!(&object[..4], &[0x7F, b'E', b'L', b'F']);
}

#[test]
fn missing_library_fails_the_internal_link() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "u.c", "int main(void) { return 0; }\n");

    let mut args = DriverArgs::for_sources([&source]);
    args.target = linux_target();
    args.based = true;
    args.nocrt = true;
    args.libpaths.push(dir.path().to_path_buf());
    args.push_library("nope");
    args.output_name = Some(dir.path().join("u_bin").display().to_string());

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let cc = graph.cc(&source);
    let root = graph.ld(vec![cc]);
    let graph = Arc::new(graph);

    assert!(!graph.run(root, None));
    assert!(graph.step(root).is_error_root());
    assert!(!dir.path().join("u_bin").exists());
}

#[test]
fn ordinals_are_deterministic_under_a_pool() {
    let dir = tempfile::tempdir().unwrap();
    let sources: Vec<_> = (0..3)
        .map(|i| {
            write_source(
                dir.path(),
                &format!("s{i}.c"),
                &format!(
                    "#pragma comment(lib, \"dep{i}\")\nint f{i}(void) {{ return {i}; }}\n"
                ),
            )
        })
        .collect();

    let mut args = DriverArgs::for_sources(sources.iter());
    args.target = linux_target();
    args.threads = 2;
    args.flavor = Flavor::Object;
    args.preserve_ast = true;
    args.output_name = Some(dir.path().join("all.o").display().to_string());

    let pool = ThreadPool::new(2).unwrap();
    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let ccs: Vec<_> = sources.iter().map(|s| graph.cc(s)).collect();
    let root = graph.ld(ccs.clone());
    let graph = Arc::new(graph);

    assert!(graph.run(root, Some(&pool)));

    // TU ordinals match dep-list positions no matter which worker won
    let units = graph.ld_get_cu(root).translation_units();
    assert_eq!(units.len(), 3);
    for (index, unit) in units.iter().enumerate() {
        assert_eq!(unit.ordinal(), index);
        assert!(unit.path.ends_with(&format!("s{index}.c")));
    }
    for (index, &cc) in ccs.iter().enumerate() {
        assert_eq!(graph.step(cc).ordinal(), index);
        let tu = graph.cc_get_tu(cc).unwrap();
        assert_eq!(tu.ordinal(), index);
    }

    // pragma imports from all workers landed without loss
    let mut libs = args.libraries_snapshot();
    libs.sort();
    let expected: Vec<String> = ["dep0", "dep1", "dep2"]
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(libs, expected);
}

#[test]
fn ld_with_zero_deps_invokes_its_body_immediately() {
    let mut args = DriverArgs::for_sources(Vec::<std::path::PathBuf>::new());
    args.target = linux_target();
    args.syntax_only = true; // no codegen, the body just succeeds

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let root = graph.ld(Vec::new());
    let graph = Arc::new(graph);

    assert!(graph.run(root, None));
    assert!(graph.step(root).was_visited());
    assert_eq!(graph.step(root).error_count(), 0);
}

#[test]
fn single_dep_runs_inline_even_with_a_pool() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "only.c", "int main(void) { return 0; }\n");

    let mut args = DriverArgs::for_sources([&source]);
    args.target = linux_target();
    args.flavor = Flavor::Object;
    args.output_name = Some(dir.path().join("only.o").display().to_string());

    let pool = ThreadPool::new(2).unwrap();
    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let cc = graph.cc(&source);
    let root = graph.ld(vec![cc]);
    let graph = Arc::new(graph);

    assert!(graph.run(root, Some(&pool)));
    assert!(dir.path().join("only.o").exists());
}

#[test]
fn sys_step_failure_propagates_and_skips_the_parent() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut args = DriverArgs::for_sources(Vec::<std::path::PathBuf>::new());
    args.target = linux_target();
    args.syntax_only = true;

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let bad = graph.sys("false");
    let good = graph.sys(&format!("sh -c 'echo ok >> {}'", marker.display()));
    let root = graph.ld(vec![bad, good]);
    let graph = Arc::new(graph);

    assert!(!graph.run(root, None));

    // the failing sibling does not cancel the healthy one
    assert!(marker.exists());
    assert!(graph.step(bad).is_error_root());
    assert!(!graph.step(good).is_error_root());
    // the parent propagated rather than producing the error
    assert_eq!(graph.step(root).error_count(), 1);
    assert!(graph.step(root).is_error_root());
    assert!(graph.step(root).was_visited());
}

#[test]
fn every_sibling_body_runs_exactly_once_under_a_pool() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");

    let mut args = DriverArgs::for_sources(Vec::<std::path::PathBuf>::new());
    args.target = linux_target();
    args.syntax_only = true;

    let pool = ThreadPool::new(2).unwrap();
    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let deps: Vec<_> = (0..4)
        .map(|_| graph.sys(&format!("sh -c 'echo x >> {}'", log.display())))
        .collect();
    let root = graph.ld(deps);
    let graph = Arc::new(graph);

    assert!(graph.run(root, Some(&pool)));
    let lines = fs::read_to_string(&log).unwrap();
    assert_eq!(lines.lines().count(), 4);
}

#[test]
fn preprocess_mode_skips_the_parser() {
    let dir = tempfile::tempdir().unwrap();
    // not valid C, but the -P path never parses it
    let source = write_source(dir.path(), "broken.c", "int int int ((( {\n");

    let output = Command::new(env!("CARGO_BIN_EXE_cinder"))
        .arg("-P")
        .arg(&source)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("int int int "));
    assert!(stdout.contains("#line 1"));
}

#[test]
fn jit_mode_aborts_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "hello.c", "int main(void) { return 0; }\n");

    let output = Command::new(env!("CARGO_BIN_EXE_cinder"))
        .arg("--run")
        .arg(&source)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("C JIT not ready"));
}

#[test]
fn front_end_errors_fail_the_run_without_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(
        dir.path(),
        "bad.c",
        "int main(void) { return missing; }\n",
    );
    let out = dir.path().join("bad.o");

    let mut args = DriverArgs::for_sources([&source]);
    args.target = linux_target();
    args.flavor = Flavor::Object;
    args.output_name = Some(out.display().to_string());

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let cc = graph.cc(&source);
    let root = graph.ld(vec![cc]);
    let graph = Arc::new(graph);

    assert!(!graph.run(root, None));
    assert!(graph.step(cc).is_error_root());
    assert_eq!(graph.step(root).error_count(), 1);
    assert!(!out.exists());
}

#[test]
fn preprocessed_dump_reparses_to_the_same_diagnostics() {
    use cinder::args::CVersion;
    use cinder::front::diag::Diagnostics;
    use cinder::front::parser;
    use cinder::front::preprocess::preprocess_source;
    use cinder::front::sema;

    let text = "#define LIMIT 10\nint clamp(int v) { if (v > LIMIT) return LIMIT; return v; }\nint main(void) { return clamp(42); }\n";
    let args = DriverArgs::default();

    let counts = |name: &str, body: &str| {
        let pp = preprocess_source(&args, name, body, true).expect("preprocess");
        let parsed = parser::parse(CVersion::C23, pp.stream(), name);
        let diags = Diagnostics::new();
        let sema_errors = sema::check(&parsed.tu, &diags);
        let mut dumped = Vec::new();
        pp.stream().dump(&mut dumped).unwrap();
        (
            parsed.error_count,
            sema_errors,
            String::from_utf8(dumped).unwrap(),
        )
    };

    let (parse_a, sema_a, dump_a) = counts("orig.c", text);
    assert_eq!(parse_a, 0);
    assert_eq!(sema_a, 0);

    let (parse_b, sema_b, _) = counts("redump.c", &dump_a);
    assert_eq!(parse_a, parse_b);
    assert_eq!(sema_a, sema_b);
}
