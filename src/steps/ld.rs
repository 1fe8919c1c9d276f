use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use itertools::Itertools;
use tracing::debug;

use crate::args::{DriverArgs, Flavor, TargetOs};
use crate::constants::{DEFAULT_OUTPUT_UNIX, DEFAULT_OUTPUT_WINDOWS, OBJECT_EXT};
use crate::ir::Module;
use crate::ir::obj::{DebugFormat, export_object};
use crate::link::{ExecFormat, LibrarySearch, Linker, LinkerMsg};
use crate::step::{BuildGraph, RunState, StepId, StepKind};
use crate::ui;

/// Join the finished CC children into the final artifact: tear the AST down,
/// resolve the output path, and emit through the internal linker or an
/// object file plus the system linker.
pub(crate) fn invoke(graph: &BuildGraph, id: StepId, state: &RunState) {
    let step = graph.step(id);
    let StepKind::Ld(ld) = &step.kind else {
        unreachable!("ld body invoked on a non-ld step");
    };
    let args = graph.args();

    if args.verbose {
        let _log = state.log.lock().unwrap();
        ui::step("LINK");
    }
    debug!(step = ?id, units = ld.cu.len(), "ld step");

    // the front end is complete; keep the ASTs only on request
    if !args.preserve_ast {
        ld.cu.clear();
    }

    if !args.does_codegen() {
        graph.step_done(id);
        return;
    }

    let output_path = resolve_output_path(args);

    if args.run {
        eprintln!("C JIT not ready :(");
        process::exit(1);
    }

    let module = ld.cu.module();
    if args.based && args.flavor != Flavor::Object {
        internal_link(graph, id, state, args, module, &output_path);
    } else {
        external_link(graph, id, args, module, &output_path);
    }
    graph.step_done(id);
}

/// `a.exe`/`a.out` when unnamed; `.exe` appended for extensionless names on
/// Windows targets; otherwise the name verbatim.
fn resolve_output_path(args: &DriverArgs) -> PathBuf {
    let windows = args.target.os == TargetOs::Windows;
    match &args.output_name {
        None => PathBuf::from(if windows {
            DEFAULT_OUTPUT_WINDOWS
        } else {
            DEFAULT_OUTPUT_UNIX
        }),
        Some(name) => {
            let path = PathBuf::from(name);
            if windows && path.extension().is_none() {
                path.with_extension("exe")
            } else {
                path
            }
        }
    }
}

fn internal_link(
    graph: &BuildGraph,
    id: StepId,
    state: &RunState,
    args: &DriverArgs,
    module: &Module,
    output_path: &PathBuf,
) {
    let format = match args.target.os {
        TargetOs::Windows => ExecFormat::Pe,
        TargetOs::Linux => ExecFormat::Elf,
        _ => {
            ui::error("unsupported platform to link with");
            graph.step_error(id);
            return;
        }
    };

    let mut linker = Linker::new(format, args.target.arch);
    let search = LibrarySearch::from_args(args);

    let mut missing = 0usize;
    for input in search.inputs() {
        let Some(path) = search.find(input) else {
            eprintln!("could not find library: {input}");
            graph.step_error(id);
            missing += 1;
            continue;
        };
        match fs::read(&path) {
            Ok(data) => linker.append_library(path.display().to_string(), data),
            Err(err) => {
                eprintln!("could not read library {}: {err}", path.display());
                graph.step_error(id);
                missing += 1;
            }
        }
    }
    if missing > 0 {
        let _log = state.log.lock().unwrap();
        eprintln!("library search paths:");
        for path in search.paths() {
            eprintln!("  {}", path.display());
        }
        return;
    }
    debug!(libraries = linker.library_count(), "linker inputs resolved");

    linker.append_module(module);
    if let Some(entry) = &args.entrypoint {
        linker.set_entrypoint(entry.clone());
    }
    if let Some(&subsystem) = args.subsystem.get() {
        linker.set_subsystem(subsystem);
    }

    while let Some(message) = linker.poll_message() {
        match message {
            // import request handling is reserved
            LinkerMsg::Import { .. } => {}
        }
    }

    match linker.export() {
        Ok(buffer) => {
            if let Err(err) = fs::write(output_path, buffer) {
                ui::error(format!(
                    "could not write `{}`: {err}",
                    output_path.display()
                ));
                graph.step_error(id);
            }
        }
        Err(err) => {
            ui::error(format!("link failed: {err}"));
            graph.step_error(id);
        }
    }
}

/// `<first source>.o` when no output name was given, else the output path
/// with an `.o` extension; with no sources at all the object derives from
/// the resolved output path.
fn derive_object_path(args: &DriverArgs, output_path: &Path) -> PathBuf {
    if args.output_name.is_none() {
        args.sources.first().map_or_else(
            || output_path.with_extension(OBJECT_EXT),
            |source| source.with_extension(OBJECT_EXT),
        )
    } else {
        output_path.with_extension(OBJECT_EXT)
    }
}

fn external_link(
    graph: &BuildGraph,
    id: StepId,
    args: &DriverArgs,
    module: &Module,
    output_path: &PathBuf,
) {
    let object_path = derive_object_path(args, output_path);

    let debug_format = if args.debug_info {
        DebugFormat::CodeView
    } else {
        DebugFormat::None
    };
    let buffer = export_object(module, debug_format);
    if let Err(err) = fs::write(&object_path, buffer) {
        ui::error(format!(
            "could not write `{}`: {err}",
            object_path.display()
        ));
        graph.step_error(id);
        return;
    }
    debug!(object = %object_path.display(), "object written");

    if args.flavor == Flavor::Object {
        return;
    }

    let search = LibrarySearch::from_args(args);
    debug!(
        inputs = %search.inputs().iter().join(" "),
        "invoking system linker"
    );
    match args.toolchain.invoke_linker(
        &[object_path],
        search.paths(),
        search.inputs(),
        output_path,
    ) {
        Ok(status) if status.success() => {}
        Ok(status) => {
            ui::error(format!("linker exited with {status}"));
            graph.step_error(id);
        }
        Err(err) => {
            ui::error(format!("could not invoke system linker: {err}"));
            graph.step_error(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_object_path, resolve_output_path};
    use crate::args::{DriverArgs, Target};
    use std::path::{Path, PathBuf};

    fn with_target(triple: &str) -> DriverArgs {
        let mut args = DriverArgs::default();
        args.target = Target::parse(triple).unwrap();
        args
    }

    #[test]
    fn default_output_names_follow_the_target() {
        let linux = with_target("x86_64-linux-gnu");
        assert_eq!(resolve_output_path(&linux), Path::new("a.out"));

        let windows = with_target("x86_64-windows-msvc");
        assert_eq!(resolve_output_path(&windows), Path::new("a.exe"));
    }

    #[test]
    fn extensionless_names_get_exe_only_on_windows() {
        let mut windows = with_target("x86_64-windows-msvc");
        windows.output_name = Some("game".to_string());
        assert_eq!(resolve_output_path(&windows), Path::new("game.exe"));

        windows.output_name = Some("game.bin".to_string());
        assert_eq!(resolve_output_path(&windows), Path::new("game.bin"));

        let mut linux = with_target("x86_64-linux-gnu");
        linux.output_name = Some("game".to_string());
        assert_eq!(resolve_output_path(&linux), Path::new("game"));
    }

    #[test]
    fn object_path_prefers_the_first_source() {
        let mut args = with_target("x86_64-linux-gnu");
        args.sources = vec![PathBuf::from("src/hello.c")];
        let output = resolve_output_path(&args);
        assert_eq!(
            derive_object_path(&args, &output),
            PathBuf::from("src/hello.o")
        );
    }

    #[test]
    fn object_path_falls_back_to_the_output_path() {
        // no sources, no output name: derive from the default output
        let args = with_target("x86_64-linux-gnu");
        let output = resolve_output_path(&args);
        assert_eq!(derive_object_path(&args, &output), PathBuf::from("a.o"));
    }

    #[test]
    fn named_outputs_drive_the_object_name() {
        let mut args = with_target("x86_64-linux-gnu");
        args.sources = vec![PathBuf::from("hello.c")];
        args.output_name = Some("dist/tool".to_string());
        let output = resolve_output_path(&args);
        assert_eq!(
            derive_object_path(&args, &output),
            PathBuf::from("dist/tool.o")
        );
    }
}
