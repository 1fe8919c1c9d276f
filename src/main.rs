#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Context;
use clap::{Parser, ValueEnum, ValueHint};
use tracing_subscriber::EnvFilter;

use cinder::args::{CVersion, DriverArgs, Flavor, Subsystem, Target};
use cinder::config::ProjectConfig;
use cinder::pool::ThreadPool;
use cinder::step::BuildGraph;
use cinder::toolchain::Toolchain;
use cinder::ui;

#[derive(Parser)]
#[command(name = "cinder", version, about = "A small C compiler.")]
struct Cli {
    /// C source files to compile.
    #[arg(value_name = "SOURCE", required = true, value_hint = ValueHint::FilePath)]
    sources: Vec<PathBuf>,

    /// Add a directory to the include search path.
    #[arg(short = 'I', long = "include", value_name = "DIR", value_hint = ValueHint::DirPath)]
    includes: Vec<PathBuf>,

    /// Add a directory to the library search path.
    #[arg(short = 'L', long = "libpath", value_name = "DIR", value_hint = ValueHint::DirPath)]
    libpaths: Vec<PathBuf>,

    /// Link against a library.
    #[arg(short = 'l', long = "library", value_name = "NAME")]
    libraries: Vec<String>,

    /// Predefine a macro as NAME or NAME=VALUE.
    #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    defines: Vec<String>,

    /// Target triple, e.g. x86_64-linux-gnu. Defaults to the host.
    #[arg(long, value_name = "TRIPLE")]
    target: Option<String>,

    /// Optimization level.
    #[arg(short = 'O', long = "opt", value_name = "LEVEL", default_value_t = 0)]
    opt_level: u8,

    /// Worker threads for the build.
    #[arg(long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// C language version.
    #[arg(long, value_name = "STD", value_enum, default_value = "c23")]
    std: StdArg,

    /// Print a banner for each build step.
    #[arg(short, long)]
    verbose: bool,

    /// Preprocess only and dump the token stream to stdout.
    #[arg(short = 'P', long)]
    preprocess: bool,

    /// Preprocess only, without dumping tokens.
    #[arg(long = "test-preproc")]
    test_preproc: bool,

    /// Stop after parsing and semantic analysis.
    #[arg(long = "syntax-only")]
    syntax_only: bool,

    /// Dump the parsed declaration trees to stdout.
    #[arg(long)]
    ast: bool,

    /// Print the IR instead of generating machine code.
    #[arg(long = "emit-ir")]
    emit_ir: bool,

    /// Print the generated assembly.
    #[arg(short = 'S', long)]
    assembly: bool,

    /// Emit debug information.
    #[arg(short = 'g', long = "debug-info")]
    debug_info: bool,

    /// Keep ASTs alive after compilation.
    #[arg(long = "preserve-ast")]
    preserve_ast: bool,

    /// JIT and run the program instead of linking it.
    #[arg(long)]
    run: bool,

    /// Do not link against the C runtime.
    #[arg(long)]
    nocrt: bool,

    /// Link with the internal linker instead of the system one.
    #[arg(long)]
    based: bool,

    /// Shape of the final artifact.
    #[arg(long, value_name = "FLAVOR", value_enum, default_value = "exe")]
    flavor: FlavorArg,

    /// Override the entrypoint symbol.
    #[arg(long, value_name = "SYMBOL")]
    entrypoint: Option<String>,

    /// Windows subsystem stamped into PE outputs.
    #[arg(long, value_name = "SUBSYSTEM", value_enum)]
    subsystem: Option<SubsystemArg>,

    /// Output file name.
    #[arg(short = 'o', long = "output", value_name = "PATH", value_hint = ValueHint::FilePath)]
    output_name: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StdArg {
    C11,
    C17,
    C23,
}

#[derive(Clone, Copy, ValueEnum)]
enum FlavorArg {
    /// Stop after the object file.
    Obj,
    /// Link an executable.
    Exe,
}

#[derive(Clone, Copy, ValueEnum)]
enum SubsystemArg {
    Console,
    Windows,
}

fn build_args(cli: Cli) -> anyhow::Result<DriverArgs> {
    let target = match &cli.target {
        Some(triple) => Target::parse(triple)?,
        None => Target::host(),
    };

    let config_dir = cli
        .sources
        .first()
        .and_then(|source| source.parent())
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let config = ProjectConfig::load_near(config_dir).context("project configuration")?;

    let subsystem = OnceLock::new();
    if let Some(arg) = cli.subsystem {
        let _ = subsystem.set(match arg {
            SubsystemArg::Console => Subsystem::Console,
            SubsystemArg::Windows => Subsystem::Windows,
        });
    }

    let mut args = DriverArgs {
        sources: cli.sources,
        includes: cli.includes,
        libpaths: cli.libpaths,
        libraries: Mutex::new(cli.libraries),
        defines: cli.defines,
        target,
        toolchain: Toolchain::host(),
        version: match cli.std {
            StdArg::C11 => CVersion::C11,
            StdArg::C17 => CVersion::C17,
            StdArg::C23 => CVersion::C23,
        },
        opt_level: cli.opt_level,
        threads: cli.threads.max(1),
        flavor: match cli.flavor {
            FlavorArg::Obj => Flavor::Object,
            FlavorArg::Exe => Flavor::Executable,
        },
        entrypoint: cli.entrypoint,
        subsystem,
        output_name: cli.output_name,
        verbose: cli.verbose,
        preprocess: cli.preprocess,
        test_preproc: cli.test_preproc,
        syntax_only: cli.syntax_only,
        ast: cli.ast,
        emit_ir: cli.emit_ir,
        assembly: cli.assembly,
        debug_info: cli.debug_info,
        preserve_ast: cli.preserve_ast,
        run: cli.run,
        nocrt: cli.nocrt,
        based: cli.based,
    };
    config.apply(&mut args);
    Ok(args)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = match build_args(cli) {
        Ok(args) => args,
        Err(err) => {
            ui::error(format!("{err:#}"));
            return ExitCode::FAILURE;
        }
    };

    let pool = if args.threads > 1 {
        match ThreadPool::new(args.threads) {
            Ok(pool) => Some(pool),
            Err(err) => {
                ui::error(err.to_string());
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let args = Arc::new(args);
    let mut graph = BuildGraph::new(Arc::clone(&args));
    let compiles: Vec<_> = args.sources.iter().map(|s| graph.cc(s.clone())).collect();
    let root = graph.ld(compiles);
    let graph = Arc::new(graph);

    if graph.run(root, pool.as_ref()) {
        ExitCode::SUCCESS
    } else {
        ui::error("build failed");
        ExitCode::FAILURE
    }
}
