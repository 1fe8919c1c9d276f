use std::io::{self, Write};
use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::arena::with_ir_arena;
use crate::args::{DriverArgs, Subsystem};
use crate::front::ast::{EntrypointStatus, TranslationUnit};
use crate::ir::{Module, Symbol, top_level_codegen};
use crate::ir::passes::PassContext;
use crate::pool::ThreadPool;
use crate::unit::CompilationUnit;

/// Partition size for fan-out batches: a few batches per worker, but large
/// enough that a batch outweighs the pool's scheduling overhead.
pub(crate) fn good_batch_size(threads: usize, top_level_count: usize) -> usize {
    let per = top_level_count.div_ceil(threads.max(1) * 4);
    per.clamp(8, 512).min(top_level_count.max(1))
}

struct IrTask<'a> {
    module: &'a Module,
    tu: Arc<TranslationUnit>,
    args: &'a DriverArgs,
    range: Range<usize>,
}

/// Fan the compilation unit's top-level declarations out across the workers.
///
/// Walks every registered TU: tallies declarations (setting the Windows
/// subsystem when a `WinMain` entrypoint appears and none was configured),
/// slices each TU's declaration vector into contiguous batches, and submits
/// one task per batch. Returns only when every batch has completed; without
/// a pool the same work runs serially, one TU at a time.
pub(crate) fn run(
    pool: Option<&ThreadPool>,
    args: &DriverArgs,
    cu: &CompilationUnit,
    module: &Module,
) {
    let tus = cu.translation_units();

    let mut top_level_count = 0;
    for tu in &tus {
        if tu.entrypoint == EntrypointStatus::WinMain && args.subsystem.get().is_none() {
            let _ = args.subsystem.set(Subsystem::Windows);
        }
        top_level_count += tu.top_level_count();
    }
    if top_level_count == 0 {
        return;
    }

    match pool {
        Some(pool) => {
            let batch_size = good_batch_size(args.threads, top_level_count);
            let task_capacity = top_level_count.div_ceil(batch_size);
            debug!(top_level_count, batch_size, task_capacity, "irgen fan-out");

            pool.fan_out(|scope| {
                for tu in &tus {
                    let total = tu.top_level_count();
                    let mut start = 0;
                    while start < total {
                        let end = (start + batch_size).min(total);
                        let task = IrTask {
                            module,
                            tu: Arc::clone(tu),
                            args,
                            range: start..end,
                        };
                        scope.spawn(move |_| irgen_job(task));
                        start = end;
                    }
                }
            });
        }
        None => {
            for tu in &tus {
                irgen_job(IrTask {
                    module,
                    tu: Arc::clone(tu),
                    args,
                    range: 0..tu.top_level_count(),
                });
            }
        }
    }
}

fn irgen_job(task: IrTask<'_>) {
    // unoptimized builds can compile functions without the rest of the
    // module being ready
    let compiles_immediately =
        task.args.opt_level == 0 && !task.args.emit_ir && !task.args.assembly;

    with_ir_arena(|arena| {
        for decl in &task.tu.top_level[task.range.clone()] {
            if decl.attrs.is_typedef || !decl.attrs.is_used() {
                continue;
            }
            let symbol = top_level_codegen(&task.tu, task.module, arena, decl);

            if compiles_immediately
                && let Some(symbol) = symbol
                && symbol.is_defined_function()
            {
                let mut pass = PassContext::enter(&symbol, arena);
                pass.codegen(false);
                pass.exit();
                debug!(
                    name = %decl.name,
                    bytes = arena.current_size(),
                    "clearing IR arena"
                );
                arena.clear();
            }
        }
    });
}

/// Per-function pass over every defined function in the module: optimize at
/// `-O1+`, print IR under `--emit-ir`, otherwise run codegen and print the
/// assembly when asked.
pub(crate) fn per_function(pool: Option<&ThreadPool>, args: &DriverArgs, module: &Module) {
    let functions = module.functions();
    if functions.is_empty() {
        return;
    }

    match pool {
        Some(pool) => {
            let batch_size = good_batch_size(args.threads, functions.len());
            pool.fan_out(|scope| {
                for chunk in functions.chunks(batch_size) {
                    scope.spawn(move |_| {
                        for symbol in chunk {
                            apply_func(symbol, args);
                        }
                    });
                }
            });
        }
        None => {
            for symbol in &functions {
                apply_func(symbol, args);
            }
        }
    }
}

fn apply_func(symbol: &Arc<Symbol>, args: &DriverArgs) {
    with_ir_arena(|arena| {
        let mut pass = PassContext::enter(symbol, arena);

        if args.opt_level >= 1 {
            pass.optimize();
        }

        if args.emit_ir {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let _ = pass.print(&mut out);
            let _ = out.flush();
        } else {
            let output = pass.codegen(args.assembly);
            if args.assembly
                && let Some(output) = output
                && let Some(asm) = output.asm
            {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                let _ = out.write_all(asm.as_bytes());
                let _ = out.flush();
            }
        }

        pass.exit();
    });
}

#[cfg(test)]
mod tests {
    use super::good_batch_size;

    #[test]
    fn batches_cover_the_work_without_degenerating() {
        for threads in [1, 2, 8, 32] {
            for count in [1, 7, 100, 10_000, 1_000_000] {
                let batch = good_batch_size(threads, count);
                assert!(batch >= 1);
                assert!(batch <= count.max(8));
                let tasks = count.div_ceil(batch);
                assert!(tasks * batch >= count);
            }
        }
    }

    #[test]
    fn tiny_workloads_get_a_single_batch() {
        assert_eq!(good_batch_size(8, 1), 1);
        assert_eq!(good_batch_size(8, 3), 3);
    }
}
