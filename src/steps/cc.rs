use std::io::{self, Write};
use std::sync::Arc;

use tracing::debug;

use crate::front::diag::Diagnostics;
use crate::front::parser;
use crate::front::preprocess::preprocess_file;
use crate::front::sema;
use crate::ir;
use crate::step::{BuildGraph, RunState, StepId, StepKind};
use crate::ui;

use super::irgen;

/// Compile one translation unit: preprocess, parse, register with the parent
/// LD, check, and hand the TU off to the backend fan-out. Each phase
/// short-circuits to the diagnostic flush + completion path.
pub(crate) fn invoke(graph: &BuildGraph, id: StepId, state: &RunState) {
    let step = graph.step(id);
    let StepKind::Cc(cc) = &step.kind else {
        unreachable!("cc body invoked on a non-cc step");
    };
    let args = graph.args();

    if args.verbose {
        let _log = state.log.lock().unwrap();
        ui::step(format!("CC {}", cc.source.display()));
    }
    debug!(step = ?id, source = %cc.source.display(), "cc step");

    // Preprocessing flushes its own diagnostics and frees the context when
    // it fails.
    let Some(pp) = preprocess_file(args, &cc.source, true) else {
        graph.step_error(id);
        graph.step_done(id);
        return;
    };
    let tokens = pp.stream();
    let diags = tokens.diags.clone();

    if args.preprocess {
        {
            let _log = state.log.lock().unwrap();
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let _ = tokens.dump(&mut out);
            let _ = out.flush();
        }
        return finish(graph, id, state, &diags, false);
    }
    if args.test_preproc {
        return finish(graph, id, state, &diags, false);
    }

    let source_name = cc.source.display().to_string();
    let result = parser::parse(args.version, tokens, &source_name);
    if result.error_count > 0 {
        return finish(graph, id, state, &diags, true);
    }
    debug!(step = ?id, decls = result.tu.top_level_count(), "parsed file");

    let mut tu = result.tu;
    tu.set_ordinal(step.ordinal());
    let tu = Arc::new(tu);
    *cc.tu.lock().unwrap() = Some(Arc::clone(&tu));

    let parent_ld = graph.parent_ld(id);
    if let Some(ld) = parent_ld {
        // one locked section: pragma imports, then the TU at its ordinal
        graph
            .ld_get_cu(ld)
            .register(args, &tokens.imports, Arc::clone(&tu));
    }

    if sema::check(&tu, &diags) > 0 {
        return finish(graph, id, state, &diags, true);
    }

    if args.syntax_only {
        return finish(graph, id, state, &diags, false);
    }
    if args.ast {
        {
            let _log = state.log.lock().unwrap();
            let stdout = io::stdout();
            let mut out = stdout.lock();
            match parent_ld {
                Some(ld) => {
                    for unit in graph.ld_get_cu(ld).translation_units() {
                        let _ = unit.dump(&mut out);
                    }
                }
                None => {
                    let _ = tu.dump(&mut out);
                }
            }
        }
        return finish(graph, id, state, &diags, false);
    }

    // display what the front end collected before any backend work
    {
        let _log = state.log.lock().unwrap();
        diags.flush_to_stderr();
    }

    if let Some(ld) = parent_ld {
        let cu = graph.ld_get_cu(ld);
        let module = cu.module();

        ir::allocate_ir(&tu, state.pool.as_ref(), module, args.debug_info);
        irgen::run(state.pool.as_ref(), args, cu, module);

        // line info is spent once diagnostics and debug info are done
        drop(pp);

        if args.opt_level > 0 || args.assembly || args.emit_ir {
            irgen::per_function(state.pool.as_ref(), args, module);
        }
    }

    if !args.preserve_ast {
        debug!(step = ?id, "destroying translation unit");
        *cc.tu.lock().unwrap() = None;
    }
    graph.step_done(id);
}

/// Early-exit and error path: flush diagnostics under the log mutex, report
/// the error if any, and release the parent's barrier.
fn finish(graph: &BuildGraph, id: StepId, state: &RunState, diags: &Diagnostics, failed: bool) {
    {
        let _log = state.log.lock().unwrap();
        diags.flush_to_stderr();
    }
    if failed {
        graph.step_error(id);
    }
    graph.step_done(id);
}
