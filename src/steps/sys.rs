use tracing::debug;

use crate::step::{BuildGraph, RunState, StepId, StepKind};
use crate::toolchain::run_command_line;
use crate::ui;

/// Run the external command synchronously; non-zero exit is a step error.
/// Output is inherited, not captured, and nothing is retried.
pub(crate) fn invoke(graph: &BuildGraph, id: StepId, state: &RunState) {
    let StepKind::Sys(sys) = &graph.step(id).kind else {
        unreachable!("sys body invoked on a non-sys step");
    };
    debug!(step = ?id, command = %sys.command, "sys step");

    match run_command_line(&sys.command) {
        Ok(status) if status.success() => {}
        Ok(_) => graph.step_error(id),
        Err(err) => {
            let _log = state.log.lock().unwrap();
            ui::error(format!("could not run `{}`: {err}", sys.command));
            graph.step_error(id);
        }
    }
    graph.step_done(id);
}
