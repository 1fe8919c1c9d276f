use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::args::DriverArgs;
use crate::front::ast::TranslationUnit;
use crate::ir::Module;
use crate::latch::Latch;
use crate::pool::ThreadPool;
use crate::steps;
use crate::unit::CompilationUnit;

/// Index of a step inside its [`BuildGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepId(pub(crate) usize);

pub struct SysStep {
    pub command: String,
}

pub struct CcStep {
    pub source: PathBuf,
    pub(crate) tu: Mutex<Option<Arc<TranslationUnit>>>,
}

pub struct LdStep {
    pub(crate) cu: CompilationUnit,
}

/// Kind-specific payload; the three shapes are disjoint.
pub enum StepKind {
    Sys(SysStep),
    Cc(CcStep),
    Ld(LdStep),
}

/// One node in the driver's DAG.
pub struct BuildStep {
    pub(crate) kind: StepKind,
    pub(crate) deps: Vec<StepId>,
    /// Back-reference to the unique parent; set when the parent is built,
    /// before any submission.
    anti_dep: OnceLock<StepId>,
    ordinal: AtomicUsize,
    /// Completion barrier, one count per dependency.
    remaining: Latch,
    errors: AtomicUsize,
    error_root: AtomicBool,
    visited: AtomicBool,
}

impl BuildStep {
    fn new(kind: StepKind, deps: Vec<StepId>) -> Self {
        let remaining = Latch::new(deps.len());
        Self {
            kind,
            deps,
            anti_dep: OnceLock::new(),
            ordinal: AtomicUsize::new(0),
            remaining,
            errors: AtomicUsize::new(0),
            error_root: AtomicBool::new(false),
            visited: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// The step's index in its parent's dependency list, assigned before
    /// submission; doubles as the TU index inside the compilation unit.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }

    /// True when this step reported an error: its own body failed, or it
    /// short-circuited after failed dependencies.
    #[must_use]
    pub fn is_error_root(&self) -> bool {
        self.error_root.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn was_visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }
}

/// Per-run shared state: the optional pool and the logging mutex, created
/// and destroyed by [`BuildGraph::run`].
pub(crate) struct RunState {
    pub pool: Option<ThreadPool>,
    pub log: Mutex<()>,
}

/// The step DAG plus the args it was built against. Steps are stored in one
/// table; `anti_dep` back-references are indexes, never owning handles, so
/// teardown is a plain post-order drop.
pub struct BuildGraph {
    args: Arc<DriverArgs>,
    steps: Vec<BuildStep>,
}

impl BuildGraph {
    #[must_use]
    pub fn new(args: Arc<DriverArgs>) -> Self {
        Self {
            args,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn args(&self) -> &DriverArgs {
        &self.args
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> &BuildStep {
        &self.steps[id.0]
    }

    fn push(&mut self, step: BuildStep) -> StepId {
        self.steps.push(step);
        StepId(self.steps.len() - 1)
    }

    /// Create a step that runs an external command; the command is copied.
    pub fn sys(&mut self, command: &str) -> StepId {
        self.push(BuildStep::new(
            StepKind::Sys(SysStep {
                command: command.to_string(),
            }),
            Vec::new(),
        ))
    }

    /// Create a step compiling one C translation unit.
    pub fn cc(&mut self, source: impl Into<PathBuf>) -> StepId {
        self.push(BuildStep::new(
            StepKind::Cc(CcStep {
                source: source.into(),
                tu: Mutex::new(None),
            }),
            Vec::new(),
        ))
    }

    /// Create a link step over `deps`, back-linking each dep to it. The step
    /// owns a fresh compilation unit whose IR module is built for the target
    /// (empty feature set, JIT iff `args.run`).
    pub fn ld(&mut self, deps: Vec<StepId>) -> StepId {
        let module = Module::new(self.args.target.arch, self.args.target.os, self.args.run);
        let id = self.push(BuildStep::new(
            StepKind::Ld(LdStep {
                cu: CompilationUnit::new(module),
            }),
            deps.clone(),
        ));
        for dep in deps {
            self.steps[dep.0]
                .anti_dep
                .set(id)
                .expect("step already has a parent");
        }
        id
    }

    /// The TU a CC step produced, if any survived `preserve_ast`.
    ///
    /// # Panics
    ///
    /// Panics when `id` is not a CC step.
    #[must_use]
    pub fn cc_get_tu(&self, id: StepId) -> Option<Arc<TranslationUnit>> {
        match &self.step(id).kind {
            StepKind::Cc(cc) => cc.tu.lock().unwrap().clone(),
            _ => panic!("step {id:?} is not a CC step"),
        }
    }

    /// The compilation unit an LD step owns.
    ///
    /// # Panics
    ///
    /// Panics when `id` is not an LD step.
    #[must_use]
    pub fn ld_get_cu(&self, id: StepId) -> &CompilationUnit {
        match &self.step(id).kind {
            StepKind::Ld(ld) => &ld.cu,
            _ => panic!("step {id:?} is not an LD step"),
        }
    }

    /// The parent step, when it is an LD step.
    pub(crate) fn parent_ld(&self, id: StepId) -> Option<StepId> {
        let parent = *self.step(id).anti_dep.get()?;
        matches!(self.step(parent).kind, StepKind::Ld(_)).then_some(parent)
    }

    /// Report an error against the parent and mark this step as its root.
    pub(crate) fn step_error(&self, id: StepId) {
        let step = self.step(id);
        if let Some(&parent) = step.anti_dep.get() {
            self.step(parent).errors.fetch_add(1, Ordering::AcqRel);
        }
        step.error_root.store(true, Ordering::Release);
    }

    /// Signal completion to the parent's barrier. Every terminal path of a
    /// step body ends in exactly one `step_done`, failed or not.
    pub(crate) fn step_done(&self, id: StepId) {
        if let Some(&parent) = self.step(id).anti_dep.get() {
            self.step(parent).remaining.count_down();
        }
    }

    /// Execute the DAG rooted at `root`, optionally dispatching step bodies
    /// to `pool`. Returns `true` iff the root finished without errors.
    pub fn run(self: &Arc<Self>, root: StepId, pool: Option<&ThreadPool>) -> bool {
        let state = Arc::new(RunState {
            pool: pool.cloned(),
            log: Mutex::new(()),
        });
        self.submit(root, &state, false);
        let step = self.step(root);
        step.error_count() == 0 && !step.is_error_root()
    }

    /// Depth-first submission: ordinals are assigned before each child goes
    /// in, the barrier waits for all of them, and errors short-circuit the
    /// body.
    fn submit(self: &Arc<Self>, id: StepId, state: &Arc<RunState>, has_siblings: bool) {
        let step = self.step(id);
        let already = step.visited.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "step {id:?} submitted twice");

        let dep_count = step.deps.len();
        if dep_count > 0 {
            for (index, &dep) in step.deps.iter().enumerate() {
                self.step(dep).ordinal.store(index, Ordering::Release);
                self.submit(dep, state, dep_count > 1);
            }

            step.remaining.wait();

            // broken deps: forward the error, skip the body, and still
            // release our own parent's barrier
            if step.error_count() != 0 {
                self.step_error(id);
                self.step_done(id);
                return;
            }
        }

        if let Some(pool) = state.pool.as_ref().filter(|_| has_siblings) {
            debug!(step = id.0, "punting build step to the pool");
            let graph = Arc::clone(self);
            let state = Arc::clone(state);
            let pool = pool.clone();
            pool.submit(move || graph.invoke(id, &state));
        } else {
            // an only child has no parallelism to exploit
            self.invoke(id, state);
        }
    }

    pub(crate) fn invoke(&self, id: StepId, state: &RunState) {
        match &self.step(id).kind {
            StepKind::Sys(_) => steps::sys::invoke(self, id, state),
            StepKind::Cc(_) => steps::cc::invoke(self, id, state),
            StepKind::Ld(_) => steps::ld::invoke(self, id, state),
        }
    }
}
