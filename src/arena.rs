use std::cell::RefCell;

use crate::ir::Inst;

/// Scratch arena for IR construction and per-function passes.
///
/// One arena lives on each worker thread, lazily created on first use and
/// cleared (capacity retained) between batches in the immediate-codegen path.
#[derive(Default)]
pub struct IrArena {
    insts: Vec<Inst>,
    values: Vec<i64>,
}

impl IrArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scratch instruction buffer; contents survive until [`IrArena::clear`].
    pub fn insts(&mut self) -> &mut Vec<Inst> {
        &mut self.insts
    }

    /// Scratch operand stack used by the folding and codegen passes.
    pub fn values(&mut self) -> &mut Vec<i64> {
        &mut self.values
    }

    /// Reset the arena without releasing its chunks.
    pub fn clear(&mut self) {
        self.insts.clear();
        self.values.clear();
    }

    #[must_use]
    pub fn current_size(&self) -> usize {
        self.insts.len() * size_of::<Inst>() + self.values.len() * size_of::<i64>()
    }
}

thread_local! {
    static IR_ARENA: RefCell<IrArena> = RefCell::new(IrArena::new());
}

/// Run `f` with the calling worker's arena.
///
/// The arena is bound to this thread for the duration of the call; nested
/// borrows would panic, so passes never re-enter.
pub fn with_ir_arena<R>(f: impl FnOnce(&mut IrArena) -> R) -> R {
    IR_ARENA.with(|arena| f(&mut arena.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::with_ir_arena;

    #[test]
    fn arena_is_reused_across_tasks() {
        with_ir_arena(|arena| {
            arena.values().push(42);
        });
        with_ir_arena(|arena| {
            assert_eq!(arena.values().as_slice(), &[42]);
            arena.clear();
        });
        with_ir_arena(|arena| {
            assert!(arena.values().is_empty());
            assert_eq!(arena.current_size(), 0);
        });
    }
}
