//! The shared IR module and the lowering from checked ASTs into it.

pub mod obj;
pub mod passes;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::debug;

use crate::arena::IrArena;
use crate::args::{Arch, TargetOs};
use crate::front::ast::{
    BinOp, Decl, DeclBody, Expr, ExprId, Statement, TranslationUnit, UnaryOp,
};
use crate::pool::ThreadPool;

/// Stack-machine instruction set the code generator consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    PushConst(i64),
    PushLocal(usize),
    StoreLocal(usize),
    PushGlobal(String),
    PushGlobalAddr(String),
    StoreGlobal(String),
    Binary(BinOp),
    Neg,
    Not,
    Call { callee: String, argc: usize },
    /// Pop and test; jump to the instruction index when zero.
    BranchZero(usize),
    Jump(usize),
    Pop,
    Ret { has_value: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    Export,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymKind {
    Function,
    Global,
}

/// Relocation recorded against a function's code.
#[derive(Clone, Debug)]
pub struct Reloc {
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// `call rel32`
    Call,
    /// rip-relative 32-bit data access
    Rip32,
}

#[derive(Clone, Debug, Default)]
pub struct FunctionOutput {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub asm: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IrFunction {
    pub insts: Vec<Inst>,
    pub local_count: usize,
    pub returns_value: bool,
}

/// One entry in the module's symbol table. The kind and linkage are fixed at
/// interning; the body and machine output fill in behind their own locks as
/// fan-out workers get to them.
pub struct Symbol {
    pub name: String,
    pub linkage: Linkage,
    pub kind: SymKind,
    pub line: u32,
    body: Mutex<Option<IrFunction>>,
    output: Mutex<Option<FunctionOutput>>,
    data: Mutex<Vec<u8>>,
}

impl Symbol {
    fn new(name: &str, linkage: Linkage, kind: SymKind, line: u32) -> Self {
        Self {
            name: name.to_string(),
            linkage,
            kind,
            line,
            body: Mutex::new(None),
            output: Mutex::new(None),
            data: Mutex::new(Vec::new()),
        }
    }

    /// Claim the body slot; returns `false` when another worker already
    /// lowered this symbol.
    pub(crate) fn claim_body(&self, body: IrFunction) -> bool {
        let mut slot = self.body.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(body);
        true
    }

    #[must_use]
    pub fn is_defined_function(&self) -> bool {
        self.kind == SymKind::Function && self.body.lock().unwrap().is_some()
    }

    #[must_use]
    pub fn body_snapshot(&self) -> Option<IrFunction> {
        self.body.lock().unwrap().clone()
    }

    pub fn set_output(&self, output: FunctionOutput) {
        *self.output.lock().unwrap() = Some(output);
    }

    #[must_use]
    pub fn output_snapshot(&self) -> Option<FunctionOutput> {
        self.output.lock().unwrap().clone()
    }

    pub fn set_data(&self, bytes: Vec<u8>) {
        *self.data.lock().unwrap() = bytes;
    }

    #[must_use]
    pub fn data_snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// The IR module one LD step's compilation unit owns.
///
/// Front-end workers from many CC steps insert symbols concurrently; the
/// table is the module's own lock, independent of the compilation-unit lock.
pub struct Module {
    pub arch: Arch,
    pub os: TargetOs,
    pub jit: bool,
    symbols: Mutex<IndexMap<String, Arc<Symbol>>>,
    strings: AtomicUsize,
    debug_info: AtomicBool,
}

impl Module {
    #[must_use]
    pub fn new(arch: Arch, os: TargetOs, jit: bool) -> Self {
        Self {
            arch,
            os,
            jit,
            symbols: Mutex::new(IndexMap::new()),
            strings: AtomicUsize::new(0),
            debug_info: AtomicBool::new(false),
        }
    }

    pub fn set_debug_info(&self, enabled: bool) {
        self.debug_info.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn debug_info(&self) -> bool {
        self.debug_info.load(Ordering::Acquire)
    }

    /// Get-or-insert a symbol. The first interning fixes kind and linkage.
    pub fn intern(&self, name: &str, linkage: Linkage, kind: SymKind, line: u32) -> Arc<Symbol> {
        let mut table = self.symbols.lock().unwrap();
        if let Some(existing) = table.get(name) {
            return Arc::clone(existing);
        }
        let symbol = Arc::new(Symbol::new(name, linkage, kind, line));
        table.insert(name.to_string(), Arc::clone(&symbol));
        symbol
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<Symbol>> {
        self.symbols.lock().unwrap().get(name).cloned()
    }

    /// Ordered snapshot of every symbol.
    #[must_use]
    pub fn symbols(&self) -> Vec<Arc<Symbol>> {
        self.symbols.lock().unwrap().values().cloned().collect()
    }

    /// Defined functions, in table order.
    #[must_use]
    pub fn functions(&self) -> Vec<Arc<Symbol>> {
        self.symbols
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_defined_function())
            .cloned()
            .collect()
    }

    /// Pool a string literal into a private data symbol, returning its label.
    pub fn intern_string(&self, bytes: Vec<u8>) -> String {
        let id = self.strings.fetch_add(1, Ordering::Relaxed);
        let label = format!(".Lstr{id}");
        let symbol = self.intern(&label, Linkage::Local, SymKind::Global, 0);
        symbol.set_data(bytes);
        label
    }
}

/// Declare the TU's top-level symbols against the module so cross-TU
/// references resolve during codegen. Parallel when a pool is present.
pub fn allocate_ir(
    tu: &TranslationUnit,
    pool: Option<&ThreadPool>,
    module: &Module,
    debug_info: bool,
) {
    module.set_debug_info(debug_info);
    let declare = |decl: &Decl| {
        if decl.attrs.is_typedef || !decl.attrs.is_used() {
            return;
        }
        let linkage = if decl.attrs.is_static {
            Linkage::Local
        } else {
            Linkage::Export
        };
        let kind = match decl.body {
            DeclBody::Function { .. } | DeclBody::Prototype { .. } => SymKind::Function,
            DeclBody::Global { .. } => SymKind::Global,
            DeclBody::Typedef => return,
        };
        let line = if debug_info { decl.line } else { 0 };
        module.intern(&decl.name, linkage, kind, line);
    };

    match pool {
        Some(pool) => pool.fan_out(|scope| {
            let declare = &declare;
            for decl in &tu.top_level {
                scope.spawn(move |_| declare(decl));
            }
        }),
        None => tu.top_level.iter().for_each(declare),
    }
}

/// Lower one top-level declaration into the module.
///
/// The symbol-table slot is claimed atomically, so racing fan-out batches
/// that walk overlapping TU lists lower each declaration exactly once; the
/// loser simply receives the existing symbol.
pub fn top_level_codegen(
    tu: &TranslationUnit,
    module: &Module,
    arena: &mut IrArena,
    decl: &Decl,
) -> Option<Arc<Symbol>> {
    let linkage = if decl.attrs.is_static {
        Linkage::Local
    } else {
        Linkage::Export
    };
    match &decl.body {
        DeclBody::Typedef => None,
        DeclBody::Prototype { .. } => {
            Some(module.intern(&decl.name, linkage, SymKind::Function, decl.line))
        }
        DeclBody::Global { init } => {
            let symbol = module.intern(&decl.name, linkage, SymKind::Global, decl.line);
            let value = init.map_or(0, |expr| const_eval(tu, expr));
            symbol.set_data(value.to_le_bytes().to_vec());
            Some(symbol)
        }
        DeclBody::Function { body, .. } => {
            let symbol = module.intern(&decl.name, linkage, SymKind::Function, decl.line);
            let lowered = lower_function(tu, module, arena, decl, body);
            if !symbol.claim_body(lowered) {
                debug!(name = %decl.name, "symbol already lowered, reusing");
            }
            Some(symbol)
        }
    }
}

fn const_eval(tu: &TranslationUnit, id: ExprId) -> i64 {
    match tu.exprs.get(id) {
        Expr::IntLit(value) => *value,
        Expr::CharLit(lexeme) => char_value(lexeme),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => -const_eval(tu, *operand),
        Expr::Unary {
            op: UnaryOp::Not,
            operand,
        } => i64::from(const_eval(tu, *operand) == 0),
        Expr::Binary { op, lhs, rhs } => {
            fold_binary(*op, const_eval(tu, *lhs), const_eval(tu, *rhs))
        }
        _ => 0,
    }
}

pub(crate) fn fold_binary(op: BinOp, lhs: i64, rhs: i64) -> i64 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Div => lhs.checked_div(rhs).unwrap_or(0),
        BinOp::Mod => lhs.checked_rem(rhs).unwrap_or(0),
        BinOp::Lt => i64::from(lhs < rhs),
        BinOp::Gt => i64::from(lhs > rhs),
        BinOp::Le => i64::from(lhs <= rhs),
        BinOp::Ge => i64::from(lhs >= rhs),
        BinOp::Eq => i64::from(lhs == rhs),
        BinOp::Ne => i64::from(lhs != rhs),
    }
}

fn char_value(lexeme: &str) -> i64 {
    let inner = lexeme.trim_matches('\'');
    let mut chars = inner.chars();
    match (chars.next(), chars.next()) {
        (Some('\\'), Some(esc)) => i64::from(match esc {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            '0' => 0,
            other => other as u8,
        }),
        (Some(c), _) => i64::from(c as u8),
        (None, _) => 0,
    }
}

/// Decode the inside of a C string literal into bytes with a trailing NUL.
fn string_bytes(lexeme: &str) -> Vec<u8> {
    let inner = lexeme.strip_prefix('"').unwrap_or(lexeme);
    let inner = inner.strip_suffix('"').unwrap_or(inner);
    let mut out = Vec::with_capacity(inner.len() + 1);
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('r') => out.push(b'\r'),
                Some('0') => out.push(0),
                Some(other) => out.extend(other.to_string().as_bytes()),
                None => {}
            }
        } else {
            out.extend(c.to_string().as_bytes());
        }
    }
    out.push(0);
    out
}

struct FuncLowerer<'a> {
    tu: &'a TranslationUnit,
    module: &'a Module,
    locals: Vec<String>,
}

fn lower_function(
    tu: &TranslationUnit,
    module: &Module,
    arena: &mut IrArena,
    decl: &Decl,
    body: &[Statement],
) -> IrFunction {
    let mut lowerer = FuncLowerer {
        tu,
        module,
        locals: Vec::new(),
    };
    // Parameter slots come first so slot index == argument index.
    if let DeclBody::Function { params, .. } = &decl.body {
        for param in params {
            lowerer.locals.push(param.name.clone());
        }
    }

    // The arena is the staging buffer; the finished body is split back out
    // so immediate codegen can clear it between batches.
    let buf = arena.insts();
    let base = buf.len();
    lowerer.stmts(buf, base, body);
    if !matches!(buf.last(), Some(Inst::Ret { .. })) {
        buf.push(Inst::Ret { has_value: false });
    }
    let insts = buf.split_off(base);

    IrFunction {
        insts,
        local_count: lowerer.locals.len(),
        returns_value: !decl.ty.is_void(),
    }
}

impl FuncLowerer<'_> {
    fn slot(&mut self, name: &str) -> Option<usize> {
        self.locals.iter().position(|l| l == name)
    }

    fn declare_local(&mut self, name: &str) -> usize {
        if let Some(slot) = self.slot(name) {
            return slot;
        }
        self.locals.push(name.to_string());
        self.locals.len() - 1
    }

    fn stmts(&mut self, buf: &mut Vec<Inst>, base: usize, stmts: &[Statement]) {
        for stmt in stmts {
            self.stmt(buf, base, stmt);
        }
    }

    fn stmt(&mut self, buf: &mut Vec<Inst>, base: usize, stmt: &Statement) {
        match stmt {
            Statement::Return(value) => {
                if let Some(value) = value {
                    self.expr(buf, base, *value);
                }
                buf.push(Inst::Ret {
                    has_value: value.is_some(),
                });
            }
            Statement::Local { name, init, .. } => {
                let slot = self.declare_local(name);
                if let Some(init) = init {
                    self.expr(buf, base, *init);
                    buf.push(Inst::StoreLocal(slot));
                }
            }
            Statement::Assign { name, value } => {
                self.expr(buf, base, *value);
                match self.slot(name) {
                    Some(slot) => buf.push(Inst::StoreLocal(slot)),
                    None => buf.push(Inst::StoreGlobal(name.clone())),
                }
            }
            Statement::Expr(value) => {
                self.expr(buf, base, *value);
                buf.push(Inst::Pop);
            }
            Statement::Block(inner) => self.stmts(buf, base, inner),
            Statement::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(buf, base, *cond);
                let to_else = buf.len();
                buf.push(Inst::BranchZero(0));
                self.stmts(buf, base, then);
                let to_end = buf.len();
                buf.push(Inst::Jump(0));
                let else_target = buf.len() - base;
                buf[to_else] = Inst::BranchZero(else_target);
                self.stmts(buf, base, otherwise);
                let end_target = buf.len() - base;
                buf[to_end] = Inst::Jump(end_target);
            }
            Statement::While { cond, body } => {
                let start = buf.len() - base;
                self.expr(buf, base, *cond);
                let to_end = buf.len();
                buf.push(Inst::BranchZero(0));
                self.stmts(buf, base, body);
                buf.push(Inst::Jump(start));
                let end_target = buf.len() - base;
                buf[to_end] = Inst::BranchZero(end_target);
            }
        }
    }

    fn expr(&mut self, buf: &mut Vec<Inst>, base: usize, id: ExprId) {
        match self.tu.exprs.get(id).clone() {
            Expr::IntLit(value) => buf.push(Inst::PushConst(value)),
            Expr::CharLit(lexeme) => buf.push(Inst::PushConst(char_value(&lexeme))),
            Expr::StrLit(lexeme) => {
                let label = self.module.intern_string(string_bytes(&lexeme));
                buf.push(Inst::PushGlobalAddr(label));
            }
            Expr::Ident(name) => match self.slot(&name) {
                Some(slot) => buf.push(Inst::PushLocal(slot)),
                None => buf.push(Inst::PushGlobal(name)),
            },
            Expr::Unary { op, operand } => {
                self.expr(buf, base, operand);
                buf.push(match op {
                    UnaryOp::Neg => Inst::Neg,
                    UnaryOp::Not => Inst::Not,
                });
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(buf, base, lhs);
                self.expr(buf, base, rhs);
                buf.push(Inst::Binary(op));
            }
            Expr::Call { callee, args } => {
                let argc = args.len();
                // Arguments are pushed right-to-left: the first six then pop
                // into the SysV registers in order, and anything beyond them
                // is already laid out as stack arguments for the call.
                for arg in args.into_iter().rev() {
                    self.expr(buf, base, arg);
                }
                buf.push(Inst::Call { callee, argc });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Inst, Linkage, Module, SymKind, allocate_ir, top_level_codegen};
    use crate::arena::IrArena;
    use crate::args::{Arch, CVersion, DriverArgs, TargetOs};
    use crate::front::diag::Diagnostics;
    use crate::front::parser::parse;
    use crate::front::preprocess::preprocess_source;
    use crate::front::sema;

    fn lowered(text: &str) -> (Module, crate::front::ast::TranslationUnit) {
        let args = DriverArgs::default();
        let pp = preprocess_source(&args, "test.c", text, true).expect("preprocess");
        let result = parse(CVersion::C23, pp.stream(), "test.c");
        assert_eq!(result.error_count, 0);
        let diags = Diagnostics::new();
        assert_eq!(sema::check(&result.tu, &diags), 0);

        let module = Module::new(Arch::X86_64, TargetOs::Linux, false);
        allocate_ir(&result.tu, None, &module, false);
        let mut arena = IrArena::new();
        for decl in &result.tu.top_level {
            if decl.attrs.is_typedef || !decl.attrs.is_used() {
                continue;
            }
            top_level_codegen(&result.tu, &module, &mut arena, decl);
        }
        (module, result.tu)
    }

    #[test]
    fn functions_and_globals_are_interned() {
        let (module, _) = lowered("int limit = 6 * 7;\nint main(void) { return limit; }\n");
        let limit = module.lookup("limit").unwrap();
        assert_eq!(limit.kind, SymKind::Global);
        assert_eq!(limit.data_snapshot(), 42i64.to_le_bytes().to_vec());

        let main = module.lookup("main").unwrap();
        assert_eq!(main.linkage, Linkage::Export);
        assert!(main.is_defined_function());
    }

    #[test]
    fn lowering_is_idempotent_across_races() {
        let (module, tu) = lowered("int main(void) { return 3; }\n");
        let mut arena = IrArena::new();
        let again = top_level_codegen(&tu, &module, &mut arena, &tu.top_level[0]).unwrap();
        assert!(again.is_defined_function());
        assert_eq!(module.functions().len(), 1);
    }

    #[test]
    fn control_flow_branch_targets_are_in_range() {
        let (module, _) = lowered(
            "int main(void) { int x = 5; while (x) { x = x - 1; } if (x == 0) return 1; else return 2; }\n",
        );
        let body = module.lookup("main").unwrap().body_snapshot().unwrap();
        for inst in &body.insts {
            if let Inst::BranchZero(target) | Inst::Jump(target) = inst {
                assert!(*target <= body.insts.len());
            }
        }
        assert!(body.local_count >= 1);
        assert!(body.returns_value);
    }

    #[test]
    fn call_arguments_are_pushed_right_to_left() {
        let (module, _) = lowered("int f(int a, int b);\nint main(void) { return f(1, 2); }\n");
        let body = module.lookup("main").unwrap().body_snapshot().unwrap();
        let consts: Vec<i64> = body
            .insts
            .iter()
            .filter_map(|inst| match inst {
                Inst::PushConst(value) => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(consts, [2, 1]);
    }

    #[test]
    fn string_literals_become_private_data() {
        let (module, _) = lowered(
            "int puts(char *s);\nint main(void) { puts(\"hi\"); return 0; }\n",
        );
        let pooled = module.symbols();
        let label = pooled.iter().find(|s| s.name.starts_with(".Lstr")).unwrap();
        assert_eq!(label.linkage, Linkage::Local);
        assert_eq!(label.data_snapshot(), b"hi\0".to_vec());
    }
}
