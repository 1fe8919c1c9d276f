use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExprId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Debug)]
pub enum Expr {
    IntLit(i64),
    StrLit(String),
    CharLit(String),
    Ident(String),
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Call {
        callee: String,
        args: Vec<ExprId>,
    },
}

/// Expression storage for one translation unit.
///
/// The parse arena and the TU of the original pair are one owned structure
/// here; both are released together when the TU drops.
#[derive(Default)]
pub struct ExprArena {
    exprs: Vec<Expr>,
}

impl ExprArena {
    pub fn alloc(&mut self, expr: Expr) -> ExprId {
        let id = u32::try_from(self.exprs.len()).expect("expression arena overflow");
        self.exprs.push(expr);
        ExprId(id)
    }

    #[must_use]
    pub fn get(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BaseType {
    Void,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Named(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CType {
    pub base: BaseType,
    pub ptr_depth: u8,
    pub unsigned: bool,
}

impl CType {
    #[must_use]
    pub fn new(base: BaseType) -> Self {
        Self {
            base,
            ptr_depth: 0,
            unsigned: false,
        }
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        self.base == BaseType::Void && self.ptr_depth == 0
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: CType,
}

#[derive(Clone, Debug)]
pub enum Statement {
    Return(Option<ExprId>),
    Local {
        name: String,
        ty: CType,
        init: Option<ExprId>,
    },
    Assign {
        name: String,
        value: ExprId,
    },
    Expr(ExprId),
    Block(Vec<Statement>),
    If {
        cond: ExprId,
        then: Vec<Statement>,
        otherwise: Vec<Statement>,
    },
    While {
        cond: ExprId,
        body: Vec<Statement>,
    },
}

#[derive(Debug, Default)]
pub struct DeclAttrs {
    pub is_typedef: bool,
    pub is_static: bool,
    is_used: AtomicBool,
}

impl DeclAttrs {
    #[must_use]
    pub fn new(is_typedef: bool, is_static: bool) -> Self {
        Self {
            is_typedef,
            is_static,
            is_used: AtomicBool::new(false),
        }
    }

    /// Used-marking happens after the TU is shared, hence the atomic.
    pub fn mark_used(&self) {
        self.is_used.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub enum DeclBody {
    Function { params: Vec<Param>, body: Vec<Statement> },
    Prototype { params: Vec<Param> },
    Global { init: Option<ExprId> },
    Typedef,
}

/// One top-level declaration.
#[derive(Debug)]
pub struct Decl {
    pub name: String,
    pub ty: CType,
    pub attrs: DeclAttrs,
    pub body: DeclBody,
    pub line: u32,
}

impl Decl {
    #[must_use]
    pub fn is_function_def(&self) -> bool {
        matches!(self.body, DeclBody::Function { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntrypointStatus {
    #[default]
    None,
    Main,
    WinMain,
}

/// The parsed and analyzed representation of one source file.
pub struct TranslationUnit {
    pub path: String,
    ordinal: usize,
    pub top_level: Vec<Decl>,
    pub exprs: ExprArena,
    pub entrypoint: EntrypointStatus,
}

impl TranslationUnit {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ordinal: 0,
            top_level: Vec::new(),
            exprs: ExprArena::default(),
            entrypoint: EntrypointStatus::default(),
        }
    }

    /// The TU's stable index inside its compilation unit; assigned by the
    /// parent step before the TU is shared.
    pub fn set_ordinal(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
    }

    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    #[must_use]
    pub fn top_level_count(&self) -> usize {
        self.top_level.len()
    }

    /// Render the declaration tree, one node per line.
    ///
    /// # Errors
    ///
    /// Returns an error if `out` rejects a write.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "translation_unit \"{}\"", self.path)?;
        for decl in &self.top_level {
            let kind = match &decl.body {
                DeclBody::Function { .. } => "function",
                DeclBody::Prototype { .. } => "prototype",
                DeclBody::Global { .. } => "global",
                DeclBody::Typedef => "typedef",
            };
            writeln!(out, "  {kind} {} @ line {}", decl.name, decl.line)?;
            if let DeclBody::Function { body, .. } = &decl.body {
                self.dump_stmts(out, body, 2)?;
            }
        }
        Ok(())
    }

    fn dump_stmts(&self, out: &mut dyn Write, stmts: &[Statement], depth: usize) -> io::Result<()> {
        let pad = "  ".repeat(depth);
        for stmt in stmts {
            match stmt {
                Statement::Return(value) => {
                    writeln!(out, "{pad}return{}", if value.is_some() { " <expr>" } else { "" })?;
                }
                Statement::Local { name, .. } => writeln!(out, "{pad}local {name}")?,
                Statement::Assign { name, .. } => writeln!(out, "{pad}assign {name}")?,
                Statement::Expr(_) => writeln!(out, "{pad}expr")?,
                Statement::Block(inner) => {
                    writeln!(out, "{pad}block")?;
                    self.dump_stmts(out, inner, depth + 1)?;
                }
                Statement::If { then, otherwise, .. } => {
                    writeln!(out, "{pad}if")?;
                    self.dump_stmts(out, then, depth + 1)?;
                    if !otherwise.is_empty() {
                        writeln!(out, "{pad}else")?;
                        self.dump_stmts(out, otherwise, depth + 1)?;
                    }
                }
                Statement::While { body, .. } => {
                    writeln!(out, "{pad}while")?;
                    self.dump_stmts(out, body, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}
