use std::collections::{HashMap, HashSet};

use super::ast::{Decl, DeclBody, Expr, ExprId, Statement, TranslationUnit};
use super::diag::Diagnostics;

/// Check one translation unit: resolve names, validate returns, and mark
/// reachable declarations used. Returns the number of errors reported.
#[must_use]
pub fn check(tu: &TranslationUnit, diags: &Diagnostics) -> usize {
    let before = diags.error_count();

    let mut globals: HashMap<&str, usize> = HashMap::new();
    for (idx, decl) in tu.top_level.iter().enumerate() {
        if !decl.attrs.is_typedef {
            globals.insert(decl.name.as_str(), idx);
        }
    }

    let mut referenced: HashSet<usize> = HashSet::new();
    for decl in &tu.top_level {
        if let DeclBody::Function { params, body } = &decl.body {
            let mut checker = FuncChecker {
                tu,
                diags,
                globals: &globals,
                referenced: &mut referenced,
                scopes: vec![params.iter().map(|p| p.name.clone()).collect()],
                decl,
            };
            checker.block(body);
        }
    }

    // Externally visible declarations are always kept; static ones only
    // when something in this TU reaches them.
    for (idx, decl) in tu.top_level.iter().enumerate() {
        if decl.attrs.is_typedef {
            continue;
        }
        if !decl.attrs.is_static || referenced.contains(&idx) {
            decl.attrs.mark_used();
        }
    }

    diags.error_count() - before
}

struct FuncChecker<'a> {
    tu: &'a TranslationUnit,
    diags: &'a Diagnostics,
    globals: &'a HashMap<&'a str, usize>,
    referenced: &'a mut HashSet<usize>,
    scopes: Vec<HashSet<String>>,
    decl: &'a Decl,
}

impl FuncChecker<'_> {
    fn error(&self, message: String) {
        self.diags.error(&self.tu.path, self.decl.line, message);
    }

    fn block(&mut self, stmts: &[Statement]) {
        self.scopes.push(HashSet::new());
        for stmt in stmts {
            self.statement(stmt);
        }
        self.scopes.pop();
    }

    fn statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Return(value) => {
                let returns_void = self.decl.ty.is_void();
                match value {
                    Some(expr) if returns_void => {
                        self.error(format!(
                            "void function `{}` returns a value",
                            self.decl.name
                        ));
                        self.expr(*expr);
                    }
                    Some(expr) => self.expr(*expr),
                    None if !returns_void => self.error(format!(
                        "non-void function `{}` returns without a value",
                        self.decl.name
                    )),
                    None => {}
                }
            }
            Statement::Local { name, init, .. } => {
                if let Some(init) = init {
                    self.expr(*init);
                }
                self.scopes.last_mut().unwrap().insert(name.clone());
            }
            Statement::Assign { name, value } => {
                self.resolve(name);
                self.expr(*value);
            }
            Statement::Expr(value) => self.expr(*value),
            Statement::Block(inner) => self.block(inner),
            Statement::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(*cond);
                self.block(then);
                self.block(otherwise);
            }
            Statement::While { cond, body } => {
                self.expr(*cond);
                self.block(body);
            }
        }
    }

    fn expr(&mut self, id: ExprId) {
        match self.tu.exprs.get(id).clone() {
            Expr::IntLit(_) | Expr::StrLit(_) | Expr::CharLit(_) => {}
            Expr::Ident(name) => self.resolve(&name),
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            Expr::Call { callee, args } => {
                if let Some(&idx) = self.globals.get(callee.as_str()) {
                    self.referenced.insert(idx);
                } else {
                    self.error(format!("call to undeclared function `{callee}`"));
                }
                for arg in args {
                    self.expr(arg);
                }
            }
        }
    }

    fn resolve(&mut self, name: &str) {
        if self.scopes.iter().any(|scope| scope.contains(name)) {
            return;
        }
        if let Some(&idx) = self.globals.get(name) {
            self.referenced.insert(idx);
            return;
        }
        self.error(format!("undeclared identifier `{name}`"));
    }
}
