use std::collections::HashSet;

use crate::args::CVersion;

use super::ast::{
    BaseType, BinOp, CType, Decl, DeclAttrs, DeclBody, EntrypointStatus, Expr, ExprId, Param,
    Statement, TranslationUnit, UnaryOp,
};
use super::token::{Token, TokenKind, TokenStream};

pub struct ParseResult {
    pub tu: TranslationUnit,
    pub error_count: usize,
}

/// Parse one preprocessed token stream into a translation unit.
#[must_use]
pub fn parse(version: CVersion, stream: &TokenStream, source: &str) -> ParseResult {
    let mut parser = Parser {
        stream,
        tokens: &stream.tokens,
        pos: 0,
        version,
        typedefs: HashSet::new(),
        tu: TranslationUnit::new(source),
        errors: 0,
    };
    parser.translation_unit();
    ParseResult {
        error_count: parser.errors,
        tu: parser.tu,
    }
}

const BASE_TYPES: [&str; 7] = ["void", "char", "short", "int", "long", "float", "double"];

struct Parser<'a> {
    stream: &'a TokenStream,
    tokens: &'a [Token],
    pos: usize,
    version: CVersion,
    typedefs: HashSet<String>,
    tu: TranslationUnit,
    errors: usize,
}

impl Parser<'_> {
    fn translation_unit(&mut self) {
        while !self.at_end() {
            self.declaration();
        }
    }

    // ---- token plumbing ----

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn check(&self, lexeme: &str) -> bool {
        self.peek().is_some_and(|t| t.lexeme == lexeme)
    }

    fn eat(&mut self, lexeme: &str) -> bool {
        if self.check(lexeme) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, lexeme: &str) -> bool {
        if self.eat(lexeme) {
            return true;
        }
        self.error_here(&format!("expected `{lexeme}`"));
        false
    }

    fn expect_ident(&mut self) -> Option<String> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Ident => {
                let name = t.lexeme.clone();
                self.pos += 1;
                Some(name)
            }
            _ => {
                self.error_here("expected identifier");
                None
            }
        }
    }

    fn here(&self) -> (String, u32) {
        self.peek().or_else(|| self.tokens.last()).map_or_else(
            || (self.tu.path.clone(), 0),
            |t| (self.stream.file_name(t.file).to_string(), t.line),
        )
    }

    fn error_here(&mut self, message: &str) {
        let (file, line) = self.here();
        self.stream.diags.error(file, line, message);
        self.errors += 1;
    }

    /// Skip to the next plausible declaration or statement boundary.
    fn synchronize(&mut self) {
        while let Some(token) = self.advance() {
            if token.lexeme == ";" || token.lexeme == "}" {
                break;
            }
        }
    }

    // ---- types ----

    fn is_type_start(&self) -> bool {
        self.peek().is_some_and(|t| {
            t.kind == TokenKind::Ident
                && (BASE_TYPES.contains(&t.lexeme.as_str())
                    || t.lexeme == "unsigned"
                    || t.lexeme == "signed"
                    || t.lexeme == "const"
                    || self.typedefs.contains(&t.lexeme))
        })
    }

    fn parse_type(&mut self) -> CType {
        while self.eat("const") {}
        let unsigned = self.eat("unsigned");
        let _ = self.eat("signed");
        while self.eat("const") {}

        let base = match self.peek().map(|t| t.lexeme.clone()) {
            Some(word) if BASE_TYPES.contains(&word.as_str()) => {
                self.pos += 1;
                match word.as_str() {
                    "void" => BaseType::Void,
                    "char" => BaseType::Char,
                    "short" => {
                        let _ = self.eat("int");
                        BaseType::Short
                    }
                    "int" => BaseType::Int,
                    "long" => {
                        let _ = self.eat("long");
                        let _ = self.eat("int");
                        BaseType::Long
                    }
                    "float" => BaseType::Float,
                    _ => BaseType::Double,
                }
            }
            Some(word) if self.typedefs.contains(&word) => {
                self.pos += 1;
                BaseType::Named(word)
            }
            // `unsigned x` alone is `unsigned int`.
            _ if unsigned => BaseType::Int,
            _ => {
                self.error_here("expected type name");
                BaseType::Int
            }
        };

        let mut ty = CType::new(base);
        ty.unsigned = unsigned;
        while self.eat("*") {
            ty.ptr_depth = ty.ptr_depth.saturating_add(1);
        }
        ty
    }

    // ---- declarations ----

    fn declaration(&mut self) {
        let line = self.here().1;
        let is_typedef = self.eat("typedef");
        let is_static = self.eat("static");
        let _is_extern = self.eat("extern");

        if !self.is_type_start() {
            self.error_here("expected declaration");
            self.synchronize();
            return;
        }
        let ty = self.parse_type();
        let Some(name) = self.expect_ident() else {
            self.synchronize();
            return;
        };

        let attrs = DeclAttrs::new(is_typedef, is_static);

        if is_typedef {
            self.expect(";");
            self.typedefs.insert(name.clone());
            self.tu.top_level.push(Decl {
                name,
                ty,
                attrs,
                body: DeclBody::Typedef,
                line,
            });
            return;
        }

        if self.eat("(") {
            let params = self.parse_params();
            let body = if self.eat(";") {
                DeclBody::Prototype { params }
            } else if self.check("{") {
                if name == "main" {
                    self.tu.entrypoint = EntrypointStatus::Main;
                } else if name == "WinMain" {
                    self.tu.entrypoint = EntrypointStatus::WinMain;
                }
                let body = self.parse_block();
                DeclBody::Function { params, body }
            } else {
                self.error_here("expected `;` or function body");
                self.synchronize();
                DeclBody::Prototype { params }
            };
            self.tu.top_level.push(Decl {
                name,
                ty,
                attrs,
                body,
                line,
            });
            return;
        }

        let init = if self.eat("=") { self.expr() } else { None };
        self.expect(";");
        self.tu.top_level.push(Decl {
            name,
            ty,
            attrs,
            body: DeclBody::Global { init },
            line,
        });
    }

    fn parse_params(&mut self) -> Vec<Param> {
        let mut params = Vec::new();
        if self.eat(")") {
            return params;
        }
        // `(void)` is an empty parameter list.
        if self.check("void") && self.peek_at(1).is_some_and(|t| t.lexeme == ")") {
            self.pos += 2;
            return params;
        }
        loop {
            if !self.is_type_start() {
                self.error_here("expected parameter type");
                self.synchronize();
                return params;
            }
            let ty = self.parse_type();
            let name = match self.peek() {
                Some(t) if t.kind == TokenKind::Ident && !BASE_TYPES.contains(&t.lexeme.as_str()) => {
                    let name = t.lexeme.clone();
                    self.pos += 1;
                    name
                }
                _ => String::new(),
            };
            params.push(Param { name, ty });
            if !self.eat(",") {
                break;
            }
        }
        self.expect(")");
        params
    }

    // ---- statements ----

    fn parse_block(&mut self) -> Vec<Statement> {
        let mut stmts = Vec::new();
        if !self.expect("{") {
            return stmts;
        }
        while !self.check("}") && !self.at_end() {
            if let Some(stmt) = self.statement() {
                stmts.push(stmt);
            }
        }
        self.expect("}");
        stmts
    }

    fn statement(&mut self) -> Option<Statement> {
        if self.check("{") {
            return Some(Statement::Block(self.parse_block()));
        }
        if self.eat("return") {
            let value = if self.check(";") { None } else { self.expr() };
            self.expect(";");
            return Some(Statement::Return(value));
        }
        if self.eat("if") {
            self.expect("(");
            let cond = self.expr()?;
            self.expect(")");
            let then = self.branch_body();
            let otherwise = if self.eat("else") {
                self.branch_body()
            } else {
                Vec::new()
            };
            return Some(Statement::If {
                cond,
                then,
                otherwise,
            });
        }
        if self.eat("while") {
            self.expect("(");
            let cond = self.expr()?;
            self.expect(")");
            let body = self.branch_body();
            return Some(Statement::While { cond, body });
        }
        if self.is_type_start() {
            let ty = self.parse_type();
            let name = self.expect_ident()?;
            let init = if self.eat("=") { self.expr() } else { None };
            self.expect(";");
            return Some(Statement::Local { name, ty, init });
        }
        // `name = expr;` is an assignment, not equality.
        if self.peek().is_some_and(|t| t.kind == TokenKind::Ident)
            && self.peek_at(1).is_some_and(|t| t.lexeme == "=")
        {
            let name = self.expect_ident()?;
            self.pos += 1;
            let value = self.expr()?;
            self.expect(";");
            return Some(Statement::Assign { name, value });
        }
        match self.expr() {
            Some(value) => {
                self.expect(";");
                Some(Statement::Expr(value))
            }
            None => {
                self.synchronize();
                None
            }
        }
    }

    fn branch_body(&mut self) -> Vec<Statement> {
        if self.check("{") {
            self.parse_block()
        } else {
            self.statement().into_iter().collect()
        }
    }

    // ---- expressions, precedence climbing ----

    fn expr(&mut self) -> Option<ExprId> {
        self.equality()
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Option<ExprId>,
    ) -> Option<ExprId> {
        let mut lhs = next(self)?;
        loop {
            let Some(op) = self
                .peek()
                .and_then(|t| ops.iter().find(|(text, _)| *text == t.lexeme))
                .map(|(_, op)| *op)
            else {
                return Some(lhs);
            };
            self.pos += 1;
            let rhs = next(self)?;
            lhs = self.tu.exprs.alloc(Expr::Binary { op, lhs, rhs });
        }
    }

    fn equality(&mut self) -> Option<ExprId> {
        self.binary_level(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Self::comparison)
    }

    fn comparison(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[
                ("<=", BinOp::Le),
                (">=", BinOp::Ge),
                ("<", BinOp::Lt),
                (">", BinOp::Gt),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> Option<ExprId> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::factor)
    }

    fn factor(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Option<ExprId> {
        if self.eat("-") {
            let operand = self.unary()?;
            return Some(self.tu.exprs.alloc(Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            }));
        }
        if self.eat("!") {
            let operand = self.unary()?;
            return Some(self.tu.exprs.alloc(Expr::Unary {
                op: UnaryOp::Not,
                operand,
            }));
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<ExprId> {
        let token = match self.peek() {
            Some(token) => token.clone(),
            None => {
                self.error_here("expected expression");
                return None;
            }
        };
        match token.kind {
            TokenKind::IntLit => {
                self.pos += 1;
                let value = parse_int(&token.lexeme).unwrap_or_else(|| {
                    self.error_here(&format!("malformed integer literal `{}`", token.lexeme));
                    0
                });
                Some(self.tu.exprs.alloc(Expr::IntLit(value)))
            }
            TokenKind::StrLit | TokenKind::WideStrLit => {
                self.pos += 1;
                Some(self.tu.exprs.alloc(Expr::StrLit(token.lexeme)))
            }
            TokenKind::CharLit | TokenKind::WideCharLit => {
                self.pos += 1;
                Some(self.tu.exprs.alloc(Expr::CharLit(token.lexeme)))
            }
            TokenKind::Ident => {
                if self.version == CVersion::C23
                    && (token.lexeme == "true" || token.lexeme == "false")
                {
                    self.pos += 1;
                    let value = i64::from(token.lexeme == "true");
                    return Some(self.tu.exprs.alloc(Expr::IntLit(value)));
                }
                self.pos += 1;
                if self.eat("(") {
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(",") {
                                break;
                            }
                        }
                        self.expect(")");
                    }
                    return Some(self.tu.exprs.alloc(Expr::Call {
                        callee: token.lexeme,
                        args,
                    }));
                }
                Some(self.tu.exprs.alloc(Expr::Ident(token.lexeme)))
            }
            TokenKind::Punct => {
                if self.eat("(") {
                    let inner = self.expr()?;
                    self.expect(")");
                    return Some(inner);
                }
                self.error_here(&format!("unexpected `{}`", token.lexeme));
                self.pos += 1;
                None
            }
        }
    }
}

fn parse_int(lexeme: &str) -> Option<i64> {
    let cleaned = lexeme.trim_end_matches(['u', 'U', 'l', 'L']);
    if let Some(hex) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = cleaned.strip_prefix("0b").or_else(|| cleaned.strip_prefix("0B")) {
        return i64::from_str_radix(bin, 2).ok();
    }
    if cleaned.len() > 1 && cleaned.starts_with('0') && !cleaned.contains('.') {
        return i64::from_str_radix(&cleaned[1..], 8).ok();
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::{ParseResult, parse, parse_int};
    use crate::args::{CVersion, DriverArgs};
    use crate::front::ast::{DeclBody, EntrypointStatus};
    use crate::front::preprocess::preprocess_source;

    fn parsed(text: &str) -> ParseResult {
        let args = DriverArgs::default();
        let pp = preprocess_source(&args, "test.c", text, true).expect("preprocess");
        parse(CVersion::C23, pp.stream(), "test.c")
    }

    #[test]
    fn functions_globals_and_typedefs() {
        let result = parsed(
            "typedef int word;\nstatic word limit = 32;\nint helper(void);\nint main(void) { return 0; }\n",
        );
        assert_eq!(result.error_count, 0);
        let tu = &result.tu;
        assert_eq!(tu.top_level_count(), 4);
        assert!(tu.top_level[0].attrs.is_typedef);
        assert!(matches!(tu.top_level[1].body, DeclBody::Global { .. }));
        assert!(matches!(tu.top_level[2].body, DeclBody::Prototype { .. }));
        assert!(tu.top_level[3].is_function_def());
        assert_eq!(tu.entrypoint, EntrypointStatus::Main);
    }

    #[test]
    fn winmain_is_detected() {
        let result = parsed("int WinMain(void) { return 0; }\n");
        assert_eq!(result.tu.entrypoint, EntrypointStatus::WinMain);
    }

    #[test]
    fn statements_and_expressions() {
        let result = parsed(
            "int f(int a, int b) {\n  int x = a + b * 2;\n  if (x >= 10) { x = x - 1; } else x = 0;\n  while (x) x = x - 1;\n  return x;\n}\n",
        );
        assert_eq!(result.error_count, 0);
        let tu = &result.tu;
        assert!(!tu.exprs.is_empty());
        let DeclBody::Function { params, body } = &tu.top_level[0].body else {
            panic!("expected function");
        };
        assert_eq!(params.len(), 2);
        assert_eq!(body.len(), 4);
    }

    #[test]
    fn parse_errors_are_counted_and_recovered() {
        let result = parsed("int f( { return 0; }\nint g(void) { return 1; }\n");
        assert!(result.error_count > 0);
        assert!(result.tu.top_level.iter().any(|d| d.name == "g"));
    }

    #[test]
    fn integer_literal_radixes() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x2A"), Some(42));
        assert_eq!(parse_int("052"), Some(42));
        assert_eq!(parse_int("0b101010"), Some(42));
        assert_eq!(parse_int("42UL"), Some(42));
        assert_eq!(parse_int("forty"), None);
    }
}
