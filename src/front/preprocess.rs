use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use crate::args::{CVersion, DriverArgs, TargetOs};
use crate::constants::MAX_INCLUDE_DEPTH;

use super::diag::Diagnostics;
use super::token::{Token, TokenKind, TokenStream};

/// Preprocessor construction descriptor, filled in from [`DriverArgs`] by the
/// driver entry points below.
pub struct PreprocessDesc<'a> {
    pub version: CVersion,
    pub case_insensitive: bool,
    pub target_os: TargetOs,
    pub includes: &'a [PathBuf],
    pub defines: &'a [String],
    pub diags: Diagnostics,
}

enum Input {
    File(PathBuf),
    Memory { name: String, text: String },
}

enum Macro {
    Object(Vec<Token>),
    /// Recorded so `#undef`/`#ifdef` see it; expansion is unsupported.
    Function,
}

#[derive(Clone, Copy)]
struct CondFrame {
    parent_active: bool,
    active: bool,
    taken: bool,
}

/// One preprocessing context: include state, macro table, output stream.
pub struct Preprocessor {
    input: Option<Input>,
    stream: TokenStream,
    macros: IndexMap<String, Macro>,
    once: HashSet<PathBuf>,
    includes: Vec<PathBuf>,
    case_insensitive: bool,
    conds: Vec<CondFrame>,
}

impl Preprocessor {
    #[must_use]
    pub fn make(desc: &PreprocessDesc<'_>, path: &Path) -> Self {
        Self::with_input(desc, Input::File(path.to_path_buf()))
    }

    #[must_use]
    pub fn make_from_source(desc: &PreprocessDesc<'_>, name: &str, text: &str) -> Self {
        Self::with_input(
            desc,
            Input::Memory {
                name: name.to_string(),
                text: text.to_string(),
            },
        )
    }

    fn with_input(desc: &PreprocessDesc<'_>, input: Input) -> Self {
        let mut pp = Self {
            input: Some(input),
            stream: TokenStream::new(desc.diags.clone()),
            macros: IndexMap::new(),
            once: HashSet::new(),
            includes: desc.includes.to_vec(),
            case_insensitive: desc.case_insensitive,
            conds: Vec::new(),
        };
        pp.set_standard_defines(desc);
        for define in desc.defines {
            match define.split_once('=') {
                Some((name, value)) => pp.define_object(name, value),
                None => pp.define_object(define, "1"),
            }
        }
        pp
    }

    fn set_standard_defines(&mut self, desc: &PreprocessDesc<'_>) {
        self.define_object("__STDC__", "1");
        let stdc_version = match desc.version {
            CVersion::C11 => "201112L",
            CVersion::C17 => "201710L",
            CVersion::C23 => "202311L",
        };
        self.define_object("__STDC_VERSION__", stdc_version);
        self.define_object("__cinder__", "1");
        match desc.target_os {
            TargetOs::Windows => self.define_object("_WIN32", "1"),
            TargetOs::Linux => self.define_object("__linux__", "1"),
            TargetOs::Darwin => self.define_object("__APPLE__", "1"),
            TargetOs::Unknown => {}
        }
    }

    fn define_object(&mut self, name: &str, value: &str) {
        let mut tokens = Vec::new();
        lex_line(value, 0, 0, &mut tokens);
        self.macros
            .insert(name.to_string(), Macro::Object(tokens));
    }

    /// Run the preprocessor over its input. Returns `false` when any error
    /// diagnostic was produced.
    pub fn run(&mut self) -> bool {
        let before = self.stream.diags.error_count();
        match self.input.take() {
            Some(Input::File(path)) => self.include_path(&path, 0),
            Some(Input::Memory { name, text }) => self.process_source(&name, &text, None, 0),
            None => {}
        }
        if !self.conds.is_empty() {
            let file = self.current_file_name();
            self.stream
                .diags
                .error(file, 0, "unterminated conditional directive");
        }
        self.stream.diags.error_count() == before
    }

    /// Drop macro state once the stream will no longer be extended.
    pub fn finalize(&mut self) {
        debug!(macros = self.macros.len(), "finalizing preprocessor");
        self.macros = IndexMap::new();
        self.once = HashSet::new();
    }

    #[must_use]
    pub fn stream(&self) -> &TokenStream {
        &self.stream
    }

    #[must_use]
    pub fn into_stream(self) -> TokenStream {
        self.stream
    }

    fn current_file_name(&self) -> String {
        "<preprocessor>".to_string()
    }

    fn include_path(&mut self, path: &Path, depth: usize) {
        if depth > MAX_INCLUDE_DEPTH {
            self.stream.diags.error(
                path.display().to_string(),
                0,
                "include nesting too deep",
            );
            return;
        }
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.once.contains(&canonical) {
            return;
        }
        match fs::read_to_string(path) {
            Ok(text) => {
                let name = path.display().to_string();
                self.process_source(&name, &text, Some(&canonical), depth);
            }
            Err(err) => {
                self.stream.diags.error(
                    path.display().to_string(),
                    0,
                    format!("could not read source file: {err}"),
                );
            }
        }
    }

    fn process_source(&mut self, name: &str, text: &str, origin: Option<&Path>, depth: usize) {
        let file_id = self.stream.intern_file(name);
        let mut in_block_comment = false;

        for (line, line_no) in logical_lines(text) {
            let cleaned = strip_comments(&line, &mut in_block_comment);
            let trimmed = cleaned.trim();
            if let Some(directive) = trimmed.strip_prefix('#') {
                self.directive(directive.trim_start(), name, file_id, line_no, origin, depth);
            } else if self.lines_active() && !trimmed.is_empty() {
                self.emit_line(trimmed, file_id, line_no, name);
            }
        }
    }

    fn lines_active(&self) -> bool {
        self.conds.iter().all(|frame| frame.active)
    }

    #[allow(clippy::too_many_lines)]
    fn directive(
        &mut self,
        rest: &str,
        file: &str,
        file_id: u32,
        line: u32,
        origin: Option<&Path>,
        depth: usize,
    ) {
        let (name, rest) = split_word(rest);
        let active = self.lines_active();

        match name {
            "if" => {
                let value = active && self.eval_condition(rest, file, line);
                self.conds.push(CondFrame {
                    parent_active: active,
                    active: value,
                    taken: value,
                });
            }
            "ifdef" | "ifndef" => {
                let (ident, _) = split_word(rest.trim_start());
                let defined = self.macros.contains_key(ident);
                let value = active && (defined == (name == "ifdef"));
                self.conds.push(CondFrame {
                    parent_active: active,
                    active: value,
                    taken: value,
                });
            }
            "elif" => match self.conds.last().copied() {
                Some(frame) => {
                    let value =
                        frame.parent_active && !frame.taken && self.eval_condition(rest, file, line);
                    let top = self.conds.last_mut().unwrap();
                    top.active = value;
                    top.taken |= value;
                }
                None => self.stream.diags.error(file, line, "stray #elif"),
            },
            "else" => match self.conds.last_mut() {
                Some(frame) => {
                    frame.active = frame.parent_active && !frame.taken;
                    frame.taken = true;
                }
                None => self.stream.diags.error(file, line, "stray #else"),
            },
            "endif" => {
                if self.conds.pop().is_none() {
                    self.stream.diags.error(file, line, "stray #endif");
                }
            }
            _ if !active => {}
            "include" => self.include_directive(rest, file, line, origin, depth),
            "define" => self.define_directive(rest, file, line),
            "undef" => {
                let (ident, _) = split_word(rest.trim_start());
                self.macros.shift_remove(ident);
            }
            "pragma" => self.pragma_directive(rest, origin),
            "error" => {
                self.stream
                    .diags
                    .error(file, line, format!("#error {}", rest.trim()));
            }
            "warning" => {
                self.stream
                    .diags
                    .warn(file, line, format!("#warning {}", rest.trim()));
            }
            // `#line` markers (as produced by the token dump) carry tokens
            // after the filename; the marker itself is dropped, the rest of
            // the line is ordinary content.
            "line" => {
                let tail = rest.trim_start();
                let tail = tail.trim_start_matches(|c: char| c.is_ascii_digit());
                let tail = tail.trim_start();
                let tail = tail.strip_prefix('"').map_or(tail, |inner| {
                    inner.split_once('"').map_or("", |(_, after)| after)
                });
                if !tail.trim().is_empty() {
                    self.emit_line(tail.trim(), file_id, line, file);
                }
            }
            _ => {
                self.stream.diags.error(
                    file,
                    line,
                    format!("unknown preprocessor directive '#{name}'"),
                );
            }
        }
    }

    fn eval_condition(&mut self, rest: &str, file: &str, line: u32) -> bool {
        let rest = rest.trim();
        if let Some(inner) = rest
            .strip_prefix("defined")
            .map(|tail| tail.trim().trim_start_matches('(').trim_end_matches(')'))
        {
            return self.macros.contains_key(inner.trim());
        }
        let literal = rest.trim_end_matches(['l', 'L', 'u', 'U']);
        match literal.parse::<i64>() {
            Ok(value) => value != 0,
            Err(_) => {
                self.stream.diags.error(
                    file,
                    line,
                    format!("unsupported #if condition `{rest}`"),
                );
                false
            }
        }
    }

    fn include_directive(
        &mut self,
        rest: &str,
        file: &str,
        line: u32,
        origin: Option<&Path>,
        depth: usize,
    ) {
        let rest = rest.trim();
        let (target, quoted) = if let Some(inner) = rest
            .strip_prefix('"')
            .and_then(|tail| tail.split('"').next())
        {
            (inner, true)
        } else if let Some(inner) = rest
            .strip_prefix('<')
            .and_then(|tail| tail.split('>').next())
        {
            (inner, false)
        } else {
            self.stream
                .diags
                .error(file, line, format!("malformed #include {rest}"));
            return;
        };

        let origin_dir = origin.and_then(Path::parent);
        let mut search: Vec<PathBuf> = Vec::new();
        if quoted && let Some(dir) = origin_dir {
            search.push(dir.to_path_buf());
        }
        search.extend(self.includes.iter().cloned());

        for dir in search {
            if let Some(found) = resolve_in_dir(&dir, target, self.case_insensitive) {
                self.include_path(&found, depth + 1);
                return;
            }
        }
        self.stream
            .diags
            .error(file, line, format!("could not find include file `{target}`"));
    }

    fn define_directive(&mut self, rest: &str, file: &str, line: u32) {
        let (name, body) = split_word(rest.trim_start());
        if name.is_empty() {
            self.stream.diags.error(file, line, "#define without a name");
            return;
        }
        // a parenthesis touching the name makes it function-like
        if body.starts_with('(') {
            self.macros.insert(name.to_string(), Macro::Function);
            return;
        }
        let mut tokens = Vec::new();
        lex_line(body.trim(), 0, 0, &mut tokens);
        self.macros.insert(name.to_string(), Macro::Object(tokens));
    }

    fn pragma_directive(&mut self, rest: &str, origin: Option<&Path>) {
        let rest = rest.trim();
        if rest == "once" {
            if let Some(path) = origin {
                self.once.insert(path.to_path_buf());
            }
            return;
        }
        if let Some(lib) = parse_pragma_comment_lib(rest) {
            self.stream.imports.push(lib);
        }
        // other pragmas are ignored, as every C compiler must
    }

    fn emit_line(&mut self, text: &str, file_id: u32, line: u32, file: &str) {
        let mut lexed = Vec::new();
        lex_line(text, file_id, line, &mut lexed);
        let mut guard = HashSet::new();
        for token in lexed {
            self.emit_expanded(token, file, &mut guard);
        }
    }

    fn emit_expanded(&mut self, token: Token, file: &str, guard: &mut HashSet<String>) {
        if token.kind == TokenKind::Ident && !guard.contains(&token.lexeme) {
            match self.macros.get(&token.lexeme) {
                Some(Macro::Object(replacement)) => {
                    let replacement = replacement.clone();
                    guard.insert(token.lexeme.clone());
                    for mut sub in replacement {
                        sub.file = token.file;
                        sub.line = token.line;
                        self.emit_expanded(sub, file, guard);
                    }
                    guard.remove(&token.lexeme);
                    return;
                }
                Some(Macro::Function) => {
                    self.stream.diags.error(
                        file,
                        token.line,
                        format!(
                            "function-like macro `{}` cannot be expanded",
                            token.lexeme
                        ),
                    );
                    return;
                }
                None => {}
            }
        }
        self.stream.tokens.push(token);
    }
}

/// Driver entry point: preprocess a file per `args`.
///
/// On failure the collected diagnostics are flushed to stderr and the context
/// is dropped, mirroring the step's early-error path.
#[must_use]
pub fn preprocess_file(args: &DriverArgs, path: &Path, should_finalize: bool) -> Option<Preprocessor> {
    let diags = Diagnostics::new();
    let pp = Preprocessor::make(&desc_from_args(args, diags.clone()), path);
    run_pp(pp, &diags, should_finalize)
}

/// Driver entry point: preprocess an in-memory source string per `args`.
#[must_use]
pub fn preprocess_source(
    args: &DriverArgs,
    name: &str,
    text: &str,
    should_finalize: bool,
) -> Option<Preprocessor> {
    let diags = Diagnostics::new();
    let pp = Preprocessor::make_from_source(&desc_from_args(args, diags.clone()), name, text);
    run_pp(pp, &diags, should_finalize)
}

fn desc_from_args(args: &DriverArgs, diags: Diagnostics) -> PreprocessDesc<'_> {
    PreprocessDesc {
        version: args.version,
        case_insensitive: args.toolchain.case_insensitive,
        target_os: args.target.os,
        includes: &args.includes,
        defines: &args.defines,
        diags,
    }
}

fn run_pp(mut pp: Preprocessor, diags: &Diagnostics, should_finalize: bool) -> Option<Preprocessor> {
    if !pp.run() {
        diags.flush_to_stderr();
        return None;
    }
    if should_finalize {
        pp.finalize();
    }
    Some(pp)
}

/// Logical lines with their starting physical line numbers; backslash
/// continuations are spliced.
fn logical_lines(text: &str) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    let mut pending: Option<(String, u32)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        let (stripped, continued) = match raw.strip_suffix('\\') {
            Some(head) => (head, true),
            None => (raw, false),
        };
        match pending.take() {
            Some((mut acc, start)) => {
                acc.push_str(stripped);
                if continued {
                    pending = Some((acc, start));
                } else {
                    out.push((acc, start));
                }
            }
            None => {
                if continued {
                    pending = Some((stripped.to_string(), line_no));
                } else {
                    out.push((stripped.to_string(), line_no));
                }
            }
        }
    }
    if let Some(tail) = pending {
        out.push(tail);
    }
    out
}

/// Remove `//` and `/* */` comments, leaving string and char literals alone.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        if *in_block {
            if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                *in_block = false;
                out.push(' ');
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        match quote {
            Some(q) => {
                out.push(bytes[i] as char);
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    out.push(bytes[i + 1] as char);
                    i += 1;
                } else if bytes[i] == q {
                    quote = None;
                }
                i += 1;
            }
            None => match bytes[i] {
                b'"' | b'\'' => {
                    quote = Some(bytes[i]);
                    out.push(bytes[i] as char);
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => break,
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    *in_block = true;
                    i += 2;
                }
                other => {
                    out.push(other as char);
                    i += 1;
                }
            },
        }
    }
    out
}

fn split_word(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map_or(text.len(), |(idx, _)| idx);
    (&text[..end], &text[end..])
}

fn resolve_in_dir(dir: &Path, name: &str, case_insensitive: bool) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    if case_insensitive && !name.contains(['/', '\\']) {
        let entries = fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name))
                && entry.path().is_file()
            {
                return Some(entry.path());
            }
        }
    }
    None
}

/// `comment(lib, "name")` → `name`
fn parse_pragma_comment_lib(rest: &str) -> Option<String> {
    let inner = rest.strip_prefix("comment")?.trim_start();
    let inner = inner.strip_prefix('(')?;
    let inner = inner.rsplit_once(')')?.0;
    let (kind, value) = inner.split_once(',')?;
    if kind.trim() != "lib" {
        return None;
    }
    let value = value.trim().strip_prefix('"')?;
    Some(value.split('"').next()?.to_string())
}

const PUNCTUATORS: [&str; 22] = [
    "<<=", ">>=", "...", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=",
    "-=", "*=", "/=", "%=", "^=", "&=", "|=",
];

fn lex_line(text: &str, file: u32, line: u32, out: &mut Vec<Token>) {
    let bytes = text.as_bytes();
    let mut i = 0;

    let push = |out: &mut Vec<Token>, kind, lexeme: String| {
        out.push(Token {
            kind,
            lexeme,
            file,
            line,
        });
    };

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let ident = &text[start..i];
            // `L` fused to a quote makes a wide literal; the prefix is
            // dropped from the lexeme and restored by the token dump.
            if ident == "L" && matches!(bytes.get(i), Some(b'"' | b'\'')) {
                let quote = bytes[i] as char;
                let lexeme = read_quoted(text, &mut i, quote);
                let kind = if quote == '"' {
                    TokenKind::WideStrLit
                } else {
                    TokenKind::WideCharLit
                };
                push(out, kind, lexeme);
            } else {
                push(out, TokenKind::Ident, ident.to_string());
            }
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            push(out, TokenKind::IntLit, text[start..i].to_string());
            continue;
        }
        if c == '"' || c == '\'' {
            let lexeme = read_quoted(text, &mut i, c);
            let kind = if c == '"' {
                TokenKind::StrLit
            } else {
                TokenKind::CharLit
            };
            push(out, kind, lexeme);
            continue;
        }
        if let Some(punct) = PUNCTUATORS
            .iter()
            .find(|candidate| text[i..].starts_with(**candidate))
        {
            push(out, TokenKind::Punct, (*punct).to_string());
            i += punct.len();
            continue;
        }
        push(out, TokenKind::Punct, c.to_string());
        i += 1;
    }
}

/// Read a quoted literal starting at `*i` (which points at the quote);
/// returns the lexeme including both quotes.
fn read_quoted(text: &str, i: &mut usize, quote: char) -> String {
    let bytes = text.as_bytes();
    let start = *i;
    *i += 1;
    while *i < bytes.len() {
        if bytes[*i] == b'\\' {
            *i += 2;
            continue;
        }
        if bytes[*i] as char == quote {
            *i += 1;
            break;
        }
        *i += 1;
    }
    text[start..(*i).min(text.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::DriverArgs;
    use std::io::Write;

    fn preprocess(text: &str) -> Option<Preprocessor> {
        let args = DriverArgs::default();
        preprocess_source(&args, "test.c", text, true)
    }

    fn lexemes(pp: &Preprocessor) -> Vec<String> {
        pp.stream().tokens.iter().map(|t| t.lexeme.clone()).collect()
    }

    #[test]
    fn object_macros_expand() {
        let pp = preprocess("#define N 4\nint x = N;\n").unwrap();
        assert_eq!(lexemes(&pp), ["int", "x", "=", "4", ";"]);
    }

    #[test]
    fn self_referential_macro_stops() {
        let pp = preprocess("#define X X\nint X;\n").unwrap();
        assert_eq!(lexemes(&pp), ["int", "X", ";"]);
    }

    #[test]
    fn conditionals_select_branches() {
        let text = "#define A 1\n#ifdef A\nint yes;\n#else\nint no;\n#endif\n#ifndef A\nint never;\n#endif\n";
        let pp = preprocess(text).unwrap();
        assert_eq!(lexemes(&pp), ["int", "yes", ";"]);
    }

    #[test]
    fn pragma_comment_lib_is_collected() {
        let pp = preprocess("#pragma comment(lib, \"winmm\")\nint x;\n").unwrap();
        assert_eq!(pp.stream().imports, ["winmm"]);
    }

    #[test]
    fn includes_are_resolved_against_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("vals.h");
        std::fs::write(&header, "#define FOUR 4\n").unwrap();
        let source = dir.path().join("main.c");
        let mut f = std::fs::File::create(&source).unwrap();
        writeln!(f, "#include <vals.h>").unwrap();
        writeln!(f, "int x = FOUR;").unwrap();

        let mut args = DriverArgs::default();
        args.includes.push(dir.path().to_path_buf());
        let pp = preprocess_file(&args, &source, true).unwrap();
        assert_eq!(lexemes(&pp), ["int", "x", "=", "4", ";"]);
    }

    #[test]
    fn missing_include_fails_the_run() {
        assert!(preprocess("#include \"no-such-file.h\"\n").is_none());
    }

    #[test]
    fn error_directive_fails_the_run() {
        assert!(preprocess("#error not today\n").is_none());
    }

    #[test]
    fn comments_and_continuations_vanish() {
        let text = "int /* gap */ x; // tail\n#define TWO \\\n2\nint y = TWO;\n";
        let pp = preprocess(text).unwrap();
        assert_eq!(lexemes(&pp), ["int", "x", ";", "int", "y", "=", "2", ";"]);
    }

    #[test]
    fn wide_literals_keep_their_kind() {
        let pp = preprocess("int x = L\"wide\";\n").unwrap();
        let token = pp
            .stream()
            .tokens
            .iter()
            .find(|t| t.kind == TokenKind::WideStrLit)
            .unwrap();
        assert_eq!(token.lexeme, "\"wide\"");
    }
}
