use std::io::{self, Write};

use super::diag::Diagnostics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    IntLit,
    CharLit,
    StrLit,
    /// `L'x'`; the lexeme excludes the `L`.
    WideCharLit,
    /// `L"..."`; the lexeme excludes the `L`.
    WideStrLit,
    Punct,
}

impl TokenKind {
    #[must_use]
    pub fn is_wide(self) -> bool {
        matches!(self, Self::WideCharLit | Self::WideStrLit)
    }
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub file: u32,
    pub line: u32,
}

/// The preprocessed token stream of one translation unit.
///
/// Carries the interned file table for location reporting, the shared
/// diagnostic accumulator, and any `#pragma comment(lib, ...)` import
/// requests collected along the way.
pub struct TokenStream {
    pub tokens: Vec<Token>,
    files: Vec<String>,
    pub diags: Diagnostics,
    pub imports: Vec<String>,
}

impl TokenStream {
    #[must_use]
    pub fn new(diags: Diagnostics) -> Self {
        Self {
            tokens: Vec::new(),
            files: Vec::new(),
            diags,
            imports: Vec::new(),
        }
    }

    pub fn intern_file(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.files.iter().position(|f| f == name) {
            return u32::try_from(pos).unwrap_or(0);
        }
        self.files.push(name.to_string());
        u32::try_from(self.files.len() - 1).unwrap_or(0)
    }

    #[must_use]
    pub fn file_name(&self, id: u32) -> &str {
        self.files.get(id as usize).map_or("<unknown>", String::as_str)
    }

    /// Dump the stream in the `-P` replay format.
    ///
    /// The output is valid preprocessed C: `#line` markers on file changes
    /// (backslashes in the name doubled so they are not escapes), a line
    /// comment on line changes, and every token separated by one space.
    ///
    /// # Errors
    ///
    /// Returns an error if `out` rejects a write.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut last_file = None;
        let mut last_line = 0;

        for token in &self.tokens {
            if last_file != Some(token.file) {
                let escaped = self.file_name(token.file).replace('\\', "\\\\");
                write!(out, "\n#line {} \"{escaped}\"\t", token.line)?;
                last_file = Some(token.file);
                last_line = token.line;
            } else if last_line != token.line {
                write!(out, "\n/* line {:>3} */\t", token.line)?;
                last_line = token.line;
            }

            if token.kind.is_wide() {
                write!(out, "L")?;
            }
            write!(out, "{} ", token.lexeme)?;
        }
        writeln!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{Token, TokenKind, TokenStream};
    use crate::front::diag::Diagnostics;

    fn tok(kind: TokenKind, lexeme: &str, file: u32, line: u32) -> Token {
        Token {
            kind,
            lexeme: lexeme.to_string(),
            file,
            line,
        }
    }

    fn dumped(stream: &TokenStream) -> String {
        let mut out = Vec::new();
        stream.dump(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dump_marks_files_and_lines() {
        let mut stream = TokenStream::new(Diagnostics::new());
        let main = stream.intern_file("dir\\main.c");
        let header = stream.intern_file("util.h");
        stream.tokens = vec![
            tok(TokenKind::Ident, "int", main, 1),
            tok(TokenKind::Ident, "x", main, 1),
            tok(TokenKind::Punct, ";", main, 2),
            tok(TokenKind::Ident, "y", header, 7),
        ];

        let text = dumped(&stream);
        assert!(text.starts_with("\n#line 1 \"dir\\\\main.c\"\tint x "));
        assert!(text.contains("\n/* line   2 */\t; "));
        assert!(text.contains("\n#line 7 \"util.h\"\ty "));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn wide_literals_get_their_prefix_back() {
        let mut stream = TokenStream::new(Diagnostics::new());
        let file = stream.intern_file("w.c");
        stream.tokens = vec![tok(TokenKind::WideStrLit, "\"hi\"", file, 1)];
        assert!(dumped(&stream).contains("L\"hi\" "));
    }

    #[test]
    fn dump_is_idempotent() {
        let mut stream = TokenStream::new(Diagnostics::new());
        let file = stream.intern_file("a.c");
        stream.tokens = vec![
            tok(TokenKind::Ident, "return", file, 1),
            tok(TokenKind::IntLit, "0", file, 2),
        ];
        assert_eq!(dumped(&stream), dumped(&stream));
    }
}
