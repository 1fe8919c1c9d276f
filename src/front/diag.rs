use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}:{}: {level}: {}", self.file, self.line, self.message)
    }
}

#[derive(Default)]
struct DiagState {
    pending: Vec<Diagnostic>,
    errors: usize,
}

/// Diagnostic accumulator shared by the front-end phases of one CC step.
///
/// Phases push into it from whatever thread they run on; the step flushes it
/// to stderr under the run's logging mutex, either just before backend work
/// begins or on the early-exit/error path.
#[derive(Clone, Default)]
pub struct Diagnostics {
    state: Arc<Mutex<DiagState>>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&self, file: impl Into<String>, line: u32, message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.errors += 1;
        state.pending.push(Diagnostic {
            severity: Severity::Error,
            file: file.into(),
            line,
            message: message.into(),
        });
    }

    pub fn warn(&self, file: impl Into<String>, line: u32, message: impl Into<String>) {
        self.state.lock().unwrap().pending.push(Diagnostic {
            severity: Severity::Warning,
            file: file.into(),
            line,
            message: message.into(),
        });
    }

    /// Total errors reported over the stream's lifetime, flushed or not.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.state.lock().unwrap().errors
    }

    /// Drain pending diagnostics into `out`. Draining keeps a later flush
    /// from repeating earlier lines; the error count is not reset.
    pub fn flush_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending);
        for diag in &pending {
            writeln!(out, "{diag}")?;
        }
        Ok(())
    }

    /// Flush to stderr, ignoring write failures the way a dying pipe does.
    pub fn flush_to_stderr(&self) {
        let _ = self.flush_to(&mut io::stderr().lock());
    }
}

#[cfg(test)]
mod tests {
    use super::Diagnostics;

    #[test]
    fn errors_accumulate_and_flush_once() {
        let diags = Diagnostics::new();
        diags.error("a.c", 3, "undeclared identifier 'x'");
        diags.warn("a.c", 4, "unused variable 'y'");
        assert_eq!(diags.error_count(), 1);

        let mut out = Vec::new();
        diags.flush_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("a.c:3: error: undeclared identifier 'x'"));
        assert!(text.contains("a.c:4: warning: unused variable 'y'"));

        let mut again = Vec::new();
        diags.flush_to(&mut again).unwrap();
        assert!(again.is_empty());
        assert_eq!(diags.error_count(), 1);
    }
}
