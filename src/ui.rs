use crossterm::style::Stylize;

/// Minimal helper for consistent CLI output.
pub fn step(message: impl AsRef<str>) {
    eprintln!("{} {}", "==>".bold().cyan(), message.as_ref());
}

/// Print an error line.
pub fn error(message: impl AsRef<str>) {
    eprintln!("{} {}", "error:".bold().red(), message.as_ref());
}
