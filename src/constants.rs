//! Constants used throughout the cinder codebase

/// Default executable name on non-Windows targets
pub const DEFAULT_OUTPUT_UNIX: &str = "a.out";

/// Default executable name on Windows targets
pub const DEFAULT_OUTPUT_WINDOWS: &str = "a.exe";

/// Extension given to emitted object files
pub const OBJECT_EXT: &str = "o";

/// CRT inputs appended for Windows targets unless `--nocrt`
pub const WINDOWS_CRT_LIBS: [&str; 4] = ["kernel32", "ucrt", "msvcrt", "vcruntime"];

/// Include nesting beyond this is reported as an error
pub const MAX_INCLUDE_DEPTH: usize = 64;

/// Project configuration file looked up next to the sources
pub const CONFIG_FILE: &str = "cinder.toml";
