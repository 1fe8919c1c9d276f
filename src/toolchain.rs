use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Which system toolchain supplies default search paths and the linker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolchainKind {
    Msvc,
    Darwin,
    Gnu,
    /// No usable host toolchain; only the internal linker works.
    None,
}

/// Descriptor for the external toolchain the driver may shell out to.
#[derive(Clone, Copy, Debug)]
pub struct Toolchain {
    pub kind: ToolchainKind,
    /// MSVC header and library lookup ignores case.
    pub case_insensitive: bool,
}

impl Toolchain {
    /// Host toolchain, selected at build time: MSVC on Windows, Darwin on
    /// macOS, GNU on Linux, else empty.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(windows) {
            Self {
                kind: ToolchainKind::Msvc,
                case_insensitive: true,
            }
        } else if cfg!(target_os = "macos") {
            Self {
                kind: ToolchainKind::Darwin,
                case_insensitive: false,
            }
        } else if cfg!(target_os = "linux") {
            Self {
                kind: ToolchainKind::Gnu,
                case_insensitive: false,
            }
        } else {
            Self {
                kind: ToolchainKind::None,
                case_insensitive: false,
            }
        }
    }

    /// System library search paths, empty when `nocrt` asks for a
    /// freestanding link.
    #[must_use]
    pub fn default_libpaths(&self, nocrt: bool) -> Vec<PathBuf> {
        if nocrt {
            return Vec::new();
        }
        match self.kind {
            ToolchainKind::Msvc => std::env::var("LIB")
                .map(|paths| std::env::split_paths(&paths).collect())
                .unwrap_or_default(),
            ToolchainKind::Darwin => vec![PathBuf::from("/usr/lib")],
            ToolchainKind::Gnu => vec![
                PathBuf::from("/usr/lib"),
                PathBuf::from("/usr/lib/x86_64-linux-gnu"),
                PathBuf::from("/lib"),
            ],
            ToolchainKind::None => Vec::new(),
        }
    }

    /// The system linker executable.
    #[must_use]
    pub const fn linker_program(&self) -> &'static str {
        match self.kind {
            ToolchainKind::Msvc => "link",
            ToolchainKind::Darwin | ToolchainKind::Gnu | ToolchainKind::None => "cc",
        }
    }

    /// Arguments for the system-linker invocation. Each argument is built
    /// directly, so paths carrying spaces, quotes, or backslashes reach the
    /// linker untouched.
    #[must_use]
    pub fn link_args(
        &self,
        objects: &[PathBuf],
        libpaths: &[PathBuf],
        libraries: &[String],
        output: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self.kind {
            ToolchainKind::Msvc => {
                args.push("/nologo".into());
                for object in objects {
                    args.push(object.as_os_str().to_os_string());
                }
                let mut out = OsString::from("/out:");
                out.push(output);
                args.push(out);
                for dir in libpaths {
                    let mut arg = OsString::from("/libpath:");
                    arg.push(dir);
                    args.push(arg);
                }
                for library in libraries {
                    args.push(format!("{library}.lib").into());
                }
            }
            ToolchainKind::Darwin | ToolchainKind::Gnu | ToolchainKind::None => {
                for object in objects {
                    args.push(object.as_os_str().to_os_string());
                }
                args.push("-o".into());
                args.push(output.as_os_str().to_os_string());
                for dir in libpaths {
                    let mut arg = OsString::from("-L");
                    arg.push(dir);
                    args.push(arg);
                }
                for library in libraries {
                    args.push(format!("-l{library}").into());
                }
            }
        }
        args
    }

    /// Invoke the system linker and wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the linker process cannot be spawned.
    pub fn invoke_linker(
        &self,
        objects: &[PathBuf],
        libpaths: &[PathBuf],
        libraries: &[String],
        output: &Path,
    ) -> io::Result<ExitStatus> {
        Command::new(self.linker_program())
            .args(self.link_args(objects, libpaths, libraries, output))
            .status()
    }
}

/// Split a user-supplied command line and run it synchronously, inheriting
/// stdio. This is the Sys step's entry point; driver-built invocations pass
/// their arguments directly instead.
///
/// # Errors
///
/// Returns an error if the line cannot be split or the program cannot spawn.
pub fn run_command_line(line: &str) -> io::Result<ExitStatus> {
    let argv = shell_words::split(line).map_err(io::Error::other)?;
    let Some((program, rest)) = argv.split_first() else {
        return Err(io::Error::other("empty command"));
    };
    Command::new(program).args(rest).status()
}

#[cfg(test)]
mod tests {
    use super::{Toolchain, ToolchainKind, run_command_line};
    use std::path::{Path, PathBuf};

    fn gnu() -> Toolchain {
        Toolchain {
            kind: ToolchainKind::Gnu,
            case_insensitive: false,
        }
    }

    fn rendered(args: &[std::ffi::OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn gnu_link_invocation_shape() {
        let tc = gnu();
        assert_eq!(tc.linker_program(), "cc");
        let args = tc.link_args(
            &[PathBuf::from("x.o")],
            &[PathBuf::from("/opt/lib")],
            &["m".to_string()],
            Path::new("a.out"),
        );
        assert_eq!(rendered(&args), ["x.o", "-o", "a.out", "-L/opt/lib", "-lm"]);
    }

    #[test]
    fn msvc_link_invocation_shape() {
        let tc = Toolchain {
            kind: ToolchainKind::Msvc,
            case_insensitive: true,
        };
        assert_eq!(tc.linker_program(), "link");
        let args = tc.link_args(
            &[PathBuf::from("x.o")],
            &[PathBuf::from("C:\\libs")],
            &["user32".to_string()],
            Path::new("game.exe"),
        );
        assert_eq!(
            rendered(&args),
            ["/nologo", "x.o", "/out:game.exe", "/libpath:C:\\libs", "user32.lib"]
        );
    }

    #[test]
    fn awkward_paths_stay_single_arguments() {
        let args = gnu().link_args(
            &[PathBuf::from("my objs/x.o")],
            &[PathBuf::from("/opt/odd \"libs\"")],
            &[],
            Path::new("out dir/a.out"),
        );
        assert_eq!(
            rendered(&args),
            ["my objs/x.o", "-o", "out dir/a.out", "-L/opt/odd \"libs\""]
        );
    }

    #[test]
    fn command_exit_status_is_surfaced() {
        assert!(run_command_line("true").unwrap().success());
        assert!(!run_command_line("false").unwrap().success());
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(run_command_line("").is_err());
    }
}
