use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

use crate::toolchain::Toolchain;

/// C language version the front end targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CVersion {
    C11,
    C17,
    #[default]
    C23,
}

/// CPU architecture of the output. x86-64 is the only machine the code
/// generator currently encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
}

/// Operating system of the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetOs {
    Windows,
    Linux,
    Darwin,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    pub arch: Arch,
    pub os: TargetOs,
}

#[derive(Debug, Error)]
#[error("unrecognized target triple `{0}`")]
pub struct TargetParseError(String);

impl Target {
    #[must_use]
    pub fn host() -> Self {
        let arch = Arch::X86_64;
        let os = if cfg!(windows) {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Darwin
        } else if cfg!(target_os = "linux") {
            TargetOs::Linux
        } else {
            TargetOs::Unknown
        };
        Self { arch, os }
    }

    /// Parse a `<arch>-<os>[-<env>]` triple such as `x86_64-linux-gnu`.
    ///
    /// # Errors
    ///
    /// Returns an error when either component is unknown.
    pub fn parse(triple: &str) -> Result<Self, TargetParseError> {
        let mut parts = triple.split('-');
        let arch = match parts.next() {
            Some("x86_64" | "amd64") => Arch::X86_64,
            _ => return Err(TargetParseError(triple.to_string())),
        };
        let os = parts
            .find_map(|part| match part {
                "windows" | "win32" => Some(TargetOs::Windows),
                "linux" => Some(TargetOs::Linux),
                "darwin" | "macos" => Some(TargetOs::Darwin),
                _ => None,
            })
            .ok_or_else(|| TargetParseError(triple.to_string()))?;
        Ok(Self { arch, os })
    }
}

/// Shape of the final artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flavor {
    /// Stop after the object file.
    Object,
    #[default]
    Executable,
}

/// Windows subsystem stamped into PE outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    Console,
    Windows,
}

/// Immutable-after-parsing configuration for one driver run.
///
/// Two fields are deliberately not plain data: `libraries` grows when CC
/// steps register `#pragma comment(lib, ...)` imports, and `subsystem` is
/// set at most once, either by the user or by the fan-out's WinMain probe.
#[derive(Debug)]
pub struct DriverArgs {
    pub sources: Vec<PathBuf>,
    pub includes: Vec<PathBuf>,
    pub libpaths: Vec<PathBuf>,
    pub libraries: Mutex<Vec<String>>,
    pub defines: Vec<String>,
    pub target: Target,
    pub toolchain: Toolchain,
    pub version: CVersion,
    pub opt_level: u8,
    pub threads: usize,
    pub flavor: Flavor,
    pub entrypoint: Option<String>,
    pub subsystem: OnceLock<Subsystem>,
    pub output_name: Option<String>,

    pub verbose: bool,
    pub preprocess: bool,
    pub test_preproc: bool,
    pub syntax_only: bool,
    pub ast: bool,
    pub emit_ir: bool,
    pub assembly: bool,
    pub debug_info: bool,
    pub preserve_ast: bool,
    pub run: bool,
    pub nocrt: bool,
    pub based: bool,
}

impl Default for DriverArgs {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            includes: Vec::new(),
            libpaths: Vec::new(),
            libraries: Mutex::new(Vec::new()),
            defines: Vec::new(),
            target: Target::host(),
            toolchain: Toolchain::host(),
            version: CVersion::default(),
            opt_level: 0,
            threads: 1,
            flavor: Flavor::default(),
            entrypoint: None,
            subsystem: OnceLock::new(),
            output_name: None,
            verbose: false,
            preprocess: false,
            test_preproc: false,
            syntax_only: false,
            ast: false,
            emit_ir: false,
            assembly: false,
            debug_info: false,
            preserve_ast: false,
            run: false,
            nocrt: false,
            based: false,
        }
    }
}

impl DriverArgs {
    /// Convenience constructor used throughout the tests.
    #[must_use]
    pub fn for_sources(sources: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// True iff none of the five early-exit flags is set, i.e. the run
    /// reaches the back end.
    #[must_use]
    pub fn does_codegen(&self) -> bool {
        !self.emit_ir && !self.test_preproc && !self.preprocess && !self.syntax_only && !self.ast
    }

    /// Snapshot of the library inputs, including registered pragma imports.
    #[must_use]
    pub fn libraries_snapshot(&self) -> Vec<String> {
        self.libraries.lock().unwrap().clone()
    }

    pub fn push_library(&self, name: impl Into<String>) {
        self.libraries.lock().unwrap().push(name.into());
    }
}

#[cfg(test)]
mod tests {
    use super::{Arch, DriverArgs, Target, TargetOs};

    #[test]
    fn triple_parsing() {
        let t = Target::parse("x86_64-linux-gnu").unwrap();
        assert_eq!(t.arch, Arch::X86_64);
        assert_eq!(t.os, TargetOs::Linux);

        let t = Target::parse("x86_64-pc-windows-msvc").unwrap();
        assert_eq!(t.arch, Arch::X86_64);
        assert_eq!(t.os, TargetOs::Windows);

        assert!(Target::parse("riscv64-linux").is_err());
        assert!(Target::parse("x86_64").is_err());
    }

    #[test]
    fn does_codegen_is_the_nor_of_the_early_exits() {
        let mut args = DriverArgs::default();
        assert!(args.does_codegen());

        for flag in 0..5 {
            let mut probe = DriverArgs::default();
            match flag {
                0 => probe.emit_ir = true,
                1 => probe.test_preproc = true,
                2 => probe.preprocess = true,
                3 => probe.syntax_only = true,
                _ => probe.ast = true,
            }
            assert!(!probe.does_codegen());
        }

        args.assembly = true;
        args.debug_info = true;
        assert!(args.does_codegen());
    }

    #[test]
    fn pragma_imports_land_in_the_snapshot() {
        let args = DriverArgs::default();
        args.push_library("user32");
        assert_eq!(args.libraries_snapshot(), vec!["user32".to_string()]);
    }
}
