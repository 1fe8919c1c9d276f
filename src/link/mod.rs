//! The internal linker: turns the shared IR module straight into a PE or ELF
//! image without shelling out, plus the library search both linker paths use.

mod elf;
mod pe;

use std::collections::VecDeque;
use std::path::PathBuf;

use thiserror::Error;

use crate::args::{Arch, DriverArgs, Subsystem};
use crate::constants::WINDOWS_CRT_LIBS;
use crate::ir::Module;
use crate::ir::obj::Layout;

/// Executable container format, decided by the target OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecFormat {
    Pe,
    Elf,
}

/// Messages the linker surfaces while resolving inputs. Import requests are
/// reserved for DLL import handling, which is not implemented yet.
#[derive(Debug)]
pub enum LinkerMsg {
    Import { symbol: String },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unresolved symbol `{0}`")]
    Unresolved(String),
    #[error("entrypoint symbol `{0}` is not defined")]
    MissingEntrypoint(String),
    #[error("no module appended")]
    NoModule,
}

/// Internal linker context bound to a target architecture and format.
pub struct Linker {
    format: ExecFormat,
    pub arch: Arch,
    libraries: Vec<(String, Vec<u8>)>,
    layout: Option<Layout>,
    entrypoint: Option<String>,
    subsystem: Option<Subsystem>,
    messages: VecDeque<LinkerMsg>,
}

impl Linker {
    #[must_use]
    pub fn new(format: ExecFormat, arch: Arch) -> Self {
        Self {
            format,
            arch,
            libraries: Vec::new(),
            layout: None,
            entrypoint: None,
            subsystem: None,
            messages: VecDeque::new(),
        }
    }

    /// Feed a resolved library in as a named blob.
    pub fn append_library(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.libraries.push((name.into(), data));
    }

    /// Number of library blobs appended so far.
    #[must_use]
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Snapshot the module's sections and symbols for layout.
    pub fn append_module(&mut self, module: &Module) {
        self.layout = Some(Layout::of(module));
    }

    pub fn set_entrypoint(&mut self, name: impl Into<String>) {
        self.entrypoint = Some(name.into());
    }

    pub fn set_subsystem(&mut self, subsystem: Subsystem) {
        self.subsystem = Some(subsystem);
    }

    /// Drain one pending linker message.
    pub fn poll_message(&mut self) -> Option<LinkerMsg> {
        self.messages.pop_front()
    }

    /// Produce the final image.
    ///
    /// # Errors
    ///
    /// Returns an error when no module was appended, a relocation target is
    /// missing, or the entrypoint symbol is not defined.
    pub fn export(&self) -> Result<Vec<u8>, LinkError> {
        let layout = self.layout.as_ref().ok_or(LinkError::NoModule)?;
        let entry = self.entrypoint.as_deref().unwrap_or("main");
        match self.format {
            ExecFormat::Elf => elf::write_executable(layout, entry),
            ExecFormat::Pe => pe::write_executable(layout, entry, self.subsystem),
        }
    }
}

/// Library inputs and the paths to search for them, assembled the same way
/// for the internal and the external linker paths.
pub struct LibrarySearch {
    paths: Vec<PathBuf>,
    inputs: Vec<String>,
}

impl LibrarySearch {
    /// Toolchain default paths (honoring `nocrt`), user `-L` paths, user and
    /// pragma libraries, plus the Windows CRT set when targeting Windows.
    #[must_use]
    pub fn from_args(args: &DriverArgs) -> Self {
        let mut paths = args.toolchain.default_libpaths(args.nocrt);
        paths.extend(args.libpaths.iter().cloned());

        let mut inputs = args.libraries_snapshot();
        if args.target.os == crate::args::TargetOs::Windows && !args.nocrt {
            inputs.extend(WINDOWS_CRT_LIBS.iter().map(|lib| (*lib).to_string()));
        }
        Self { paths, inputs }
    }

    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Locate one library by probing the conventional file names in each
    /// search path.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let candidates = [
            name.to_string(),
            format!("lib{name}.a"),
            format!("lib{name}.so"),
            format!("{name}.lib"),
        ];
        for dir in &self.paths {
            for candidate in &candidates {
                let path = dir.join(candidate);
                if path.is_file() {
                    return Some(path);
                }
            }
        }
        None
    }
}

pub(crate) fn resolve_rel32(site_end: u64, target: u64) -> i32 {
    i32::try_from(target.wrapping_sub(site_end).cast_signed()).unwrap_or(0)
}

pub(crate) fn find_target(layout: &Layout, name: &str) -> Result<(bool, usize), LinkError> {
    layout
        .defs
        .iter()
        .find(|def| def.name == name)
        .map(|def| (def.is_func, def.value))
        .ok_or_else(|| LinkError::Unresolved(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{ExecFormat, LibrarySearch, LinkError, Linker};
    use crate::args::{Arch, DriverArgs, Target, TargetOs};
    use crate::ir::{Inst, IrFunction, Linkage, Module, SymKind};

    fn module_with(entry: &str) -> Module {
        let module = Module::new(Arch::X86_64, TargetOs::Linux, false);
        let main = module.intern(entry, Linkage::Export, SymKind::Function, 0);
        assert!(main.claim_body(IrFunction {
            insts: vec![Inst::PushConst(0), Inst::Ret { has_value: true }],
            local_count: 0,
            returns_value: true,
        }));
        module
    }

    #[test]
    fn elf_export_produces_an_executable_image() {
        let mut linker = Linker::new(ExecFormat::Elf, Arch::X86_64);
        linker.append_module(&module_with("main"));
        let image = linker.export().unwrap();
        assert_eq!(&image[..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2); // ET_EXEC
    }

    #[test]
    fn pe_export_produces_an_executable_image() {
        let mut linker = Linker::new(ExecFormat::Pe, Arch::X86_64);
        linker.append_module(&module_with("main"));
        linker.set_subsystem(crate::args::Subsystem::Console);
        let image = linker.export().unwrap();
        assert_eq!(&image[..2], b"MZ");
    }

    #[test]
    fn missing_entrypoint_is_reported() {
        let mut linker = Linker::new(ExecFormat::Elf, Arch::X86_64);
        linker.append_module(&module_with("not_main"));
        assert!(matches!(
            linker.export(),
            Err(LinkError::MissingEntrypoint(_))
        ));
    }

    #[test]
    fn export_without_module_is_an_error() {
        let linker = Linker::new(ExecFormat::Elf, Arch::X86_64);
        assert!(matches!(linker.export(), Err(LinkError::NoModule)));
    }

    #[test]
    fn custom_entrypoint_is_honored() {
        let mut linker = Linker::new(ExecFormat::Elf, Arch::X86_64);
        linker.append_module(&module_with("start"));
        linker.set_entrypoint("start");
        assert!(linker.export().is_ok());
    }

    #[test]
    fn library_search_probes_conventional_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libm.a"), b"!<arch>\n").unwrap();

        let mut args = DriverArgs::default();
        args.nocrt = true;
        args.target = Target {
            arch: Arch::X86_64,
            os: TargetOs::Linux,
        };
        args.libpaths.push(dir.path().to_path_buf());
        args.push_library("m");
        args.push_library("nope");

        let search = LibrarySearch::from_args(&args);
        assert_eq!(search.inputs().len(), 2);
        assert!(search.find("m").is_some());
        assert!(search.find("nope").is_none());
        assert!(search.paths().iter().any(|p| p == dir.path()));
    }
}
