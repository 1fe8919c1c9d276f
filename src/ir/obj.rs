//! Relocatable object emission: ELF64 for Unix-like targets, COFF for
//! Windows targets.

use crate::args::TargetOs;

use super::passes::encode_x86_64;
use super::{Module, RelocKind, SymKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebugFormat {
    #[default]
    None,
    CodeView,
}

/// Export the module as a relocatable object in the target's native format.
#[must_use]
pub fn export_object(module: &Module, debug: DebugFormat) -> Vec<u8> {
    let layout = Layout::of(module);
    match module.os {
        TargetOs::Windows => write_coff(&layout, debug),
        _ => write_elf(&layout),
    }
}

pub(crate) struct DefSym {
    pub name: String,
    pub is_func: bool,
    pub local: bool,
    pub value: usize,
    pub size: usize,
}

pub(crate) struct ObjReloc {
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
}

/// Flattened sections plus the symbol and relocation lists both formats share.
pub(crate) struct Layout {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub defs: Vec<DefSym>,
    pub undefs: Vec<String>,
    pub relocs: Vec<ObjReloc>,
}

impl Layout {
    pub(crate) fn of(module: &Module) -> Self {
        let mut layout = Self {
            text: Vec::new(),
            data: Vec::new(),
            defs: Vec::new(),
            undefs: Vec::new(),
            relocs: Vec::new(),
        };

        for symbol in module.symbols() {
            match symbol.kind {
                SymKind::Function => {
                    let Some(body) = symbol.body_snapshot() else {
                        continue;
                    };
                    let output = symbol
                        .output_snapshot()
                        .unwrap_or_else(|| encode_x86_64(&symbol.name, &body, false));
                    while layout.text.len() % 16 != 0 {
                        layout.text.push(0xCC);
                    }
                    let base = layout.text.len();
                    for reloc in &output.relocs {
                        layout.relocs.push(ObjReloc {
                            offset: base + reloc.offset,
                            symbol: reloc.symbol.clone(),
                            kind: reloc.kind,
                        });
                    }
                    layout.defs.push(DefSym {
                        name: symbol.name.clone(),
                        is_func: true,
                        local: symbol.linkage == super::Linkage::Local,
                        value: base,
                        size: output.code.len(),
                    });
                    layout.text.extend_from_slice(&output.code);
                }
                SymKind::Global => {
                    let bytes = symbol.data_snapshot();
                    while layout.data.len() % 8 != 0 {
                        layout.data.push(0);
                    }
                    layout.defs.push(DefSym {
                        name: symbol.name.clone(),
                        is_func: false,
                        local: symbol.linkage == super::Linkage::Local,
                        value: layout.data.len(),
                        size: bytes.len().max(1),
                    });
                    layout.data.extend_from_slice(&bytes);
                }
            }
        }

        // Anything relocated against but not defined becomes an undef entry.
        for reloc in &layout.relocs {
            let defined = layout.defs.iter().any(|d| d.name == reloc.symbol);
            if !defined && !layout.undefs.contains(&reloc.symbol) {
                layout.undefs.push(reloc.symbol.clone());
            }
        }
        layout
    }
}

pub(crate) struct Buf(pub(crate) Vec<u8>);

impl Buf {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }
    pub(crate) fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    pub(crate) fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    pub(crate) fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    pub(crate) fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    pub(crate) fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
    pub(crate) fn pad_to(&mut self, align: usize) {
        while self.0.len() % align != 0 {
            self.0.push(0);
        }
    }
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

// ---- ELF64 ----

const SHN_UNDEF: u16 = 0;
const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;

struct ElfSym {
    name_off: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

fn write_elf(layout: &Layout) -> Vec<u8> {
    // section indexes: 0 null, 1 .text, 2 .rela.text, 3 .data, 4 .symtab,
    // 5 .strtab, 6 .shstrtab
    let mut strtab: Vec<u8> = vec![0];
    let mut intern = |table: &mut Vec<u8>, name: &str| -> u32 {
        let off = u32::try_from(table.len()).unwrap_or(0);
        table.extend_from_slice(name.as_bytes());
        table.push(0);
        off
    };

    let mut syms: Vec<ElfSym> = vec![ElfSym {
        name_off: 0,
        info: 0,
        shndx: SHN_UNDEF,
        value: 0,
        size: 0,
    }];
    let mut order: Vec<(&DefSym, bool)> = Vec::new();
    for def in layout.defs.iter().filter(|d| d.local) {
        order.push((def, true));
    }
    let first_global = order.len() + 1;
    for def in layout.defs.iter().filter(|d| !d.local) {
        order.push((def, false));
    }

    let mut indexes: Vec<(String, usize)> = Vec::new();
    for (def, local) in &order {
        let bind = if *local { STB_LOCAL } else { STB_GLOBAL };
        let ty = if def.is_func { STT_FUNC } else { STT_OBJECT };
        indexes.push((def.name.clone(), syms.len()));
        syms.push(ElfSym {
            name_off: intern(&mut strtab, &def.name),
            info: (bind << 4) | ty,
            shndx: if def.is_func { 1 } else { 3 },
            value: def.value as u64,
            size: def.size as u64,
        });
    }
    for undef in &layout.undefs {
        indexes.push((undef.clone(), syms.len()));
        syms.push(ElfSym {
            name_off: intern(&mut strtab, undef),
            info: STB_GLOBAL << 4,
            shndx: SHN_UNDEF,
            value: 0,
            size: 0,
        });
    }
    let lookup = |name: &str| -> u32 {
        indexes
            .iter()
            .find(|(n, _)| n == name)
            .map_or(0, |(_, idx)| u32::try_from(*idx).unwrap_or(0))
    };

    let mut shstrtab: Vec<u8> = vec![0];
    let text_name = intern(&mut shstrtab, ".text");
    let rela_name = intern(&mut shstrtab, ".rela.text");
    let data_name = intern(&mut shstrtab, ".data");
    let symtab_name = intern(&mut shstrtab, ".symtab");
    let strtab_name = intern(&mut shstrtab, ".strtab");
    let shstrtab_name = intern(&mut shstrtab, ".shstrtab");

    let mut body = Buf::new();
    // ELF header placeholder is written last; compute offsets as we go.
    let ehsize = 64usize;
    let text_off = ehsize;
    let mut out = Buf::new();
    out.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.bytes(&[0; 8]);
    out.u16(1); // ET_REL
    out.u16(62); // EM_X86_64
    out.u32(1);
    out.u64(0); // e_entry
    out.u64(0); // e_phoff
    // e_shoff patched below
    let shoff_pos = out.len();
    out.u64(0);
    out.u32(0); // e_flags
    out.u16(64);
    out.u16(0);
    out.u16(0);
    out.u16(64); // e_shentsize
    out.u16(7); // e_shnum
    out.u16(6); // e_shstrndx

    body.bytes(&layout.text);
    body.pad_to(8);
    let rela_off = ehsize + body.len();
    for reloc in &layout.relocs {
        body.u64(reloc.offset as u64);
        let ty = match reloc.kind {
            RelocKind::Call => R_X86_64_PLT32,
            RelocKind::Rip32 => R_X86_64_PC32,
        };
        body.u64((u64::from(lookup(&reloc.symbol)) << 32) | u64::from(ty));
        body.i64(-4);
    }
    let data_off = ehsize + body.len();
    body.bytes(&layout.data);
    body.pad_to(8);
    let symtab_off = ehsize + body.len();
    for sym in &syms {
        body.u32(sym.name_off);
        body.u8(sym.info);
        body.u8(0); // st_other
        body.u16(sym.shndx);
        body.u64(sym.value);
        body.u64(sym.size);
    }
    let strtab_off = ehsize + body.len();
    body.bytes(&strtab);
    body.pad_to(8);
    let shstrtab_off = ehsize + body.len();
    body.bytes(&shstrtab);
    body.pad_to(8);
    let shoff = ehsize + body.len();

    // section headers
    let mut sh = |buf: &mut Buf,
                  name: u32,
                  ty: u32,
                  flags: u64,
                  off: usize,
                  size: usize,
                  link: u32,
                  info: u32,
                  align: u64,
                  entsize: u64| {
        buf.u32(name);
        buf.u32(ty);
        buf.u64(flags);
        buf.u64(0); // sh_addr
        buf.u64(off as u64);
        buf.u64(size as u64);
        buf.u32(link);
        buf.u32(info);
        buf.u64(align);
        buf.u64(entsize);
    };
    sh(&mut body, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    sh(&mut body, text_name, 1, 0x6, text_off, layout.text.len(), 0, 0, 16, 0);
    sh(
        &mut body,
        rela_name,
        4, // SHT_RELA
        0,
        rela_off,
        layout.relocs.len() * 24,
        4, // link: .symtab
        1, // info: .text
        8,
        24,
    );
    sh(&mut body, data_name, 1, 0x3, data_off, layout.data.len(), 0, 0, 8, 0);
    sh(
        &mut body,
        symtab_name,
        2, // SHT_SYMTAB
        0,
        symtab_off,
        syms.len() * 24,
        5, // link: .strtab
        u32::try_from(first_global).unwrap_or(1),
        8,
        24,
    );
    sh(&mut body, strtab_name, 3, 0, strtab_off, strtab.len(), 0, 0, 1, 0);
    sh(
        &mut body,
        shstrtab_name,
        3,
        0,
        shstrtab_off,
        shstrtab.len(),
        0,
        0,
        1,
        0,
    );

    let mut file = out.0;
    file.extend_from_slice(&body.0);
    file[shoff_pos..shoff_pos + 8].copy_from_slice(&(shoff as u64).to_le_bytes());
    file
}

// ---- COFF ----

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_REL_AMD64_REL32: u16 = 4;

fn write_coff(layout: &Layout, debug: DebugFormat) -> Vec<u8> {
    let has_debug = debug == DebugFormat::CodeView;
    let section_count: u16 = if has_debug { 3 } else { 2 };
    let header_size = 20 + usize::from(section_count) * 40;

    let text_off = header_size;
    let reloc_off = text_off + layout.text.len();
    let reloc_size = layout.relocs.len() * 10;
    let data_off = reloc_off + reloc_size;
    let debug_bytes: &[u8] = &4u32.to_le_bytes(); // CV_SIGNATURE_C13
    let debug_off = data_off + layout.data.len();
    let symtab_off = debug_off + if has_debug { debug_bytes.len() } else { 0 };

    // symbol table: defs then undefs, strtab for long names
    let mut strtab: Vec<u8> = Vec::new();
    let mut names: Vec<(String, usize)> = Vec::new();
    let mut syms = Buf::new();
    let mut push_sym =
        |syms: &mut Buf, name: &str, value: u32, section: i16, is_func: bool, local: bool| {
            if name.len() <= 8 {
                let mut raw = [0u8; 8];
                raw[..name.len()].copy_from_slice(name.as_bytes());
                syms.bytes(&raw);
            } else {
                syms.u32(0);
                syms.u32(u32::try_from(strtab.len() + 4).unwrap_or(4));
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }
            syms.u32(value);
            syms.bytes(&section.to_le_bytes());
            syms.u16(if is_func { 0x20 } else { 0 });
            syms.u8(if local { 3 } else { 2 }); // static / external
            syms.u8(0);
        };

    for def in &layout.defs {
        names.push((def.name.clone(), names.len()));
        let section = if def.is_func { 1 } else { 2 };
        push_sym(
            &mut syms,
            &def.name,
            u32::try_from(def.value).unwrap_or(0),
            section,
            def.is_func,
            def.local,
        );
    }
    for undef in &layout.undefs {
        names.push((undef.clone(), names.len()));
        push_sym(&mut syms, undef, 0, 0, true, false);
    }
    let lookup = |name: &str| -> u32 {
        names
            .iter()
            .find(|(n, _)| n == name)
            .map_or(0, |(_, idx)| u32::try_from(*idx).unwrap_or(0))
    };

    let mut out = Buf::new();
    out.u16(IMAGE_FILE_MACHINE_AMD64);
    out.u16(section_count);
    out.u32(0); // timestamp
    out.u32(u32::try_from(symtab_off).unwrap_or(0));
    out.u32(u32::try_from(names.len()).unwrap_or(0));
    out.u16(0);
    out.u16(0);

    let mut section = |out: &mut Buf,
                       name: &[u8],
                       size: usize,
                       off: usize,
                       relocs: (usize, usize),
                       chars: u32| {
        let mut raw = [0u8; 8];
        raw[..name.len()].copy_from_slice(name);
        out.bytes(&raw);
        out.u32(0); // virtual size
        out.u32(0); // virtual address
        out.u32(u32::try_from(size).unwrap_or(0));
        out.u32(u32::try_from(off).unwrap_or(0));
        out.u32(u32::try_from(relocs.0).unwrap_or(0));
        out.u32(0); // line numbers
        out.u16(u16::try_from(relocs.1).unwrap_or(0));
        out.u16(0);
        out.u32(chars);
    };
    section(
        &mut out,
        b".text",
        layout.text.len(),
        text_off,
        (reloc_off, layout.relocs.len()),
        0x6050_0020, // code | execute | read | align16
    );
    section(
        &mut out,
        b".data",
        layout.data.len(),
        data_off,
        (0, 0),
        0xC050_0040, // initialized | read | write | align16
    );
    if has_debug {
        section(
            &mut out,
            b".debug$S",
            debug_bytes.len(),
            debug_off,
            (0, 0),
            0x4210_0040, // initialized | discardable | read
        );
    }

    out.bytes(&layout.text);
    for reloc in &layout.relocs {
        out.u32(u32::try_from(reloc.offset).unwrap_or(0));
        out.u32(lookup(&reloc.symbol));
        out.u16(IMAGE_REL_AMD64_REL32);
    }
    out.bytes(&layout.data);
    if has_debug {
        out.bytes(debug_bytes);
    }
    out.bytes(&syms.0);
    out.u32(u32::try_from(strtab.len() + 4).unwrap_or(4));
    out.bytes(&strtab);
    out.0
}

#[cfg(test)]
mod tests {
    use super::{DebugFormat, export_object};
    use crate::args::{Arch, TargetOs};
    use crate::ir::{Inst, IrFunction, Linkage, Module, SymKind};

    fn module_with_main(os: TargetOs) -> Module {
        let module = Module::new(Arch::X86_64, os, false);
        let main = module.intern("main", Linkage::Export, SymKind::Function, 0);
        assert!(main.claim_body(IrFunction {
            insts: vec![Inst::PushConst(0), Inst::Ret { has_value: true }],
            local_count: 0,
            returns_value: true,
        }));
        let global = module.intern("limit", Linkage::Export, SymKind::Global, 0);
        global.set_data(7i64.to_le_bytes().to_vec());
        module
    }

    #[test]
    fn elf_object_has_magic_and_code() {
        let module = module_with_main(TargetOs::Linux);
        let object = export_object(&module, DebugFormat::None);
        assert_eq!(&object[..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(object[16], 1); // ET_REL
        assert_eq!(u16::from_le_bytes([object[18], object[19]]), 62);
        // the encoded `ret` must appear somewhere in .text
        assert!(object.windows(1).any(|w| w == [0xC3]));
    }

    #[test]
    fn coff_object_has_machine_and_symbols() {
        let module = module_with_main(TargetOs::Windows);
        let object = export_object(&module, DebugFormat::CodeView);
        assert_eq!(u16::from_le_bytes([object[0], object[1]]), 0x8664);
        // three sections with CodeView debug info
        assert_eq!(u16::from_le_bytes([object[2], object[3]]), 3);
        let text = object.windows(5).any(|w| w == b".text");
        assert!(text);
    }

    #[test]
    fn objects_are_deterministic() {
        let module = module_with_main(TargetOs::Linux);
        let a = export_object(&module, DebugFormat::None);
        let b = export_object(&module, DebugFormat::None);
        assert_eq!(a, b);
    }
}
