//! Minimal PE32+ executable image: DOS stub, COFF + optional headers, a
//! .text and a .data section.

use crate::args::Subsystem;
use crate::ir::obj::{Buf, Layout};

use super::{LinkError, find_target, resolve_rel32};

const IMAGE_BASE: u64 = 0x1_4000_0000;
const SECTION_ALIGN: usize = 0x1000;
const FILE_ALIGN: usize = 0x200;
const TEXT_RVA: usize = 0x1000;

pub(super) fn write_executable(
    layout: &Layout,
    entry: &str,
    subsystem: Option<Subsystem>,
) -> Result<Vec<u8>, LinkError> {
    let headers_size = FILE_ALIGN;
    let text_raw_size = layout.text.len().next_multiple_of(FILE_ALIGN).max(FILE_ALIGN);
    let data_rva = (TEXT_RVA + layout.text.len()).next_multiple_of(SECTION_ALIGN);
    let data_raw_off = headers_size + text_raw_size;
    let data_raw_size = layout.data.len().next_multiple_of(FILE_ALIGN).max(FILE_ALIGN);
    let image_size = (data_rva + layout.data.len().max(1)).next_multiple_of(SECTION_ALIGN);

    let rva_of = |is_func: bool, value: usize| -> u64 {
        let base = if is_func { TEXT_RVA } else { data_rva };
        (base + value) as u64
    };

    let mut text = layout.text.clone();
    for reloc in &layout.relocs {
        let (is_func, value) = find_target(layout, &reloc.symbol)?;
        let site_rva = (TEXT_RVA + reloc.offset) as u64;
        let rel = resolve_rel32(site_rva + 4, rva_of(is_func, value));
        text[reloc.offset..reloc.offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    let entry_def = layout
        .defs
        .iter()
        .find(|def| def.is_func && def.name == entry)
        .ok_or_else(|| LinkError::MissingEntrypoint(entry.to_string()))?;
    let entry_rva = (TEXT_RVA + entry_def.value) as u32;

    let mut out = Buf::new();
    // DOS header: just enough to carry e_lfanew.
    out.bytes(b"MZ");
    out.bytes(&[0; 58]);
    out.u32(0x40); // e_lfanew
    out.bytes(b"PE\0\0");

    // COFF file header
    out.u16(0x8664);
    out.u16(2); // sections
    out.u32(0);
    out.u32(0); // no symbol table
    out.u32(0);
    out.u16(240); // optional header size (PE32+)
    out.u16(0x0022); // executable | large address aware

    // Optional header (PE32+)
    out.u16(0x20B);
    out.u8(14); // linker versions, cosmetic
    out.u8(0);
    out.u32(u32::try_from(text_raw_size).unwrap_or(0));
    out.u32(u32::try_from(data_raw_size).unwrap_or(0));
    out.u32(0); // uninitialized data
    out.u32(entry_rva);
    out.u32(u32::try_from(TEXT_RVA).unwrap_or(0));
    out.u64(IMAGE_BASE);
    out.u32(u32::try_from(SECTION_ALIGN).unwrap_or(0));
    out.u32(u32::try_from(FILE_ALIGN).unwrap_or(0));
    out.u16(6); // OS version
    out.u16(0);
    out.u16(0);
    out.u16(0);
    out.u16(6); // subsystem version
    out.u16(0);
    out.u32(0); // win32 version
    out.u32(u32::try_from(image_size).unwrap_or(0));
    out.u32(u32::try_from(headers_size).unwrap_or(0));
    out.u32(0); // checksum
    out.u16(match subsystem {
        Some(Subsystem::Windows) => 2,
        _ => 3, // console default
    });
    out.u16(0x8160); // dll characteristics: NX, dynamic base, TS aware
    out.u64(0x10_0000); // stack reserve
    out.u64(0x1000); // stack commit
    out.u64(0x10_0000); // heap reserve
    out.u64(0x1000); // heap commit
    out.u32(0); // loader flags
    out.u32(16); // data directory count
    for _ in 0..16 {
        out.u64(0);
    }

    // Section table
    let mut section = |out: &mut Buf,
                       name: &[u8],
                       vsize: usize,
                       rva: usize,
                       raw_size: usize,
                       raw_off: usize,
                       chars: u32| {
        let mut raw = [0u8; 8];
        raw[..name.len()].copy_from_slice(name);
        out.bytes(&raw);
        out.u32(u32::try_from(vsize.max(1)).unwrap_or(1));
        out.u32(u32::try_from(rva).unwrap_or(0));
        out.u32(u32::try_from(raw_size).unwrap_or(0));
        out.u32(u32::try_from(raw_off).unwrap_or(0));
        out.u32(0);
        out.u32(0);
        out.u16(0);
        out.u16(0);
        out.u32(chars);
    };
    section(
        &mut out,
        b".text",
        layout.text.len(),
        TEXT_RVA,
        text_raw_size,
        headers_size,
        0x6000_0020, // code | execute | read
    );
    section(
        &mut out,
        b".data",
        layout.data.len(),
        data_rva,
        data_raw_size,
        data_raw_off,
        0xC000_0040, // initialized | read | write
    );

    out.pad_to(FILE_ALIGN);
    out.bytes(&text);
    out.pad_to(FILE_ALIGN);
    out.bytes(&layout.data);
    out.pad_to(FILE_ALIGN);
    Ok(out.0)
}
