//! Minimal static ELF64 executable image: one RWX load segment covering the
//! whole file, text and data laid out back to back.

use crate::ir::obj::{Buf, Layout};

use super::{LinkError, find_target, resolve_rel32};

const BASE_VADDR: u64 = 0x40_0000;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

pub(super) fn write_executable(layout: &Layout, entry: &str) -> Result<Vec<u8>, LinkError> {
    let text_off = (EHDR_SIZE + PHDR_SIZE).next_multiple_of(16);
    let data_off = (text_off + layout.text.len()).next_multiple_of(8);

    let section_vaddr = |is_func: bool, value: usize| -> u64 {
        let off = if is_func { text_off } else { data_off };
        BASE_VADDR + (off + value) as u64
    };

    let mut text = layout.text.clone();
    for reloc in &layout.relocs {
        let (is_func, value) = find_target(layout, &reloc.symbol)?;
        // Calls and rip-relative accesses both patch a rel32 at the site.
        let site_vaddr = BASE_VADDR + (text_off + reloc.offset) as u64;
        let rel = resolve_rel32(site_vaddr + 4, section_vaddr(is_func, value));
        text[reloc.offset..reloc.offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    let entry_def = layout
        .defs
        .iter()
        .find(|def| def.is_func && def.name == entry)
        .ok_or_else(|| LinkError::MissingEntrypoint(entry.to_string()))?;
    let e_entry = BASE_VADDR + (text_off + entry_def.value) as u64;

    let total = data_off + layout.data.len();

    let mut out = Buf::new();
    out.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.bytes(&[0; 8]);
    out.u16(2); // ET_EXEC
    out.u16(62); // EM_X86_64
    out.u32(1);
    out.u64(e_entry);
    out.u64(EHDR_SIZE as u64); // e_phoff
    out.u64(0); // e_shoff: no section headers in the image
    out.u32(0);
    out.u16(64);
    out.u16(PHDR_SIZE as u16);
    out.u16(1); // one load segment
    out.u16(0);
    out.u16(0);
    out.u16(0);

    // PT_LOAD, RWX, whole file at BASE_VADDR
    out.u32(1);
    out.u32(0x7);
    out.u64(0);
    out.u64(BASE_VADDR);
    out.u64(BASE_VADDR);
    out.u64(total as u64);
    out.u64(total as u64);
    out.u64(0x1000);

    out.pad_to(16);
    debug_assert_eq!(out.len(), text_off);
    out.bytes(&text);
    out.pad_to(8);
    out.bytes(&layout.data);
    Ok(out.0)
}
