//! Executable entry-point detection over the first scan block.
//!
//! Buffer and file scans want the entry point as a file offset; process
//! scans want a virtual address. Both probes are best-effort: anything that
//! does not parse as a PE or ELF image yields `None`, which conditions
//! observe as undefined.

use goblin::elf::header::ET_DYN;
use goblin::elf::program_header::PT_LOAD;
use goblin::Object;

/// Entry point as a file offset within `data`, for buffer/file scans.
pub(crate) fn entry_point_offset(data: &[u8]) -> Option<u64> {
    match Object::parse(data).ok()? {
        Object::PE(pe) => {
            let rva = pe.entry as u64;
            for section in &pe.sections {
                let va = u64::from(section.virtual_address);
                let span = u64::from(section.virtual_size.max(section.size_of_raw_data));
                if rva >= va && rva < va + span {
                    return Some(u64::from(section.pointer_to_raw_data) + (rva - va));
                }
            }
            None
        }
        Object::Elf(elf) => {
            let entry = elf.entry;
            for ph in &elf.program_headers {
                if ph.p_type == PT_LOAD && entry >= ph.p_vaddr && entry < ph.p_vaddr + ph.p_filesz
                {
                    return Some(ph.p_offset + (entry - ph.p_vaddr));
                }
            }
            None
        }
        _ => None,
    }
}

/// Entry point as a virtual address, for process scans where `base` is the
/// image's load address.
pub(crate) fn entry_point_address(data: &[u8], base: u64) -> Option<u64> {
    match Object::parse(data).ok()? {
        Object::PE(pe) => Some(base + pe.entry as u64),
        Object::Elf(elf) => {
            if elf.header.e_type == ET_DYN {
                Some(base + elf.entry)
            } else {
                Some(elf.entry)
            }
        }
        _ => None,
    }
}
