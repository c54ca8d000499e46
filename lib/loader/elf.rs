//! ELF view of the analysed binary.
//!
//! `Object` carries everything the analysis reads back out of the binary:
//! raw bytes with the vaddr-to-offset translation, code ranges, and the
//! relocations and symbols driving function discovery, no-return call
//! repair, and vtable recovery.

use crate::{Error, Imm};
use goblin::elf::Elf;
use rustc_hash::FxHashSet;
use std::fs;
use std::path::Path;

/// Sentinel for reads beyond the binary, never a valid code pointer.
const OUT_OF_BOUNDS: u64 = 0x8000_0000_8000_0000;

/// How a missing symbol table is interpreted during vtable recovery.
///
/// `Detect` treats a binary without `.symtab` as stripped and accepts any
/// relocated slot during the vtable walk. `Legacy` reproduces the reference
/// implementation, where the stripped flag never became true and slots were
/// only accepted when their content is a known function symbol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StrippedPolicy {
    #[default]
    Detect,
    Legacy,
}

/// One PT_LOAD mapping.
#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    pub vaddr: Imm,
    pub foffset: Imm,
    pub fsize: Imm,
    pub msize: Imm,
}

/// Valid vtable slots derived from `.rela.dyn`.
#[derive(Clone, Debug)]
pub struct VtableRel {
    pub stripped: bool,
    pub slots: FxHashSet<Imm>,
}

#[derive(Clone, Debug, Default)]
pub struct Object {
    raw: Vec<u8>,
    phdrs: Vec<Phdr>,
    /// Executable section ranges, inclusive.
    code_segments: Vec<(Imm, Imm)>,
    /// Defined FUNC entries of the dynamic symbol table.
    dyn_func_addrs: Vec<Imm>,
    /// RELATIVE / IRELATIVE relocation targets.
    reloc_fptr_targets: Vec<Imm>,
    /// `r_offset` of every R_X86_64_RELATIVE entry in `.rela.dyn`.
    relative_reloc_offsets: FxHashSet<Imm>,
    /// `[start, end)` of `.data.rel.ro`.
    data_rel_ro: Option<(Imm, Imm)>,
    /// Addresses of FUNC symbols from `.symtab` and `.dynsym`.
    func_symbols: FxHashSet<Imm>,
    /// GOT slot address and symbol name of each R_X86_64_JUMP_SLOT entry.
    jump_slots: Vec<(Imm, String)>,
    has_symtab: bool,
}

impl Object {
    /// An empty view, for programs assembled without a binary.
    pub fn anonymous() -> Object {
        Object::default()
    }

    /// A view over raw bytes mapped flat at `base`.
    pub fn flat(base: Imm, raw: Vec<u8>, code_segments: Vec<(Imm, Imm)>) -> Object {
        let fsize = raw.len() as Imm;
        Object {
            phdrs: vec![Phdr {
                vaddr: base,
                foffset: 0,
                fsize,
                msize: fsize,
            }],
            raw,
            code_segments,
            ..Object::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Object, Error> {
        let raw = fs::read(path)?;
        let elf = Elf::parse(&raw)?;

        let mut phdrs: Vec<Phdr> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
            .map(|ph| Phdr {
                vaddr: ph.p_vaddr as Imm,
                foffset: ph.p_offset as Imm,
                fsize: ph.p_filesz as Imm,
                msize: ph.p_memsz as Imm,
            })
            .collect();
        phdrs.sort_by_key(|p| p.vaddr);

        let mut code_segments = Vec::new();
        let mut data_rel_ro = None;
        let mut has_symtab = false;
        for sh in &elf.section_headers {
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            if sh.sh_flags & u64::from(goblin::elf::section_header::SHF_EXECINSTR) != 0
                && sh.sh_size > 0
            {
                code_segments.push((sh.sh_addr as Imm, (sh.sh_addr + sh.sh_size - 1) as Imm));
            }
            if name == ".data.rel.ro" {
                data_rel_ro = Some((sh.sh_addr as Imm, (sh.sh_addr + sh.sh_size) as Imm));
            }
            if sh.sh_type == goblin::elf::section_header::SHT_SYMTAB {
                has_symtab = true;
            }
        }

        let mut dyn_func_addrs = Vec::new();
        let mut func_symbols = FxHashSet::default();
        for sym in elf.dynsyms.iter() {
            if sym.is_function() && sym.st_value != 0 && sym.st_shndx != 0 {
                dyn_func_addrs.push(sym.st_value as Imm);
                func_symbols.insert(sym.st_value as Imm);
            }
        }
        for sym in elf.syms.iter() {
            if sym.is_function() && sym.st_value != 0 {
                func_symbols.insert(sym.st_value as Imm);
            }
        }

        let mut reloc_fptr_targets = Vec::new();
        let mut relative_reloc_offsets = FxHashSet::default();
        for reloc in elf.dynrelas.iter() {
            match reloc.r_type {
                goblin::elf::reloc::R_X86_64_RELATIVE => {
                    relative_reloc_offsets.insert(reloc.r_offset as Imm);
                    if let Some(addend) = reloc.r_addend {
                        reloc_fptr_targets.push(addend as Imm);
                    }
                }
                goblin::elf::reloc::R_X86_64_IRELATIVE => {
                    if let Some(addend) = reloc.r_addend {
                        reloc_fptr_targets.push(addend as Imm);
                    }
                }
                _ => {}
            }
        }

        let mut jump_slots = Vec::new();
        for reloc in elf.pltrelocs.iter() {
            if reloc.r_type == goblin::elf::reloc::R_X86_64_JUMP_SLOT {
                if let Some(sym) = elf.dynsyms.get(reloc.r_sym) {
                    if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                        jump_slots.push((reloc.r_offset as Imm, name.to_string()));
                    }
                }
            }
        }

        Ok(Object {
            raw,
            phdrs,
            code_segments,
            dyn_func_addrs,
            reloc_fptr_targets,
            relative_reloc_offsets,
            data_rel_ro,
            func_symbols,
            jump_slots,
            has_symtab,
        })
    }

    /// Little-endian read of `width` bytes at a virtual address.
    /// Uninitialised (bss) ranges read as zero; addresses beyond the binary
    /// read as an out-of-bounds sentinel.
    pub fn read(&self, offset: Imm, width: u8) -> u64 {
        let mut seg: Option<&Phdr> = None;
        for p in &self.phdrs {
            if p.vaddr <= offset {
                seg = Some(p);
            }
        }
        let (vaddr, foffset, fsize, msize) = match seg {
            Some(p) => (p.vaddr, p.foffset, p.fsize, p.msize),
            None => (0, 0, 0, 0),
        };
        let dist = offset - vaddr;
        if fsize < dist && dist < msize {
            return 0;
        }
        let adj = foffset + dist;
        if adj < 0 || adj as usize >= self.raw.len() {
            return OUT_OF_BOUNDS;
        }
        let mut val = 0u64;
        for i in 0..width as usize {
            let byte = self.raw.get(adj as usize + i).copied().unwrap_or(0);
            val += u64::from(byte) << (i * 8);
        }
        val
    }

    /// Whether a value points into an executable range.
    pub fn in_code(&self, ptr: Imm) -> bool {
        self.code_segments
            .iter()
            .any(|(lo, hi)| *lo <= ptr && ptr <= *hi)
    }

    pub fn code_segments(&self) -> &[(Imm, Imm)] {
        &self.code_segments
    }

    /// `[vaddr, vaddr + fsize)` of every load mapping.
    pub fn load_ranges(&self) -> Vec<(Imm, Imm)> {
        self.phdrs
            .iter()
            .map(|p| (p.vaddr, p.vaddr + p.fsize))
            .collect()
    }

    pub fn dyn_func_addrs(&self) -> &[Imm] {
        &self.dyn_func_addrs
    }

    pub fn reloc_fptr_targets(&self) -> &[Imm] {
        &self.reloc_fptr_targets
    }

    pub fn jump_slots(&self) -> &[(Imm, String)] {
        &self.jump_slots
    }

    pub fn data_rel_ro(&self) -> Option<(Imm, Imm)> {
        self.data_rel_ro
    }

    pub fn stripped(&self, policy: StrippedPolicy) -> bool {
        match policy {
            StrippedPolicy::Detect => !self.has_symtab,
            StrippedPolicy::Legacy => false,
        }
    }

    /// The vtable slot universe: RELATIVE relocation offsets inside
    /// `.data.rel.ro`, filtered by function-symbol content unless the
    /// binary is treated as stripped.
    pub fn vtable_slots(&self, policy: StrippedPolicy) -> VtableRel {
        let stripped = self.stripped(policy);
        let mut slots = FxHashSet::default();
        if let Some((lo, hi)) = self.data_rel_ro {
            for &offset in &self.relative_reloc_offsets {
                if offset < lo || offset >= hi {
                    continue;
                }
                if stripped {
                    slots.insert(offset);
                } else {
                    let content = self.read(offset, 8) as Imm;
                    if self.func_symbols.contains(&content) {
                        slots.insert(offset);
                    }
                }
            }
        }
        VtableRel { stripped, slots }
    }

    /// Test scaffolding: register a GOT slot binding.
    #[cfg(test)]
    pub(crate) fn push_jump_slot(&mut self, slot: Imm, name: String) {
        self.jump_slots.push((slot, name));
    }

    /// Test scaffolding: an object with hand-built relocation state.
    #[cfg(test)]
    pub(crate) fn synthetic(
        raw_at: (Imm, Vec<u8>),
        relative_reloc_offsets: &[Imm],
        data_rel_ro: Option<(Imm, Imm)>,
        func_symbols: &[Imm],
        has_symtab: bool,
    ) -> Object {
        let mut object = Object::flat(raw_at.0, raw_at.1, Vec::new());
        object.relative_reloc_offsets = relative_reloc_offsets.iter().copied().collect();
        object.data_rel_ro = data_rel_ro;
        object.func_symbols = func_symbols.iter().copied().collect();
        object.has_symtab = has_symtab;
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_reads_little_endian() {
        let object = Object::flat(0x1000, vec![0x11, 0x22, 0x33, 0x44], vec![]);
        assert_eq!(object.read(0x1000, 2), 0x2211);
        assert_eq!(object.read(0x1002, 1), 0x33);
        assert_eq!(object.read(0x2000, 8), OUT_OF_BOUNDS);
    }

    #[test]
    fn relocs_outside_data_rel_ro_are_not_slots() {
        // Slot content 0x1100 is a known function; one reloc lies outside
        // the section and must be ignored.
        let mut raw = vec![0u8; 0x20];
        raw[0..8].copy_from_slice(&0x1100u64.to_le_bytes());
        raw[8..16].copy_from_slice(&0x1100u64.to_le_bytes());
        let object = Object::synthetic(
            (0x3000, raw),
            &[0x3000, 0x3008, 0x4000],
            Some((0x3000, 0x3010)),
            &[0x1100],
            true,
        );
        let rel = object.vtable_slots(StrippedPolicy::Detect);
        assert!(!rel.stripped);
        assert!(rel.slots.contains(&0x3000));
        assert!(rel.slots.contains(&0x3008));
        assert!(!rel.slots.contains(&0x4000));
    }

    #[test]
    fn stripped_policy_controls_slot_filter() {
        // Content is not a known symbol: only the stripped walk accepts it.
        let mut raw = vec![0u8; 0x10];
        raw[0..8].copy_from_slice(&0x2222u64.to_le_bytes());
        let object = Object::synthetic(
            (0x3000, raw),
            &[0x3000],
            Some((0x3000, 0x3010)),
            &[],
            false,
        );
        assert!(object
            .vtable_slots(StrippedPolicy::Detect)
            .slots
            .contains(&0x3000));
        assert!(object.vtable_slots(StrippedPolicy::Legacy).slots.is_empty());
    }

    #[test]
    fn bss_reads_zero() {
        let mut object = Object::flat(0x1000, vec![0xff; 8], vec![]);
        object.phdrs[0].msize = 0x100;
        assert_eq!(object.read(0x1010, 8), 0);
    }
}
