//! Vtable and virtual-function recovery.
//!
//! Two stages: a byte-pattern scan for constructor-shaped code that loads a
//! vtable address, then a relocation-guided walk over the candidate vtable
//! headers. The walk advances 8 bytes at a time while the address is a
//! known relocated slot and stops at the first address outside that set.

use crate::cfg::Program;
use crate::loader::{Object, VtableRel};
use crate::util::cast_int;
use crate::{arch, Imm};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;

/// Instructions inspected after a prologue push for the constructor shape.
const CONSTRUCTOR_WINDOW: usize = 20;

/// Candidate constructors: map from the function-prologue offset to the
/// vtable address its RIP-relative `lea` computes.
///
/// The shape is a frame push, then within a 20-instruction window a
/// this-pointer move (`mov [rbp-8], rdi` or `mov rcx, rdi/rsi`) and a
/// `lea rcx, [rip+disp]`.
pub fn find_constructors(program: &Program) -> FxHashMap<Imm, Imm> {
    let insns: Vec<_> = program.insns().collect();
    let mut constructors = FxHashMap::default();

    for (i, head) in insns.iter().enumerate() {
        if arch::prolog(head.raw()) != 2 {
            continue;
        }
        let mut has_this_ptr = false;
        let mut vtable_addr = None;

        for (k, insn) in insns.iter().enumerate().skip(i).take(CONSTRUCTOR_WINDOW) {
            if k != i && arch::prolog(insn.raw()) == 2 {
                break;
            }
            let bytes = insn.raw();
            if !has_this_ptr {
                // mov [rbp-0x8], rdi
                if bytes.len() >= 4 && bytes[..4] == [0x48, 0x89, 0x7d, 0xf8] {
                    has_this_ptr = true;
                }
                // mov rcx, rsi / mov rcx, rdi
                else if bytes.len() >= 3
                    && (bytes[..3] == [0x48, 0x89, 0xf1] || bytes[..3] == [0x48, 0x89, 0xf9])
                {
                    has_this_ptr = true;
                }
            }
            // lea rcx, [rip+disp32]
            if bytes.len() >= 7 && bytes[0] == 0x48 && bytes[1] == 0x8d && bytes[2] == 0x0d {
                let disp = i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
                let rip = insn.offset() + bytes.len() as Imm;
                vtable_addr = Some(rip + Imm::from(disp));
            }
        }

        if has_this_ptr {
            if let Some(addr) = vtable_addr {
                constructors.insert(head.offset(), addr);
            }
        }
    }

    constructors
}

/// Walk each candidate vtable header and read back the function address
/// stored in every slot. Returns the valid headers and the slot-to-target
/// map.
pub fn scan_vfunc(
    candidates: &FxHashSet<Imm>,
    rel: &VtableRel,
    object: &Object,
) -> (FxHashSet<Imm>, BTreeMap<Imm, Imm>) {
    let mut headers = FxHashSet::default();
    let mut slots = FxHashSet::default();

    for &header in candidates {
        let mut addr = header;
        let mut valid = false;
        while rel.slots.contains(&addr) {
            valid = true;
            slots.insert(addr);
            addr += 8;
        }
        if valid {
            headers.insert(header);
        }
    }

    let mut vfuncs = BTreeMap::new();
    for &slot in &slots {
        vfuncs.insert(slot, cast_int(object.read(slot, 8), 8));
    }
    (headers, vfuncs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CfgPolicy, Insn};
    use crate::rtl::Statement;
    use rustc_hash::FxHashMap as Map;

    fn raw_insn(offset: Imm, raw: Vec<u8>) -> Insn {
        Insn::new(offset, Statement::Nop, raw)
    }

    fn program_of(insns: Vec<Insn>) -> Program {
        Program::new(
            Object::anonymous(),
            insns,
            &[],
            &Map::default(),
            CfgPolicy::default(),
        )
    }

    fn constructor_body(at: Imm, disp: i32) -> Vec<Insn> {
        let mut lea = vec![0x48, 0x8d, 0x0d];
        lea.extend_from_slice(&disp.to_le_bytes());
        vec![
            raw_insn(at, vec![0x55]),                         // push rbp
            raw_insn(at + 1, vec![0x48, 0x89, 0xe5]),         // mov rbp,rsp
            raw_insn(at + 4, vec![0x48, 0x89, 0x7d, 0xf8]),   // mov [rbp-8],rdi
            raw_insn(at + 8, lea),                            // lea rcx,[rip+disp]
            raw_insn(at + 15, vec![0xc3]),                    // ret
        ]
    }

    #[test]
    fn constructor_shape_is_recognised() {
        let program = program_of(constructor_body(0x1000, 0x2000));
        let constructors = find_constructors(&program);
        // rip after the lea = 0x1008 + 7
        assert_eq!(constructors.get(&0x1000), Some(&(0x100f + 0x2000)));
    }

    #[test]
    fn prologue_without_this_pair_is_not_a_constructor() {
        let program = program_of(vec![
            raw_insn(0x1000, vec![0x55]),
            raw_insn(0x1001, vec![0x48, 0x89, 0xe5]),
            raw_insn(0x1004, vec![0xc3]),
        ]);
        assert!(find_constructors(&program).is_empty());
    }

    #[test]
    fn vtable_walk_stops_outside_relocation_set() {
        // Three consecutive slots, a hole, then another relocated slot that
        // must not be reached.
        let mut raw = vec![0u8; 0x30];
        raw[0..8].copy_from_slice(&0x1100u64.to_le_bytes());
        raw[8..16].copy_from_slice(&0x1180u64.to_le_bytes());
        raw[16..24].copy_from_slice(&0x1200u64.to_le_bytes());
        raw[32..40].copy_from_slice(&0x1280u64.to_le_bytes());
        let object = Object::flat(0x3000, raw, vec![]);
        let rel = VtableRel {
            stripped: true,
            slots: [0x3000, 0x3008, 0x3010, 0x3020].into_iter().collect(),
        };
        let candidates: FxHashSet<Imm> = [0x3000].into_iter().collect();
        let (headers, vfuncs) = scan_vfunc(&candidates, &rel, &object);
        assert!(headers.contains(&0x3000));
        assert_eq!(vfuncs.get(&0x3000), Some(&0x1100));
        assert_eq!(vfuncs.get(&0x3008), Some(&0x1180));
        assert_eq!(vfuncs.get(&0x3010), Some(&0x1200));
        assert!(!vfuncs.contains_key(&0x3020));
    }

    #[test]
    fn candidate_without_slots_is_dropped() {
        let object = Object::flat(0x3000, vec![0u8; 8], vec![]);
        let rel = VtableRel {
            stripped: true,
            slots: FxHashSet::default(),
        };
        let candidates: FxHashSet<Imm> = [0x3000].into_iter().collect();
        let (headers, vfuncs) = scan_vfunc(&candidates, &rel, &object);
        assert!(headers.is_empty());
        assert!(vfuncs.is_empty());
    }
}
