//! Register and memory valuation.
//!
//! A `State` maps `UnitId` to `AbsVal` for registers and bounded byte
//! ranges of the tracked memory regions. Writes are buffered and promoted
//! by `commit_insn`: inside a `Sequence` the executor commits between
//! statements, inside a `Parallel` all statements observe the pre-state.

use crate::analysis::domain::{AbsVal, BaseLH, BaseStride, Lattice, Taint};
use crate::arch::{Reg, CALL_ARGS};
use crate::Imm;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Stack byte offsets beyond this are not tracked.
pub const STACK_BOUND: Imm = 0x2000;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Region {
    Register,
    Stack,
    Static,
    Heap,
    Input,
}

/// One trackable storage unit: a register, or a byte offset within a
/// memory region.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UnitId {
    pub region: Region,
    pub index: Imm,
}

impl UnitId {
    pub fn reg(reg: Reg) -> UnitId {
        UnitId {
            region: Region::Register,
            index: reg as Imm,
        }
    }

    pub fn stack(offset: Imm) -> UnitId {
        UnitId {
            region: Region::Stack,
            index: offset,
        }
    }

    pub fn static_(addr: Imm) -> UnitId {
        UnitId {
            region: Region::Static,
            index: addr,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.region {
            Region::Register => write!(f, "reg:{}", self.index),
            Region::Stack => write!(f, "stack:{}", self.index),
            Region::Static => write!(f, "static:{:#x}", self.index),
            Region::Heap => write!(f, "heap:{}", self.index),
            Region::Input => write!(f, "input:{}", self.index),
        }
    }
}

/// Whether an id's initial value is representable symbolically.
pub fn bounded(id: &UnitId) -> bool {
    match id.region {
        Region::Register => id.index > 0,
        Region::Stack => id.index.abs() <= STACK_BOUND,
        Region::Static | Region::Heap | Region::Input => false,
    }
}

const SYM_REGION_STEP: Imm = 1 << 32;

/// The symbol standing for an id's initial value in `BaseLH`.
pub fn sym(id: &UnitId) -> Imm {
    let region = match id.region {
        Region::Register => 0,
        Region::Stack => 1,
        Region::Static => 2,
        Region::Heap => 3,
        Region::Input => 4,
    };
    region * SYM_REGION_STEP + id.index
}

/// Inverse of `sym`.
pub fn sym_to_id(sym: Imm) -> Option<UnitId> {
    let region = (sym + SYM_REGION_STEP / 2) / SYM_REGION_STEP;
    let index = sym - region * SYM_REGION_STEP;
    let region = match region {
        0 => Region::Register,
        1 => Region::Stack,
        2 => Region::Static,
        3 => Region::Heap,
        4 => Region::Input,
        _ => return None,
    };
    Some(UnitId { region, index })
}

/// The symbol of the stack pointer's initial value; `BaseLH` bases equal to
/// this describe the local frame.
pub fn stack_sym() -> Imm {
    sym(&UnitId::reg(crate::arch::STACK_PTR))
}

/// Classification of a memory-write address from its `BaseLH`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemAddr {
    /// Could be anywhere.
    Top,
    /// Definitely not in the local frame.
    NotLocal,
    /// A bounded cell range within one region.
    Cell(Region, Imm, Imm),
}

/// Decide which region a computed address writes.
pub fn classify(lh: &BaseLH) -> MemAddr {
    match lh {
        BaseLH::Top | BaseLH::Bottom => MemAddr::Top,
        BaseLH::Sym { base, lo, hi } => {
            if *base == stack_sym() {
                MemAddr::Cell(Region::Stack, *lo, *hi)
            } else if *base == 0 {
                MemAddr::Cell(Region::Static, *lo, *hi)
            } else {
                MemAddr::NotLocal
            }
        }
    }
}

/// Analysis configuration for one function evaluation.
#[derive(Clone)]
pub struct StateConfig {
    pub track_memory: bool,
    pub widen: bool,
    pub taint: bool,
    /// Loop SCCs execute this many times; zero presets written registers to
    /// top and executes once.
    pub iteration_limit: usize,
    /// Seeds the initial value of an id on first read.
    pub init: fn(&UnitId) -> AbsVal,
}

/// The reference seeding: call-argument registers are `Dynamic` and
/// untainted, bounded ids get their symbolic initial `BaseLH`, everything
/// else is unknown.
pub fn default_init(id: &UnitId) -> AbsVal {
    let lh = if bounded(id) {
        BaseLH::symbol(sym(id))
    } else {
        BaseLH::top()
    };
    let is_call_arg = id.region == Region::Register
        && CALL_ARGS.iter().any(|r| *r as Imm == id.index);
    let stride = if is_call_arg {
        BaseStride::Dynamic
    } else {
        BaseStride::top()
    };
    let taint = if is_call_arg {
        Taint(0)
    } else {
        Taint::top()
    };
    AbsVal { lh, stride, taint }
}

impl Default for StateConfig {
    fn default() -> StateConfig {
        StateConfig {
            track_memory: true,
            widen: true,
            taint: false,
            iteration_limit: 1,
            init: default_init,
        }
    }
}

enum Write {
    Strong {
        id: UnitId,
        size: u8,
        val: AbsVal,
    },
    Weak {
        lo: UnitId,
        hi: UnitId,
        size: u8,
        val: AbsVal,
    },
    RegionTop(Region),
}

/// The valuation itself.
pub struct State {
    pub config: StateConfig,
    values: FxHashMap<UnitId, AbsVal>,
    pending: Vec<Write>,
    region_top: FxHashSet<Region>,
}

impl State {
    pub fn new(config: StateConfig) -> State {
        State {
            config,
            values: FxHashMap::default(),
            pending: Vec::new(),
            region_top: FxHashSet::default(),
        }
    }

    /// The committed value of an id. Unknown unbounded ids read as top;
    /// bounded ids read as their seeded initial value.
    pub fn read(&self, id: &UnitId) -> AbsVal {
        if let Some(val) = self.values.get(id) {
            return val.clone();
        }
        if self.region_top.contains(&id.region) {
            return AbsVal::top();
        }
        if bounded(id) {
            (self.config.init)(id)
        } else {
            AbsVal::top()
        }
    }

    /// Strong update of a single id.
    pub fn update(&mut self, id: UnitId, val: AbsVal) {
        self.pending.push(Write::Strong { id, size: 8, val });
    }

    /// Ranged update: strong when the address is a single base+offset, weak
    /// otherwise.
    pub fn update_range(&mut self, lo: UnitId, hi: UnitId, size: u8, val: AbsVal) {
        if !self.config.track_memory && lo.region != Region::Register {
            return;
        }
        if lo == hi {
            self.pending.push(Write::Strong { id: lo, size, val });
        } else {
            self.pending.push(Write::Weak { lo, hi, size, val });
        }
    }

    pub fn clobber(&mut self, id: UnitId) {
        self.pending.push(Write::Strong {
            id,
            size: 8,
            val: AbsVal::top(),
        });
    }

    pub fn clobber_region(&mut self, region: Region) {
        self.pending.push(Write::RegionTop(region));
    }

    /// Force the masked registers to top, immediately. Used to preset loop
    /// SCCs before their single pass.
    pub fn preset(&mut self, mask: u64) {
        for bit in 0..64 {
            if mask & (1 << bit) != 0 {
                self.values.insert(
                    UnitId {
                        region: Region::Register,
                        index: bit as Imm,
                    },
                    AbsVal::top(),
                );
            }
        }
    }

    /// Promote the pending instruction's writes atomically.
    pub fn commit_insn(&mut self) {
        let widen = self.config.widen;
        for write in std::mem::take(&mut self.pending) {
            match write {
                Write::Strong { id, size, val } => {
                    if id.region != Region::Register {
                        let gone: Vec<UnitId> = self
                            .values
                            .keys()
                            .filter(|k| {
                                k.region == id.region
                                    && k.index > id.index
                                    && k.index < id.index + size as Imm
                            })
                            .copied()
                            .collect();
                        for k in gone {
                            self.values.remove(&k);
                        }
                        if !bounded(&id) && id.region == Region::Stack {
                            continue;
                        }
                    }
                    self.values.insert(id, val);
                }
                Write::Weak { lo, hi, size, val } => {
                    let touched: Vec<UnitId> = self
                        .values
                        .keys()
                        .filter(|k| {
                            k.region == lo.region
                                && k.index >= lo.index
                                && k.index < hi.index + size as Imm
                        })
                        .copied()
                        .collect();
                    for k in touched {
                        if let Some(existing) = self.values.get_mut(&k) {
                            if widen {
                                existing.widen(&val);
                            } else {
                                existing.join(&val);
                            }
                        }
                    }
                    if bounded(&lo) || lo.region != Region::Stack {
                        let mut merged = self.read(&lo);
                        if widen {
                            merged.widen(&val);
                        } else {
                            merged.join(&val);
                        }
                        self.values.insert(lo, merged);
                    }
                }
                Write::RegionTop(region) => {
                    for (_, val) in self
                        .values
                        .iter_mut()
                        .filter(|(k, _)| k.region == region)
                    {
                        *val = AbsVal::top();
                    }
                    self.region_top.insert(region);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sym_round_trips() {
        for id in [
            UnitId::reg(Reg::Ax),
            UnitId::reg(Reg::R15),
            UnitId::stack(-24),
            UnitId::stack(8),
            UnitId::static_(0x404040),
        ] {
            assert_eq!(sym_to_id(sym(&id)), Some(id));
        }
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let mut state = State::new(StateConfig::default());
        let ax = UnitId::reg(Reg::Ax);
        state.update(ax, AbsVal::constant(5));
        // Before commit the id still reads as its seeded value.
        assert_eq!(state.read(&ax), default_init(&ax));
        state.commit_insn();
        assert_eq!(state.read(&ax), AbsVal::constant(5));
    }

    #[test]
    fn weak_update_joins() {
        let mut state = State::new(StateConfig {
            widen: false,
            ..StateConfig::default()
        });
        state.update(UnitId::stack(0), AbsVal::constant(1));
        state.commit_insn();
        state.update_range(UnitId::stack(0), UnitId::stack(16), 8, AbsVal::constant(2));
        state.commit_insn();
        let got = state.read(&UnitId::stack(0));
        assert_eq!(
            got.lh,
            BaseLH::Sym {
                base: 0,
                lo: 1,
                hi: 2
            }
        );
    }

    #[test]
    fn strong_update_replaces_overlaps() {
        let mut state = State::new(StateConfig::default());
        state.update_range(UnitId::stack(4), UnitId::stack(4), 4, AbsVal::constant(7));
        state.commit_insn();
        state.update_range(UnitId::stack(0), UnitId::stack(0), 8, AbsVal::constant(9));
        state.commit_insn();
        assert_eq!(state.read(&UnitId::stack(0)), AbsVal::constant(9));
        // The overlapped narrower cell is gone; its offset reads fresh.
        assert_eq!(state.read(&UnitId::stack(4)), default_init(&UnitId::stack(4)));
    }

    #[test]
    fn clobber_region_tops_existing_and_future_reads() {
        let mut state = State::new(StateConfig::default());
        state.update(UnitId::stack(0), AbsVal::constant(1));
        state.commit_insn();
        state.clobber_region(Region::Stack);
        state.commit_insn();
        assert!(state.read(&UnitId::stack(0)).is_top());
        assert!(state.read(&UnitId::stack(64)).is_top());
    }

    #[test]
    fn preset_forces_top() {
        let mut state = State::new(StateConfig::default());
        state.update(UnitId::reg(Reg::Cx), AbsVal::constant(3));
        state.commit_insn();
        state.preset(1 << Reg::Cx as u32);
        assert!(state.read(&UnitId::reg(Reg::Cx)).is_top());
    }

    #[test]
    fn default_init_seeds_call_args_dynamic() {
        let di = default_init(&UnitId::reg(Reg::Di));
        assert!(di.stride.is_dynamic());
        assert_eq!(di.taint, Taint(0));
        let bx = default_init(&UnitId::reg(Reg::Bx));
        assert_eq!(bx.lh, BaseLH::symbol(sym(&UnitId::reg(Reg::Bx))));
        assert!(bx.taint.is_top());
        let far = default_init(&UnitId::static_(0x1000));
        assert!(far.lh.is_top());
    }
}
