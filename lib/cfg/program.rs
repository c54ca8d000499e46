//! The superset CFG over all lifted instructions.
//!
//! A `Program` owns every instruction and block. Blocks are discovered by
//! walking from function entry points; edges to unexplored code trigger
//! further walks, edges into the middle of an existing block are deferred
//! and resolved by splitting after the pass. Resolved indirect-target sets
//! and function-pointer sets only grow across iterations.

use crate::analysis::domain::BaseStride;
use crate::cfg::{Block, BlockId, EdgeCond, Function, Insn};
use crate::loader::Object;
use crate::rtl::{plus, reg, Expression, MatchKind, Mode, Statement};
use crate::util::cast_int;
use crate::{arch, Imm};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};

/// Bytes of a jump table enumerated before the unbounded scan gives up.
pub const LIMIT_JTABLE: Imm = 0x1000;

/// Per-stage policies for incomplete inputs. The defaults are lenient:
/// offending instructions degrade to halts and faulty blocks are excluded
/// from functions instead of failing the program.
#[derive(Clone, Copy, Debug)]
pub struct CfgPolicy {
    pub abort_missing_direct: bool,
    pub abort_missing_fallthrough: bool,
    pub abort_missing_next: bool,
    pub abort_missing_indirect: bool,
    pub abort_missing_entry: bool,
    /// Repair rewrites: halt stubs for missing continuations, lock-prefix
    /// target adjustment.
    pub compatible_input: bool,
}

impl Default for CfgPolicy {
    fn default() -> CfgPolicy {
        CfgPolicy {
            abort_missing_direct: false,
            abort_missing_fallthrough: false,
            abort_missing_next: false,
            abort_missing_indirect: false,
            abort_missing_entry: false,
            compatible_input: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EdgeKind {
    Direct,
    Fallthrough,
    Indirect,
    /// Continuation into an already-placed instruction.
    Plain,
}

#[derive(Clone, Copy, Debug)]
struct PendingEdge {
    from: BlockId,
    target: Imm,
    cond: EdgeCond,
    kind: EdgeKind,
    retried: bool,
}

enum WalkEnd {
    Transfer,
    Halt,
    Joins(Imm),
    MissingNext(bool),
}

pub struct Program {
    insns: BTreeMap<Imm, Insn>,
    blocks: Vec<Block>,
    block_at: FxHashMap<Imm, BlockId>,
    icfs: FxHashMap<Imm, FxHashSet<Imm>>,
    fptr_set: FxHashSet<Imm>,
    checked_fptrs: FxHashSet<Imm>,
    recent_fptrs: Vec<Imm>,
    recent_icfs: Vec<Imm>,
    /// Canonical jump-table base to enumerated code targets.
    pub jtable_targets: BTreeMap<Imm, BTreeSet<Imm>>,
    /// Jump location to the targets found by the unbounded scan.
    pub(crate) unbounded_icf_targets: FxHashMap<Imm, FxHashSet<Imm>>,
    /// Jump location to the jump-table bases feeding it.
    pub(crate) unbounded_icf_jtables: FxHashMap<Imm, FxHashSet<Imm>>,
    /// Vtable slot address to the virtual function stored there.
    pub vfuncs: BTreeMap<Imm, Imm>,
    /// Vtable addresses latched by the constructor dataflow.
    pub vtable_candidates: FxHashSet<Imm>,
    object: Object,
    policy: CfgPolicy,
    pub update_num: u64,
    pub faulty: bool,
    dfs_stack: Vec<Imm>,
    edge_queue: Vec<PendingEdge>,
    splits: Vec<(Option<BlockId>, Imm, EdgeCond)>,
}

impl Program {
    pub fn new(
        object: Object,
        insn_list: Vec<Insn>,
        fptr_list: &[Imm],
        indirect_targets: &FxHashMap<Imm, FxHashSet<Imm>>,
        policy: CfgPolicy,
    ) -> Program {
        let mut insns = BTreeMap::new();
        for insn in insn_list {
            insns.insert(insn.offset(), insn);
        }
        let mut program = Program {
            insns,
            blocks: Vec::new(),
            block_at: FxHashMap::default(),
            icfs: indirect_targets.clone(),
            fptr_set: FxHashSet::default(),
            checked_fptrs: FxHashSet::default(),
            recent_fptrs: Vec::new(),
            recent_icfs: Vec::new(),
            jtable_targets: BTreeMap::new(),
            unbounded_icf_targets: FxHashMap::default(),
            unbounded_icf_jtables: FxHashMap::default(),
            vfuncs: BTreeMap::new(),
            vtable_candidates: FxHashSet::default(),
            object,
            policy,
            update_num: 0,
            faulty: false,
            dfs_stack: Vec::new(),
            edge_queue: Vec::new(),
            splits: Vec::new(),
        };
        for jump_loc in indirect_targets.keys() {
            if program.insns.contains_key(jump_loc) {
                program.recent_icfs.push(*jump_loc);
            }
        }
        program.fptrs(fptr_list);
        if !fptr_list.is_empty() {
            program.update();
        }
        program
    }

    /* ------------------------------ accessors --------------------------- */

    pub fn insn(&self, offset: Imm) -> Option<&Insn> {
        self.insns.get(&offset)
    }

    /// Instructions in address order.
    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.insns.values()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_at(&self, offset: Imm) -> Option<BlockId> {
        self.block_at.get(&offset).copied()
    }

    pub fn icfs(&self) -> &FxHashMap<Imm, FxHashSet<Imm>> {
        &self.icfs
    }

    pub fn fptrs_all(&self) -> &FxHashSet<Imm> {
        &self.fptr_set
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn read(&self, offset: Imm, width: u8) -> u64 {
        self.object.read(offset, width)
    }

    pub fn code_ptr(&self, val: Imm) -> bool {
        if !self.insns.is_empty() {
            self.insns.contains_key(&val)
        } else {
            self.object.in_code(val)
        }
    }

    /* ------------------------- discovery interface ----------------------- */

    /// Declare new entry points.
    pub fn fptrs(&mut self, fptr_list: &[Imm]) {
        self.recent_fptrs = fptr_list.to_vec();
        self.fptr_set.extend(fptr_list.iter().copied());
    }

    /// Monotone union into a jump location's resolved-target set; growth
    /// re-queues the location for CFG update.
    pub fn icf(&mut self, jump_loc: Imm, targets: &FxHashSet<Imm>) {
        if targets.is_empty() {
            self.icfs.entry(jump_loc).or_default();
            return;
        }
        let set = self.icfs.entry(jump_loc).or_default();
        let old_size = set.len();
        set.extend(targets.iter().copied());
        if old_size < set.len() {
            self.recent_icfs.push(jump_loc);
        }
    }

    /// Integrate recent entry points and recently resolved indirect jumps
    /// into the block graph, then resolve deferred splits and propagate the
    /// update stamp.
    pub fn update(&mut self) {
        let recent_icfs = std::mem::take(&mut self.recent_icfs);
        let recent_fptrs = std::mem::take(&mut self.recent_fptrs);

        for &jump_loc in &recent_icfs {
            if let Some(b) = self.insns.get(&jump_loc).and_then(|i| i.parent) {
                if let Some(targets) = self.icfs.get(&jump_loc) {
                    for target in targets.clone() {
                        self.edge_queue.push(PendingEdge {
                            from: b,
                            target,
                            cond: EdgeCond::None,
                            kind: EdgeKind::Indirect,
                            retried: false,
                        });
                    }
                }
            }
        }

        for &fptr in &recent_fptrs {
            match self.insns.get(&fptr) {
                Some(insn) => {
                    if !self.block_at.contains_key(&fptr) {
                        match insn.parent {
                            None => self.dfs_stack.push(fptr),
                            // An entry into the middle of a block becomes a
                            // block head by splitting.
                            Some(_) => self.splits.push((None, fptr, EdgeCond::None)),
                        }
                    }
                }
                None => {
                    log::warn!("missing function entry {:#x}", fptr);
                    if self.policy.abort_missing_entry {
                        self.faulty = true;
                        return;
                    }
                }
            }
        }

        self.explore();
        self.process_splits();

        self.update_num += 1;
        for &jump_loc in &recent_icfs {
            if let Some(b) = self.insns.get(&jump_loc).and_then(|i| i.parent) {
                self.propagate_update(b);
            }
        }
        for &fptr in &recent_fptrs {
            if let Some(b) = self.insns.get(&fptr).and_then(|i| i.parent) {
                self.blocks[b].update_num = self.update_num;
                self.blocks[b].superset_preds.clear();
            }
        }
    }

    /// Whether the function at `fptr` was touched by the latest update.
    pub fn updated(&self, fptr: Imm) -> bool {
        self.block_at
            .get(&fptr)
            .map(|&b| self.blocks[b].update_num == self.update_num)
            .unwrap_or(false)
    }

    /// Assemble a `Function` around the block tree at `entry`; `None` when
    /// the entry is unexplored or the reachable blocks are faulty.
    pub fn func(&mut self, entry: Imm) -> Option<Function> {
        self.checked_fptrs.insert(entry);
        let entry_block = *self.block_at.get(&entry)?;
        let function = Function::new(self, entry_block, entry);
        if function.faulty {
            log::debug!("function {:#x} is faulty", entry);
            return None;
        }
        Some(function)
    }

    /* --------------------------- block building -------------------------- */

    fn explore(&mut self) {
        loop {
            if let Some(start) = self.dfs_stack.pop() {
                self.walk_block(start);
                continue;
            }
            if let Some(edge) = self.edge_queue.pop() {
                self.resolve_edge(edge);
                continue;
            }
            break;
        }
    }

    fn walk_block(&mut self, start: Imm) {
        if self.block_at.contains_key(&start) {
            return;
        }
        match self.insns.get(&start) {
            Some(insn) if insn.parent.is_none() => {}
            _ => return,
        }

        let mut list = Vec::new();
        let mut preset = 0u64;
        let mut cur = start;
        let end = loop {
            let insn = &self.insns[&cur];
            list.push(cur);
            preset |= insn.preset_regs();
            if insn.transfer() {
                break WalkEnd::Transfer;
            }
            if insn.halt() {
                break WalkEnd::Halt;
            }
            let next = insn.next_offset();
            match self.insns.get(&next) {
                Some(n) if n.parent.is_some() => break WalkEnd::Joins(next),
                Some(_) => cur = next,
                None => {
                    log::warn!("missing next instruction for {:#x}", cur);
                    if self.policy.abort_missing_next {
                        self.faulty = true;
                        break WalkEnd::MissingNext(false);
                    } else if self.policy.compatible_input {
                        self.insns
                            .get_mut(&cur)
                            .expect("current instruction exists")
                            .replace(
                                Statement::Exit(crate::rtl::ExitKind::Halt),
                                arch::HLT_BYTES.to_vec(),
                            );
                        log::debug!("fix: mark {:#x} as a halt instruction", cur);
                        break WalkEnd::MissingNext(true);
                    }
                    break WalkEnd::MissingNext(false);
                }
            }
        };

        let id = self.blocks.len();
        self.blocks.push(Block::new(id, list.clone(), preset));
        self.block_at.insert(start, id);
        for &off in &list {
            self.insns.get_mut(&off).expect("walked instruction").parent = Some(id);
        }

        let last = *list.last().expect("blocks are non-empty");
        match end {
            WalkEnd::Joins(next) => self.edge_queue.push(PendingEdge {
                from: id,
                target: next,
                cond: EdgeCond::None,
                kind: EdgeKind::Plain,
                retried: false,
            }),
            WalkEnd::MissingNext(repaired) => {
                if !repaired && !self.policy.abort_missing_next {
                    self.blocks[id].faulty = true;
                }
            }
            WalkEnd::Halt => {}
            WalkEnd::Transfer => {
                let insn = &self.insns[&last];
                let (target, fallthrough) = insn.direct_target();
                let (cond_taken, cond_fall) = insn.cond_op();
                let mut edges: Vec<PendingEdge> = Vec::new();
                if insn.direct() {
                    if !insn.call() {
                        if let Some(target) = target {
                            edges.push(PendingEdge {
                                from: id,
                                target,
                                cond: cond_taken,
                                kind: EdgeKind::Direct,
                                retried: false,
                            });
                        }
                    }
                    if insn.call() || insn.cond_jump() {
                        edges.push(PendingEdge {
                            from: id,
                            target: fallthrough,
                            cond: cond_fall,
                            kind: EdgeKind::Fallthrough,
                            retried: false,
                        });
                    }
                } else {
                    if insn.call() {
                        edges.push(PendingEdge {
                            from: id,
                            target: fallthrough,
                            cond: EdgeCond::None,
                            kind: EdgeKind::Fallthrough,
                            retried: false,
                        });
                    }
                    if insn.indirect_jump() {
                        if let Some(targets) = self.icfs.get(&last) {
                            for &target in targets {
                                edges.push(PendingEdge {
                                    from: id,
                                    target,
                                    cond: EdgeCond::None,
                                    kind: EdgeKind::Indirect,
                                    retried: false,
                                });
                            }
                        }
                    }
                }
                self.edge_queue.extend(edges);
            }
        }
    }

    fn resolve_edge(&mut self, mut edge: PendingEdge) {
        match self.insns.get(&edge.target) {
            None => {
                if edge.kind == EdgeKind::Direct
                    && self.policy.compatible_input
                    && !edge.retried
                {
                    log::debug!(
                        "fix: suppose {:#x} is a lock-prefix instruction",
                        edge.target
                    );
                    edge.target -= 1;
                    edge.retried = true;
                    self.edge_queue.push(edge);
                    return;
                }
                self.handle_missing(edge);
            }
            Some(insn) => match insn.parent {
                None => {
                    self.dfs_stack.push(edge.target);
                    self.edge_queue.push(edge);
                }
                Some(b) if self.blocks[b].offset() == edge.target => {
                    self.wire(edge.from, b, edge.cond);
                }
                Some(_) => self.splits.push((Some(edge.from), edge.target, edge.cond)),
            },
        }
    }

    fn handle_missing(&mut self, edge: PendingEdge) {
        match edge.kind {
            EdgeKind::Direct => {
                log::warn!("missing direct target {:#x}", edge.target);
                if self.policy.abort_missing_direct {
                    self.faulty = true;
                } else {
                    self.blocks[edge.from].faulty = true;
                }
            }
            EdgeKind::Fallthrough => {
                log::warn!("missing fall-through target {:#x}", edge.target);
                if self.policy.abort_missing_fallthrough {
                    self.faulty = true;
                    return;
                }
                let last = self.blocks[edge.from].last();
                let is_call = self.insns.get(&last).map(|i| i.call()).unwrap_or(false);
                if self.policy.compatible_input && is_call {
                    self.insns.get_mut(&last).expect("block last").replace(
                        Statement::Exit(crate::rtl::ExitKind::Halt),
                        arch::HLT_BYTES.to_vec(),
                    );
                    log::debug!("fix: mark {:#x} as a halt instruction", last);
                    self.blocks[edge.from].clear_succ();
                } else {
                    self.blocks[edge.from].faulty = true;
                }
            }
            EdgeKind::Indirect => {
                log::warn!("missing indirect target {:#x}", edge.target);
                if self.policy.abort_missing_indirect {
                    self.faulty = true;
                } else {
                    self.blocks[edge.from].faulty = true;
                }
            }
            EdgeKind::Plain => self.blocks[edge.from].faulty = true,
        }
    }

    fn wire(&mut self, from: BlockId, to: BlockId, cond: EdgeCond) {
        self.blocks[from].add_succ(to, cond);
        self.blocks[to].superset_preds.insert(from);
    }

    fn process_splits(&mut self) {
        let splits = std::mem::take(&mut self.splits);
        for (from, target, cond) in splits {
            let parent = match self.insns.get(&target).and_then(|i| i.parent) {
                Some(parent) => parent,
                None => continue,
            };
            let target_block = if self.blocks[parent].offset() == target {
                parent
            } else {
                self.split_block(parent, target)
            };
            if let Some(from) = from {
                self.wire(from, target_block, cond);
            }
        }
    }

    fn split_block(&mut self, parent: BlockId, at: Imm) -> BlockId {
        let (tail, succ) = self.blocks[parent].split_off(at);
        let preset = tail
            .iter()
            .fold(0u64, |m, off| m | self.insns[off].preset_regs());
        let id = self.blocks.len();
        let mut block = Block::new(id, tail.clone(), preset);
        block.update_num = self.blocks[parent].update_num;
        block.faulty = self.blocks[parent].faulty;
        self.blocks.push(block);
        for (to, cond) in succ {
            self.wire(id, to, cond);
        }
        for &off in &tail {
            self.insns.get_mut(&off).expect("split instruction").parent = Some(id);
        }
        self.block_at.insert(at, id);
        self.wire(parent, id, EdgeCond::None);
        log::trace!(
            "split block [{:#x}..] at {:#x}",
            self.blocks[parent].offset(),
            at
        );
        id
    }

    fn propagate_update(&mut self, start: BlockId) {
        let mut stack = vec![start];
        while let Some(b) = stack.pop() {
            if self.blocks[b].update_num == self.update_num {
                continue;
            }
            self.blocks[b].update_num = self.update_num;
            stack.extend(self.blocks[b].superset_preds.iter().copied());
        }
    }

    /* ----------------------------- resolution ---------------------------- */

    /// Whether a resolved target is the offset of a known instruction. The
    /// stronger guarantee, that a target lies inside the function reaching
    /// the jump, is established once the target's blocks are connected.
    pub fn valid_icf(&self, target: Imm) -> bool {
        self.code_ptr(target)
    }

    /// Enumerate the targets a `BaseStride` describes, partitioned by
    /// jump-table base (`-1` keys the scalar bucket). `f` is the affine
    /// continuation accumulated across structured indices.
    pub(crate) fn resolve_targets(
        &self,
        targets: &mut FxHashMap<Imm, FxHashSet<Imm>>,
        expr: &BaseStride,
        f: &dyn Fn(Imm) -> Imm,
    ) {
        let terms = match expr {
            BaseStride::Terms(terms) => terms,
            _ => return,
        };
        for term in terms {
            let b = term.base;
            let s = term.stride;
            let w = term.width.max(1);
            if s == 0 {
                let target = if term.nmem {
                    f(b)
                } else {
                    f(cast_int(self.read(b, w), w))
                };
                if self.valid_icf(target) {
                    log::trace!("#0: {:#x}", target);
                    targets.entry(-1).or_default().insert(target);
                }
                continue;
            }
            match term.index.as_ref() {
                BaseStride::Top | BaseStride::Dynamic => {
                    let mut addr = b;
                    while addr > b - LIMIT_JTABLE && addr < b + LIMIT_JTABLE {
                        let target = if term.nmem {
                            f(addr)
                        } else {
                            f(cast_int(self.read(addr, w), w))
                        };
                        if !self.valid_icf(target) {
                            break;
                        }
                        log::trace!("#{}: {:#x}", (addr - b) / s, target);
                        targets.entry(b).or_default().insert(target);
                        addr += s;
                    }
                }
                BaseStride::Terms(_) => {
                    self.resolve_targets(targets, &term.index, &|x| f(b + s * x));
                }
                BaseStride::Bottom => {}
            }
        }
    }

    /// Commit the accumulated unbounded resolutions: prefer jump-table
    /// derived targets, fall back to the scalar scan.
    pub fn resolve_unbounded_icf(&mut self) {
        let jtables_by_loc = std::mem::take(&mut self.unbounded_icf_jtables);
        let mut scans = std::mem::take(&mut self.unbounded_icf_targets);
        for (jump_loc, jtables) in jtables_by_loc {
            let mut targets: FxHashSet<Imm> = FxHashSet::default();
            for jtable in &jtables {
                if let Some(set) = self.jtable_targets.get(jtable) {
                    targets.extend(set.iter().copied());
                }
            }
            if targets.is_empty() {
                if let Some(set) = scans.remove(&jump_loc) {
                    targets = set;
                }
            }
            log::debug!("found {} indirect targets at {:#x}", targets.len(), jump_loc);
            self.icf(jump_loc, &targets);
        }
    }

    /* ------------------------------ scanning ----------------------------- */

    /// Dynamic-symbol functions, relocation targets, and direct call
    /// targets that land in code.
    pub fn definite_fptrs(&self) -> FxHashSet<Imm> {
        let mut res: FxHashSet<Imm> = FxHashSet::default();
        for &addr in self.object.dyn_func_addrs() {
            if self.code_ptr(addr) {
                res.insert(addr);
            }
        }
        for &addr in self.object.reloc_fptr_targets() {
            if self.code_ptr(addr) {
                res.insert(addr);
            }
        }
        for insn in self.insns.values() {
            if insn.call() && insn.direct() {
                if let (Some(target), _) = insn.direct_target() {
                    if self.code_ptr(target) {
                        res.insert(target);
                    }
                }
            }
        }
        res
    }

    /// Addresses where a frame push is followed by more prologue within a
    /// 15-instruction window.
    pub fn prolog_fptrs(&self) -> FxHashSet<Imm> {
        let offs: Vec<Imm> = self.insns.keys().copied().collect();
        let mut res = FxHashSet::default();
        let mut i = 0;
        while i < offs.len() {
            let mut j = i;
            if arch::prolog(self.insns[&offs[i]].raw()) >= 2 {
                for _ in 0..15 {
                    j += 1;
                    if j >= offs.len() {
                        break;
                    }
                    if arch::prolog(self.insns[&offs[j]].raw()) >= 1 {
                        res.insert(offs[i]);
                    }
                }
            }
            if j >= offs.len() {
                break;
            }
            i = j + 1;
        }
        res
    }

    /// Stored 8- and 4-byte values pointing into code, plus PC-relative
    /// operands whose sum lands in code.
    pub fn scan_cptrs(&self) -> FxHashSet<Imm> {
        let mut res = self.stored_cptrs(8);
        res.extend(self.stored_cptrs(4));

        let pc_rel = plus(
            Mode::Di,
            reg(Mode::Di, arch::INSN_PTR),
            Expression::Any,
        );
        for insn in self.insns.values() {
            if insn.empty() {
                continue;
            }
            if let Some(Expression::Binary { rhs, .. }) =
                insn.stmt().find(MatchKind::Partial, &pc_rel).first()
            {
                if let Expression::Const(c) = rhs.as_ref() {
                    if let Some(disp) = c.to_int() {
                        let val = insn.next_offset() + disp;
                        if self.code_ptr(val) {
                            res.insert(val);
                        }
                    }
                }
            }
        }
        res
    }

    fn stored_cptrs(&self, width: u8) -> FxHashSet<Imm> {
        let mut res = FxHashSet::default();
        for (lo, hi) in self.object.load_ranges() {
            let mut addr = lo;
            while addr + width as Imm <= hi {
                let val = cast_int(self.object.read(addr, width), width);
                if self.code_ptr(val) {
                    res.insert(val);
                }
                addr += 1;
            }
        }
        res
    }

    /// First non-nop instruction after each unexplored run, as new entry
    /// candidates.
    pub fn scan_fptrs_in_gap(&mut self) -> Vec<Imm> {
        let offs: Vec<Imm> = self.insns.keys().copied().collect();
        let mut extra = Vec::new();
        let mut prev_gap = false;
        let mut i = 0;
        while i < offs.len() {
            let gap = self.insns[&offs[i]].parent.is_none();
            if gap && !prev_gap {
                while i < offs.len() && self.insns[&offs[i]].empty() {
                    i += 1;
                }
                if i >= offs.len() {
                    break;
                }
                let off = offs[i];
                if self.checked_fptrs.insert(off) {
                    extra.push(off);
                }
            }
            prev_gap = self.insns[&offs[i]].parent.is_none();
            i += 1;
        }
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Reg;
    use crate::rtl::{assign, const_int, mem, mult, CompareOp, ExitKind};

    fn pc() -> Expression {
        Expression::NoType(String::from("pc"))
    }

    fn nop(off: Imm, len: usize) -> Insn {
        Insn::new(off, Statement::Nop, vec![0x90; len])
    }

    fn jmp(off: Imm, target: Imm, len: usize) -> Insn {
        Insn::new(off, assign(pc(), const_int(target)), vec![0xeb; len])
    }

    fn jcc(off: Imm, target: Imm, len: usize) -> Insn {
        let src = Expression::IfElse {
            mode: Mode::None,
            cmp: Box::new(Expression::Compare {
                op: CompareOp::Eq,
                mode: Mode::None,
                expr: Box::new(reg(Mode::Ccz, Reg::Flags)),
            }),
            on_true: Box::new(const_int(target)),
            on_false: Box::new(pc()),
        };
        Insn::new(off, assign(pc(), src), vec![0x74; len])
    }

    fn ijmp(off: Imm, len: usize) -> Insn {
        let src = mem(
            Mode::Di,
            plus(
                Mode::Di,
                mult(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(8)),
                const_int(0x3020),
            ),
        );
        Insn::new(off, assign(pc(), src), vec![0xff; len])
    }

    fn ret(off: Imm) -> Insn {
        Insn::new(off, Statement::Exit(ExitKind::Ret), vec![0xc3])
    }

    fn call(off: Imm, target: Imm, len: usize) -> Insn {
        Insn::new(
            off,
            Statement::Call {
                target: const_int(target),
            },
            vec![0xe8; len],
        )
    }

    fn program(insns: Vec<Insn>, fptrs: &[Imm]) -> Program {
        Program::new(
            Object::anonymous(),
            insns,
            fptrs,
            &FxHashMap::default(),
            CfgPolicy::default(),
        )
    }

    #[test]
    fn blocks_partition_instructions() {
        // 0: nop; 1: je 6; 3: nop; 4: jmp 0; 6: ret
        let p = program(
            vec![nop(0, 1), jcc(1, 6, 2), nop(3, 1), jmp(4, 0, 2), ret(6)],
            &[0],
        );
        assert!(!p.faulty);
        assert_eq!(p.blocks().len(), 3);
        // Every instruction placed exactly once, block heads distinct,
        // every block ends in a transfer or halt.
        let mut seen = FxHashSet::default();
        for block in p.blocks() {
            for &off in block.insns() {
                assert!(seen.insert(off), "instruction {:#x} in two blocks", off);
                assert_eq!(p.insn(off).unwrap().parent(), Some(block.id()));
            }
            let last = p.insn(block.last()).unwrap();
            assert!(last.transfer() || last.halt());
        }
        assert_eq!(seen.len(), 5);
        // je fall-through and target edges both exist.
        let entry = p.block(p.block_at(0).unwrap());
        assert_eq!(entry.succ().len(), 2);
    }

    #[test]
    fn jump_into_block_middle_splits() {
        // 0: nop; 1: nop; 2: ret  then a second entry at 1.
        let mut p = program(vec![nop(0, 1), nop(1, 1), ret(2)], &[0]);
        assert_eq!(p.blocks().len(), 1);
        p.fptrs(&[1]);
        p.update();
        assert_eq!(p.blocks().len(), 2);
        let head = p.block(p.block_at(0).unwrap());
        let tail = p.block(p.block_at(1).unwrap());
        assert_eq!(head.insns(), &[0]);
        assert_eq!(tail.insns(), &[1, 2]);
        assert_eq!(head.succ(), &[(tail.id(), EdgeCond::None)]);
    }

    #[test]
    fn icf_is_monotone_and_connects() {
        let mut p = program(vec![ijmp(0, 7), ret(7), ret(8)], &[0]);
        assert_eq!(p.blocks().len(), 1);

        let one: FxHashSet<Imm> = [7].into_iter().collect();
        p.icf(0, &one);
        p.update();
        assert_eq!(p.icfs()[&0].len(), 1);
        let jump_block = p.block_at(0).unwrap();
        assert_eq!(p.block(jump_block).succ().len(), 1);

        // Same targets again: no growth, no re-queue.
        p.icf(0, &one);
        assert!(p.recent_icfs.is_empty());

        let two: FxHashSet<Imm> = [7, 8].into_iter().collect();
        p.icf(0, &two);
        p.update();
        assert_eq!(p.icfs()[&0].len(), 2);
        assert_eq!(p.block(jump_block).succ().len(), 2);
    }

    #[test]
    fn missing_call_fallthrough_becomes_halt() {
        // call 0x100 with nothing after it; target exists elsewhere.
        let p = program(vec![call(0, 0x100, 5), ret(0x100)], &[0]);
        assert!(!p.faulty);
        let insn = p.insn(0).unwrap();
        assert!(insn.halt());
        let block = p.block(p.block_at(0).unwrap());
        assert!(block.succ().is_empty());
        assert_eq!(block.insns(), &[0]);
    }

    #[test]
    fn missing_next_instruction_becomes_halt() {
        // nop at 0 runs into a hole at 1.
        let p = program(vec![nop(0, 1), ret(5)], &[0]);
        assert!(!p.faulty);
        assert!(p.insn(0).unwrap().halt());
    }

    #[test]
    fn gap_scan_finds_first_non_nop() {
        let mut p = program(
            vec![ret(0), nop(1, 1), nop(2, 1), jmp(3, 3, 2), ret(5)],
            &[0],
        );
        let extra = p.scan_fptrs_in_gap();
        assert_eq!(extra, vec![3]);
        // Re-scan does not report the same candidate twice.
        assert!(p.scan_fptrs_in_gap().is_empty());
    }

    #[test]
    fn updated_tracks_latest_stamp() {
        let mut p = program(vec![nop(0, 1), ret(1), ret(8)], &[0]);
        assert!(p.updated(0));
        p.fptrs(&[8]);
        p.update();
        assert!(p.updated(8));
        assert!(!p.updated(0));
    }
}
