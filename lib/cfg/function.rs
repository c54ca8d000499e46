//! Per-function fixed-point evaluation.
//!
//! A `Function` borrows blocks from the `Program` by id for the duration of
//! one analysis; the blocks survive it. Loop SCCs are not iterated to a
//! fixed point: with `iteration_limit == 0` every register written inside
//! the loop is preset to top up front and the body runs once, which
//! over-approximates loop-variant values while preserving loop-invariant
//! ones.

use crate::analysis::domain::BaseStride;
use crate::analysis::exec::{execute, Exec, InsnCtx};
use crate::analysis::state::{State, StateConfig, UnitId};
use crate::cfg::{decompose, BlockId, Program, Scc};
use crate::Imm;
use rustc_hash::FxHashMap;

pub struct Function {
    entry: Imm,
    entry_block: BlockId,
    sccs: Vec<Scc>,
    /// Merged intervals `[lo, hi)` covered by the function's blocks.
    code_range: Vec<(Imm, Imm)>,
    /// Jump location to the computed target expression.
    pub target_exprs: FxHashMap<Imm, BaseStride>,
    /// Storage units that aliased the incoming this pointer.
    pub this_points: Vec<UnitId>,
    /// Candidate vtable addresses and their last known holders.
    pub lea_dst: Vec<(Imm, UnitId)>,
    /// Vtable address latched by the constructor dataflow, if any.
    pub vfunc_table: Option<Imm>,
    pub faulty: bool,
}

impl Function {
    pub(crate) fn new(program: &Program, entry_block: BlockId, entry: Imm) -> Function {
        let sccs = decompose(program.blocks(), entry_block);

        let mut faulty = false;
        let mut intervals = Vec::new();
        for scc in &sccs {
            for &b in scc.blocks() {
                let block = program.block(b);
                faulty |= block.faulty;
                let last = program
                    .insn(block.last())
                    .map(|insn| insn.next_offset())
                    .unwrap_or(block.last());
                intervals.push((block.offset(), last));
            }
        }
        intervals.sort_unstable();
        let mut code_range: Vec<(Imm, Imm)> = Vec::new();
        for (lo, hi) in intervals {
            match code_range.last_mut() {
                Some((_, end)) if lo <= *end => *end = (*end).max(hi),
                _ => code_range.push((lo, hi)),
            }
        }

        Function {
            entry,
            entry_block,
            sccs,
            code_range,
            target_exprs: FxHashMap::default(),
            this_points: Vec::new(),
            lea_dst: Vec::new(),
            vfunc_table: None,
            faulty,
        }
    }

    pub fn offset(&self) -> Imm {
        self.entry
    }

    pub fn entry_block(&self) -> BlockId {
        self.entry_block
    }

    pub fn sccs(&self) -> &[Scc] {
        &self.sccs
    }

    pub fn code_range(&self) -> &[(Imm, Imm)] {
        &self.code_range
    }

    pub fn contains(&self, offset: Imm) -> bool {
        self.code_range
            .iter()
            .any(|(lo, hi)| *lo <= offset && offset < *hi)
    }

    /// Whether any indirect jump in this function still has no resolved
    /// target set.
    pub fn has_unresolved_icf(&self, program: &Program) -> bool {
        self.sccs.iter().any(|scc| {
            scc.blocks().iter().any(|&b| {
                program.block(b).insns().iter().any(|&off| {
                    program
                        .insn(off)
                        .map(|insn| {
                            insn.indirect()
                                && program.icfs().get(&off).map_or(true, |t| t.is_empty())
                        })
                        .unwrap_or(false)
                })
            })
        })
    }

    /// Abstract evaluation over the SCCs in reverse postorder.
    pub fn analyze(&mut self, program: &Program, config: &StateConfig) {
        let mut exec = Exec::new(State::new(config.clone()));
        for scc in &self.sccs {
            if !scc.is_loop() {
                for &b in scc.blocks() {
                    exec_block(program, b, &mut exec);
                }
            } else if config.iteration_limit == 0 {
                let mask = scc
                    .blocks()
                    .iter()
                    .fold(0u64, |m, &b| m | program.block(b).preset_regs);
                exec.state.preset(mask);
                log::trace!(
                    "loop at {:#x}: preset mask {:#018x}",
                    program.block(scc.blocks()[0]).offset(),
                    mask
                );
                for &b in scc.blocks() {
                    exec_block(program, b, &mut exec);
                }
            } else {
                for _ in 0..config.iteration_limit {
                    for &b in scc.blocks() {
                        exec_block(program, b, &mut exec);
                    }
                }
            }
        }
        self.target_exprs = exec.out.target_exprs;
        self.this_points = exec.out.this_points;
        self.lea_dst = exec.out.lea_dst;
        if self.vfunc_table.is_none() {
            self.vfunc_table = exec.out.vfunc_table;
        }
    }

    /// Hand every computed jump-target expression to the resolver, filling
    /// the program's jump-table and unbounded-target partitions.
    pub fn resolve_icf(&self, program: &mut Program) {
        for (&jump_loc, expr) in &self.target_exprs {
            let mut targets: FxHashMap<Imm, rustc_hash::FxHashSet<Imm>> = FxHashMap::default();
            program.resolve_targets(&mut targets, expr, &|x| x);
            for (base, set) in targets {
                if set.is_empty() {
                    continue;
                }
                if base == -1 {
                    program
                        .unbounded_icf_targets
                        .entry(jump_loc)
                        .or_default()
                        .extend(set.iter().copied());
                    program.unbounded_icf_jtables.entry(jump_loc).or_default();
                } else {
                    program
                        .jtable_targets
                        .entry(base)
                        .or_default()
                        .extend(set.iter().copied());
                    program
                        .unbounded_icf_jtables
                        .entry(jump_loc)
                        .or_default()
                        .insert(base);
                }
            }
        }
    }
}

fn exec_block(program: &Program, b: BlockId, exec: &mut Exec) {
    for &off in program.block(b).insns() {
        let insn = match program.insn(off) {
            Some(insn) => insn,
            None => continue,
        };
        exec.insn = InsnCtx {
            offset: off,
            next_offset: insn.next_offset(),
            indirect_jump: insn.indirect_jump(),
        };
        execute(insn.stmt(), exec);
        exec.state.commit_insn();
    }
}
