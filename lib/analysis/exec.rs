//! Execution of RTL statements against the abstract state.
//!
//! One `Exec` lives for the duration of a function analysis. Ordering
//! contract: inside a `Sequence` earlier writes are committed before later
//! statements execute; inside a `Parallel` all assignments observe the
//! pre-state and commit together; the per-instruction commit is issued by
//! the block executor.

use crate::analysis::domain::{AbsVal, BaseLH, BaseStride, Lattice};
use crate::analysis::eval::{check_taint, eval};
use crate::analysis::state::{classify, sym, sym_to_id, MemAddr, Region, State, UnitId};
use crate::arch::{Reg, FLAGS};
use crate::rtl::{BinaryOp, Expression, Statement};
use crate::Imm;
use rustc_hash::FxHashMap;

/// Registers a call may overwrite under the System V AMD64 ABI.
const CALL_CLOBBERED: [Reg; 26] = [
    Reg::Ax,
    Reg::Cx,
    Reg::Dx,
    Reg::Si,
    Reg::Di,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Flags,
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
    Reg::Xmm6,
    Reg::Xmm7,
    Reg::Xmm8,
    Reg::Xmm9,
    Reg::Xmm10,
    Reg::Xmm11,
    Reg::Xmm12,
    Reg::Xmm13,
    Reg::Xmm14,
    Reg::Xmm15,
];

/// The instruction being executed.
#[derive(Clone, Copy, Debug, Default)]
pub struct InsnCtx {
    pub offset: Imm,
    pub next_offset: Imm,
    pub indirect_jump: bool,
}

/// Per-function analysis results, harvested by `Function::analyze`.
#[derive(Clone, Debug, Default)]
pub struct FnOutputs {
    /// Jump location to the computed target expression.
    pub target_exprs: FxHashMap<Imm, BaseStride>,
    /// Storage units currently aliasing the incoming this pointer.
    pub this_points: Vec<UnitId>,
    pub this_latched: bool,
    /// Candidate vtable addresses and the unit currently holding each.
    pub lea_dst: Vec<(Imm, UnitId)>,
    /// Latched vtable address once a candidate reaches a this-pointer slot.
    pub vfunc_table: Option<Imm>,
}

pub struct Exec {
    pub state: State,
    pub insn: InsnCtx,
    pub out: FnOutputs,
}

impl Exec {
    pub fn new(state: State) -> Exec {
        Exec {
            state,
            insn: InsnCtx::default(),
            out: FnOutputs::default(),
        }
    }
}

pub fn execute(stmt: &Statement, exec: &mut Exec) {
    match stmt {
        Statement::Parallel(stmts) => {
            // All operands observe the pre-state; effects commit together.
            for stmt in stmts {
                execute(stmt, exec);
            }
        }
        Statement::Sequence(stmts) => {
            for stmt in stmts {
                // Commit the previous statement before executing the
                // current one; the last commit happens outside.
                exec.state.commit_insn();
                execute(stmt, exec);
            }
        }
        Statement::Assign { dst, src } => execute_assign(dst, src, exec),
        Statement::Call { .. } => {
            for reg in CALL_CLOBBERED {
                exec.state.clobber(UnitId::reg(reg));
            }
            // The return value is externally supplied, like an argument.
            exec.state.update(
                UnitId::reg(Reg::Ax),
                AbsVal {
                    stride: BaseStride::Dynamic,
                    ..AbsVal::top()
                },
            );
        }
        Statement::Clobber(expr) => {
            if let Expression::Reg(_, reg) = expr.simplify() {
                if *reg != FLAGS && *reg != Reg::Unknown {
                    exec.state.clobber(UnitId::reg(*reg));
                }
            }
        }
        Statement::Exit(_) | Statement::Nop => {}
    }
}

fn execute_assign(dst: &Expression, src: &Expression, exec: &mut Exec) {
    let destination = dst.simplify();
    let source = src.simplify();
    let size = destination.mode_size().max(source.mode_size()).max(1);

    let mut addr_of_dst = None;
    match destination {
        Expression::Reg(_, reg) => {
            let aval = eval(source, exec);
            if *reg == crate::arch::STACK_PTR {
                check_taint(exec, &aval, "stack pointer");
            }
            if *reg != FLAGS && *reg != Reg::Unknown {
                exec.state.update(UnitId::reg(*reg), aval);
            }
        }
        Expression::Mem(_, addr) => {
            let aval_addr = eval(addr, exec);
            check_taint(exec, &aval_addr, "write address");
            let aval = eval(source, exec);
            match classify(&aval_addr.lh) {
                MemAddr::Top => {
                    exec.state.clobber_region(Region::Stack);
                    exec.state.clobber_region(Region::Static);
                }
                MemAddr::NotLocal => exec.state.clobber_region(Region::Static),
                MemAddr::Cell(region, lo, hi) => {
                    exec.state.update_range(
                        UnitId { region, index: lo },
                        UnitId { region, index: hi },
                        size,
                        aval,
                    );
                }
            }
            addr_of_dst = Some(aval_addr);
        }
        Expression::NoType(name) if name == "pc" => {
            let aval = eval(source, exec);
            check_taint(exec, &aval, "jump target");
            if exec.insn.indirect_jump {
                exec.out
                    .target_exprs
                    .insert(exec.insn.offset, aval.stride.clone());
                log::trace!("update(pc) at {:#x}: {}", exec.insn.offset, aval.stride);
                // The dispatch register or slot now holds a code address.
                match source {
                    Expression::Reg(_, reg) => {
                        if *reg != Reg::Unknown {
                            exec.state.update(UnitId::reg(*reg), AbsVal::pc());
                        }
                    }
                    Expression::Mem(_, addr) => {
                        let aval_addr = eval(addr, exec);
                        if let MemAddr::Cell(region, lo, hi) = classify(&aval_addr.lh) {
                            exec.state.update_range(
                                UnitId { region, index: lo },
                                UnitId { region, index: hi },
                                8,
                                AbsVal::pc(),
                            );
                        }
                    }
                    _ => {}
                }
            }
            return;
        }
        _ => return,
    }

    track_vtable_flow(destination, source, addr_of_dst, exec);
}

/// This-pointer and vtable-candidate dataflow, by storage unit.
///
/// The first copy of the incoming `di` latches this-pointer tracking;
/// RIP-relative or constant loads are candidate vtable addresses; storing a
/// candidate through a this-pointer alias at an 8-aligned offset latches
/// the function's vtable.
fn track_vtable_flow(
    destination: &Expression,
    source: &Expression,
    addr_of_dst: Option<AbsVal>,
    exec: &mut Exec,
) {
    let dst_id = unit_of(destination, exec);
    let src_id = unit_of(source, exec);

    // Latch: a candidate flows into slot 0 (mod 8) of the this object.
    if exec.out.vfunc_table.is_none() {
        if let Some(aval_addr) = &addr_of_dst {
            if let BaseLH::Sym { base, lo, hi } = aval_addr.lh {
                let this_base = sym(&UnitId::reg(Reg::Di));
                let via_alias = sym_to_id(base)
                    .map(|id| exec.out.this_points.contains(&id))
                    .unwrap_or(false);
                if (base == this_base || via_alias) && lo == hi && lo % 8 == 0 {
                    if let Some(addr) = candidate_of(source, src_id, exec) {
                        exec.out.vfunc_table = Some(addr);
                        log::debug!("vtable {:#x} latched at {:#x}", addr, exec.insn.offset);
                        return;
                    }
                }
            }
        }
    }

    // This-pointer aliases: copies extend the set, overwrites kill.
    if exec.out.this_latched {
        if let Some(d) = dst_id {
            let from_alias = src_id.map_or(false, |s| exec.out.this_points.contains(&s));
            if from_alias {
                if !exec.out.this_points.contains(&d) {
                    exec.out.this_points.push(d);
                }
            } else if !is_this_source(source) {
                exec.out.this_points.retain(|x| *x != d);
            }
        }
    }
    if !exec.out.this_latched && is_this_source(source) {
        if let Some(d) = dst_id {
            exec.out.this_points.push(d);
            exec.out.this_latched = true;
        }
    }

    // Vtable candidates: births and moves.
    if let Some(addr) = lea_const(source, exec) {
        if let Some(d) = dst_id {
            exec.out.lea_dst.retain(|(_, id)| *id != d);
            exec.out.lea_dst.push((addr, d));
        }
    } else if let (Some(s), Some(d)) = (src_id, dst_id) {
        if let Some(pos) = exec.out.lea_dst.iter().position(|(_, id)| *id == s) {
            let addr = exec.out.lea_dst[pos].0;
            exec.out.lea_dst.retain(|(_, id)| *id != d);
            exec.out.lea_dst.push((addr, d));
        } else {
            exec.out.lea_dst.retain(|(_, id)| *id != d);
        }
    } else if let Some(d) = dst_id {
        exec.out.lea_dst.retain(|(_, id)| *id != d);
    }
}

fn is_this_source(source: &Expression) -> bool {
    matches!(source, Expression::Reg(_, Reg::Di))
}

/// The storage unit an operand names, when it names exactly one.
fn unit_of(expr: &Expression, exec: &Exec) -> Option<UnitId> {
    match expr {
        Expression::Reg(_, reg) if *reg != Reg::Unknown => Some(UnitId::reg(*reg)),
        Expression::Mem(_, addr) => {
            let aval = eval(addr, exec);
            match classify(&aval.lh) {
                MemAddr::Cell(region, lo, hi) if lo == hi => Some(UnitId { region, index: lo }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// A concrete address computed by the source: a RIP-relative `lea` or a
/// plain constant.
fn lea_const(source: &Expression, exec: &Exec) -> Option<Imm> {
    match source {
        Expression::Const(c) => c.to_int(),
        Expression::Binary {
            op: BinaryOp::Plus,
            lhs,
            rhs,
            ..
        } => match (lhs.as_ref(), rhs.as_ref()) {
            (Expression::Reg(_, Reg::Ip), Expression::Const(c)) => {
                c.to_int().map(|d| exec.insn.next_offset + d)
            }
            (Expression::Const(c), Expression::Reg(_, Reg::Ip)) => {
                c.to_int().map(|d| exec.insn.next_offset + d)
            }
            _ => None,
        },
        _ => None,
    }
}

/// The candidate vtable address the source carries, if any.
fn candidate_of(source: &Expression, src_id: Option<UnitId>, exec: &Exec) -> Option<Imm> {
    if let Some(addr) = lea_const(source, exec) {
        if exec.out.lea_dst.iter().any(|(a, _)| *a == addr)
            || matches!(source, Expression::Binary { .. })
        {
            return Some(addr);
        }
    }
    if let Some(s) = src_id {
        if let Some((addr, _)) = exec.out.lea_dst.iter().find(|(_, id)| *id == s) {
            return Some(*addr);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::state::StateConfig;
    use crate::rtl::{assign, const_int, mem, plus, reg, Mode};

    fn fresh() -> Exec {
        let mut exec = Exec::new(State::new(StateConfig::default()));
        exec.insn = InsnCtx {
            offset: 0x100,
            next_offset: 0x104,
            indirect_jump: false,
        };
        exec
    }

    fn run(stmt: &Statement, exec: &mut Exec) {
        execute(stmt, exec);
        exec.state.commit_insn();
    }

    #[test]
    fn sequence_commits_between_statements() {
        let mut exec = fresh();
        // r = 5; then r' = r + 1 must observe r = 5.
        let stmt = Statement::Sequence(vec![
            assign(reg(Mode::Di, Reg::Ax), const_int(5)),
            assign(
                reg(Mode::Di, Reg::Bx),
                plus(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(1)),
            ),
        ]);
        run(&stmt, &mut exec);
        assert_eq!(exec.state.read(&UnitId::reg(Reg::Bx)).lh.to_const(), Some(6));
    }

    #[test]
    fn parallel_observes_the_pre_state() {
        let mut exec = fresh();
        run(&assign(reg(Mode::Di, Reg::Ax), const_int(5)), &mut exec);
        // ax <- 9 || bx <- ax + 1: bx must use the old ax.
        let stmt = Statement::Parallel(vec![
            assign(reg(Mode::Di, Reg::Ax), const_int(9)),
            assign(
                reg(Mode::Di, Reg::Bx),
                plus(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(1)),
            ),
        ]);
        run(&stmt, &mut exec);
        assert_eq!(exec.state.read(&UnitId::reg(Reg::Ax)).lh.to_const(), Some(9));
        assert_eq!(exec.state.read(&UnitId::reg(Reg::Bx)).lh.to_const(), Some(6));
    }

    #[test]
    fn stack_store_and_reload() {
        let mut exec = fresh();
        // mov [rsp - 8], 7; mov rax, [rsp - 8]
        let slot = mem(
            Mode::Di,
            plus(Mode::Di, reg(Mode::Di, Reg::Sp), const_int(-8)),
        );
        run(&assign(slot.clone(), const_int(7)), &mut exec);
        run(&assign(reg(Mode::Di, Reg::Ax), slot), &mut exec);
        assert_eq!(exec.state.read(&UnitId::reg(Reg::Ax)).lh.to_const(), Some(7));
    }

    #[test]
    fn unknown_write_clobbers_static() {
        let mut exec = fresh();
        run(
            &assign(mem(Mode::Di, reg(Mode::Di, Reg::Bx)), const_int(1)),
            &mut exec,
        );
        // bx has a symbolic non-stack base: static is gone, stack survives.
        assert!(exec.state.read(&UnitId::static_(0x1000)).is_top());
        let sp_slot = exec.state.read(&UnitId::stack(-16));
        assert_eq!(sp_slot.lh, BaseLH::symbol(sym(&UnitId::stack(-16))));
    }

    #[test]
    fn indirect_jump_records_target_expr() {
        let mut exec = fresh();
        exec.insn.indirect_jump = true;
        let table = mem(
            Mode::Di,
            plus(
                Mode::Di,
                crate::rtl::mult(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(8)),
                const_int(0x3020),
            ),
        );
        run(
            &assign(Expression::NoType(String::from("pc")), table),
            &mut exec,
        );
        let expr = exec.out.target_exprs.get(&0x100).expect("recorded");
        assert_eq!(expr.terms().len(), 1);
        assert_eq!(expr.terms()[0].base, 0x3020);
    }

    #[test]
    fn call_clobbers_scratch_keeps_callee_saved() {
        let mut exec = fresh();
        run(&assign(reg(Mode::Di, Reg::Cx), const_int(3)), &mut exec);
        run(&assign(reg(Mode::Di, Reg::Bx), const_int(4)), &mut exec);
        run(
            &Statement::Call {
                target: const_int(0x4000),
            },
            &mut exec,
        );
        assert!(exec.state.read(&UnitId::reg(Reg::Cx)).lh.is_top());
        assert_eq!(exec.state.read(&UnitId::reg(Reg::Bx)).lh.to_const(), Some(4));
        assert!(exec.state.read(&UnitId::reg(Reg::Ax)).stride.is_dynamic());
    }

    #[test]
    fn this_pointer_and_vtable_latch() {
        let mut exec = fresh();
        // mov [rsp-8], rdi  (this-pointer spill)
        run(
            &assign(
                mem(
                    Mode::Di,
                    plus(Mode::Di, reg(Mode::Di, Reg::Sp), const_int(-8)),
                ),
                reg(Mode::Di, Reg::Di),
            ),
            &mut exec,
        );
        assert!(exec.out.this_latched);
        assert_eq!(exec.out.this_points, vec![UnitId::stack(-8)]);

        // lea rcx, [rip + 0x2f00]
        run(
            &assign(
                reg(Mode::Di, Reg::Cx),
                plus(Mode::Di, reg(Mode::Di, Reg::Ip), const_int(0x2f00)),
            ),
            &mut exec,
        );
        assert_eq!(exec.out.lea_dst.len(), 1);
        let vtable = exec.out.lea_dst[0].0;

        // mov rax, [rsp-8] ; mov [rax], rcx  (store vtable at *this)
        run(
            &assign(
                reg(Mode::Di, Reg::Ax),
                mem(
                    Mode::Di,
                    plus(Mode::Di, reg(Mode::Di, Reg::Sp), const_int(-8)),
                ),
            ),
            &mut exec,
        );
        run(
            &assign(mem(Mode::Di, reg(Mode::Di, Reg::Ax)), reg(Mode::Di, Reg::Cx)),
            &mut exec,
        );
        assert_eq!(exec.out.vfunc_table, Some(vtable));
    }
}
