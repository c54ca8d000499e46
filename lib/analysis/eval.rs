//! Evaluation of RTL expressions to abstract values.

use crate::analysis::domain::{AbsVal, BaseLH, BaseStride, Lattice, StrideTerm, Taint};
use crate::analysis::exec::Exec;
use crate::analysis::state::{classify, MemAddr, UnitId};
use crate::arch::{Reg, INSN_PTR};
use crate::rtl::{BinaryOp, ConvOp, Expression, UnaryOp};
use crate::Imm;

/// Recursion bound; pathological lifted trees evaluate to top past this.
const EVAL_DEPTH_LIMIT: usize = 64;

pub fn eval(expr: &Expression, exec: &Exec) -> AbsVal {
    eval_depth(expr, exec, 0)
}

fn eval_depth(expr: &Expression, exec: &Exec, depth: usize) -> AbsVal {
    if depth > EVAL_DEPTH_LIMIT {
        return AbsVal::top();
    }
    match expr {
        Expression::Const(c) => match c.to_int() {
            Some(v) => AbsVal::constant(v),
            None => AbsVal::top(),
        },
        Expression::Reg(_, reg) => {
            if *reg == INSN_PTR {
                // The lifter's `ip` denotes the address after the current
                // instruction, which is concrete here.
                AbsVal::constant(exec.insn.next_offset)
            } else if *reg == Reg::Unknown {
                AbsVal::top()
            } else {
                exec.state.read(&UnitId::reg(*reg))
            }
        }
        Expression::Mem(mode, addr) => {
            let aval_addr = eval_depth(addr, exec, depth + 1);
            let width = mode.size().max(1);
            let mut val = match classify(&aval_addr.lh) {
                MemAddr::Cell(region, lo, hi) if lo == hi && exec.state.config.track_memory => {
                    exec.state.read(&UnitId { region, index: lo })
                }
                _ => AbsVal::top(),
            };
            // The load itself is the induction pattern: a strided address
            // becomes a strided table lookup.
            let loaded = load_stride(&aval_addr.stride, width);
            if !loaded.is_top() {
                val.stride = loaded;
            }
            val
        }
        Expression::SubReg { expr, .. } => eval_depth(expr, exec, depth + 1),
        Expression::IfElse {
            on_true, on_false, ..
        } => {
            let mut val = eval_depth(on_true, exec, depth + 1);
            val.join(&eval_depth(on_false, exec, depth + 1));
            val
        }
        Expression::Conversion { op, expr, .. } => match op {
            ConvOp::ZeroExtend
            | ConvOp::SignExtend
            | ConvOp::Truncate
            | ConvOp::STruncate
            | ConvOp::UTruncate
            | ConvOp::StrictLowPart
            | ConvOp::FloatExtend => eval_depth(expr, exec, depth + 1),
            _ => {
                let inner = eval_depth(expr, exec, depth + 1);
                AbsVal {
                    lh: BaseLH::top(),
                    stride: BaseStride::top(),
                    taint: inner.taint,
                }
            }
        },
        Expression::Unary { op, expr, .. } => {
            let inner = eval_depth(expr, exec, depth + 1);
            match op {
                UnaryOp::Neg => AbsVal {
                    lh: BaseLH::constant(0).sub(&inner.lh),
                    stride: match inner.stride.to_const() {
                        Some(c) => BaseStride::constant(-c),
                        None => BaseStride::top(),
                    },
                    taint: inner.taint,
                },
                _ => AbsVal {
                    lh: BaseLH::top(),
                    stride: BaseStride::top(),
                    taint: inner.taint,
                },
            }
        }
        Expression::Binary { op, lhs, rhs, .. } => {
            let a = eval_depth(lhs, exec, depth + 1);
            let b = eval_depth(rhs, exec, depth + 1);
            let mut taint = a.taint;
            taint.join(&b.taint);
            let (lh, stride) = match op {
                BinaryOp::Plus => (a.lh.add(&b.lh), stride_plus(&a.stride, &b.stride)),
                BinaryOp::Minus => {
                    let stride = match b.stride.to_const() {
                        Some(c) => a.stride.add_const(-c),
                        None => BaseStride::top(),
                    };
                    (a.lh.sub(&b.lh), stride)
                }
                BinaryOp::Mult => match (b.lh.to_const(), a.lh.to_const()) {
                    (Some(k), _) => (a.lh.mul_const(k), stride_scale(&a.stride, k)),
                    (None, Some(k)) => (b.lh.mul_const(k), stride_scale(&b.stride, k)),
                    (None, None) => (BaseLH::top(), BaseStride::top()),
                },
                BinaryOp::Ashift => match b.lh.to_const() {
                    Some(k) if (0..63).contains(&k) => {
                        let factor = 1 << k;
                        (a.lh.mul_const(factor), stride_scale(&a.stride, factor))
                    }
                    _ => (BaseLH::top(), BaseStride::top()),
                },
                _ => (BaseLH::top(), BaseStride::top()),
            };
            AbsVal { lh, stride, taint }
        }
        Expression::Compare { expr, .. } => {
            let inner = eval_depth(expr, exec, depth + 1);
            AbsVal {
                lh: BaseLH::top(),
                stride: BaseStride::top(),
                taint: inner.taint,
            }
        }
        Expression::NoType(_) | Expression::Any => AbsVal::top(),
    }
}

/// Addition over the induction lattice.
fn stride_plus(a: &BaseStride, b: &BaseStride) -> BaseStride {
    if let Some(c) = a.to_const() {
        return stride_offset(b, c);
    }
    if let Some(c) = b.to_const() {
        return stride_offset(a, c);
    }
    BaseStride::top()
}

/// Wrap a loaded term as the index of a fresh computed term.
fn indexed(base: Imm, stride: Imm, inner: StrideTerm) -> StrideTerm {
    StrideTerm {
        base,
        stride,
        width: 8,
        index: Box::new(BaseStride::Terms(vec![inner])),
        nmem: true,
    }
}

/// `value + c`: shift computed terms; a loaded term becomes the index of a
/// unit-stride term based at `c`, as does an unknown or dynamic value.
fn stride_offset(value: &BaseStride, c: Imm) -> BaseStride {
    match value {
        BaseStride::Terms(terms) => BaseStride::Terms(
            terms
                .iter()
                .map(|t| {
                    if t.nmem {
                        StrideTerm {
                            base: t.base.wrapping_add(c),
                            ..t.clone()
                        }
                    } else {
                        indexed(c, 1, t.clone())
                    }
                })
                .collect(),
        ),
        BaseStride::Top | BaseStride::Dynamic => BaseStride::Terms(vec![StrideTerm {
            base: c,
            stride: 1,
            width: 8,
            index: Box::new(value.clone()),
            nmem: true,
        }]),
        BaseStride::Bottom => BaseStride::constant(c),
    }
}

/// `value * k`: scale computed terms; a loaded term becomes the index of a
/// stride-`k` term based at zero, as does an unknown or dynamic value.
fn stride_scale(value: &BaseStride, k: Imm) -> BaseStride {
    if k == 0 {
        return BaseStride::constant(0);
    }
    match value {
        BaseStride::Terms(terms) => BaseStride::Terms(
            terms
                .iter()
                .map(|t| {
                    if t.nmem {
                        StrideTerm {
                            base: t.base.wrapping_mul(k),
                            stride: t.stride.wrapping_mul(k),
                            ..t.clone()
                        }
                    } else {
                        indexed(0, k, t.clone())
                    }
                })
                .collect(),
        ),
        BaseStride::Top | BaseStride::Dynamic => BaseStride::Terms(vec![StrideTerm {
            base: 0,
            stride: k,
            width: 8,
            index: Box::new(value.clone()),
            nmem: true,
        }]),
        BaseStride::Bottom => BaseStride::Bottom,
    }
}

/// Loading through a strided address turns each computed term into a
/// memory-resident table term of the load width.
fn load_stride(addr: &BaseStride, width: u8) -> BaseStride {
    match addr {
        BaseStride::Terms(terms) => {
            let loaded: Vec<StrideTerm> = terms
                .iter()
                .filter(|t| t.nmem)
                .map(|t| StrideTerm {
                    base: t.base,
                    stride: t.stride,
                    width,
                    index: t.index.clone(),
                    nmem: false,
                })
                .collect();
            if loaded.is_empty() {
                BaseStride::top()
            } else {
                BaseStride::Terms(loaded)
            }
        }
        _ => BaseStride::top(),
    }
}

/// Taint guard: log suspicious uses of possibly-uninitialised values.
pub fn check_taint(exec: &Exec, val: &AbsVal, what: &str) {
    if exec.state.config.taint && !val.taint.is_bottom() && !Taint::is_top(&val.taint) {
        log::trace!(
            "tainted value used as {} at {:#x}: {}",
            what,
            exec.insn.offset,
            val.taint
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::exec::{Exec, InsnCtx};
    use crate::analysis::state::{State, StateConfig};
    use crate::rtl::{const_int, mem, mult, plus, reg, Mode};

    fn exec_at(offset: Imm, len: Imm) -> Exec {
        let mut exec = Exec::new(State::new(StateConfig::default()));
        exec.insn = InsnCtx {
            offset,
            next_offset: offset + len,
            indirect_jump: false,
        };
        exec
    }

    #[test]
    fn ip_is_concrete() {
        let exec = exec_at(0x1100, 7);
        let e = plus(Mode::Di, reg(Mode::Di, Reg::Ip), const_int(0x20));
        let val = eval(&e, &exec);
        assert_eq!(val.lh.to_const(), Some(0x1127));
        assert_eq!(val.stride.to_const(), Some(0x1127));
    }

    #[test]
    fn dense_switch_load_produces_table_term() {
        // jmp *TAB(,%rax,8): mem:DI (plus (mult rax 8) TAB)
        let exec = exec_at(0x1180, 7);
        let e = mem(
            Mode::Di,
            plus(
                Mode::Di,
                mult(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(8)),
                const_int(0x3020),
            ),
        );
        let val = eval(&e, &exec);
        let terms = val.stride.terms();
        assert_eq!(terms.len(), 1);
        let t = &terms[0];
        assert_eq!(t.base, 0x3020);
        assert_eq!(t.stride, 8);
        assert_eq!(t.width, 8);
        assert!(!t.nmem);
        assert!(t.index.is_top() || t.index.is_dynamic());
    }

    #[test]
    fn argument_index_stays_dynamic() {
        // TAB + rdi*4, rdi is a call argument.
        let exec = exec_at(0x2000, 4);
        let e = plus(
            Mode::Di,
            mult(Mode::Di, reg(Mode::Di, Reg::Di), const_int(4)),
            const_int(0x4000),
        );
        let val = eval(&e, &exec);
        let terms = val.stride.terms();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].base, 0x4000);
        assert_eq!(terms[0].stride, 4);
        assert!(terms[0].index.is_dynamic());
        assert!(terms[0].nmem);
    }

    #[test]
    fn branches_join() {
        let exec = exec_at(0, 2);
        let e = Expression::IfElse {
            mode: Mode::Di,
            cmp: Box::new(Expression::NoType(String::from("cmp"))),
            on_true: Box::new(const_int(4)),
            on_false: Box::new(const_int(12)),
        };
        let val = eval(&e, &exec);
        assert_eq!(
            val.lh,
            BaseLH::Sym {
                base: 0,
                lo: 4,
                hi: 12
            }
        );
    }

    #[test]
    fn nested_table_index_recurses() {
        // *(B2 + 4 * *(B1 + rax)) : the outer term's index is structured.
        let exec = exec_at(0, 2);
        let inner = mem(
            Mode::Qi,
            plus(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(0x100)),
        );
        let outer = mem(
            Mode::Di,
            plus(
                Mode::Di,
                mult(Mode::Di, inner, const_int(4)),
                const_int(0x200),
            ),
        );
        let val = eval(&outer, &exec);
        let terms = val.stride.terms();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].base, 0x200);
        assert_eq!(terms[0].stride, 4);
        let index = terms[0].index.terms();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].base, 0x100);
        assert!(!index[0].nmem);
        assert_eq!(index[0].width, 1);
    }
}
