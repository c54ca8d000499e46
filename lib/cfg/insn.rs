//! A lifted native instruction.

use crate::cfg::BlockId;
use crate::rtl::{CompareOp, ExitKind, Expression, Statement};
use crate::Imm;
use std::fmt;

/// Condition attached to a CFG edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeCond {
    None,
    /// The branch comparison held.
    Taken(CompareOp),
    /// The branch comparison did not hold (fall-through of a conditional
    /// jump).
    NotTaken(CompareOp),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Derived {
    direct: bool,
    indirect: bool,
    call: bool,
    jump: bool,
    cond_jump: bool,
    ret: bool,
    halt: bool,
    empty: bool,
    target: Option<Imm>,
    cond: Option<CompareOp>,
}

/// One instruction: offset, lifted RTL root, raw bytes, and flags derived
/// from the RTL shape. `parent` is the owning block once placed.
#[derive(Clone, Debug)]
pub struct Insn {
    offset: Imm,
    stmt: Statement,
    raw: Vec<u8>,
    derived: Derived,
    pub(crate) parent: Option<BlockId>,
}

fn derive(stmt: &Statement, derived: &mut Derived) {
    match stmt {
        Statement::Parallel(stmts) | Statement::Sequence(stmts) => {
            for stmt in stmts {
                derive(stmt, derived);
            }
        }
        Statement::Call { target } => {
            derived.call = true;
            match target.simplify() {
                Expression::Const(c) => derived.target = c.to_int(),
                Expression::Mem(_, addr) => {
                    if let Expression::Const(c) = addr.simplify() {
                        derived.target = c.to_int();
                    } else {
                        derived.indirect = true;
                    }
                }
                _ => derived.indirect = true,
            }
            derived.direct = derived.target.is_some();
        }
        Statement::Assign { dst, src } => {
            if let Expression::NoType(name) = dst.simplify() {
                if name == "pc" {
                    derived.jump = true;
                    match src.simplify() {
                        Expression::Const(c) => {
                            derived.direct = true;
                            derived.target = c.to_int();
                        }
                        Expression::IfElse {
                            cmp,
                            on_true,
                            on_false,
                            ..
                        } => {
                            derived.cond_jump = true;
                            derived.direct = true;
                            if let Expression::Compare { op, .. } = cmp.as_ref() {
                                derived.cond = Some(*op);
                            }
                            // One arm is the taken target, the other the
                            // fall-through `(pc)`.
                            match (on_true.as_ref(), on_false.as_ref()) {
                                (Expression::Const(c), _) => derived.target = c.to_int(),
                                (_, Expression::Const(c)) => derived.target = c.to_int(),
                                _ => {
                                    derived.direct = false;
                                    derived.indirect = true;
                                }
                            }
                        }
                        _ => derived.indirect = true,
                    }
                }
            }
        }
        Statement::Exit(ExitKind::Ret) => derived.ret = true,
        Statement::Exit(ExitKind::Halt) => derived.halt = true,
        Statement::Nop => {}
        Statement::Clobber(_) => {}
    }
}

impl Insn {
    pub fn new(offset: Imm, stmt: Statement, raw: Vec<u8>) -> Insn {
        let mut derived = Derived::default();
        derive(&stmt, &mut derived);
        derived.empty = matches!(stmt, Statement::Nop);
        Insn {
            offset,
            stmt,
            raw,
            derived,
            parent: None,
        }
    }

    pub fn offset(&self) -> Imm {
        self.offset
    }

    pub fn next_offset(&self) -> Imm {
        self.offset + self.raw.len() as Imm
    }

    pub fn stmt(&self) -> &Statement {
        &self.stmt
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Controlled in-place replacement: lift failures and non-returning
    /// calls degrade to a halt.
    pub fn replace(&mut self, stmt: Statement, raw: Vec<u8>) {
        let mut derived = Derived::default();
        derive(&stmt, &mut derived);
        derived.empty = matches!(stmt, Statement::Nop);
        self.stmt = stmt;
        self.raw = raw;
        self.derived = derived;
    }

    pub fn direct(&self) -> bool {
        self.derived.direct
    }

    pub fn indirect(&self) -> bool {
        self.derived.indirect
    }

    pub fn call(&self) -> bool {
        self.derived.call
    }

    pub fn jump(&self) -> bool {
        self.derived.jump
    }

    pub fn cond_jump(&self) -> bool {
        self.derived.cond_jump
    }

    pub fn ret(&self) -> bool {
        self.derived.ret
    }

    pub fn transfer(&self) -> bool {
        self.derived.call || self.derived.jump || self.derived.ret
    }

    pub fn halt(&self) -> bool {
        self.derived.halt
    }

    pub fn empty(&self) -> bool {
        self.derived.empty
    }

    /// An indirect jump that dispatches through a computed target.
    pub fn indirect_jump(&self) -> bool {
        self.derived.indirect && self.derived.jump
    }

    /// The direct target and the fall-through, where applicable.
    pub fn direct_target(&self) -> (Option<Imm>, Imm) {
        (self.derived.target, self.next_offset())
    }

    /// Edge conditions for the taken target and the fall-through.
    pub fn cond_op(&self) -> (EdgeCond, EdgeCond) {
        match self.derived.cond {
            Some(op) if self.derived.cond_jump => (EdgeCond::Taken(op), EdgeCond::NotTaken(op)),
            _ => (EdgeCond::None, EdgeCond::None),
        }
    }

    pub fn preset_regs(&self) -> u64 {
        self.stmt.preset_regs()
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x} {}", self.offset, self.stmt)
    }
}
