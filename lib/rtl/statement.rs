//! RTL statements.

use crate::rtl::{Expression, MatchKind};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ExitKind {
    Ret,
    Halt,
}

/// One lifted statement. An instruction's root is always a `Statement`;
/// compound instructions lift to `Parallel` or `Sequence`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Statement {
    Parallel(Vec<Statement>),
    Sequence(Vec<Statement>),
    Assign {
        dst: Expression,
        src: Expression,
    },
    Call {
        target: Expression,
    },
    Clobber(Expression),
    Exit(ExitKind),
    Nop,
}

impl Statement {
    /// Structural comparison under a match kind; see `Expression::equal`.
    pub fn equal(&self, kind: MatchKind, pat: &Statement) -> bool {
        use Statement::*;
        if kind == MatchKind::Strict {
            return self == pat;
        }
        match (self, pat) {
            (Parallel(a), Parallel(b)) | (Sequence(a), Sequence(b)) => {
                kind == MatchKind::Opcode
                    || (a.len() == b.len()
                        && a.iter().zip(b.iter()).all(|(x, y)| x.equal(kind, y)))
            }
            (Assign { dst: da, src: sa }, Assign { dst: db, src: sb }) => {
                kind == MatchKind::Opcode || (da.equal(kind, db) && sa.equal(kind, sb))
            }
            (Call { target: a }, Call { target: b }) => {
                kind == MatchKind::Opcode || a.equal(kind, b)
            }
            (Clobber(a), Clobber(b)) => kind == MatchKind::Opcode || a.equal(kind, b),
            (Exit(a), Exit(b)) => kind == MatchKind::Opcode || a == b,
            (Nop, Nop) => true,
            _ => false,
        }
    }

    /// All expression subtrees matching the pattern, across every operand of
    /// this statement.
    pub fn find(&self, kind: MatchKind, pat: &Expression) -> Vec<&Expression> {
        let mut found = Vec::new();
        self.find_into(kind, pat, &mut found);
        found
    }

    fn find_into<'a>(
        &'a self,
        kind: MatchKind,
        pat: &Expression,
        found: &mut Vec<&'a Expression>,
    ) {
        match self {
            Statement::Parallel(stmts) | Statement::Sequence(stmts) => {
                for stmt in stmts {
                    stmt.find_into(kind, pat, found);
                }
            }
            Statement::Assign { dst, src } => {
                dst.find_into(kind, pat, found);
                src.find_into(kind, pat, found);
            }
            Statement::Call { target } => target.find_into(kind, pat, found),
            Statement::Clobber(expr) => expr.find_into(kind, pat, found),
            Statement::Exit(_) | Statement::Nop => {}
        }
    }

    /// Whether `sub` occurs in any operand (strict comparison).
    pub fn contains(&self, sub: &Expression) -> bool {
        !self.find(MatchKind::Strict, sub).is_empty()
    }

    /// Bitmask of the general registers this statement writes. Registers
    /// with an index beyond the mask width are not tracked.
    pub fn preset_regs(&self) -> u64 {
        match self {
            Statement::Parallel(stmts) | Statement::Sequence(stmts) => stmts
                .iter()
                .fold(0, |mask, stmt| mask | stmt.preset_regs()),
            Statement::Assign { dst, .. } => reg_bit(dst),
            Statement::Clobber(expr) => reg_bit(expr),
            Statement::Call { .. } | Statement::Exit(_) | Statement::Nop => 0,
        }
    }
}

fn reg_bit(dst: &Expression) -> u64 {
    match dst.simplify() {
        Expression::Reg(_, reg) => {
            let index = *reg as u32;
            if index < 64 {
                1 << index
            } else {
                0
            }
        }
        _ => 0,
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Statement::Parallel(stmts) => {
                write!(f, "(parallel [")?;
                for (i, stmt) in stmts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", stmt)?;
                }
                write!(f, "])")
            }
            Statement::Sequence(stmts) => {
                write!(f, "(sequence [")?;
                for (i, stmt) in stmts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", stmt)?;
                }
                write!(f, "])")
            }
            Statement::Assign { dst, src } => write!(f, "(set {} {})", dst, src),
            Statement::Call { target } => write!(f, "(call {} (const_int 0))", target),
            Statement::Clobber(expr) => write!(f, "(clobber {})", expr),
            Statement::Exit(ExitKind::Ret) => write!(f, "(simple_return)"),
            Statement::Exit(ExitKind::Halt) => write!(f, "(halt)"),
            Statement::Nop => write!(f, "(nop)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Reg;
    use crate::rtl::{const_int, mem, plus, reg, Mode};

    fn assign(dst: Expression, src: Expression) -> Statement {
        Statement::Assign { dst, src }
    }

    #[test]
    fn preset_regs_unions_parallel_writes() {
        let stmt = Statement::Parallel(vec![
            assign(reg(Mode::Di, Reg::Ax), const_int(1)),
            assign(reg(Mode::Di, Reg::Cx), const_int(2)),
            Statement::Clobber(reg(Mode::Di, Reg::Dx)),
        ]);
        let mask = stmt.preset_regs();
        assert_ne!(mask & (1 << Reg::Ax as u32), 0);
        assert_ne!(mask & (1 << Reg::Cx as u32), 0);
        assert_ne!(mask & (1 << Reg::Dx as u32), 0);
        assert_eq!(mask & (1 << Reg::Bx as u32), 0);
    }

    #[test]
    fn memory_writes_do_not_preset() {
        let stmt = assign(mem(Mode::Di, reg(Mode::Di, Reg::Sp)), const_int(0));
        assert_eq!(stmt.preset_regs(), 0);
    }

    #[test]
    fn statement_find_descends_operands() {
        let pat = plus(Mode::None, reg(Mode::None, Reg::Ip), Expression::Any);
        let stmt = assign(
            reg(Mode::Di, Reg::Ax),
            plus(Mode::Di, reg(Mode::Di, Reg::Ip), const_int(0x80)),
        );
        assert_eq!(stmt.find(MatchKind::Partial, &pat).len(), 1);
    }

    #[test]
    fn opcode_match_ignores_operands() {
        let a = assign(reg(Mode::Di, Reg::Ax), const_int(1));
        let b = assign(reg(Mode::Di, Reg::Bx), const_int(9));
        assert!(a.equal(MatchKind::Opcode, &b));
        assert!(!a.equal(MatchKind::Relaxed, &b));
    }
}
