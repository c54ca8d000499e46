//! RTL expressions.
//!
//! An `Expression` is one node of the tree the external lifter emits for a
//! native instruction. Expressions are pure syntax; evaluation against an
//! abstract state lives in `analysis::eval`.

use crate::arch::Reg;
use crate::rtl::Mode;
use crate::Imm;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How two RTL trees are compared.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchKind {
    /// Node tag only.
    Opcode,
    /// Pattern holes (`Expression::Any`, `*Op::Any`, `ConstKind::Any`) match
    /// anything; modes are ignored.
    Partial,
    /// Same shape and operators; modes are ignored.
    Relaxed,
    /// Identical, including modes and operands.
    Strict,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ConstKind {
    Integer,
    Double,
    Vector,
    Any,
}

/// A literal operand. Doubles and vectors carry no value the analysis can
/// use; only their presence matters.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Const {
    pub kind: ConstKind,
    pub value: Imm,
}

impl Const {
    pub fn int(value: Imm) -> Const {
        Const {
            kind: ConstKind::Integer,
            value,
        }
    }

    pub fn to_int(&self) -> Option<Imm> {
        match self.kind {
            ConstKind::Integer => Some(self.value),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Sqrt,
    Clz,
    Ctz,
    Bswap,
    Any,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum BinaryOp {
    Plus,
    Minus,
    Mult,
    Div,
    Udiv,
    Mod,
    Umod,
    And,
    Ior,
    Xor,
    Ashift,
    Ashiftrt,
    Lshiftrt,
    Rotate,
    Rotatert,
    Compare,
    Any,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gtu,
    Ge,
    Geu,
    Lt,
    Ltu,
    Le,
    Leu,
    Unle,
    Unlt,
    Uneq,
    Ltgt,
    Ordered,
    Unordered,
    Any,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ConvOp {
    ZeroExtract,
    SignExtract,
    Truncate,
    STruncate,
    UTruncate,
    SFloat,
    UFloat,
    Fix,
    UFix,
    ZeroExtend,
    SignExtend,
    FloatExtend,
    StrictLowPart,
    Any,
}

/// An RTL expression tree.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Expression {
    Const(Const),
    Reg(Mode, Reg),
    Mem(Mode, Box<Expression>),
    SubReg {
        mode: Mode,
        expr: Box<Expression>,
        byte: Imm,
    },
    IfElse {
        mode: Mode,
        cmp: Box<Expression>,
        on_true: Box<Expression>,
        on_false: Box<Expression>,
    },
    Conversion {
        op: ConvOp,
        mode: Mode,
        expr: Box<Expression>,
        size: Option<Box<Expression>>,
        pos: Option<Box<Expression>>,
    },
    Unary {
        op: UnaryOp,
        mode: Mode,
        expr: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        mode: Mode,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        mode: Mode,
        expr: Box<Expression>,
    },
    /// A leaf the parser recognised but the analysis does not model
    /// (`pc`, `(symbol_ref ..)`, fence notes, ...).
    NoType(String),
    /// A pattern hole. Never produced by the parser.
    Any,
}

impl Expression {
    /// The mode of the value this expression produces.
    pub fn mode(&self) -> Mode {
        match self {
            Expression::Reg(mode, _)
            | Expression::Mem(mode, _)
            | Expression::SubReg { mode, .. }
            | Expression::IfElse { mode, .. }
            | Expression::Conversion { mode, .. }
            | Expression::Unary { mode, .. }
            | Expression::Binary { mode, .. }
            | Expression::Compare { mode, .. } => *mode,
            Expression::Const(_) | Expression::NoType(_) | Expression::Any => Mode::None,
        }
    }

    pub fn mode_size(&self) -> u8 {
        self.mode().size()
    }

    /// Peel wrappers that do not change the assigned location:
    /// `strict_low_part` and width-only `subreg` around a register.
    pub fn simplify(&self) -> &Expression {
        match self {
            Expression::Conversion {
                op: ConvOp::StrictLowPart,
                expr,
                ..
            } => expr.simplify(),
            Expression::SubReg { expr, .. } => expr.simplify(),
            _ => self,
        }
    }

    /// Evaluate a pure-constant subtree.
    pub fn const_value(&self) -> Option<Imm> {
        match self {
            Expression::Const(c) => c.to_int(),
            Expression::Unary {
                op: UnaryOp::Neg,
                expr,
                ..
            } => expr.const_value().map(|v| v.wrapping_neg()),
            Expression::Binary { op, lhs, rhs, .. } => {
                let a = lhs.const_value()?;
                let b = rhs.const_value()?;
                match op {
                    BinaryOp::Plus => Some(a.wrapping_add(b)),
                    BinaryOp::Minus => Some(a.wrapping_sub(b)),
                    BinaryOp::Mult => Some(a.wrapping_mul(b)),
                    BinaryOp::And => Some(a & b),
                    BinaryOp::Ior => Some(a | b),
                    BinaryOp::Xor => Some(a ^ b),
                    BinaryOp::Ashift => Some(a.wrapping_shl(b as u32)),
                    BinaryOp::Ashiftrt => Some(a.wrapping_shr(b as u32)),
                    BinaryOp::Lshiftrt => Some(((a as u64).wrapping_shr(b as u32)) as Imm),
                    _ => None,
                }
            }
            Expression::Conversion {
                op: ConvOp::ZeroExtend | ConvOp::SignExtend | ConvOp::Truncate,
                expr,
                ..
            } => expr.const_value(),
            _ => None,
        }
    }

    /// Structural comparison under a match kind. `pat` is the pattern side;
    /// holes are only honoured there.
    pub fn equal(&self, kind: MatchKind, pat: &Expression) -> bool {
        use Expression::*;
        if kind == MatchKind::Strict {
            return self == pat;
        }
        if kind == MatchKind::Partial && matches!(pat, Any) {
            return true;
        }
        match (self, pat) {
            (Const(a), Const(b)) => match kind {
                MatchKind::Opcode => true,
                MatchKind::Partial => {
                    b.kind == ConstKind::Any || (a.kind == b.kind && a.value == b.value)
                }
                _ => a.kind == b.kind && a.value == b.value,
            },
            (Reg(_, a), Reg(_, b)) => kind == MatchKind::Opcode || a == b,
            (Mem(_, a), Mem(_, b)) => kind == MatchKind::Opcode || a.equal(kind, b),
            (
                SubReg {
                    expr: ea, byte: ba, ..
                },
                SubReg {
                    expr: eb, byte: bb, ..
                },
            ) => kind == MatchKind::Opcode || (ba == bb && ea.equal(kind, eb)),
            (
                IfElse {
                    cmp: ca,
                    on_true: ta,
                    on_false: fa,
                    ..
                },
                IfElse {
                    cmp: cb,
                    on_true: tb,
                    on_false: fb,
                    ..
                },
            ) => {
                kind == MatchKind::Opcode
                    || (ca.equal(kind, cb) && ta.equal(kind, tb) && fa.equal(kind, fb))
            }
            (
                Conversion {
                    op: oa, expr: ea, ..
                },
                Conversion {
                    op: ob, expr: eb, ..
                },
            ) => {
                let op_ok = *ob == ConvOp::Any && kind == MatchKind::Partial || oa == ob;
                kind == MatchKind::Opcode || (op_ok && ea.equal(kind, eb))
            }
            (Unary { op: oa, expr: ea, .. }, Unary { op: ob, expr: eb, .. }) => {
                let op_ok = *ob == UnaryOp::Any && kind == MatchKind::Partial || oa == ob;
                kind == MatchKind::Opcode || (op_ok && ea.equal(kind, eb))
            }
            (
                Binary {
                    op: oa,
                    lhs: la,
                    rhs: ra,
                    ..
                },
                Binary {
                    op: ob,
                    lhs: lb,
                    rhs: rb,
                    ..
                },
            ) => {
                let op_ok = *ob == BinaryOp::Any && kind == MatchKind::Partial || oa == ob;
                kind == MatchKind::Opcode
                    || (op_ok && la.equal(kind, lb) && ra.equal(kind, rb))
            }
            (Compare { op: oa, expr: ea, .. }, Compare { op: ob, expr: eb, .. }) => {
                let op_ok = *ob == CompareOp::Any && kind == MatchKind::Partial || oa == ob;
                kind == MatchKind::Opcode || (op_ok && ea.equal(kind, eb))
            }
            (NoType(a), NoType(b)) => kind == MatchKind::Opcode || a == b,
            (Any, Any) => true,
            _ => false,
        }
    }

    /// All subtrees (including `self`) matching the pattern.
    pub fn find(&self, kind: MatchKind, pat: &Expression) -> Vec<&Expression> {
        let mut found = Vec::new();
        self.find_into(kind, pat, &mut found);
        found
    }

    pub(crate) fn find_into<'a>(
        &'a self,
        kind: MatchKind,
        pat: &Expression,
        found: &mut Vec<&'a Expression>,
    ) {
        if self.equal(kind, pat) {
            found.push(self);
        }
        match self {
            Expression::Mem(_, addr) => addr.find_into(kind, pat, found),
            Expression::SubReg { expr, .. }
            | Expression::Unary { expr, .. }
            | Expression::Compare { expr, .. } => expr.find_into(kind, pat, found),
            Expression::IfElse {
                cmp,
                on_true,
                on_false,
                ..
            } => {
                cmp.find_into(kind, pat, found);
                on_true.find_into(kind, pat, found);
                on_false.find_into(kind, pat, found);
            }
            Expression::Conversion {
                expr, size, pos, ..
            } => {
                expr.find_into(kind, pat, found);
                if let Some(size) = size {
                    size.find_into(kind, pat, found);
                }
                if let Some(pos) = pos {
                    pos.find_into(kind, pat, found);
                }
            }
            Expression::Binary { lhs, rhs, .. } => {
                lhs.find_into(kind, pat, found);
                rhs.find_into(kind, pat, found);
            }
            Expression::Const(_)
            | Expression::Reg(..)
            | Expression::NoType(_)
            | Expression::Any => {}
        }
    }

    /// Whether `sub` occurs anywhere in this tree (strict comparison).
    pub fn contains(&self, sub: &Expression) -> bool {
        !self.find(MatchKind::Strict, sub).is_empty()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expression::Const(c) => match c.kind {
                ConstKind::Integer => write!(f, "(const_int {})", c.value),
                ConstKind::Double => write!(f, "(const_double)"),
                ConstKind::Vector => write!(f, "(const_vector)"),
                ConstKind::Any => write!(f, "(const)"),
            },
            Expression::Reg(mode, reg) => write!(f, "(reg{} {})", mode, reg),
            Expression::Mem(mode, addr) => write!(f, "(mem{} {})", mode, addr),
            Expression::SubReg { mode, expr, byte } => {
                write!(f, "(subreg{} {} {})", mode, expr, byte)
            }
            Expression::IfElse {
                mode,
                cmp,
                on_true,
                on_false,
            } => write!(f, "(if_then_else{} {} {} {})", mode, cmp, on_true, on_false),
            Expression::Conversion {
                op,
                mode,
                expr,
                size,
                pos,
            } => {
                let name = conv_op_name(*op);
                match (size, pos) {
                    (Some(size), Some(pos)) => {
                        write!(f, "({}{} {} {} {})", name, mode, expr, size, pos)
                    }
                    _ => write!(f, "({}{} {})", name, mode, expr),
                }
            }
            Expression::Unary { op, mode, expr } => {
                write!(f, "({}{} {})", unary_op_name(*op), mode, expr)
            }
            Expression::Binary { op, mode, lhs, rhs } => {
                write!(f, "({}{} {} {})", binary_op_name(*op), mode, lhs, rhs)
            }
            Expression::Compare { op, mode, expr } => {
                write!(f, "({}{} {})", compare_op_name(*op), mode, expr)
            }
            Expression::NoType(s) => write!(f, "{}", s),
            Expression::Any => write!(f, "_"),
        }
    }
}

pub(crate) fn unary_op_name(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Not => "not",
        UnaryOp::Abs => "abs",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Clz => "clz",
        UnaryOp::Ctz => "ctz",
        UnaryOp::Bswap => "bswap",
        UnaryOp::Any => "",
    }
}

pub(crate) fn binary_op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Plus => "plus",
        BinaryOp::Minus => "minus",
        BinaryOp::Mult => "mult",
        BinaryOp::Div => "div",
        BinaryOp::Udiv => "udiv",
        BinaryOp::Mod => "mod",
        BinaryOp::Umod => "umod",
        BinaryOp::And => "and",
        BinaryOp::Ior => "ior",
        BinaryOp::Xor => "xor",
        BinaryOp::Ashift => "ashift",
        BinaryOp::Ashiftrt => "ashiftrt",
        BinaryOp::Lshiftrt => "lshiftrt",
        BinaryOp::Rotate => "rotate",
        BinaryOp::Rotatert => "rotatert",
        BinaryOp::Compare => "compare",
        BinaryOp::Any => "",
    }
}

pub(crate) fn compare_op_name(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Gt => "gt",
        CompareOp::Gtu => "gtu",
        CompareOp::Ge => "ge",
        CompareOp::Geu => "geu",
        CompareOp::Lt => "lt",
        CompareOp::Ltu => "ltu",
        CompareOp::Le => "le",
        CompareOp::Leu => "leu",
        CompareOp::Unle => "unle",
        CompareOp::Unlt => "unlt",
        CompareOp::Uneq => "uneq",
        CompareOp::Ltgt => "ltgt",
        CompareOp::Ordered => "ordered",
        CompareOp::Unordered => "unordered",
        CompareOp::Any => "",
    }
}

pub(crate) fn conv_op_name(op: ConvOp) -> &'static str {
    match op {
        ConvOp::ZeroExtract => "zero_extract",
        ConvOp::SignExtract => "sign_extract",
        ConvOp::Truncate => "truncate",
        ConvOp::STruncate => "ss_truncate",
        ConvOp::UTruncate => "us_truncate",
        ConvOp::SFloat => "float",
        ConvOp::UFloat => "unsigned_float",
        ConvOp::Fix => "fix",
        ConvOp::UFix => "unsigned_fix",
        ConvOp::ZeroExtend => "zero_extend",
        ConvOp::SignExtend => "sign_extend",
        ConvOp::FloatExtend => "float_extend",
        ConvOp::StrictLowPart => "strict_low_part",
        ConvOp::Any => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtl::{const_int, mem, plus, reg};

    #[test]
    fn clone_is_strict_equal() {
        let e = mem(
            Mode::Di,
            plus(
                Mode::Di,
                reg(Mode::Di, Reg::Ax),
                const_int(0x3020),
            ),
        );
        let c = e.clone();
        assert!(e.equal(MatchKind::Strict, &c));
    }

    #[test]
    fn partial_holes_match_anything() {
        let e = plus(Mode::Di, reg(Mode::Di, Reg::Ip), const_int(0x40));
        let pat = plus(Mode::None, reg(Mode::None, Reg::Ip), Expression::Any);
        assert!(e.equal(MatchKind::Partial, &pat));
        assert!(!e.equal(MatchKind::Relaxed, &pat));
        assert_eq!(e.find(MatchKind::Partial, &pat).len(), 1);
    }

    #[test]
    fn find_iff_equal_somewhere() {
        let pat = reg(Mode::None, Reg::Bx);
        let tree = mem(Mode::Di, plus(Mode::Di, reg(Mode::Di, Reg::Bx), const_int(8)));
        assert_eq!(tree.find(MatchKind::Partial, &pat).len(), 1);
        let other = mem(Mode::Di, reg(Mode::Di, Reg::Cx));
        assert!(other.find(MatchKind::Partial, &pat).is_empty());
    }

    #[test]
    fn contains_is_strict_find() {
        let sub = const_int(8);
        let tree = plus(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(8));
        assert!(tree.contains(&sub));
        assert!(!tree.contains(&const_int(9)));
    }

    #[test]
    fn relaxed_ignores_modes() {
        let a = plus(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(1));
        let b = plus(Mode::Si, reg(Mode::Qi, Reg::Ax), const_int(1));
        assert!(a.equal(MatchKind::Relaxed, &b));
        assert!(!a.equal(MatchKind::Strict, &b));
    }

    #[test]
    fn const_folding() {
        let e = plus(
            Mode::Di,
            const_int(0x1000),
            Expression::Binary {
                op: BinaryOp::Mult,
                mode: Mode::Di,
                lhs: Box::new(const_int(4)),
                rhs: Box::new(const_int(8)),
            },
        );
        assert_eq!(e.const_value(), Some(0x1020));
        assert_eq!(reg(Mode::Di, Reg::Ax).const_value(), None);
    }

    #[test]
    fn simplify_peels_strict_low_part() {
        let e = Expression::Conversion {
            op: ConvOp::StrictLowPart,
            mode: Mode::Si,
            expr: Box::new(Expression::SubReg {
                mode: Mode::Si,
                expr: Box::new(reg(Mode::Di, Reg::Ax)),
                byte: 0,
            }),
            size: None,
            pos: None,
        };
        assert_eq!(e.simplify(), &reg(Mode::Di, Reg::Ax));
    }
}
