//! Parser for the lifter's RTL output.
//!
//! The lifter emits one GCC-style RTL S-expression per instruction, e.g.
//!
//! ```text
//! (set (reg:DI ax) (plus:DI (reg:DI ax) (const_int 1)))
//! (parallel [(set (reg:CCZ flags) ...) (set (reg:DI ax) ...)])
//! (set pc (if_then_else (eq (reg:CCZ flags) (const_int 0)) (label_ref 4512) (pc)))
//! ```
//!
//! A line that cannot be parsed is a lift failure; the caller decides
//! whether that aborts the program or degrades to a halt stub.

use crate::arch::Reg;
use crate::rtl::{
    Const, ConstKind, ConvOp, BinaryOp, CompareOp, ExitKind, Expression, Mode, Statement,
    UnaryOp,
};
use crate::Imm;

#[derive(Debug)]
enum Node {
    /// `(head arg ...)`
    List(String, Vec<Node>),
    /// `[node ...]`
    Vec(Vec<Node>),
    Atom(String),
}

struct Tokens<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(input: &'a str) -> Tokens<'a> {
        Tokens { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn atom(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == '(' || c == ')' || c == '[' || c == ']' {
                break;
            }
            self.pos += c.len_utf8();
        }
        self.input[start..self.pos].to_string()
    }

    fn node(&mut self) -> Option<Node> {
        self.skip_ws();
        match self.peek()? {
            '(' => {
                self.pos += 1;
                self.skip_ws();
                let head = self.atom();
                let mut args = Vec::new();
                loop {
                    self.skip_ws();
                    match self.peek()? {
                        ')' => {
                            self.pos += 1;
                            return Some(Node::List(head, args));
                        }
                        _ => args.push(self.node()?),
                    }
                }
            }
            '[' => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_ws();
                    match self.peek()? {
                        ']' => {
                            self.pos += 1;
                            return Some(Node::Vec(items));
                        }
                        _ => items.push(self.node()?),
                    }
                }
            }
            '"' => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '"' {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                let s = self.input[start..self.pos].to_string();
                if self.peek() == Some('"') {
                    self.pos += 1;
                }
                Some(Node::Atom(s))
            }
            _ => Some(Node::Atom(self.atom())),
        }
    }
}

/// Split `plus:DI` into the operator name and its mode.
fn split_mode(head: &str) -> (&str, Mode) {
    // GCC annotates memory flags as `mem/c`, `mem/u`; drop them.
    let head = head.split('/').next().unwrap_or(head);
    match head.split_once(':') {
        Some((name, suffix)) => (name, Mode::from_suffix(suffix).unwrap_or(Mode::None)),
        None => (head, Mode::None),
    }
}

fn parse_int(s: &str) -> Option<Imm> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("-0x")) {
        let v = Imm::from_str_radix(hex, 16).ok()?;
        Some(if s.starts_with('-') { -v } else { v })
    } else {
        s.parse::<Imm>().ok()
    }
}

fn unary_op(name: &str) -> Option<UnaryOp> {
    Some(match name {
        "neg" => UnaryOp::Neg,
        "not" => UnaryOp::Not,
        "abs" => UnaryOp::Abs,
        "sqrt" => UnaryOp::Sqrt,
        "clz" => UnaryOp::Clz,
        "ctz" => UnaryOp::Ctz,
        "bswap" => UnaryOp::Bswap,
        _ => return None,
    })
}

fn binary_op(name: &str) -> Option<BinaryOp> {
    Some(match name {
        "plus" => BinaryOp::Plus,
        "minus" => BinaryOp::Minus,
        "mult" => BinaryOp::Mult,
        "div" => BinaryOp::Div,
        "udiv" => BinaryOp::Udiv,
        "mod" => BinaryOp::Mod,
        "umod" => BinaryOp::Umod,
        "and" => BinaryOp::And,
        "ior" => BinaryOp::Ior,
        "xor" => BinaryOp::Xor,
        "ashift" => BinaryOp::Ashift,
        "ashiftrt" => BinaryOp::Ashiftrt,
        "lshiftrt" => BinaryOp::Lshiftrt,
        "rotate" => BinaryOp::Rotate,
        "rotatert" => BinaryOp::Rotatert,
        "compare" => BinaryOp::Compare,
        _ => return None,
    })
}

fn compare_op(name: &str) -> Option<CompareOp> {
    Some(match name {
        "eq" => CompareOp::Eq,
        "ne" => CompareOp::Ne,
        "gt" => CompareOp::Gt,
        "gtu" => CompareOp::Gtu,
        "ge" => CompareOp::Ge,
        "geu" => CompareOp::Geu,
        "lt" => CompareOp::Lt,
        "ltu" => CompareOp::Ltu,
        "le" => CompareOp::Le,
        "leu" => CompareOp::Leu,
        "unle" => CompareOp::Unle,
        "unlt" => CompareOp::Unlt,
        "uneq" => CompareOp::Uneq,
        "ltgt" => CompareOp::Ltgt,
        "ordered" => CompareOp::Ordered,
        "unordered" => CompareOp::Unordered,
        _ => return None,
    })
}

fn conv_op(name: &str) -> Option<ConvOp> {
    Some(match name {
        "zero_extract" => ConvOp::ZeroExtract,
        "sign_extract" => ConvOp::SignExtract,
        "truncate" => ConvOp::Truncate,
        "ss_truncate" => ConvOp::STruncate,
        "us_truncate" => ConvOp::UTruncate,
        "float" => ConvOp::SFloat,
        "unsigned_float" => ConvOp::UFloat,
        "fix" => ConvOp::Fix,
        "unsigned_fix" => ConvOp::UFix,
        "zero_extend" => ConvOp::ZeroExtend,
        "sign_extend" => ConvOp::SignExtend,
        "float_extend" => ConvOp::FloatExtend,
        "strict_low_part" => ConvOp::StrictLowPart,
        _ => return None,
    })
}

fn expression(node: &Node) -> Option<Expression> {
    match node {
        Node::Atom(s) => {
            if let Some(v) = parse_int(s) {
                return Some(Expression::Const(Const::int(v)));
            }
            Some(Expression::NoType(s.clone()))
        }
        Node::Vec(_) => None,
        Node::List(head, args) => {
            let (name, mode) = split_mode(head);
            match name {
                "const_int" => {
                    let v = match args.first()? {
                        Node::Atom(s) => parse_int(s)?,
                        _ => return None,
                    };
                    Some(Expression::Const(Const::int(v)))
                }
                "const_double" => Some(Expression::Const(Const {
                    kind: ConstKind::Double,
                    value: 0,
                })),
                "const_vector" => Some(Expression::Const(Const {
                    kind: ConstKind::Vector,
                    value: 0,
                })),
                "label_ref" | "code_label" => {
                    let v = match args.first()? {
                        Node::Atom(s) => parse_int(s)?,
                        Node::List(inner, _) => parse_int(inner)?,
                        _ => return None,
                    };
                    Some(Expression::Const(Const::int(v)))
                }
                "symbol_ref" => match args.first() {
                    Some(Node::Atom(s)) => match parse_int(s) {
                        Some(v) => Some(Expression::Const(Const::int(v))),
                        None => Some(Expression::NoType(s.clone())),
                    },
                    Some(Node::List(_, inner)) => match inner.first() {
                        Some(Node::Atom(s)) => Some(Expression::NoType(s.clone())),
                        _ => Some(Expression::NoType(String::from("symbol"))),
                    },
                    _ => Some(Expression::NoType(String::from("symbol"))),
                },
                "reg" => {
                    let r = match args.first()? {
                        Node::Atom(s) => Reg::from_name(s),
                        _ => return None,
                    };
                    Some(Expression::Reg(mode, r))
                }
                "mem" => Some(Expression::Mem(mode, Box::new(expression(args.first()?)?))),
                "subreg" => {
                    let expr = expression(args.first()?)?;
                    let byte = match args.get(1) {
                        Some(Node::Atom(s)) => parse_int(s)?,
                        _ => 0,
                    };
                    Some(Expression::SubReg {
                        mode,
                        expr: Box::new(expr),
                        byte,
                    })
                }
                "if_then_else" => {
                    let cmp = expression(args.first()?)?;
                    let on_true = expression(args.get(1)?)?;
                    let on_false = expression(args.get(2)?)?;
                    Some(Expression::IfElse {
                        mode,
                        cmp: Box::new(cmp),
                        on_true: Box::new(on_true),
                        on_false: Box::new(on_false),
                    })
                }
                // Auto-modified addresses: the analysis models the adjusted
                // base, the side effect is lifted separately.
                "pre_dec" | "pre_inc" | "post_dec" | "post_inc" | "pre_modify"
                | "post_modify" => expression(args.first()?),
                "pc" => Some(Expression::NoType(String::from("pc"))),
                _ => {
                    if let Some(op) = conv_op(name) {
                        let expr = expression(args.first()?)?;
                        let (size, pos) = match (args.get(1), args.get(2)) {
                            (Some(s), Some(p)) => (
                                Some(Box::new(expression(s)?)),
                                Some(Box::new(expression(p)?)),
                            ),
                            _ => (None, None),
                        };
                        return Some(Expression::Conversion {
                            op,
                            mode,
                            expr: Box::new(expr),
                            size,
                            pos,
                        });
                    }
                    if let Some(op) = unary_op(name) {
                        return Some(Expression::Unary {
                            op,
                            mode,
                            expr: Box::new(expression(args.first()?)?),
                        });
                    }
                    if let Some(op) = binary_op(name) {
                        return Some(Expression::Binary {
                            op,
                            mode,
                            lhs: Box::new(expression(args.first()?)?),
                            rhs: Box::new(expression(args.get(1)?)?),
                        });
                    }
                    if let Some(op) = compare_op(name) {
                        // Relational tests carry the flags operand first; a
                        // second operand is always the literal zero.
                        return Some(Expression::Compare {
                            op,
                            mode,
                            expr: Box::new(expression(args.first()?)?),
                        });
                    }
                    Some(Expression::NoType(name.to_string()))
                }
            }
        }
    }
}

fn statement(node: &Node) -> Option<Statement> {
    match node {
        Node::List(head, args) => {
            let (name, _) = split_mode(head);
            match name {
                "parallel" => {
                    let items = match args.first()? {
                        Node::Vec(items) => items,
                        _ => return None,
                    };
                    let stmts = items
                        .iter()
                        .map(statement)
                        .collect::<Option<Vec<Statement>>>()?;
                    Some(Statement::Parallel(stmts))
                }
                "sequence" => {
                    let items = match args.first()? {
                        Node::Vec(items) => items,
                        _ => return None,
                    };
                    let stmts = items
                        .iter()
                        .map(statement)
                        .collect::<Option<Vec<Statement>>>()?;
                    Some(Statement::Sequence(stmts))
                }
                "set" => Some(Statement::Assign {
                    dst: expression(args.first()?)?,
                    src: expression(args.get(1)?)?,
                }),
                "call" => Some(Statement::Call {
                    target: expression(args.first()?)?,
                }),
                "call_insn" => statement(args.first()?),
                "clobber" => Some(Statement::Clobber(expression(args.first()?)?)),
                "simple_return" | "return" => Some(Statement::Exit(ExitKind::Ret)),
                "halt" | "trap" => Some(Statement::Exit(ExitKind::Halt)),
                "nop" => Some(Statement::Nop),
                // Statements without a machine effect the analysis models.
                "use" | "unspec" | "unspec_volatile" | "prefetch" | "debug_insn"
                | "const" => Some(Statement::Nop),
                _ => None,
            }
        }
        Node::Atom(s) if s == "nop" => Some(Statement::Nop),
        _ => None,
    }
}

/// Parse one lifted line. `None` is a lift failure.
pub fn parse_statement(line: &str) -> Option<Statement> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut tokens = Tokens::new(line);
    let node = tokens.node()?;
    statement(&node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtl::{const_int, reg, MatchKind};

    #[test]
    fn parse_simple_assign() {
        let stmt = parse_statement("(set (reg:DI ax) (plus:DI (reg:DI ax) (const_int 1)))")
            .unwrap();
        match stmt {
            Statement::Assign { dst, src } => {
                assert_eq!(dst, reg(Mode::Di, Reg::Ax));
                assert_eq!(
                    src,
                    Expression::Binary {
                        op: BinaryOp::Plus,
                        mode: Mode::Di,
                        lhs: Box::new(reg(Mode::Di, Reg::Ax)),
                        rhs: Box::new(const_int(1)),
                    }
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_parallel_flags_update() {
        let stmt = parse_statement(
            "(parallel [(set (reg:CCZ flags) (compare:CCZ (reg:DI ax) (const_int 0))) \
             (set (reg:DI ax) (minus:DI (reg:DI ax) (const_int 8)))])",
        )
        .unwrap();
        match stmt {
            Statement::Parallel(stmts) => assert_eq!(stmts.len(), 2),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_conditional_jump() {
        let stmt = parse_statement(
            "(set pc (if_then_else (eq (reg:CCZ flags) (const_int 0)) (label_ref 4512) (pc)))",
        )
        .unwrap();
        match stmt {
            Statement::Assign { dst, src } => {
                assert_eq!(dst, Expression::NoType(String::from("pc")));
                match src {
                    Expression::IfElse {
                        on_true, on_false, ..
                    } => {
                        assert_eq!(*on_true, const_int(4512));
                        assert_eq!(*on_false, Expression::NoType(String::from("pc")));
                    }
                    other => panic!("unexpected source {:?}", other),
                }
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_indirect_jump_through_table() {
        let stmt =
            parse_statement("(set pc (mem:DI (plus:DI (mult:DI (reg:DI ax) (const_int 8)) (const_int 12320))))")
                .unwrap();
        match stmt {
            Statement::Assign { src, .. } => assert!(matches!(src, Expression::Mem(..))),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_call_and_exits() {
        assert!(matches!(
            parse_statement("(call (mem:QI (symbol_ref (\"abort\"))) (const_int 0))"),
            Some(Statement::Call { .. })
        ));
        assert_eq!(
            parse_statement("(simple_return)"),
            Some(Statement::Exit(ExitKind::Ret))
        );
        assert_eq!(parse_statement("(halt)"), Some(Statement::Exit(ExitKind::Halt)));
    }

    #[test]
    fn garbage_is_a_lift_failure() {
        assert_eq!(parse_statement("(set (reg:DI"), None);
        assert_eq!(parse_statement(""), None);
        assert_eq!(parse_statement("(frobnicate x)"), None);
    }

    #[test]
    fn display_round_trips_through_parser() {
        let text = "(set (reg:DI ax) (mem:DI (plus:DI (reg:DI bx) (const_int 16))))";
        let stmt = parse_statement(text).unwrap();
        let again = parse_statement(&stmt.to_string()).unwrap();
        assert!(stmt.equal(MatchKind::Strict, &again));
    }
}
