//! x86-64 architecture tables.
//!
//! Register names follow the lifter's spelling (no width prefix; width is
//! carried by the expression mode). Calling-convention sets are the System V
//! AMD64 ABI.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of machine registers known to the analysis, the unknown register
/// included.
pub const NUM_REG: usize = 62;

/// An x86-64 register.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[repr(u8)]
pub enum Reg {
    Unknown,
    Ax,
    Bx,
    Cx,
    Dx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Ip,
    Flags,
    Es,
    Fs,
    Gs,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
    Xmm16,
    Xmm17,
    Xmm18,
    Xmm19,
    Xmm20,
    Xmm21,
    Xmm22,
    Xmm23,
    Xmm24,
    Xmm25,
    Xmm26,
    Xmm27,
    Xmm28,
    Xmm29,
    Xmm30,
    Xmm31,
    St,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,
}

pub const STACK_PTR: Reg = Reg::Sp;
pub const FRAME_PTR: Reg = Reg::Bp;
pub const INSN_PTR: Reg = Reg::Ip;
pub const FLAGS: Reg = Reg::Flags;

/// Encoding of a lone `hlt`, used when an instruction is rewritten to a halt.
pub const HLT_BYTES: [u8; 1] = [0xf4];

const REG_NAMES: [(&str, Reg); 61] = [
    ("ax", Reg::Ax),
    ("bx", Reg::Bx),
    ("cx", Reg::Cx),
    ("dx", Reg::Dx),
    ("sp", Reg::Sp),
    ("bp", Reg::Bp),
    ("si", Reg::Si),
    ("di", Reg::Di),
    ("r8", Reg::R8),
    ("r9", Reg::R9),
    ("r10", Reg::R10),
    ("r11", Reg::R11),
    ("r12", Reg::R12),
    ("r13", Reg::R13),
    ("r14", Reg::R14),
    ("r15", Reg::R15),
    ("ip", Reg::Ip),
    ("flags", Reg::Flags),
    ("es", Reg::Es),
    ("fs", Reg::Fs),
    ("gs", Reg::Gs),
    ("xmm0", Reg::Xmm0),
    ("xmm1", Reg::Xmm1),
    ("xmm2", Reg::Xmm2),
    ("xmm3", Reg::Xmm3),
    ("xmm4", Reg::Xmm4),
    ("xmm5", Reg::Xmm5),
    ("xmm6", Reg::Xmm6),
    ("xmm7", Reg::Xmm7),
    ("xmm8", Reg::Xmm8),
    ("xmm9", Reg::Xmm9),
    ("xmm10", Reg::Xmm10),
    ("xmm11", Reg::Xmm11),
    ("xmm12", Reg::Xmm12),
    ("xmm13", Reg::Xmm13),
    ("xmm14", Reg::Xmm14),
    ("xmm15", Reg::Xmm15),
    ("xmm16", Reg::Xmm16),
    ("xmm17", Reg::Xmm17),
    ("xmm18", Reg::Xmm18),
    ("xmm19", Reg::Xmm19),
    ("xmm20", Reg::Xmm20),
    ("xmm21", Reg::Xmm21),
    ("xmm22", Reg::Xmm22),
    ("xmm23", Reg::Xmm23),
    ("xmm24", Reg::Xmm24),
    ("xmm25", Reg::Xmm25),
    ("xmm26", Reg::Xmm26),
    ("xmm27", Reg::Xmm27),
    ("xmm28", Reg::Xmm28),
    ("xmm29", Reg::Xmm29),
    ("xmm30", Reg::Xmm30),
    ("xmm31", Reg::Xmm31),
    ("st", Reg::St),
    ("st1", Reg::St1),
    ("st2", Reg::St2),
    ("st3", Reg::St3),
    ("st4", Reg::St4),
    ("st5", Reg::St5),
    ("st6", Reg::St6),
    ("st7", Reg::St7),
];

/// Argument-passing registers of the System V AMD64 ABI (r10 included for
/// the static-chain slot).
pub const CALL_ARGS: [Reg; 23] = [
    Reg::Di,
    Reg::Si,
    Reg::Dx,
    Reg::Cx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
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

pub const CALLEE_SAVED: [Reg; 6] = [Reg::Bx, Reg::Bp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

pub const RETURN_VALUE: [Reg; 1] = [Reg::Ax];

impl Reg {
    /// Parse a register from the lifter's spelling. Unknown spellings map to
    /// `Reg::Unknown` rather than failing; the lifter emits names the
    /// analysis does not track (e.g. mask registers).
    pub fn from_name(name: &str) -> Reg {
        REG_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| *r)
            .unwrap_or(Reg::Unknown)
    }

    pub fn name(&self) -> &'static str {
        REG_NAMES
            .iter()
            .find(|(_, r)| r == self)
            .map(|(n, _)| *n)
            .unwrap_or("")
    }

    pub fn is_call_arg(&self) -> bool {
        CALL_ARGS.contains(self)
    }

    pub fn is_callee_saved(&self) -> bool {
        CALLEE_SAVED.contains(self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Classify an instruction's raw bytes as a function-prologue component.
///
/// Returns 2 for a frame push (`push rbx/rbp`, `push r12..r15`), 1 for stack
/// frame setup (`mov rbp,rsp`, `sub rsp,k`), 0 otherwise.
pub fn prolog(raw: &[u8]) -> u8 {
    match raw.len() {
        1 => {
            if raw[0] == 0x53 || raw[0] == 0x55 {
                2
            } else {
                0
            }
        }
        2 => {
            if raw[0] == 0x41 && (0x54..=0x57).contains(&raw[1]) {
                2
            } else {
                0
            }
        }
        n if n >= 3 => {
            if raw[0] == 0x48
                && ((raw[1] == 0x89 && raw[2] == 0xe5)
                    || (raw[1] == 0x83 && raw[2] == 0xec)
                    || (raw[1] == 0x81 && raw[2] == 0xec))
            {
                1
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Library functions that never return to their call site.
pub const NORETURN_DEFINITE: [&str; 47] = [
    "abort",
    "_exit",
    "exit",
    "xexit",
    "__stack_chk_fail",
    "__assert_fail",
    "__fortify_fail",
    "__chk_fail",
    "err",
    "errx",
    "verr",
    "verrx",
    "g_assertion_message_expr",
    "longjmp",
    "__longjmp",
    "__longjmp_chk",
    "_Unwind_Resume",
    "_ZSt17__throw_bad_allocv",
    "_ZSt20__throw_length_errorPKc",
    "__f90_stop",
    "fancy_abort",
    "ExitProcess",
    "_ZSt20__throw_out_of_rangePKc",
    "__cxa_throw",
    "_ZSt21__throw_runtime_errorPKc",
    "_ZSt9terminatev",
    "_gfortran_os_error",
    "_ZSt24__throw_out_of_range_fmtPKcz",
    "_gfortran_runtime_error",
    "_gfortran_stop_numeric",
    "_gfortran_runtime_error_at",
    "_gfortran_stop_string",
    "_gfortran_abort",
    "_gfortran_exit_i8",
    "_gfortran_exit_i4",
    "for_stop_core",
    "__sys_exit",
    "_Exit",
    "ExitThread",
    "FatalExit",
    "RaiseException",
    "RtlRaiseException",
    "TerminateProcess",
    "__cxa_throw_bad_array_new_length",
    "_ZSt19__throw_logic_errorPKc",
    "_Z8V8_FatalPKciS0_z",
    "_ZSt16__throw_bad_castv",
];

/// Library functions that sometimes do not return (e.g. `error(3)` with a
/// non-zero status). Calls to these keep their fall-through edge.
pub const NORETURN_POSSIBLE: [&str; 5] = [
    "__fprintf_chk",
    "__printf_chk",
    "error",
    "__vfprintf_chk",
    "__cxa_rethrow",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_names_round_trip() {
        assert_eq!(Reg::from_name("ax"), Reg::Ax);
        assert_eq!(Reg::from_name("r13"), Reg::R13);
        assert_eq!(Reg::from_name("xmm9"), Reg::Xmm9);
        assert_eq!(Reg::from_name("k0"), Reg::Unknown);
        assert_eq!(Reg::R13.name(), "r13");
    }

    #[test]
    fn prolog_classes() {
        assert_eq!(prolog(&[0x55]), 2); // push rbp
        assert_eq!(prolog(&[0x41, 0x56]), 2); // push r14
        assert_eq!(prolog(&[0x48, 0x89, 0xe5]), 1); // mov rbp,rsp
        assert_eq!(prolog(&[0x48, 0x83, 0xec, 0x18]), 1); // sub rsp,0x18
        assert_eq!(prolog(&[0x90]), 0);
        assert_eq!(prolog(&[]), 0);
    }
}
