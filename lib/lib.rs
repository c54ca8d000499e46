//! Kestrel: indirect control-flow recovery for x86-64 ELF binaries.
//!
//! Kestrel reconstructs a superset CFG from a growing set of function entry
//! points, analyses each function under a product abstract domain, reads
//! back the computed jump-target expressions to bound indirect jumps, and
//! feeds newly discovered code pointers back into the CFG until fixed
//! point. A quick synopsis of the modules:
//!
//! * **analysis** - The abstract interpretation engine: `BaseLH`,
//!   `BaseStride` and `Taint` lattices, the abstract `State`, expression
//!   evaluation and statement execution.
//! * **arch** - x86-64 registers, calling convention, prologue shapes, and
//!   the no-return symbol lists.
//! * **cfg** - Instructions, blocks, functions, SCC decomposition, and the
//!   superset `Program` with its jump-table resolver.
//! * **driver** - The discover → analyse → resolve → scan-gaps loop and the
//!   JSON result writer.
//! * **framework** - Scratch-session management and program construction.
//! * **lifter** - The external disassembler and RTL lifter boundary.
//! * **loader** - The goblin-backed ELF view.
//! * **rtl** - The lifted intermediate representation and its parser.
//! * **vtable** - Constructor heuristic and relocation-guided vtable walk.

pub mod analysis;
pub mod arch;
pub mod cfg;
pub mod driver;
pub mod framework;
pub mod lifter;
pub mod loader;
pub mod rtl;
pub mod vtable;

/// Address and immediate type used throughout the analysis.
pub type Imm = i64;

/// Kestrel error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object error: {0}")]
    Object(#[from] goblin::error::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("disassembler failed: {0}")]
    Disasm(String),
    #[error("lifter failed: {0}")]
    Lift(String),
    #[error("failed to lift instruction at {offset:#x}")]
    LiftInsn { offset: Imm },
    #[error("program construction failed")]
    Program,
    #[error("{0}")]
    Custom(String),
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::Custom(s.to_string())
    }
}

pub mod util {
    use crate::Imm;

    /// Sign-extend a `width`-byte little-endian value.
    pub fn cast_int(val: u64, width: u8) -> Imm {
        match width {
            1 => val as u8 as i8 as Imm,
            2 => val as u16 as i16 as Imm,
            4 => val as u32 as i32 as Imm,
            _ => val as Imm,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn cast_int_sign_extends() {
            assert_eq!(cast_int(0xff, 1), -1);
            assert_eq!(cast_int(0x7f, 1), 127);
            assert_eq!(cast_int(0xffff_fffe, 4), -2);
            assert_eq!(cast_int(0x1234_5678, 8), 0x1234_5678);
        }
    }
}
