//! Instructions, blocks, functions, and the superset CFG.

pub mod block;
pub mod function;
pub mod insn;
pub mod program;
pub mod scc;

pub use self::block::Block;
pub use self::function::Function;
pub use self::insn::{EdgeCond, Insn};
pub use self::program::{CfgPolicy, Program, LIMIT_JTABLE};
pub use self::scc::{decompose, Scc};

/// Blocks are addressed by index into the program's block table.
pub type BlockId = usize;
