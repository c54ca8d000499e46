//! The abstract interpretation engine: product domain, state, evaluation.

pub mod domain;
pub mod eval;
pub mod exec;
pub mod state;

pub use self::domain::{AbsVal, BaseLH, BaseStride, Lattice, StrideTerm, Taint};
pub use self::eval::eval;
pub use self::exec::{execute, Exec, FnOutputs, InsnCtx};
pub use self::state::{
    bounded, classify, default_init, stack_sym, sym, sym_to_id, MemAddr, Region, State,
    StateConfig, UnitId,
};
