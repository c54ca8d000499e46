//! Loading analysed binaries.

pub mod elf;

pub use self::elf::{Object, Phdr, StrippedPolicy, VtableRel};
