//! The external RTL lifter boundary.
//!
//! The lifter is a separate process with process-global state: it is loaded
//! once with an automaton specification and then translates disassembly
//! files line-by-line into RTL. The production implementation spawns the
//! external program; tests replay fixture files.

pub mod disasm;

pub use self::disasm::disassemble;

use crate::Error;
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait Lifter {
    /// Load the automaton specification. Called once per process;
    /// re-initialisation is not supported.
    fn load(&mut self, f_auto: &Path) -> Result<(), Error>;

    /// Translate `f_asm` into one RTL line per instruction in `f_rtl`,
    /// aligned line-by-line.
    fn lift(&self, f_asm: &Path, f_rtl: &Path) -> Result<(), Error>;
}

/// Spawns the external lifter executable.
pub struct SubprocessLifter {
    program: PathBuf,
    f_auto: Option<PathBuf>,
}

impl SubprocessLifter {
    pub fn new(program: PathBuf) -> SubprocessLifter {
        SubprocessLifter {
            program,
            f_auto: None,
        }
    }
}

impl Lifter for SubprocessLifter {
    fn load(&mut self, f_auto: &Path) -> Result<(), Error> {
        if self.f_auto.is_some() {
            return Err(Error::Lift(String::from(
                "lifter is already loaded; re-initialisation is not supported",
            )));
        }
        if !f_auto.exists() {
            return Err(Error::Lift(format!(
                "automaton specification {} not found",
                f_auto.display()
            )));
        }
        self.f_auto = Some(f_auto.to_path_buf());
        Ok(())
    }

    fn lift(&self, f_asm: &Path, f_rtl: &Path) -> Result<(), Error> {
        let f_auto = self
            .f_auto
            .as_ref()
            .ok_or_else(|| Error::Lift(String::from("lifter is not loaded")))?;
        let status = Command::new(&self.program)
            .arg(f_auto)
            .arg(f_asm)
            .arg(f_rtl)
            .status()?;
        if !status.success() {
            return Err(Error::Lift(format!("lifter exited with {}", status)));
        }
        Ok(())
    }
}

/// Replays a pre-recorded RTL file; the test implementation of `Lifter`.
pub struct FixtureLifter {
    fixture: PathBuf,
}

impl FixtureLifter {
    pub fn new(fixture: PathBuf) -> FixtureLifter {
        FixtureLifter { fixture }
    }
}

impl Lifter for FixtureLifter {
    fn load(&mut self, _f_auto: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn lift(&self, _f_asm: &Path, f_rtl: &Path) -> Result<(), Error> {
        std::fs::copy(&self.fixture, f_rtl)?;
        Ok(())
    }
}
