//! Session management and program construction.
//!
//! A `Framework` owns a per-process scratch directory for the intermediate
//! disassembly and RTL files. `create_program` drives the external
//! collaborators: disassemble, lift, parse the aligned files, repair
//! non-returning calls, and assemble the `Program`.

use crate::arch::{self, NORETURN_DEFINITE, NORETURN_POSSIBLE};
use crate::cfg::{CfgPolicy, Insn, Program};
use crate::lifter::{disassemble, Lifter};
use crate::loader::{Object, StrippedPolicy};
use crate::rtl::{self, mem, parse_statement, plus, reg, Expression, MatchKind, Mode, Statement};
use crate::vtable;
use crate::{Error, Imm};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub struct Framework {
    pub d_base: PathBuf,
    pub d_session: PathBuf,
    strict_lift: bool,
    pub stripped_policy: StrippedPolicy,
}

impl Framework {
    /// Create the session scratch directory and load the lifter.
    pub fn setup(
        d_base: &Path,
        f_auto: &Path,
        lifter: &mut dyn Lifter,
    ) -> Result<Framework, Error> {
        let d_session = d_base.join(std::process::id().to_string());
        fs::create_dir_all(&d_session)?;
        lifter.load(f_auto)?;
        Ok(Framework {
            d_base: d_base.to_path_buf(),
            d_session,
            strict_lift: false,
            stripped_policy: StrippedPolicy::default(),
        })
    }

    /// Abort program construction on the first lift failure instead of
    /// degrading the instruction to a halt.
    pub fn strict_lift(&mut self, strict: bool) {
        self.strict_lift = strict;
    }

    /// Remove the session scratch directory, regardless of analysis
    /// outcome.
    pub fn clean(&self) {
        let _ = fs::remove_dir_all(&self.d_session);
    }

    /// Disassemble, lift, and assemble a `Program` over `f_obj`.
    pub fn create_program(
        &self,
        f_obj: &Path,
        lifter: &dyn Lifter,
        fptrs: &[Imm],
        indirect_targets: &FxHashMap<Imm, FxHashSet<Imm>>,
    ) -> Result<Program, Error> {
        let f_asm = self.d_session.join("asm");
        let f_rtl = self.d_session.join("rtl");
        let f_raw = self.d_session.join("raw");

        disassemble(f_obj, &f_asm, &f_raw)?;
        lifter.lift(&f_asm, &f_rtl)?;

        let object = Object::from_file(f_obj)?;
        let mut insns = load_insns(&f_asm, &f_rtl, &f_raw, self.strict_lift)?;
        repair_noreturn_calls(&mut insns, &object);

        let program = Program::new(object, insns, fptrs, indirect_targets, CfgPolicy::default());
        if program.faulty {
            return Err(Error::Program);
        }
        Ok(program)
    }

    /// Seed the program's vfunc map from the constructor byte heuristic.
    pub fn scan_initial_vfuncs(&self, program: &mut Program) {
        let constructors = vtable::find_constructors(program);
        let candidates: FxHashSet<Imm> = constructors.values().copied().collect();
        let rel = program.object().vtable_slots(self.stripped_policy);
        let (_, vfuncs) = vtable::scan_vfunc(&candidates, &rel, program.object());
        program.vfuncs.extend(vfuncs);
    }
}

/// Parse the three aligned files into instructions. A line that fails to
/// lift becomes a halt stub under the lenient policy.
fn load_insns(
    f_asm: &Path,
    f_rtl: &Path,
    f_raw: &Path,
    strict_lift: bool,
) -> Result<Vec<Insn>, Error> {
    let asm = BufReader::new(fs::File::open(f_asm)?);
    let rtl = BufReader::new(fs::File::open(f_rtl)?);
    let raw = BufReader::new(fs::File::open(f_raw)?);

    let mut insns = Vec::new();
    for ((asm_line, rtl_line), raw_line) in asm.lines().zip(rtl.lines()).zip(raw.lines()) {
        let asm_line = asm_line?;
        let rtl_line = rtl_line?;
        let raw_line = raw_line?;

        let (label, itc) = asm_line.split_once(' ').unwrap_or((asm_line.as_str(), ""));
        let offset: Imm = label
            .strip_prefix(".L")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Custom(format!("malformed asm line: {}", asm_line)))?;

        let raw_bytes: Vec<u8> = raw_line
            .split_whitespace()
            .filter_map(|b| u8::from_str_radix(b, 16).ok())
            .collect();

        match parse_statement(&rtl_line) {
            Some(stmt) => insns.push(Insn::new(offset, stmt, raw_bytes)),
            None => {
                log::warn!("failed to lift at {:#x}: {}", offset, itc);
                if strict_lift {
                    return Err(Error::LiftInsn { offset });
                }
                // Keep the instruction's real length so the stream stays
                // contiguous; only the semantics degrade to a halt.
                insns.push(Insn::new(
                    offset,
                    Statement::Exit(rtl::ExitKind::Halt),
                    raw_bytes,
                ));
            }
        }
    }
    Ok(insns)
}

/// Rewrite direct calls to non-returning imports as halts.
///
/// An import stub is an indirect jump through a GOT slot; the slot's
/// JUMP_SLOT relocation names the symbol. Calls whose direct target is a
/// stub bound to a definitely non-returning function never fall through.
pub fn repair_noreturn_calls(insns: &mut [Insn], object: &Object) {
    let got_names: FxHashMap<Imm, &str> = object
        .jump_slots()
        .iter()
        .map(|(slot, name)| (*slot, name.as_str()))
        .collect();

    let stub_pattern = mem(
        Mode::None,
        plus(Mode::None, reg(Mode::None, arch::INSN_PTR), Expression::Any),
    );
    let mut noreturn_stubs: FxHashSet<Imm> = FxHashSet::default();
    for insn in insns.iter() {
        if !(insn.jump() && insn.indirect()) {
            continue;
        }
        for hit in insn.stmt().find(MatchKind::Partial, &stub_pattern) {
            let addr = match hit {
                Expression::Mem(_, addr) => addr,
                _ => continue,
            };
            if let Expression::Binary { rhs, .. } = addr.as_ref() {
                if let Expression::Const(c) = rhs.as_ref() {
                    if let Some(disp) = c.to_int() {
                        let got = insn.next_offset() + disp;
                        match got_names.get(&got) {
                            Some(name) if NORETURN_DEFINITE.contains(name) => {
                                noreturn_stubs.insert(insn.offset());
                            }
                            Some(name) if NORETURN_POSSIBLE.contains(name) => {
                                log::debug!(
                                    "call through {:#x} may not return ({})",
                                    insn.offset(),
                                    name
                                );
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    for insn in insns.iter_mut() {
        if !(insn.call() && insn.direct()) {
            continue;
        }
        if let (Some(target), _) = insn.direct_target() {
            if noreturn_stubs.contains(&target) {
                log::debug!(
                    "fix: instruction {:#x} is a non-returning call",
                    insn.offset()
                );
                insn.replace(
                    Statement::Exit(rtl::ExitKind::Halt),
                    arch::HLT_BYTES.to_vec(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtl::{assign, const_int};

    fn object_with_got(slot: Imm, name: &str) -> Object {
        let mut object = Object::flat(0x1000, vec![0u8; 0x100], vec![]);
        object.push_jump_slot(slot, name.to_string());
        object
    }

    fn stub(offset: Imm, got_disp: Imm) -> Insn {
        // jmp [rip + got_disp]
        let src = mem(
            Mode::Di,
            plus(Mode::Di, reg(Mode::Di, arch::INSN_PTR), const_int(got_disp)),
        );
        Insn::new(
            offset,
            assign(Expression::NoType(String::from("pc")), src),
            vec![0xff, 0x25, 0, 0, 0, 0],
        )
    }

    fn call(offset: Imm, target: Imm) -> Insn {
        Insn::new(
            offset,
            Statement::Call {
                target: const_int(target),
            },
            vec![0xe8, 0, 0, 0, 0],
        )
    }

    #[test]
    fn calls_to_abort_stub_become_halts() {
        // Stub at 0x1020 jumps through GOT slot 0x3000 bound to abort.
        let object = object_with_got(0x3000, "abort");
        let mut insns = vec![call(0x1000, 0x1020), stub(0x1020, 0x3000 - 0x1026)];
        repair_noreturn_calls(&mut insns, &object);
        assert!(insns[0].halt());
        assert!(!insns[0].call());
        assert!(!insns[1].halt());
    }

    #[test]
    fn calls_to_possible_noreturn_keep_fallthrough() {
        let object = object_with_got(0x3000, "error");
        let mut insns = vec![call(0x1000, 0x1020), stub(0x1020, 0x3000 - 0x1026)];
        repair_noreturn_calls(&mut insns, &object);
        assert!(insns[0].call());
        assert!(!insns[0].halt());
    }

    #[test]
    fn unrelated_calls_are_untouched() {
        let object = object_with_got(0x3000, "abort");
        let mut insns = vec![call(0x1000, 0x2000)];
        repair_noreturn_calls(&mut insns, &object);
        assert!(insns[0].call());
    }
}
