//! The outer recovery loop.
//!
//! Seed entry points from symbols, relocations, direct calls, and prologue
//! shapes; then alternate between CFG updates, per-function abstract
//! evaluation, and indirect-jump resolution until the resolved sets stop
//! growing; then rescan the gaps for more entry points. A final pass over
//! every entry point populates the virtual-function tracking.

use crate::analysis::StateConfig;
use crate::cfg::Program;
use crate::loader::StrippedPolicy;
use crate::vtable;
use crate::{Error, Imm};
use rustc_hash::FxHashSet;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Bound on outer discover-analyse-resolve iterations.
pub const RECUR_LIMIT: u64 = 200;

#[derive(Clone)]
pub struct DriverConfig {
    pub recur_limit: u64,
    pub state: StateConfig,
    pub stripped_policy: StrippedPolicy,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            recur_limit: RECUR_LIMIT,
            state: StateConfig::default(),
            stripped_policy: StrippedPolicy::default(),
        }
    }
}

/// A function is worth analysing while it still has an unexplored indirect
/// jump; once every jump is explored it is skipped for good.
fn should_analyze(
    program: &Program,
    function: &crate::cfg::Function,
    skipped: &mut FxHashSet<Imm>,
) -> bool {
    if !skipped.contains(&function.offset()) && function.has_unresolved_icf(program) {
        return true;
    }
    skipped.insert(function.offset());
    false
}

/// Run the discover → analyse → resolve → scan-gaps loop to fixpoint.
pub fn run(program: &mut Program, config: &DriverConfig) {
    let definite = program.definite_fptrs();
    let mut fptrs: Vec<Imm> = definite.iter().copied().collect();
    for fptr in program.prolog_fptrs() {
        if !definite.contains(&fptr) {
            fptrs.push(fptr);
        }
    }

    let mut skipped: FxHashSet<Imm> = FxHashSet::default();
    while !fptrs.is_empty() && program.update_num <= config.recur_limit {
        program.fptrs(&fptrs);
        program.update();

        // Reduce gaps by resolving targets of indirect jumps.
        loop {
            let prev_count = program.icfs().len();
            let entries: Vec<Imm> = program.fptrs_all().iter().copied().collect();
            for fptr in entries {
                if !program.updated(fptr) {
                    continue;
                }
                if let Some(mut function) = program.func(fptr) {
                    if should_analyze(program, &function, &mut skipped) {
                        function.analyze(program, &config.state);
                        function.resolve_icf(program);
                        if let Some(vtable) = function.vfunc_table {
                            program.vtable_candidates.insert(vtable);
                        }
                    }
                }
            }
            program.resolve_unbounded_icf();
            if prev_count == program.icfs().len() {
                break;
            }
            program.update();
        }

        // Scan gaps for more entry points.
        fptrs = program.scan_fptrs_in_gap();
    }

    // Populate virtual-function tracking across everything discovered.
    let entries: Vec<Imm> = program.fptrs_all().iter().copied().collect();
    for fptr in entries {
        if let Some(mut function) = program.func(fptr) {
            function.analyze(program, &config.state);
            if let Some(vtable) = function.vfunc_table {
                program.vtable_candidates.insert(vtable);
            }
        }
    }
    resolve_vfunc(program, config.stripped_policy);
}

/// Re-run the relocation walk over both the byte-heuristic constructors and
/// the dataflow-latched vtable candidates.
pub fn resolve_vfunc(program: &mut Program, policy: StrippedPolicy) {
    let constructors = vtable::find_constructors(program);
    let mut candidates: FxHashSet<Imm> = constructors.values().copied().collect();
    candidates.extend(program.vtable_candidates.iter().copied());
    let rel = program.object().vtable_slots(policy);
    let (_, vfuncs) = vtable::scan_vfunc(&candidates, &rel, program.object());
    program.vfuncs.extend(vfuncs);
}

/// Serialise the three result maps as JSON, all keys and values hex
/// strings without a `0x` prefix.
pub fn write_results(program: &Program, f_out: &Path) -> Result<(), Error> {
    let mut icf_data = BTreeMap::new();
    for (jump_loc, targets) in program.icfs() {
        let mut sorted: Vec<Imm> = targets.iter().copied().collect();
        sorted.sort_unstable();
        icf_data.insert(
            format!("{:x}", jump_loc),
            sorted.iter().map(|t| format!("{:x}", t)).collect::<Vec<_>>(),
        );
    }

    let mut jtable_data = BTreeMap::new();
    for (jtable, targets) in &program.jtable_targets {
        jtable_data.insert(
            format!("{:x}", jtable),
            targets.iter().map(|t| format!("{:x}", t)).collect::<Vec<_>>(),
        );
    }

    let mut vfunc_data = BTreeMap::new();
    for (slot, target) in &program.vfuncs {
        vfunc_data.insert(format!("{:x}", slot), format!("{:x}", target));
    }

    let output = json!({
        "indirect_jump_locations": icf_data,
        "jump_table_locations": jtable_data,
        "vfunc_locations": vfunc_data,
    });
    fs::write(f_out, serde_json::to_string_pretty(&output)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Reg;
    use crate::cfg::{CfgPolicy, Insn};
    use crate::loader::Object;
    use crate::rtl::{assign, const_int, mem, mult, plus, reg, Expression, Mode, Statement};
    use rustc_hash::FxHashMap;

    /// A program shaped like a dense six-way switch: `jmp *TAB(,%rax,8)` at
    /// 0x1180 with the table at 0x3020.
    fn switch_program() -> Program {
        let table_base: Imm = 0x3020;
        let cases: [Imm; 6] = [0x11a0, 0x11c0, 0x11e0, 0x1200, 0x1220, 0x1240];

        // Raw image mapped flat at 0x1000: code padding plus the table.
        let mut raw = vec![0u8; 0x2800];
        for (i, case) in cases.iter().enumerate() {
            let at = (table_base - 0x1000) as usize + i * 8;
            raw[at..at + 8].copy_from_slice(&(*case as u64).to_le_bytes());
        }
        let object = Object::flat(0x1000, raw, vec![(0x1000, 0x1fff)]);

        let dispatch = mem(
            Mode::Di,
            plus(
                Mode::Di,
                mult(Mode::Di, reg(Mode::Di, Reg::Ax), const_int(8)),
                const_int(table_base),
            ),
        );
        let mut insns = vec![
            // A caller makes the dispatcher a definite entry point.
            Insn::new(
                0x1100,
                Statement::Call {
                    target: const_int(0x1180),
                },
                vec![0xe8, 0x7b, 0, 0, 0],
            ),
            Insn::new(
                0x1180,
                assign(Expression::NoType(String::from("pc")), dispatch),
                vec![0xff; 7],
            ),
        ];
        for case in cases {
            insns.push(Insn::new(case, Statement::Exit(crate::rtl::ExitKind::Ret), vec![0xc3]));
        }
        // Entry falls straight into the dispatch.
        Program::new(
            object,
            insns,
            &[0x1180],
            &FxHashMap::default(),
            CfgPolicy::default(),
        )
    }

    #[test]
    fn dense_switch_resolves_all_cases() {
        let mut program = switch_program();
        let config = DriverConfig::default();

        let mut fptrs = vec![0x1180];
        program.fptrs(&fptrs);
        program.update();
        let mut skipped = FxHashSet::default();
        loop {
            let prev = program.icfs().len();
            let entries: Vec<Imm> = program.fptrs_all().iter().copied().collect();
            for fptr in entries {
                if let Some(mut f) = program.func(fptr) {
                    if should_analyze(&program, &f, &mut skipped) {
                        f.analyze(&program, &config.state);
                        f.resolve_icf(&mut program);
                    }
                }
            }
            program.resolve_unbounded_icf();
            if prev == program.icfs().len() {
                break;
            }
            program.update();
        }
        fptrs.clear();

        let expected: FxHashSet<Imm> =
            [0x11a0, 0x11c0, 0x11e0, 0x1200, 0x1220, 0x1240].into_iter().collect();
        assert_eq!(program.icfs()[&0x1180], expected);
        let table: Vec<Imm> = program.jtable_targets[&0x3020].iter().copied().collect();
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn resolver_is_idempotent_at_fixpoint() {
        let mut program = switch_program();
        let config = DriverConfig::default();
        run(&mut program, &config);
        let icfs_before = program.icfs().clone();
        let jtables_before = program.jtable_targets.clone();
        let vfuncs_before = program.vfuncs.clone();

        // One more full round must change nothing.
        let entries: Vec<Imm> = program.fptrs_all().iter().copied().collect();
        for fptr in entries {
            if let Some(mut f) = program.func(fptr) {
                f.analyze(&program, &config.state);
                f.resolve_icf(&mut program);
            }
        }
        program.resolve_unbounded_icf();
        assert_eq!(&icfs_before, program.icfs());
        assert_eq!(jtables_before, program.jtable_targets);
        assert_eq!(vfuncs_before, program.vfuncs);
    }

    #[test]
    fn results_serialise_as_hex_maps() {
        let mut program = switch_program();
        run(&mut program, &DriverConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("result.json");
        write_results(&program, &out).expect("write");
        let text = fs::read_to_string(&out).expect("read");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(
            value["indirect_jump_locations"]["1180"]
                .as_array()
                .expect("targets")
                .len(),
            6
        );
        assert!(value["jump_table_locations"]["3020"].is_array());
        assert!(value["vfunc_locations"].is_object());
    }
}
