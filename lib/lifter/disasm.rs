//! External disassembler invocation.
//!
//! Runs objdump twice and writes two line-aligned files: `f_asm` with lines
//! `.L<offset> <instruction text>` and `f_raw` with the matching raw byte
//! pairs. The text is refined for the lifter: redundant prefixes dropped,
//! trap encodings rewritten to `hlt`, unliftable encodings to `nop`, and
//! operand addresses normalised to decimal.

use crate::{Error, Imm};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::Command;

const RM_PREFIX: [&str; 7] = [
    " bnd ", " lock ", " data16 ", " addr32 ", " rep ", " repz ", " repnz ",
];
const RM_PATTERN: [&str; 4] = ["*1]", "*1-", "*1+", "+0x0]"];
const TO_HLT: [&str; 3] = ["int1", "int3", "icebp"];
const TO_NOP: [&str; 11] = [
    "rex", "(bad)", "FWORD", "?", "riz", " fs ", " ss ", " ds ", " cs ", " gs ", " es ",
];

fn objdump(file: &Path, show_raw: bool) -> Result<String, Error> {
    let mut cmd = Command::new("objdump");
    cmd.arg("--prefix-addresses");
    if show_raw {
        cmd.arg("--show-raw-insn");
    } else {
        cmd.args(["-M", "intel"]);
    }
    cmd.arg("-d").arg(file);
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(Error::Disasm(format!(
            "objdump exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split an objdump line `<addr> <symbol+off> rest...` into offset and rest.
fn split_line(line: &str) -> Option<(Imm, &str)> {
    if !line.starts_with('0') {
        return None;
    }
    let (addr, rest) = line.split_once(' ')?;
    let offset = Imm::from_str_radix(addr.trim_start_matches('0'), 16)
        .or_else(|_| Imm::from_str_radix(addr, 16))
        .ok()?;
    let rest = rest.trim_start();
    let rest = if rest.starts_with('<') {
        rest.split_once('>').map(|(_, r)| r.trim_start())?
    } else {
        rest
    };
    Some((offset, rest))
}

/// Normalise the instruction text the way the lifter expects it.
fn refine(text: &str) -> String {
    // Drop symbolic and literal-pool annotations. The leading space keeps
    // prefix matching uniform for prefixes at the start of the text.
    let mut itc = format!(
        " {}",
        text.split('<')
            .next()
            .unwrap_or(text)
            .split('#')
            .next()
            .unwrap_or(text)
            .trim_end()
    );

    for pat in TO_NOP {
        if itc.contains(pat) {
            return String::from("nop");
        }
    }
    for pat in TO_HLT {
        if itc.contains(pat) {
            return String::from("hlt");
        }
    }
    if !itc.contains("rep stos") && !itc.contains("repz cmps") {
        for prefix in RM_PREFIX {
            while let Some(at) = itc.find(prefix) {
                itc.replace_range(at..at + prefix.len() - 1, "");
            }
        }
    }
    for pattern in RM_PATTERN {
        while let Some(at) = itc.find(pattern) {
            itc.replace_range(at..at + pattern.len() - 1, "");
        }
    }

    // Bare hex operands (objdump prints branch targets without 0x) become
    // decimal so the lifter reads them as plain integers.
    if let Some(at) = itc.find(" 0") {
        let is_hex_literal = itc.as_bytes().get(at + 2) == Some(&b'x');
        if !is_hex_literal && at + 2 < itc.len() {
            let operand = itc[at + 1..].trim_start_matches('0');
            if let Ok(val) = Imm::from_str_radix(
                if operand.is_empty() { "0" } else { operand },
                16,
            ) {
                itc.replace_range(at + 1.., &val.to_string());
            }
        }
    }
    if let Some(at) = itc.find(" fff") {
        itc.insert_str(at + 1, "0x");
    }

    itc.trim_start().to_string()
}

/// Disassemble `file` into aligned `f_asm` / `f_raw`.
pub fn disassemble(file: &Path, f_asm: &Path, f_raw: &Path) -> Result<(), Error> {
    let listing = objdump(file, false)?;
    let mut asm = BufWriter::new(File::create(f_asm)?);
    for line in listing.lines() {
        if let Some((offset, rest)) = split_line(line) {
            writeln!(asm, ".L{} {}", offset, refine(rest))?;
        }
    }
    asm.flush()?;

    let listing = objdump(file, true)?;
    let mut raw = BufWriter::new(File::create(f_raw)?);
    for line in listing.lines() {
        if let Some((_, rest)) = split_line(line) {
            let bytes = rest.split('\t').next().unwrap_or("").trim();
            writeln!(raw, "{}", bytes)?;
        }
    }
    raw.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_objdump_line() {
        let (offset, rest) =
            split_line("0000000000001180 <main+0x10> jmp 0000000000001240").unwrap();
        assert_eq!(offset, 0x1180);
        assert_eq!(rest, "jmp 0000000000001240");
        assert!(split_line("Disassembly of section .text:").is_none());
    }

    #[test]
    fn refine_normalises_targets_to_decimal() {
        assert_eq!(refine("jmp 0000000000001240"), "jmp 4672");
        assert_eq!(refine("call   0000000000001100"), "call   4352");
    }

    #[test]
    fn refine_rewrites_traps_and_bad_encodings() {
        assert_eq!(refine("int3"), "hlt");
        assert_eq!(refine("(bad)"), "nop");
        assert_eq!(refine("rex.W"), "nop");
    }

    #[test]
    fn refine_strips_prefixes_and_noise_patterns() {
        assert_eq!(refine("bnd jmp rax"), "jmp rax");
        assert_eq!(
            refine("mov rax,QWORD PTR [rbx+rcx*1]"),
            "mov rax,QWORD PTR [rbx+rcx]"
        );
        assert_eq!(refine("rep stos BYTE PTR es:[rdi],al"), "rep stos BYTE PTR es:[rdi],al");
    }
}
