//! The `jump_table` command-line driver.
//!
//! Recovers indirect-jump targets, jump-table layouts, and virtual-function
//! dispatch from an x86-64 ELF binary and writes the three result maps as
//! JSON.

use clap::Parser;
use kestrel::driver::{self, DriverConfig};
use kestrel::framework::Framework;
use kestrel::lifter::SubprocessLifter;
use log::{Level, LevelFilter, Metadata, Record};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::process::ExitCode;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

#[derive(Parser, Debug)]
#[command(name = "jump_table")]
#[command(about = "Recover indirect control flow from an x86-64 ELF binary")]
struct Args {
    /// Base directory for scratch files
    #[arg(short = 'd', default_value = "/tmp/kestrel/")]
    dir_base: PathBuf,
    /// Output file for the JSON result
    #[arg(short = 'o')]
    file_out: Option<PathBuf>,
    /// Lifter executable; the automaton file is passed to it on load
    #[arg(long, default_value = "rtl-lift")]
    lifter: PathBuf,
    /// Automaton specification consumed by the lifter
    file_auto: PathBuf,
    /// Binary to analyse
    file_object: PathBuf,
}

fn run(args: &Args) -> Result<(), kestrel::Error> {
    if !args.file_auto.exists() || !args.file_object.exists() {
        return Err(kestrel::Error::Custom(String::from(
            "usage: jump_table [-d <dir_base>] [-o <file_out>] <file_auto> <file_object>",
        )));
    }
    let f_out = args
        .file_out
        .clone()
        .unwrap_or_else(|| args.dir_base.join("result.json"));

    let mut lifter = SubprocessLifter::new(args.lifter.clone());
    let framework = Framework::setup(&args.dir_base, &args.file_auto, &mut lifter)?;

    let result = framework
        .create_program(&args.file_object, &lifter, &[], &FxHashMap::default())
        .map(|mut program| {
            framework.scan_initial_vfuncs(&mut program);
            driver::run(&mut program, &DriverConfig::default());
            driver::write_results(&program, &f_out)
        });
    framework.clean();
    result?
}

fn main() -> ExitCode {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug));

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
