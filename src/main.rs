use std::error::Error;
use std::io;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use lalrpop_util::lalrpop_mod;
use log::{error, info};
use structopt::StructOpt;

use crate::cpu::{CPU, CPUConfig, ExitReason, load_cpu_config, RunReport};
use crate::loader::loader::load;

mod cpu;
mod error;
mod loader;
mod frontend;
mod backend;
mod instructions;
mod memory_subsystem;

lalrpop_mod!(pub assembly, "/loader/assembly.rs");

#[derive(StructOpt, Debug)]
#[structopt(name = "APEX out-of-order CPU simulator")]
struct Opt {
    /// Path of the program to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file; the built-in defaults are used when absent
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Stops the simulation after this many cycles
    #[structopt(long)]
    cycles: Option<u64>,

    /// Advances one cycle per Enter; 'q' quits
    #[structopt(short, long)]
    single_step: bool,

    /// Prints the state of the pipeline after every cycle
    #[structopt(short, long)]
    display: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let opt = Opt::from_args();

    let cpu_config = match &opt.config {
        Some(config_path) => {
            let config_path = config_path.to_string_lossy();
            match load_cpu_config(&config_path) {
                Ok(config) => config,
                Err(err) => {
                    error!("Failed to load {}. Cause: {}", config_path, err);
                    exit(1);
                }
            }
        }
        None => CPUConfig::default(),
    };

    let path = opt.file.to_string_lossy();
    info!("Loading {}", path);
    let program = match load(&path) {
        Ok(program) => Rc::new(program),
        Err(err) => {
            error!("Loading program '{}' failed.", path);
            eprintln!("{}", err);
            exit(1);
        }
    };

    let mut cpu = CPU::new(&cpu_config);
    cpu.init(&program);

    let result = if opt.single_step || opt.display {
        run_interactive(&mut cpu, &opt)
    } else {
        cpu.run(opt.cycles).map_err(|err| Box::new(err) as Box<dyn Error>)
    };

    match result {
        Ok(report) => {
            info!("{}", report);
            println!("{}", report);
            if let Err(err) = cpu.dump_final(&mut io::stdout().lock()) {
                error!("Failed to print the final state: {}", err);
            }
        }
        Err(err) => {
            error!("Simulation aborted at cycle {}: {}", cpu.perf_counters.cycle_cnt, err);
            if let Err(err) = cpu.dump_final(&mut io::stdout().lock()) {
                error!("Failed to print the final state: {}", err);
            }
            exit(1);
        }
    }
}

// Runs cycle by cycle, optionally waiting for the user before every cycle.
fn run_interactive(cpu: &mut CPU, opt: &Opt) -> Result<RunReport, Box<dyn Error>> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if cpu.backend.exit {
            return Ok(cpu.report(ExitReason::Halted));
        }
        if opt.cycles.is_some_and(|max| cpu.perf_counters.cycle_cnt >= max) {
            return Ok(cpu.report(ExitReason::CycleLimit));
        }

        if opt.single_step {
            print!("Press Enter for the next cycle, 'q' to quit: ");
            stdout.flush()?;

            let mut line = String::new();
            let read = stdin.lock().read_line(&mut line)?;
            if read == 0 || line.trim().eq_ignore_ascii_case("q") {
                return Ok(cpu.report(ExitReason::UserQuit));
            }
        }

        cpu.do_cycle()?;
        cpu.dump(&mut stdout)?;
    }
}
