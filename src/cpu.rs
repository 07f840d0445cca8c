use std::fmt;
use std::fs::File;
use std::io;
use std::rc::Rc;

use log::info;
use serde::Deserialize;

use crate::backend::backend::Backend;
use crate::error::{ConfigError, SimError};
use crate::frontend::frontend::{Frontend, FrontendControl};
use crate::instructions::instructions::{Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

pub const ARCH_REG_CNT: u16 = 16;
// the address of the first instruction
pub const CODE_BASE: WordType = 4000;
pub const INSTR_SIZE: WordType = 4;
// the largest data memory, in machine words, a config may ask for
pub const MAX_MEMORY_SIZE: u32 = 1 << 24;

#[derive(Default)]
pub(crate) struct PerfCounters {
    pub fetch_cnt: u64,
    pub decode_cnt: u64,
    pub dispatch_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub retired_cnt: u64,
    pub cycle_cnt: u64,
    pub decode_stall_cnt: u64,
    pub dispatch_stall_cnt: u64,
    pub branch_taken_cnt: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retired_cnt as f32 / self.cycle_cnt as f32
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub(crate) struct Trace {
    pub fetch: bool,
    pub decode: bool,
    pub dispatch: bool,
    pub issue: bool,
    pub execute: bool,
    pub forward: bool,
    pub memory: bool,
    pub retire: bool,
    pub cycle: bool,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct CPUConfig {
    // the number of physical registers
    pub(crate) phys_reg_count: u16,
    // the number of slots in the issue queue
    pub(crate) iq_capacity: u16,
    // the capacity of the reorder buffer
    pub(crate) rob_capacity: u16,
    // the capacity of the load store queue
    pub(crate) lsq_capacity: u16,
    // the size of the data memory in machine words
    pub(crate) memory_size: u32,
    // the number of instructions that can retire per clock cycle
    pub(crate) retire_n_wide: u8,
    // if processing of a single instruction should be traced (logged)
    pub(crate) trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            phys_reg_count: 20,
            iq_capacity: 8,
            rob_capacity: 16,
            lsq_capacity: 8,
            memory_size: 4096,
            retire_n_wide: 1,
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("phys_reg_count", self.phys_reg_count as u64),
            ("iq_capacity", self.iq_capacity as u64),
            ("rob_capacity", self.rob_capacity as u64),
            ("lsq_capacity", self.lsq_capacity as u64),
            ("memory_size", self.memory_size as u64),
            ("retire_n_wide", self.retire_n_wide as u64),
        ];

        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be larger than 0", name)));
            }
        }

        if self.memory_size > MAX_MEMORY_SIZE {
            return Err(ConfigError::Invalid(
                format!("memory_size {} exceeds the maximum of {} words", self.memory_size, MAX_MEMORY_SIZE)));
        }
        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)
        .map_err(|source| ConfigError::IOError { path: file_path.to_string(), source })?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

/// The committed condition codes.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub(crate) struct Flags {
    pub(crate) zero: bool,
    pub(crate) positive: bool,
}

impl Flags {
    pub(crate) fn from_result(value: WordType) -> Self {
        Self { zero: value == 0, positive: value > 0 }
    }

    /// A value with the same flags; used when a branch reads the committed
    /// condition codes instead of an in flight producer.
    pub(crate) fn as_value(&self) -> WordType {
        if self.zero {
            0
        } else if self.positive {
            1
        } else {
            -1
        }
    }
}

struct ArgRegEntry {
    pub(crate) value: WordType,
}

pub struct ArgRegFile {
    entries: Vec<ArgRegEntry>,
    pub(crate) flags: Flags,
}

impl ArgRegFile {
    pub(crate) fn new(reg_count: u16) -> ArgRegFile {
        let mut array = Vec::with_capacity(reg_count as usize);
        for _ in 0..reg_count {
            array.push(ArgRegEntry { value: 0 });
        }

        ArgRegFile { entries: array, flags: Flags::default() }
    }

    fn reset(&mut self) {
        self.entries.iter_mut().for_each(|entry| entry.value = 0);
        self.flags = Flags::default();
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.entries[reg as usize].value
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.entries[reg as usize].value = value;
    }
}

impl fmt::Display for ArgRegFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Architectural registers:")?;
        for (reg, entry) in self.entries.iter().enumerate() {
            write!(f, "  R{:<2} = {:<8}", reg, entry.value)?;
            if reg % 4 == 3 {
                writeln!(f)?;
            }
        }
        if self.entries.len() % 4 != 0 {
            writeln!(f)?;
        }
        writeln!(f, "  Z={} P={}", self.flags.zero as u8, self.flags.positive as u8)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ExitReason {
    Halted,
    CycleLimit,
    UserQuit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Halted => write!(f, "HALT retired"),
            ExitReason::CycleLimit => write!(f, "cycle limit reached"),
            ExitReason::UserQuit => write!(f, "stopped by user"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct RunReport {
    pub(crate) cycles: u64,
    pub(crate) retired: u64,
    pub(crate) reason: ExitReason,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ipc = if self.cycles == 0 { 0.0 } else { self.retired as f32 / self.cycles as f32 };
        write!(f, "Simulation ended ({}) after {} cycles; {} instructions retired; IPC={:.2}",
               self.reason, self.cycles, self.retired, ipc)
    }
}

pub(crate) struct CPU {
    cpu_config: CPUConfig,
    pub(crate) backend: Backend,
    frontend: Frontend,
    pub(crate) frontend_control: FrontendControl,
    pub(crate) memory_subsystem: MemorySubsystem,
    pub(crate) arch_reg_file: ArgRegFile,
    trace: Trace,
    pub(crate) perf_counters: PerfCounters,
}

impl CPU {
    pub(crate) fn new(cpu_config: &CPUConfig) -> CPU {
        CPU {
            cpu_config: cpu_config.clone(),
            backend: Backend::new(cpu_config),
            frontend: Frontend::new(cpu_config),
            frontend_control: FrontendControl::new(),
            memory_subsystem: MemorySubsystem::new(cpu_config),
            arch_reg_file: ArgRegFile::new(ARCH_REG_CNT),
            trace: cpu_config.trace.clone(),
            perf_counters: PerfCounters::new(),
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.frontend.init(program, &mut self.frontend_control);
        self.backend = Backend::new(&self.cpu_config);
        self.backend.init(program);
        self.memory_subsystem.init();
        self.arch_reg_file.reset();
        self.perf_counters = PerfCounters::new();
    }

    /// Advances the whole pipeline by one clock cycle. The backend stages
    /// run before fetch so that every latch is consumed before it is refilled.
    /// Returns true once HALT retired.
    pub(crate) fn do_cycle(&mut self) -> Result<bool, SimError> {
        if self.backend.exit {
            return Ok(true);
        }

        self.perf_counters.cycle_cnt += 1;

        self.backend.do_cycle(
            &mut self.frontend_control,
            &mut self.memory_subsystem,
            &mut self.arch_reg_file,
            &mut self.perf_counters,
        )?;
        if !self.backend.exit {
            self.frontend.do_cycle(&mut self.frontend_control, &mut self.perf_counters);
        }

        if self.trace.cycle {
            let perf_counters = &self.perf_counters;
            info!("[Cycles:{}][Fetched={}][Decoded={}][Dispatched={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                  perf_counters.cycle_cnt,
                  perf_counters.fetch_cnt,
                  perf_counters.decode_cnt,
                  perf_counters.dispatch_cnt,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retired_cnt,
                  perf_counters.ipc()
            );
        }

        Ok(self.backend.exit)
    }

    /// Runs until HALT retires or `max_cycles` cycles have been simulated.
    pub(crate) fn run(&mut self, max_cycles: Option<u64>) -> Result<RunReport, SimError> {
        loop {
            if self.backend.exit {
                return Ok(self.report(ExitReason::Halted));
            }
            if max_cycles.is_some_and(|max| self.perf_counters.cycle_cnt >= max) {
                return Ok(self.report(ExitReason::CycleLimit));
            }
            self.do_cycle()?;
        }
    }

    pub(crate) fn report(&self, reason: ExitReason) -> RunReport {
        RunReport {
            cycles: self.perf_counters.cycle_cnt,
            retired: self.perf_counters.retired_cnt,
            reason,
        }
    }

    /// Prints the per cycle state of the machine.
    pub(crate) fn dump(&self, out: &mut impl io::Write) -> io::Result<()> {
        writeln!(out, "==================== cycle {} ====================", self.perf_counters.cycle_cnt)?;
        match &self.frontend_control.decode_latch {
            Some(latch) => writeln!(out, "Decode latch: [{}] pc={}", latch.instr, latch.pc)?,
            None => writeln!(out, "Decode latch: -")?,
        }
        write!(out, "{}", self.backend)?;
        write!(out, "{}", self.arch_reg_file)
    }

    /// Prints the final state; registers, non zero memory and the counters.
    pub(crate) fn dump_final(&self, out: &mut impl io::Write) -> io::Result<()> {
        write!(out, "{}", self.arch_reg_file)?;
        write!(out, "{}", self.memory_subsystem)?;
        let perf_counters = &self.perf_counters;
        writeln!(out, "Fetched={} Decoded={} Dispatched={} Issued={} Executed={} Retired={}",
                 perf_counters.fetch_cnt,
                 perf_counters.decode_cnt,
                 perf_counters.dispatch_cnt,
                 perf_counters.issue_cnt,
                 perf_counters.execute_cnt,
                 perf_counters.retired_cnt)?;
        writeln!(out, "Decode stalls={} Dispatch stalls={} Branches taken={}",
                 perf_counters.decode_stall_cnt,
                 perf_counters.dispatch_stall_cnt,
                 perf_counters.branch_taken_cnt)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_flags_value_round_trip() {
        for value in [-5, 0, 7] {
            assert_eq!(Flags::from_result(Flags::from_result(value).as_value()), Flags::from_result(value));
        }
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "phys_reg_count: 32").unwrap();
        writeln!(file, "trace:").unwrap();
        writeln!(file, "  retire: true").unwrap();

        let config = load_cpu_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.phys_reg_count, 32);
        assert_eq!(config.rob_capacity, 16);
        assert!(config.trace.retire);
        assert!(!config.trace.fetch);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "iq_capacity: 0").unwrap();

        match load_cpu_config(file.path().to_str().unwrap()) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("iq_capacity")),
            other => panic!("expected an invalid config, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_huge_memory_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "memory_size: 4000000000").unwrap();

        match load_cpu_config(file.path().to_str().unwrap()) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("memory_size")),
            other => panic!("expected an invalid config, got {:?}", other.map(|_| ())),
        }

        let config = CPUConfig { memory_size: MAX_MEMORY_SIZE, ..CPUConfig::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rob_capacity: lots").unwrap();

        assert!(matches!(load_cpu_config(file.path().to_str().unwrap()), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_config() {
        assert!(matches!(load_cpu_config("/nonexistent/cpu.yaml"), Err(ConfigError::IOError { .. })));
    }
}
