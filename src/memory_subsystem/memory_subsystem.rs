use std::fmt;

use log::info;

use crate::cpu::CPUConfig;
use crate::error::SimError;
use crate::instructions::instructions::WordType;

/// The number of cycles the memory unit needs for an access: one to set
/// it up and one to perform it.
pub(crate) const MEM_LATENCY: u8 = 2;

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum MemAccess {
    Load { address: WordType },
    Store { address: WordType, value: WordType },
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum MemCompletion {
    Loaded(WordType),
    Stored,
}

struct PendingAccess {
    access: MemAccess,
    pc: WordType,
    cycles_remaining: u8,
}

pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<WordType>,
    pending: Option<PendingAccess>,
    trace: bool,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
            pending: None,
            trace: cpu_config.trace.memory,
        }
    }

    pub(crate) fn init(&mut self) {
        self.memory.iter_mut().for_each(|word| *word = 0);
        self.pending = None;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub(crate) fn start(&mut self, access: MemAccess, pc: WordType) {
        debug_assert!(self.is_idle(), "memory unit is busy");

        if self.trace {
            info!("Memory: start {:?} pc={}", access, pc);
        }
        self.pending = Some(PendingAccess { access, pc, cycles_remaining: MEM_LATENCY });
    }

    /// Advances the pending access by one cycle. Returns the completion when
    /// the access was performed in this cycle.
    pub(crate) fn do_cycle(&mut self) -> Result<Option<MemCompletion>, SimError> {
        let pending = match &mut self.pending {
            Some(pending) => pending,
            None => return Ok(None),
        };

        pending.cycles_remaining -= 1;
        if pending.cycles_remaining > 0 {
            return Ok(None);
        }

        let access = pending.access;
        let pc = pending.pc;
        self.pending = None;

        let completion = match access {
            MemAccess::Load { address } => MemCompletion::Loaded(self.read(address, pc)?),
            MemAccess::Store { address, value } => {
                self.write(address, value, pc)?;
                MemCompletion::Stored
            }
        };

        if self.trace {
            info!("Memory: completed {:?} pc={} -> {:?}", access, pc, completion);
        }
        Ok(Some(completion))
    }

    fn to_index(&self, address: WordType, pc: WordType) -> Result<usize, SimError> {
        if address < 0 || address as usize >= self.memory.len() {
            return Err(SimError::MemoryOutOfBounds { pc, addr: address, size: self.memory.len() });
        }
        Ok(address as usize)
    }

    pub(crate) fn read(&self, address: WordType, pc: WordType) -> Result<WordType, SimError> {
        let index = self.to_index(address, pc)?;
        Ok(self.memory[index])
    }

    pub(crate) fn write(&mut self, address: WordType, value: WordType, pc: WordType) -> Result<(), SimError> {
        let index = self.to_index(address, pc)?;
        self.memory[index] = value;
        Ok(())
    }
}

impl fmt::Display for MemorySubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data memory (non zero):")?;
        for (address, value) in self.memory.iter().enumerate() {
            if *value != 0 {
                writeln!(f, "  MEM[{}] = {}", address, value)?;
            }
        }
        Ok(())
    }
}
