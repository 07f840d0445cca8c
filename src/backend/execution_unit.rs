use std::cmp::Ordering;
use std::fmt;

use crate::backend::issue_queue::IQEntry;
use crate::cpu::{CODE_BASE, INSTR_SIZE};
use crate::error::SimError;
use crate::instructions::instructions::{FuClass, Opcode, RegisterType, WordType};

/// The number of stages of the multiply/divide pipeline.
pub(crate) const MUL_STAGES: usize = 4;

/// A completed result waiting in a forward latch; it is broadcast the cycle
/// after it was produced.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct FuResult {
    pub(crate) pc: WordType,
    pub(crate) rob_index: u16,
    pub(crate) dest: Option<RegisterType>,
    pub(crate) value: WordType,
}

impl FuResult {
    pub(crate) fn new(entry: &IQEntry, value: WordType) -> Self {
        Self {
            pc: entry.pc,
            rob_index: entry.rob_index,
            dest: entry.dest,
            value,
        }
    }
}

/// What the integer unit produced. Memory instructions only compute their
/// effective address here; the value comes from the memory unit.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum IntOutcome {
    Value(WordType),
    Address { address: WordType, data: Option<WordType> },
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct BranchOutcome {
    pub(crate) taken: bool,
    pub(crate) target: WordType,
    // the return address written by JALR
    pub(crate) link: Option<WordType>,
}

pub(crate) fn execute_int(entry: &IQEntry) -> IntOutcome {
    let a = entry.src[0].value;
    let b = entry.src[1].value;
    let imm = entry.instr.imm;

    match entry.instr.opcode {
        Opcode::ADD => IntOutcome::Value(a.wrapping_add(b)),
        Opcode::SUB => IntOutcome::Value(a.wrapping_sub(b)),
        Opcode::AND => IntOutcome::Value(a & b),
        Opcode::OR => IntOutcome::Value(a | b),
        Opcode::XOR => IntOutcome::Value(a ^ b),
        Opcode::ADDL => IntOutcome::Value(a.wrapping_add(imm)),
        Opcode::SUBL => IntOutcome::Value(a.wrapping_sub(imm)),
        Opcode::MOVC => IntOutcome::Value(imm),
        // only the flags are of interest; the sign of a - b without the overflow
        Opcode::CMP => IntOutcome::Value(match a.cmp(&b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
        Opcode::LOAD => IntOutcome::Address { address: a.wrapping_add(imm), data: None },
        Opcode::STORE => IntOutcome::Address { address: a.wrapping_add(imm), data: Some(b) },
        opcode => unreachable!("{:?} isn't executed by the integer unit", opcode),
    }
}

pub(crate) fn execute_mul(entry: &IQEntry) -> Result<WordType, SimError> {
    let a = entry.src[0].value;
    let b = entry.src[1].value;

    match entry.instr.opcode {
        Opcode::MUL => Ok(a.wrapping_mul(b)),
        Opcode::DIV => {
            if b == 0 {
                return Err(SimError::DivideByZero { pc: entry.pc });
            }
            Ok(a.wrapping_div(b))
        }
        opcode => unreachable!("{:?} isn't executed by the multiply unit", opcode),
    }
}

/// Resolves a control instruction. A taken transfer must land on an
/// instruction inside code memory, or just past it (the implicit HALT).
pub(crate) fn execute_branch(entry: &IQEntry, code_end: WordType) -> Result<BranchOutcome, SimError> {
    // for conditional branches the only source is the flag producer's result
    let a = entry.src[0].value;
    let imm = entry.instr.imm;
    let pc = entry.pc;

    let outcome = match entry.instr.opcode {
        Opcode::BZ => BranchOutcome { taken: a == 0, target: pc.wrapping_add(imm), link: None },
        Opcode::BNZ => BranchOutcome { taken: a != 0, target: pc.wrapping_add(imm), link: None },
        Opcode::BP => BranchOutcome { taken: a > 0, target: pc.wrapping_add(imm), link: None },
        Opcode::BNP => BranchOutcome { taken: a <= 0, target: pc.wrapping_add(imm), link: None },
        Opcode::JUMP => BranchOutcome { taken: true, target: a.wrapping_add(imm), link: None },
        Opcode::JALR => BranchOutcome { taken: true, target: a.wrapping_add(imm), link: Some(pc + INSTR_SIZE) },
        Opcode::RET => BranchOutcome { taken: true, target: a, link: None },
        opcode => unreachable!("{:?} isn't executed by the branch unit", opcode),
    };

    if outcome.taken {
        let target = outcome.target;
        if target < CODE_BASE || target > code_end || (target - CODE_BASE) % INSTR_SIZE != 0 {
            return Err(SimError::InvalidBranchTarget { pc, target });
        }
    }

    Ok(outcome)
}

/// The input latches of the functional units. The integer and branch unit
/// take a single cycle; the multiply unit is a chain of stages of which the
/// first one accepts a new instruction every cycle.
pub(crate) struct EUTable {
    pub(crate) int_unit: Option<IQEntry>,
    pub(crate) mul_stages: [Option<IQEntry>; MUL_STAGES],
    pub(crate) branch_unit: Option<IQEntry>,
}

impl EUTable {
    pub(crate) fn new() -> Self {
        Self {
            int_unit: None,
            mul_stages: Default::default(),
            branch_unit: None,
        }
    }

    pub(crate) fn can_accept(&self, fu_class: FuClass) -> bool {
        match fu_class {
            FuClass::INT => self.int_unit.is_none(),
            FuClass::MUL => self.mul_stages[0].is_none(),
            FuClass::BRANCH => self.branch_unit.is_none(),
        }
    }

    pub(crate) fn accept(&mut self, entry: IQEntry) {
        debug_assert!(self.can_accept(entry.fu_class), "{} unit is busy", entry.fu_class);

        match entry.fu_class {
            FuClass::INT => self.int_unit = Some(entry),
            FuClass::MUL => self.mul_stages[0] = Some(entry),
            FuClass::BRANCH => self.branch_unit = Some(entry),
        }
    }

    /// Moves every multiply stage one step down the chain and returns the
    /// instruction leaving the last stage.
    pub(crate) fn advance_mul(&mut self) -> Option<IQEntry> {
        let finished = self.mul_stages[MUL_STAGES - 1].take();
        for stage in (1..MUL_STAGES).rev() {
            self.mul_stages[stage] = self.mul_stages[stage - 1].take();
        }
        finished
    }
}

impl fmt::Display for EUTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |slot: &Option<IQEntry>| match slot {
            Some(entry) => entry.instr.to_string(),
            None => String::from("-"),
        };

        writeln!(f, "Functional units:")?;
        writeln!(f, "  INT    {}", show(&self.int_unit))?;
        for (stage, slot) in self.mul_stages.iter().enumerate() {
            writeln!(f, "  MUL{}   {}", stage + 1, show(slot))?;
        }
        writeln!(f, "  BRANCH {}", show(&self.branch_unit))
    }
}
