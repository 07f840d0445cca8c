use std::fmt;
use std::rc::Rc;

use crate::cpu::{ARCH_REG_CNT, CODE_BASE, INSTR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    ADD,
    SUB,
    MUL,
    DIV,
    AND,
    OR,
    XOR,
    ADDL,
    SUBL,
    MOVC,
    LOAD,
    STORE,
    CMP,
    BZ,
    BNZ,
    BP,
    BNP,
    JUMP,
    JALR,
    RET,
    NOP,
    HALT,
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::MUL => "MUL",
        Opcode::DIV => "DIV",
        Opcode::AND => "AND",
        Opcode::OR => "OR",
        Opcode::XOR => "XOR",
        Opcode::ADDL => "ADDL",
        Opcode::SUBL => "SUBL",
        Opcode::MOVC => "MOVC",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::CMP => "CMP",
        Opcode::BZ => "BZ",
        Opcode::BNZ => "BNZ",
        Opcode::BP => "BP",
        Opcode::BNP => "BNP",
        Opcode::JUMP => "JUMP",
        Opcode::JALR => "JALR",
        Opcode::RET => "RET",
        Opcode::NOP => "NOP",
        Opcode::HALT => "HALT",
    }
}

pub(crate) fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();
    let mnemonic_uppercased = string.as_str();

    match mnemonic_uppercased {
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "MUL" => Some(Opcode::MUL),
        "DIV" => Some(Opcode::DIV),
        "AND" => Some(Opcode::AND),
        "OR" => Some(Opcode::OR),
        // EX-OR is an accepted alias
        "XOR" | "EX-OR" => Some(Opcode::XOR),
        "ADDL" => Some(Opcode::ADDL),
        "SUBL" => Some(Opcode::SUBL),
        "MOVC" => Some(Opcode::MOVC),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "CMP" => Some(Opcode::CMP),
        "BZ" => Some(Opcode::BZ),
        "BNZ" => Some(Opcode::BNZ),
        "BP" => Some(Opcode::BP),
        "BNP" => Some(Opcode::BNP),
        "JUMP" => Some(Opcode::JUMP),
        "JALR" => Some(Opcode::JALR),
        "RET" => Some(Opcode::RET),
        "NOP" => Some(Opcode::NOP),
        "HALT" => Some(Opcode::HALT),
        _ => None,
    }
}

pub(crate) fn get_register(name: &str) -> Option<RegisterType> {
    let name_uppercased = name.to_uppercase();
    let reg_name = name_uppercased.strip_prefix('R')?;
    let reg: RegisterType = reg_name.parse().ok()?;

    if reg >= ARCH_REG_CNT {
        return None;
    }
    Some(reg)
}

/// The functional unit class an instruction is scheduled on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FuClass {
    INT,
    MUL,
    BRANCH,
}

impl FuClass {
    pub(crate) const ALL: [FuClass; 3] = [FuClass::INT, FuClass::MUL, FuClass::BRANCH];
}

impl fmt::Display for FuClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuClass::INT => write!(f, "INT"),
            FuClass::MUL => write!(f, "MUL"),
            FuClass::BRANCH => write!(f, "BRANCH"),
        }
    }
}

/// A source operand before renaming.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ArchSource {
    Register(RegisterType),
    // The condition codes produced by the most recent flag setting instruction.
    Flags,
}

pub(crate) type RegisterType = u16;
pub(crate) type WordType = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Instr {
    pub(crate) opcode: Opcode,
    pub(crate) rd: Option<RegisterType>,
    pub(crate) rs1: Option<RegisterType>,
    pub(crate) rs2: Option<RegisterType>,
    pub(crate) imm: WordType,
    pub(crate) loc: Option<SourceLocation>,
}

impl Instr {
    pub(crate) fn fu_class(&self) -> Option<FuClass> {
        match self.opcode {
            Opcode::ADD |
            Opcode::SUB |
            Opcode::AND |
            Opcode::OR |
            Opcode::XOR |
            Opcode::ADDL |
            Opcode::SUBL |
            Opcode::MOVC |
            Opcode::CMP |
            Opcode::LOAD |
            Opcode::STORE => Some(FuClass::INT),
            Opcode::MUL |
            Opcode::DIV => Some(FuClass::MUL),
            Opcode::BZ |
            Opcode::BNZ |
            Opcode::BP |
            Opcode::BNP |
            Opcode::JUMP |
            Opcode::JALR |
            Opcode::RET => Some(FuClass::BRANCH),
            Opcode::NOP |
            Opcode::HALT => None,
        }
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self.opcode, Opcode::LOAD | Opcode::STORE)
    }

    /// True if the instruction redirects the PC; the frontend won't fetch
    /// past it until the branch unit resolved it.
    pub(crate) fn is_control(&self) -> bool {
        self.fu_class() == Some(FuClass::BRANCH)
    }

    /// DIV and the logical operations leave the condition codes alone.
    pub(crate) fn sets_flags(&self) -> bool {
        matches!(self.opcode,
            Opcode::ADD | Opcode::ADDL | Opcode::SUB | Opcode::SUBL | Opcode::MUL | Opcode::MOVC | Opcode::CMP)
    }

    /// An instruction needs a physical register when it writes a register or
    /// produces condition codes.
    pub(crate) fn needs_phys_reg(&self) -> bool {
        self.rd.is_some() || self.sets_flags()
    }

    pub(crate) fn sources(&self) -> [Option<ArchSource>; 2] {
        match self.opcode {
            Opcode::BZ |
            Opcode::BNZ |
            Opcode::BP |
            Opcode::BNP => [Some(ArchSource::Flags), None],
            _ => [self.rs1.map(ArchSource::Register), self.rs2.map(ArchSource::Register)],
        }
    }
}

#[allow(non_snake_case)]
pub(crate) const fn create_HALT(loc: Option<SourceLocation>) -> Instr {
    Instr {
        opcode: Opcode::HALT,
        rd: None,
        rs1: None,
        rs2: None,
        imm: 0,
        loc,
    }
}

// Supplied by the frontend when it fetches beyond the end of code memory.
pub(crate) const HALT: Instr = create_HALT(None);

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = |r: Option<RegisterType>| r.map_or(String::from("R?"), |r| format!("R{}", r));

        write!(f, "{}", mnemonic(self.opcode))?;

        match self.opcode {
            Opcode::ADD |
            Opcode::SUB |
            Opcode::MUL |
            Opcode::DIV |
            Opcode::AND |
            Opcode::OR |
            Opcode::XOR => write!(f, ",{},{},{}", reg(self.rd), reg(self.rs1), reg(self.rs2))?,
            Opcode::ADDL |
            Opcode::SUBL |
            Opcode::LOAD |
            Opcode::JALR => write!(f, ",{},{},#{}", reg(self.rd), reg(self.rs1), self.imm)?,
            Opcode::STORE => write!(f, ",{},{},#{}", reg(self.rs2), reg(self.rs1), self.imm)?,
            Opcode::MOVC => write!(f, ",{},#{}", reg(self.rd), self.imm)?,
            Opcode::CMP => write!(f, ",{},{}", reg(self.rs1), reg(self.rs2))?,
            Opcode::BZ |
            Opcode::BNZ |
            Opcode::BP |
            Opcode::BNP => write!(f, ",#{}", self.imm)?,
            Opcode::JUMP => write!(f, ",{},#{}", reg(self.rs1), self.imm)?,
            Opcode::RET => write!(f, ",{}", reg(self.rs1))?,
            Opcode::NOP |
            Opcode::HALT => {}
        }

        if let Some(loc) = self.loc {
            write!(f, " ; {}", loc)?;
        }

        Ok(())
    }
}

pub(crate) struct Program {
    pub(crate) code: Vec<Rc<Instr>>,
}

impl Program {
    pub(crate) fn new(code: Vec<Instr>) -> Self {
        Self { code: code.into_iter().map(Rc::new).collect() }
    }

    /// The instruction at the given PC, or None when the PC doesn't point
    /// into code memory.
    pub(crate) fn get_instr(&self, pc: WordType) -> Option<Rc<Instr>> {
        let index = code_index(pc)?;
        self.code.get(index).map(Rc::clone)
    }

    /// The first PC past the last instruction.
    pub(crate) fn end_pc(&self) -> WordType {
        CODE_BASE + self.code.len() as WordType * INSTR_SIZE
    }
}

pub(crate) fn code_index(pc: WordType) -> Option<usize> {
    if pc < CODE_BASE || (pc - CODE_BASE) % INSTR_SIZE != 0 {
        return None;
    }
    Some(((pc - CODE_BASE) / INSTR_SIZE) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(opcode: Opcode, rd: Option<RegisterType>, rs1: Option<RegisterType>, rs2: Option<RegisterType>, imm: WordType) -> Instr {
        Instr { opcode, rd, rs1, rs2, imm, loc: None }
    }

    #[test]
    fn test_fu_class() {
        assert_eq!(instr(Opcode::ADD, Some(1), Some(2), Some(3), 0).fu_class(), Some(FuClass::INT));
        assert_eq!(instr(Opcode::DIV, Some(1), Some(2), Some(3), 0).fu_class(), Some(FuClass::MUL));
        assert_eq!(instr(Opcode::BNZ, None, None, None, 8).fu_class(), Some(FuClass::BRANCH));
        assert_eq!(HALT.fu_class(), None);
    }

    #[test]
    fn test_conditional_branch_reads_flags() {
        let bz = instr(Opcode::BZ, None, None, None, -8);
        assert_eq!(bz.sources(), [Some(ArchSource::Flags), None]);
        assert!(bz.is_control());
        assert!(!bz.needs_phys_reg());
    }

    #[test]
    fn test_cmp_needs_phys_reg_for_flags() {
        let cmp = instr(Opcode::CMP, None, Some(1), Some(2), 0);
        assert!(cmp.needs_phys_reg());
        assert_eq!(cmp.sources(), [Some(ArchSource::Register(1)), Some(ArchSource::Register(2))]);
    }

    #[test]
    fn test_flag_producers() {
        assert!(instr(Opcode::MOVC, Some(1), None, None, 0).sets_flags());
        assert!(instr(Opcode::SUBL, Some(1), Some(1), None, 1).sets_flags());
        assert!(!instr(Opcode::DIV, Some(1), Some(2), Some(3), 0).sets_flags());
        assert!(!instr(Opcode::XOR, Some(1), Some(2), Some(3), 0).sets_flags());
        assert!(!instr(Opcode::LOAD, Some(1), Some(2), None, 0).sets_flags());
    }

    #[test]
    fn test_ret() {
        let ret = instr(Opcode::RET, None, Some(6), None, 0);
        assert_eq!(get_opcode("ret"), Some(Opcode::RET));
        assert!(ret.is_control());
        assert!(!ret.needs_phys_reg());
        assert_eq!(ret.sources(), [Some(ArchSource::Register(6)), None]);
        assert_eq!(ret.to_string(), "RET,R6");
    }

    #[test]
    fn test_get_register() {
        assert_eq!(get_register("R0"), Some(0));
        assert_eq!(get_register("r15"), Some(15));
        assert_eq!(get_register("R16"), None);
        assert_eq!(get_register("X1"), None);
    }

    #[test]
    fn test_display() {
        let store = instr(Opcode::STORE, None, Some(0), Some(1), 4);
        assert_eq!(store.to_string(), "STORE,R1,R0,#4");
        assert_eq!(instr(Opcode::MOVC, Some(3), None, None, -2).to_string(), "MOVC,R3,#-2");
    }

    #[test]
    fn test_get_instr() {
        let program = Program::new(vec![instr(Opcode::NOP, None, None, None, 0), HALT]);
        assert_eq!(program.get_instr(4000).map(|i| i.opcode), Some(Opcode::NOP));
        assert_eq!(program.get_instr(4004).map(|i| i.opcode), Some(Opcode::HALT));
        assert!(program.get_instr(4008).is_none());
        assert!(program.get_instr(4002).is_none());
        assert_eq!(program.end_pc(), 4008);
    }
}
