// The syntax tree produced by the assembly grammar. Operands are kept as raw
// text; range and shape checks are done by the loader so that it can report
// all problems of a program at once.

pub enum Operand {
    Register(String, usize),
    Immediate(String, usize),
}

impl Operand {
    pub fn pos(&self) -> usize {
        match self {
            Operand::Register(_, pos) | Operand::Immediate(_, pos) => *pos,
        }
    }
}

pub struct Instr {
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub pos: usize,
}

pub struct Assembly {
    pub instructions: Vec<Instr>,
}
