use std::fs;
use std::io;

use lalrpop_util::ParseError;
use log::info;
use thiserror::Error;

use crate::assembly::AssemblyParser;
use crate::cpu::INSTR_SIZE;
use crate::instructions::instructions::{get_opcode, get_register, Instr, Opcode, Program, RegisterType, SourceLocation, WordType};
use crate::loader::ast;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("program file '{0}' not found")]
    NotFoundError(String),

    #[error("failed to read program file '{path}': {source}")]
    IOError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    ParseError(String),

    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
}

/// The shape an operand must have at a given position.
#[derive(Clone, Copy, PartialEq, Debug)]
enum OperandKind {
    Register,
    Immediate,
}

impl OperandKind {
    fn describe(&self) -> &'static str {
        match self {
            OperandKind::Register => "a register",
            OperandKind::Immediate => "a literal",
        }
    }
}

fn operand_kinds(opcode: Opcode) -> &'static [OperandKind] {
    use OperandKind::{Immediate, Register};

    match opcode {
        Opcode::ADD |
        Opcode::SUB |
        Opcode::MUL |
        Opcode::DIV |
        Opcode::AND |
        Opcode::OR |
        Opcode::XOR => &[Register, Register, Register],
        Opcode::ADDL |
        Opcode::SUBL |
        Opcode::LOAD |
        Opcode::STORE |
        Opcode::JALR => &[Register, Register, Immediate],
        Opcode::MOVC => &[Register, Immediate],
        Opcode::CMP => &[Register, Register],
        Opcode::JUMP => &[Register, Immediate],
        Opcode::RET => &[Register],
        Opcode::BZ |
        Opcode::BNZ |
        Opcode::BP |
        Opcode::BNP => &[Immediate],
        Opcode::NOP |
        Opcode::HALT => &[],
    }
}

enum OperandValue {
    Register(RegisterType),
    Immediate(WordType),
}

struct Loader<'a> {
    input: &'a str,
    errors: Vec<String>,
}

impl<'a> Loader<'a> {
    fn new(input: &'a str) -> Self {
        Loader { input, errors: Vec::new() }
    }

    fn load(mut self) -> Result<Program, LoadError> {
        let assembly = match AssemblyParser::new().parse(self.input) {
            Ok(assembly) => assembly,
            Err(err) => return Err(LoadError::ParseError(self.describe_parse_error(err))),
        };

        let mut code = Vec::with_capacity(assembly.instructions.len());
        for ast_instr in &assembly.instructions {
            if let Some(instr) = self.analyze_instr(ast_instr) {
                code.push(instr);
            }
        }

        if !self.errors.is_empty() {
            return Err(LoadError::AnalysisError(self.errors));
        }

        Ok(Program::new(code))
    }

    fn analyze_instr(&mut self, ast_instr: &ast::Instr) -> Option<Instr> {
        let loc = self.get_line_column(ast_instr.pos);

        let opcode = match get_opcode(&ast_instr.mnemonic) {
            Some(opcode) => opcode,
            None => {
                self.errors.push(format!("Unknown mnemonic '{}' at {}", ast_instr.mnemonic, loc));
                return None;
            }
        };

        let kinds = operand_kinds(opcode);
        if ast_instr.operands.len() != kinds.len() {
            self.errors.push(format!("{:?} expects {} operands, but {} are provided at {}",
                                     opcode, kinds.len(), ast_instr.operands.len(), loc));
            return None;
        }

        let mut values = Vec::with_capacity(kinds.len());
        for (index, (operand, kind)) in ast_instr.operands.iter().zip(kinds).enumerate() {
            values.push(self.analyze_operand(opcode, index, operand, *kind)?);
        }

        let reg = |index: usize| match values[index] {
            OperandValue::Register(reg) => Some(reg),
            OperandValue::Immediate(_) => None,
        };
        let imm = |index: usize| match values[index] {
            OperandValue::Immediate(value) => value,
            OperandValue::Register(_) => 0,
        };

        let mut instr = Instr { opcode, rd: None, rs1: None, rs2: None, imm: 0, loc: Some(loc) };
        match opcode {
            Opcode::ADD |
            Opcode::SUB |
            Opcode::MUL |
            Opcode::DIV |
            Opcode::AND |
            Opcode::OR |
            Opcode::XOR => {
                instr.rd = reg(0);
                instr.rs1 = reg(1);
                instr.rs2 = reg(2);
            }
            Opcode::ADDL |
            Opcode::SUBL |
            Opcode::LOAD |
            Opcode::JALR => {
                instr.rd = reg(0);
                instr.rs1 = reg(1);
                instr.imm = imm(2);
            }
            Opcode::STORE => {
                // STORE <data>, <base>, #offset
                instr.rs2 = reg(0);
                instr.rs1 = reg(1);
                instr.imm = imm(2);
            }
            Opcode::MOVC => {
                instr.rd = reg(0);
                instr.imm = imm(1);
            }
            Opcode::CMP => {
                instr.rs1 = reg(0);
                instr.rs2 = reg(1);
            }
            Opcode::JUMP => {
                instr.rs1 = reg(0);
                instr.imm = imm(1);
            }
            Opcode::RET => instr.rs1 = reg(0),
            Opcode::BZ |
            Opcode::BNZ |
            Opcode::BP |
            Opcode::BNP => {
                instr.imm = imm(0);
                if instr.imm % INSTR_SIZE != 0 {
                    self.errors.push(format!("{:?} offset {} is not a multiple of {} at {}",
                                             opcode, instr.imm, INSTR_SIZE, loc));
                    return None;
                }
            }
            Opcode::NOP |
            Opcode::HALT => {}
        }

        Some(instr)
    }

    fn analyze_operand(&mut self, opcode: Opcode, index: usize, operand: &ast::Operand, kind: OperandKind) -> Option<OperandValue> {
        let loc = self.get_line_column(operand.pos());

        match (operand, kind) {
            (ast::Operand::Register(name, _), OperandKind::Register) => match get_register(name) {
                Some(reg) => Some(OperandValue::Register(reg)),
                None => {
                    self.errors.push(format!("Illegal register '{}' at {}", name, loc));
                    None
                }
            },
            (ast::Operand::Immediate(text, _), OperandKind::Immediate) => match text[1..].parse::<WordType>() {
                Ok(value) => Some(OperandValue::Immediate(value)),
                Err(_) => {
                    self.errors.push(format!("Literal '{}' out of range at {}", text, loc));
                    None
                }
            },
            _ => {
                self.errors.push(format!("{:?} expects {} as operand {} at {}",
                                         opcode, kind.describe(), index + 1, loc));
                None
            }
        }
    }

    fn describe_parse_error<T: std::fmt::Display>(&self, err: ParseError<usize, T, &str>) -> String {
        let pos = match &err {
            ParseError::InvalidToken { location } => *location,
            ParseError::UnrecognizedEof { location, .. } => *location,
            ParseError::UnrecognizedToken { token: (start, _, _), .. } => *start,
            ParseError::ExtraToken { token: (start, _, _) } => *start,
            ParseError::User { .. } => 0,
        };
        format!("Parse error at {}: {}", self.get_line_column(pos), err)
    }

    fn get_line_column(&self, pos: usize) -> SourceLocation {
        let prefix = &self.input[..pos.min(self.input.len())];
        let line = prefix.matches('\n').count() + 1;
        let column = match prefix.rfind('\n') {
            Some(newline) => pos - newline,
            None => pos + 1,
        };
        SourceLocation { line, column }
    }
}

pub fn load_from_string(src: &str) -> Result<Program, LoadError> {
    Loader::new(src).load()
}

pub fn load(path: &str) -> Result<Program, LoadError> {
    let input = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LoadError::NotFoundError(path.to_string()));
        }
        Err(source) => {
            return Err(LoadError::IOError { path: path.to_string(), source });
        }
    };

    let program = load_from_string(&input)?;
    info!("Loaded {} instructions from {}", program.code.len(), path);
    Ok(program)
}
