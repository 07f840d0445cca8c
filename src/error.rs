use std::io;

use thiserror::Error;

use crate::instructions::instructions::WordType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    IOError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal conditions raised while the pipeline is running. The simulation
/// stops at the cycle the condition is detected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SimError {
    #[error("division by zero at pc {pc}")]
    DivideByZero { pc: WordType },

    #[error("data memory address {addr} out of bounds (size {size}) at pc {pc}")]
    MemoryOutOfBounds { pc: WordType, addr: WordType, size: usize },

    #[error("invalid control transfer to {target} at pc {pc}")]
    InvalidBranchTarget { pc: WordType, target: WordType },
}
