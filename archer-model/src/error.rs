use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownModule(String),
    UnknownStatus(String),
    InvalidId(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownModule(name) => {
                write!(f, "'{name}' is not a valid module")
            }
            ModelError::UnknownStatus(status) => {
                write!(f, "unknown status '{status}'")
            }
            ModelError::InvalidId(id) => write!(f, "invalid id '{id}'"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
