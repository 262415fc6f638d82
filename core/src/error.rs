//! Error handling for this crate
use thiserror::Error;

/// A Result carrying an ErrorKind with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// Classification of a failed operation
///
/// Every fallible operation in the supervisor reports one of these kinds;
/// the attached anyhow error carries the concrete diagnostic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Invalid state")]
    InvalidState,
    #[error("Not found")]
    NotFound,
    #[error("Resource exhausted")]
    ResourceExhausted,
    #[error("I/O error")]
    Io,
    #[error("External command failed")]
    ExternalCommandFailed,
    #[error("Lock failed")]
    LockFailed,
    #[error("Expression syntax error")]
    ParseSyntax,
    #[error("Unknown operator in expression")]
    ParseUnknownOp,
    #[error("Invalid parameter reference in expression")]
    ParseInvalidParamRef,
}

/// Combination of an ErrorKind with an anyhow error
#[derive(Error, Debug)]
#[error("{kind:?}: {source:?}")]
pub struct TypedError {
    kind: ErrorKind,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(kind: ErrorKind, source: anyhow::Error) -> Self {
        Self { kind, source }
    }
    /// Returns the ErrorKind of this TypedError
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, kind: ErrorKind) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, kind: ErrorKind) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            kind,
            source: e.into(),
        })
    }
}
