use thiserror::Error;

/// Every non-fatal outcome the executor façade can report (spec §7).
///
/// I/O failures, partial writes, and "can't acquire a page" conditions are
/// fatal by design and do not appear here — see [`crate::storage::pager::fatal`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DbError {
    // --- validation errors: user input, state left untouched ---
    #[error("syntax error")]
    SyntaxError,
    #[error("unrecognized statement")]
    UnrecognizedStatement,
    #[error("id must not be negative")]
    NegativeId,
    #[error("string too long for column '{0}' (max {1} bytes)")]
    StringTooLong(String, usize),

    // --- semantic errors: state left untouched ---
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error("duplicate key {0}")]
    DuplicateKey(String),
    #[error("table '{0}' already exists")]
    TableAlreadyExists(String),
    #[error("maximum number of tables reached")]
    MaxTablesReached,
    #[error("expected {expected} columns, got {got}")]
    ColumnCountMismatch { expected: usize, got: usize },
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("a transaction is already active")]
    AlreadyInTransaction,

    // --- operational errors ---
    #[error("table is full: node cannot be split further")]
    TableFull,
}

pub type DbResult<T> = Result<T, DbError>;

/// Maps a [`DbError`] to the short response tag spec §6.2 enumerates for the
/// caller-facing response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTag {
    Success,
    DuplicateKey,
    TableFull,
    SyntaxError,
    StringTooLong,
    NegativeId,
    UnrecognizedStatement,
    Error,
}

impl DbError {
    pub fn response_tag(&self) -> ResponseTag {
        match self {
            DbError::DuplicateKey(..) => ResponseTag::DuplicateKey,
            DbError::TableFull => ResponseTag::TableFull,
            DbError::SyntaxError => ResponseTag::SyntaxError,
            DbError::StringTooLong(..) => ResponseTag::StringTooLong,
            DbError::NegativeId => ResponseTag::NegativeId,
            DbError::UnrecognizedStatement => ResponseTag::UnrecognizedStatement,
            _ => ResponseTag::Error,
        }
    }
}
