use std::fmt;
use thiserror::Error;

/// Named error codes that callers can match on.
///
/// Every protocol or data failure raised by the transaction manager, the
/// `Database` facade and the sessions carries one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TransactionIsRequired,
    TransactionIsNeverRequired,
    TransactionIsAlreadyCompleted,
    TransactionScopeRequired,
    DatabaseNotPartOfTransaction,
    RecordAtLeastOneValueExpected,
    RecordNotFound,
    RecordMultipleFound,
    RecordWithPkNotFound,
    RecordWithPkVersionNotFound,
    RecordMultipleChildFound,
    DatasourceSessionIsClosed,
    DatasourceConnectionUnavailable,
    EntityNotRegistered,
    EmptyCriteria,
    EmptyMultiValueRestriction,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransactionIsRequired => "TRANSACTION_IS_REQUIRED",
            ErrorCode::TransactionIsNeverRequired => "TRANSACTION_IS_NEVER_REQUIRED",
            ErrorCode::TransactionIsAlreadyCompleted => "TRANSACTION_IS_ALREADY_COMPLETED",
            ErrorCode::TransactionScopeRequired => "TRANSACTION_SCOPE_REQUIRED",
            ErrorCode::DatabaseNotPartOfTransaction => "DATABASE_NOT_PART_OF_TRANSACTION",
            ErrorCode::RecordAtLeastOneValueExpected => "RECORD_AT_LEAST_ONE_VALUE_EXPECTED",
            ErrorCode::RecordNotFound => "RECORD_NOT_FOUND",
            ErrorCode::RecordMultipleFound => "RECORD_MULTIPLE_FOUND",
            ErrorCode::RecordWithPkNotFound => "RECORD_WITH_PK_NOT_FOUND",
            ErrorCode::RecordWithPkVersionNotFound => "RECORD_WITH_PK_VERSION_NOT_FOUND",
            ErrorCode::RecordMultipleChildFound => "RECORD_MULTIPLE_CHILD_FOUND",
            ErrorCode::DatasourceSessionIsClosed => "DATASOURCE_SESSION_IS_CLOSED",
            ErrorCode::DatasourceConnectionUnavailable => "DATASOURCE_CONNECTION_UNAVAILABLE",
            ErrorCode::EntityNotRegistered => "ENTITY_NOT_REGISTERED",
            ErrorCode::EmptyCriteria => "EMPTY_CRITERIA",
            ErrorCode::EmptyMultiValueRestriction => "EMPTY_MULTI_VALUE_RESTRICTION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("{code}: {message}")]
    Coded { code: ErrorCode, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl DbError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        DbError::Coded {
            code,
            message: message.into(),
        }
    }

    /// Error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DbError::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
