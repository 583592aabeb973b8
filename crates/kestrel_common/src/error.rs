use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for callers deciding how to surface a failure.
///
/// - `UserError`  : malformed expression or unsupported construct; fix the query
/// - `Transient`  : the external data source failed; the caller MAY retry
/// - `InternalBug`: an invariant of this subsystem was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type that all layer errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("SQL compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Physical planner errors. Raised before any data is fetched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Unsupported operator in {context}: {operator}")]
    UnsupportedOperator { operator: String, context: String },

    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Invalid query interval: {0}")]
    InvalidInterval(String),

    #[error("Comparison threshold must be numeric, got {0}")]
    NonNumericThreshold(String),
}

/// SQL statement compiler errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Aggregator {inner} cannot be nested inside aggregator {outer}")]
    NestedAggregator { outer: String, inner: String },

    #[error("Aggregator {function} requires a column identifier argument, got {got}")]
    IdentifierRequired { function: String, got: String },

    #[error("Aggregator {function} expects {expected} argument(s), got {got}")]
    ArgumentCount {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown macro: {{{0}}}")]
    UnknownMacro(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid query interval: {0}")]
    InvalidInterval(String),
}

/// Execution engine errors.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Row count mismatch: column {column} has {got} rows, table has {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        got: usize,
    },

    #[error("Result has no value column")]
    NoValueColumn,

    #[error("Data source {data_source} failed: {reason}")]
    DataSource { data_source: String, reason: String },

    #[error("Unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("SQL compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Internal: {0}")]
    Internal(String),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Plan(_) => ErrorKind::UserError,
            KestrelError::Compile(_) => ErrorKind::UserError,
            KestrelError::Config(_) => ErrorKind::UserError,
            KestrelError::Execution(ExecutionError::Compile(_)) => ErrorKind::UserError,
            KestrelError::Execution(ExecutionError::UnknownDataSource(_)) => ErrorKind::UserError,
            KestrelError::Execution(ExecutionError::TypeError(_)) => ErrorKind::UserError,
            KestrelError::Execution(ExecutionError::DataSource { .. }) => ErrorKind::Transient,
            KestrelError::Execution(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if this is a user/input error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if the caller may retry the whole query.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}
