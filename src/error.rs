//! Error types for mysql-queryable.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors are classified once, at the boundary, so callers (and the
//! transaction retry loop) match on variants instead of raw MySQL error numbers.

use std::fmt;
use std::io::ErrorKind;
use std::panic::Location;
use thiserror::Error;

/// MySQL `ER_LOCK_DEADLOCK`: the server picked this transaction as a deadlock victim.
pub const ER_LOCK_DEADLOCK: u16 = 1213;

/// Source location of the application call that issued a statement.
pub type CallSite = &'static Location<'static>;

#[derive(Error, Debug)]
pub enum DbError {
    /// The server could not be reached at all (refused, unreachable, unknown host).
    #[error("Cannot reach database server: {message}")]
    Connectivity { message: String, suggestion: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection pool exhausted: no connection available after {elapsed_secs}s")]
    PoolExhausted { elapsed_secs: u64 },

    #[error("Database error: {message}{}", call_site_suffix(.location))]
    Database {
        message: String,
        /// MySQL error number, e.g. 1064 for a syntax error
        code: Option<u16>,
        /// e.g., "42S02" for an unknown table
        sql_state: Option<String>,
        location: Option<CallSite>,
    },

    #[error("Deadlock found when trying to get lock: {message}{}", call_site_suffix(.location))]
    Deadlock {
        message: String,
        location: Option<CallSite>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection already released back to the pool")]
    Released,

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// An error raised by application code inside a transaction callback.
    #[error(transparent)]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

fn call_site_suffix(location: &Option<CallSite>) -> String {
    match location {
        Some(location) => format!(" (at {})", location),
        None => String::new(),
    }
}

impl DbError {
    /// Create a connectivity error with a helpful suggestion.
    pub fn connectivity(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement error with optional MySQL error number and SQL state.
    pub fn database(
        message: impl Into<String>,
        code: Option<u16>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            code,
            sql_state,
            location: None,
        }
    }

    /// Create a deadlock error.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::Deadlock {
            message: message.into(),
            location: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an application error raised inside a transaction callback.
    ///
    /// ```
    /// use mysql_queryable::DbError;
    ///
    /// let err = DbError::callback("Fail!");
    /// assert_eq!(err.to_string(), "Fail!");
    /// ```
    pub fn callback(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Callback(err.into())
    }

    /// Attach the application call site to a statement error.
    ///
    /// Only statement errors carry a location, and the first location wins so an
    /// error passing through several layers keeps the outermost caller that
    /// captured it first.
    pub fn at(mut self, caller: CallSite) -> Self {
        match &mut self {
            Self::Database { location, .. } | Self::Deadlock { location, .. } => {
                location.get_or_insert(caller);
            }
            _ => {}
        }
        self
    }

    /// The application call site recorded for this error, if any.
    pub fn location(&self) -> Option<CallSite> {
        match self {
            Self::Database { location, .. } | Self::Deadlock { location, .. } => *location,
            _ => None,
        }
    }

    /// MySQL error number reported by the server.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Database { code, .. } => *code,
            Self::Deadlock { .. } => Some(ER_LOCK_DEADLOCK),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connectivity { suggestion, .. } => Some(suggestion),
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True when the server picked this transaction as a deadlock victim.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }

    /// True when the server is not (yet) accepting connections.
    ///
    /// A refused server surfaces either directly as an I/O error or, when the pool
    /// keeps retrying the connect until its acquire timeout, as pool exhaustion.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::PoolExhausted { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. }
                | Self::PoolExhausted { .. }
                | Self::Timeout { .. }
                | Self::Deadlock { .. }
        )
    }
}

/// True for I/O failures that mean "nothing is listening there (yet)".
fn is_unreachable_io(err: &std::io::Error) -> bool {
    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::NotFound
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::AddrNotAvailable => true,
        _ => {
            // Resolver failures come back uncategorized; the message is all we get.
            let message = err.to_string().to_lowercase();
            message.contains("failed to lookup address")
                || message.contains("name or service not known")
                || message.contains("nodename nor servname")
                || message.contains("no such host")
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let number = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number());
                if number == Some(ER_LOCK_DEADLOCK) {
                    return DbError::deadlock(message);
                }
                let sql_state = db_err.code().map(|c| c.to_string());
                DbError::database(message, number, sql_state)
            }
            sqlx::Error::RowNotFound => DbError::database("No rows returned", None, None),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted { elapsed_secs: 0 },
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Create a new Db instance")
            }
            sqlx::Error::Io(io_err) if is_unreachable_io(&io_err) => DbError::connectivity(
                format!("I/O error: {}", io_err),
                "Check that the MySQL server is running and the host name resolves",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::decode(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::decode(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::decode(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::decode(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Short, log-friendly classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connectivity,
    Connection,
    Statement,
    Deadlock,
    Application,
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connectivity => "connectivity",
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::Deadlock => "deadlock",
            Self::Application => "application",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

impl DbError {
    /// Classify this error for logging.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connectivity { .. } | Self::PoolExhausted { .. } => ErrorClass::Connectivity,
            Self::Connection { .. } => ErrorClass::Connection,
            Self::Database { .. } | Self::Timeout { .. } => ErrorClass::Statement,
            Self::Deadlock { .. } => ErrorClass::Deadlock,
            Self::Callback(_) => ErrorClass::Application,
            _ => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connectivity("refused", "Start the server");
        assert_eq!(err.suggestion(), Some("Start the server"));
        assert_eq!(DbError::Released.suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::deadlock("victim").is_retryable());
        assert!(!DbError::connection("auth", "sugg").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_unavailable_only_for_unreachable_server() {
        assert!(DbError::connectivity("refused", "").is_unavailable());
        assert!(DbError::PoolExhausted { elapsed_secs: 30 }.is_unavailable());
        assert!(!DbError::connection("Access denied", "").is_unavailable());
        assert!(!DbError::database("syntax", Some(1064), None).is_unavailable());
    }

    #[test]
    fn test_refused_io_error_is_connectivity() {
        let io = std::io::Error::new(ErrorKind::ConnectionRefused, "connection refused");
        let err = DbError::from(sqlx::Error::Io(io));
        assert!(matches!(err, DbError::Connectivity { .. }));
    }

    #[test]
    fn test_dns_failure_is_connectivity() {
        let io = std::io::Error::other(
            "failed to lookup address information: Name or service not known",
        );
        let err = DbError::from(sqlx::Error::Io(io));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_reset_io_error_is_connection() {
        let io = std::io::Error::new(ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::from(sqlx::Error::Io(io));
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_pool_timeout_maps_to_pool_exhausted() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::PoolExhausted { .. }));
    }

    #[test]
    fn test_deadlock_code() {
        let err = DbError::deadlock("try restarting transaction");
        assert!(err.is_deadlock());
        assert_eq!(err.code(), Some(ER_LOCK_DEADLOCK));
        assert_eq!(err.class(), ErrorClass::Deadlock);
    }

    #[test]
    fn test_call_site_is_attached_once() {
        let first = Location::caller();
        let second = Location::caller();
        let err = DbError::database("Unknown column 'blah'", Some(1054), None)
            .at(first)
            .at(second);
        assert_eq!(err.location(), Some(first));
        let rendered = err.to_string();
        assert!(rendered.contains(file!()), "{rendered}");
    }

    #[test]
    fn test_call_site_ignored_for_non_statement_errors() {
        let err = DbError::Released.at(Location::caller());
        assert_eq!(err.location(), None);
    }

    #[test]
    fn test_callback_error_is_transparent() {
        let err = DbError::callback("Fail!");
        assert_eq!(err.to_string(), "Fail!");
        assert_eq!(err.class(), ErrorClass::Application);
        assert!(!err.is_deadlock());
    }
}
