//! # Stage: Remote Table Transport
//!
//! ## Responsibility
//! Abstract the networked key-value table shared with the robot controller:
//! a connect/disconnect session offering typed get/put of numbers, booleans
//! and strings at hierarchical key paths (`/FiringSolver/Hit`).
//!
//! ## Guarantees
//! - Object-safe: the link holds an `Arc<dyn TableTransport>`
//! - Bounded: `connect` is the only async operation, every other call returns
//!   immediately (poll-based reads, fire-and-forget writes)
//! - Typed: a value of the wrong type is reported as
//!   [`TransportError::TypeMismatch`], never silently coerced
//!
//! ## NOT Responsible For
//! - Timeouts and reconnect pacing (that belongs to `link` and `coordinator`)
//! - Rate limiting (that belongs to `link`)
//! - Key layout (that belongs to `link::keys`)

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryTable;

/// A value stored in the table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    /// IEEE-754 double, the table's only numeric type.
    Number(f64),
    /// Boolean flag.
    Boolean(bool),
    /// UTF-8 string.
    Text(String),
}

impl TableValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            TableValue::Number(_) => "number",
            TableValue::Boolean(_) => "boolean",
            TableValue::Text(_) => "string",
        }
    }
}

impl From<f64> for TableValue {
    fn from(v: f64) -> Self {
        TableValue::Number(v)
    }
}

impl From<bool> for TableValue {
    fn from(v: bool) -> Self {
        TableValue::Boolean(v)
    }
}

impl From<&str> for TableValue {
    fn from(v: &str) -> Self {
        TableValue::Text(v.to_string())
    }
}

impl From<String> for TableValue {
    fn from(v: String) -> Self {
        TableValue::Text(v)
    }
}

/// Transport-level failures.
///
/// All of them are recoverable; the caller retries on its own schedule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// A connect attempt failed.
    #[error("connect to {target} failed: {reason}")]
    ConnectFailed {
        /// Address that was dialled.
        target: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The table refused a read or write.
    #[error("operation on {key} rejected: {reason}")]
    Rejected {
        /// Key involved.
        key: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The stored value has a different type than requested.
    #[error("{key} holds a {found}, expected a {expected}")]
    TypeMismatch {
        /// Key involved.
        key: String,
        /// Requested type.
        expected: &'static str,
        /// Stored type.
        found: &'static str,
    },
}

/// Session over a shared key-value table.
///
/// Implementations use interior mutability so one session can be shared
/// between the link and diagnostics.
#[async_trait]
pub trait TableTransport: Send + Sync {
    /// Open a session to `target`. Callers bound this with a timeout.
    async fn connect(&self, target: &str) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    fn disconnect(&self);

    /// Last-known session state.
    fn is_connected(&self) -> bool;

    /// Read a key. `Ok(None)` means the key has never been written.
    fn get(&self, key: &str) -> Result<Option<TableValue>, TransportError>;

    /// Write a key.
    fn put(&self, key: &str, value: TableValue) -> Result<(), TransportError>;

    /// Push buffered writes to the peer.
    fn flush(&self) -> Result<(), TransportError>;

    /// Read a number.
    fn get_number(&self, key: &str) -> Result<Option<f64>, TransportError> {
        match self.get(key)? {
            None => Ok(None),
            Some(TableValue::Number(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, "number", &other)),
        }
    }

    /// Read a boolean.
    fn get_bool(&self, key: &str) -> Result<Option<bool>, TransportError> {
        match self.get(key)? {
            None => Ok(None),
            Some(TableValue::Boolean(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, "boolean", &other)),
        }
    }

    /// Read a string.
    fn get_text(&self, key: &str) -> Result<Option<String>, TransportError> {
        match self.get(key)? {
            None => Ok(None),
            Some(TableValue::Text(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, "string", &other)),
        }
    }
}

fn mismatch(key: &str, expected: &'static str, found: &TableValue) -> TransportError {
    TransportError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}
