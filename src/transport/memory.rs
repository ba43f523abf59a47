//! In-process table shared by the tuner and a simulated robot.
//!
//! The tuner side goes through [`TableTransport`] and sees connection state;
//! the robot side uses the `peer_*` methods, which always work. Write counters
//! and fault switches make the transport observable in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{TableTransport, TableValue, TransportError};

/// DashMap-backed table.
///
/// Cloning is cheap and every clone shares the same table.
#[derive(Clone, Default)]
pub struct MemoryTable {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, TableValue>,
    writes: DashMap<String, u64>,
    total_writes: AtomicU64,
    flushes: AtomicU64,
    connects: AtomicU64,
    connected: AtomicBool,
    unreachable: AtomicBool,
    reject_puts: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    target: Mutex<Option<String>>,
}

impl MemoryTable {
    /// Empty, reachable, not yet connected table.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Robot side ──────────────────────────────────────────────────────

    /// Write a key as the robot would. Not counted as a tuner write.
    pub fn peer_put(&self, key: &str, value: impl Into<TableValue>) {
        self.inner.entries.insert(key.to_string(), value.into());
    }

    /// Read a key as the robot would, regardless of the tuner's session.
    pub fn peer_get(&self, key: &str) -> Option<TableValue> {
        self.inner.entries.get(key).map(|v| v.clone())
    }

    /// Read a number as the robot would.
    pub fn peer_number(&self, key: &str) -> Option<f64> {
        match self.peer_get(key) {
            Some(TableValue::Number(v)) => Some(v),
            _ => None,
        }
    }

    /// Read a boolean as the robot would.
    pub fn peer_bool(&self, key: &str) -> Option<bool> {
        match self.peer_get(key) {
            Some(TableValue::Boolean(v)) => Some(v),
            _ => None,
        }
    }

    /// Read a string as the robot would.
    pub fn peer_text(&self, key: &str) -> Option<String> {
        match self.peer_get(key) {
            Some(TableValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    // ─── Fault injection ─────────────────────────────────────────────────

    /// Make the peer unreachable: connects fail and an open session drops.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
        if !reachable {
            self.inner.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Delay every connect attempt, to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Reject every tuner write while the session stays open.
    pub fn set_reject_puts(&self, reject: bool) {
        self.inner.reject_puts.store(reject, Ordering::SeqCst);
    }

    // ─── Observation ─────────────────────────────────────────────────────

    /// Number of tuner writes to `key`.
    pub fn write_count(&self, key: &str) -> u64 {
        self.inner.writes.get(key).map_or(0, |c| *c)
    }

    /// Number of tuner writes across all keys.
    pub fn total_writes(&self) -> u64 {
        self.inner.total_writes.load(Ordering::SeqCst)
    }

    /// Number of flushes.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Address of the last successful connect.
    pub fn target(&self) -> Option<String> {
        self.inner.target.lock().clone()
    }
}

#[async_trait]
impl TableTransport for MemoryTable {
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                target: target.to_string(),
                reason: "peer unreachable".into(),
            });
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *self.inner.target.lock() = Some(target.to_string());
        debug!(target = target, "memory table connected");
        Ok(())
    }

    fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            debug!("memory table disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn get(&self, key: &str) -> Result<Option<TableValue>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.peer_get(key))
    }

    fn put(&self, key: &str, value: TableValue) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.inner.reject_puts.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                key: key.to_string(),
                reason: "write rejected by peer".into(),
            });
        }
        self.inner.entries.insert(key.to_string(), value);
        *self.inner.writes.entry(key.to_string()).or_insert(0) += 1;
        self.inner.total_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
