//! # Stage: Tuner Coordinator
//!
//! ## Responsibility
//! Own the background loop that ties the robot link to the optimizer:
//! lifecycle, per-iteration scheduling, interlocks, autotune versus manual
//! triggering, the command queue and bounded graceful shutdown.
//!
//! ## Guarantees
//! - Single writer: one tokio task mutates link and optimizer state
//! - Non-blocking: [`TunerHandle::send`] never waits; a full queue is
//!   reported as [`TunerError::CommandQueueFull`]
//! - Isolated: each iteration runs under `catch_unwind`; a panic is counted,
//!   logged at error level, and the next tick runs normally
//! - Each sink delivery is isolated the same way and never repeated
//! - Bounded: [`TunerCoordinator::stop`] waits at most
//!   `graceful_shutdown_timeout` before aborting the task
//! - The robot session is released on every exit path
//!
//! ## NOT Responsible For
//! - Choosing values (that belongs to `optimizer`)
//! - Key layout and rate limiting (that belongs to `link`)
//! - Rendering status (the presentation layer subscribes to snapshots)

pub mod command;
mod engine;
pub mod status;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use command::TunerCommand;
pub use status::{ErrorCounts, Lifecycle, TunerStatus};

use self::engine::{LoopChannels, SharedCommands, SharedSink, TunerCore};
use crate::config::TunerConfig;
use crate::optimizer::history::{CampaignTransition, EvaluationRecord};
use crate::transport::TableTransport;
use crate::TunerError;

// ── Export seam ────────────────────────────────────────────────────────────

/// Receives every accepted evaluation and every campaign transition exactly
/// once, in the order they happened.
///
/// Called from the loop task; implementations must not block.
pub trait EvaluationSink: Send {
    /// An accepted shot.
    fn on_evaluation(&mut self, record: &EvaluationRecord);

    /// A campaign phase change.
    fn on_transition(&mut self, _transition: &CampaignTransition) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EvaluationSink for NullSink {
    fn on_evaluation(&mut self, _record: &EvaluationRecord) {}
}

// ── Handle ─────────────────────────────────────────────────────────────────

/// Cloneable handle for the presentation layer.
#[derive(Clone)]
pub struct TunerHandle {
    commands: mpsc::Sender<TunerCommand>,
    status: watch::Receiver<Arc<TunerStatus>>,
}

impl TunerHandle {
    /// Enqueue a command for the next iteration.
    ///
    /// # Errors
    ///
    /// - [`TunerError::CommandQueueFull`] if the queue is at capacity.
    /// - [`TunerError::ChannelClosed`] if the coordinator was dropped.
    pub fn send(&self, cmd: TunerCommand) -> Result<(), TunerError> {
        self.commands.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => TunerError::CommandQueueFull,
            TrySendError::Closed(_) => TunerError::ChannelClosed,
        })
    }

    /// Latest snapshot.
    pub fn status(&self) -> Arc<TunerStatus> {
        Arc::clone(&self.status.borrow())
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TunerStatus>> {
        self.status.clone()
    }
}

// ── Coordinator ────────────────────────────────────────────────────────────

/// Owner of the tuner loop.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use shooter_tuner::{MemoryTable, NullSink, TunerConfig, TunerCoordinator};
///
/// # async fn example() {
/// let table = MemoryTable::new();
/// let coordinator = TunerCoordinator::new(
///     TunerConfig::default(),
///     Arc::new(table),
///     Box::new(NullSink),
/// );
/// coordinator.start();
/// // ...
/// coordinator.stop().await;
/// # }
/// ```
pub struct TunerCoordinator {
    config: Arc<TunerConfig>,
    transport: Arc<dyn TableTransport>,
    sink: SharedSink,
    commands_tx: mpsc::Sender<TunerCommand>,
    commands_rx: SharedCommands,
    status_tx: Arc<watch::Sender<Arc<TunerStatus>>>,
    status_rx: watch::Receiver<Arc<TunerStatus>>,
    lifecycle: Arc<AtomicU8>,
    /// Held across a lifecycle change and the slot updates that go with it.
    transition: Mutex<()>,
    core: Mutex<Option<TunerCore>>,
    task: Mutex<Option<JoinHandle<TunerCore>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl TunerCoordinator {
    /// Build a stopped coordinator. Nothing is spawned until [`Self::start`].
    pub fn new(
        config: TunerConfig,
        transport: Arc<dyn TableTransport>,
        sink: Box<dyn EvaluationSink>,
    ) -> Self {
        let config = Arc::new(config);
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let (commands_tx, commands_rx) = mpsc::channel(config.runtime.command_capacity.max(1));
        let core = TunerCore::new(Arc::clone(&config), Arc::clone(&transport), Arc::clone(&sink));
        let (status_tx, status_rx) = watch::channel(Arc::new(core.snapshot(Lifecycle::Stopped)));
        Self {
            config,
            transport,
            sink,
            commands_tx,
            commands_rx: Arc::new(Mutex::new(commands_rx)),
            status_tx: Arc::new(status_tx),
            status_rx,
            lifecycle: Arc::new(AtomicU8::new(Lifecycle::Stopped as u8)),
            transition: Mutex::new(()),
            core: Mutex::new(Some(core)),
            task: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Handle for commands and status.
    pub fn handle(&self) -> TunerHandle {
        TunerHandle {
            commands: self.commands_tx.clone(),
            status: self.status_rx.clone(),
        }
    }

    /// Current lifecycle.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Latest snapshot.
    pub fn status(&self) -> Arc<TunerStatus> {
        Arc::clone(&self.status_rx.borrow())
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// Idempotent: returns `false` without side effects when the loop is
    /// already starting or running, or when called outside a runtime.
    pub fn start(&self) -> bool {
        let _transition = self.transition.lock();
        if self
            .lifecycle
            .compare_exchange(
                Lifecycle::Stopped as u8,
                Lifecycle::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            info!(lifecycle = ?self.lifecycle(), "start ignored");
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            error!("start called outside a tokio runtime");
            self.lifecycle
                .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
            return false;
        };

        let core = self.core.lock().take().unwrap_or_else(|| {
            warn!("previous loop state was lost; starting fresh");
            TunerCore::new(
                Arc::clone(&self.config),
                Arc::clone(&self.transport),
                Arc::clone(&self.sink),
            )
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channels = LoopChannels {
            commands: Arc::clone(&self.commands_rx),
            shutdown: shutdown_rx,
            status: Arc::clone(&self.status_tx),
            lifecycle: Arc::clone(&self.lifecycle),
        };
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.task.lock() = Some(runtime.spawn(core.run(channels)));
        info!("tuner started");
        true
    }

    /// Signal the loop, wait up to the graceful timeout, then abort.
    ///
    /// Idempotent and safe to call from any task; returns `false` when there
    /// was nothing to stop or another caller is already stopping.
    pub async fn stop(&self) -> bool {
        // A concurrent start either finishes installing its task first or
        // sees Stopping and backs off.
        let (shutdown, task) = {
            let _transition = self.transition.lock();
            let current = self.lifecycle();
            if matches!(current, Lifecycle::Stopped | Lifecycle::Stopping) {
                info!(lifecycle = ?current, "stop ignored");
                return false;
            }
            self.lifecycle
                .store(Lifecycle::Stopping as u8, Ordering::SeqCst);
            (self.shutdown.lock().take(), self.task.lock().take())
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        if let Some(mut handle) = task {
            let grace = self.config.runtime.graceful_shutdown_timeout();
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(core)) => {
                    let snapshot = core.snapshot(Lifecycle::Stopped);
                    *self.core.lock() = Some(core);
                    self.status_tx.send_replace(Arc::new(snapshot));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "tuner loop task failed");
                }
                Err(_) => {
                    warn!(timeout_ms = grace.as_millis() as u64, "graceful shutdown timed out; aborting loop");
                    handle.abort();
                }
            }
        }

        self.lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
        self.status_tx.send_modify(|s| {
            if s.lifecycle != Lifecycle::Stopped {
                let mut stopped = (**s).clone();
                stopped.lifecycle = Lifecycle::Stopped;
                stopped.connected = false;
                *s = Arc::new(stopped);
            }
        });
        info!("tuner stopped");
        true
    }
}

impl Drop for TunerCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
