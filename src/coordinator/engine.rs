//! The loop body: everything one iteration does, owned by the loop task.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::status::{ErrorCounts, Lifecycle, TunerStatus};
use super::{EvaluationSink, TunerCommand};
use crate::config::{PolicySetting, TunerConfig};
use crate::link::RobotLink;
use crate::metrics;
use crate::optimizer::history::JournalEntry;
use crate::optimizer::{
    Proposal, SequentialOptimizer, ShotDisposition, ShotObservation,
};
use crate::session_log::SessionLog;
use crate::transport::TableTransport;

pub(crate) type SharedSink = Arc<Mutex<Box<dyn EvaluationSink>>>;
pub(crate) type SharedCommands = Arc<Mutex<mpsc::Receiver<TunerCommand>>>;

/// Channels the loop task shares with its coordinator.
pub(crate) struct LoopChannels {
    pub(crate) commands: SharedCommands,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) status: Arc<watch::Sender<Arc<TunerStatus>>>,
    pub(crate) lifecycle: Arc<AtomicU8>,
}

/// State owned by the loop task. Moved into the task on start and handed
/// back through the join handle on a graceful stop.
pub(crate) struct TunerCore {
    config: Arc<TunerConfig>,
    link: RobotLink,
    optimizer: SequentialOptimizer,
    sink: SharedSink,
    session_log: SessionLog,
    target: String,
    enabled: bool,
    paused: bool,
    match_mode: bool,
    was_connected: bool,
    last_connect_attempt: Option<Instant>,
    pending_write: Option<Proposal>,
    last_written: Option<(String, f64)>,
    sink_cursor: usize,
    errors: ErrorCounts,
    last_error: Option<String>,
    iterations: u64,
}

impl TunerCore {
    pub(crate) fn new(
        config: Arc<TunerConfig>,
        transport: Arc<dyn TableTransport>,
        sink: SharedSink,
    ) -> Self {
        Self {
            link: RobotLink::new(transport, &config),
            optimizer: SequentialOptimizer::new(&config),
            session_log: SessionLog::new(&config.logging),
            target: config.network.server_address(),
            enabled: config.enabled,
            paused: false,
            match_mode: false,
            was_connected: false,
            last_connect_attempt: None,
            pending_write: None,
            last_written: None,
            sink_cursor: 0,
            errors: ErrorCounts::default(),
            last_error: None,
            iterations: 0,
            sink,
            config,
        }
    }

    // ─── Loop ───────────────────────────────────────────────────────────

    /// Iterate until the shutdown signal, then save and release the link.
    pub(crate) async fn run(mut self, mut channels: LoopChannels) -> Self {
        // Released on every exit path, including abort.
        let _session = self.link.session_guard();
        let mut ticker = interval(self.config.runtime.update_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let _ = channels.lifecycle.compare_exchange(
            Lifecycle::Starting as u8,
            Lifecycle::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        info!(target = %self.target, "tuner loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = channels.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *channels.shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.maintain_connection().await;

            let mut batch = Vec::new();
            {
                let mut rx = channels.commands.lock();
                while let Ok(cmd) = rx.try_recv() {
                    batch.push(cmd);
                }
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.step(batch))) {
                self.on_panic("iteration", panic_message(payload.as_ref()));
            }
            // Entries appended before a panic are still delivered.
            self.forward_journal();

            self.iterations += 1;
            metrics::record_iteration(started.elapsed());
            let lifecycle = Lifecycle::from_u8(channels.lifecycle.load(Ordering::SeqCst));
            channels.status.send_replace(Arc::new(self.snapshot(lifecycle)));
        }

        info!(iterations = self.iterations, "tuner loop stopping");
        self.save();
        self.link.stop();
        metrics::set_connected(false);
        self.was_connected = false;
        channels
            .status
            .send_replace(Arc::new(self.snapshot(Lifecycle::Stopping)));
        self
    }

    /// Step 0: reconnect, paced by the reconnect delay.
    async fn maintain_connection(&mut self) {
        if self.link.is_connected() {
            if !self.was_connected {
                self.on_connected();
            }
            return;
        }
        if self.was_connected {
            self.was_connected = false;
            metrics::set_connected(false);
            self.note_error("transport", "robot link lost".to_string());
        }
        let due = self
            .last_connect_attempt
            .map_or(true, |t| t.elapsed() >= self.config.network.reconnect_delay());
        if !due {
            return;
        }
        self.last_connect_attempt = Some(Instant::now());
        let attempt = self.link.try_connect(&self.target).await;
        match attempt {
            Ok(()) => self.on_connected(),
            Err(e) => self.note_error("transport", e.to_string()),
        }
    }

    fn on_connected(&mut self) {
        self.was_connected = true;
        metrics::set_connected(true);
        let i = self.config.interlocks;
        self.link
            .write_interlock_settings(i.require_shot_logged, i.require_coefficients_updated);
        info!(target = %self.target, "robot connected");
    }

    /// Steps 1–6 of one iteration. Synchronous so a panic can be contained.
    /// The sink is fed separately, after the step returns or unwinds.
    pub(crate) fn step(&mut self, commands: Vec<TunerCommand>) {
        let connected = self.link.is_connected();
        if connected {
            self.link.publish_heartbeat();
            self.match_mode =
                self.config.runtime.pause_during_match && self.link.read_match_mode();
        }
        self.publish_status();

        if connected {
            self.poll_shot();
            self.maybe_optimize();
        }
        self.maybe_auto_advance();

        if connected {
            self.remote_controls();
        }
        for cmd in commands {
            self.apply(cmd);
        }

        if self.config.rates.batch_writes {
            self.link.flush();
        }
    }

    fn is_active(&self) -> bool {
        self.config.enabled && self.enabled && !self.paused && !self.match_mode
    }

    // ─── Steps ──────────────────────────────────────────────────────────

    fn publish_status(&self) {
        let autotune = self.autotune_policy();
        let advance = self
            .optimizer
            .effective_auto_advance()
            .unwrap_or_else(|| self.config.auto_advance.setting());
        self.link.write_tuner_enabled_status(
            self.config.enabled && self.enabled,
            self.paused || self.match_mode,
        );
        self.link.write_autotune_status(
            autotune.enabled,
            self.optimizer.shots_since_trigger(),
            autotune.shot_threshold,
        );
        self.link.write_current_coefficient_info(
            self.optimizer.current_coefficient_name(),
            autotune.enabled,
            autotune.shot_threshold,
            advance.enabled,
        );
        self.link.write_runtime_status(&self.runtime_status());
    }

    fn poll_shot(&mut self) {
        let Some(shot) = self.link.read_shot_data() else {
            return;
        };
        // Every consumed shot is acknowledged, recorded or not; the robot
        // holds its next shot until it is.
        if self.config.interlocks.require_shot_logged {
            self.link.signal_shot_logged();
        }
        if !self.is_active() {
            debug!(timestamp = shot.timestamp, "shot ignored while inactive");
            return;
        }
        self.record(&shot);
    }

    fn record(&mut self, shot: &ShotObservation) {
        match self.optimizer.record_shot(shot) {
            ShotDisposition::Accepted {
                coefficient,
                success_rate,
                ..
            } => {
                metrics::inc_shot("accepted");
                metrics::set_success_rate(&coefficient, success_rate);
            }
            ShotDisposition::Rejected {
                reason,
                streak_exceeded,
                ..
            } => {
                metrics::inc_shot("rejected");
                self.errors.validation += 1;
                metrics::inc_error("validation");
                if streak_exceeded {
                    self.last_error = Some(format!("invalid shot streak: {reason}"));
                }
            }
            ShotDisposition::NoActiveCampaign => {}
        }
    }

    /// Step 4: retry a rejected write, or run autotune. A deferred write
    /// waits while tuning is inactive.
    fn maybe_optimize(&mut self) {
        if !self.is_active() {
            return;
        }
        if let Some(proposal) = self.pending_write.take() {
            self.write_proposal(proposal);
            return;
        }
        let policy = self.autotune_policy();
        if self
            .optimizer
            .should_trigger_optimization(policy.enabled, policy.shot_threshold)
        {
            self.run_optimization("autotune");
        }
    }

    fn run_optimization(&mut self, trigger: &'static str) {
        if self.optimizer.campaign_budget_exhausted() {
            let from = self.optimizer.current_coefficient_name().map(str::to_string);
            let next = self.optimizer.finish_exhausted().map(str::to_string);
            info!(from = ?from, next = ?next, "proposal budget exhausted");
            self.on_campaign_changed();
            return;
        }
        let Some(proposal) = self.optimizer.propose_next_value() else {
            return;
        };
        debug!(trigger, coefficient = %proposal.coefficient, "optimization triggered");
        self.optimizer.reset_shot_counter();
        self.write_proposal(proposal);
    }

    fn write_proposal(&mut self, proposal: Proposal) {
        if self
            .link
            .write_coefficient(&proposal.coefficient, proposal.value, false)
        {
            if self.config.interlocks.require_coefficients_updated {
                self.link.signal_coefficients_updated();
            }
            metrics::inc_proposal(strategy_label(&proposal));
            info!(
                coefficient = %proposal.coefficient,
                value = proposal.value,
                "coefficient updated"
            );
            self.last_written = Some((proposal.coefficient, proposal.value));
        } else {
            debug!(coefficient = %proposal.coefficient, "write deferred to next tick");
            self.pending_write = Some(proposal);
        }
    }

    /// Step 5.
    fn maybe_auto_advance(&mut self) {
        if !self.is_active() {
            return;
        }
        let Some(policy) = self.optimizer.effective_auto_advance() else {
            return;
        };
        if self
            .optimizer
            .should_auto_advance(policy.enabled, policy.shot_threshold)
        {
            let next = self.optimizer.advance_to_next_coefficient().map(str::to_string);
            info!(next = ?next, "auto-advance after hit streak");
            self.on_campaign_changed();
        }
    }

    /// Step 6a: the dashboard's button and toggle.
    fn remote_controls(&mut self) {
        if let Some(on) = self.link.read_tuner_enabled_toggle() {
            self.set_enabled(on, "dashboard");
        }
        if self.link.read_run_optimization_request() {
            self.force_optimize("dashboard");
        }
    }

    /// Step 6b.
    fn apply(&mut self, cmd: TunerCommand) {
        debug!(command = cmd.name(), "applying command");
        let result = match cmd {
            TunerCommand::Start => {
                self.set_enabled(true, "command");
                Ok(())
            }
            TunerCommand::Stop => {
                self.set_enabled(false, "command");
                Ok(())
            }
            TunerCommand::Pause => {
                self.paused = true;
                Ok(())
            }
            TunerCommand::Resume => {
                self.paused = false;
                Ok(())
            }
            TunerCommand::RecordShot { hit, coefficients } => self.record_manual(hit, coefficients),
            TunerCommand::Skip => {
                self.optimizer.skip_current();
                self.on_campaign_changed();
                Ok(())
            }
            TunerCommand::JumpTo(name) => self
                .optimizer
                .jump_to(&name)
                .map(|()| self.on_campaign_changed())
                .map_err(|e| e.to_string()),
            TunerCommand::Backtrack(name) => self
                .optimizer
                .backtrack_to(&name)
                .map(|()| self.on_campaign_changed())
                .map_err(|e| e.to_string()),
            TunerCommand::ForceOptimize => {
                self.force_optimize("command");
                Ok(())
            }
            TunerCommand::ResetAll => {
                self.optimizer.reset_all();
                self.on_campaign_changed();
                Ok(())
            }
            TunerCommand::Save => {
                self.save();
                Ok(())
            }
            TunerCommand::SetCoefficient { name, value } => self.set_coefficient(&name, value),
            TunerCommand::Pin(pinned) => {
                self.optimizer.set_pinned(pinned);
                Ok(())
            }
        };
        if let Err(message) = result {
            self.note_error("command", message);
        }
    }

    fn set_enabled(&mut self, enabled: bool, source: &'static str) {
        if self.enabled != enabled {
            info!(enabled, source, "tuning toggled");
        }
        self.enabled = enabled;
    }

    fn force_optimize(&mut self, source: &'static str) {
        let needed = self.config.optimizer.min_valid_shots_before_update;
        let have = self.optimizer.shots_since_trigger();
        if have < needed {
            warn!(source, have, needed, "optimization requested with too few valid shots");
            return;
        }
        self.run_optimization(source);
    }

    fn record_manual(
        &mut self,
        hit: bool,
        overrides: BTreeMap<String, f64>,
    ) -> Result<(), String> {
        if !self.is_active() {
            return Err("manual shot ignored: tuning inactive".to_string());
        }
        let mut coefficients: BTreeMap<String, f64> = self
            .config
            .coefficients
            .iter()
            .map(|spec| {
                let fallback = self
                    .optimizer
                    .campaign(&spec.name)
                    .map_or(spec.default_value, |c| c.current_value);
                (
                    spec.name.clone(),
                    self.link.read_coefficient(&spec.name, fallback),
                )
            })
            .collect();
        coefficients.extend(overrides);
        let shot = ShotObservation::manual(hit, coefficients, crate::unix_seconds());
        self.record(&shot);
        Ok(())
    }

    fn set_coefficient(&mut self, name: &str, value: f64) -> Result<(), String> {
        let spec = self
            .config
            .coefficient(name)
            .ok_or_else(|| format!("unknown coefficient '{name}'"))?;
        let value = spec.clamp(value);
        if !self.link.write_coefficient(name, value, true) {
            return Err(format!("could not write {name}={value}"));
        }
        if self.config.interlocks.require_coefficients_updated {
            self.link.signal_coefficients_updated();
        }
        self.optimizer.note_value(name, value);
        self.last_written = Some((name.to_string(), value));
        info!(coefficient = name, value, "coefficient set manually");
        Ok(())
    }

    fn on_campaign_changed(&mut self) {
        self.pending_write = None;
        match self.optimizer.current_coefficient_name() {
            Some(name) => info!(coefficient = name, "now tuning"),
            None => info!("all coefficients tuned"),
        }
    }

    /// Hand new journal entries to the sink, each at most once. A sink
    /// panic is counted and costs only the entry being delivered.
    fn forward_journal(&mut self) {
        let mut failures = Vec::new();
        while let Some(entry) = self.optimizer.journal_since(self.sink_cursor).first() {
            self.sink_cursor += 1;
            let sink = &self.sink;
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                let mut sink = sink.lock();
                match entry {
                    JournalEntry::Evaluation(record) if !record.excluded => {
                        sink.on_evaluation(record);
                    }
                    JournalEntry::Transition(transition) => sink.on_transition(transition),
                    _ => {}
                }
            }));
            if let Err(payload) = delivered {
                failures.push(panic_message(payload.as_ref()));
            }
        }
        for message in failures {
            self.on_panic("sink", message);
        }
    }

    fn save(&mut self) {
        if let Err(e) = self.session_log.write(&self.optimizer) {
            self.errors.io += 1;
            metrics::inc_error("io");
            warn!(path = %self.session_log.path().display(), error = %e, "session log write failed");
            self.last_error = Some(format!("session log: {e}"));
        }
    }

    // ─── Errors & status ────────────────────────────────────────────────

    fn note_error(&mut self, category: &'static str, message: String) {
        match category {
            "transport" => self.errors.transport += 1,
            "command" => self.errors.command += 1,
            _ => {}
        }
        metrics::inc_error(category);
        warn!(category, error = %message, "tuner error");
        self.last_error = Some(message);
    }

    fn on_panic(&mut self, source: &'static str, message: String) {
        self.errors.panic += 1;
        metrics::inc_error("panic");
        error!(source, panic = %message, iteration = self.iterations, "tuner panicked");
        self.last_error = Some(format!("panic: {message}"));
    }

    fn autotune_policy(&self) -> PolicySetting {
        self.optimizer
            .effective_autotune()
            .unwrap_or_else(|| self.config.autotune.setting())
    }

    fn runtime_status(&self) -> String {
        if !self.config.enabled {
            "disabled by configuration".to_string()
        } else if !self.enabled {
            "stopped".to_string()
        } else if self.match_mode {
            "paused: match in progress".to_string()
        } else if self.paused {
            "paused".to_string()
        } else if self.optimizer.invalid_streak_exceeded() {
            format!(
                "warning: {} consecutive invalid shots",
                self.optimizer.state().consecutive_invalid
            )
        } else if self.optimizer.current_coefficient_name().is_none() {
            "all coefficients tuned".to_string()
        } else {
            "ok".to_string()
        }
    }

    pub(crate) fn snapshot(&self, lifecycle: Lifecycle) -> TunerStatus {
        let state = self.optimizer.state();
        let autotune = self.autotune_policy();
        let advance = self
            .optimizer
            .effective_auto_advance()
            .unwrap_or_else(|| self.config.auto_advance.setting());
        TunerStatus {
            lifecycle,
            connected: self.link.is_connected(),
            enabled: self.config.enabled && self.enabled,
            paused: self.paused,
            match_mode: self.match_mode,
            current_coefficient: state.coefficient.clone(),
            current_value: state.current_value,
            step_size: state.step,
            shots_since_trigger: state.shots_since_trigger,
            shot_threshold: autotune.shot_threshold,
            autotune: autotune.enabled,
            auto_advance: advance.enabled,
            pinned: state.pinned,
            success_rate: state.success_rate,
            consecutive_invalid: state.consecutive_invalid,
            invalid_streak_warning: self.optimizer.invalid_streak_exceeded(),
            pending_write: self.pending_write.is_some(),
            last_written: self.last_written.clone(),
            last_shot_timestamp: self.link.last_shot_timestamp(),
            campaigns: state.campaigns,
            errors: self.errors,
            last_error: self.last_error.clone(),
            iterations: self.iterations,
            runtime_status: self.runtime_status(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn strategy_label(proposal: &Proposal) -> &'static str {
    use crate::optimizer::ProposalStrategy;
    match proposal.strategy {
        ProposalStrategy::Bootstrap => "bootstrap",
        ProposalStrategy::ExpectedImprovement => "expected_improvement",
        ProposalStrategy::Exploratory => "exploratory",
    }
}
