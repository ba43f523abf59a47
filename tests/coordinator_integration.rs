//! End-to-end tests of the coordinator loop against an in-memory robot table.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shooter_tuner::config::CoefficientSpec;
use shooter_tuner::link::keys;
use shooter_tuner::optimizer::campaign::CampaignPhase;
use shooter_tuner::optimizer::history::{CampaignTransition, EvaluationRecord};
use shooter_tuner::sim::SimulatedRobot;
use shooter_tuner::transport::TransportError;
use shooter_tuner::{
    EvaluationSink, Lifecycle, MemoryTable, NullSink, TableTransport, TableValue, TunerCommand,
    TunerConfig, TunerCoordinator, TunerHandle, TunerStatus,
};
use tokio::sync::watch;

// ── Helpers ──────────────────────────────────────────────────────────────

fn config(dir: &tempfile::TempDir) -> TunerConfig {
    let mut cfg = TunerConfig::empty();
    cfg.coefficients = vec![
        CoefficientSpec::new("kDragCoefficient", 0.003, 0.001, 0.01, 0.0001),
        CoefficientSpec::new("kExitVelocity", 15.0, 0.0, 30.0, 0.5),
    ];
    cfg.tuning_order = vec!["kDragCoefficient".into(), "kExitVelocity".into()];
    cfg.runtime.update_rate_hz = 100.0;
    cfg.network.reconnect_delay_ms = 20;
    cfg.logging.directory = dir.path().display().to_string();
    cfg
}

async fn wait_for(handle: &TunerHandle, pred: impl Fn(&TunerStatus) -> bool) -> Arc<TunerStatus> {
    for _ in 0..500 {
        let s = handle.status();
        if pred(&s) {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.status()
}

async fn wait_until(pred: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn manual_hit() -> TunerCommand {
    TunerCommand::RecordShot {
        hit: true,
        coefficients: BTreeMap::new(),
    }
}

/// Records what reaches the sink as short strings.
#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<String>>>,
}

impl EvaluationSink for RecordingSink {
    fn on_evaluation(&mut self, record: &EvaluationRecord) {
        self.events
            .lock()
            .push(format!("eval:{}:{}", record.coefficient, record.hit));
    }

    fn on_transition(&mut self, transition: &CampaignTransition) {
        let to = match transition.to {
            CampaignPhase::Pending => "pending",
            CampaignPhase::Active => "active",
            CampaignPhase::Converged => "converged",
            CampaignPhase::Skipped => "skipped",
        };
        self.events
            .lock()
            .push(format!("transition:{}:{to}", transition.coefficient));
    }
}

/// Keeps evaluations, panics on every transition.
#[derive(Clone, Default)]
struct TransitionPanicSink {
    evaluations: Arc<Mutex<Vec<String>>>,
}

impl EvaluationSink for TransitionPanicSink {
    fn on_evaluation(&mut self, record: &EvaluationRecord) {
        self.evaluations.lock().push(record.coefficient.clone());
    }

    fn on_transition(&mut self, transition: &CampaignTransition) {
        panic!("exporter rejected transition for {}", transition.coefficient);
    }
}

/// MemoryTable wrapper whose shot-timestamp read panics while armed.
struct PanickingTable {
    inner: MemoryTable,
    armed: AtomicBool,
}

#[async_trait]
impl TableTransport for PanickingTable {
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        self.inner.connect(target).await
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn get(&self, key: &str) -> Result<Option<TableValue>, TransportError> {
        if key == keys::SHOT_TIMESTAMP && self.armed.load(Ordering::SeqCst) {
            panic!("shot timestamp decoder blew up");
        }
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: TableValue) -> Result<(), TransportError> {
        self.inner.put(key, value)
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.inner.flush()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_simulated_session_tunes_until_budget_exhausted() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let mut cfg = config(&dir);
    cfg.coefficients = vec![CoefficientSpec::new("kExitVelocity", 15.0, 0.0, 30.0, 0.5)];
    cfg.tuning_order = vec!["kExitVelocity".into()];
    cfg.autotune.enabled = true;
    cfg.autotune.shot_threshold = 3;
    cfg.optimizer.n_calls_per_coefficient = 4;
    cfg.interlocks.require_shot_logged = true;
    cfg.interlocks.require_coefficients_updated = true;

    let table = MemoryTable::new();
    let robot = SimulatedRobot::new(table.clone(), &cfg, 11);
    let (robot_stop, robot_rx) = watch::channel(false);
    let robot_task = tokio::spawn(robot.run(Duration::from_millis(5), robot_rx));

    let coord = TunerCoordinator::new(cfg, Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    assert!(coord.start());

    let s = wait_for(&handle, |s| s.is_done() && s.iterations > 0).await;
    assert!(s.is_done(), "campaign never finished: {:?}", s.runtime_status);
    assert_eq!(s.phase_of("kExitVelocity"), Some(CampaignPhase::Converged));
    assert_eq!(s.errors.validation, 0);
    assert_eq!(s.errors.panic, 0);

    let (name, value) = s.last_written.clone().expect("test: a proposal was written");
    assert_eq!(name, "kExitVelocity");
    assert!((0.0..=30.0).contains(&value));
    let live = table
        .peer_number("/Tuning/kExitVelocity")
        .expect("test: coefficient published");
    assert!((0.0..=30.0).contains(&live));
    assert_eq!(table.peer_bool(keys::REQUIRE_SHOT_LOGGED), Some(true));
    assert!(
        wait_until(|| table.peer_text(keys::RUNTIME_STATUS).as_deref() == Some("all coefficients tuned"))
            .await
    );

    coord.stop().await;
    robot_stop.send(true).expect("test: stop robot");
    let shots = robot_task.await.expect("test: robot task");
    assert!(shots >= 12, "only {shots} shots fired");
}

#[tokio::test]
async fn test_silent_peer_keeps_loop_running() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();

    let s = wait_for(&handle, |s| s.iterations >= 30).await;
    assert!(s.iterations >= 30);
    assert_eq!(s.lifecycle, Lifecycle::Running);
    assert!(s.last_shot_timestamp.is_none());
    assert_eq!(s.shots_since_trigger, 0);
    assert_eq!(s.errors.transport, 0);
    assert!(table.write_count(keys::HEARTBEAT) >= 1);
    coord.stop().await;
}

#[tokio::test]
async fn test_robot_shot_is_recorded_and_acknowledged() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let mut cfg = config(&dir);
    cfg.interlocks.require_shot_logged = true;
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(cfg, Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;
    assert_eq!(table.peer_bool(keys::REQUIRE_SHOT_LOGGED), Some(true));

    table.peer_put(keys::SHOT_HIT, true);
    table.peer_put(keys::SHOT_LOGGED, false);
    table.peer_put(keys::SHOT_TIMESTAMP, 1.0);

    let s = wait_for(&handle, |s| s.shots_since_trigger == 1).await;
    assert_eq!(s.shots_since_trigger, 1);
    assert_eq!(s.last_shot_timestamp, Some(1.0));
    assert_eq!(table.peer_bool(keys::SHOT_LOGGED), Some(true));

    // Same timestamp again: nothing new.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().shots_since_trigger, 1);
    coord.stop().await;
}

#[tokio::test]
async fn test_panicking_iteration_is_contained() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let transport = Arc::new(PanickingTable {
        inner: table.clone(),
        armed: AtomicBool::new(true),
    });
    let coord = TunerCoordinator::new(config(&dir), transport.clone(), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();

    let s = wait_for(&handle, |s| s.errors.panic >= 3).await;
    assert!(s.errors.panic >= 3);
    assert_eq!(s.lifecycle, Lifecycle::Running);
    assert!(s
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("shot timestamp decoder")));

    transport.armed.store(false, Ordering::SeqCst);
    table.peer_put(keys::SHOT_HIT, false);
    table.peer_put(keys::SHOT_TIMESTAMP, 5.0);
    let s = wait_for(&handle, |s| s.shots_since_trigger == 1).await;
    assert_eq!(s.shots_since_trigger, 1);
    assert!(coord.stop().await);
    assert_eq!(coord.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_reconnects_after_peer_drops() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;
    assert_eq!(table.connect_count(), 1);

    table.set_reachable(false);
    let s = wait_for(&handle, |s| !s.connected && s.errors.transport >= 2).await;
    assert!(!s.connected);
    assert!(s.errors.transport >= 2);

    table.set_reachable(true);
    let s = wait_for(&handle, |s| s.connected).await;
    assert!(s.connected);
    assert_eq!(table.connect_count(), 2);
    // Status keys are rewritten on the new session.
    assert_eq!(table.write_count(keys::TUNER_ENABLED), 2);
    coord.stop().await;
}

#[tokio::test]
async fn test_sink_sees_accepted_evaluations_and_transitions_in_order() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let sink = RecordingSink::default();
    let events = Arc::clone(&sink.events);
    let coord = TunerCoordinator::new(
        config(&dir),
        Arc::new(MemoryTable::new()),
        Box::new(sink),
    );
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    handle.send(manual_hit()).expect("test: shot 1");
    handle
        .send(TunerCommand::RecordShot {
            hit: false,
            coefficients: BTreeMap::from([("kDragCoefficient".to_string(), 5.0)]),
        })
        .expect("test: out of bounds shot");
    handle.send(TunerCommand::Skip).expect("test: skip");
    handle.send(manual_hit()).expect("test: shot 2");
    wait_for(&handle, |s| {
        s.current_coefficient.as_deref() == Some("kExitVelocity") && s.shots_since_trigger == 1
    })
    .await;
    coord.stop().await;

    let events = events.lock().clone();
    assert_eq!(
        events,
        vec![
            "transition:kDragCoefficient:active",
            "eval:kDragCoefficient:true",
            "transition:kDragCoefficient:skipped",
            "transition:kExitVelocity:active",
            "eval:kExitVelocity:true",
        ]
    );
}

#[tokio::test]
async fn test_match_mode_suspends_recording() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    table.peer_put(keys::FMS_CONTROL_DATA, f64::from(keys::FMS_ATTACHED_BIT | 0x01));
    let s = wait_for(&handle, |s| s.match_mode).await;
    assert!(s.match_mode);
    assert_eq!(table.peer_bool(keys::TUNER_PAUSED), Some(true));

    table.peer_put(keys::SHOT_HIT, true);
    table.peer_put(keys::SHOT_TIMESTAMP, 1.0);
    let s = wait_for(&handle, |s| s.last_shot_timestamp == Some(1.0)).await;
    assert_eq!(s.shots_since_trigger, 0);

    table.peer_put(keys::FMS_CONTROL_DATA, 0.0);
    wait_for(&handle, |s| !s.match_mode).await;
    table.peer_put(keys::SHOT_TIMESTAMP, 2.0);
    let s = wait_for(&handle, |s| s.shots_since_trigger == 1).await;
    assert!(!s.match_mode);
    assert_eq!(s.shots_since_trigger, 1);
    coord.stop().await;
}

#[tokio::test]
async fn test_dashboard_toggle_and_optimize_button() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    table.peer_put(keys::TUNER_ENABLED_TOGGLE, false);
    let s = wait_for(&handle, |s| !s.enabled).await;
    assert!(!s.enabled);
    assert_eq!(s.lifecycle, Lifecycle::Running);
    assert!(wait_until(|| table.peer_text(keys::RUNTIME_STATUS).as_deref() == Some("stopped")).await);

    table.peer_put(keys::TUNER_ENABLED_TOGGLE, true);
    wait_for(&handle, |s| s.enabled).await;
    for _ in 0..3 {
        handle.send(manual_hit()).expect("test: shot");
    }
    wait_for(&handle, |s| s.shots_since_trigger == 3).await;

    table.peer_put(keys::RUN_OPTIMIZATION, true);
    let s = wait_for(&handle, |s| s.last_written.is_some()).await;
    let (name, value) = s.last_written.clone().expect("test: proposal written");
    assert_eq!(name, "kDragCoefficient");
    assert!((0.001..=0.01).contains(&value));
    assert_eq!(s.shots_since_trigger, 0);
    assert_eq!(table.peer_bool(keys::RUN_OPTIMIZATION), Some(false));
    coord.stop().await;
}

#[tokio::test]
async fn test_force_optimize_needs_minimum_shots() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let coord = TunerCoordinator::new(config(&dir), Arc::new(MemoryTable::new()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    handle.send(manual_hit()).expect("test: shot");
    handle.send(TunerCommand::ForceOptimize).expect("test: optimize");
    let s = wait_for(&handle, |s| s.shots_since_trigger == 1 && s.iterations > 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.status().last_written.is_none());
    assert_eq!(s.shots_since_trigger, 1);
    coord.stop().await;
}

#[tokio::test]
async fn test_set_coefficient_is_clamped_and_forced() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    handle
        .send(TunerCommand::SetCoefficient {
            name: "kExitVelocity".into(),
            value: 99.0,
        })
        .expect("test: set");
    let s = wait_for(&handle, |s| s.last_written.is_some()).await;
    assert_eq!(s.last_written, Some(("kExitVelocity".to_string(), 30.0)));
    assert_eq!(table.peer_number("/Tuning/kExitVelocity"), Some(30.0));

    handle
        .send(TunerCommand::SetCoefficient {
            name: "kNope".into(),
            value: 1.0,
        })
        .expect("test: set unknown");
    let s = wait_for(&handle, |s| s.errors.command == 1).await;
    assert!(s.last_error.as_deref().is_some_and(|e| e.contains("kNope")));
    coord.stop().await;
}

#[tokio::test]
async fn test_navigation_commands() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let coord = TunerCoordinator::new(config(&dir), Arc::new(MemoryTable::new()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    // Pending campaigns cannot be backtracked to.
    handle
        .send(TunerCommand::Backtrack("kExitVelocity".into()))
        .expect("test: backtrack");
    let s = wait_for(&handle, |s| s.errors.command == 1).await;
    assert_eq!(s.current_coefficient.as_deref(), Some("kDragCoefficient"));

    handle.send(TunerCommand::Skip).expect("test: skip");
    handle
        .send(TunerCommand::Backtrack("kDragCoefficient".into()))
        .expect("test: backtrack");
    // Backtracking restarts at half the initial step.
    let s = wait_for(&handle, |s| {
        s.step_size
            .is_some_and(|step| (step - 0.00005).abs() < 1e-12)
    })
    .await;
    assert_eq!(s.current_coefficient.as_deref(), Some("kDragCoefficient"));
    assert_eq!(s.phase_of("kExitVelocity"), Some(CampaignPhase::Pending));
    assert!(s.step_size.is_some_and(|step| (step - 0.00005).abs() < 1e-12));

    handle.send(TunerCommand::Skip).expect("test: skip");
    handle.send(TunerCommand::Skip).expect("test: skip");
    let s = wait_for(&handle, |s| s.is_done()).await;
    assert!(s.is_done());
    assert_eq!(s.runtime_status, "all coefficients tuned");

    handle.send(TunerCommand::ResetAll).expect("test: reset");
    let s = wait_for(&handle, |s| !s.is_done()).await;
    assert_eq!(s.current_coefficient.as_deref(), Some("kDragCoefficient"));
    assert_eq!(s.phase_of("kExitVelocity"), Some(CampaignPhase::Pending));
    coord.stop().await;
}

#[tokio::test]
async fn test_stop_command_disables_without_ending_loop() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(config(&dir), Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    handle.send(TunerCommand::Stop).expect("test: stop");
    let s = wait_for(&handle, |s| !s.enabled).await;
    assert_eq!(s.lifecycle, Lifecycle::Running);
    handle.send(manual_hit()).expect("test: shot");
    let s = wait_for(&handle, |s| s.errors.command == 1).await;
    assert_eq!(s.shots_since_trigger, 0);

    handle.send(TunerCommand::Start).expect("test: start");
    handle.send(manual_hit()).expect("test: shot");
    let s = wait_for(&handle, |s| s.shots_since_trigger == 1).await;
    assert!(s.enabled);
    coord.stop().await;
}

#[tokio::test]
async fn test_disabled_config_never_writes_coefficients() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let mut cfg = config(&dir);
    cfg.enabled = false;
    cfg.autotune.enabled = true;
    cfg.autotune.shot_threshold = 1;
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(cfg, Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    table.peer_put(keys::SHOT_HIT, true);
    table.peer_put(keys::SHOT_TIMESTAMP, 1.0);
    let s = wait_for(&handle, |s| s.last_shot_timestamp == Some(1.0)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.shots_since_trigger, 0);
    assert_eq!(table.write_count("/Tuning/kDragCoefficient"), 0);
    assert!(
        wait_until(|| table.peer_text(keys::RUNTIME_STATUS).as_deref() == Some("disabled by configuration"))
            .await
    );
    coord.stop().await;
}

#[tokio::test]
async fn test_panicking_sink_does_not_stop_the_loop() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let sink = TransitionPanicSink::default();
    let evaluations = Arc::clone(&sink.evaluations);
    let coord = TunerCoordinator::new(config(&dir), Arc::new(MemoryTable::new()), Box::new(sink));
    let handle = coord.handle();
    coord.start();

    // The initial activation already reached the sink and panicked.
    let s = wait_for(&handle, |s| s.connected && s.errors.panic >= 1 && s.iterations > 3).await;
    assert_eq!(s.errors.panic, 1);
    assert_eq!(s.lifecycle, Lifecycle::Running);
    assert!(s
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("exporter rejected")));

    handle.send(manual_hit()).expect("test: shot 1");
    handle.send(manual_hit()).expect("test: shot 2");
    wait_for(&handle, |s| s.shots_since_trigger == 2).await;
    handle.send(TunerCommand::Skip).expect("test: skip");
    let s = wait_for(&handle, |s| s.errors.panic >= 3).await;
    // Skipped plus the next activation.
    assert_eq!(s.errors.panic, 3);
    assert_eq!(s.current_coefficient.as_deref(), Some("kExitVelocity"));

    let before = s.iterations;
    let s = wait_for(&handle, |s| s.iterations > before + 5).await;
    assert!(s.iterations > before + 5);
    assert_eq!(s.errors.panic, 3);
    assert!(coord.stop().await);

    assert_eq!(
        evaluations.lock().clone(),
        vec!["kDragCoefficient".to_string(), "kDragCoefficient".to_string()]
    );
}

#[tokio::test]
async fn test_inactive_tuner_still_acknowledges_shots() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let mut cfg = config(&dir);
    cfg.interlocks.require_shot_logged = true;
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(cfg, Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    // Official match: the shot is not recorded but must be released.
    table.peer_put(keys::FMS_CONTROL_DATA, f64::from(keys::FMS_ATTACHED_BIT | 0x01));
    wait_for(&handle, |s| s.match_mode).await;
    table.peer_put(keys::SHOT_HIT, true);
    table.peer_put(keys::SHOT_LOGGED, false);
    table.peer_put(keys::SHOT_TIMESTAMP, 1.0);
    assert!(wait_until(|| table.peer_bool(keys::SHOT_LOGGED) == Some(true)).await);
    let s = wait_for(&handle, |s| s.last_shot_timestamp == Some(1.0)).await;
    assert_eq!(s.shots_since_trigger, 0);

    // Same while tuning is switched off.
    table.peer_put(keys::FMS_CONTROL_DATA, 0.0);
    handle.send(TunerCommand::Stop).expect("test: stop");
    wait_for(&handle, |s| !s.match_mode && !s.enabled).await;
    table.peer_put(keys::SHOT_LOGGED, false);
    table.peer_put(keys::SHOT_TIMESTAMP, 2.0);
    assert!(wait_until(|| table.peer_bool(keys::SHOT_LOGGED) == Some(true)).await);
    let s = wait_for(&handle, |s| s.last_shot_timestamp == Some(2.0)).await;
    assert_eq!(s.shots_since_trigger, 0);
    coord.stop().await;
}

#[tokio::test]
async fn test_deferred_write_waits_out_a_match() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let mut cfg = config(&dir);
    // One write per coefficient per second.
    cfg.rates.max_write_hz = 1.0;
    let table = MemoryTable::new();
    let coord = TunerCoordinator::new(cfg, Arc::new(table.clone()), Box::new(NullSink));
    let handle = coord.handle();
    coord.start();
    wait_for(&handle, |s| s.connected).await;

    for _ in 0..3 {
        handle.send(manual_hit()).expect("test: shot");
    }
    handle.send(TunerCommand::ForceOptimize).expect("test: optimize");
    wait_for(&handle, |s| s.last_written.is_some()).await;
    assert_eq!(table.write_count("/Tuning/kDragCoefficient"), 1);

    // The second proposal lands inside the write window and is deferred.
    for _ in 0..3 {
        handle.send(manual_hit()).expect("test: shot");
    }
    handle.send(TunerCommand::ForceOptimize).expect("test: optimize");
    let s = wait_for(&handle, |s| s.pending_write).await;
    assert!(s.pending_write);

    table.peer_put(keys::FMS_CONTROL_DATA, f64::from(keys::FMS_ATTACHED_BIT | 0x01));
    wait_for(&handle, |s| s.match_mode).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(table.write_count("/Tuning/kDragCoefficient"), 1);
    assert!(handle.status().pending_write);

    table.peer_put(keys::FMS_CONTROL_DATA, 0.0);
    let s = wait_for(&handle, |s| !s.match_mode && !s.pending_write).await;
    assert!(!s.pending_write);
    assert_eq!(table.write_count("/Tuning/kDragCoefficient"), 2);
    coord.stop().await;
}
