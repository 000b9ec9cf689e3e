//! Protocol runner: schedules phase plans over wall time.
//!
//! The runner is a single actor task owning all execution state. Every
//! input -- operator commands, timer expiries, hardware signals -- arrives
//! as a `RunnerEvent` on its mailbox, so handler execution is serialized
//! and pause/resume can reason about timers without races.
//!
//! Timer model: one step timer (total remaining time of the current step),
//! one phase timer (current phase duration), a 100 ms status tick and a
//! 50 ms volume-threshold poll. Timers are armed as token-stamped one-shot
//! tasks; cancelling bumps the token so late fires are ignored. Pausing
//! captures each timer's remaining duration; resuming shifts the epoch
//! instants by the pause span and re-arms with the remainders.
//!
//! Ordering: within a phase the viewer message, then the hardware message,
//! are published before the phase timer starts. Across steps the voltage
//! and frequency setpoints precede any phase message.

use crate::datalog::{DataLogger, LogContext};
use crate::droplets::{self, DropletCheckMemo, DropletCheckOutcome};
use crate::experiment;
use crate::power;
use crate::threshold::{self, ThresholdMonitor};
use crate::viewer::{self, SharedProtocol};
use mf_bus::MessageBus;
use mf_protocol::{topics, DropletResponse};
use protocol_core::calibration::CalibrationData;
use protocol_core::plan::{self, ExecutionPlan, RepetitionInfo};
use protocol_core::tree::{self, RunEntry};
use protocol_core::DeviceState;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const STATUS_TICK: Duration = Duration::from_millis(100);
pub const THRESHOLD_POLL: Duration = Duration::from_millis(50);
pub const PAUSE_RESUME_DEBOUNCE: Duration = Duration::from_millis(250);
pub const POWER_EDIT_DEBOUNCE: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Everything that can happen to the runner.
#[derive(Debug)]
pub enum RunnerEvent {
    Start { preview_mode: bool },
    Pause { advanced_mode: bool },
    Resume,
    Stop,
    JumpToStep { path: Vec<usize> },
    NextPhase,
    PrevPhase,
    /// Operator answered the step's message prompt.
    MessageResponse { accepted: bool },
    /// Operator answered the droplet-failure dialog.
    DropletDecision { proceed: bool },
    DropletResponse(DropletResponse),
    CapacitanceSample { picofarads: f64, volts: f64 },
    SetDropletCheck(bool),
    SetCalibration(CalibrationData),
    /// Mid-run voltage/frequency edit for the step with this UID.
    UpdateStepPower {
        step_uid: String,
        voltage: String,
        frequency: String,
    },
    StepTimeout(u64),
    PhaseTimeout(u64),
    DebounceFired(u64),
    PowerDebounceFired(u64),
    Shutdown,
}

/// Out-of-band notifications for the hosting UI.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerNotice {
    /// Tree path of the step now executing.
    HighlightStep(Vec<usize>),
    /// UID of the step to select after stop/finish.
    SelectStep(String),
    Paused,
    Finished,
    Error(String),
    /// Show the step's operator prompt; answer with `MessageResponse`.
    MessagePrompt { message: String, step_info: String },
    /// Droplets missing after a step; answer with `DropletDecision`.
    DropletFailure {
        expected: Vec<u32>,
        detected: Vec<u32>,
        missing: Vec<u32>,
    },
}

/// Snapshot for the status bar, refreshed every 100 ms while running.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunnerStatus {
    pub total_time: f64,
    pub step_time: f64,
    pub step_idx: usize,
    pub step_total: usize,
    pub step_rep_idx: u32,
    pub step_rep_total: u32,
    pub recent_step: String,
    pub next_step: String,
}

/// Cheap handle for feeding events to the runner.
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::UnboundedSender<RunnerEvent>,
    status: watch::Receiver<RunnerStatus>,
}

impl RunnerHandle {
    pub fn send(&self, event: RunnerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn start(&self, preview_mode: bool) {
        self.send(RunnerEvent::Start { preview_mode });
    }

    pub fn pause(&self, advanced_mode: bool) {
        self.send(RunnerEvent::Pause { advanced_mode });
    }

    pub fn resume(&self) {
        self.send(RunnerEvent::Resume);
    }

    pub fn stop(&self) {
        self.send(RunnerEvent::Stop);
    }

    pub fn status(&self) -> watch::Receiver<RunnerStatus> {
        self.status.clone()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<RunnerEvent> {
        self.tx.clone()
    }
}

/// Spawn the runner actor. Returns the command handle and the notice
/// stream.
pub fn spawn_runner(
    bus: MessageBus,
    shared: SharedProtocol,
) -> (RunnerHandle, mpsc::UnboundedReceiver<RunnerNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RunnerStatus::default());

    let runner = Runner::new(bus, shared, tx.clone(), notice_tx, status_tx);
    tokio::spawn(runner.run(rx));

    (
        RunnerHandle {
            tx,
            status: status_rx,
        },
        notice_rx,
    )
}

// ---------------------------------------------------------------------------
// One-shot timers
// ---------------------------------------------------------------------------

/// Token-stamped one-shot timer. Arming or cancelling bumps the token, so
/// a fire event carrying an old token is stale and ignored.
struct TimerSlot {
    token: u64,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn new() -> Self {
        TimerSlot {
            token: 0,
            deadline: None,
            handle: None,
        }
    }

    fn arm(
        &mut self,
        duration: Duration,
        tx: &mpsc::UnboundedSender<RunnerEvent>,
        make_event: fn(u64) -> RunnerEvent,
    ) {
        self.cancel();
        self.token += 1;
        let token = self.token;
        let deadline = Instant::now() + duration;
        self.deadline = Some(deadline);
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(make_event(token));
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = None;
        self.token += 1;
    }

    /// Matches a fire event against the live token and clears the slot.
    fn accept_fire(&mut self, token: u64) -> bool {
        if token != self.token || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        self.deadline = None;
        true
    }

    fn remaining_secs(&self) -> f64 {
        self.deadline
            .map(|d| d.duration_since(Instant::now()).as_secs_f64())
            .unwrap_or(0.0)
    }

    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

// ---------------------------------------------------------------------------
// Runner state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Pause,
    Resume,
}

struct Runner {
    bus: MessageBus,
    shared: SharedProtocol,
    self_tx: mpsc::UnboundedSender<RunnerEvent>,
    notices: mpsc::UnboundedSender<RunnerNotice>,
    status_tx: watch::Sender<RunnerStatus>,

    calibration: CalibrationData,
    data_logger: DataLogger,

    preview_mode: bool,
    droplet_check_enabled: bool,

    running: bool,
    paused: bool,
    run_order: Vec<RunEntry>,
    unique_step_count: usize,
    current_index: usize,

    plan: ExecutionPlan,
    phase_index: usize,
    total_phases_completed: usize,
    rep_info: RepetitionInfo,

    start_time: Option<Instant>,
    step_start_time: Option<Instant>,
    phase_start_time: Option<Instant>,
    elapsed_time: f64,
    step_elapsed_time: f64,
    pause_time: Option<Instant>,

    remaining_step_time: f64,
    remaining_phase_time: f64,
    was_in_phase: bool,
    paused_phase_index: usize,

    step_timer: TimerSlot,
    phase_timer: TimerSlot,
    debounce_timer: TimerSlot,
    pending_pause_resume: Option<PendingAction>,
    power_debounce: TimerSlot,
    /// Coalesced `(uid, voltage, frequency)` edit, last writer wins.
    pending_power_update: Option<(String, String, String)>,

    // Message gating
    pause_for_message_display: bool,
    message_waiting_for_response: bool,
    message_rejected_pause: bool,
    message_step_remaining: f64,
    message_phase_remaining: f64,
    message_total_elapsed: f64,
    message_step_elapsed: f64,
    message_phase_elapsed: f64,

    // Advanced mode
    advanced_mode_editable: bool,
    advanced_hardware_control: bool,
    paused_original_electrodes: BTreeMap<String, bool>,

    // Phase navigation
    phase_navigation_mode: bool,
    original_pause_phase_index: usize,
    navigated_phase_index: usize,

    // Droplet verification
    waiting_for_droplet_check: bool,
    droplet_check_failed: bool,
    expected_droplet_channels: Vec<u32>,
    droplet_memo: DropletCheckMemo,

    threshold: ThresholdMonitor,
}

impl Runner {
    fn new(
        bus: MessageBus,
        shared: SharedProtocol,
        self_tx: mpsc::UnboundedSender<RunnerEvent>,
        notices: mpsc::UnboundedSender<RunnerNotice>,
        status_tx: watch::Sender<RunnerStatus>,
    ) -> Self {
        Runner {
            bus,
            shared,
            self_tx,
            notices,
            status_tx,
            calibration: CalibrationData::default(),
            data_logger: DataLogger::new(),
            preview_mode: false,
            droplet_check_enabled: false,
            running: false,
            paused: false,
            run_order: Vec::new(),
            unique_step_count: 0,
            current_index: 0,
            plan: ExecutionPlan::default(),
            phase_index: 0,
            total_phases_completed: 0,
            rep_info: RepetitionInfo::default(),
            start_time: None,
            step_start_time: None,
            phase_start_time: None,
            elapsed_time: 0.0,
            step_elapsed_time: 0.0,
            pause_time: None,
            remaining_step_time: 0.0,
            remaining_phase_time: 0.0,
            was_in_phase: false,
            paused_phase_index: 0,
            step_timer: TimerSlot::new(),
            phase_timer: TimerSlot::new(),
            debounce_timer: TimerSlot::new(),
            pending_pause_resume: None,
            power_debounce: TimerSlot::new(),
            pending_power_update: None,
            pause_for_message_display: false,
            message_waiting_for_response: false,
            message_rejected_pause: false,
            message_step_remaining: 0.0,
            message_phase_remaining: 0.0,
            message_total_elapsed: 0.0,
            message_step_elapsed: 0.0,
            message_phase_elapsed: 0.0,
            advanced_mode_editable: false,
            advanced_hardware_control: false,
            paused_original_electrodes: BTreeMap::new(),
            phase_navigation_mode: false,
            original_pause_phase_index: 0,
            navigated_phase_index: 0,
            waiting_for_droplet_check: false,
            droplet_check_failed: false,
            expected_droplet_channels: Vec::new(),
            droplet_memo: DropletCheckMemo::default(),
            threshold: ThresholdMonitor::default(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RunnerEvent>) {
        let mut status_tick = tokio::time::interval(STATUS_TICK);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut threshold_tick = tokio::time::interval(THRESHOLD_POLL);
        threshold_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(event) => {
                            if self.handle_event(event).is_break() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = status_tick.tick(), if self.running && !self.paused => {
                    self.emit_status();
                }
                _ = threshold_tick.tick(), if self.running && !self.paused && self.threshold.is_armed() => {
                    self.poll_threshold();
                }
            }
        }
        debug!("runner actor exiting");
    }

    fn notify(&self, notice: RunnerNotice) {
        let _ = self.notices.send(notice);
    }

    /// Realtime mode drives the HV output, so preview runs never touch it.
    fn publish_realtime_mode(&self, enable: bool) {
        if self.preview_mode {
            return;
        }
        let payload = if enable { "True" } else { "False" };
        self.bus.publish(topics::SET_REALTIME_MODE, payload);
    }

    fn handle_event(&mut self, event: RunnerEvent) -> ControlFlow<()> {
        match event {
            RunnerEvent::Start { preview_mode } => self.start(preview_mode),
            RunnerEvent::Pause { advanced_mode } => self.request_pause(advanced_mode),
            RunnerEvent::Resume => self.request_resume(),
            RunnerEvent::Stop => self.stop(),
            RunnerEvent::JumpToStep { path } => {
                self.jump_to_step_by_path(&path);
            }
            RunnerEvent::NextPhase => {
                self.navigate_to_next_phase();
            }
            RunnerEvent::PrevPhase => {
                self.navigate_to_previous_phase();
            }
            RunnerEvent::MessageResponse { accepted } => self.on_message_response(accepted),
            RunnerEvent::DropletDecision { proceed } => self.on_droplet_decision(proceed),
            RunnerEvent::DropletResponse(response) => self.on_droplet_response(&response),
            RunnerEvent::CapacitanceSample { picofarads, volts } => {
                self.on_capacitance_sample(picofarads, volts);
            }
            RunnerEvent::SetDropletCheck(enabled) => {
                self.droplet_check_enabled = enabled;
            }
            RunnerEvent::SetCalibration(calibration) => {
                self.calibration = calibration;
                self.data_logger
                    .set_capacitance_per_unit_area(self.calibration.capacitance_per_unit_area());
            }
            RunnerEvent::UpdateStepPower {
                step_uid,
                voltage,
                frequency,
            } => {
                // Rapid grid edits coalesce; the last value within the
                // window wins.
                self.pending_power_update = Some((step_uid, voltage, frequency));
                self.power_debounce.arm(
                    POWER_EDIT_DEBOUNCE,
                    &self.self_tx,
                    RunnerEvent::PowerDebounceFired,
                );
            }
            RunnerEvent::PowerDebounceFired(token) => {
                if self.power_debounce.accept_fire(token) {
                    if let Some((uid, voltage, frequency)) = self.pending_power_update.take() {
                        self.update_step_power(&uid, &voltage, &frequency);
                    }
                }
            }
            RunnerEvent::StepTimeout(token) => self.on_step_timeout(token),
            RunnerEvent::PhaseTimeout(token) => self.on_phase_timeout(token),
            RunnerEvent::DebounceFired(token) => self.on_debounce_fired(token),
            RunnerEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn current_entry(&self) -> Option<&RunEntry> {
        self.run_order.get(self.current_index)
    }

    fn current_device_state(&self) -> DeviceState {
        self.current_entry()
            .map(|e| e.step.device_state.clone())
            .unwrap_or_default()
    }

    /// Electrode set that is (or would be) driven right now.
    fn current_phase_electrodes(&self) -> BTreeMap<String, bool> {
        if self.phase_index > 0 && self.phase_index <= self.plan.len() {
            self.plan.phases[self.phase_index - 1].activated.clone()
        } else if let Some(first) = self.plan.phases.first() {
            first.activated.clone()
        } else {
            self.current_device_state().activated_electrodes
        }
    }

    fn update_log_context(&mut self) {
        if !self.running || self.preview_mode {
            return;
        }
        let Some(entry) = self.current_entry() else {
            return;
        };
        let step_id = entry.step.id().to_owned();
        let device_state = entry.step.device_state.clone();
        let electrodes = self.current_phase_electrodes();

        let mut actuated_channels: Vec<u32> = electrodes
            .iter()
            .filter(|(_, on)| **on)
            .filter_map(|(id, _)| device_state.id_to_channel.get(id).copied())
            .collect();
        actuated_channels.sort_unstable();
        let actuated_area = self.calibration.actuated_area(&electrodes);

        self.data_logger.set_context(LogContext {
            step_id,
            actuated_channels,
            actuated_area,
        });
    }

    fn publish_phase(&self, activated: &BTreeMap<String, bool>) {
        let Some(entry) = self.current_entry() else {
            return;
        };
        let device_state = &entry.step.device_state;

        let mut message =
            viewer::phase_viewer_message(device_state, activated, &entry.step, false);
        if self.advanced_mode_editable {
            message.step_info.free_mode = Some(true);
            message.editable = true;
        }
        self.bus
            .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());

        if !self.preview_mode {
            let hardware = viewer::hardware_state_message(device_state, activated);
            self.bus.publish(topics::ELECTRODES_STATE_CHANGE, hardware);
        }
    }

    // -----------------------------------------------------------------------
    // Start / stop / finish
    // -----------------------------------------------------------------------

    fn start(&mut self, preview_mode: bool) {
        if self.running {
            return;
        }
        self.preview_mode = preview_mode;
        self.publish_realtime_mode(true);

        self.running = true;
        self.paused = false;
        self.current_index = 0;
        self.reset_step_tracking();
        self.start_time = None;
        self.elapsed_time = 0.0;
        self.step_elapsed_time = 0.0;
        self.step_start_time = None;
        self.pause_time = None;
        self.droplet_memo.reset();

        {
            let mut state = self.shared.lock().expect("protocol lock");
            tree::assign_uids(&mut state);
            self.run_order = tree::flatten_run_order(&state);
        }
        self.unique_step_count = tree::unique_step_count(&self.run_order);

        if self.run_order.is_empty() {
            self.running = false;
            self.publish_realtime_mode(false);
            self.notify(RunnerNotice::Finished);
            return;
        }

        if !self.preview_mode {
            match experiment::current_experiment_directory() {
                Ok(dir) => self.data_logger.start(dir, false),
                Err(err) => warn!(%err, "no experiment directory, data logging disabled"),
            }
            self.data_logger
                .set_capacitance_per_unit_area(self.calibration.capacitance_per_unit_area());
        }

        info!(steps = self.run_order.len(), preview = self.preview_mode, "protocol started");
        self.execute_next_step();
    }

    fn stop(&mut self) {
        self.publish_realtime_mode(false);

        self.pause_for_message_display = false;
        self.message_waiting_for_response = false;
        self.message_rejected_pause = false;
        self.advanced_mode_editable = false;

        // Final message for the step that was executing, back in the
        // operator's hands.
        if self.running && self.current_index < self.run_order.len() {
            let entry = self.run_order[self.current_index].clone();
            let device_state = &entry.step.device_state;
            let mut message = viewer::phase_viewer_message(
                device_state,
                &device_state.activated_electrodes,
                &entry.step,
                true,
            );
            message.editable = true;
            self.bus
                .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());

            if !self.preview_mode {
                self.bus.publish(
                    topics::ELECTRODES_STATE_CHANGE,
                    viewer::deactivated_hardware_message(device_state),
                );
            }

            if let Some(uid) = entry.step.uid() {
                self.notify(RunnerNotice::SelectStep(uid.to_owned()));
            }
        }

        self.running = false;
        self.paused = false;
        self.step_timer.cancel();
        self.phase_timer.cancel();
        self.debounce_timer.cancel();
        self.pending_pause_resume = None;
        self.power_debounce.cancel();
        self.pending_power_update = None;

        self.current_index = 0;
        self.run_order.clear();
        self.unique_step_count = 0;
        self.reset_step_tracking();
        self.start_time = None;
        self.step_start_time = None;
        self.elapsed_time = 0.0;
        self.step_elapsed_time = 0.0;
        self.pause_time = None;

        self.advanced_hardware_control = false;
        self.paused_original_electrodes.clear();
        self.phase_navigation_mode = false;
        self.original_pause_phase_index = 0;
        self.navigated_phase_index = 0;

        self.droplet_check_enabled = false;
        self.droplet_memo.reset();

        self.threshold.disarm();

        if let Err(err) = self.data_logger.save() {
            warn!(%err, "failed to save data log");
        }
        self.data_logger.stop();
        info!("protocol stopped");
    }

    fn protocol_finished(&mut self) {
        self.publish_realtime_mode(false);

        if self.current_index > 0 && self.current_index <= self.run_order.len() {
            let entry = self.run_order[self.current_index - 1].clone();
            let device_state = &entry.step.device_state;
            let message = viewer::phase_viewer_message(
                device_state,
                &device_state.activated_electrodes,
                &entry.step,
                true,
            );
            self.bus
                .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());

            if !self.preview_mode {
                self.bus.publish(
                    topics::ELECTRODES_STATE_CHANGE,
                    viewer::deactivated_hardware_message(device_state),
                );
            }

            if let Some(uid) = entry.step.uid() {
                self.notify(RunnerNotice::SelectStep(uid.to_owned()));
            }
        }

        self.running = false;
        self.step_timer.cancel();
        self.phase_timer.cancel();

        if let Err(err) = self.data_logger.save() {
            warn!(%err, "failed to save data log");
        }
        self.data_logger.stop();

        info!("protocol finished");
        self.notify(RunnerNotice::Finished);
    }

    fn reset_step_tracking(&mut self) {
        self.plan = ExecutionPlan::default();
        self.phase_index = 0;
        self.total_phases_completed = 0;
        self.rep_info = RepetitionInfo::default();
        self.phase_start_time = None;
        self.remaining_phase_time = 0.0;
        self.remaining_step_time = 0.0;
        self.was_in_phase = false;
        self.paused_phase_index = 0;
        self.waiting_for_droplet_check = false;
        self.droplet_check_failed = false;
        self.expected_droplet_channels.clear();
        self.threshold.disarm();
    }

    // -----------------------------------------------------------------------
    // Step & phase execution
    // -----------------------------------------------------------------------

    fn execute_next_step(&mut self) {
        if self.paused || !self.running {
            return;
        }
        if self.current_index >= self.run_order.len() {
            self.protocol_finished();
            return;
        }

        let entry = self.run_order[self.current_index].clone();
        info!(
            step = self.current_index + 1,
            total = self.run_order.len(),
            description = entry.step.description(),
            rep = entry.rep_idx,
            rep_total = entry.rep_total,
            "executing step"
        );
        self.notify(RunnerNotice::HighlightStep(entry.path.clone()));

        self.plan = plan::build_execution_plan(&entry.step, &entry.step.device_state);
        self.rep_info = plan::repetition_info(&entry.step, &entry.step.device_state);
        self.phase_index = 0;
        self.total_phases_completed = 0;

        let now = Instant::now();
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.step_start_time = Some(now);
        self.step_elapsed_time = 0.0;
        self.phase_start_time = None;
        self.remaining_step_time = 0.0;
        self.remaining_phase_time = 0.0;
        self.was_in_phase = false;
        self.paused_phase_index = 0;

        power::publish_step_voltage_frequency(&self.bus, &entry.step, self.preview_mode);

        let step_timeout = plan::step_execution_time(&entry.step, &entry.step.device_state);
        self.step_timer.arm(
            Duration::from_secs_f64(step_timeout),
            &self.self_tx,
            RunnerEvent::StepTimeout,
        );
        debug!(
            step_timeout,
            phases = self.plan.len(),
            "step timer started"
        );

        self.update_log_context();

        if let Some(message) = entry.step.message() {
            let message = message.to_owned();
            self.show_individual_electrodes_and_message(&message);
        } else {
            self.execute_next_phase();
        }
    }

    fn execute_next_phase(&mut self) {
        if self.paused || !self.running {
            return;
        }
        if self.pause_for_message_display || self.message_waiting_for_response {
            return;
        }
        if self.phase_index >= self.plan.len() {
            self.step_completed_by_phases();
            return;
        }

        let item = self.plan.phases[self.phase_index].clone();
        debug!(
            phase = self.phase_index + 1,
            total = self.plan.len(),
            "executing phase"
        );

        let volume_threshold = self
            .current_entry()
            .map(|e| e.step.volume_threshold())
            .unwrap_or(0.0);

        // Viewer first, hardware second, then the clock starts.
        self.publish_phase(&item.activated);

        self.phase_start_time = Some(Instant::now());
        self.phase_index += 1;
        self.update_log_context();

        if volume_threshold > 0.0 && !self.preview_mode {
            let target =
                threshold::target_capacitance(volume_threshold, &item.activated, &self.calibration);
            if self.threshold.arm(target) {
                info!(target = ?self.threshold.target(), "volume threshold armed for phase");
            }
        } else {
            self.threshold.disarm();
        }

        self.phase_timer.arm(
            Duration::from_secs_f64(item.duration),
            &self.self_tx,
            RunnerEvent::PhaseTimeout,
        );
    }

    fn on_phase_timeout(&mut self, token: u64) {
        if !self.phase_timer.accept_fire(token) {
            return;
        }
        if !self.running || self.paused {
            return;
        }
        if self.threshold.is_armed() {
            info!(
                target = ?self.threshold.target(),
                "phase completed by timeout, volume threshold not reached"
            );
            self.threshold.disarm();
        }
        self.total_phases_completed += 1;
        self.phase_start_time = None;
        self.execute_next_phase();
    }

    fn on_step_timeout(&mut self, token: u64) {
        if !self.step_timer.accept_fire(token) {
            return;
        }
        if !self.running || self.paused {
            return;
        }
        if self.phase_index < self.plan.len() {
            // Timebox hit with phases still pending; skip to completion.
            self.phase_index = self.plan.len();
        }
        self.step_completed_by_phases();
    }

    fn step_completed_by_phases(&mut self) {
        if !self.running || self.paused {
            return;
        }
        info!(
            phases = self.total_phases_completed,
            "step completed by phases"
        );
        self.step_timer.cancel();
        self.phase_timer.cancel();
        self.threshold.disarm();

        let now = Instant::now();
        if let Some(step_start) = self.step_start_time {
            self.step_elapsed_time = now.duration_since(step_start).as_secs_f64();
        }
        if let Some(start) = self.start_time {
            self.elapsed_time = now.duration_since(start).as_secs_f64();
        }

        if self.should_perform_droplet_check() {
            self.perform_droplet_detection_check();
        } else {
            self.proceed_to_next_step();
        }
    }

    fn proceed_to_next_step(&mut self) {
        self.reset_step_tracking();
        self.current_index += 1;
        if self.current_index >= self.run_order.len() {
            self.protocol_finished();
        } else {
            self.execute_next_step();
        }
    }

    fn poll_threshold(&mut self) {
        // Latest reading arrived via CapacitanceSample events.
        if !self.threshold.reached() {
            return;
        }
        info!("volume threshold reached, advancing phase early");
        self.phase_timer.cancel();
        self.threshold.disarm();
        self.total_phases_completed += 1;
        self.phase_start_time = None;
        self.execute_next_phase();
    }

    fn on_capacitance_sample(&mut self, picofarads: f64, volts: f64) {
        self.threshold.update(picofarads);
        if self.running && !self.preview_mode {
            let signal = mf_protocol::CapacitanceSignal::format(picofarads, volts);
            self.data_logger.log_sample(&signal);
        }
    }

    // -----------------------------------------------------------------------
    // Message gating
    // -----------------------------------------------------------------------

    fn show_individual_electrodes_and_message(&mut self, message_text: &str) {
        let Some(entry) = self.current_entry() else {
            return;
        };
        let step = entry.step.clone();
        let device_state = step.device_state.clone();

        // Individual electrodes only; routes stay hidden until the
        // operator confirms.
        let message = viewer::individual_viewer_message(&device_state, &step, false);
        self.bus
            .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());
        if !self.preview_mode {
            self.bus.publish(
                topics::ELECTRODES_STATE_CHANGE,
                viewer::hardware_state_message(&device_state, &device_state.activated_electrodes),
            );
        }

        self.pause_for_message_display = true;
        self.message_waiting_for_response = true;
        self.pause_timers_for_message();

        let step_info = if step.description() != "Step" {
            format!("Step: {} (ID: {})", step.description(), step.id())
        } else if step.id().is_empty() {
            "Step".to_owned()
        } else {
            format!("Step ID: {}", step.id())
        };
        self.notify(RunnerNotice::MessagePrompt {
            message: message_text.to_owned(),
            step_info,
        });
    }

    fn pause_timers_for_message(&mut self) {
        let now = Instant::now();
        self.message_total_elapsed = self
            .start_time
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.message_step_elapsed = self
            .step_start_time
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.message_phase_elapsed = self
            .phase_start_time
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);

        self.message_step_remaining = if self.step_timer.is_armed() {
            self.step_timer.remaining_secs()
        } else {
            0.0
        };
        self.step_timer.cancel();
        self.message_phase_remaining = if self.phase_timer.is_armed() {
            self.phase_timer.remaining_secs()
        } else {
            0.0
        };
        self.phase_timer.cancel();
    }

    fn resume_timers_for_message(&mut self) {
        let now = Instant::now();
        if self.start_time.is_some() {
            self.start_time = Some(now - Duration::from_secs_f64(self.message_total_elapsed));
        }
        if self.step_start_time.is_some() {
            self.step_start_time = Some(now - Duration::from_secs_f64(self.message_step_elapsed));
        }
        if self.phase_start_time.is_some() {
            self.phase_start_time = Some(now - Duration::from_secs_f64(self.message_phase_elapsed));
        }

        if self.message_step_remaining > 0.0 {
            self.step_timer.arm(
                Duration::from_secs_f64(self.message_step_remaining),
                &self.self_tx,
                RunnerEvent::StepTimeout,
            );
        }
        if self.message_phase_remaining > 0.0 {
            self.phase_timer.arm(
                Duration::from_secs_f64(self.message_phase_remaining),
                &self.self_tx,
                RunnerEvent::PhaseTimeout,
            );
        }
        self.message_step_remaining = 0.0;
        self.message_phase_remaining = 0.0;
    }

    fn on_message_response(&mut self, accepted: bool) {
        if !self.message_waiting_for_response {
            return;
        }
        self.pause_for_message_display = false;
        self.message_waiting_for_response = false;

        if accepted {
            self.resume_timers_for_message();
            if self.running && !self.paused {
                self.execute_next_phase();
            }
        } else {
            // Rejected: park in Paused until the operator resumes; the
            // resume restarts this step from phase zero. Epochs shift so
            // the prompt time never counts as elapsed.
            let now = Instant::now();
            if self.start_time.is_some() {
                self.start_time = Some(now - Duration::from_secs_f64(self.message_total_elapsed));
            }
            if self.step_start_time.is_some() {
                self.step_start_time =
                    Some(now - Duration::from_secs_f64(self.message_step_elapsed));
            }
            self.remaining_step_time = self.message_step_remaining;
            self.message_step_remaining = 0.0;
            self.message_phase_remaining = 0.0;
            self.paused = true;
            self.pause_time = Some(now);
            self.message_rejected_pause = true;
            self.notify(RunnerNotice::Paused);
        }
    }

    // -----------------------------------------------------------------------
    // Pause / resume (debounced)
    // -----------------------------------------------------------------------

    fn request_pause(&mut self, advanced_mode: bool) {
        self.advanced_hardware_control = advanced_mode && !self.preview_mode;
        if self.advanced_hardware_control {
            self.paused_original_electrodes = self.current_phase_electrodes();
        }
        self.pending_pause_resume = Some(PendingAction::Pause);
        self.debounce_timer.arm(
            PAUSE_RESUME_DEBOUNCE,
            &self.self_tx,
            RunnerEvent::DebounceFired,
        );
    }

    fn request_resume(&mut self) {
        self.pending_pause_resume = Some(PendingAction::Resume);
        self.debounce_timer.arm(
            PAUSE_RESUME_DEBOUNCE,
            &self.self_tx,
            RunnerEvent::DebounceFired,
        );
    }

    fn on_debounce_fired(&mut self, token: u64) {
        if !self.debounce_timer.accept_fire(token) {
            return;
        }
        match self.pending_pause_resume.take() {
            Some(PendingAction::Pause) => self.internal_pause(),
            Some(PendingAction::Resume) => self.internal_resume(),
            None => {}
        }
    }

    fn internal_pause(&mut self) {
        if !self.running || self.paused {
            return;
        }
        self.paused = true;
        let now = Instant::now();
        self.pause_time = Some(now);
        self.step_timer.cancel();
        self.phase_timer.cancel();

        if let Some(start) = self.start_time {
            self.elapsed_time = now.duration_since(start).as_secs_f64();
        }
        if let Some(step_start) = self.step_start_time {
            self.step_elapsed_time = now.duration_since(step_start).as_secs_f64();
        }
        let phase_elapsed = self
            .phase_start_time
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);

        if self.phase_index > 0 && self.phase_index <= self.plan.len() {
            let duration = self.plan.phases[self.phase_index - 1].duration;
            self.remaining_phase_time = (duration - phase_elapsed).max(0.0);
            self.was_in_phase = true;
            self.paused_phase_index = self.phase_index - 1;
        } else {
            self.remaining_phase_time = 0.0;
            self.was_in_phase = false;
            self.paused_phase_index = self.phase_index;
        }

        if let Some(entry) = self.current_entry() {
            let total = plan::step_execution_time(&entry.step, &entry.step.device_state);
            self.remaining_step_time = (total - self.step_elapsed_time).max(0.0);
            info!(
                remaining = self.remaining_step_time,
                elapsed = self.step_elapsed_time,
                "paused"
            );
        }

        self.advanced_mode_editable = self.advanced_hardware_control;

        self.original_pause_phase_index = self.phase_index.saturating_sub(1);
        self.navigated_phase_index = self.original_pause_phase_index;

        if self.advanced_hardware_control {
            self.publish_advanced_pause_message();
        }

        self.notify(RunnerNotice::Paused);
    }

    fn internal_resume(&mut self) {
        if !self.running || !self.paused {
            return;
        }

        if self.advanced_hardware_control {
            self.restore_hardware_state_on_resume();
        }

        self.paused = false;
        let now = Instant::now();
        if let Some(paused_at) = self.pause_time {
            let span = now.duration_since(paused_at);
            self.start_time = self.start_time.map(|t| t + span);
            self.step_start_time = self.step_start_time.map(|t| t + span);
            self.phase_start_time = self.phase_start_time.map(|t| t + span);
        }

        if self.droplet_check_failed {
            self.droplet_check_failed = false;
            self.droplet_memo.navigation_occurred();
            self.pause_time = None;
            self.clear_advanced_state();
            self.proceed_to_next_step();
            return;
        }

        if self.message_rejected_pause {
            self.message_rejected_pause = false;
            self.phase_index = 0;
            self.phase_start_time = None;
            self.execute_next_phase();
            if self.remaining_step_time > 0.0 {
                self.step_timer.arm(
                    Duration::from_secs_f64(self.remaining_step_time),
                    &self.self_tx,
                    RunnerEvent::StepTimeout,
                );
            }
            self.pause_time = None;
            self.was_in_phase = false;
            self.clear_advanced_state();
            return;
        }

        if self.phase_navigation_mode {
            // Resume from the navigated phase; the step timer gets what is
            // left of the plan from there.
            self.phase_index = self.navigated_phase_index;
            let new_remaining = if self.plan.is_empty() {
                self.remaining_step_time
            } else {
                let phases_remaining = self.plan.len() - self.navigated_phase_index;
                phases_remaining as f64 * self.plan.phases[0].duration
            };

            self.phase_navigation_mode = false;
            self.original_pause_phase_index = 0;
            self.navigated_phase_index = 0;

            self.phase_start_time = None;
            self.execute_next_phase();
            if new_remaining > 0.0 {
                self.step_timer.arm(
                    Duration::from_secs_f64(new_remaining),
                    &self.self_tx,
                    RunnerEvent::StepTimeout,
                );
                info!(remaining = new_remaining, "resuming from navigated phase");
            }
        } else if !self.plan.is_empty()
            && self.phase_index == 0
            && self.total_phases_completed == 0
            && !self.was_in_phase
        {
            // Jumped to a different step while paused: start it fresh.
            info!("resuming from navigated step");
            self.execute_next_step();
        } else if self.was_in_phase && self.remaining_phase_time > 0.0 {
            self.phase_start_time = Some(now);
            self.phase_timer.arm(
                Duration::from_secs_f64(self.remaining_phase_time),
                &self.self_tx,
                RunnerEvent::PhaseTimeout,
            );
            info!(
                phase = self.paused_phase_index + 1,
                remaining = self.remaining_phase_time,
                "resuming mid-phase"
            );
            if self.remaining_step_time > 0.0 {
                self.step_timer.arm(
                    Duration::from_secs_f64(self.remaining_step_time),
                    &self.self_tx,
                    RunnerEvent::StepTimeout,
                );
            }
        } else {
            self.phase_start_time = None;
            self.execute_next_phase();
            if self.remaining_step_time > 0.0 {
                self.step_timer.arm(
                    Duration::from_secs_f64(self.remaining_step_time),
                    &self.self_tx,
                    RunnerEvent::StepTimeout,
                );
            }
        }

        self.pause_time = None;
        self.was_in_phase = false;
        self.clear_advanced_state();
    }

    fn clear_advanced_state(&mut self) {
        self.advanced_mode_editable = false;
        self.advanced_hardware_control = false;
        self.paused_original_electrodes.clear();
    }

    fn publish_advanced_pause_message(&mut self) {
        if !self.running || self.current_index >= self.run_order.len() {
            return;
        }
        let entry = self.run_order[self.current_index].clone();
        let electrodes = self.current_phase_electrodes();
        let mut message = viewer::phase_viewer_message(
            &entry.step.device_state,
            &electrodes,
            &entry.step,
            true,
        );
        message.step_info.free_mode = Some(true);
        message.editable = true;
        self.advanced_mode_editable = true;
        self.bus
            .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());
    }

    fn restore_hardware_state_on_resume(&mut self) {
        if self.paused_original_electrodes.is_empty() || self.preview_mode {
            return;
        }
        let device_state = self.current_device_state();
        let hardware =
            viewer::hardware_state_message(&device_state, &self.paused_original_electrodes);
        self.bus.publish(topics::ELECTRODES_STATE_CHANGE, hardware);
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    fn jump_to_step_by_path(&mut self, step_path: &[usize]) -> bool {
        if !self.running || self.run_order.is_empty() {
            return false;
        }
        let Some(target_index) = self.run_order.iter().position(|e| e.path == step_path) else {
            warn!(?step_path, "no run-order entry for step path");
            return false;
        };

        self.step_timer.cancel();
        self.phase_timer.cancel();

        let now = Instant::now();
        if let Some(step_start) = self.step_start_time {
            self.step_elapsed_time = now.duration_since(step_start).as_secs_f64();
        }
        if let Some(start) = self.start_time {
            self.elapsed_time = now.duration_since(start).as_secs_f64();
        }

        self.current_index = target_index;
        self.droplet_memo.navigation_occurred();
        self.reset_step_tracking();
        self.clear_advanced_state();

        if !self.paused {
            self.execute_next_step();
        } else {
            // Preview the target's first phase; execution begins on resume.
            let entry = self.run_order[self.current_index].clone();
            self.notify(RunnerNotice::HighlightStep(entry.path.clone()));
            self.plan = plan::build_execution_plan(&entry.step, &entry.step.device_state);
            self.rep_info = plan::repetition_info(&entry.step, &entry.step.device_state);

            if let Some(first) = self.plan.phases.first() {
                let mut message = viewer::phase_viewer_message(
                    &entry.step.device_state,
                    &first.activated,
                    &entry.step,
                    true,
                );
                message.editable = true;
                self.bus
                    .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());
            }
        }
        true
    }

    fn can_navigate_phases(&self) -> bool {
        self.running
            && self
                .current_entry()
                .map(|e| e.step.device_state.has_paths())
                .unwrap_or(false)
    }

    fn navigate_to_previous_phase(&mut self) -> bool {
        if !self.paused || self.plan.is_empty() || !self.can_navigate_phases() {
            return false;
        }
        if self.navigated_phase_index == 0 {
            return false;
        }
        self.navigated_phase_index -= 1;
        self.phase_navigation_mode = true;
        self.droplet_memo.navigation_occurred();
        self.publish_phase_navigation_state();
        info!(
            phase = self.navigated_phase_index + 1,
            total = self.plan.len(),
            "navigated to previous phase"
        );
        true
    }

    fn navigate_to_next_phase(&mut self) -> bool {
        if !self.paused || self.plan.is_empty() || !self.can_navigate_phases() {
            return false;
        }
        if self.navigated_phase_index >= self.plan.len() - 1 {
            return false;
        }
        if self.message_rejected_pause {
            self.navigated_phase_index = 0;
            self.message_rejected_pause = false;
        } else {
            self.navigated_phase_index += 1;
        }
        self.phase_navigation_mode = true;
        self.droplet_memo.navigation_occurred();
        self.publish_phase_navigation_state();
        info!(
            phase = self.navigated_phase_index + 1,
            total = self.plan.len(),
            "navigated to next phase"
        );
        true
    }

    fn publish_phase_navigation_state(&mut self) {
        if self.plan.is_empty() || !self.paused {
            return;
        }
        let activated = self.plan.phases[self.navigated_phase_index].activated.clone();
        self.publish_phase(&activated);
    }

    // -----------------------------------------------------------------------
    // Droplet verification
    // -----------------------------------------------------------------------

    fn should_perform_droplet_check(&self) -> bool {
        if !self.droplet_check_enabled || self.preview_mode {
            return false;
        }
        let Some(entry) = self.current_entry() else {
            return false;
        };
        if !self.droplet_memo.should_check(self.current_index) {
            debug!(step = self.current_index, "droplet check suppressed until navigation");
            return false;
        }
        let device_state = &entry.step.device_state;
        device_state.has_individual_electrodes() || device_state.has_paths()
    }

    fn perform_droplet_detection_check(&mut self) {
        self.droplet_memo.mark_attempted(self.current_index);

        let expected = match self.current_entry() {
            Some(entry) => {
                droplets::expected_droplet_channels(&entry.step, &entry.step.device_state)
            }
            None => {
                self.proceed_to_next_step();
                return;
            }
        };
        if expected.is_empty() {
            info!("no channels to check for droplets");
            self.proceed_to_next_step();
            return;
        }

        info!(?expected, "requesting droplet detection");
        self.expected_droplet_channels = expected.clone();
        self.waiting_for_droplet_check = true;
        let payload =
            serde_json::to_string(&expected).expect("channel list serialization is infallible");
        self.bus.publish(topics::DETECT_DROPLETS, payload);
    }

    fn on_droplet_response(&mut self, response: &DropletResponse) {
        if !self.waiting_for_droplet_check {
            return;
        }
        self.waiting_for_droplet_check = false;

        match droplets::evaluate_response(&self.expected_droplet_channels, response) {
            DropletCheckOutcome::AllPresent => {
                info!("all expected droplets detected");
                self.proceed_to_next_step();
            }
            DropletCheckOutcome::DetectionFailed(err) => {
                error!(%err, "droplet detection failed, continuing");
                self.proceed_to_next_step();
            }
            DropletCheckOutcome::Missing {
                expected,
                detected,
                missing,
            } => {
                warn!(?missing, "droplets missing after step");
                self.handle_droplet_detection_failure(expected, detected, missing);
            }
        }
    }

    fn handle_droplet_detection_failure(
        &mut self,
        expected: Vec<u32>,
        detected: Vec<u32>,
        missing: Vec<u32>,
    ) {
        self.droplet_check_failed = true;

        if !self.paused {
            // The step itself is complete; park at its end.
            self.paused = true;
            self.pause_time = Some(Instant::now());
            self.remaining_phase_time = 0.0;
            self.remaining_step_time = 0.0;
            self.was_in_phase = false;
        }
        let last = self.plan.len().saturating_sub(1);
        self.paused_phase_index = last;
        self.original_pause_phase_index = last;
        self.navigated_phase_index = last;

        self.notify(RunnerNotice::DropletFailure {
            expected,
            detected,
            missing,
        });
        self.notify(RunnerNotice::Paused);
    }

    fn on_droplet_decision(&mut self, proceed: bool) {
        if !self.droplet_check_failed {
            return;
        }
        self.droplet_check_failed = false;
        if proceed {
            if !self.paused {
                return;
            }
            self.paused = false;
            let now = Instant::now();
            if let Some(paused_at) = self.pause_time.take() {
                let span = now.duration_since(paused_at);
                self.start_time = self.start_time.map(|t| t + span);
                self.step_start_time = self.step_start_time.map(|t| t + span);
            }
            self.droplet_memo.navigation_occurred();
            self.proceed_to_next_step();
        } else {
            // Stay paused at the step's end; navigation re-arms the check.
            self.droplet_memo.skip_until_navigation();
            info!("staying paused after droplet failure; phase navigation enabled");
        }
    }

    // -----------------------------------------------------------------------
    // Mid-run edits
    // -----------------------------------------------------------------------

    fn update_step_power(&mut self, step_uid: &str, voltage: &str, frequency: &str) -> bool {
        if !self.running || self.run_order.is_empty() {
            return false;
        }
        let Some(target_index) = self
            .run_order
            .iter()
            .position(|e| e.step.uid() == Some(step_uid))
        else {
            return false;
        };

        for entry in self
            .run_order
            .iter_mut()
            .filter(|e| e.step.uid() == Some(step_uid))
        {
            entry
                .step
                .set_parameter(protocol_core::params::VOLTAGE, voltage);
            entry
                .step
                .set_parameter(protocol_core::params::FREQUENCY, frequency);
        }
        {
            let mut state = self.shared.lock().expect("protocol lock");
            if let Some(step) = tree::find_step_by_uid_mut(&mut state.sequence, step_uid) {
                step.set_parameter(protocol_core::params::VOLTAGE, voltage);
                step.set_parameter(protocol_core::params::FREQUENCY, frequency);
            }
        }

        if target_index == self.current_index {
            power::publish_immediate_voltage_frequency(
                &self.bus,
                voltage,
                frequency,
                self.preview_mode,
            );
            info!(voltage, frequency, "updated setpoints of running step");
        } else {
            info!(voltage, frequency, "updated setpoints of upcoming step");
        }
        true
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    fn emit_status(&mut self) {
        if !self.running || self.run_order.is_empty() {
            return;
        }
        let now = Instant::now();

        let (total_time, step_time) = if self.paused {
            let step_time = if self.phase_navigation_mode && !self.plan.is_empty() {
                let moved = self.navigated_phase_index as f64
                    - self.original_pause_phase_index as f64;
                self.step_elapsed_time + moved * self.plan.phases[0].duration
            } else {
                self.step_elapsed_time
            };
            (self.elapsed_time, step_time)
        } else {
            match (self.start_time, self.step_start_time) {
                (Some(start), Some(step_start)) => (
                    now.duration_since(start).as_secs_f64(),
                    now.duration_since(step_start).as_secs_f64(),
                ),
                _ => (0.0, 0.0),
            }
        };

        let mut step_position = 0;
        for (i, entry) in self.run_order.iter().enumerate() {
            if entry.rep_idx == 1 {
                step_position += 1;
            }
            if i >= self.current_index {
                break;
            }
        }

        let phase_for_rep = if self.phase_navigation_mode {
            self.navigated_phase_index
        } else {
            self.phase_index.saturating_sub(1)
        };
        let (rep_idx, rep_total) = self.rep_info.repetition_for_phase(phase_for_rep);

        let recent_step = if self.current_index > 0 {
            self.run_order[self.current_index - 1]
                .step
                .description()
                .to_owned()
        } else {
            "-".to_owned()
        };
        let next_step = self
            .run_order
            .get(self.current_index + 1)
            .map(|e| e.step.description().to_owned())
            .unwrap_or_else(|| "-".to_owned());

        let _ = self.status_tx.send(RunnerStatus {
            total_time,
            step_time,
            step_idx: step_position,
            step_total: self.unique_step_count,
            step_rep_idx: rep_idx,
            step_rep_total: rep_total,
            recent_step,
            next_step,
        });
    }
}
