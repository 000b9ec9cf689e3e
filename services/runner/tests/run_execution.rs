//! End-to-end runner scenarios under virtual time.
//!
//! Every test runs with `start_paused = true`: tokio's clock only advances
//! when all tasks are idle, so phase timing asserts exact virtual
//! durations without real waiting.

use mf_bus::MessageBus;
use mf_protocol::{topics, DropletResponse, ViewerMessage};
use protocol_core::calibration::CalibrationData;
use protocol_core::params;
use protocol_core::{DeviceState, ProtocolElement, ProtocolState, ProtocolStep};
use runner::runner::{spawn_runner, RunnerEvent, RunnerHandle, RunnerNotice};
use runner::viewer::SharedProtocol;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{advance, timeout, Instant};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn experiments_root_for_tests() {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    let root = ROOT.get_or_init(|| {
        let dir = std::env::temp_dir().join("microflow-runner-tests");
        let _ = std::fs::create_dir_all(&dir);
        dir
    });
    runner::experiment::set_global(
        runner::experiment::EXPERIMENTS_ROOT_KEY,
        root.display().to_string(),
    );
}

struct Harness {
    bus: MessageBus,
    handle: RunnerHandle,
    notices: mpsc::UnboundedReceiver<RunnerNotice>,
    published: mpsc::UnboundedReceiver<(String, String)>,
    shared: SharedProtocol,
}

fn harness(steps: Vec<ProtocolStep>) -> Harness {
    experiments_root_for_tests();
    let bus = MessageBus::new();
    let shared: SharedProtocol = Arc::new(Mutex::new(ProtocolState::with_sequence(
        steps.into_iter().map(ProtocolElement::Step).collect(),
    )));
    {
        let mut state = shared.lock().unwrap();
        protocol_core::tree::assign_uids(&mut state);
        protocol_core::tree::reassign_ids(&mut state);
    }

    let (handle, notices) = spawn_runner(bus.clone(), shared.clone());
    runner::listener::RunnerListener::attach(&bus, handle.sender());

    let (tx, published) = mpsc::unbounded_channel();
    let mut capture = bus.register_listener("capture");
    bus.subscribe("#", "capture");
    tokio::spawn(async move {
        while let Some(delivery) = capture.recv().await {
            let _ = tx.send((delivery.topic, delivery.message.payload().to_owned()));
        }
    });

    Harness {
        bus,
        handle,
        notices,
        published,
        shared,
    }
}

fn step(paths: Vec<Vec<&str>>, params_kv: &[(&str, &str)]) -> ProtocolStep {
    let mut step = ProtocolStep::new("Step");
    for (key, value) in params_kv {
        step.set_parameter(key, *value);
    }
    let id_to_channel: BTreeMap<String, u32> = [
        ("a", 1),
        ("b", 2),
        ("c", 3),
        ("d", 4),
        ("e", 5),
        ("12", 12),
    ]
    .into_iter()
    .map(|(id, ch)| (id.to_owned(), ch))
    .collect();
    step.device_state = DeviceState {
        activated_electrodes: BTreeMap::new(),
        paths: paths
            .into_iter()
            .map(|p| p.into_iter().map(str::to_owned).collect())
            .collect(),
        route_colors: vec![],
        id_to_channel,
    };
    step
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<RunnerNotice>) -> RunnerNotice {
    timeout(Duration::from_secs(600), notices.recv())
        .await
        .expect("timed out waiting for notice")
        .expect("notice channel closed")
}

async fn wait_for(
    notices: &mut mpsc::UnboundedReceiver<RunnerNotice>,
    want: fn(&RunnerNotice) -> bool,
) -> RunnerNotice {
    loop {
        let notice = next_notice(notices).await;
        if want(&notice) {
            return notice;
        }
    }
}

/// Drain everything published so far, returning `(topic, payload)` pairs.
fn drain_published(published: &mut mpsc::UnboundedReceiver<(String, String)>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    while let Ok(pair) = published.try_recv() {
        out.push(pair);
    }
    out
}

fn active_channels(payload: &str) -> Vec<String> {
    let message = ViewerMessage::deserialize(payload).unwrap();
    message
        .channels_activated
        .iter()
        .filter(|(_, on)| **on)
        .map(|(ch, _)| ch.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario: open path, no overlap
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn open_path_runs_two_phases_in_two_seconds() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b", "c", "d"]],
        &[
            (params::DURATION, "1.0"),
            (params::TRAIL_LENGTH, "2"),
            (params::TRAIL_OVERLAY, "0"),
            (params::REPETITIONS, "1"),
        ],
    )]);

    let begun = Instant::now();
    h.handle.start(true);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
    assert_eq!(begun.elapsed(), Duration::from_secs(2));

    let display: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .filter(|(t, _)| t == topics::PROTOCOL_GRID_DISPLAY_STATE)
        .map(|(_, p)| p)
        .collect();
    // Two phase messages plus the final editable message.
    assert_eq!(display.len(), 3);
    assert_eq!(active_channels(&display[0]), vec!["1", "2"]);
    assert_eq!(active_channels(&display[1]), vec!["3", "4"]);
    let last = ViewerMessage::deserialize(&display[2]).unwrap();
    assert!(last.editable);
}

// ---------------------------------------------------------------------------
// Scenario: preview suppression
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn preview_mode_suppresses_hardware_and_power_messages() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b"]],
        &[(params::DURATION, "0.5"), (params::TRAIL_LENGTH, "1")],
    )]);

    h.handle.start(true);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;

    let topics_seen: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert!(topics_seen.iter().any(|t| t == topics::PROTOCOL_GRID_DISPLAY_STATE));
    assert!(!topics_seen.iter().any(|t| t == topics::ELECTRODES_STATE_CHANGE));
    assert!(!topics_seen.iter().any(|t| t == topics::SET_VOLTAGE));
    assert!(!topics_seen.iter().any(|t| t == topics::SET_FREQUENCY));
    assert!(!topics_seen.iter().any(|t| t == topics::SET_REALTIME_MODE));
}

#[tokio::test(start_paused = true)]
async fn live_mode_orders_viewer_before_hardware_and_power_before_phases() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b"]],
        &[(params::DURATION, "0.5"), (params::TRAIL_LENGTH, "1")],
    )]);

    h.handle.start(false);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;

    let topics_seen: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    let pos = |topic: &str| topics_seen.iter().position(|t| t == topic).unwrap();
    assert!(pos(topics::SET_VOLTAGE) < pos(topics::PROTOCOL_GRID_DISPLAY_STATE));
    assert!(pos(topics::SET_FREQUENCY) < pos(topics::PROTOCOL_GRID_DISPLAY_STATE));
    assert!(pos(topics::PROTOCOL_GRID_DISPLAY_STATE) < pos(topics::ELECTRODES_STATE_CHANGE));
}

// ---------------------------------------------------------------------------
// Scenario: pause / resume
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pause_resume_preserves_phase_remainders() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b", "c", "d"]],
        &[
            (params::DURATION, "1.0"),
            (params::TRAIL_LENGTH, "2"),
            (params::TRAIL_OVERLAY, "0"),
        ],
    )]);

    let begun = Instant::now();
    h.handle.start(true);

    // Let the first phase run 0.4 s, then pause (debounce adds 0.25 s).
    advance(Duration::from_millis(400)).await;
    h.handle.pause(false);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Paused)).await;

    // Stay paused a while; no phase progress may happen.
    advance(Duration::from_secs(5)).await;
    h.handle.resume();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;

    // The pause takes effect 250 ms (debounce) after the request, i.e. at
    // 650 ms into the first phase; the remaining 1350 ms of phase time run
    // after the 5 s pause and the 250 ms resume debounce.
    assert_eq!(
        begun.elapsed(),
        Duration::from_millis(400 + 250 + 5000 + 250 + 1350)
    );

    let display_count = drain_published(&mut h.published)
        .into_iter()
        .filter(|(t, _)| t == topics::PROTOCOL_GRID_DISPLAY_STATE)
        .count();
    // Resuming mid-phase does not republish the phase. Two phases plus the
    // final message.
    assert_eq!(display_count, 3);
}

// ---------------------------------------------------------------------------
// Scenario: message gating
// ---------------------------------------------------------------------------

fn message_step() -> ProtocolStep {
    let mut s = step(
        vec![],
        &[
            (params::DURATION, "1.0"),
            (params::MESSAGE, "Pipette 5 uL"),
        ],
    );
    s.device_state
        .activated_electrodes
        .insert("12".to_owned(), true);
    s
}

#[tokio::test(start_paused = true)]
async fn message_step_shows_individual_electrodes_and_waits() {
    let mut h = harness(vec![message_step()]);

    h.handle.start(true);
    let notice = wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::MessagePrompt { .. })
    })
    .await;
    let RunnerNotice::MessagePrompt { message, .. } = notice else {
        unreachable!()
    };
    assert_eq!(message, "Pipette 5 uL");

    // The gating message shows the individual electrode with no routes.
    let display: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .filter(|(t, _)| t == topics::PROTOCOL_GRID_DISPLAY_STATE)
        .map(|(_, p)| p)
        .collect();
    let gate = ViewerMessage::deserialize(display.last().unwrap()).unwrap();
    assert_eq!(active_channels(display.last().unwrap()), vec!["12"]);
    assert!(gate.routes.is_empty());

    // Timers are parked: hours may pass without the step finishing.
    advance(Duration::from_secs(3600)).await;
    assert!(h.notices.try_recv().is_err());

    // YES resumes and the single phase runs to completion.
    h.handle.send(RunnerEvent::MessageResponse { accepted: true });
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
}

#[tokio::test(start_paused = true)]
async fn message_rejection_parks_in_paused_until_resume() {
    let mut h = harness(vec![message_step()]);

    h.handle.start(true);
    wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::MessagePrompt { .. })
    })
    .await;

    h.handle.send(RunnerEvent::MessageResponse { accepted: false });
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Paused)).await;

    advance(Duration::from_secs(60)).await;
    assert!(h.notices.try_recv().is_err());

    // Resume restarts the step from phase zero and completes it.
    h.handle.resume();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
}

// ---------------------------------------------------------------------------
// Scenario: volume threshold early exit
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn volume_threshold_advances_phase_early() {
    let mut s = step(
        vec![],
        &[
            (params::DURATION, "4.0"),
            (params::VOLUME_THRESHOLD, "0.5"),
        ],
    );
    s.device_state
        .activated_electrodes
        .insert("12".to_owned(), true);
    let mut h = harness(vec![s]);

    // C/A = (10-2)/4 = 2 pF/mm^2; actuated area 3 -> target 3 pF.
    h.handle.send(RunnerEvent::SetCalibration(CalibrationData {
        liquid_capacitance: Some(10.0),
        filler_capacitance: Some(2.0),
        electrode_areas: BTreeMap::from([
            ("x".to_owned(), 2.0),
            ("y".to_owned(), 2.0),
            ("12".to_owned(), 3.0),
        ]),
        active_electrodes: vec!["x".to_owned(), "y".to_owned()],
    }));

    let begun = Instant::now();
    h.handle.start(false);

    // Samples arrive every 50 ms; the third crosses the target.
    for pf in [2.0, 2.5, 3.1] {
        advance(Duration::from_millis(50)).await;
        h.handle.send(RunnerEvent::CapacitanceSample {
            picofarads: pf,
            volts: 100.0,
        });
    }

    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
    // Early exit: well before the 4 s phase duration.
    assert!(begun.elapsed() < Duration::from_secs(1), "took {:?}", begun.elapsed());
}

#[tokio::test(start_paused = true)]
async fn without_samples_the_phase_runs_its_full_duration() {
    let mut s = step(
        vec![],
        &[
            (params::DURATION, "4.0"),
            (params::VOLUME_THRESHOLD, "0.5"),
        ],
    );
    s.device_state
        .activated_electrodes
        .insert("12".to_owned(), true);
    let mut h = harness(vec![s]);

    let begun = Instant::now();
    h.handle.start(false);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
    assert_eq!(begun.elapsed(), Duration::from_secs(4));
}

// ---------------------------------------------------------------------------
// Scenario: droplet detection failure
// ---------------------------------------------------------------------------

/// Answer every detection request with a fixed set of wet channels.
fn fake_detector(bus: &MessageBus, detected: Vec<u32>) {
    let mut rx = bus.register_listener("fake_detector");
    bus.subscribe(topics::DETECT_DROPLETS, "fake_detector");
    let bus = bus.clone();
    tokio::spawn(async move {
        while let Some(_request) = rx.recv().await {
            let response = DropletResponse::ok(detected.clone());
            bus.publish(
                topics::DROPLETS_DETECTED,
                serde_json::to_string(&response).unwrap(),
            );
        }
    });
}

fn droplet_step() -> ProtocolStep {
    let mut s = step(vec![], &[(params::DURATION, "0.5")]);
    s.device_state
        .activated_electrodes
        .insert("c".to_owned(), true); // channel 3
    s.device_state
        .activated_electrodes
        .insert("d".to_owned(), true); // channel 4... expected {3, 4}
    s
}

#[tokio::test(start_paused = true)]
async fn missing_droplets_pause_with_failure_details() {
    let mut h = harness(vec![droplet_step()]);
    fake_detector(&h.bus, vec![3]);
    h.handle.send(RunnerEvent::SetDropletCheck(true));

    h.handle.start(false);

    let notice = wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::DropletFailure { .. })
    })
    .await;
    let RunnerNotice::DropletFailure {
        expected,
        detected,
        missing,
    } = notice
    else {
        unreachable!()
    };
    assert_eq!(expected, vec![3, 4]);
    assert_eq!(detected, vec![3]);
    assert_eq!(missing, vec![4]);

    // Continue advances past the step.
    h.handle.send(RunnerEvent::DropletDecision { proceed: true });
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
}

#[tokio::test(start_paused = true)]
async fn staying_paused_suppresses_recheck_on_resume() {
    let mut h = harness(vec![droplet_step()]);
    fake_detector(&h.bus, vec![3]);
    h.handle.send(RunnerEvent::SetDropletCheck(true));

    h.handle.start(false);
    wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::DropletFailure { .. })
    })
    .await;

    h.handle.send(RunnerEvent::DropletDecision { proceed: false });
    advance(Duration::from_secs(10)).await;
    // Still paused: no finish.
    while let Ok(notice) = h.notices.try_recv() {
        assert!(!matches!(notice, RunnerNotice::Finished));
    }

    // A plain resume moves on without re-running the droplet check.
    h.handle.resume();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
}

#[tokio::test(start_paused = true)]
async fn passing_droplet_check_continues_silently() {
    let mut h = harness(vec![droplet_step()]);
    fake_detector(&h.bus, vec![3, 4, 9]);
    h.handle.send(RunnerEvent::SetDropletCheck(true));

    h.handle.start(false);
    let notice = wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::Finished | RunnerNotice::DropletFailure { .. })
    })
    .await;
    assert!(matches!(notice, RunnerNotice::Finished));
}

// ---------------------------------------------------------------------------
// Phase navigation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn phase_navigation_updates_viewer_and_resumes_from_navigated_phase() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b", "c", "d"]],
        &[
            (params::DURATION, "1.0"),
            (params::TRAIL_LENGTH, "1"),
            (params::TRAIL_OVERLAY, "0"),
        ],
    )]);

    h.handle.start(true);
    advance(Duration::from_millis(100)).await;
    h.handle.pause(false);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Paused)).await;
    drain_published(&mut h.published);

    // Paused inside phase 1 (index 0); navigate forward twice -> phase 3.
    h.handle.send(RunnerEvent::NextPhase);
    h.handle.send(RunnerEvent::PrevPhase);
    h.handle.send(RunnerEvent::NextPhase);
    h.handle.send(RunnerEvent::NextPhase);
    // Give the actor a chance to process the queue.
    advance(Duration::from_millis(10)).await;

    let display: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .filter(|(t, _)| t == topics::PROTOCOL_GRID_DISPLAY_STATE)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(display.len(), 4);
    // Last navigation landed on the third electrode of the path.
    assert_eq!(active_channels(display.last().unwrap()), vec!["3"]);

    let begun = Instant::now();
    h.handle.resume();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
    // Two phases remain from index 2 (plus the 250 ms resume debounce).
    assert_eq!(begun.elapsed(), Duration::from_millis(250 + 2000));
}

#[tokio::test(start_paused = true)]
async fn jump_to_step_while_paused_starts_it_fresh_on_resume() {
    let first = step(
        vec![vec!["a", "b"]],
        &[(params::DURATION, "1.0"), (params::TRAIL_LENGTH, "1")],
    );
    let second = step(
        vec![vec!["c", "d"]],
        &[(params::DURATION, "1.0"), (params::TRAIL_LENGTH, "1")],
    );
    let mut h = harness(vec![first, second]);

    h.handle.start(true);
    advance(Duration::from_millis(100)).await;
    h.handle.pause(false);
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Paused)).await;

    h.handle.send(RunnerEvent::JumpToStep { path: vec![1] });
    let notice = wait_for(&mut h.notices, |n| {
        matches!(n, RunnerNotice::HighlightStep(p) if p == &vec![1])
    })
    .await;
    assert_eq!(notice, RunnerNotice::HighlightStep(vec![1]));

    let begun = Instant::now();
    h.handle.resume();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::Finished)).await;
    // The jumped-to step runs in full: debounce + 2 phases.
    assert_eq!(begun.elapsed(), Duration::from_millis(250 + 2000));
}

// ---------------------------------------------------------------------------
// Mid-run voltage/frequency edits
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rapid_power_edits_coalesce_to_the_last_value() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b", "c", "d"]],
        &[(params::DURATION, "10.0"), (params::TRAIL_LENGTH, "2")],
    )]);
    let uid = {
        let state = h.shared.lock().unwrap();
        state.sequence[0].as_step().unwrap().uid().unwrap().to_owned()
    };

    h.handle.start(false);
    advance(Duration::from_millis(100)).await;
    drain_published(&mut h.published);

    for voltage in ["110", "115", "120"] {
        h.handle.send(RunnerEvent::UpdateStepPower {
            step_uid: uid.clone(),
            voltage: voltage.to_owned(),
            frequency: "5000".to_owned(),
        });
    }
    advance(Duration::from_millis(400)).await;

    let voltages: Vec<String> = drain_published(&mut h.published)
        .into_iter()
        .filter(|(t, _)| t == topics::SET_VOLTAGE)
        .map(|(_, p)| p)
        .collect();
    // Only the last edit of the burst goes out.
    assert_eq!(voltages, vec!["120".to_owned()]);

    h.handle.stop();
    wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::SelectStep(_))).await;
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_publishes_final_editable_state_and_zeroes_hardware() {
    let mut h = harness(vec![step(
        vec![vec!["a", "b", "c", "d"]],
        &[(params::DURATION, "10.0"), (params::TRAIL_LENGTH, "2")],
    )]);

    h.handle.start(false);
    advance(Duration::from_millis(500)).await;
    drain_published(&mut h.published);

    h.handle.stop();
    let select = wait_for(&mut h.notices, |n| matches!(n, RunnerNotice::SelectStep(_))).await;
    assert!(matches!(select, RunnerNotice::SelectStep(_)));

    advance(Duration::from_millis(10)).await;
    let published = drain_published(&mut h.published);
    let final_display = published
        .iter()
        .filter(|(t, _)| t == topics::PROTOCOL_GRID_DISPLAY_STATE)
        .next_back()
        .expect("final viewer message");
    let message = ViewerMessage::deserialize(&final_display.1).unwrap();
    assert!(message.editable);

    let zeroed = published
        .iter()
        .filter(|(t, _)| t == topics::ELECTRODES_STATE_CHANGE)
        .next_back()
        .expect("final hardware message");
    let channels: BTreeMap<String, bool> = serde_json::from_str(&zeroed.1).unwrap();
    assert!(channels.values().all(|on| !on));

    // Realtime mode switched off on stop.
    assert!(published
        .iter()
        .any(|(t, p)| t == topics::SET_REALTIME_MODE && p == "False"));
}
