//! Device viewer bridge.
//!
//! Two projections with step UIDs as the shared identity:
//! - step device state -> viewer wire message (electrode ids mapped to
//!   channels, routes and colors passed through, UID + label attached);
//! - incoming viewer message -> the step it names. An unknown UID is
//!   dropped silently. When the incoming `id_to_channel` differs from the
//!   protocol's, the new mapping propagates to every step first -- all
//!   steps share one chip layout.
//!
//! The bridge also builds the channel-keyed hardware messages the runner
//! publishes alongside each phase, and tracks the currently published UID
//! so a structural edit can never leave a stale selection on screen.

use mf_bus::{HandlerError, HandlerFuture, HandlerTable, MessageBus};
use mf_protocol::{topics, StepInfo, TimestampedMessage, ViewerMessage};
use protocol_core::tree;
use protocol_core::{DeviceState, ProtocolState, ProtocolStep};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub type SharedProtocol = Arc<Mutex<ProtocolState>>;

pub const LISTENER_NAME: &str = "device_viewer_bridge";

// ---------------------------------------------------------------------------
// Outbound projections
// ---------------------------------------------------------------------------

/// Viewer message for `active` electrodes of a step.
pub fn phase_viewer_message(
    device_state: &DeviceState,
    active: &BTreeMap<String, bool>,
    step: &ProtocolStep,
    editable: bool,
) -> ViewerMessage {
    let mut channels_activated = BTreeMap::new();
    for (electrode_id, on) in active {
        if !on {
            continue;
        }
        if let Some(channel) = device_state.id_to_channel.get(electrode_id) {
            channels_activated.insert(channel.to_string(), true);
        }
    }

    let routes = device_state
        .paths
        .iter()
        .enumerate()
        .map(|(i, path)| (path.clone(), device_state.route_color(i).to_owned()))
        .collect();

    ViewerMessage {
        channels_activated,
        routes,
        id_to_channel: device_state.id_to_channel.clone(),
        step_info: StepInfo {
            step_id: Some(step.uid().unwrap_or_default().to_owned()),
            step_label: Some(step.step_label()),
            free_mode: None,
        },
        editable,
    }
}

/// Viewer message with routes suppressed -- used while an operator prompt
/// shows only the individually activated electrodes.
pub fn individual_viewer_message(
    device_state: &DeviceState,
    step: &ProtocolStep,
    editable: bool,
) -> ViewerMessage {
    let mut message = phase_viewer_message(
        device_state,
        &device_state.activated_electrodes,
        step,
        editable,
    );
    message.routes.clear();
    message
}

/// Channel-keyed boolean map driving the hardware: every known channel,
/// with the active electrodes high.
pub fn hardware_state_message(device_state: &DeviceState, active: &BTreeMap<String, bool>) -> String {
    let mut channels: BTreeMap<String, bool> = device_state
        .id_to_channel
        .values()
        .map(|channel| (channel.to_string(), false))
        .collect();
    for (electrode_id, on) in active {
        if !on {
            continue;
        }
        if let Some(channel) = device_state.id_to_channel.get(electrode_id) {
            channels.insert(channel.to_string(), true);
        }
    }
    serde_json::to_string(&channels).expect("channel map serialization is infallible")
}

/// All known channels low.
pub fn deactivated_hardware_message(device_state: &DeviceState) -> String {
    hardware_state_message(device_state, &BTreeMap::new())
}

// ---------------------------------------------------------------------------
// Inbound projection
// ---------------------------------------------------------------------------

/// Device state reconstructed from a viewer message, using the message's
/// own channel mapping to invert channels back to electrode ids. Channels
/// with no known electrode keep their number as the id.
pub fn device_state_from_viewer_message(message: &ViewerMessage) -> DeviceState {
    let channel_to_electrode: BTreeMap<u32, &String> = message
        .id_to_channel
        .iter()
        .map(|(id, channel)| (*channel, id))
        .collect();

    let mut activated_electrodes = BTreeMap::new();
    for (channel_str, on) in &message.channels_activated {
        let electrode_id = channel_str
            .parse::<u32>()
            .ok()
            .and_then(|ch| channel_to_electrode.get(&ch))
            .map_or_else(|| channel_str.clone(), |id| (*id).clone());
        activated_electrodes.insert(electrode_id, *on);
    }

    let mut state = DeviceState {
        activated_electrodes,
        paths: message.routes.iter().map(|(route, _)| route.clone()).collect(),
        route_colors: message.routes.iter().map(|(_, color)| color.clone()).collect(),
        id_to_channel: message.id_to_channel.clone(),
    };
    state.normalize_route_colors();
    state
}

// ---------------------------------------------------------------------------
// Bridge component
// ---------------------------------------------------------------------------

pub struct ViewerBridge {
    bus: MessageBus,
    shared: SharedProtocol,
    published_uid: Option<String>,
    /// Guards against our own model-change republish looping back.
    processing_incoming: bool,
}

impl ViewerBridge {
    pub fn new(bus: MessageBus, shared: SharedProtocol) -> Self {
        ViewerBridge {
            bus,
            shared,
            published_uid: None,
            processing_incoming: false,
        }
    }

    pub fn subscriptions() -> Vec<&'static str> {
        vec![topics::DEVICE_VIEWER_STATE_CHANGED]
    }

    pub fn handler_table() -> HandlerTable<ViewerBridge> {
        HandlerTable::new().on("on_state_changed_signal", on_state_changed_signal)
    }

    pub fn published_uid(&self) -> Option<&str> {
        self.published_uid.as_deref()
    }

    /// Publish the step with `uid` to the viewer, tracking it as current.
    pub fn publish_step(&mut self, uid: &str, editable: bool) {
        let state = self.shared.lock().expect("protocol lock");
        let Some(step) = tree::find_step_by_uid(&state.sequence, uid) else {
            debug!(uid, "publish requested for unknown step");
            return;
        };
        let message = phase_viewer_message(
            &step.device_state,
            &step.device_state.activated_electrodes,
            step,
            editable,
        );
        drop(state);
        self.published_uid = Some(uid.to_owned());
        self.bus
            .publish(topics::PROTOCOL_GRID_DISPLAY_STATE, message.serialize());
    }

    /// Publish an empty viewer message and clear the tracked UID.
    pub fn publish_empty(&mut self) {
        self.published_uid = None;
        self.bus.publish(
            topics::PROTOCOL_GRID_DISPLAY_STATE,
            ViewerMessage::empty().serialize(),
        );
    }

    /// After a structural edit: if the published step is gone, show the
    /// newly selected step instead (or clear the viewer). The operator
    /// never sees a stale selection.
    pub fn handle_structural_edit(&mut self, selected_uid: Option<&str>) {
        let still_present = match &self.published_uid {
            Some(uid) => {
                let state = self.shared.lock().expect("protocol lock");
                tree::find_step_by_uid(&state.sequence, uid).is_some()
            }
            None => false,
        };
        if still_present {
            return;
        }
        match selected_uid {
            Some(uid) => self.publish_step(uid, true),
            None => self.publish_empty(),
        }
    }

    /// Apply an inbound viewer edit to the step it names.
    fn apply_state_change(&mut self, message: &ViewerMessage) {
        if self.processing_incoming {
            return;
        }
        let Some(uid) = message.step_info.step_id.clone() else {
            debug!("viewer message without step identity, ignoring");
            return;
        };

        self.processing_incoming = true;
        {
            let mut state = self.shared.lock().expect("protocol lock");

            if tree::find_step_by_uid(&state.sequence, &uid).is_none() {
                // The step was deleted since the viewer rendered it.
                debug!(uid = %uid, "viewer edit for unknown step, dropping");
                self.processing_incoming = false;
                return;
            }

            let new_state = device_state_from_viewer_message(message);

            let mapping_changed = tree::find_step_by_uid(&state.sequence, &uid)
                .map(|step| step.device_state.id_to_channel != new_state.id_to_channel)
                .unwrap_or(false);
            if mapping_changed {
                info!(uid = %uid, "chip layout changed, propagating to all steps");
                tree::propagate_id_to_channel(&mut state, &new_state.id_to_channel);
            }

            if let Some(step) = tree::find_step_by_uid_mut(&mut state.sequence, &uid) {
                step.device_state = new_state;
            }
        }
        self.processing_incoming = false;
    }
}

fn on_state_changed_signal<'a>(
    bridge: &'a mut ViewerBridge,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let message = ViewerMessage::deserialize(msg.payload()).map_err(HandlerError::invalid)?;
        bridge.apply_state_change(&message);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_core::params;
    use protocol_core::ProtocolElement;

    fn step_with_state() -> ProtocolStep {
        let mut step = ProtocolStep::new("Step");
        step.set_parameter(params::UID, "uid-1");
        step.set_parameter(params::ID, "1");
        step.device_state = DeviceState {
            activated_electrodes: BTreeMap::from([
                ("a".to_owned(), true),
                ("b".to_owned(), false),
            ]),
            paths: vec![vec!["b".to_owned(), "c".to_owned()]],
            route_colors: vec!["#ff0000".to_owned()],
            id_to_channel: BTreeMap::from([
                ("a".to_owned(), 1),
                ("b".to_owned(), 2),
                ("c".to_owned(), 3),
            ]),
        };
        step
    }

    fn shared_with(step: ProtocolStep) -> SharedProtocol {
        Arc::new(Mutex::new(ProtocolState::with_sequence(vec![
            ProtocolElement::Step(step),
        ])))
    }

    #[test]
    fn outbound_message_maps_ids_to_channels() {
        let step = step_with_state();
        let message = phase_viewer_message(
            &step.device_state,
            &step.device_state.activated_electrodes,
            &step,
            false,
        );
        assert_eq!(
            message.channels_activated,
            BTreeMap::from([("1".to_owned(), true)])
        );
        assert_eq!(message.routes.len(), 1);
        assert_eq!(message.step_info.step_id.as_deref(), Some("uid-1"));
        assert!(!message.editable);
    }

    #[test]
    fn individual_message_suppresses_routes() {
        let step = step_with_state();
        let message = individual_viewer_message(&step.device_state, &step, false);
        assert!(message.routes.is_empty());
        assert_eq!(
            message.channels_activated,
            BTreeMap::from([("1".to_owned(), true)])
        );
    }

    #[test]
    fn hardware_message_names_every_channel() {
        let step = step_with_state();
        let raw = hardware_state_message(
            &step.device_state,
            &step.device_state.activated_electrodes,
        );
        let parsed: BTreeMap<String, bool> = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            parsed,
            BTreeMap::from([
                ("1".to_owned(), true),
                ("2".to_owned(), false),
                ("3".to_owned(), false),
            ])
        );
    }

    #[test]
    fn inbound_round_trip_recovers_device_state() {
        let step = step_with_state();
        let message = phase_viewer_message(
            &step.device_state,
            &step.device_state.activated_electrodes,
            &step,
            true,
        );
        let state = device_state_from_viewer_message(&message);
        assert_eq!(state.activated_electrodes.get("a"), Some(&true));
        assert_eq!(state.paths, step.device_state.paths);
        assert_eq!(state.id_to_channel, step.device_state.id_to_channel);
    }

    #[test]
    fn inbound_edit_updates_the_named_step() {
        let shared = shared_with(step_with_state());
        let bus = MessageBus::new();
        let mut bridge = ViewerBridge::new(bus, shared.clone());

        let mut message = {
            let state = shared.lock().unwrap();
            let step = state.sequence[0].as_step().unwrap();
            phase_viewer_message(
                &step.device_state,
                &step.device_state.activated_electrodes,
                step,
                true,
            )
        };
        message.channels_activated.insert("3".to_owned(), true);
        bridge.apply_state_change(&message);

        let state = shared.lock().unwrap();
        let step = state.sequence[0].as_step().unwrap();
        assert_eq!(step.device_state.activated_electrodes.get("c"), Some(&true));
    }

    #[test]
    fn inbound_edit_for_unknown_uid_is_dropped() {
        let shared = shared_with(step_with_state());
        let mut bridge = ViewerBridge::new(MessageBus::new(), shared.clone());

        let mut message = ViewerMessage::empty();
        message.step_info.step_id = Some("gone".to_owned());
        message.channels_activated.insert("1".to_owned(), true);
        bridge.apply_state_change(&message);

        let state = shared.lock().unwrap();
        let step = state.sequence[0].as_step().unwrap();
        assert_eq!(step.device_state.activated_electrodes.get("a"), Some(&true));
        assert_eq!(step.device_state.activated_electrodes.get("c"), None);
    }

    #[test]
    fn changed_mapping_propagates_to_every_step() {
        let mut second = step_with_state();
        second.set_parameter(params::UID, "uid-2");
        let shared = Arc::new(Mutex::new(ProtocolState::with_sequence(vec![
            ProtocolElement::Step(step_with_state()),
            ProtocolElement::Step(second),
        ])));
        let mut bridge = ViewerBridge::new(MessageBus::new(), shared.clone());

        let mut message = {
            let state = shared.lock().unwrap();
            let step = state.sequence[0].as_step().unwrap();
            phase_viewer_message(
                &step.device_state,
                &step.device_state.activated_electrodes,
                step,
                true,
            )
        };
        message.id_to_channel.insert("d".to_owned(), 7);
        bridge.apply_state_change(&message);

        let state = shared.lock().unwrap();
        for element in &state.sequence {
            let step = element.as_step().unwrap();
            assert_eq!(step.device_state.id_to_channel.get("d"), Some(&7));
        }
    }

    #[test]
    fn structural_edit_republishes_or_clears() {
        let shared = shared_with(step_with_state());
        let mut bridge = ViewerBridge::new(MessageBus::new(), shared.clone());
        bridge.publish_step("uid-1", false);
        assert_eq!(bridge.published_uid(), Some("uid-1"));

        // Step removed: with no selection the viewer clears.
        shared.lock().unwrap().sequence.clear();
        bridge.handle_structural_edit(None);
        assert_eq!(bridge.published_uid(), None);
    }
}
