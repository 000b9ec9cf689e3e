//! Dropbot supervisor: discovery, connection, and signal republishing.
//!
//! One listener actor owns the `DropbotController`. Requests arrive over
//! the bus; the discovery probe runs as a background task that publishes an
//! internal `port_found` request when a matching port appears, so the
//! connect sequence runs on the actor like every other handler.
//!
//! Connection lifecycle:
//! - `start_device_monitoring` launches the probe (~2 s period).
//! - On a hit, the probe pauses itself and the actor attempts to connect:
//!   switching-board init with spaced retries, channel-count verification,
//!   update-interval/event-mask configuration with HV off, channels off.
//! - Success publishes `dropbot/signals/connected`; failures publish the
//!   matching warning and leave the probe paused until `retry_connection`.
//! - A disconnect tears the proxy down and resumes the probe.

use crate::config::ControllerConfig;
use crate::driver::{
    ConnectError, DriverEvent, DriverFactory, DropbotDriver, StateUpdate, EVENT_CHANNELS_UPDATED,
    EVENT_ENABLE, EVENT_SHORTS_DETECTED, OUTPUT_ENABLE_PIN,
};
use crate::guard::ProxyGuard;
use crate::scan::PortScanner;
use mf_bus::{HandlerError, HandlerFuture, HandlerTable, MessageBus};
use mf_protocol::{topics, CapacitanceSignal, ShortsSignal, TimestampedMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const LISTENER_NAME: &str = "dropbot_controller_listener";

/// Internal request published by the probe task when a port matches.
pub const PORT_FOUND: &str = "dropbot/requests/port_found";

// ---------------------------------------------------------------------------
// Controller component
// ---------------------------------------------------------------------------

struct ProbeHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct DropbotController {
    pub(crate) bus: MessageBus,
    pub(crate) guard: ProxyGuard,
    pub(crate) config: ControllerConfig,
    scanner: Arc<dyn PortScanner>,
    factory: Arc<dyn DriverFactory>,
    pub(crate) connection_active: bool,
    pub(crate) realtime_mode: bool,
    no_power: bool,
    probe: Option<ProbeHandle>,
    last_chip_check: Option<tokio::time::Instant>,
}

impl DropbotController {
    pub fn new(
        bus: MessageBus,
        config: ControllerConfig,
        scanner: Arc<dyn PortScanner>,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        let guard = ProxyGuard::new(&config, factory.clone(), bus.clone());
        DropbotController {
            bus,
            guard,
            config,
            scanner,
            factory,
            connection_active: false,
            realtime_mode: false,
            no_power: false,
            probe: None,
            last_chip_check: None,
        }
    }

    /// Topic patterns this component subscribes to.
    pub fn subscriptions() -> Vec<&'static str> {
        vec![
            "dropbot/requests/#",
            topics::DROPBOT_CONNECTED,
            topics::DROPBOT_DISCONNECTED,
        ]
    }

    pub fn handler_table() -> HandlerTable<DropbotController> {
        HandlerTable::new()
            .on("on_start_device_monitoring_request", on_start_device_monitoring_request)
            .on("on_port_found_request", on_port_found_request)
            .on("on_retry_connection_request", on_retry_connection_request)
            .on("on_halt_request", on_halt_request)
            .on("on_chip_check_request", on_chip_check_request)
            .on("on_detect_shorts_request", on_detect_shorts_request)
            .on("on_detect_droplets_request", crate::detection::on_detect_droplets_request)
            .on("on_set_voltage_request", crate::settings::on_set_voltage_request)
            .on("on_set_frequency_request", crate::settings::on_set_frequency_request)
            .on("on_set_realtime_mode_request", crate::settings::on_set_realtime_mode_request)
            .on(
                "on_electrodes_state_change_request",
                crate::settings::on_electrodes_state_change_request,
            )
            .on("on_connected_signal", on_connected_signal)
            .on("on_disconnected_signal", on_disconnected_signal)
    }

    /// Requests that drive the hardware are denied while disconnected.
    pub(crate) fn require_connection(&self, operation: &str) -> bool {
        if !self.connection_active {
            warn!(operation, "request denied: device is disconnected");
        }
        self.connection_active
    }

    // -----------------------------------------------------------------------
    // Discovery probe
    // -----------------------------------------------------------------------

    fn spawn_probe(&mut self, hwids: Vec<String>) {
        if self.probe.is_some() {
            self.resume_probe();
            return;
        }
        let running = Arc::new(AtomicBool::new(true));
        let bus = self.bus.clone();
        let scanner = self.scanner.clone();
        let interval = self.config.probe_interval;
        let flag = running.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut error_shown = false;
            loop {
                tick.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    continue;
                }
                match scanner.ports_matching(&hwids) {
                    Ok(ports) => {
                        error_shown = false;
                        if let Some(port) = ports.first() {
                            debug!(port = %port, "device port found, pausing probe");
                            flag.store(false, Ordering::SeqCst);
                            bus.publish(PORT_FOUND, port.clone());
                        }
                    }
                    Err(err) => {
                        if !error_shown {
                            error!(%err, "port enumeration failed");
                            error_shown = true;
                        }
                    }
                }
            }
        });

        self.probe = Some(ProbeHandle { running, task });
        info!("device monitor created and started");
    }

    fn pause_probe(&self) {
        if let Some(probe) = &self.probe {
            probe.running.store(false, Ordering::SeqCst);
        }
    }

    fn resume_probe(&self) {
        if let Some(probe) = &self.probe {
            probe.running.store(true, Ordering::SeqCst);
        }
    }

    // -----------------------------------------------------------------------
    // Connect sequence
    // -----------------------------------------------------------------------

    async fn connect_to_dropbot(&mut self, port: &str) {
        self.no_power = false;

        if self.guard.is_connected().await {
            info!(port, "already connected");
            return;
        }

        let driver = match self.factory.open(port) {
            Ok(driver) => driver,
            Err(ConnectError::NoDevice(detail)) => {
                warn!(port, %detail, "no device available");
                self.bus.publish(topics::NO_DROPBOT_AVAILABLE, detail);
                return;
            }
            Err(ConnectError::NoPower) => {
                error!(port, "device has no power");
                self.no_power = true;
                self.bus.publish(topics::NO_POWER, "device has no power");
                return;
            }
            Err(ConnectError::Other(detail)) => {
                error!(port, %detail, "connect failed");
                self.bus.publish(topics::DROPBOT_ERROR, detail);
                return;
            }
        };

        match self.bring_up(driver, port).await {
            Ok(()) => {
                self.connection_active = true;
                self.bus.publish(topics::DROPBOT_CONNECTED, "");
            }
            Err(detail) => {
                error!(port, %detail, "connection setup failed");
                self.bus.publish(topics::DROPBOT_ERROR, detail);
            }
        }
    }

    /// Initialize and configure a freshly opened driver; on success the
    /// guard owns it.
    async fn bring_up(&mut self, mut driver: Box<dyn DropbotDriver>, port: &str) -> Result<(), String> {
        let mut initialized = false;
        for attempt in 1..=self.config.connect_retries {
            match driver.initialize_switching_boards() {
                Ok(()) => {
                    info!(attempt, "switching boards initialized");
                    initialized = true;
                    break;
                }
                Err(err) => {
                    warn!(attempt, %err, "switching board initialization failed");
                    if attempt < self.config.connect_retries {
                        tokio::time::sleep(self.config.connect_retry_delay).await;
                    }
                }
            }
        }
        if !initialized {
            driver.terminate();
            return Err("switching boards failed to initialize".to_owned());
        }

        match driver.number_of_channels() {
            Ok(channels) if channels == self.config.expected_channels => {}
            Ok(channels) => {
                driver.terminate();
                return Err(format!(
                    "unexpected channel count {channels} (expected {})",
                    self.config.expected_channels
                ));
            }
            Err(err) => {
                driver.terminate();
                return Err(err.to_string());
            }
        }

        driver
            .update_state(&StateUpdate {
                capacitance_update_interval_ms: Some(100),
                hv_output_selected: Some(false),
                hv_output_enabled: Some(false),
                event_mask: Some(EVENT_CHANNELS_UPDATED | EVENT_SHORTS_DETECTED | EVENT_ENABLE),
                ..StateUpdate::default()
            })
            .map_err(|e| e.to_string())?;

        if let Some(events) = driver.take_events() {
            tokio::spawn(pump_driver_events(self.bus.clone(), events));
        }

        driver.turn_off_all_channels().map_err(|e| e.to_string())?;

        self.guard.install(driver, port).await;
        self.guard.validate_proxy_state().await;
        info!(port, "proxy connection setup completed");
        Ok(())
    }

    async fn chip_check(&mut self) {
        // Rapid insertion changes are coalesced.
        if let Some(last) = self.last_chip_check {
            if last.elapsed() < self.config.chip_check_debounce {
                return;
            }
        }
        self.last_chip_check = Some(tokio::time::Instant::now());

        let result = self
            .guard
            .with_proxy("chip_check", self.config.detection_timeout, |driver| {
                driver.digital_read(OUTPUT_ENABLE_PIN)
            })
            .await;
        match result {
            Ok(pin_high) => {
                // Active low.
                let inserted = !pin_high;
                info!(inserted, "chip check");
                self.bus
                    .publish(topics::CHIP_INSERTED, bool_payload(inserted));
            }
            Err(err) => warn!(%err, "chip check failed"),
        }
    }

    /// Tear everything down and announce the disconnect. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.task.abort();
        }
        self.guard.clear().await;
        if self.connection_active {
            self.connection_active = false;
            self.bus.publish(topics::DROPBOT_DISCONNECTED, "");
        }
    }
}

/// `"True"` / `"False"` payloads used by chip and realtime signals.
pub(crate) fn bool_payload(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

// ---------------------------------------------------------------------------
// Driver event pump
// ---------------------------------------------------------------------------

async fn pump_driver_events(bus: MessageBus, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::Halted(reason) => {
                error!(reason = reason.describe(), "device halted");
                bus.publish(topics::HALTED, reason.describe());
                bus.publish(topics::HALT, "");
            }
            DriverEvent::OutputEnabled => bus.publish(topics::CHIP_INSERTED, "True"),
            DriverEvent::OutputDisabled => bus.publish(topics::CHIP_INSERTED, "False"),
            DriverEvent::CapacitanceUpdated { picofarads, volts } => {
                let signal = CapacitanceSignal::format(picofarads, volts);
                match serde_json::to_string(&signal) {
                    Ok(payload) => bus.publish(topics::CAPACITANCE_UPDATED, payload),
                    Err(err) => warn!(%err, "capacitance signal serialization failed"),
                }
            }
            DriverEvent::ShortsDetected(channels) => {
                let signal = ShortsSignal {
                    shorts_detected: channels,
                };
                match serde_json::to_string(&signal) {
                    Ok(payload) => bus.publish(topics::SHORTS_DETECTED, payload),
                    Err(err) => warn!(%err, "shorts signal serialization failed"),
                }
            }
        }
    }
    debug!("driver event stream closed");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn on_start_device_monitoring_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if c.connection_active {
            c.chip_check().await;
            return Ok(());
        }

        let hwids = if msg.payload().trim().is_empty() {
            c.config.hwids.clone()
        } else {
            serde_json::from_str::<Vec<String>>(msg.payload())
                .map_err(HandlerError::invalid)?
        };
        c.spawn_probe(hwids);
        Ok(())
    })
}

fn on_port_found_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let port = msg.payload().to_owned();
        info!(port = %port, "attempting to connect");
        c.pause_probe();
        c.connect_to_dropbot(&port).await;
        Ok(())
    })
}

fn on_retry_connection_request<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if c.connection_active {
            info!("retry rejected: already connected");
            return Ok(());
        }
        info!("retrying device discovery");
        c.resume_probe();
        Ok(())
    })
}

fn on_halt_request<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("halt") {
            return Ok(());
        }
        let result = c
            .guard
            .with_proxy("halt", c.config.detection_timeout, |driver| {
                driver.turn_off_all_channels()?;
                driver.update_state(&StateUpdate {
                    hv_output_selected: Some(false),
                    hv_output_enabled: Some(false),
                    voltage: Some(0.0),
                    ..StateUpdate::default()
                })
            })
            .await;
        match result {
            Ok(()) => {
                error!("halted: disconnect everything and reconnect");
                Ok(())
            }
            Err(err) => Err(HandlerError::failed(err)),
        }
    })
}

fn on_chip_check_request<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("chip_check") {
            return Ok(());
        }
        c.chip_check().await;
        Ok(())
    })
}

fn on_detect_shorts_request<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("detect_shorts") {
            return Ok(());
        }
        let result = c
            .guard
            .with_proxy("detect_shorts", c.config.detection_timeout, |driver| {
                driver.detect_shorts()
            })
            .await;
        match result {
            Ok(channels) => {
                info!(?channels, "shorts detected");
                let signal = ShortsSignal {
                    shorts_detected: channels,
                };
                let payload = serde_json::to_string(&signal).map_err(HandlerError::failed)?;
                c.bus.publish(topics::SHORTS_DETECTED, payload);
                Ok(())
            }
            Err(err) => Err(HandlerError::failed(err)),
        }
    })
}

fn on_connected_signal<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        c.connection_active = true;
        c.chip_check().await;
        Ok(())
    })
}

fn on_disconnected_signal<'a>(
    c: &'a mut DropbotController,
    _msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        c.connection_active = false;
        if !c.no_power {
            info!("disconnected: terminating proxy and resuming monitor");
            c.guard.clear().await;
            c.resume_probe();
        }
        Ok(())
    })
}
