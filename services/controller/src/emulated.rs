//! In-process device emulation.
//!
//! A faithful software stand-in for the switching-board hardware: 120
//! channels of boolean state, voltage/frequency registers, droplet scans
//! and the device event stream. The binary runs against it in `--emulated`
//! mode and the test suites drive fault scenarios through the `Bench`
//! handle (wrong channel counts, dead power supplies, vanishing devices).

use crate::driver::{
    ConnectError, DriverError, DriverEvent, DriverFactory, DropbotDriver, StateUpdate,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Bench: shared fault-injection handle
// ---------------------------------------------------------------------------

struct BenchState {
    /// Channel count the device reports (mismatch simulates corruption).
    reported_channels: u32,
    /// Remaining `initialize_switching_boards` calls that should fail.
    failing_board_inits: u32,
    /// When set, `state_of_channels` returns a vector of this wrong length.
    corrupt_state_len: Option<usize>,
    /// When set, `set_state_of_channels` fails.
    fail_state_writes: bool,
    /// Channels currently holding droplets.
    droplets: Vec<u32>,
    /// Power supply present.
    powered: bool,
    /// Device answers on its port.
    present: bool,
    /// Chip seated (drives the active-low output-enable pin).
    chip_inserted: bool,
    /// Event sender of the most recently opened driver.
    events: Option<mpsc::UnboundedSender<DriverEvent>>,
    /// Ports opened so far, newest last.
    opened_ports: Vec<String>,
    /// Mirror of the last channel-state write, for assertions.
    last_written_state: Option<Vec<bool>>,
}

/// Test-bench control over the emulated device.
#[derive(Clone)]
pub struct Bench {
    inner: Arc<Mutex<BenchState>>,
    channels: u32,
}

impl Bench {
    pub fn new(channels: u32) -> Self {
        Bench {
            inner: Arc::new(Mutex::new(BenchState {
                reported_channels: channels,
                failing_board_inits: 0,
                corrupt_state_len: None,
                fail_state_writes: false,
                droplets: Vec::new(),
                powered: true,
                present: true,
                chip_inserted: true,
                events: None,
                opened_ports: Vec::new(),
                last_written_state: None,
            })),
            channels,
        }
    }

    pub fn factory(&self) -> Arc<dyn DriverFactory> {
        Arc::new(EmulatedFactory {
            bench: self.clone(),
        })
    }

    pub fn set_powered(&self, powered: bool) {
        self.inner.lock().unwrap().powered = powered;
    }

    pub fn set_present(&self, present: bool) {
        self.inner.lock().unwrap().present = present;
    }

    pub fn set_chip_inserted(&self, inserted: bool) {
        self.inner.lock().unwrap().chip_inserted = inserted;
    }

    pub fn set_droplets(&self, channels: Vec<u32>) {
        self.inner.lock().unwrap().droplets = channels;
    }

    /// Make the device report a wrong channel count until repaired.
    pub fn corrupt_channel_count(&self, reported: u32) {
        self.inner.lock().unwrap().reported_channels = reported;
    }

    /// Fail the next `n` switching-board initializations; a successful init
    /// also restores the reported channel count.
    pub fn fail_board_inits(&self, n: u32) {
        self.inner.lock().unwrap().failing_board_inits = n;
    }

    pub fn corrupt_state_length(&self, wrong_len: Option<usize>) {
        self.inner.lock().unwrap().corrupt_state_len = wrong_len;
    }

    pub fn fail_state_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_state_writes = fail;
    }

    /// Emit a device event on the live driver's stream.
    pub fn emit(&self, event: DriverEvent) {
        let state = self.inner.lock().unwrap();
        if let Some(tx) = &state.events {
            let _ = tx.send(event);
        }
    }

    pub fn opened_ports(&self) -> Vec<String> {
        self.inner.lock().unwrap().opened_ports.clone()
    }

    pub fn last_written_state(&self) -> Option<Vec<bool>> {
        self.inner.lock().unwrap().last_written_state.clone()
    }
}

// ---------------------------------------------------------------------------
// Scripted scanner
// ---------------------------------------------------------------------------

/// Port scanner returning a scripted sequence of results, then nothing.
pub struct ScriptedScanner {
    results: Mutex<Vec<Vec<String>>>,
}

impl ScriptedScanner {
    pub fn new(results: Vec<Vec<String>>) -> Self {
        ScriptedScanner {
            results: Mutex::new(results),
        }
    }
}

impl crate::scan::PortScanner for ScriptedScanner {
    fn ports_matching(&self, _hwids: &[String]) -> Result<Vec<String>, crate::scan::ScanError> {
        let mut results = self.results.lock().unwrap();
        if results.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(results.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

struct EmulatedFactory {
    bench: Bench,
}

impl DriverFactory for EmulatedFactory {
    fn open(&self, port: &str) -> Result<Box<dyn DropbotDriver>, ConnectError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.bench.inner.lock().unwrap();
            if !state.present {
                return Err(ConnectError::NoDevice(format!("nothing on {port}")));
            }
            if !state.powered {
                return Err(ConnectError::NoPower);
            }
            state.events = Some(events_tx);
            state.opened_ports.push(port.to_owned());
        }

        Ok(Box::new(EmulatedDropbot {
            port: port.to_owned(),
            bench: self.bench.clone(),
            state: vec![false; self.bench.channels as usize],
            voltage: 0.0,
            frequency: 10_000.0,
            events: Some(events_rx),
            terminated: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct EmulatedDropbot {
    port: String,
    bench: Bench,
    state: Vec<bool>,
    voltage: f64,
    frequency: f64,
    events: Option<mpsc::UnboundedReceiver<DriverEvent>>,
    terminated: bool,
}

impl EmulatedDropbot {
    fn check_live(&self) -> Result<(), DriverError> {
        if self.terminated {
            return Err(DriverError::Transport("driver terminated".to_owned()));
        }
        Ok(())
    }
}

impl DropbotDriver for EmulatedDropbot {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn number_of_channels(&self) -> Result<u32, DriverError> {
        self.check_live()?;
        Ok(self.bench.inner.lock().unwrap().reported_channels)
    }

    fn state_of_channels(&self) -> Result<Vec<bool>, DriverError> {
        self.check_live()?;
        if let Some(wrong) = self.bench.inner.lock().unwrap().corrupt_state_len {
            return Ok(vec![false; wrong]);
        }
        Ok(self.state.clone())
    }

    fn set_state_of_channels(&mut self, state: &[bool]) -> Result<(), DriverError> {
        self.check_live()?;
        if self.bench.inner.lock().unwrap().fail_state_writes {
            return Err(DriverError::Transport("state write refused".to_owned()));
        }
        if state.len() != self.state.len() {
            return Err(DriverError::Fault(format!(
                "state length {} != channel count {}",
                state.len(),
                self.state.len()
            )));
        }
        self.state.copy_from_slice(state);
        self.bench.inner.lock().unwrap().last_written_state = Some(state.to_vec());
        Ok(())
    }

    fn turn_off_all_channels(&mut self) -> Result<(), DriverError> {
        self.check_live()?;
        self.state.fill(false);
        Ok(())
    }

    fn initialize_switching_boards(&mut self) -> Result<(), DriverError> {
        self.check_live()?;
        let mut bench = self.bench.inner.lock().unwrap();
        if bench.failing_board_inits > 0 {
            bench.failing_board_inits -= 1;
            return Err(DriverError::Fault("switching board did not respond".to_owned()));
        }
        // A successful init repairs a corrupted channel count.
        bench.reported_channels = self.bench.channels;
        bench.corrupt_state_len = None;
        Ok(())
    }

    fn update_state(&mut self, update: &StateUpdate) -> Result<(), DriverError> {
        self.check_live()?;
        if let Some(v) = update.voltage {
            self.voltage = v;
        }
        if let Some(f) = update.frequency {
            self.frequency = f;
        }
        Ok(())
    }

    fn voltage(&self) -> Result<f64, DriverError> {
        self.check_live()?;
        Ok(self.voltage)
    }

    fn frequency(&self) -> Result<f64, DriverError> {
        self.check_live()?;
        Ok(self.frequency)
    }

    fn detect_droplets(&mut self, channels: Option<&[u32]>) -> Result<Vec<u32>, DriverError> {
        self.check_live()?;
        let droplets = self.bench.inner.lock().unwrap().droplets.clone();
        Ok(match channels {
            Some(filter) => droplets
                .into_iter()
                .filter(|ch| filter.contains(ch))
                .collect(),
            None => droplets,
        })
    }

    fn detect_shorts(&mut self) -> Result<Vec<u32>, DriverError> {
        self.check_live()?;
        Ok(Vec::new())
    }

    fn digital_read(&mut self, pin: u8) -> Result<bool, DriverError> {
        self.check_live()?;
        if pin == crate::driver::OUTPUT_ENABLE_PIN {
            // Active low: 0 when a chip is seated.
            return Ok(!self.bench.inner.lock().unwrap().chip_inserted);
        }
        Ok(false)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events.take()
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.state.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn droplet_scan_filters_to_requested_channels() {
        let bench = Bench::new(8);
        bench.set_droplets(vec![1, 3, 5]);
        let factory = bench.factory();
        let mut driver = factory.open("emu0").unwrap();
        assert_eq!(driver.detect_droplets(Some(&[3, 5, 7])).unwrap(), vec![3, 5]);
        assert_eq!(driver.detect_droplets(None).unwrap(), vec![1, 3, 5]);
    }

    #[test]
    fn board_init_repairs_corruption() {
        let bench = Bench::new(8);
        let factory = bench.factory();
        let mut driver = factory.open("emu0").unwrap();
        bench.corrupt_channel_count(3);
        assert_eq!(driver.number_of_channels().unwrap(), 3);
        driver.initialize_switching_boards().unwrap();
        assert_eq!(driver.number_of_channels().unwrap(), 8);
    }

    #[test]
    fn unpowered_bench_refuses_connections() {
        let bench = Bench::new(8);
        bench.set_powered(false);
        assert!(matches!(
            bench.factory().open("emu0"),
            Err(ConnectError::NoPower)
        ));
    }

    #[test]
    fn chip_pin_is_active_low() {
        let bench = Bench::new(8);
        let factory = bench.factory();
        let mut driver = factory.open("emu0").unwrap();
        assert!(!driver.digital_read(crate::driver::OUTPUT_ENABLE_PIN).unwrap());
        bench.set_chip_inserted(false);
        assert!(driver.digital_read(crate::driver::OUTPUT_ENABLE_PIN).unwrap());
    }
}
