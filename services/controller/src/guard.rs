//! Proxy state guard: single owner of the live driver.
//!
//! All hardware access funnels through here. The guard validates the
//! driver's state (channel count, state-vector length) on a rate-limited
//! schedule, runs the corruption recovery ladder when validation fails,
//! and hands out scoped access under the transaction lock.
//!
//! Recovery is a three-rung ladder bounded by a retry counter:
//! 1. re-initialize the switching boards and re-check the channel count,
//! 2. restore the last-known-good channel state,
//! 3. full reconnect (terminate, settle, reopen on the remembered port).
//!
//! A `{Idle, Recovering, Reconnecting}` state machine guards re-entry:
//! while recovery runs, concurrent validations short-circuit to `false`.

use crate::config::ControllerConfig;
use crate::driver::{DriverError, DriverFactory, DropbotDriver};
use mf_bus::MessageBus;
use mf_protocol::topics;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Outcome of a scoped access attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProxyAccessError {
    /// Transaction lock not acquired within the caller's timeout.
    #[error("proxy busy: could not acquire transaction lock for {0}")]
    Busy(String),
    /// State validation failed before the operation.
    #[error("proxy state corrupted before {0}")]
    Corrupted(String),
    /// No live driver installed.
    #[error("no proxy connected")]
    Unavailable,
    /// The operation itself failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryState {
    Idle,
    Recovering,
    Reconnecting,
}

struct GuardMeta {
    recovery: RecoveryState,
    last_validation: Option<Instant>,
    last_valid_state: Option<Vec<bool>>,
    corruption_count: u32,
    last_port: Option<String>,
}

type DriverSlot = Option<Box<dyn DropbotDriver>>;

struct GuardInner {
    /// The transaction lock: every driver operation serializes on this.
    driver: AsyncMutex<DriverSlot>,
    meta: Mutex<GuardMeta>,
    factory: Arc<dyn DriverFactory>,
    bus: MessageBus,
    expected_channels: u32,
    validation_interval: Duration,
    max_corruption_retries: u32,
    reconnect_settle: Duration,
}

/// Clonable handle to the single proxy owner.
#[derive(Clone)]
pub struct ProxyGuard {
    inner: Arc<GuardInner>,
}

impl ProxyGuard {
    pub fn new(config: &ControllerConfig, factory: Arc<dyn DriverFactory>, bus: MessageBus) -> Self {
        ProxyGuard {
            inner: Arc::new(GuardInner {
                driver: AsyncMutex::new(None),
                meta: Mutex::new(GuardMeta {
                    recovery: RecoveryState::Idle,
                    last_validation: None,
                    last_valid_state: None,
                    corruption_count: 0,
                    last_port: None,
                }),
                factory,
                bus,
                expected_channels: config.expected_channels,
                validation_interval: config.validation_interval,
                max_corruption_retries: config.max_corruption_retries,
                reconnect_settle: config.reconnect_settle,
            }),
        }
    }

    pub fn expected_channels(&self) -> u32 {
        self.inner.expected_channels
    }

    /// Install a freshly connected driver, remembering its port for
    /// reconnection and caching its state as last-known-good.
    pub async fn install(&self, driver: Box<dyn DropbotDriver>, port: &str) {
        let mut slot = self.inner.driver.lock().await;
        let initial_state = driver.state_of_channels().ok();
        *slot = Some(driver);
        let mut meta = self.inner.meta.lock().expect("guard meta lock");
        meta.last_port = Some(port.to_owned());
        meta.corruption_count = 0;
        if let Some(state) = initial_state {
            if state.len() == self.inner.expected_channels as usize {
                meta.last_valid_state = Some(state);
            }
        }
        info!(port, "proxy installed");
    }

    /// Terminate and drop the driver. Idempotent.
    pub async fn clear(&self) {
        let mut slot = self.inner.driver.lock().await;
        if let Some(mut driver) = slot.take() {
            driver.terminate();
            info!("proxy terminated");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.driver.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Rate-limited state validation; kicks off recovery on mismatch.
    ///
    /// Returns `false` while a recovery is already in progress.
    pub async fn validate_proxy_state(&self) -> bool {
        {
            let mut meta = self.inner.meta.lock().expect("guard meta lock");
            if meta.recovery != RecoveryState::Idle {
                warn!("validation requested while recovery in progress");
                return false;
            }
            if let Some(last) = meta.last_validation {
                if last.elapsed() < self.inner.validation_interval {
                    return true;
                }
            }
            meta.last_validation = Some(Instant::now());
        }

        // A held transaction lock means a scoped operation is in flight;
        // it revalidates on exit, so do not block behind it.
        let Ok(mut slot) = self.inner.driver.try_lock() else {
            return true;
        };
        let Some(driver) = slot.as_mut() else {
            error!("proxy not available for validation");
            return false;
        };

        match Self::check_state(driver.as_ref(), self.inner.expected_channels) {
            Ok(state) => {
                let mut meta = self.inner.meta.lock().expect("guard meta lock");
                meta.last_valid_state = Some(state);
                meta.corruption_count = 0;
                true
            }
            Err(err) => {
                error!(%err, "proxy state validation failed");
                self.attempt_recovery(&mut slot).await
            }
        }
    }

    fn check_state(driver: &dyn DropbotDriver, expected: u32) -> Result<Vec<bool>, DriverError> {
        let channels = driver.number_of_channels()?;
        if channels != expected {
            return Err(DriverError::Fault(format!(
                "channel count corrupted: {channels}, expected {expected}"
            )));
        }
        let state = driver.state_of_channels()?;
        if state.len() != channels as usize {
            return Err(DriverError::Fault(format!(
                "state length mismatch: {} != {channels}",
                state.len()
            )));
        }
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Recovery ladder
    // -----------------------------------------------------------------------

    async fn attempt_recovery(&self, slot: &mut MutexGuard<'_, DriverSlot>) -> bool {
        let retries_exhausted = {
            let mut meta = self.inner.meta.lock().expect("guard meta lock");
            if meta.recovery != RecoveryState::Idle {
                warn!("recovery already in progress");
                return false;
            }
            meta.recovery = RecoveryState::Recovering;
            meta.corruption_count += 1;
            meta.corruption_count > self.inner.max_corruption_retries
        };

        let recovered = if retries_exhausted {
            error!(
                retries = self.inner.max_corruption_retries,
                "corruption retries exhausted, attempting full reconnection"
            );
            self.attempt_reconnection(slot).await
        } else {
            self.run_ladder(slot).await
        };

        let mut meta = self.inner.meta.lock().expect("guard meta lock");
        meta.recovery = RecoveryState::Idle;
        if recovered {
            meta.corruption_count = 0;
        }
        recovered
    }

    async fn run_ladder(&self, slot: &mut MutexGuard<'_, DriverSlot>) -> bool {
        // Rung 1: re-initialize switching boards.
        if let Some(driver) = slot.as_mut() {
            match driver.initialize_switching_boards() {
                Ok(()) => {
                    if matches!(driver.number_of_channels(), Ok(n) if n == self.inner.expected_channels)
                    {
                        info!("state recovery via switching board re-initialization");
                        return true;
                    }
                }
                Err(err) => warn!(%err, "switching board re-initialization failed"),
            }

            // Rung 2: restore last-known-good channel state.
            let last_good = {
                let meta = self.inner.meta.lock().expect("guard meta lock");
                meta.last_valid_state.clone()
            };
            if let Some(state) = last_good {
                match driver.set_state_of_channels(&state) {
                    Ok(()) => {
                        info!("state recovery via last-known-good state restoration");
                        return true;
                    }
                    Err(err) => warn!(%err, "state restoration failed"),
                }
            }
        }

        // Rung 3: full reconnect.
        warn!("standard recovery failed, attempting full reconnection");
        self.attempt_reconnection(slot).await
    }

    async fn attempt_reconnection(&self, slot: &mut MutexGuard<'_, DriverSlot>) -> bool {
        let port = {
            let mut meta = self.inner.meta.lock().expect("guard meta lock");
            meta.recovery = RecoveryState::Reconnecting;
            meta.last_port.clone()
        };
        let Some(port) = port else {
            error!("no port remembered for reconnection");
            return false;
        };

        if let Some(mut old) = slot.take() {
            old.terminate();
        }
        tokio::time::sleep(self.inner.reconnect_settle).await;

        let mut new_driver = match self.inner.factory.open(&port) {
            Ok(driver) => driver,
            Err(err) => {
                error!(%err, port, "proxy reconnection failed");
                return false;
            }
        };
        if let Err(err) = new_driver.initialize_switching_boards() {
            error!(%err, "switching board initialization failed on reconnect");
            new_driver.terminate();
            return false;
        }
        match new_driver.number_of_channels() {
            Ok(channels) if channels == self.inner.expected_channels => {}
            other => {
                error!(?other, "reconnected proxy has wrong channel count");
                new_driver.terminate();
                return false;
            }
        }

        let state = new_driver.state_of_channels().ok();
        **slot = Some(new_driver);
        {
            let mut meta = self.inner.meta.lock().expect("guard meta lock");
            meta.last_valid_state = state;
        }
        info!(port, "proxy reconnection successful");
        self.inner.bus.publish(topics::DROPBOT_CONNECTED, "");
        true
    }

    // -----------------------------------------------------------------------
    // Scoped access
    // -----------------------------------------------------------------------

    /// Validate, acquire the transaction lock within `timeout`, run `op`,
    /// release, and revalidate when `op` succeeded.
    pub async fn with_proxy<R>(
        &self,
        operation: &str,
        timeout: Duration,
        op: impl FnOnce(&mut dyn DropbotDriver) -> Result<R, DriverError>,
    ) -> Result<R, ProxyAccessError> {
        if !self.validate_proxy_state().await {
            return Err(ProxyAccessError::Corrupted(operation.to_owned()));
        }

        let mut slot = tokio::time::timeout(timeout, self.inner.driver.lock())
            .await
            .map_err(|_| ProxyAccessError::Busy(operation.to_owned()))?;
        let driver = slot.as_mut().ok_or(ProxyAccessError::Unavailable)?;

        let result = op(driver.as_mut());
        drop(slot);

        if result.is_ok() {
            self.validate_proxy_state().await;
        }
        result.map_err(ProxyAccessError::from)
    }

    /// Acquire the transaction lock for a multi-step operation that needs
    /// to hold it across awaits. Validates first; the caller revalidates
    /// after if it cares.
    pub async fn lock_proxy(
        &self,
        operation: &str,
        timeout: Duration,
    ) -> Result<MutexGuard<'_, DriverSlot>, ProxyAccessError> {
        if !self.validate_proxy_state().await {
            return Err(ProxyAccessError::Corrupted(operation.to_owned()));
        }
        let slot = tokio::time::timeout(timeout, self.inner.driver.lock())
            .await
            .map_err(|_| ProxyAccessError::Busy(operation.to_owned()))?;
        if slot.is_none() {
            return Err(ProxyAccessError::Unavailable);
        }
        Ok(slot)
    }

    pub fn last_port(&self) -> Option<String> {
        self.inner.meta.lock().expect("guard meta lock").last_port.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::Bench;

    fn guard_with_bench(channels: u32) -> (ProxyGuard, Bench, MessageBus) {
        let bench = Bench::new(channels);
        let bus = MessageBus::new();
        let mut config = ControllerConfig::default();
        config.expected_channels = channels;
        // No rate limiting in tests.
        config.validation_interval = Duration::ZERO;
        config.reconnect_settle = Duration::from_millis(1);
        let guard = ProxyGuard::new(&config, bench.factory(), bus.clone());
        (guard, bench, bus)
    }

    async fn connect(guard: &ProxyGuard, bench: &Bench) {
        let driver = bench.factory().open("emu0").unwrap();
        guard.install(driver, "emu0").await;
    }

    #[tokio::test]
    async fn healthy_proxy_validates() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        assert!(guard.validate_proxy_state().await);
    }

    #[tokio::test]
    async fn corruption_recovers_via_board_reinit() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        bench.corrupt_channel_count(3);
        // Rung 1 repairs the count in the emulator.
        assert!(guard.validate_proxy_state().await);
        assert!(guard.validate_proxy_state().await);
    }

    #[tokio::test]
    async fn state_length_mismatch_triggers_recovery() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        bench.corrupt_state_length(Some(2));
        // Board re-initialization clears the corruption.
        assert!(guard.validate_proxy_state().await);
        assert!(guard.validate_proxy_state().await);
    }

    #[tokio::test]
    async fn corruption_falls_through_to_reconnect() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        bench.corrupt_channel_count(3);
        // Rung 1 fails, rung 2 cannot write state, so the ladder
        // reconnects; the reconnect's board init repairs the device.
        bench.fail_board_inits(1);
        bench.fail_state_writes(true);
        assert!(guard.validate_proxy_state().await);
        assert_eq!(
            bench.opened_ports(),
            vec!["emu0".to_owned(), "emu0".to_owned()]
        );
    }

    #[tokio::test]
    async fn reconnect_failure_gives_up() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        bench.corrupt_channel_count(3);
        bench.fail_board_inits(2); // ladder rung 1 and the reconnect init
        bench.fail_state_writes(true); // rung 2
        assert!(!guard.validate_proxy_state().await);
    }

    #[tokio::test]
    async fn with_proxy_runs_op_and_returns_result() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        let channels = guard
            .with_proxy("count", Duration::from_millis(100), |driver| {
                driver.number_of_channels()
            })
            .await
            .unwrap();
        assert_eq!(channels, 8);
    }

    #[tokio::test]
    async fn with_proxy_reports_busy_on_lock_timeout() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        let held = guard
            .lock_proxy("long op", Duration::from_millis(100))
            .await
            .unwrap();
        let res = guard
            .with_proxy("blocked", Duration::from_millis(10), |d| d.number_of_channels())
            .await;
        assert!(matches!(res, Err(ProxyAccessError::Busy(_))));
        drop(held);
    }

    #[tokio::test]
    async fn with_proxy_unavailable_without_driver() {
        let (guard, _bench, _bus) = guard_with_bench(8);
        let res = guard
            .with_proxy("noop", Duration::from_millis(10), |d| d.number_of_channels())
            .await;
        // Validation fails first: no driver installed.
        assert!(matches!(res, Err(ProxyAccessError::Corrupted(_))));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let (guard, bench, _bus) = guard_with_bench(8);
        connect(&guard, &bench).await;
        guard.clear().await;
        guard.clear().await;
        assert!(!guard.is_connected().await);
    }
}
