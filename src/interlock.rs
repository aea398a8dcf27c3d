use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::control::RunControl;
use crate::error::{Result, SqcError};
use crate::instrument::EnvironmentBox;
use crate::types::{EnvironmentReading, Position};

pub type SharedEnvironmentBox = Arc<Mutex<Box<dyn EnvironmentBox>>>;
pub type SharedPosition = Arc<RwLock<Option<Position>>>;

/// Allowed environment window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentBounds {
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub humidity_min: f64,
    pub humidity_max: f64,
    /// Treat a box that does not report a running test as out of bounds
    #[serde(default)]
    pub require_test_running: bool,
}

impl Default for EnvironmentBounds {
    fn default() -> Self {
        Self {
            temperature_min: 15.0,
            temperature_max: 30.0,
            humidity_min: 0.0,
            humidity_max: 50.0,
            require_test_running: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InterlockStatus {
    Ok,
    OutOfBounds { reason: String },
    TestNotRunning,
}

impl InterlockStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, InterlockStatus::Ok)
    }

    fn describe(&self) -> String {
        match self {
            InterlockStatus::Ok => "ok".to_string(),
            InterlockStatus::OutOfBounds { reason } => reason.clone(),
            InterlockStatus::TestNotRunning => "environment box reports no running test".to_string(),
        }
    }
}

impl EnvironmentBounds {
    pub fn evaluate(&self, reading: &EnvironmentReading) -> InterlockStatus {
        let mut reasons = Vec::new();
        if !(self.temperature_min..=self.temperature_max).contains(&reading.temperature) {
            reasons.push(format!(
                "temperature {:.1} degC outside [{:.1}, {:.1}]",
                reading.temperature, self.temperature_min, self.temperature_max
            ));
        }
        if !(self.humidity_min..=self.humidity_max).contains(&reading.humidity) {
            reasons.push(format!(
                "humidity {:.1} %rH outside [{:.1}, {:.1}]",
                reading.humidity, self.humidity_min, self.humidity_max
            ));
        }
        if !reasons.is_empty() {
            return InterlockStatus::OutOfBounds {
                reason: reasons.join(", "),
            };
        }
        if self.require_test_running && !reading.test_running {
            return InterlockStatus::TestNotRunning;
        }
        InterlockStatus::Ok
    }
}

/// Gates measurements on the environment box readings
pub struct EnvironmentMonitor {
    environment: SharedEnvironmentBox,
    bounds: EnvironmentBounds,
    backoff: Duration,
    max_wait: Duration,
    last: Option<EnvironmentReading>,
}

impl EnvironmentMonitor {
    pub fn new(environment: Box<dyn EnvironmentBox>) -> Self {
        Self {
            environment: Arc::new(Mutex::new(environment)),
            bounds: EnvironmentBounds::default(),
            backoff: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
            last: None,
        }
    }

    pub fn with_bounds(mut self, bounds: EnvironmentBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn bounds(&self) -> &EnvironmentBounds {
        &self.bounds
    }

    /// Handle for read-only observers such as [`LiveMonitor`]
    pub fn shared_box(&self) -> SharedEnvironmentBox {
        self.environment.clone()
    }

    pub fn last_reading(&self) -> Option<EnvironmentReading> {
        self.last
    }

    pub fn set_test_running(&mut self, running: bool) -> Result<()> {
        self.environment.lock().set_test_running(running)
    }

    /// Single reading and the status derived from it
    pub fn poll(&mut self) -> Result<(EnvironmentReading, InterlockStatus)> {
        let reading = self.environment.lock().read_environment()?;
        self.last = Some(reading);
        Ok((reading, self.bounds.evaluate(&reading)))
    }

    /// Blocks until the environment is within bounds, re-polling every backoff interval.
    ///
    /// Fails with `EnvironmentTimeout` once `max_wait` has elapsed without an
    /// in-bounds reading, or `Aborted` if the run is cancelled while waiting.
    pub fn await_in_bounds(&mut self, control: &mut RunControl) -> Result<EnvironmentReading> {
        let start = Instant::now();
        let mut suspended = false;
        loop {
            let (reading, status) = self.poll()?;
            if status.is_ok() {
                if suspended {
                    info!(
                        "Environment back in bounds after {:.1} s, resuming",
                        start.elapsed().as_secs_f64()
                    );
                }
                return Ok(reading);
            }

            let waited = start.elapsed();
            if waited >= self.max_wait {
                return Err(SqcError::EnvironmentTimeout {
                    waited_secs: waited.as_secs_f64(),
                    reason: status.describe(),
                });
            }
            if !suspended {
                warn!("Interlock: {}, suspending measurement", status.describe());
                suspended = true;
            } else {
                debug!("Interlock still active: {}", status.describe());
            }
            control.wait(self.backoff)?;
        }
    }
}

/// Snapshot published by [`LiveMonitor`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveStatus {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub environment: Option<EnvironmentReading>,
    pub status: Option<InterlockStatus>,
    pub position: Option<Position>,
}

/// Snapshots kept for a slow consumer; newer ones are dropped while it is full
pub const LIVE_STATUS_CAPACITY: usize = 16;

/// Background thread publishing environment and table position for display.
///
/// The thread only reads; it never issues motion or switching commands.
pub struct LiveMonitor {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LiveMonitor {
    pub fn spawn(
        environment: SharedEnvironmentBox,
        position: SharedPosition,
        bounds: EnvironmentBounds,
        interval: Duration,
    ) -> (LiveMonitor, Receiver<LiveStatus>) {
        let (tx, rx) = crossbeam_channel::bounded(LIVE_STATUS_CAPACITY);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let thread = std::thread::spawn(move || {
            Self::run(environment, position, bounds, interval, tx, stop_rx)
        });

        (
            LiveMonitor {
                stop: Some(stop_tx),
                thread: Some(thread),
            },
            rx,
        )
    }

    fn run(
        environment: SharedEnvironmentBox,
        position: SharedPosition,
        bounds: EnvironmentBounds,
        interval: Duration,
        tx: Sender<LiveStatus>,
        stop: Receiver<()>,
    ) {
        debug!("Live monitor started");
        loop {
            let reading = match environment.lock().read_environment() {
                Ok(reading) => Some(reading),
                Err(e) => {
                    warn!("Live monitor failed to read environment: {e}");
                    None
                }
            };
            let snapshot = LiveStatus {
                timestamp: chrono::Utc::now(),
                environment: reading,
                status: reading.map(|r| bounds.evaluate(&r)),
                position: *position.read(),
            };
            match tx.try_send(snapshot) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Live status queue full, dropping snapshot"),
                Err(TrySendError::Disconnected(_)) => break,
            }

            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Live monitor stopped");
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LiveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEnvironmentBox;

    fn monitor(env: &SimEnvironmentBox) -> EnvironmentMonitor {
        EnvironmentMonitor::new(Box::new(env.clone()))
            .with_backoff(Duration::from_millis(2))
            .with_max_wait(Duration::from_millis(200))
    }

    #[test]
    fn test_status_evaluation() {
        let bounds = EnvironmentBounds::default();
        let reading = EnvironmentReading {
            temperature: 21.0,
            humidity: 30.0,
            test_running: true,
        };
        assert!(bounds.evaluate(&reading).is_ok());
        let humid = EnvironmentReading {
            humidity: 75.0,
            ..reading
        };
        assert!(matches!(
            bounds.evaluate(&humid),
            InterlockStatus::OutOfBounds { .. }
        ));
        let strict = EnvironmentBounds {
            require_test_running: true,
            ..bounds
        };
        let idle = EnvironmentReading {
            test_running: false,
            ..reading
        };
        assert_eq!(strict.evaluate(&idle), InterlockStatus::TestNotRunning);
    }

    #[test]
    fn test_await_resumes_after_excursion() {
        let env = SimEnvironmentBox::new(21.0, 30.0);
        env.script_humidity([70.0, 65.0, 40.0]);
        let mut monitor = monitor(&env);
        let (_handle, mut control) = RunControl::new();

        let reading = monitor.await_in_bounds(&mut control).unwrap();
        assert_eq!(reading.humidity, 40.0);
        assert_eq!(env.reads(), 3);
    }

    #[test]
    fn test_await_times_out() {
        let env = SimEnvironmentBox::new(21.0, 90.0);
        let mut monitor = monitor(&env);
        let (_handle, mut control) = RunControl::new();

        let result = monitor.await_in_bounds(&mut control);
        assert!(matches!(result, Err(SqcError::EnvironmentTimeout { .. })));
    }

    #[test]
    fn test_await_honors_abort() {
        let env = SimEnvironmentBox::new(21.0, 90.0);
        let mut monitor = monitor(&env).with_max_wait(Duration::from_secs(60));
        let (handle, mut control) = RunControl::new();
        handle.abort();
        assert!(matches!(
            monitor.await_in_bounds(&mut control),
            Err(SqcError::Aborted)
        ));
    }

    #[test]
    fn test_live_monitor_publishes() {
        let env = SimEnvironmentBox::new(21.0, 30.0);
        let position: SharedPosition = Arc::new(RwLock::new(Some(Position::new(1.0, 2.0, 3.0))));
        let shared: SharedEnvironmentBox =
            Arc::new(Mutex::new(Box::new(env.clone()) as Box<dyn EnvironmentBox>));
        let (mut live, rx) = LiveMonitor::spawn(
            shared,
            position,
            EnvironmentBounds::default(),
            Duration::from_millis(5),
        );
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        live.stop();
        assert_eq!(status.position, Some(Position::new(1.0, 2.0, 3.0)));
        assert_eq!(status.status, Some(InterlockStatus::Ok));
    }

    #[test]
    fn test_live_monitor_stops_without_waiting_out_interval() {
        let env = SimEnvironmentBox::new(21.0, 30.0);
        let shared: SharedEnvironmentBox =
            Arc::new(Mutex::new(Box::new(env.clone()) as Box<dyn EnvironmentBox>));
        let (mut live, rx) = LiveMonitor::spawn(
            shared,
            Arc::new(RwLock::new(None)),
            EnvironmentBounds::default(),
            Duration::from_secs(60),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let start = Instant::now();
        live.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_live_monitor_queue_is_bounded() {
        let env = SimEnvironmentBox::new(21.0, 30.0);
        let shared: SharedEnvironmentBox =
            Arc::new(Mutex::new(Box::new(env.clone()) as Box<dyn EnvironmentBox>));
        let (mut live, rx) = LiveMonitor::spawn(
            shared,
            Arc::new(RwLock::new(None)),
            EnvironmentBounds::default(),
            Duration::from_millis(1),
        );
        while env.reads() < LIVE_STATUS_CAPACITY * 3 {
            std::thread::sleep(Duration::from_millis(5));
        }
        live.stop();
        assert_eq!(rx.len(), LIVE_STATUS_CAPACITY);
    }
}
