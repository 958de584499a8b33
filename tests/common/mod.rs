#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use soccerbot_runtime::config::RobotConfig;
use soccerbot_runtime::lifecycle::{
    LifecycleError, SubsystemId, SubsystemLauncher, SubsystemProcess,
};
use soccerbot_runtime::motor::{DriverError, Wheel, WheelDriver};

pub const WHEELS: &str = r#"
[motor]
port = "/dev/null"
watchdog_ms = 10000

[motor.wheels]
front_left = 1
front_right = 2
back_left = 3
back_right = 4
"#;

pub fn config(extra: &str) -> RobotConfig {
    RobotConfig::from_toml(&format!("{WHEELS}\n{extra}")).unwrap()
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// What a `RecordingDriver` saw on the bus
#[derive(Default)]
pub struct BusLog {
    pub writes: Mutex<Vec<(Wheel, f32)>>,
    pub handshakes: Mutex<Vec<Wheel>>,
    pub releases: AtomicUsize,
    pub fail_handshake: Mutex<Option<Wheel>>,
    pub fail_write: Mutex<Option<Wheel>>,
}

impl BusLog {
    pub fn writes_for(&self, wheel: Wheel) -> Vec<f32> {
        self.writes
            .lock()
            .iter()
            .filter(|(w, _)| *w == wheel)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn last(&self, wheel: Wheel) -> Option<f32> {
        self.writes_for(wheel).last().copied()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

pub struct RecordingDriver {
    pub log: Arc<BusLog>,
}

impl RecordingDriver {
    pub fn new() -> (Self, Arc<BusLog>) {
        let log = Arc::new(BusLog::default());
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl WheelDriver for RecordingDriver {
    fn handshake(&mut self, wheel: Wheel) -> Result<(), DriverError> {
        if *self.log.fail_handshake.lock() == Some(wheel) {
            return Err(DriverError::NoResponse { wheel });
        }
        self.log.handshakes.lock().push(wheel);
        Ok(())
    }

    fn write_speed(&mut self, wheel: Wheel, speed: f32) -> Result<(), DriverError> {
        if *self.log.fail_write.lock() == Some(wheel) {
            return Err(DriverError::Other(format!("{wheel} unplugged")));
        }
        self.log.writes.lock().push((wheel, speed));
        Ok(())
    }

    fn read_speed(&mut self, wheel: Wheel) -> Result<f32, DriverError> {
        Ok(self.log.last(wheel).unwrap_or(0.0))
    }

    fn release(&mut self) -> Result<(), DriverError> {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a `FakeLauncher` was asked to do
#[derive(Default)]
pub struct LaunchLog {
    /// Every launch call, failed or not
    pub attempts: Mutex<Vec<SubsystemId>>,
    pub starts: Mutex<Vec<SubsystemId>>,
    pub stops: Mutex<Vec<SubsystemId>>,
    pub failing: Mutex<HashSet<SubsystemId>>,
    pub dead: Mutex<HashSet<SubsystemId>>,
    pub heartbeat: AtomicBool,
}

impl LaunchLog {
    pub fn starts(&self, id: SubsystemId) -> usize {
        self.starts.lock().iter().filter(|s| **s == id).count()
    }

    pub fn attempts(&self, id: SubsystemId) -> usize {
        self.attempts.lock().iter().filter(|s| **s == id).count()
    }

    pub fn stops(&self, id: SubsystemId) -> usize {
        self.stops.lock().iter().filter(|s| **s == id).count()
    }

    pub fn fail(&self, id: SubsystemId) {
        self.failing.lock().insert(id);
    }

    pub fn kill(&self, id: SubsystemId) {
        self.dead.lock().insert(id);
    }
}

pub struct FakeLauncher {
    log: Arc<LaunchLog>,
}

impl FakeLauncher {
    pub fn new() -> (Self, Arc<LaunchLog>) {
        let log = Arc::new(LaunchLog::default());
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl SubsystemLauncher for FakeLauncher {
    fn launch(
        &mut self,
        subsystem: SubsystemId,
    ) -> Result<Box<dyn SubsystemProcess>, LifecycleError> {
        self.log.attempts.lock().push(subsystem);
        if self.log.failing.lock().contains(&subsystem) {
            return Err(LifecycleError::Spawn {
                subsystem,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such helper"),
            });
        }
        self.log.dead.lock().remove(&subsystem);
        self.log.starts.lock().push(subsystem);
        Ok(Box::new(FakeProcess {
            id: subsystem,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeProcess {
    id: SubsystemId,
    log: Arc<LaunchLog>,
}

impl SubsystemProcess for FakeProcess {
    fn is_alive(&mut self) -> bool {
        !self.log.dead.lock().contains(&self.id)
    }

    fn heartbeat(&self) -> bool {
        self.log.heartbeat.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.log.stops.lock().push(self.id);
    }
}
