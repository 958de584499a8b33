// Motor worker: sole owner of the wheel bus
//
// Runs on its own OS thread at a fixed rate, independent of the behavior
// loop. The watchdog zeroes all wheels when commands stop arriving, so a
// stalled or crashed control loop cannot leave the robot driving.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::driver::{DriverError, WheelDriver};
use super::kinematics::{Wheel, WheelSpeeds, WHEEL_COUNT};

/// Shared handle reachable from the control loop and the safety hooks
pub type MotorHandle = Arc<MotorWorker>;

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub loop_hz: u32,
    pub watchdog: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            loop_hz: crate::config::MOTOR_LOOP_HZ,
            watchdog: crate::config::WATCHDOG_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotorCommand {
    pub speeds: WheelSpeeds,
    pub issued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct MotorStatus {
    pub phase: WorkerPhase,
    /// Speeds the worker is currently commanding
    pub speeds: WheelSpeeds,
    pub last_command: Option<Instant>,
    pub watchdog_tripped: bool,
    pub faults: [bool; WHEEL_COUNT],
}

impl MotorStatus {
    fn starting() -> Self {
        Self {
            phase: WorkerPhase::Starting,
            speeds: WheelSpeeds::zero(),
            last_command: None,
            watchdog_tripped: false,
            faults: [false; WHEEL_COUNT],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("wheel {wheel} failed its bus handshake: {source}")]
    Handshake {
        wheel: Wheel,
        #[source]
        source: DriverError,
    },

    #[error("failed to spawn motor worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Pending {
    command: MotorCommand,
    epoch: u64,
}

struct Shared {
    slot: Mutex<Option<Pending>>,
    /// Bumped by every effective `stop()`; commands from older epochs are dropped
    epoch: AtomicU64,
    halt: AtomicBool,
    /// Wheels latched at zero by `stop()` and not commanded since
    halted: AtomicBool,
    shutdown: AtomicBool,
    status: RwLock<MotorStatus>,
}

pub struct MotorWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MotorWorker {
    /// Handshake every wheel, then start the worker thread.
    ///
    /// Any wheel failing its handshake aborts startup; a partial wheel set
    /// cannot produce a coherent drive vector. No speed is written on failure.
    pub fn start<D>(mut driver: D, settings: WorkerSettings) -> Result<MotorHandle, WorkerError>
    where
        D: WheelDriver + 'static,
    {
        info!(
            "Motor worker starting: {}Hz loop, {}ms watchdog",
            settings.loop_hz,
            settings.watchdog.as_millis()
        );

        for wheel in Wheel::ALL {
            if let Err(source) = driver.handshake(wheel) {
                error!(%wheel, "Wheel handshake failed: {}", source);
                return Err(WorkerError::Handshake { wheel, source });
            }
        }

        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            epoch: AtomicU64::new(0),
            halt: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            status: RwLock::new(MotorStatus::starting()),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("motor-worker".to_string())
            .spawn(move || WorkerLoop::new(driver, settings, loop_shared).run())?;

        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Replace any unconsumed command with `speeds`. Never blocks on the bus.
    pub fn enqueue(&self, speeds: WheelSpeeds) {
        let pending = Pending {
            command: MotorCommand {
                speeds: speeds.sanitized(),
                issued_at: Instant::now(),
            },
            epoch: self.shared.epoch.load(Ordering::Acquire),
        };
        *self.shared.slot.lock() = Some(pending);
        self.shared.halted.store(false, Ordering::Release);
    }

    /// Force all wheels to zero on the next worker cycle.
    ///
    /// Lock-free, so it is usable from signal and panic hooks. Repeated calls
    /// without an `enqueue` in between are no-ops.
    pub fn stop(&self) {
        if self.shared.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.halt.store(true, Ordering::Release);
    }

    /// Stop, then end the worker loop and release the bus. Idempotent.
    pub fn shutdown(&self) {
        self.stop();
        self.shared.shutdown.store(true, Ordering::Release);

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.join().is_err() {
            error!("Motor worker thread panicked");
        }
    }

    pub fn status(&self) -> MotorStatus {
        self.shared.status.read().clone()
    }
}

impl Drop for MotorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WorkerLoop<D> {
    driver: D,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    target: WheelSpeeds,
    commanded: WheelSpeeds,
    /// Last value that reached each wheel; `None` forces a rewrite
    written: [Option<f32>; WHEEL_COUNT],
    faults: [bool; WHEEL_COUNT],
    last_accepted: Instant,
    last_command: Option<Instant>,
    tripped: bool,
}

impl<D: WheelDriver> WorkerLoop<D> {
    fn new(driver: D, settings: WorkerSettings, shared: Arc<Shared>) -> Self {
        Self {
            driver,
            settings,
            shared,
            target: WheelSpeeds::zero(),
            commanded: WheelSpeeds::zero(),
            // handshake leaves every wheel at zero
            written: [Some(0.0); WHEEL_COUNT],
            faults: [false; WHEEL_COUNT],
            last_accepted: Instant::now(),
            last_command: None,
            tripped: false,
        }
    }

    fn run(mut self) {
        let period = Duration::from_secs_f64(1.0 / self.settings.loop_hz.max(1) as f64);
        self.publish(WorkerPhase::Running);
        info!("Motor worker running");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            let cycle_start = Instant::now();
            self.cycle();
            thread::sleep(period.saturating_sub(cycle_start.elapsed()));
        }

        self.publish(WorkerPhase::Stopping);
        self.write_all_zero();
        if let Err(e) = self.driver.release() {
            warn!("Failed to release wheel bus: {}", e);
        }
        self.publish(WorkerPhase::Stopped);
        info!("Motor worker stopped");
    }

    fn cycle(&mut self) {
        if self.shared.halt.swap(false, Ordering::AcqRel) {
            info!("Stop requested, zeroing wheels");
            self.write_all_zero();
        }

        let pending = self.shared.slot.lock().take();
        if let Some(pending) = pending {
            if pending.epoch >= self.shared.epoch.load(Ordering::Acquire) {
                self.accept(pending.command);
            } else {
                debug!("Dropping command issued before stop");
            }
        }

        if !self.tripped && self.last_accepted.elapsed() > self.settings.watchdog {
            warn!(
                "No motor command for {:?}, watchdog zeroing wheels",
                self.last_accepted.elapsed()
            );
            self.tripped = true;
        }

        let desired = if self.tripped {
            WheelSpeeds::zero()
        } else {
            self.target
        };
        self.write_changed(desired);
        self.commanded = desired;
        self.publish(WorkerPhase::Running);
    }

    fn accept(&mut self, command: MotorCommand) {
        if self.tripped {
            info!("Fresh motor command, watchdog cleared");
            self.tripped = false;
        }
        self.target = command.speeds;
        self.last_accepted = Instant::now();
        self.last_command = Some(command.issued_at);
    }

    fn write_changed(&mut self, desired: WheelSpeeds) {
        for wheel in Wheel::ALL {
            let speed = desired.get(wheel);
            if self.written[wheel.index()] != Some(speed) {
                self.write_wheel(wheel, speed);
            }
        }
    }

    fn write_all_zero(&mut self) {
        self.target = WheelSpeeds::zero();
        self.commanded = WheelSpeeds::zero();
        for wheel in Wheel::ALL {
            self.write_wheel(wheel, 0.0);
        }
    }

    /// One wheel failing does not abort the cycle; the others still actuate
    fn write_wheel(&mut self, wheel: Wheel, speed: f32) {
        let i = wheel.index();
        match self.driver.write_speed(wheel, speed) {
            Ok(()) => {
                self.written[i] = Some(speed);
                if self.faults[i] {
                    info!(%wheel, "Wheel write recovered");
                    self.faults[i] = false;
                }
            }
            Err(e) => {
                self.written[i] = None;
                if !self.faults[i] {
                    warn!(%wheel, "Wheel write failed: {}", e);
                    self.faults[i] = true;
                }
            }
        }
    }

    fn publish(&self, phase: WorkerPhase) {
        let mut status = self.shared.status.write();
        status.phase = phase;
        status.speeds = self.commanded;
        status.last_command = self.last_command;
        status.watchdog_tripped = self.tripped;
        status.faults = self.faults;
    }
}
