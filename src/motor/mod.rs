// Motor control for the four-wheel omniwheel base
//
// Provides:
// - Omniwheel kinematics (drive intent -> normalized wheel targets)
// - Feetech STS serial protocol
// - Per-wheel driver contract and the Feetech implementation
// - The watchdog-protected motor worker thread

mod driver;
pub mod feetech;
pub mod kinematics;
mod worker;

pub use driver::{DriverError, FeetechWheels, WheelDriver, WheelMap};
pub use feetech::{FeetechBus, FeetechError};
pub use kinematics::{Wheel, WheelSpeeds, field_relative, robot_relative};
pub use worker::{
    MotorCommand, MotorHandle, MotorStatus, MotorWorker, WorkerError, WorkerPhase, WorkerSettings,
};
