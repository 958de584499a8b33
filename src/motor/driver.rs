// Per-wheel actuation over the shared servo bus
//
// The motor worker is the only owner of a `WheelDriver`; nothing else
// touches the bus while the robot runs.

use tracing::{debug, info, warn};

use super::feetech::{FeetechBus, FeetechError, OperatingMode};
use super::kinematics::{Wheel, WHEEL_COUNT};

/// Bus ids for the four wheels, ordered as [`Wheel::ALL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelMap(pub [u8; WHEEL_COUNT]);

impl WheelMap {
    pub fn id(&self, wheel: Wheel) -> u8 {
        self.0[wheel.index()]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("wheel {wheel} not responding")]
    NoResponse { wheel: Wheel },

    #[error("bus error on wheel {wheel}: {source}")]
    Bus {
        wheel: Wheel,
        #[source]
        source: FeetechError,
    },

    #[error("{0}")]
    Other(String),
}

/// Actuation driver contract used by the motor worker
pub trait WheelDriver: Send {
    /// Verify the wheel answers and prepare it for velocity commands
    fn handshake(&mut self, wheel: Wheel) -> Result<(), DriverError>;

    /// Set the normalized target speed in [-1, 1]
    fn write_speed(&mut self, wheel: Wheel, speed: f32) -> Result<(), DriverError>;

    /// Read the present normalized speed
    fn read_speed(&mut self, wheel: Wheel) -> Result<f32, DriverError>;

    /// Hand the bus back; called once after the final zero write
    fn release(&mut self) -> Result<(), DriverError>;
}

/// Feetech STS servos in continuous-rotation (velocity) mode
pub struct FeetechWheels {
    bus: FeetechBus,
    map: WheelMap,
    max_raw: i16,
    armed: bool,
}

impl FeetechWheels {
    pub fn open(port: &str, baudrate: u32, map: WheelMap, max_raw: i16) -> Result<Self, FeetechError> {
        info!("Opening wheel bus on {} @ {} baud", port, baudrate);
        let bus = FeetechBus::open(port, baudrate)?;
        Ok(Self {
            bus,
            map,
            max_raw,
            armed: false,
        })
    }

    pub fn ping(&mut self, wheel: Wheel) -> Result<bool, FeetechError> {
        self.bus.ping(self.map.id(wheel))
    }

    fn to_raw(&self, speed: f32) -> i16 {
        let speed = if speed.is_nan() { 0.0 } else { speed.clamp(-1.0, 1.0) };
        (speed * self.max_raw as f32).round() as i16
    }

    fn bus_err(wheel: Wheel) -> impl FnOnce(FeetechError) -> DriverError {
        move |source| DriverError::Bus { wheel, source }
    }
}

impl WheelDriver for FeetechWheels {
    fn handshake(&mut self, wheel: Wheel) -> Result<(), DriverError> {
        let id = self.map.id(wheel);
        if !self.bus.ping(id).map_err(Self::bus_err(wheel))? {
            warn!(%wheel, id, "wheel did not answer ping");
            return Err(DriverError::NoResponse { wheel });
        }

        self.bus.set_torque(id, false).map_err(Self::bus_err(wheel))?;
        self.bus
            .set_operating_mode(id, OperatingMode::Velocity)
            .map_err(Self::bus_err(wheel))?;
        self.bus.set_torque(id, true).map_err(Self::bus_err(wheel))?;
        self.bus.set_velocity(id, 0).map_err(Self::bus_err(wheel))?;

        debug!(%wheel, id, "wheel ready");
        if wheel == Wheel::BackRight {
            self.armed = true;
        }
        Ok(())
    }

    fn write_speed(&mut self, wheel: Wheel, speed: f32) -> Result<(), DriverError> {
        let raw = self.to_raw(speed);
        self.bus
            .set_velocity(self.map.id(wheel), raw)
            .map_err(Self::bus_err(wheel))
    }

    fn read_speed(&mut self, wheel: Wheel) -> Result<f32, DriverError> {
        let raw = self
            .bus
            .present_velocity(self.map.id(wheel))
            .map_err(Self::bus_err(wheel))?;
        Ok(raw as f32 / self.max_raw as f32)
    }

    fn release(&mut self) -> Result<(), DriverError> {
        info!("Releasing wheel bus");
        self.armed = false;
        for wheel in Wheel::ALL {
            self.bus
                .set_torque(self.map.id(wheel), false)
                .map_err(Self::bus_err(wheel))?;
        }
        Ok(())
    }
}

impl Drop for FeetechWheels {
    fn drop(&mut self) {
        // Last line of defence if the worker thread unwinds
        if !self.armed {
            return;
        }
        for wheel in Wheel::ALL {
            if let Err(e) = self.bus.set_velocity(self.map.id(wheel), 0) {
                warn!(%wheel, "Failed to zero wheel on drop: {}", e);
            }
        }
    }
}
