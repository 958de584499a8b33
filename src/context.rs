// Shared runtime context, built once at startup and handed to every owner

use parking_lot::RwLock;
use std::sync::Arc;

use crate::behavior::{BehaviorId, RunMode};
use crate::config::RobotConfig;
use crate::health::ComponentHealth;
use crate::messages::{MotorSnapshot, Snapshot};
use crate::motor::MotorHandle;

/// Last published behavior state, readable from other tasks
pub struct StatusBoard {
    current: RwLock<(BehaviorId, RunMode)>,
}

impl StatusBoard {
    pub fn new(state: BehaviorId) -> Self {
        Self {
            current: RwLock::new((state, RunMode::Running)),
        }
    }

    pub fn set(&self, state: BehaviorId, mode: RunMode) {
        *self.current.write() = (state, mode);
    }

    pub fn get(&self) -> (BehaviorId, RunMode) {
        *self.current.read()
    }
}

#[derive(Clone)]
pub struct RobotContext {
    pub config: Arc<RobotConfig>,
    pub motor: MotorHandle,
    pub health: Arc<ComponentHealth>,
    pub board: Arc<StatusBoard>,
}

impl RobotContext {
    pub fn new(config: RobotConfig, motor: MotorHandle, health: Arc<ComponentHealth>) -> Self {
        let board = Arc::new(StatusBoard::new(config.behavior.initial_state));
        Self {
            config: Arc::new(config),
            motor,
            health,
            board,
        }
    }

    /// Point-in-time view for the debug dashboard
    pub fn snapshot(&self) -> Snapshot {
        let (state, mode) = self.board.get();
        Snapshot {
            state,
            mode,
            motor: MotorSnapshot::from(&self.motor.status()),
            health: self.health.snapshot(),
        }
    }
}
