// Defaults, topics, and the startup configuration file
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::behavior::{BehaviorId, ButtonAction};
use crate::messages::GoalColor;
use crate::motor::{Wheel, WheelMap};
use crate::motor::feetech::DEFAULT_BAUDRATE;

// Behavior loop frequency for states that do not set their own
pub const BEHAVIOR_LOOP_HZ: u32 = 30;

// Motor worker loop frequency
pub const MOTOR_LOOP_HZ: u32 = 100;

// Command timeout for the motor watchdog
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(500);

// Consecutive missed detections before the ball counts as lost
pub const BALL_LOST_TICKS: u32 = 10;

// Pending button presses before producers wait
pub const BUTTON_QUEUE_DEPTH: usize = 32;

// Zenoh topics
pub const TOPIC_VISION: &str = "soccerbot/vision/frame";
pub const TOPIC_LOCALIZATION: &str = "soccerbot/localization/fix";
pub const TOPIC_HEADING: &str = "soccerbot/sensor/heading";
pub const TOPIC_BUTTON: &str = "soccerbot/input/button";
pub const TOPIC_SNAPSHOT: &str = "soccerbot/state/snapshot";

// Serial port for the wheel servos
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Raw servo velocity for a normalized speed of 1.0
pub const MAX_RAW: i16 = 3000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("expected 4 wheel addresses, found {found}")]
    WheelCount { found: usize },

    #[error("unknown wheel '{0}' (expected front_left, front_right, back_left, back_right)")]
    UnknownWheel(String),

    #[error("wheel address {0} is used twice")]
    DuplicateAddress(u8),

    #[error("unknown behavior state '{0}'")]
    UnknownState(String),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotConfig {
    pub motor: MotorConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    /// Action string from the button collaborator -> runtime action
    #[serde(default = "default_buttons")]
    pub buttons: HashMap<String, ButtonAction>,
    #[serde(default)]
    pub subsystems: SubsystemsConfig,
    #[serde(default)]
    pub topics: Topics,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotorConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Wheel name -> servo bus id
    #[serde(default)]
    pub wheels: HashMap<String, u8>,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    #[serde(default = "default_motor_hz")]
    pub loop_hz: u32,
    #[serde(default = "default_max_raw")]
    pub max_raw: i16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub initial_state: BehaviorId,
    pub ball_lost_ticks: u32,
    /// States visited by the cycle-mode button, in order
    pub cycle: Vec<BehaviorId>,
    pub target_goal: GoalColor,
    /// Per-state override of where to go when the ball is lost
    pub ball_lost_fallback: HashMap<String, BehaviorId>,
    pub kick_ticks: u32,
    pub square_leg_ticks: u32,
    pub home_x: f32,
    pub home_y: f32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            initial_state: BehaviorId::Stopped,
            ball_lost_ticks: BALL_LOST_TICKS,
            cycle: vec![
                BehaviorId::SearchBall,
                BehaviorId::MoveInSquare,
                BehaviorId::ReturnHome,
                BehaviorId::Stopped,
            ],
            target_goal: GoalColor::Blue,
            ball_lost_fallback: HashMap::new(),
            kick_ticks: 20,
            square_leg_ticks: 40,
            home_x: 0.0,
            home_y: 0.0,
        }
    }
}

/// How to launch a helper subsystem. Without a command the runtime only
/// attaches to the topic of an externally managed process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubsystemSpec {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubsystemsConfig {
    #[serde(default)]
    pub vision: SubsystemSpec,
    #[serde(default)]
    pub localization: SubsystemSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub vision: String,
    pub localization: String,
    pub heading: String,
    pub button: String,
    pub snapshot: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            vision: TOPIC_VISION.to_string(),
            localization: TOPIC_LOCALIZATION.to_string(),
            heading: TOPIC_HEADING.to_string(),
            button: TOPIC_BUTTON.to_string(),
            snapshot: TOPIC_SNAPSHOT.to_string(),
        }
    }
}

impl RobotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reject configurations the robot cannot safely start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.motor.wheel_map()?;

        if self.motor.watchdog_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "motor.watchdog_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.motor.loop_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "motor.loop_hz",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.motor.max_raw <= 0 {
            return Err(ConfigError::Invalid {
                field: "motor.max_raw",
                reason: "must be positive".to_string(),
            });
        }
        if self.behavior.ball_lost_ticks == 0 {
            return Err(ConfigError::Invalid {
                field: "behavior.ball_lost_ticks",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.behavior.cycle.is_empty() {
            return Err(ConfigError::Invalid {
                field: "behavior.cycle",
                reason: "needs at least one state".to_string(),
            });
        }
        for name in self.behavior.ball_lost_fallback.keys() {
            name.parse::<BehaviorId>()
                .map_err(|_| ConfigError::UnknownState(name.clone()))?;
        }
        for (name, spec) in [
            ("vision", &self.subsystems.vision),
            ("localization", &self.subsystems.localization),
        ] {
            if spec.command.iter().any(|arg| arg.is_empty()) {
                return Err(ConfigError::Invalid {
                    field: "subsystems",
                    reason: format!("{name} command has an empty argument"),
                });
            }
        }
        Ok(())
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.motor.watchdog_ms)
    }
}

impl MotorConfig {
    /// All four wheels must be addressed, each with its own bus id
    pub fn wheel_map(&self) -> Result<WheelMap, ConfigError> {
        if self.wheels.len() != Wheel::ALL.len() {
            return Err(ConfigError::WheelCount {
                found: self.wheels.len(),
            });
        }

        let mut ids = [0u8; 4];
        let mut seen = HashSet::new();
        for (name, &id) in &self.wheels {
            let wheel = Wheel::ALL
                .into_iter()
                .find(|w| w.name() == name)
                .ok_or_else(|| ConfigError::UnknownWheel(name.clone()))?;
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateAddress(id));
            }
            ids[wheel.index()] = id;
        }
        Ok(WheelMap(ids))
    }
}

fn default_buttons() -> HashMap<String, ButtonAction> {
    HashMap::from([
        ("pause".to_string(), ButtonAction::TogglePause),
        ("emergency_stop".to_string(), ButtonAction::EmergencyStop),
        ("reset_heading".to_string(), ButtonAction::ResetHeading),
        ("cycle_mode".to_string(), ButtonAction::CycleMode),
    ])
}

fn default_port() -> String {
    MOTOR_PORT.to_string()
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_watchdog_ms() -> u64 {
    WATCHDOG_TIMEOUT.as_millis() as u64
}

fn default_motor_hz() -> u32 {
    MOTOR_LOOP_HZ
}

fn default_max_raw() -> i16 {
    MAX_RAW
}
