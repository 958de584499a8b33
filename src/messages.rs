// Message types exchanged with the helper subsystems and the debug dashboard

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::behavior::{BehaviorId, ButtonAction, RunMode};
use crate::health::{Component, HealthEntry};
use crate::motor::{MotorStatus, WheelSpeeds, WorkerPhase};

/// Ball detection from the vision pipeline. Angles in degrees,
/// 0 = straight ahead, positive = left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BallObservation {
    pub detected: bool,
    #[serde(default)]
    pub angle_deg: f32,
    #[serde(default)]
    pub distance_px: f32,
    #[serde(default)]
    pub close_and_centered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalObservation {
    pub detected: bool,
    #[serde(default)]
    pub angle_deg: f32,
    #[serde(default)]
    pub distance_px: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Goals {
    #[serde(default)]
    pub blue: GoalObservation,
    #[serde(default)]
    pub yellow: GoalObservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalColor {
    Blue,
    Yellow,
}

impl Goals {
    pub fn get(&self, color: GoalColor) -> &GoalObservation {
        match color {
            GoalColor::Blue => &self.blue,
            GoalColor::Yellow => &self.yellow,
        }
    }
}

// Vision collaborator -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionFrame {
    #[serde(default)]
    pub ball: BallObservation,
    #[serde(default)]
    pub goals: Goals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub heading_deg: f32,
}

// Localization collaborator -> runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizationFix {
    pub pose: Pose,
    #[serde(default)]
    pub confidence: f32,
}

// Heading sensor -> runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeadingReading {
    pub heading_deg: f32,
}

// Button collaborator -> runtime, before the action string is mapped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonMessage {
    pub action: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonPress {
    pub action: ButtonAction,
    pub timestamp: f64,
}

/// Everything the behavior loop consumes from outside
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    ButtonPress(ButtonPress),
    VisionFrame(VisionFrame),
    LocalizationFix(LocalizationFix),
    Heading(f32),
}

/// Motor status as seen by the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct MotorSnapshot {
    pub phase: WorkerPhase,
    pub speeds: WheelSpeeds,
    pub last_command_age_ms: Option<u64>,
    pub watchdog_tripped: bool,
    pub faults: [bool; 4],
}

impl From<&MotorStatus> for MotorSnapshot {
    fn from(status: &MotorStatus) -> Self {
        let now = Instant::now();
        Self {
            phase: status.phase,
            speeds: status.speeds,
            last_command_age_ms: status
                .last_command
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            watchdog_tripped: status.watchdog_tripped,
            faults: status.faults,
        }
    }
}

/// Read-only view answered to the debug dashboard on request
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: BehaviorId,
    pub mode: RunMode,
    pub motor: MotorSnapshot,
    pub health: BTreeMap<Component, HealthEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vision_payload() {
        let json = r#"{
            "ball": {"detected": true, "angle_deg": -12.5, "distance_px": 140.0, "close_and_centered": false},
            "goals": {"blue": {"detected": true, "angle_deg": 30.0, "distance_px": 400.0},
                      "yellow": {"detected": false, "angle_deg": 0.0, "distance_px": 0.0}}
        }"#;
        let frame: VisionFrame = serde_json::from_str(json).unwrap();
        assert!(frame.ball.detected);
        assert_eq!(frame.ball.angle_deg, -12.5);
        assert!(frame.goals.get(GoalColor::Blue).detected);
        assert!(!frame.goals.get(GoalColor::Yellow).detected);
    }

    #[test]
    fn missing_goals_default_to_undetected() {
        let frame: VisionFrame = serde_json::from_str(r#"{"ball": {"detected": false}}"#).unwrap();
        assert!(!frame.goals.blue.detected);
        assert!(!frame.ball.close_and_centered);
    }

    #[test]
    fn parses_localization_and_button_payloads() {
        let fix: LocalizationFix = serde_json::from_str(
            r#"{"pose": {"x": 1.0, "y": -0.5, "heading_deg": 45.0}, "confidence": 0.8}"#,
        )
        .unwrap();
        assert_eq!(fix.pose.heading_deg, 45.0);

        let button: ButtonMessage =
            serde_json::from_str(r#"{"action": "pause", "timestamp": 12.5}"#).unwrap();
        assert_eq!(button.action, "pause");
    }
}
