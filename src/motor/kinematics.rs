// Omniwheel kinematics for the four-wheel soccer base
//
// Wheels sit at 45° to the chassis axes. Directions are in degrees with
// 0° = forward, positive = left, negative = right.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WHEEL_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    FrontLeft,
    FrontRight,
    BackLeft,
    BackRight,
}

impl Wheel {
    pub const ALL: [Wheel; WHEEL_COUNT] = [
        Wheel::FrontLeft,
        Wheel::FrontRight,
        Wheel::BackLeft,
        Wheel::BackRight,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Wheel::FrontLeft => "front_left",
            Wheel::FrontRight => "front_right",
            Wheel::BackLeft => "back_left",
            Wheel::BackRight => "back_right",
        }
    }
}

impl fmt::Display for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalized wheel targets in [-1, 1], ordered as [`Wheel::ALL`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelSpeeds(pub [f32; WHEEL_COUNT]);

impl WheelSpeeds {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn as_array(&self) -> [f32; WHEEL_COUNT] {
        self.0
    }

    pub fn get(&self, wheel: Wheel) -> f32 {
        self.0[wheel.index()]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&w| w == 0.0)
    }

    pub fn max_abs(&self) -> f32 {
        self.0.iter().fold(0.0f32, |m, w| m.max(w.abs()))
    }

    /// Replace NaN with 0 and clamp to [-1, 1]
    pub fn sanitized(self) -> Self {
        Self(self.0.map(|w| if w.is_nan() { 0.0 } else { w.clamp(-1.0, 1.0) }))
    }
}

/// Wrap an angle into (-180, 180]
pub fn wrap_degrees(deg: f32) -> f32 {
    if !deg.is_finite() {
        return 0.0;
    }
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

/// Robot-relative drive: `direction` in degrees, `speed` in [0, 1],
/// `rotation` in [-1, 1] (positive spins counter-clockwise)
pub fn robot_relative(direction: f32, speed: f32, rotation: f32) -> WheelSpeeds {
    normalize(mix(direction, speed, rotation))
}

/// Field-relative drive: `direction` is measured in the field frame and is
/// rotated into the robot frame using the current `heading`
pub fn field_relative(direction: f32, speed: f32, rotation: f32, heading: f32) -> WheelSpeeds {
    let heading = if heading.is_finite() { heading } else { 0.0 };
    robot_relative(direction - heading, speed, rotation)
}

/// Scale all four wheels down by the largest magnitude if any exceeds 1
pub fn normalize(raw: [f32; WHEEL_COUNT]) -> WheelSpeeds {
    let speeds = WheelSpeeds(raw);
    let max = speeds.max_abs();
    if max > 1.0 {
        WheelSpeeds(raw.map(|w| w / max))
    } else {
        speeds
    }
}

/// Unnormalized wheel mix
pub fn mix(direction: f32, speed: f32, rotation: f32) -> [f32; WHEEL_COUNT] {
    let theta = wrap_degrees(direction).to_radians();
    let speed = clamp_finite(speed, 0.0, 1.0);
    let r = clamp_finite(rotation, -1.0, 1.0);

    let vx = speed * theta.sin();
    let vy = speed * theta.cos();

    [
        vy + vx + r, // front left
        vy - vx - r, // front right
        vy - vx + r, // back left
        vy + vx - r, // back right
    ]
}

fn clamp_finite(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(min, max) }
}
