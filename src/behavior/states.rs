// Per-state control logic
//
// Handlers are plain functions over the latest inputs. They describe the
// drive intent and the next state; the machine does kinematics and hands
// the result to the motor worker.

use super::BehaviorId;
use crate::config::BehaviorConfig;
use crate::messages::{BallObservation, LocalizationFix, VisionFrame};
use crate::motor::kinematics::wrap_degrees;

const SEARCH_SPIN: f32 = 0.35;
const CHASE_MIN_SPEED: f32 = 0.2;
const CHASE_MAX_SPEED: f32 = 0.7;
const APPROACH_PX: f32 = 300.0;
const TURN_GAIN: f32 = 0.8;
const ORBIT_SPEED: f32 = 0.35;
const ORBIT_SPIN: f32 = 0.25;
const GOAL_ALIGN_DEG: f32 = 6.0;
const KICK_SPEED: f32 = 1.0;
const SQUARE_SPEED: f32 = 0.4;
const SQUARE_LEGS: [f32; 4] = [0.0, 90.0, 180.0, -90.0];
const HOME_SPEED: f32 = 0.5;
const HOME_SLOW_RADIUS: f32 = 0.5; // meters
const HOME_TOLERANCE: f32 = 0.08; // meters
const MIN_POSE_CONFIDENCE: f32 = 0.3;

/// Unexpected failure inside a handler. The machine stops the motors before
/// reporting it.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerFault(pub String);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Drive {
    /// Direction relative to the robot's front
    Robot {
        direction: f32,
        speed: f32,
        rotation: f32,
    },
    /// Direction in the field frame, corrected by the current heading
    Field {
        direction: f32,
        speed: f32,
        rotation: f32,
    },
    /// Command all wheels to zero
    Halt,
}

/// Outcome of one handler run
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Step {
    /// `None` keeps the last command in place
    pub drive: Option<Drive>,
    pub next: Option<BehaviorId>,
}

impl Step {
    pub fn hold() -> Self {
        Self::default()
    }

    pub fn drive(drive: Drive) -> Self {
        Self {
            drive: Some(drive),
            next: None,
        }
    }

    pub fn halt() -> Self {
        Self::drive(Drive::Halt)
    }

    pub fn then(mut self, next: BehaviorId) -> Self {
        self.next = Some(next);
        self
    }
}

/// Counts consecutive ticks without a ball detection. A few missed frames
/// are detector jitter; only a sustained run means the ball is gone.
#[derive(Debug, Clone)]
pub struct BallTracker {
    misses: u32,
    threshold: u32,
}

impl BallTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            misses: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn observe(&mut self, detected: bool) {
        if detected {
            self.misses = 0;
        } else {
            self.misses = self.misses.saturating_add(1);
        }
    }

    pub fn is_lost(&self) -> bool {
        self.misses >= self.threshold
    }

    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

/// Scratch state owned by the active behavior, cleared on every entry
#[derive(Debug, Clone, Default)]
pub struct StateMemory {
    /// Handler runs since entry
    pub ticks: u32,
    pub leg: usize,
    pub leg_ticks: u32,
}

pub struct StateCtx<'a> {
    pub vision: Option<&'a VisionFrame>,
    pub localization: Option<&'a LocalizationFix>,
    pub heading: Option<f32>,
    pub ball_lost: bool,
    pub fallback: Option<BehaviorId>,
    pub memory: &'a mut StateMemory,
    pub tuning: &'a BehaviorConfig,
}

impl StateCtx<'_> {
    /// The ball, if the current frame sees it
    pub fn ball(&self) -> Option<BallObservation> {
        self.vision.map(|v| v.ball).filter(|b| b.detected)
    }

    fn lost_step(&self) -> Step {
        Step::halt().then(self.fallback.unwrap_or(BehaviorId::Stopped))
    }
}

/// Commands zero every tick so the watchdog stays fed while idle
pub fn stopped(_ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    Ok(Step::halt())
}

pub fn search_ball(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    if ctx.ball().is_some() {
        return Ok(Step::hold().then(BehaviorId::ChaseBall));
    }
    Ok(Step::drive(Drive::Robot {
        direction: 0.0,
        speed: 0.0,
        rotation: SEARCH_SPIN,
    }))
}

pub fn chase_ball(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    if ctx.ball_lost {
        return Ok(ctx.lost_step());
    }
    let Some(ball) = ctx.ball() else {
        return Ok(Step::hold());
    };
    if ball.close_and_centered {
        return Ok(Step::hold().then(BehaviorId::LineupKick));
    }

    let speed = (ball.distance_px / APPROACH_PX).clamp(CHASE_MIN_SPEED, CHASE_MAX_SPEED);
    Ok(Step::drive(Drive::Robot {
        direction: ball.angle_deg,
        speed,
        rotation: turn_toward(ball.angle_deg),
    }))
}

pub fn lineup_kick(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    if ctx.ball_lost {
        return Ok(ctx.lost_step());
    }
    let Some(ball) = ctx.ball() else {
        return Ok(Step::hold());
    };
    let Some(vision) = ctx.vision else {
        return Ok(Step::hold());
    };

    let goal = vision.goals.get(ctx.tuning.target_goal);
    let offset = if goal.detected {
        goal.angle_deg - ball.angle_deg
    } else {
        // keep circling left until the goal comes into view
        GOAL_ALIGN_DEG * 10.0
    };

    if goal.detected && offset.abs() <= GOAL_ALIGN_DEG && ball.close_and_centered {
        return Ok(Step::halt().then(BehaviorId::Kick));
    }

    // Strafe around the ball while turning back toward it
    let side = if offset > 0.0 { -90.0 } else { 90.0 };
    let spin = if offset > 0.0 { ORBIT_SPIN } else { -ORBIT_SPIN };
    Ok(Step::drive(Drive::Robot {
        direction: side,
        speed: ORBIT_SPEED,
        rotation: (spin + turn_toward(ball.angle_deg)).clamp(-1.0, 1.0),
    }))
}

pub fn kick(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    if ctx.memory.ticks >= ctx.tuning.kick_ticks {
        return Ok(Step::halt().then(BehaviorId::SearchBall));
    }
    Ok(Step::drive(Drive::Robot {
        direction: 0.0,
        speed: KICK_SPEED,
        rotation: 0.0,
    }))
}

pub fn move_in_square(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    let memory = &mut *ctx.memory;
    if memory.leg_ticks >= ctx.tuning.square_leg_ticks {
        memory.leg = (memory.leg + 1) % SQUARE_LEGS.len();
        memory.leg_ticks = 0;
    }
    memory.leg_ticks += 1;

    Ok(Step::drive(Drive::Field {
        direction: SQUARE_LEGS[memory.leg],
        speed: SQUARE_SPEED,
        rotation: 0.0,
    }))
}

pub fn return_home(ctx: &mut StateCtx<'_>) -> Result<Step, HandlerFault> {
    let Some(fix) = ctx.localization.filter(|f| f.confidence >= MIN_POSE_CONFIDENCE) else {
        // no trustworthy pose: stay put rather than guess
        return Ok(Step::halt());
    };

    let dx = ctx.tuning.home_x - fix.pose.x;
    let dy = ctx.tuning.home_y - fix.pose.y;
    let distance = dx.hypot(dy);
    if !distance.is_finite() {
        return Err(HandlerFault(format!("non-finite pose {:?}", fix.pose)));
    }
    if distance <= HOME_TOLERANCE {
        return Ok(Step::halt().then(BehaviorId::Stopped));
    }

    // Bearing and pose heading share the localization frame; the field
    // heading offset does not apply here
    let bearing = dy.atan2(dx).to_degrees();
    Ok(Step::drive(Drive::Robot {
        direction: wrap_degrees(bearing - fix.pose.heading_deg),
        speed: HOME_SPEED * (distance / HOME_SLOW_RADIUS).min(1.0),
        rotation: 0.0,
    }))
}

/// Rotation that turns the robot's front toward `angle_deg`
fn turn_toward(angle_deg: f32) -> f32 {
    (angle_deg / 90.0 * TURN_GAIN).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GoalObservation, Goals, Pose};

    fn frame(ball: BallObservation) -> VisionFrame {
        VisionFrame {
            ball,
            goals: Goals::default(),
        }
    }

    fn seen(angle: f32, distance: f32) -> BallObservation {
        BallObservation {
            detected: true,
            angle_deg: angle,
            distance_px: distance,
            close_and_centered: false,
        }
    }

    fn run(
        handler: super::super::Handler,
        vision: Option<&VisionFrame>,
        localization: Option<&LocalizationFix>,
        memory: &mut StateMemory,
        ball_lost: bool,
    ) -> Step {
        let tuning = BehaviorConfig::default();
        let mut ctx = StateCtx {
            vision,
            localization,
            heading: None,
            ball_lost,
            fallback: Some(BehaviorId::SearchBall),
            memory,
            tuning: &tuning,
        };
        handler(&mut ctx).unwrap()
    }

    #[test]
    fn tracker_needs_a_full_run_of_misses() {
        let mut tracker = BallTracker::new(3);
        tracker.observe(false);
        tracker.observe(false);
        assert!(!tracker.is_lost());
        tracker.observe(true);
        tracker.observe(false);
        tracker.observe(false);
        assert!(!tracker.is_lost());
        tracker.observe(false);
        assert!(tracker.is_lost());
        tracker.reset();
        assert!(!tracker.is_lost());
    }

    #[test]
    fn search_spins_until_ball_seen() {
        let mut memory = StateMemory::default();
        let step = run(search_ball, None, None, &mut memory, false);
        assert!(matches!(step.drive, Some(Drive::Robot { speed, rotation, .. }) if speed == 0.0 && rotation > 0.0));
        assert_eq!(step.next, None);

        let vision = frame(seen(10.0, 200.0));
        let step = run(search_ball, Some(&vision), None, &mut memory, false);
        assert_eq!(step.next, Some(BehaviorId::ChaseBall));
    }

    #[test]
    fn chase_drives_toward_ball() {
        let mut memory = StateMemory::default();
        let vision = frame(seen(-30.0, 600.0));
        let step = run(chase_ball, Some(&vision), None, &mut memory, false);
        match step.drive {
            Some(Drive::Robot { direction, speed, rotation }) => {
                assert_eq!(direction, -30.0);
                assert_eq!(speed, CHASE_MAX_SPEED);
                assert!(rotation < 0.0);
            }
            other => panic!("unexpected drive {other:?}"),
        }
    }

    #[test]
    fn chase_holds_through_a_missed_frame_and_falls_back_when_lost() {
        let mut memory = StateMemory::default();
        let empty = frame(BallObservation::default());
        let step = run(chase_ball, Some(&empty), None, &mut memory, false);
        assert_eq!(step, Step::hold());

        let step = run(chase_ball, Some(&empty), None, &mut memory, true);
        assert_eq!(step.drive, Some(Drive::Halt));
        assert_eq!(step.next, Some(BehaviorId::SearchBall));
    }

    #[test]
    fn chase_hands_over_when_ball_is_close() {
        let mut memory = StateMemory::default();
        let mut ball = seen(0.0, 20.0);
        ball.close_and_centered = true;
        let vision = frame(ball);
        let step = run(chase_ball, Some(&vision), None, &mut memory, false);
        assert_eq!(step.next, Some(BehaviorId::LineupKick));
    }

    #[test]
    fn lineup_kicks_when_goal_is_behind_ball() {
        let mut memory = StateMemory::default();
        let mut ball = seen(1.0, 20.0);
        ball.close_and_centered = true;
        let vision = VisionFrame {
            ball,
            goals: Goals {
                blue: GoalObservation {
                    detected: true,
                    angle_deg: 3.0,
                    distance_px: 500.0,
                },
                ..Goals::default()
            },
        };
        let step = run(lineup_kick, Some(&vision), None, &mut memory, false);
        assert_eq!(step.next, Some(BehaviorId::Kick));
    }

    #[test]
    fn lineup_orbits_while_goal_is_off_axis() {
        let mut memory = StateMemory::default();
        let vision = VisionFrame {
            ball: seen(0.0, 20.0),
            goals: Goals {
                blue: GoalObservation {
                    detected: true,
                    angle_deg: -40.0,
                    distance_px: 500.0,
                },
                ..Goals::default()
            },
        };
        let step = run(lineup_kick, Some(&vision), None, &mut memory, false);
        assert!(matches!(step.drive, Some(Drive::Robot { direction, .. }) if direction == 90.0));
        assert_eq!(step.next, None);
    }

    #[test]
    fn kick_runs_for_configured_ticks() {
        let kick_ticks = BehaviorConfig::default().kick_ticks;
        let mut memory = StateMemory::default();
        let step = run(kick, None, None, &mut memory, false);
        assert!(matches!(step.drive, Some(Drive::Robot { speed, .. }) if speed == KICK_SPEED));

        memory.ticks = kick_ticks;
        let step = run(kick, None, None, &mut memory, false);
        assert_eq!(step.next, Some(BehaviorId::SearchBall));
    }

    #[test]
    fn square_turns_after_each_leg() {
        let legs = BehaviorConfig::default().square_leg_ticks;
        let mut memory = StateMemory::default();
        let mut directions = Vec::new();
        for _ in 0..(legs * 4 + 1) {
            if let Some(Drive::Field { direction, .. }) =
                run(move_in_square, None, None, &mut memory, false).drive
            {
                directions.push(direction);
            }
        }
        assert_eq!(directions[0], 0.0);
        assert_eq!(directions[legs as usize], 90.0);
        assert_eq!(directions[2 * legs as usize], 180.0);
        assert_eq!(directions[3 * legs as usize], -90.0);
        assert_eq!(directions[4 * legs as usize], 0.0);
    }

    #[test]
    fn return_home_heads_for_origin() {
        let mut memory = StateMemory::default();
        let fix = LocalizationFix {
            pose: Pose {
                x: 0.0,
                y: -2.0,
                heading_deg: 0.0,
            },
            confidence: 0.9,
        };
        let step = run(return_home, None, Some(&fix), &mut memory, false);
        match step.drive {
            Some(Drive::Robot { direction, speed, .. }) => {
                assert!((direction - 90.0).abs() < 1e-4);
                assert_eq!(speed, HOME_SPEED);
            }
            other => panic!("unexpected drive {other:?}"),
        }

        // Facing home already: straight ahead
        let facing = LocalizationFix {
            pose: Pose {
                heading_deg: 90.0,
                ..fix.pose
            },
            ..fix
        };
        let step = run(return_home, None, Some(&facing), &mut memory, false);
        assert!(
            matches!(step.drive, Some(Drive::Robot { direction, .. }) if direction.abs() < 1e-4)
        );

        let arrived = LocalizationFix {
            pose: Pose::default(),
            confidence: 0.9,
        };
        let step = run(return_home, None, Some(&arrived), &mut memory, false);
        assert_eq!(step.next, Some(BehaviorId::Stopped));
    }

    #[test]
    fn return_home_waits_without_pose() {
        let mut memory = StateMemory::default();
        assert_eq!(run(return_home, None, None, &mut memory, false), Step::halt());

        let shaky = LocalizationFix {
            pose: Pose {
                x: 3.0,
                y: 3.0,
                heading_deg: 0.0,
            },
            confidence: 0.1,
        };
        assert_eq!(
            run(return_home, None, Some(&shaky), &mut memory, false),
            Step::halt()
        );
    }
}
