mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{BusLog, FakeLauncher, LaunchLog, RecordingDriver, wait_until};
use soccerbot_runtime::behavior::{BehaviorId, ButtonAction, Machine, MachineError, RunMode};
use soccerbot_runtime::config::RobotConfig;
use soccerbot_runtime::context::RobotContext;
use soccerbot_runtime::health::{Component, ComponentHealth, HealthState};
use soccerbot_runtime::inputs::{self, InputChannels};
use soccerbot_runtime::lifecycle::{LifecycleManager, SubsystemId};
use soccerbot_runtime::messages::{
    BallObservation, ButtonPress, ExternalEvent, LocalizationFix, Pose, VisionFrame,
};
use soccerbot_runtime::motor::{
    MotorHandle, MotorWorker, WheelSpeeds, WorkerSettings, robot_relative,
};

const WAIT: Duration = Duration::from_secs(2);

struct Rig {
    machine: Machine,
    inputs: InputChannels,
    ctx: RobotContext,
    motor: MotorHandle,
    health: Arc<ComponentHealth>,
    launches: Arc<LaunchLog>,
    _bus: Arc<BusLog>,
}

fn rig(behavior: &str) -> Rig {
    rig_with(behavior, |_| {})
}

fn rig_with(behavior: &str, prepare: impl FnOnce(&LaunchLog)) -> Rig {
    rig_from(common::config(behavior), prepare)
}

fn rig_from(config: RobotConfig, prepare: impl FnOnce(&LaunchLog)) -> Rig {
    let (driver, bus) = RecordingDriver::new();
    let motor = MotorWorker::start(
        driver,
        WorkerSettings {
            loop_hz: 200,
            watchdog: config.watchdog(),
        },
    )
    .unwrap();

    let health = Arc::new(ComponentHealth::new());
    let (launcher, launches) = FakeLauncher::new();
    prepare(&launches);
    let lifecycle = LifecycleManager::new(Box::new(launcher), Arc::clone(&health));

    let (inputs, drain) = inputs::channel(8);
    let ctx = RobotContext::new(config, Arc::clone(&motor), Arc::clone(&health));
    let machine = Machine::new(ctx.clone(), lifecycle, drain);

    Rig {
        machine,
        inputs,
        ctx,
        motor,
        health,
        launches,
        _bus: bus,
    }
}

impl Rig {
    async fn press(&self, action: ButtonAction) {
        self.inputs
            .publish(ExternalEvent::ButtonPress(ButtonPress {
                action,
                timestamp: 0.0,
            }))
            .await;
    }

    async fn see(&self, ball: Option<BallObservation>) {
        let frame = VisionFrame {
            ball: ball.unwrap_or_default(),
            ..Default::default()
        };
        self.inputs.publish(ExternalEvent::VisionFrame(frame)).await;
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.machine.tick().unwrap();
        }
    }

    fn wheels_settle_on(&self, expected: WheelSpeeds) -> bool {
        wait_until(WAIT, || {
            let speeds = self.motor.status().speeds;
            speeds
                .as_array()
                .iter()
                .zip(expected.as_array())
                .all(|(a, b)| (a - b).abs() < 1e-4)
        })
    }

    fn wheels_moving(&self) -> bool {
        wait_until(WAIT, || !self.motor.status().speeds.is_zero())
    }
}

fn far_ball() -> BallObservation {
    BallObservation {
        detected: true,
        angle_deg: 5.0,
        distance_px: 400.0,
        close_and_centered: false,
    }
}

#[tokio::test]
async fn ball_lost_needs_a_sustained_run_of_misses() {
    let mut rig = rig("[behavior]\ninitial_state = \"chase_ball\"\nball_lost_ticks = 3\n");
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);

    rig.see(Some(far_ball())).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);

    rig.see(None).await;
    rig.ticks(2);
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);

    // A detection in between resets the count
    rig.see(Some(far_ball())).await;
    rig.ticks(1);
    rig.see(None).await;
    rig.ticks(2);
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);

    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::SearchBall);
}

#[tokio::test]
async fn ball_lost_fallback_is_configurable() {
    let mut rig = rig(
        "[behavior]\ninitial_state = \"chase_ball\"\nball_lost_ticks = 1\n\
         [behavior.ball_lost_fallback]\nchase_ball = \"return_home\"\n",
    );
    rig.see(None).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::ReturnHome);
    assert!(rig.machine.lifecycle().is_running(SubsystemId::Localization));
    assert!(!rig.machine.lifecycle().is_running(SubsystemId::Vision));
}

#[tokio::test]
async fn pause_halts_and_resume_restores_the_same_drive() {
    let mut rig = rig("[behavior]\ninitial_state = \"chase_ball\"\n");
    rig.see(Some(far_ball())).await;
    rig.ticks(1);
    assert!(rig.wheels_moving());
    let chasing = rig.motor.status().speeds;

    rig.press(ButtonAction::TogglePause).await;
    rig.ticks(1);
    assert_eq!(rig.machine.mode(), RunMode::Paused);
    assert!(rig.wheels_settle_on(WheelSpeeds::zero()));

    rig.ticks(3);
    assert!(rig.wheels_settle_on(WheelSpeeds::zero()));
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);

    rig.press(ButtonAction::TogglePause).await;
    rig.ticks(1);
    assert_eq!(rig.machine.mode(), RunMode::Running);
    assert_eq!(rig.machine.state(), BehaviorId::ChaseBall);
    assert!(rig.wheels_settle_on(chasing));
}

#[tokio::test]
async fn emergency_stop_zeroes_wheels_and_idles() {
    let mut rig = rig("[behavior]\ninitial_state = \"move_in_square\"\n");
    rig.ticks(1);
    assert!(rig.wheels_moving());

    rig.press(ButtonAction::EmergencyStop).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::Stopped);
    assert!(rig.wheels_settle_on(WheelSpeeds::zero()));
}

#[tokio::test]
async fn cycle_mode_walks_the_configured_states() {
    let mut rig = rig("[behavior]\ncycle = [\"search_ball\", \"move_in_square\"]\n");
    assert_eq!(rig.machine.state(), BehaviorId::Stopped);

    rig.press(ButtonAction::CycleMode).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::SearchBall);
    assert_eq!(rig.launches.starts(SubsystemId::Vision), 1);

    rig.press(ButtonAction::CycleMode).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::MoveInSquare);
    assert_eq!(rig.launches.stops(SubsystemId::Vision), 1);

    rig.press(ButtonAction::CycleMode).await;
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::SearchBall);
    assert_eq!(rig.launches.starts(SubsystemId::Vision), 2);
}

#[tokio::test]
async fn handler_fault_stops_motors_before_reporting() {
    let mut rig = rig("[behavior]\ninitial_state = \"return_home\"\n");
    let fix = |x: f32| LocalizationFix {
        pose: Pose {
            x,
            y: 0.0,
            heading_deg: 0.0,
        },
        confidence: 1.0,
    };

    rig.inputs
        .publish(ExternalEvent::LocalizationFix(fix(2.0)))
        .await;
    rig.ticks(1);
    assert!(rig.wheels_moving());

    rig.inputs
        .publish(ExternalEvent::LocalizationFix(fix(f32::NAN)))
        .await;
    let err = rig.machine.tick().unwrap_err();
    assert!(matches!(
        err,
        MachineError::HandlerFault {
            state: BehaviorId::ReturnHome,
            ..
        }
    ));
    assert!(rig.wheels_settle_on(WheelSpeeds::zero()));
}

#[tokio::test]
async fn mandatory_subsystem_failure_falls_back_to_idle() {
    let rig = rig_with("[behavior]\ninitial_state = \"search_ball\"\n", |log| {
        log.fail(SubsystemId::Vision)
    });
    assert_eq!(rig.machine.state(), BehaviorId::Stopped);
    assert_eq!(rig.health.get(Component::Vision), HealthState::Unavailable);
    assert!(rig.machine.lifecycle().running().is_empty());
}

#[tokio::test]
async fn dead_mandatory_subsystem_ends_the_state() {
    let mut rig = rig("[behavior]\ninitial_state = \"search_ball\"\n");
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::SearchBall);

    rig.launches.kill(SubsystemId::Vision);
    rig.ticks(1);
    assert_eq!(rig.machine.state(), BehaviorId::Stopped);
    assert_eq!(rig.launches.stops(SubsystemId::Vision), 1);
    assert!(rig.wheels_settle_on(WheelSpeeds::zero()));
}

#[tokio::test]
async fn field_drive_is_corrected_by_heading() {
    let mut rig = rig("[behavior]\ninitial_state = \"move_in_square\"\n");

    // First leg drives field 0°; facing 90° that is a strafe to the right
    rig.inputs.publish(ExternalEvent::Heading(90.0)).await;
    rig.ticks(1);
    assert!(rig.wheels_settle_on(robot_relative(-90.0, 0.4, 0.0)));
    assert_eq!(rig.machine.heading(), Some(90.0));

    // After a reset the current facing is field 0°
    rig.press(ButtonAction::ResetHeading).await;
    rig.ticks(1);
    assert_eq!(rig.machine.heading(), Some(0.0));
    assert!(rig.wheels_settle_on(robot_relative(0.0, 0.4, 0.0)));
}

#[tokio::test]
async fn return_home_ignores_the_field_heading_offset() {
    let mut rig = rig("[behavior]\ninitial_state = \"return_home\"\n");
    // Two meters short of home, already facing it
    let fix = LocalizationFix {
        pose: Pose {
            x: 0.0,
            y: -2.0,
            heading_deg: 90.0,
        },
        confidence: 1.0,
    };
    rig.inputs.publish(ExternalEvent::Heading(90.0)).await;
    rig.inputs.publish(ExternalEvent::LocalizationFix(fix)).await;
    rig.ticks(1);
    assert!(rig.wheels_settle_on(robot_relative(0.0, 0.5, 0.0)));

    rig.press(ButtonAction::ResetHeading).await;
    rig.ticks(1);
    assert_eq!(rig.machine.heading(), Some(0.0));
    assert_eq!(rig.machine.state(), BehaviorId::ReturnHome);
    assert!(rig.wheels_settle_on(robot_relative(0.0, 0.5, 0.0)));
}

#[tokio::test]
async fn idle_and_paused_keep_the_watchdog_fed() {
    let mut config = common::config("");
    config.motor.watchdog_ms = 200;
    let mut rig = rig_from(config, |_| {});
    assert_eq!(rig.machine.state(), BehaviorId::Stopped);

    for _ in 0..30 {
        rig.ticks(1);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!rig.motor.status().watchdog_tripped);

    rig.press(ButtonAction::TogglePause).await;
    for _ in 0..30 {
        rig.ticks(1);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(rig.machine.mode(), RunMode::Paused);
    assert!(!rig.motor.status().watchdog_tripped);
    assert!(rig.motor.status().speeds.is_zero());
}

#[tokio::test]
async fn failed_optional_helper_is_not_relaunched() {
    let mut rig = rig_with(
        "[behavior]\ninitial_state = \"move_in_square\"\ncycle = [\"move_in_square\", \"stopped\"]\n",
        |log| log.fail(SubsystemId::Localization),
    );
    assert_eq!(rig.machine.state(), BehaviorId::MoveInSquare);
    assert_eq!(rig.health.get(Component::Localization), HealthState::Unavailable);
    assert_eq!(rig.launches.attempts(SubsystemId::Localization), 1);

    for _ in 0..2 {
        rig.press(ButtonAction::CycleMode).await;
        rig.ticks(1);
    }
    assert_eq!(rig.machine.state(), BehaviorId::MoveInSquare);
    assert_eq!(rig.launches.attempts(SubsystemId::Localization), 1);
}

#[tokio::test]
async fn field_drive_without_heading_is_flagged() {
    let mut rig = rig("[behavior]\ninitial_state = \"move_in_square\"\n");
    rig.ticks(1);
    assert!(rig.wheels_settle_on(robot_relative(0.0, 0.4, 0.0)));
    assert_eq!(rig.health.get(Component::Heading), HealthState::Unavailable);
}

#[tokio::test]
async fn snapshot_reflects_the_running_machine() {
    let mut rig = rig("[behavior]\ninitial_state = \"move_in_square\"\n");
    rig.press(ButtonAction::TogglePause).await;
    rig.ticks(1);

    let snapshot = rig.ctx.snapshot();
    assert_eq!(snapshot.state, BehaviorId::MoveInSquare);
    assert_eq!(snapshot.mode, RunMode::Paused);
    assert_eq!(snapshot.health.len(), Component::ALL.len());

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["state"], "move_in_square");
    assert_eq!(json["mode"], "paused");
}
