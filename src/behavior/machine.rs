// Behavior state machine driver
//
// One tick: drain inputs, dispatch button presses, run the active state's
// handler, apply at most one transition. Never blocks on I/O; lifecycle
// changes may block briefly, and only on a transition tick.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::buttons::ActionTable;
use super::states::{BallTracker, Drive, StateCtx, StateMemory, Step};
use super::{BehaviorId, DescriptorTable, RunMode, StateDescriptor};
use crate::context::RobotContext;
use crate::health::{Component, HealthState};
use crate::inputs::{InputDrain, InputFrame};
use crate::lifecycle::LifecycleManager;
use crate::messages::ButtonPress;
use crate::motor::kinematics::wrap_degrees;
use crate::motor::{WheelSpeeds, field_relative, robot_relative};

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("state {state} faulted: {reason}")]
    HandlerFault { state: BehaviorId, reason: String },
}

pub struct Machine {
    ctx: RobotContext,
    table: DescriptorTable,
    actions: ActionTable,
    lifecycle: LifecycleManager,
    inputs: InputDrain,
    frame: InputFrame,
    state: BehaviorId,
    mode: RunMode,
    tracker: BallTracker,
    memory: StateMemory,
    /// Raw heading that counts as field 0°
    heading_offset: f32,
    /// Transition asked for by a button or a dead subsystem this tick
    requested: Option<BehaviorId>,
    heading_seen: bool,
}

impl Machine {
    pub fn new(ctx: RobotContext, lifecycle: LifecycleManager, inputs: InputDrain) -> Self {
        Self::with_actions(ctx, lifecycle, inputs, ActionTable::standard())
    }

    /// Enter the configured initial state with a custom button table
    pub fn with_actions(
        ctx: RobotContext,
        lifecycle: LifecycleManager,
        inputs: InputDrain,
        actions: ActionTable,
    ) -> Self {
        let behavior = &ctx.config.behavior;
        let table = DescriptorTable::new(behavior);
        let tracker = BallTracker::new(behavior.ball_lost_ticks);
        let initial = behavior.initial_state;

        let mut machine = Self {
            ctx,
            table,
            actions,
            lifecycle,
            inputs,
            frame: InputFrame::default(),
            state: BehaviorId::Stopped,
            mode: RunMode::Running,
            tracker,
            memory: StateMemory::default(),
            heading_offset: 0.0,
            requested: None,
            heading_seen: false,
        };
        info!("Starting in state {}", initial);
        machine.activate(initial);
        machine
    }

    pub fn tick(&mut self) -> Result<(), MachineError> {
        self.inputs.drain(&mut self.frame);
        if self.frame.heading.is_some() && !self.heading_seen {
            self.heading_seen = true;
            self.ctx.health.set(Component::Heading, HealthState::Ok, None);
        }

        let presses = std::mem::take(&mut self.frame.buttons);
        for press in &presses {
            debug!(action = ?press.action, "Button press");
            let handler = self.actions.get(press.action);
            handler(self, press);
        }

        for subsystem in self.lifecycle.poll() {
            if self.descriptor().is_mandatory(subsystem) {
                error!(
                    state = %self.state,
                    "Mandatory subsystem {} stopped, falling back to idle",
                    subsystem
                );
                self.requested.get_or_insert(BehaviorId::Stopped);
            }
        }

        let mut next = self.requested.take();
        if next.is_none() {
            match self.mode {
                RunMode::Running => {
                    let step = self.run_handler()?;
                    if let Some(drive) = step.drive {
                        self.apply(drive);
                    }
                    next = step.next;
                }
                RunMode::Paused => self.apply(Drive::Halt),
            }
        }

        if let Some(next) = next.filter(|n| *n != self.state) {
            self.transition(next);
        }
        self.ctx.board.set(self.state, self.mode);
        Ok(())
    }

    pub fn state(&self) -> BehaviorId {
        self.state
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn tick_period(&self) -> Duration {
        self.descriptor().tick_period()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Heading in the field frame, if any telemetry is available
    pub fn heading(&self) -> Option<f32> {
        self.raw_heading()
            .map(|h| wrap_degrees(h - self.heading_offset))
    }

    /// Ask for a transition on the next tick
    pub fn request(&mut self, next: BehaviorId) {
        self.requested = Some(next);
    }

    /// Stop all helpers and zero the wheels
    pub fn shutdown(&mut self) {
        self.ctx.motor.stop();
        self.lifecycle.shutdown_all();
    }

    pub fn toggle_pause(&mut self, _press: &ButtonPress) {
        match self.mode {
            RunMode::Running => {
                self.ctx.motor.stop();
                self.mode = RunMode::Paused;
                info!(state = %self.state, "Paused");
            }
            RunMode::Paused => {
                self.mode = RunMode::Running;
                info!(state = %self.state, "Resumed");
            }
        }
    }

    pub fn emergency_stop(&mut self, _press: &ButtonPress) {
        self.ctx.motor.stop();
        warn!(state = %self.state, "Emergency stop");
        self.mode = RunMode::Running;
        self.requested = Some(BehaviorId::Stopped);
    }

    pub fn reset_heading(&mut self, _press: &ButtonPress) {
        match self.raw_heading() {
            Some(raw) => {
                self.heading_offset = raw;
                info!("Field heading reset, raw {:.1}° is now 0°", raw);
            }
            None => warn!("Cannot reset heading: no heading telemetry"),
        }
    }

    pub fn cycle_mode(&mut self, _press: &ButtonPress) {
        let cycle = &self.ctx.config.behavior.cycle;
        let current = self.requested.unwrap_or(self.state);
        let next = cycle
            .iter()
            .position(|s| *s == current)
            .map(|i| cycle[(i + 1) % cycle.len()])
            .or_else(|| cycle.first().copied());
        if let Some(next) = next {
            info!("Mode cycled to {}", next);
            self.requested = Some(next);
        }
    }

    fn descriptor(&self) -> &StateDescriptor {
        self.table.get(self.state)
    }

    fn raw_heading(&self) -> Option<f32> {
        self.frame
            .heading
            .or_else(|| self.frame.localization.map(|fix| fix.pose.heading_deg))
    }

    fn run_handler(&mut self) -> Result<Step, MachineError> {
        let (handler, fallback) = {
            let descriptor = self.descriptor();
            (descriptor.handler, descriptor.ball_lost_fallback)
        };

        let detected = self.frame.vision.is_some_and(|v| v.ball.detected);
        self.tracker.observe(detected);
        let heading = self.heading();

        let mut ctx = StateCtx {
            vision: self.frame.vision.as_ref(),
            localization: self.frame.localization.as_ref(),
            heading,
            ball_lost: self.tracker.is_lost(),
            fallback,
            memory: &mut self.memory,
            tuning: &self.ctx.config.behavior,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx)));
        self.memory.ticks = self.memory.ticks.saturating_add(1);

        match outcome {
            Ok(Ok(step)) => Ok(step),
            Ok(Err(fault)) => Err(self.fault(fault.to_string())),
            Err(payload) => Err(self.fault(panic_message(payload.as_ref()))),
        }
    }

    /// Motors first, then report
    fn fault(&self, reason: String) -> MachineError {
        self.ctx.motor.stop();
        error!(state = %self.state, "Handler fault, motors stopped: {}", reason);
        MachineError::HandlerFault {
            state: self.state,
            reason,
        }
    }

    fn apply(&mut self, drive: Drive) {
        let speeds = match drive {
            Drive::Robot {
                direction,
                speed,
                rotation,
            } => robot_relative(direction, speed, rotation),
            Drive::Field {
                direction,
                speed,
                rotation,
            } => {
                let heading = self.heading().unwrap_or_else(|| {
                    self.ctx.health.set(
                        Component::Heading,
                        HealthState::Unavailable,
                        Some("no heading telemetry, driving robot-relative".to_string()),
                    );
                    0.0
                });
                field_relative(direction, speed, rotation, heading)
            }
            Drive::Halt => WheelSpeeds::zero(),
        };
        self.ctx.motor.enqueue(speeds);
    }

    fn transition(&mut self, next: BehaviorId) {
        info!("Transition {} -> {}", self.state, next);
        self.exit();
        self.activate(next);
    }

    fn exit(&mut self) {
        debug!(
            state = %self.state,
            ticks = self.memory.ticks,
            "Leaving state"
        );
    }

    /// Bring up the state's subsystems and enter it. A state whose mandatory
    /// subsystem cannot start is never entered; the robot idles instead.
    fn activate(&mut self, next: BehaviorId) {
        let requirements = self.table.get(next).requirements;
        match self.lifecycle.ensure(requirements) {
            Ok(()) => self.enter(next),
            Err(e) => {
                error!("Cannot enter {}: {}", next, e);
                let idle = self.table.get(BehaviorId::Stopped).requirements;
                if let Err(e) = self.lifecycle.ensure(idle) {
                    error!("Failed to release subsystems: {}", e);
                }
                self.enter(BehaviorId::Stopped);
            }
        }
    }

    fn enter(&mut self, next: BehaviorId) {
        self.state = next;
        self.memory = StateMemory::default();
        self.tracker.reset();
        if self.descriptor().halt_on_entry {
            self.ctx.motor.stop();
        }
        self.ctx.board.set(self.state, self.mode);
        debug!(state = %next, "Entered state");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
