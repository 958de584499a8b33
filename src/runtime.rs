// Startup, behavior loop, shutdown
//
// Order matters: the motor worker and the safety hooks are up before anything
// that could command motion, and the wheels are zeroed before the bus is
// released on the way out.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::behavior::{Machine, MachineError};
use crate::config::{BUTTON_QUEUE_DEPTH, ConfigError, RobotConfig};
use crate::context::RobotContext;
use crate::health::{Component, ComponentHealth, HealthState};
use crate::inputs::{self, ButtonMapper};
use crate::lifecycle::{LifecycleManager, ProcessLauncher};
use crate::motor::{FeetechError, FeetechWheels, MotorWorker, WorkerError, WorkerSettings};
use crate::safety::{SafetyGuard, TriggerReason};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("wheel bus: {0}")]
    Bus(#[from] FeetechError),

    #[error("motor worker: {0}")]
    Worker(#[from] WorkerError),

    #[error("zenoh: {0}")]
    Transport(String),

    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Fault(#[from] MachineError),
}

impl RuntimeError {
    /// Process exit code: 1 for a failed start, 2 for a fault while running
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Fault(_) => 2,
            _ => 1,
        }
    }
}

pub async fn run(config: RobotConfig) -> Result<(), RuntimeError> {
    config.validate()?;
    let wheels = config.motor.wheel_map()?;
    let health = Arc::new(ComponentHealth::new());

    let driver = FeetechWheels::open(
        &config.motor.port,
        config.motor.baudrate,
        wheels,
        config.motor.max_raw,
    )?;
    let motor = MotorWorker::start(
        driver,
        WorkerSettings {
            loop_hz: config.motor.loop_hz,
            watchdog: config.watchdog(),
        },
    )?;
    health.set(Component::Actuation, HealthState::Ok, None);

    let safety = SafetyGuard::new(Arc::clone(&motor));
    safety.install_signal_handler()?;
    safety.install_panic_hook();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default())
        .await
        .map_err(|e| RuntimeError::Transport(e.to_string()))?;

    let (channels, drain) = inputs::channel(BUTTON_QUEUE_DEPTH);
    let topics = config.topics.clone();
    tokio::spawn(inputs::forward_buttons(
        session.clone(),
        topics.button.clone(),
        ButtonMapper::new(config.buttons.clone()),
        channels.clone(),
    ));
    tokio::spawn(inputs::forward_heading(
        session.clone(),
        topics.heading.clone(),
        channels.clone(),
    ));

    let launcher = ProcessLauncher::new(
        session.clone(),
        Handle::current(),
        config.subsystems.clone(),
        topics.clone(),
        channels,
    );
    let lifecycle = LifecycleManager::new(Box::new(launcher), Arc::clone(&health));

    let ctx = RobotContext::new(config, Arc::clone(&motor), health);
    tokio::spawn(serve_snapshots(session.clone(), topics.snapshot.clone(), ctx.clone()));

    info!("Subscribed to: {}, {}", topics.button, topics.heading);
    info!("Snapshots on: {}", topics.snapshot);

    let mut machine = Machine::new(ctx, lifecycle, drain);
    let result = drive(&mut machine, &safety).await;

    if let Err(e) = &result {
        error!("Behavior loop ended: {}", e);
        safety.trigger(TriggerReason::Fault);
    }
    info!("Shutting down...");
    machine.shutdown();
    motor.shutdown();
    if let Err(e) = session.close().await {
        warn!("Failed to close Zenoh session: {}", e);
    }
    info!("Shutdown complete");
    result.map_err(RuntimeError::from)
}

/// Tick the machine at its active state's rate until a fault or a safety stop
async fn drive(machine: &mut Machine, safety: &SafetyGuard) -> Result<(), MachineError> {
    let mut period = machine.tick_period();
    let mut tick = ticker(period);
    info!("Behavior loop running at {:?}", period);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = safety.triggered() => {
                info!("Safety stop ({:?}), leaving behavior loop", safety.reason());
                return Ok(());
            }
        }

        machine.tick()?;

        let next = machine.tick_period();
        if next != period {
            period = next;
            tick = ticker(period);
        }
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

/// Answer debug dashboard queries with the current snapshot
async fn serve_snapshots(session: zenoh::Session, topic: String, ctx: RobotContext) {
    let queryable = match session.declare_queryable(topic.as_str()).await {
        Ok(q) => q,
        Err(e) => {
            warn!("Cannot serve snapshots on {}: {}", topic, e);
            return;
        }
    };

    while let Ok(query) = queryable.recv_async().await {
        let json = match serde_json::to_string(&ctx.snapshot()) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode snapshot: {}", e);
                continue;
            }
        };
        if let Err(e) = query.reply(query.key_expr().clone(), json).await {
            warn!("Failed to reply to snapshot query: {}", e);
        }
    }
}
