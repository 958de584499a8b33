// Helper subsystem lifecycle
//
// Each behavior state declares which helpers (vision, localization) it
// needs. On every transition the manager starts what is newly required and
// stops what is no longer needed, so at most one handle per subsystem is
// ever alive and nothing keeps running unsupervised.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SubsystemsConfig, Topics};
use crate::health::{Component, ComponentHealth, HealthState};
use crate::inputs::{InputChannels, decode_subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemId {
    Vision,
    Localization,
}

impl SubsystemId {
    pub fn component(self) -> Component {
        match self {
            SubsystemId::Vision => Component::Vision,
            SubsystemId::Localization => Component::Localization,
        }
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsystemId::Vision => f.write_str("vision"),
            SubsystemId::Localization => f.write_str("localization"),
        }
    }
}

/// A subsystem a state depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub subsystem: SubsystemId,
    /// The state cannot run without it
    pub mandatory: bool,
}

impl Requirement {
    pub const fn mandatory(subsystem: SubsystemId) -> Self {
        Self {
            subsystem,
            mandatory: true,
        }
    }

    pub const fn optional(subsystem: SubsystemId) -> Self {
        Self {
            subsystem,
            mandatory: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to spawn {subsystem}: {source}")]
    Spawn {
        subsystem: SubsystemId,
        #[source]
        source: std::io::Error,
    },

    #[error("mandatory subsystem {subsystem} unavailable: {reason}")]
    MandatoryUnavailable {
        subsystem: SubsystemId,
        reason: String,
    },
}

/// A running helper as seen by the manager
pub trait SubsystemProcess: Send {
    fn is_alive(&mut self) -> bool;

    /// Whether any data has arrived since launch
    fn heartbeat(&self) -> bool;

    /// Stop the helper and release its channels. Called exactly once.
    fn terminate(&mut self);
}

pub trait SubsystemLauncher: Send {
    fn launch(&mut self, subsystem: SubsystemId) -> Result<Box<dyn SubsystemProcess>, LifecycleError>;
}

/// Live handle for one subsystem
pub struct ManagedSubsystem {
    pub id: SubsystemId,
    process: Box<dyn SubsystemProcess>,
    started_at: Instant,
    healthy: bool,
}

pub struct LifecycleManager {
    launcher: Box<dyn SubsystemLauncher>,
    running: BTreeMap<SubsystemId, ManagedSubsystem>,
    health: Arc<ComponentHealth>,
}

impl LifecycleManager {
    pub fn new(launcher: Box<dyn SubsystemLauncher>, health: Arc<ComponentHealth>) -> Self {
        Self {
            launcher,
            running: BTreeMap::new(),
            health,
        }
    }

    /// Make the running set match `requirements`.
    ///
    /// Unneeded subsystems are stopped first. A failed optional start is
    /// only logged and marked unavailable, and is not retried while health
    /// still reports it unavailable. A failed mandatory start is returned as
    /// an error; mandatory helpers are always retried.
    pub fn ensure(&mut self, requirements: &[Requirement]) -> Result<(), LifecycleError> {
        let unneeded: Vec<SubsystemId> = self
            .running
            .keys()
            .copied()
            .filter(|id| !requirements.iter().any(|r| r.subsystem == *id))
            .collect();
        for id in unneeded {
            self.stop(id);
        }

        let mut failure = None;
        for req in requirements {
            if self.running.contains_key(&req.subsystem) {
                continue;
            }
            let component = req.subsystem.component();
            if !req.mandatory && self.health.get(component) == HealthState::Unavailable {
                debug!("Optional subsystem {} marked unavailable, not starting", req.subsystem);
                continue;
            }
            match self.start(req.subsystem) {
                Ok(()) => {}
                Err(e) if req.mandatory => {
                    error!("Mandatory subsystem {} failed to start: {}", req.subsystem, e);
                    failure.get_or_insert(LifecycleError::MandatoryUnavailable {
                        subsystem: req.subsystem,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Optional subsystem {} failed to start: {}", req.subsystem, e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Check liveness of everything running. Dead subsystems are removed and
    /// returned so the caller can react.
    pub fn poll(&mut self) -> Vec<SubsystemId> {
        let mut dead = Vec::new();
        for (id, managed) in self.running.iter_mut() {
            if !managed.process.is_alive() {
                dead.push(*id);
                continue;
            }
            if !managed.healthy && managed.process.heartbeat() {
                managed.healthy = true;
                debug!(
                    "{} first data after {:?}",
                    id,
                    managed.started_at.elapsed()
                );
                self.health.set(id.component(), HealthState::Ok, None);
            }
        }

        for id in &dead {
            if let Some(mut managed) = self.running.remove(id) {
                managed.process.terminate();
            }
            self.health.set(
                id.component(),
                HealthState::Unavailable,
                Some("stopped unexpectedly".to_string()),
            );
        }
        dead
    }

    pub fn is_running(&self, subsystem: SubsystemId) -> bool {
        self.running.contains_key(&subsystem)
    }

    pub fn running(&self) -> Vec<SubsystemId> {
        self.running.keys().copied().collect()
    }

    pub fn shutdown_all(&mut self) {
        let ids: Vec<_> = self.running.keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    fn start(&mut self, id: SubsystemId) -> Result<(), LifecycleError> {
        info!("Starting subsystem {}", id);
        match self.launcher.launch(id) {
            Ok(process) => {
                self.running.insert(
                    id,
                    ManagedSubsystem {
                        id,
                        process,
                        started_at: Instant::now(),
                        healthy: false,
                    },
                );
                self.health.set(id.component(), HealthState::Unknown, None);
                Ok(())
            }
            Err(e) => {
                self.health
                    .set(id.component(), HealthState::Unavailable, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn stop(&mut self, id: SubsystemId) {
        if let Some(mut managed) = self.running.remove(&id) {
            info!("Stopping subsystem {}", id);
            managed.process.terminate();
            self.health.set(id.component(), HealthState::Idle, None);
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Launches helpers as child processes and attaches a zenoh forwarder for
/// their output topic
pub struct ProcessLauncher {
    session: zenoh::Session,
    runtime: Handle,
    specs: SubsystemsConfig,
    topics: Topics,
    inputs: InputChannels,
}

impl ProcessLauncher {
    pub fn new(
        session: zenoh::Session,
        runtime: Handle,
        specs: SubsystemsConfig,
        topics: Topics,
        inputs: InputChannels,
    ) -> Self {
        Self {
            session,
            runtime,
            specs,
            topics,
            inputs,
        }
    }
}

impl SubsystemLauncher for ProcessLauncher {
    fn launch(&mut self, subsystem: SubsystemId) -> Result<Box<dyn SubsystemProcess>, LifecycleError> {
        let (spec, topic) = match subsystem {
            SubsystemId::Vision => (&self.specs.vision, self.topics.vision.clone()),
            SubsystemId::Localization => (&self.specs.localization, self.topics.localization.clone()),
        };

        let child = match spec.command.split_first() {
            Some((program, args)) => {
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(|source| LifecycleError::Spawn { subsystem, source })?;
                info!("Spawned {} (pid {})", subsystem, child.id());
                Some(child)
            }
            None => {
                debug!("{} has no command, attaching to {} only", subsystem, topic);
                None
            }
        };

        let heartbeat = Arc::new(AtomicBool::new(false));
        let forwarder = self.runtime.spawn(forward_subsystem(
            self.session.clone(),
            subsystem,
            topic,
            self.inputs.clone(),
            Arc::clone(&heartbeat),
        ));

        Ok(Box::new(HelperProcess {
            id: subsystem,
            child,
            forwarder,
            heartbeat,
            inputs: self.inputs.clone(),
        }))
    }
}

struct HelperProcess {
    id: SubsystemId,
    child: Option<Child>,
    forwarder: JoinHandle<()>,
    heartbeat: Arc<AtomicBool>,
    inputs: InputChannels,
}

impl SubsystemProcess for HelperProcess {
    fn is_alive(&mut self) -> bool {
        if self.forwarder.is_finished() {
            return false;
        }
        match self.child.as_mut().map(|c| c.try_wait()) {
            None => true,
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!("{} exited with {}", self.id, status);
                false
            }
            Some(Err(e)) => {
                warn!("Cannot query {} process: {}", self.id, e);
                false
            }
        }
    }

    fn heartbeat(&self) -> bool {
        self.heartbeat.load(Ordering::Acquire)
    }

    fn terminate(&mut self) {
        self.forwarder.abort();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("{} already gone: {}", self.id, e);
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap {}: {}", self.id, e);
            }
        }
        self.inputs.clear(self.id);
    }
}

async fn forward_subsystem(
    session: zenoh::Session,
    subsystem: SubsystemId,
    topic: String,
    inputs: InputChannels,
    heartbeat: Arc<AtomicBool>,
) {
    let subscriber = match session.declare_subscriber(topic.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot subscribe to {} for {}: {}", topic, subsystem, e);
            return;
        }
    };
    debug!("Forwarding {} from {}", subsystem, topic);

    while let Ok(sample) = subscriber.recv_async().await {
        let payload = sample.payload().to_bytes();
        if let Some(event) = decode_subsystem(subsystem, &payload) {
            heartbeat.store(true, Ordering::Release);
            inputs.publish(event).await;
        }
    }
}
