// Behavior state machine
//
// Every state has a static descriptor (subsystem requirements, tick rate,
// ball-lost fallback, handler). The table is built once at startup from the
// configuration and never changes afterwards.

mod buttons;
mod machine;
mod states;

pub use buttons::{ActionTable, ButtonAction};
pub use machine::{Machine, MachineError};
pub use states::{BallTracker, Drive, HandlerFault, StateCtx, StateMemory, Step};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{BEHAVIOR_LOOP_HZ, BehaviorConfig};
use crate::lifecycle::{Requirement, SubsystemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorId {
    Stopped,
    SearchBall,
    ChaseBall,
    LineupKick,
    Kick,
    MoveInSquare,
    ReturnHome,
}

impl BehaviorId {
    pub const ALL: [BehaviorId; 7] = [
        BehaviorId::Stopped,
        BehaviorId::SearchBall,
        BehaviorId::ChaseBall,
        BehaviorId::LineupKick,
        BehaviorId::Kick,
        BehaviorId::MoveInSquare,
        BehaviorId::ReturnHome,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BehaviorId::Stopped => "stopped",
            BehaviorId::SearchBall => "search_ball",
            BehaviorId::ChaseBall => "chase_ball",
            BehaviorId::LineupKick => "lineup_kick",
            BehaviorId::Kick => "kick",
            BehaviorId::MoveInSquare => "move_in_square",
            BehaviorId::ReturnHome => "return_home",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BehaviorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BehaviorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BehaviorId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| format!("unknown behavior state '{s}'"))
    }
}

/// Pause toggles between these without changing the active state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Running,
    Paused,
}

pub type Handler = fn(&mut StateCtx<'_>) -> Result<Step, HandlerFault>;

pub struct StateDescriptor {
    pub id: BehaviorId,
    pub requirements: &'static [Requirement],
    pub tick_hz: u32,
    /// Where to go once the ball has been missing long enough
    pub ball_lost_fallback: Option<BehaviorId>,
    /// Zero the wheels on entry
    pub halt_on_entry: bool,
    pub handler: Handler,
}

impl StateDescriptor {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    pub fn is_mandatory(&self, subsystem: SubsystemId) -> bool {
        self.requirements
            .iter()
            .any(|r| r.subsystem == subsystem && r.mandatory)
    }
}

const NOTHING: &[Requirement] = &[];
const VISION: &[Requirement] = &[Requirement::mandatory(SubsystemId::Vision)];
const LOCALIZATION: &[Requirement] = &[Requirement::mandatory(SubsystemId::Localization)];
// Pose heading stands in when the heading sensor is silent
const POSE_IF_ANY: &[Requirement] = &[Requirement::optional(SubsystemId::Localization)];

pub struct DescriptorTable {
    entries: Vec<StateDescriptor>,
}

impl DescriptorTable {
    pub fn new(config: &BehaviorConfig) -> Self {
        let mut entries: Vec<StateDescriptor> = BehaviorId::ALL
            .into_iter()
            .map(default_descriptor)
            .collect();

        for (name, &fallback) in &config.ball_lost_fallback {
            // names are checked by RobotConfig::validate
            if let Ok(id) = name.parse::<BehaviorId>() {
                entries[id.index()].ball_lost_fallback = Some(fallback);
            }
        }
        Self { entries }
    }

    pub fn get(&self, id: BehaviorId) -> &StateDescriptor {
        &self.entries[id.index()]
    }
}

fn default_descriptor(id: BehaviorId) -> StateDescriptor {
    let handler: Handler = match id {
        BehaviorId::Stopped => states::stopped,
        BehaviorId::SearchBall => states::search_ball,
        BehaviorId::ChaseBall => states::chase_ball,
        BehaviorId::LineupKick => states::lineup_kick,
        BehaviorId::Kick => states::kick,
        BehaviorId::MoveInSquare => states::move_in_square,
        BehaviorId::ReturnHome => states::return_home,
    };
    let requirements = match id {
        BehaviorId::Stopped => NOTHING,
        BehaviorId::MoveInSquare => POSE_IF_ANY,
        BehaviorId::ReturnHome => LOCALIZATION,
        _ => VISION,
    };
    let tick_hz = match id {
        BehaviorId::Stopped => 10,
        BehaviorId::MoveInSquare | BehaviorId::ReturnHome => 20,
        _ => BEHAVIOR_LOOP_HZ,
    };
    let ball_lost_fallback = match id {
        BehaviorId::ChaseBall | BehaviorId::LineupKick => Some(BehaviorId::SearchBall),
        _ => None,
    };

    StateDescriptor {
        id,
        requirements,
        tick_hz,
        ball_lost_fallback,
        halt_on_entry: matches!(id, BehaviorId::Stopped),
        handler,
    }
}
