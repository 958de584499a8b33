// Component availability, recorded once by the owner and queried by state logic

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Actuation,
    Vision,
    Localization,
    Heading,
    RangeSensors,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Actuation,
        Component::Vision,
        Component::Localization,
        Component::Heading,
        Component::RangeSensors,
    ];

    /// Only actuation is critical; everything else degrades gracefully
    pub fn is_critical(self) -> bool {
        matches!(self, Component::Actuation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Started, no data seen yet
    Unknown,
    Ok,
    Unavailable,
    /// Not running because no active state needs it
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEntry {
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct ComponentHealth {
    entries: RwLock<BTreeMap<Component, HealthEntry>>,
}

impl ComponentHealth {
    pub fn new() -> Self {
        let entries = Component::ALL
            .into_iter()
            .map(|c| {
                (
                    c,
                    HealthEntry {
                        state: HealthState::Idle,
                        detail: None,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Record a new state; logs only when it changes
    pub fn set(&self, component: Component, state: HealthState, detail: Option<String>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(component).or_insert(HealthEntry {
            state: HealthState::Idle,
            detail: None,
        });
        if entry.state == state && entry.detail == detail {
            return;
        }

        let detail_text = detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default();
        match state {
            HealthState::Unavailable if component.is_critical() => {
                error!(component = ?component, "Critical component unavailable{}", detail_text)
            }
            HealthState::Unavailable => {
                warn!(component = ?component, "Component unavailable{}", detail_text)
            }
            _ => info!(component = ?component, "Component {:?}", state),
        }
        entry.state = state;
        entry.detail = detail;
    }

    pub fn get(&self, component: Component) -> HealthState {
        self.entries
            .read()
            .get(&component)
            .map(|e| e.state)
            .unwrap_or(HealthState::Idle)
    }

    pub fn snapshot(&self) -> BTreeMap<Component, HealthEntry> {
        self.entries.read().clone()
    }
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self::new()
    }
}
