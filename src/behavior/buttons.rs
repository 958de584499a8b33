// Button actions and their dispatch table
//
// Action strings from the button collaborator are mapped to `ButtonAction`
// at ingress; the machine only indexes this table.

use serde::{Deserialize, Serialize};

use super::machine::Machine;
use crate::messages::ButtonPress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    TogglePause,
    EmergencyStop,
    ResetHeading,
    CycleMode,
}

impl ButtonAction {
    pub const ALL: [ButtonAction; 4] = [
        ButtonAction::TogglePause,
        ButtonAction::EmergencyStop,
        ButtonAction::ResetHeading,
        ButtonAction::CycleMode,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

pub type ActionHandler = fn(&mut Machine, &ButtonPress);

pub struct ActionTable {
    handlers: [ActionHandler; 4],
}

impl ActionTable {
    pub fn standard() -> Self {
        Self {
            handlers: ButtonAction::ALL.map(standard_handler),
        }
    }

    /// Replace the handler for one action
    pub fn with(mut self, action: ButtonAction, handler: ActionHandler) -> Self {
        self.handlers[action.index()] = handler;
        self
    }

    pub fn get(&self, action: ButtonAction) -> ActionHandler {
        self.handlers[action.index()]
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_handler(action: ButtonAction) -> ActionHandler {
    match action {
        ButtonAction::TogglePause => Machine::toggle_pause,
        ButtonAction::EmergencyStop => Machine::emergency_stop,
        ButtonAction::ResetHeading => Machine::reset_heading,
        ButtonAction::CycleMode => Machine::cycle_mode,
    }
}
