use serde::{Deserialize, Serialize};

use crate::machine::MachineState;

/// Agent-published report of a unit's state in the local supervisor.
/// Authoritative only from the agent owning the job's target machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    #[serde(default)]
    pub sockets: Vec<String>,
    pub machine_state: Option<MachineState>,
}

impl UnitState {
    pub fn new(load_state: &str, active_state: &str, sub_state: &str) -> Self {
        Self {
            load_state: load_state.to_string(),
            active_state: active_state.to_string(),
            sub_state: sub_state.to_string(),
            sockets: Vec::new(),
            machine_state: None,
        }
    }

    pub fn with_machine(mut self, ms: MachineState) -> Self {
        self.machine_state = Some(ms);
        self
    }

    /// Whether the owning supervisor reports the unit as running.
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}
