use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub const CONTROLLER_MAX: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    Participant,
}

impl Role {
    /// Accepts the canonical names and the legacy `recorder` / `shooter` ones.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "controller" | "recorder" => Some(Role::Controller),
            "participant" | "shooter" => Some(Role::Participant),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Participant => "participant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinReason {
    Ok,
    InvalidRole,
    ControllerFull,
    ParticipantFull,
}

impl JoinReason {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinReason::Ok => "ok",
            JoinReason::InvalidRole => "invalid_role",
            JoinReason::ControllerFull => "controller_full",
            JoinReason::ParticipantFull => "participant_full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLimits {
    pub controller_max: usize,
    pub participant_max: usize,
}

impl RoleLimits {
    pub fn new(participant_max: usize) -> Self {
        Self {
            controller_max: CONTROLLER_MAX,
            participant_max,
        }
    }
}

/// Result of a role request against one room's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub granted: bool,
    pub reason: JoinReason,
    /// Role the device gave up to take the requested one.
    pub left: Option<Role>,
}

impl SlotGrant {
    fn granted(left: Option<Role>) -> Self {
        Self {
            granted: true,
            reason: JoinReason::Ok,
            left,
        }
    }

    fn denied(reason: JoinReason) -> Self {
        Self {
            granted: false,
            reason,
            left: None,
        }
    }
}

/// Controller and participant slots of a single room. A device holds at most
/// one of the two.
#[derive(Debug, Default)]
pub struct RoleSlots {
    controller: Option<String>,
    participants: BTreeSet<String>,
}

impl RoleSlots {
    pub fn join(&mut self, device_id: &str, role: Role, participant_max: usize) -> SlotGrant {
        let current = self.role_of(device_id);
        if current == Some(role) {
            return SlotGrant::granted(None);
        }

        match role {
            Role::Controller => {
                if self.controller.is_some() {
                    return SlotGrant::denied(JoinReason::ControllerFull);
                }
                let left = self.release(device_id);
                self.controller = Some(device_id.to_string());
                SlotGrant::granted(left)
            }
            Role::Participant => {
                if self.participants.len() >= participant_max {
                    return SlotGrant::denied(JoinReason::ParticipantFull);
                }
                let left = self.release(device_id);
                self.participants.insert(device_id.to_string());
                SlotGrant::granted(left)
            }
        }
    }

    pub fn release(&mut self, device_id: &str) -> Option<Role> {
        if self.controller.as_deref() == Some(device_id) {
            self.controller = None;
            return Some(Role::Controller);
        }
        if self.participants.remove(device_id) {
            return Some(Role::Participant);
        }
        None
    }

    pub fn role_of(&self, device_id: &str) -> Option<Role> {
        if self.controller.as_deref() == Some(device_id) {
            Some(Role::Controller)
        } else if self.participants.contains(device_id) {
            Some(Role::Participant)
        } else {
            None
        }
    }

    pub fn is_controller(&self, device_id: &str) -> bool {
        self.controller.as_deref() == Some(device_id)
    }

    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    /// Participants in sorted order.
    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    #[cfg(test)]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}
