//! Authoritative per-room state: connections, role slots, the operational
//! lease and the upload sequence counter.
//!
//! Every room lives in one table behind a single `parking_lot::Mutex`. The
//! guard is only taken inside synchronous methods, so it can never be held
//! across an `.await`; network delivery happens on per-connection writer tasks
//! fed through channels (see `broadcast`).

mod key;
mod lease;
mod registry;
mod roles;

use std::{collections::HashMap, sync::Arc, time::Duration};

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RoomConfig;
use crate::protocol::{LeaseDenial, RevokeReason};

pub use key::{parse_device_id, ParamError, RoomKey, MAX_DEVICE_ID_LEN};
pub use lease::{AcquireOutcome, Lease, LeaseSlot};
pub use registry::{Connection, ConnectionId, ConnectionKey, Registration};
pub use roles::{JoinReason, Role, RoleLimits, RoleSlots, SlotGrant, CONTROLLER_MAX};

use registry::ConnectionEntry;

#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    rooms: Mutex<HashMap<RoomKey, Room>>,
    config: RoomConfig,
}

#[derive(Default)]
struct Room {
    connections: HashMap<String, ConnectionEntry>,
    roles: RoleSlots,
    lease: LeaseSlot,
    photo_seq: u64,
}

impl Room {
    fn roster(&self) -> Roster {
        let participants: Vec<String> = self.roles.participants().map(str::to_string).collect();
        let controller = self.roles.controller().map(str::to_string);
        Roster {
            counts: RosterCounts {
                controller: usize::from(controller.is_some()),
                participant: participants.len(),
                connections: self.connections.len(),
            },
            controller,
            lease_holder: self.lease.holder().map(str::to_string),
            participants,
        }
    }

    /// Drops every role and lease the device holds.
    fn release_device(&mut self, device_id: &str) -> (Option<Role>, bool) {
        let role = self.roles.release(device_id);
        let lease_released = self.lease.release(device_id);
        (role, lease_released)
    }
}

/// Read-only snapshot of a room's role and lease assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub controller: Option<String>,
    pub lease_holder: Option<String>,
    pub participants: Vec<String>,
    pub counts: RosterCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterCounts {
    pub controller: usize,
    pub participant: usize,
    pub connections: usize,
}

/// What a connection took with it when it left a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub device_id: String,
    pub cause: RevokeReason,
    pub role: Option<Role>,
    pub lease_released: bool,
    pub room_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub granted: bool,
    pub reason: JoinReason,
    pub role: Option<Role>,
    pub limits: RoleLimits,
    /// The device held the lease and gave up the controller slot.
    pub lease_revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    Granted { ttl: Duration, renewed: bool },
    Denied {
        reason: LeaseDenial,
        holder: Option<String>,
    },
}

impl RoomHub {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    pub fn limits(&self) -> RoleLimits {
        RoleLimits::new(self.inner.config.participant_max)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.lock().len()
    }

    pub fn roster(&self, room: &RoomKey) -> Roster {
        self.inner
            .rooms
            .lock()
            .get(room)
            .map(Room::roster)
            .unwrap_or_default()
    }

    /// Runs `f` against the room of a connection that is still the registered
    /// one for its device. `None` once it has been superseded or
    /// removed.
    fn with_current<T>(
        &self,
        key: &ConnectionKey,
        f: impl FnOnce(&mut Room) -> T,
    ) -> Option<T> {
        let mut rooms = self.inner.rooms.lock();
        let room = rooms.get_mut(&key.room)?;
        let entry = room.connections.get(&key.device_id)?;
        if entry.id != key.connection_id {
            return None;
        }
        Some(f(room))
    }

    pub fn join_role(&self, key: &ConnectionKey, role_name: &str) -> Option<JoinOutcome> {
        let limits = self.limits();
        let Some(role) = Role::parse(role_name) else {
            counter!("shutter_room_joins_total", 1, "outcome" => "invalid_role");
            return Some(JoinOutcome {
                granted: false,
                reason: JoinReason::InvalidRole,
                role: None,
                limits,
                lease_revoked: false,
            });
        };

        let outcome = self.with_current(key, |room| {
            let grant = room.roles.join(&key.device_id, role, limits.participant_max);
            let lease_revoked = grant.left == Some(Role::Controller)
                && room.lease.release(&key.device_id);
            JoinOutcome {
                granted: grant.granted,
                reason: grant.reason,
                role: grant.granted.then_some(role),
                limits,
                lease_revoked,
            }
        })?;

        counter!("shutter_room_joins_total", 1, "outcome" => outcome.reason.as_str());
        if outcome.granted {
            info!(
                room = %key.room,
                device_id = %key.device_id,
                role = role.as_str(),
                "role granted"
            );
        } else {
            info!(
                room = %key.room,
                device_id = %key.device_id,
                role = role.as_str(),
                reason = outcome.reason.as_str(),
                "role denied"
            );
        }
        Some(outcome)
    }

    /// Grants or renews the lease for the room's controller. The role check and
    /// the grant happen under the same guard.
    pub fn acquire_lease(&self, key: &ConnectionKey, ttl: Duration) -> Option<LeaseDecision> {
        let now = Instant::now();
        let decision = self.with_current(key, |room| {
            if !room.roles.is_controller(&key.device_id) {
                return LeaseDecision::Denied {
                    reason: LeaseDenial::NotController,
                    holder: room.lease.holder().map(str::to_string),
                };
            }
            match room.lease.acquire(&key.device_id, ttl, now) {
                AcquireOutcome::Granted { renewed, .. } => LeaseDecision::Granted { ttl, renewed },
                AcquireOutcome::Denied { holder } => LeaseDecision::Denied {
                    reason: LeaseDenial::Held,
                    holder: Some(holder),
                },
            }
        })?;

        match &decision {
            LeaseDecision::Granted { ttl, renewed } => {
                counter!("shutter_room_leases_granted_total", 1, "renewed" => renewed.to_string());
                info!(
                    room = %key.room,
                    device_id = %key.device_id,
                    ttl_ms = ttl.as_millis() as u64,
                    renewed,
                    "lease granted"
                );
            }
            LeaseDecision::Denied { reason, holder } => {
                counter!("shutter_room_leases_denied_total", 1, "reason" => format!("{reason:?}"));
                debug!(
                    room = %key.room,
                    device_id = %key.device_id,
                    ?reason,
                    ?holder,
                    "lease denied"
                );
            }
        }
        Some(decision)
    }

    /// Extends the lease if the connection's device holds it.
    pub fn heartbeat_lease(&self, key: &ConnectionKey, ttl: Duration) -> bool {
        let now = Instant::now();
        self.with_current(key, |room| room.lease.heartbeat(&key.device_id, ttl, now))
            .unwrap_or(false)
    }

    pub fn release_lease(&self, key: &ConnectionKey) -> bool {
        let released = self
            .with_current(key, |room| room.lease.release(&key.device_id))
            .unwrap_or(false);
        if released {
            info!(room = %key.room, device_id = %key.device_id, "lease released");
        }
        released
    }

    pub fn is_lease_holder(&self, room: &RoomKey, device_id: &str) -> bool {
        self.inner
            .rooms
            .lock()
            .get(room)
            .is_some_and(|state| state.lease.is_holder(device_id))
    }

    /// Role held by the connection; `None` when it holds none or is no longer
    /// registered.
    pub fn current_role(&self, key: &ConnectionKey) -> Option<Role> {
        self.with_current(key, |room| room.roles.role_of(&key.device_id))
            .flatten()
    }

    /// Next upload sequence number of the connection's room, starting at 1.
    pub fn next_photo_seq(&self, key: &ConnectionKey) -> Option<u64> {
        self.with_current(key, |room| {
            room.photo_seq += 1;
            room.photo_seq
        })
    }

    /// Rooms whose lease deadline has passed, with the holder seen at scan time.
    pub fn expired_leases(&self, now: Instant) -> Vec<(RoomKey, String)> {
        self.inner
            .rooms
            .lock()
            .iter()
            .filter_map(|(key, room)| {
                room.lease
                    .expired_holder(now)
                    .map(|holder| (key.clone(), holder.to_string()))
            })
            .collect()
    }

    /// Clears the lease if `holder` still has it and it is still expired.
    pub fn revoke_expired(&self, room: &RoomKey, holder: &str, now: Instant) -> bool {
        self.inner
            .rooms
            .lock()
            .get_mut(room)
            .is_some_and(|state| state.lease.revoke_if_expired(holder, now))
    }
}
