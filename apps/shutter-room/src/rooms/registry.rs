use std::borrow::Cow;

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Departure, Room, RoomHub, RoomKey};
use crate::protocol::RevokeReason;

pub type ConnectionId = Uuid;

/// A live duplex channel to a device, as handed to the registry.
pub struct Connection {
    pub id: ConnectionId,
    pub device_id: String,
    pub sender: mpsc::Sender<Message>,
    pub closer: CancellationToken,
}

impl Connection {
    pub fn new(
        device_id: impl Into<String>,
        sender: mpsc::Sender<Message>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            sender,
            closer,
        }
    }
}

/// Identifies one registered connection. Operations through a key whose
/// connection has been superseded are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub room: RoomKey,
    pub device_id: String,
    pub connection_id: ConnectionId,
}

pub struct Registration {
    pub key: ConnectionKey,
    /// Set when an older connection for the same device was closed.
    pub superseded: Option<Departure>,
}

pub(super) struct ConnectionEntry {
    pub(super) id: ConnectionId,
    pub(super) sender: mpsc::Sender<Message>,
    pub(super) closer: CancellationToken,
    pub(super) joined_at: DateTime<Utc>,
    pub(super) last_seen: Instant,
}

/// Snapshot of one delivery target, taken under the guard.
pub(crate) struct Target {
    pub(crate) key: ConnectionKey,
    pub(crate) sender: mpsc::Sender<Message>,
    pub(crate) closer: CancellationToken,
}

impl RoomHub {
    /// Registers a connection, creating the room if needed. An existing
    /// connection for the same device is replaced in the same critical section
    /// and closed afterwards; its role and lease are released.
    pub fn add(&self, room: &RoomKey, connection: Connection) -> Registration {
        let Connection {
            id,
            device_id,
            sender,
            closer,
        } = connection;
        let key = ConnectionKey {
            room: room.clone(),
            device_id: device_id.clone(),
            connection_id: id,
        };
        let entry = ConnectionEntry {
            id,
            sender,
            closer,
            joined_at: Utc::now(),
            last_seen: Instant::now(),
        };

        let (previous, departure, rooms_active) = {
            let mut rooms = self.inner.rooms.lock();
            let state = rooms.entry(room.clone()).or_insert_with(Room::default);
            let previous = state.connections.insert(device_id.clone(), entry);
            let departure = previous.as_ref().map(|_| {
                let (role, lease_released) = state.release_device(&device_id);
                Departure {
                    device_id: device_id.clone(),
                    cause: RevokeReason::Superseded,
                    role,
                    lease_released,
                    room_closed: false,
                }
            });
            (previous, departure, rooms.len())
        };

        gauge!("shutter_room_rooms_active", rooms_active as f64);
        counter!("shutter_room_connections_registered_total", 1);

        if let Some(old) = previous {
            counter!("shutter_room_connections_superseded_total", 1);
            info!(
                room = %room,
                device_id = %device_id,
                previous = %old.id,
                connection_id = %id,
                "connection superseded"
            );
            close_entry(&old, close_code::POLICY, "superseded");
        } else {
            info!(
                room = %room,
                device_id = %device_id,
                connection_id = %id,
                "connection registered"
            );
        }

        Registration {
            key,
            superseded: departure,
        }
    }

    /// Removes the connection if it is still the registered one for its
    /// device, releasing its role and lease. Discards the room when it empties.
    pub fn remove(&self, key: &ConnectionKey, cause: RevokeReason) -> Option<Departure> {
        let (entry, departure, rooms_active) = {
            let mut rooms = self.inner.rooms.lock();
            let state = rooms.get_mut(&key.room)?;
            match state.connections.get(&key.device_id) {
                Some(entry) if entry.id == key.connection_id => {}
                _ => return None,
            }
            let entry = state.connections.remove(&key.device_id)?;
            let (role, lease_released) = state.release_device(&key.device_id);
            let room_closed = state.connections.is_empty();
            if room_closed {
                rooms.remove(&key.room);
            }
            (
                entry,
                Departure {
                    device_id: key.device_id.clone(),
                    cause,
                    role,
                    lease_released,
                    room_closed,
                },
                rooms.len(),
            )
        };

        gauge!("shutter_room_rooms_active", rooms_active as f64);
        info!(
            room = %key.room,
            device_id = %key.device_id,
            connection_id = %key.connection_id,
            connected_secs = (Utc::now() - entry.joined_at).num_seconds(),
            idle_ms = entry.last_seen.elapsed().as_millis() as u64,
            lease_released = departure.lease_released,
            room_closed = departure.room_closed,
            "connection removed"
        );
        Some(departure)
    }

    /// Records liveness for the connection; unknown connections are ignored.
    pub fn touch(&self, key: &ConnectionKey) -> bool {
        let now = Instant::now();
        let mut rooms = self.inner.rooms.lock();
        let Some(entry) = rooms
            .get_mut(&key.room)
            .and_then(|state| state.connections.get_mut(&key.device_id))
            .filter(|entry| entry.id == key.connection_id)
        else {
            return false;
        };
        entry.last_seen = now;
        true
    }

    #[cfg(test)]
    pub fn is_connected(&self, key: &ConnectionKey) -> bool {
        self.with_current(key, |_| ()).is_some()
    }

    pub fn connection_count(&self, room: &RoomKey) -> usize {
        self.inner
            .rooms
            .lock()
            .get(room)
            .map_or(0, |state| state.connections.len())
    }

    /// Join time and last liveness touch of a registered connection.
    #[cfg(test)]
    pub fn connection_times(&self, key: &ConnectionKey) -> Option<(DateTime<Utc>, Instant)> {
        let rooms = self.inner.rooms.lock();
        rooms
            .get(&key.room)
            .and_then(|state| state.connections.get(&key.device_id))
            .filter(|entry| entry.id == key.connection_id)
            .map(|entry| (entry.joined_at, entry.last_seen))
    }

    pub(crate) fn targets(&self, room: &RoomKey, exclude: Option<&str>) -> Vec<Target> {
        let rooms = self.inner.rooms.lock();
        let Some(state) = rooms.get(room) else {
            return Vec::new();
        };
        state
            .connections
            .iter()
            .filter(|(device_id, _)| Some(device_id.as_str()) != exclude)
            .map(|(device_id, entry)| Target {
                key: ConnectionKey {
                    room: room.clone(),
                    device_id: device_id.clone(),
                    connection_id: entry.id,
                },
                sender: entry.sender.clone(),
                closer: entry.closer.clone(),
            })
            .collect()
    }
}

fn close_entry(entry: &ConnectionEntry, code: u16, reason: &'static str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }));
    if entry.sender.try_send(frame).is_err() {
        debug!(connection_id = %entry.id, "close frame not queued; writer already gone");
    }
    entry.closer.cancel();
}
