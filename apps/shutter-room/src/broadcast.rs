//! Room fan-out.
//!
//! Targets are snapshotted under the room guard, then frames are queued on
//! each connection's writer channel with the guard released. A connection
//! whose channel is closed or full counts as dead; once the whole attempt is
//! done, dead connections go through the ordinary `remove` path and the room
//! hears about any role or lease they took with them.

use axum::extract::ws::Message;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::{RevokeReason, ServerMessage};
use crate::rooms::{Departure, RoomHub, RoomKey};

impl RoomHub {
    /// Delivers `payload` to every connection in the room except
    /// `exclude_device_id`. Returns how many connections accepted it.
    pub fn broadcast<T: Serialize>(
        &self,
        room: &RoomKey,
        payload: &T,
        exclude_device_id: Option<&str>,
    ) -> usize {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(room = %room, error = %err, "failed to encode broadcast payload");
                return 0;
            }
        };

        let mut sent = 0usize;
        let mut dead = Vec::new();
        for target in self.targets(room, exclude_device_id) {
            match target.sender.try_send(Message::Text(text.clone())) {
                Ok(()) => sent += 1,
                Err(err) => {
                    let cause = match err {
                        TrySendError::Full(_) => "full",
                        TrySendError::Closed(_) => "closed",
                    };
                    counter!("shutter_room_broadcast_failures_total", 1, "cause" => cause);
                    warn!(
                        room = %room,
                        device_id = %target.key.device_id,
                        cause,
                        "dropping connection after failed delivery"
                    );
                    dead.push(target);
                }
            }
        }
        counter!("shutter_room_broadcast_deliveries_total", sent as u64);

        let departures: Vec<Departure> = dead
            .into_iter()
            .filter_map(|target| {
                target.closer.cancel();
                self.remove(&target.key, RevokeReason::Disconnected)
            })
            .collect();
        if !departures.is_empty() {
            counter!(
                "shutter_room_connections_evicted_total",
                departures.len() as u64
            );
            self.announce_departures(room, &departures);
        }

        sent
    }

    pub fn broadcast_roster(&self, room: &RoomKey) -> usize {
        let roster = self.roster(room);
        self.broadcast(room, &ServerMessage::RosterUpdate(roster), None)
    }

    /// Tells the rest of the room about connections that left: a revocation for
    /// each one that held the lease, then one fresh roster.
    pub fn announce_departures(&self, room: &RoomKey, departures: &[Departure]) {
        for departure in departures.iter().filter(|d| d.lease_released) {
            counter!("shutter_room_leases_revoked_total", 1, "reason" => departure.cause.as_str());
            self.broadcast(
                room,
                &ServerMessage::RecorderRevoked {
                    device_id: departure.device_id.clone(),
                    reason: departure.cause,
                },
                None,
            );
        }
        if departures.iter().any(|d| !d.room_closed) {
            let delivered = self.broadcast_roster(room);
            debug!(room = %room, delivered, "roster refreshed after departure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::rooms::test_support::connect;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    #[test_timeout::tokio_timeout_test]
    async fn excluded_device_does_not_get_its_own_message() {
        let hub = RoomHub::new(RoomConfig::default());
        let (d1, mut rx1, _) = connect(&hub, "acc:1", "d1");
        let (_d2, mut rx2, _) = connect(&hub, "acc:1", "d2");

        let payload = json!({"type": "take_photo", "origin_device_id": "d1"});
        let sent = hub.broadcast(&d1.key.room, &payload, Some("d1"));
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut rx2), vec![payload]);
        assert!(drain(&mut rx1).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcasts_stay_inside_their_room() {
        let hub = RoomHub::new(RoomConfig::default());
        let (a, _rx_a, _) = connect(&hub, "acc:1", "a");
        let (_b, mut rx_b, _) = connect(&hub, "acc:2", "b");

        hub.broadcast(&a.key.room, &json!({"type": "pong"}), None);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn dead_lease_holder_is_evicted_and_announced() {
        let hub = RoomHub::new(RoomConfig::default());
        let (d1, rx1, closer1) = connect(&hub, "acc:1", "d1");
        let (d2, mut rx2, _) = connect(&hub, "acc:1", "d2");
        hub.join_role(&d1.key, "controller");
        hub.acquire_lease(&d1.key, Duration::from_secs(20));

        drop(rx1);
        let sent = hub.broadcast(&d2.key.room, &json!({"type": "pong"}), None);
        assert_eq!(sent, 1);
        assert!(closer1.is_cancelled());
        assert!(!hub.is_connected(&d1.key));
        assert!(!hub.is_lease_holder(&d1.key.room, "d1"));

        let frames = drain(&mut rx2);
        assert_eq!(frames[0], json!({"type": "pong"}));
        assert_eq!(
            frames[1],
            json!({"type": "recorder_revoked", "device_id": "d1", "reason": "disconnected"})
        );
        assert_eq!(frames[2]["type"], "roster_update");
        assert_eq!(frames[2]["controller"], Value::Null);
        assert_eq!(frames[2]["counts"]["connections"], 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn superseded_lease_holder_is_announced() {
        let hub = RoomHub::new(RoomConfig::default());
        let (d1, mut old_rx, old_closer) = connect(&hub, "acc:1", "d1");
        let (_d2, mut rx2, _) = connect(&hub, "acc:1", "d2");
        hub.join_role(&d1.key, "controller");
        hub.acquire_lease(&d1.key, Duration::from_secs(20));
        drain(&mut rx2);

        let (again, _rx, _) = connect(&hub, "acc:1", "d1");
        assert!(old_closer.is_cancelled());
        assert!(matches!(
            old_rx.try_recv(),
            Ok(Message::Close(Some(frame))) if frame.code == axum::extract::ws::close_code::POLICY
        ));
        let departure = again.superseded.clone().unwrap();
        assert!(departure.lease_released);
        assert_eq!(departure.cause, RevokeReason::Superseded);

        hub.announce_departures(&again.key.room, &[departure]);
        let frames = drain(&mut rx2);
        assert_eq!(
            frames[0],
            json!({"type": "recorder_revoked", "device_id": "d1", "reason": "superseded"})
        );
        assert_eq!(frames[1]["type"], "roster_update");
        assert_eq!(frames[1]["lease_holder"], Value::Null);
        assert_eq!(frames[1]["controller"], Value::Null);
        assert_eq!(frames[1]["counts"]["connections"], 2);
        assert!(!hub.is_lease_holder(&again.key.room, "d1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn a_full_buffer_counts_as_a_failed_delivery() {
        let hub = RoomHub::new(RoomConfig::default());
        let room = crate::rooms::RoomKey::parse("acc:8").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let closer = tokio_util::sync::CancellationToken::new();
        let slow = hub.add(&room, crate::rooms::Connection::new("slow", tx, closer.clone()));

        assert_eq!(hub.broadcast(&room, &json!({"type": "pong"}), None), 1);
        assert_eq!(hub.broadcast(&room, &json!({"type": "pong"}), None), 0);
        assert!(closer.is_cancelled());
        assert!(!hub.is_connected(&slow.key));
        assert_eq!(hub.room_count(), 0);
    }
}
