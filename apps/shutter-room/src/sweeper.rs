use std::time::Duration;

use metrics::counter;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{RevokeReason, ServerMessage};
use crate::rooms::RoomHub;

impl RoomHub {
    /// Revokes every lease whose deadline passed before `now` and tells the
    /// room. Each candidate is rechecked under the guard, so a lease renewed or
    /// released since the scan is left alone. Returns the number revoked.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut revoked = 0;
        for (room, holder) in self.expired_leases(now) {
            if !self.revoke_expired(&room, &holder, now) {
                debug!(room = %room, device_id = %holder, "lease renewed before revocation");
                continue;
            }
            revoked += 1;
            counter!(
                "shutter_room_leases_revoked_total",
                1,
                "reason" => RevokeReason::Expired.as_str()
            );
            info!(room = %room, device_id = %holder, "lease expired");

            let notice = ServerMessage::RecorderRevoked {
                device_id: holder,
                reason: RevokeReason::Expired,
            };
            self.broadcast(&room, &notice, None);
            self.broadcast_roster(&room);
        }
        revoked
    }
}

/// Owned handle of the background expiry task.
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "expiry sweeper ended abnormally");
        }
    }
}

/// Starts the expiry sweeper on the hub's configured interval. Call once per
/// process; the task runs until [`SweeperHandle::shutdown`].
pub fn spawn_sweeper(hub: RoomHub) -> SweeperHandle {
    let period = hub.config().sweep_interval.max(Duration::from_millis(1));
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let task = tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "expiry sweeper started");
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = interval.tick() => {
                    counter!("shutter_room_sweep_cycles_total", 1);
                    let revoked = hub.sweep_expired(Instant::now());
                    if revoked > 0 {
                        debug!(revoked, "sweep cycle finished");
                    }
                }
            }
        }
        info!("expiry sweeper stopped");
    });
    SweeperHandle { token, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::rooms::test_support::connect;
    use axum::extract::ws::Message;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn frames(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|message| match message {
                Message::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn abandoned_lease_is_revoked_within_ttl_plus_one_sweep() {
        let hub = RoomHub::new(RoomConfig::default());
        let (d1, mut rx1, _) = connect(&hub, "acc:1", "d1");
        let (_d2, mut rx2, _) = connect(&hub, "acc:1", "d2");
        hub.join_role(&d1.key, "controller");
        hub.acquire_lease(&d1.key, Duration::from_secs(1));

        let sweeper = spawn_sweeper(hub.clone());
        time::sleep(Duration::from_millis(500)).await;
        assert!(hub.is_lease_holder(&d1.key.room, "d1"));

        time::sleep(Duration::from_secs(1) + hub.config().sweep_interval).await;
        assert!(!hub.is_lease_holder(&d1.key.room, "d1"));
        sweeper.shutdown().await;

        let revoked = json!({"type": "recorder_revoked", "device_id": "d1", "reason": "expired"});
        for rx in [&mut rx1, &mut rx2] {
            let seen = frames(rx);
            assert_eq!(seen[0], revoked);
            assert_eq!(seen[1]["type"], "roster_update");
            assert_eq!(seen[1]["lease_holder"], Value::Null);
            assert_eq!(seen[1]["controller"], "d1");
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn heartbeats_keep_the_lease_alive() {
        let hub = RoomHub::new(RoomConfig::default());
        let (d1, _rx, _) = connect(&hub, "acc:2", "d1");
        hub.join_role(&d1.key, "controller");
        hub.acquire_lease(&d1.key, Duration::from_secs(3));

        let sweeper = spawn_sweeper(hub.clone());
        for _ in 0..5 {
            time::sleep(Duration::from_secs(2)).await;
            assert!(hub.heartbeat_lease(&d1.key, Duration::from_secs(3)));
        }
        assert!(hub.is_lease_holder(&d1.key.room, "d1"));
        sweeper.shutdown().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn sweep_skips_rooms_without_expired_leases() {
        let hub = RoomHub::new(RoomConfig::default());
        let (a, _rx_a, _) = connect(&hub, "acc:3", "a");
        let (b, _rx_b, _) = connect(&hub, "acc:4", "b");
        hub.join_role(&a.key, "controller");
        hub.join_role(&b.key, "controller");
        hub.acquire_lease(&a.key, Duration::from_secs(1));
        hub.acquire_lease(&b.key, Duration::from_secs(60));

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(hub.sweep_expired(Instant::now()), 1);
        assert!(!hub.is_lease_holder(&a.key.room, "a"));
        assert!(hub.is_lease_holder(&b.key.room, "b"));
        assert_eq!(hub.sweep_expired(Instant::now()), 0);
    }
}
