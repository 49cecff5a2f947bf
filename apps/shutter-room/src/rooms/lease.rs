use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub granted_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted { deadline: Instant, renewed: bool },
    Denied { holder: String },
}

/// The exclusive operational lease of one room. Role-agnostic: callers decide
/// who may ask for it.
#[derive(Debug, Default)]
pub struct LeaseSlot {
    current: Option<Lease>,
}

impl LeaseSlot {
    /// Grants an unheld lease, renews it for its holder, or reports the holder.
    pub fn acquire(&mut self, device_id: &str, ttl: Duration, now: Instant) -> AcquireOutcome {
        match self.current.as_mut() {
            Some(lease) if lease.holder == device_id => {
                lease.deadline = now + ttl;
                AcquireOutcome::Granted {
                    deadline: lease.deadline,
                    renewed: true,
                }
            }
            Some(lease) => AcquireOutcome::Denied {
                holder: lease.holder.clone(),
            },
            None => {
                let deadline = now + ttl;
                self.current = Some(Lease {
                    holder: device_id.to_string(),
                    granted_at: now,
                    deadline,
                });
                AcquireOutcome::Granted {
                    deadline,
                    renewed: false,
                }
            }
        }
    }

    /// Extends the deadline for the holder; anyone else is ignored.
    pub fn heartbeat(&mut self, device_id: &str, ttl: Duration, now: Instant) -> bool {
        match self.current.as_mut() {
            Some(lease) if lease.holder == device_id => {
                lease.deadline = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, device_id: &str) -> bool {
        if self.is_holder(device_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn is_holder(&self, device_id: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|lease| lease.holder == device_id)
    }

    pub fn holder(&self) -> Option<&str> {
        self.current.as_ref().map(|lease| lease.holder.as_str())
    }

    #[cfg(test)]
    pub fn lease(&self) -> Option<&Lease> {
        self.current.as_ref()
    }

    /// Holder whose deadline has passed at `now`.
    pub fn expired_holder(&self, now: Instant) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|lease| lease.deadline < now)
            .map(|lease| lease.holder.as_str())
    }

    /// Clears the lease only if `holder` still has it and it is still past its
    /// deadline; a renewal or release since the scan wins.
    pub fn revoke_if_expired(&mut self, holder: &str, now: Instant) -> bool {
        if self.expired_holder(now) == Some(holder) {
            self.current = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(20);

    #[test_timeout::tokio_timeout_test(paused)]
    async fn acquire_grants_then_denies_others() {
        let now = Instant::now();
        let mut slot = LeaseSlot::default();

        assert_eq!(
            slot.acquire("d1", TTL, now),
            AcquireOutcome::Granted {
                deadline: now + TTL,
                renewed: false
            }
        );
        assert_eq!(
            slot.acquire("d2", TTL, now),
            AcquireOutcome::Denied {
                holder: "d1".into()
            }
        );
        assert!(slot.is_holder("d1"));
        assert!(!slot.is_holder("d2"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn reacquire_only_extends_the_deadline() {
        let start = Instant::now();
        let mut slot = LeaseSlot::default();
        slot.acquire("d1", TTL, start);

        let later = start + Duration::from_secs(5);
        let outcome = slot.acquire("d1", TTL, later);
        assert_eq!(
            outcome,
            AcquireOutcome::Granted {
                deadline: later + TTL,
                renewed: true
            }
        );
        let lease = slot.lease().unwrap();
        assert_eq!(lease.granted_at, start);
        assert!(lease.deadline >= lease.granted_at);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stale_heartbeat_and_release_are_ignored() {
        let now = Instant::now();
        let mut slot = LeaseSlot::default();

        assert!(!slot.heartbeat("d1", TTL, now));
        assert!(slot.holder().is_none());

        slot.acquire("d1", TTL, now);
        let before = slot.lease().cloned();
        assert!(!slot.heartbeat("d2", TTL, now + Duration::from_secs(1)));
        assert!(!slot.release("d2"));
        assert_eq!(slot.lease().cloned(), before);

        assert!(slot.heartbeat("d1", TTL, now + Duration::from_secs(3)));
        assert_eq!(
            slot.lease().unwrap().deadline,
            now + Duration::from_secs(3) + TTL
        );
        assert!(slot.release("d1"));
        assert!(slot.holder().is_none());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn expiry_is_rechecked_before_revoking() {
        let now = Instant::now();
        let ttl = Duration::from_secs(1);
        let mut slot = LeaseSlot::default();
        slot.acquire("d1", ttl, now);

        assert_eq!(slot.expired_holder(now + ttl), None);
        let scan = now + Duration::from_secs(2);
        assert_eq!(slot.expired_holder(scan), Some("d1"));

        // Renewed between the scan and the clear.
        slot.heartbeat("d1", ttl, scan);
        assert!(!slot.revoke_if_expired("d1", scan));
        assert!(slot.is_holder("d1"));

        assert!(slot.revoke_if_expired("d1", scan + Duration::from_secs(2)));
        assert!(slot.holder().is_none());
    }
}
