//! Lease-based leader election for the recurring sweep
//!
//! Exactly one instance should run the SLA sweep and the assignment retry at
//! a time. An instance holds a lease for a lock key, renews it every tick, and
//! loses it if it stops renewing before the lease expires.
//!
//! The exactly-once guarantees for warnings and breaches do not depend on
//! this: the sweep's per-tracking compare-and-set already makes a second
//! sweeper harmless. Leadership only keeps the work from being duplicated.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Lock key for the SLA sweep
pub const SWEEP_LOCK: &str = "sla-sweep";

/// Lock key for the unassigned-ticket retry
pub const ASSIGNMENT_RETRY_LOCK: &str = "assignment-retry";

/// Error type for leader election
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaderError {
    #[error("Lease table lock poisoned")]
    LockPoisoned,

    #[error("Leader election backend unavailable: {0}")]
    Unavailable(String),
}

pub type LeaderResult<T> = Result<T, LeaderError>;

/// Outcome of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    Acquired {
        /// Presented on renew and release
        lease_token: String,
        lease_duration: Duration,
    },
    NotLeader { current_leader: Option<String> },
}

impl LeadershipResult {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipResult::Acquired { .. })
    }

    pub fn lease_token(&self) -> Option<&str> {
        match self {
            LeadershipResult::Acquired { lease_token, .. } => Some(lease_token),
            LeadershipResult::NotLeader { .. } => None,
        }
    }
}

/// Outcome of a renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// Expired or taken over
    Lost,
    InvalidToken,
}

impl RenewalResult {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RenewalResult::Renewed { .. })
    }
}

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Acquire the lease, or re-acquire it (with a fresh token) if this
    /// instance already holds it
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> LeaderResult<LeadershipResult>;

    /// Extend the lease without rotating its token
    async fn renew(&self, lock_key: &str, lease_token: &str) -> LeaderResult<RenewalResult>;

    /// Give the lease up. `false` if the token no longer matches.
    async fn release(&self, lock_key: &str, lease_token: &str) -> LeaderResult<bool>;

    async fn current_leader(&self, lock_key: &str) -> LeaderResult<Option<String>>;
}

#[derive(Debug, Clone)]
struct Lease {
    instance_id: String,
    token: String,
    expires_at: Instant,
}

/// Single-process elector. Leadership is not shared across processes; a
/// multi-instance deployment needs an elector backed by shared storage.
#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> LeaderError {
    LeaderError::LockPoisoned
}

impl InMemoryLeaderElector {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    fn grant(&self, instance_id: &str, now: Instant) -> Lease {
        Lease {
            instance_id: instance_id.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + self.lease_duration,
        }
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> LeaderResult<LeadershipResult> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Instant::now();

        if let Some(lease) = leases.get(lock_key) {
            if lease.expires_at > now && lease.instance_id != instance_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.instance_id.clone()),
                });
            }
        }

        // Free, expired, or already ours
        let lease = self.grant(instance_id, now);
        let lease_token = lease.token.clone();
        leases.insert(lock_key.to_string(), lease);
        Ok(LeadershipResult::Acquired {
            lease_token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> LeaderResult<RenewalResult> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Instant::now();

        let Some(lease) = leases.get_mut(lock_key) else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if lease.expires_at <= now {
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = now + self.lease_duration;
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> LeaderResult<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        match leases.get(lock_key) {
            Some(lease) if lease.token == lease_token => {
                leases.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_leader(&self, lock_key: &str) -> LeaderResult<Option<String>> {
        let leases = self.leases.read().map_err(poison_err)?;
        let now = Instant::now();
        Ok(leases
            .get(lock_key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.instance_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_when_free() {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(30));
        let result = elector.try_acquire(SWEEP_LOCK, "engine-1").await.unwrap();
        assert!(result.is_leader());
        assert!(result.lease_token().is_some());
        assert_eq!(
            elector.current_leader(SWEEP_LOCK).await.unwrap(),
            Some("engine-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_second_instance_is_not_leader() {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(30));
        assert!(elector
            .try_acquire(SWEEP_LOCK, "engine-1")
            .await
            .unwrap()
            .is_leader());

        let second = elector.try_acquire(SWEEP_LOCK, "engine-2").await.unwrap();
        assert_eq!(
            second,
            LeadershipResult::NotLeader {
                current_leader: Some("engine-1".to_string())
            }
        );

        // Lock keys are independent
        assert!(elector
            .try_acquire(ASSIGNMENT_RETRY_LOCK, "engine-2")
            .await
            .unwrap()
            .is_leader());
    }

    #[tokio::test]
    async fn test_reacquire_rotates_token() {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(30));
        let first = elector.try_acquire(SWEEP_LOCK, "engine-1").await.unwrap();
        let second = elector.try_acquire(SWEEP_LOCK, "engine-1").await.unwrap();
        let (t1, t2) = (first.lease_token().unwrap(), second.lease_token().unwrap());
        assert_ne!(t1, t2);

        assert_eq!(
            elector.renew(SWEEP_LOCK, t1).await.unwrap(),
            RenewalResult::InvalidToken
        );
        assert!(elector.renew(SWEEP_LOCK, t2).await.unwrap().is_renewed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(30));
        let first = elector.try_acquire(SWEEP_LOCK, "engine-1").await.unwrap();
        let token = first.lease_token().unwrap().to_string();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(elector.current_leader(SWEEP_LOCK).await.unwrap(), None);
        assert_eq!(
            elector.renew(SWEEP_LOCK, &token).await.unwrap(),
            RenewalResult::Lost
        );

        let takeover = elector.try_acquire(SWEEP_LOCK, "engine-2").await.unwrap();
        assert!(takeover.is_leader());
        assert!(!elector.release(SWEEP_LOCK, &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_the_lock() {
        let elector = InMemoryLeaderElector::new(Duration::from_secs(30));
        let first = elector.try_acquire(SWEEP_LOCK, "engine-1").await.unwrap();
        assert!(elector
            .release(SWEEP_LOCK, first.lease_token().unwrap())
            .await
            .unwrap());
        assert!(elector
            .try_acquire(SWEEP_LOCK, "engine-2")
            .await
            .unwrap()
            .is_leader());
    }
}
