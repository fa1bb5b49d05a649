// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user cron lease.
//!
//! At most one rollover may run for a user at a time. The lease is claimed
//! with a single conditional update that also stamps `last_cron_at`, so a
//! second request either sees the running lease or, once the first one has
//! finished, a `cron_epoch` that no longer matches what it loaded. Either way
//! it backs off without scoring.
//!
//! A lease that is never released (crashed process, failed save) lapses after
//! its TTL; [`CronGuard::force_release`] clears it immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::persistence::{CronLeaseClaim, Persistence, User};

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// A held cron lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronLease {
    /// User the lease is held for.
    pub user_id: String,
    /// Token proving ownership.
    pub token: String,
    /// Epoch written by the claim.
    pub epoch: i64,
    /// When the lease lapses.
    pub expires_at: DateTime<Utc>,
}

/// Claims and releases cron leases.
#[derive(Clone)]
pub struct CronGuard {
    persistence: Arc<dyn Persistence>,
    ttl: chrono::Duration,
}

impl std::fmt::Debug for CronGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronGuard")
            .field("persistence", &"...")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CronGuard {
    /// Create a guard whose leases last `ttl`.
    pub fn new(persistence: Arc<dyn Persistence>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        Self { persistence, ttl }
    }

    /// Try to claim the lease for `user`, as loaded by the caller.
    ///
    /// Returns `None` when another rollover holds an unexpired lease or has
    /// already run since `user` was loaded.
    pub async fn acquire(
        &self,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<Option<CronLease>, CoreError> {
        let claim = CronLeaseClaim {
            user_id: user.id.clone(),
            token: Uuid::new_v4().to_string(),
            expected_epoch: user.cron_epoch,
            now,
            expires_at: now + self.ttl,
        };

        if !self.persistence.try_acquire_cron_lease(&claim).await? {
            debug!(
                user_id = %user.id,
                expected_epoch = user.cron_epoch,
                "Cron lease already taken"
            );
            return Ok(None);
        }

        Ok(Some(CronLease {
            user_id: claim.user_id,
            token: claim.token,
            epoch: claim.expected_epoch + 1,
            expires_at: claim.expires_at,
        }))
    }

    /// Release a lease this guard acquired.
    ///
    /// Fails with [`CoreError::CronLeaseLost`] when the lease lapsed and was
    /// taken over in the meantime; the newer lease is left untouched.
    pub async fn release(&self, lease: &CronLease) -> Result<(), CoreError> {
        if self
            .persistence
            .release_cron_lease(&lease.user_id, &lease.token)
            .await?
        {
            return Ok(());
        }
        warn!(
            user_id = %lease.user_id,
            epoch = lease.epoch,
            "Cron lease was lost before release"
        );
        Err(CoreError::CronLeaseLost {
            user_id: lease.user_id.clone(),
        })
    }

    /// Clear whatever lease a user holds. Returns true if one was cleared.
    pub async fn force_release(&self, user_id: &str) -> Result<bool, CoreError> {
        let cleared = self.persistence.force_release_cron_lease(user_id).await?;
        if cleared {
            info!(user_id = %user_id, "Cron lease force-released");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CronState, SqlitePersistence};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<dyn Persistence>, CronGuard, User) {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::connect("sqlite::memory:").await.unwrap());
        let guard = CronGuard::new(persistence.clone(), Duration::from_secs(60));
        let user = User::new("user-1", t0());
        persistence.insert_user(&user).await.unwrap();
        (persistence, guard, user)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (persistence, guard, user) = setup().await;

        let lease = guard.acquire(&user, t0()).await.unwrap().unwrap();
        assert_eq!(lease.epoch, 1);
        assert_eq!(lease.expires_at, t0() + chrono::Duration::seconds(60));

        let running = persistence.get_user("user-1").await.unwrap().unwrap();
        assert_eq!(running.cron_state, CronState::Running);
        assert_eq!(running.last_cron_at, Some(t0()));
        assert_eq!(running.cron_lease_token.as_deref(), Some(lease.token.as_str()));

        guard.release(&lease).await.unwrap();
        let released = persistence.get_user("user-1").await.unwrap().unwrap();
        assert_eq!(released.cron_state, CronState::NotRunning);
        assert_eq!(released.cron_lease_token, None);
    }

    #[tokio::test]
    async fn test_second_acquire_with_same_snapshot_fails() {
        let (_persistence, guard, user) = setup().await;

        let first = guard.acquire(&user, t0()).await.unwrap();
        assert!(first.is_some());
        assert!(guard.acquire(&user, t0()).await.unwrap().is_none());

        // Even after release, the stale snapshot stays fenced out.
        guard.release(&first.unwrap()).await.unwrap();
        assert!(guard.acquire(&user, t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (persistence, guard, user) = setup().await;

        let stale = guard.acquire(&user, t0()).await.unwrap().unwrap();
        let reloaded = persistence.get_user("user-1").await.unwrap().unwrap();

        let later = t0() + chrono::Duration::seconds(30);
        assert!(guard.acquire(&reloaded, later).await.unwrap().is_none());

        let after_expiry = t0() + chrono::Duration::seconds(61);
        let fresh = guard.acquire(&reloaded, after_expiry).await.unwrap().unwrap();
        assert_eq!(fresh.epoch, 2);

        // The lapsed holder cannot clear the newer lease.
        let err = guard.release(&stale).await.unwrap_err();
        assert!(matches!(err, CoreError::CronLeaseLost { .. }));
        let holder = persistence.get_user("user-1").await.unwrap().unwrap();
        assert_eq!(holder.cron_lease_token.as_deref(), Some(fresh.token.as_str()));
    }

    #[tokio::test]
    async fn test_force_release_clears_stuck_lease() {
        let (persistence, guard, user) = setup().await;

        guard.acquire(&user, t0()).await.unwrap().unwrap();
        assert!(guard.force_release("user-1").await.unwrap());
        assert!(!guard.force_release("user-1").await.unwrap());

        let reloaded = persistence.get_user("user-1").await.unwrap().unwrap();
        assert_eq!(reloaded.cron_state, CronState::NotRunning);
        assert!(guard.acquire(&reloaded, t0()).await.unwrap().is_some());
    }
}
