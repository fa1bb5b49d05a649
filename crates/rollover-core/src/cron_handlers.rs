// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollover trigger handlers.
//!
//! [`trigger_rollover`] is the single entry point that runs a user's daily
//! rollover end to end: resolve missed days, claim the cron lease, score,
//! save, propagate, release. It is safe to call on every request a user
//! makes; duplicates and same-day calls return without side effects beyond
//! the lease stamp.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::calendar::days_missed;
use crate::classify::classify;
use crate::error::{CoreError, Result};
use crate::guard::{CronGuard, CronLease};
use crate::persistence::{Persistence, User};
use crate::propagation::{QuestProgress, RetentionPolicy, propagate};
use crate::rollover;

/// Shared state for the cron handlers.
#[derive(Clone)]
pub struct CronHandlerState {
    /// Persistence implementation.
    pub persistence: Arc<dyn Persistence>,
    /// Lease guard.
    pub guard: CronGuard,
    /// To-do retention windows.
    pub retention: RetentionPolicy,
}

impl std::fmt::Debug for CronHandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronHandlerState")
            .field("persistence", &"...")
            .field("guard", &self.guard)
            .field("retention", &self.retention)
            .finish()
    }
}

impl CronHandlerState {
    /// Create handler state with the given lease lifetime and retention windows.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        lease_ttl: Duration,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            guard: CronGuard::new(persistence.clone(), lease_ttl),
            persistence,
            retention,
        }
    }

    /// Handler state with the default lease lifetime and retention windows.
    pub fn with_defaults(persistence: Arc<dyn Persistence>) -> Self {
        Self::new(
            persistence,
            crate::guard::DEFAULT_LEASE_TTL,
            RetentionPolicy::default(),
        )
    }
}

/// How a trigger ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverOutcome {
    /// Missed days were processed.
    Completed,
    /// Still the same game day; nothing to do.
    NoOp,
    /// Another rollover holds the lease or already ran.
    Duplicate,
}

/// Result of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverResult {
    /// User the trigger ran for.
    pub user_id: String,
    /// How the trigger ended.
    pub outcome: RolloverOutcome,
    /// Game days processed (0 unless completed).
    pub days_missed: u32,
    /// Health lost.
    pub net_damage: f64,
    /// Number of tasks the rollover changed.
    pub tasks_modified: usize,
    /// Progress reported to the party quest.
    pub quest_progress: Option<QuestProgress>,
    /// Non-fatal failures during propagation and release.
    pub warnings: Vec<String>,
    /// The user as stored after the trigger.
    pub user: User,
}

impl RolloverResult {
    fn untouched(outcome: RolloverOutcome, user: User) -> Self {
        Self {
            user_id: user.id.clone(),
            outcome,
            days_missed: 0,
            net_damage: 0.0,
            tasks_modified: 0,
            quest_progress: None,
            warnings: Vec::new(),
            user,
        }
    }
}

async fn load_user(state: &CronHandlerState, user_id: &str) -> Result<User> {
    state
        .persistence
        .get_user(user_id)
        .await?
        .ok_or_else(|| CoreError::UserNotFound {
            user_id: user_id.to_string(),
        })
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "user_id".to_string(),
            message: "user_id is required".to_string(),
        });
    }
    Ok(())
}

/// Run the daily rollover for a user.
///
/// # Errors
///
/// - [`CoreError::ValidationError`] when `user_id` is empty
/// - [`CoreError::UserNotFound`] when the user does not exist
/// - [`CoreError::DatabaseError`] when loading or saving fails
///
/// Tasks are read before the lease is claimed, so a load failure leaves the
/// user untouched and the call can be retried. A save failure keeps the
/// lease, so the user stays locked until the lease lapses or an operator
/// calls [`unstick_cron`].
#[instrument(skip_all, fields(user_id = %user_id, %now))]
pub async fn trigger_rollover(
    state: &CronHandlerState,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<RolloverResult> {
    validate_user_id(user_id)?;

    let mut user = load_user(state, user_id).await?;
    let days = days_missed(
        now,
        user.last_cron_at,
        user.day_start_hour,
        user.timezone_offset_minutes,
    );

    // Read tasks before the fencing write: a failed read must leave
    // `last_cron_at` untouched so a retry still sees the missed days.
    let loaded = if days > 0 {
        match state.persistence.load_active_tasks(user_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to load tasks");
                return Err(e);
            }
        }
    } else {
        Vec::new()
    };

    let Some(lease) = state.guard.acquire(&user, now).await? else {
        debug!("Rollover already running or done");
        let current = load_user(state, user_id).await?;
        return Ok(RolloverResult::untouched(RolloverOutcome::Duplicate, current));
    };

    if days == 0 {
        let mut warnings = Vec::new();
        release(state, &lease, &mut warnings).await;
        let current = load_user(state, user_id).await?;
        let mut result = RolloverResult::untouched(RolloverOutcome::NoOp, current);
        result.warnings = warnings;
        return Ok(result);
    }

    let mut tasks = classify(loaded);
    let report = rollover::run(&mut user, &mut tasks, now, days);

    state.persistence.save_user(&user).await?;
    for task in tasks.iter() {
        if report.per_task_delta.contains_key(&task.id) {
            state.persistence.save_task(task).await?;
        }
    }

    let propagation = propagate(
        state.persistence.as_ref(),
        &user,
        &tasks,
        &report,
        now,
        &state.retention,
    )
    .await;

    let mut warnings = propagation.warnings;
    release(state, &lease, &mut warnings).await;

    info!(
        days_missed = days,
        net_damage = report.net_damage,
        tasks_modified = report.per_task_delta.len(),
        todos_deleted = propagation.todos_deleted,
        warnings = warnings.len(),
        "Rollover completed"
    );

    let current = load_user(state, user_id).await?;
    Ok(RolloverResult {
        user_id: user_id.to_string(),
        outcome: RolloverOutcome::Completed,
        days_missed: days,
        net_damage: report.net_damage,
        tasks_modified: report.per_task_delta.len(),
        quest_progress: propagation.quest_progress,
        warnings,
        user: current,
    })
}

async fn release(state: &CronHandlerState, lease: &CronLease, warnings: &mut Vec<String>) {
    if let Err(e) = state.guard.release(lease).await {
        warn!(error = %e, "Failed to release cron lease");
        warnings.push(format!("release: {}", e));
    }
}

/// Clear a stuck cron lease.
///
/// Returns true when a running lease was cleared, false when the user had
/// none.
///
/// # Errors
///
/// - [`CoreError::ValidationError`] when `user_id` is empty
/// - [`CoreError::UserNotFound`] when the user does not exist
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn unstick_cron(state: &CronHandlerState, user_id: &str) -> Result<bool> {
    validate_user_id(user_id)?;
    load_user(state, user_id).await?;
    state.guard.force_release(user_id).await
}
