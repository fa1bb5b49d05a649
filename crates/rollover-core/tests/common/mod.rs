// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for rollover-core integration tests.
//!
//! Provides TestContext for setting up a database and handler state, plus
//! record builders and a persistence wrapper that injects failures.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use rollover_core::cron_handlers::CronHandlerState;
use rollover_core::error::CoreError;
use rollover_core::persistence::{
    CronLeaseClaim, Group, Persistence, PostgresPersistence, SqlitePersistence, Task, TaskKind,
    User,
};
use rollover_core::propagation::RetentionPolicy;

/// Lease lifetime used by test contexts.
pub const TEST_LEASE_TTL: Duration = Duration::from_secs(60);

/// Test context holding a migrated database and handler state.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub state: CronHandlerState,
    // Keeps the SQLite file alive for the lifetime of the context.
    _dir: Option<TempDir>,
}

impl TestContext {
    /// File-backed SQLite with a multi-connection pool, so concurrent
    /// triggers really run side by side.
    pub async fn sqlite() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("rollover.db"))
            .await
            .expect("Failed to open SQLite database");
        Self::with_persistence(Arc::new(persistence), Some(dir))
    }

    /// PostgreSQL from TEST_DATABASE_URL, or `None` when it is not set.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let persistence = PostgresPersistence::connect(&database_url, 5).await.ok()?;
        Some(Self::with_persistence(Arc::new(persistence), None))
    }

    /// Wrap an existing persistence implementation.
    pub fn with_persistence(persistence: Arc<dyn Persistence>, dir: Option<TempDir>) -> Self {
        let state = CronHandlerState::new(
            persistence.clone(),
            TEST_LEASE_TTL,
            RetentionPolicy::default(),
        );
        Self {
            persistence,
            state,
            _dir: dir,
        }
    }

    /// Insert a user whose last rollover was `days_ago` days before [`now`].
    pub async fn seed_user(&self, days_ago: Option<i64>) -> User {
        self.seed_user_with(days_ago, |_| {}).await
    }

    /// Like [`seed_user`](Self::seed_user), applying `edit` before insert.
    pub async fn seed_user_with(
        &self,
        days_ago: Option<i64>,
        edit: impl FnOnce(&mut User),
    ) -> User {
        let mut user = User::new(Uuid::new_v4().to_string(), now() - chrono::Duration::days(90));
        user.last_cron_at = days_ago.map(|d| now() - chrono::Duration::days(d));
        edit(&mut user);
        self.persistence
            .insert_user(&user)
            .await
            .expect("Failed to insert user");
        user
    }

    /// Insert a task of `kind` owned by `user_id`, after applying `edit`.
    pub async fn seed_task(
        &self,
        user_id: &str,
        kind: TaskKind,
        edit: impl FnOnce(&mut Task),
    ) -> Task {
        let mut task = Task::new(Uuid::new_v4().to_string(), user_id, kind, now());
        edit(&mut task);
        self.persistence
            .insert_task(&task)
            .await
            .expect("Failed to insert task");
        task
    }

    /// Insert a party with an active quest.
    pub async fn seed_party(&self, boss_health: f64) -> Group {
        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: "Test Party".to_string(),
            quest_active: true,
            boss_health,
            boss_rage: 0.0,
        };
        self.persistence
            .insert_group(&group)
            .await
            .expect("Failed to insert group");
        group
    }

    /// Reload a user.
    pub async fn user(&self, user_id: &str) -> User {
        self.persistence
            .get_user(user_id)
            .await
            .expect("Failed to load user")
            .expect("User not found")
    }

    /// Reload a task.
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.persistence
            .get_task(task_id)
            .await
            .expect("Failed to load task")
    }
}

/// Frozen "now" shared by the tests (a Wednesday).
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 13, 10, 0, 0).unwrap()
}

/// Compare floats with a small tolerance.
pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ============================================================================
// Failure injection
// ============================================================================

/// Persistence wrapper that fails selected operations on demand.
pub struct FlakyPersistence {
    inner: Arc<dyn Persistence>,
    pub fail_task_loads: AtomicBool,
    pub fail_group_ops: AtomicBool,
    pub fail_todo_cleanup: AtomicBool,
}

impl FlakyPersistence {
    pub fn new(inner: Arc<dyn Persistence>) -> Self {
        Self {
            inner,
            fail_task_loads: AtomicBool::new(false),
            fail_group_ops: AtomicBool::new(false),
            fail_todo_cleanup: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), CoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoreError::DatabaseError {
                operation: operation.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn insert_user(&self, user: &User) -> Result<(), CoreError> {
        self.inner.insert_user(user).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        self.inner.get_user(user_id).await
    }

    async fn save_user(&self, user: &User) -> Result<(), CoreError> {
        self.inner.save_user(user).await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        self.inner.get_task(task_id).await
    }

    async fn load_active_tasks(&self, user_id: &str) -> Result<Vec<Task>, CoreError> {
        Self::check(&self.fail_task_loads, "load_active_tasks")?;
        self.inner.load_active_tasks(user_id).await
    }

    async fn save_task(&self, task: &Task) -> Result<(), CoreError> {
        self.inner.save_task(task).await
    }

    async fn delete_completed_todos_older_than(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        Self::check(&self.fail_todo_cleanup, "delete_completed_todos_older_than")?;
        self.inner
            .delete_completed_todos_older_than(user_id, cutoff)
            .await
    }

    async fn insert_group(&self, group: &Group) -> Result<(), CoreError> {
        self.inner.insert_group(group).await
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>, CoreError> {
        Self::check(&self.fail_group_ops, "get_group")?;
        self.inner.get_group(group_id).await
    }

    async fn atomic_adjust_boss(
        &self,
        group_id: &str,
        health_delta: f64,
        rage_delta: f64,
    ) -> Result<bool, CoreError> {
        Self::check(&self.fail_group_ops, "atomic_adjust_boss")?;
        self.inner
            .atomic_adjust_boss(group_id, health_delta, rage_delta)
            .await
    }

    async fn atomic_adjust_task_value(
        &self,
        task_id: &str,
        delta: f64,
    ) -> Result<bool, CoreError> {
        self.inner.atomic_adjust_task_value(task_id, delta).await
    }

    async fn try_acquire_cron_lease(&self, claim: &CronLeaseClaim) -> Result<bool, CoreError> {
        self.inner.try_acquire_cron_lease(claim).await
    }

    async fn release_cron_lease(&self, user_id: &str, token: &str) -> Result<bool, CoreError> {
        self.inner.release_cron_lease(user_id, token).await
    }

    async fn force_release_cron_lease(&self, user_id: &str) -> Result<bool, CoreError> {
        self.inner.force_release_cron_lease(user_id).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.inner.health_check_db().await
    }
}
