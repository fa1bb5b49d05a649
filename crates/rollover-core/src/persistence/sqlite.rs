//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{
    CronLeaseClaim, Group, GroupRow, Persistence, Task, TaskJson, TaskRow, User, UserRow,
    decode_tasks,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/rollover.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL (e.g. `sqlite::memory:`) and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // A single connection keeps `sqlite::memory:` databases shared across queries.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_user(&self, user: &User) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, last_cron_at, cron_state, cron_lease_token, cron_lease_expires_at,
                cron_epoch, day_start_hour, timezone_offset_minutes, health, max_health,
                experience, cron_count, perfect_days, subscribed, sleeping, party_id,
                pending_boss_damage, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(user.last_cron_at)
        .bind(user.cron_state.as_str())
        .bind(&user.cron_lease_token)
        .bind(user.cron_lease_expires_at)
        .bind(user.cron_epoch)
        .bind(user.day_start_hour)
        .bind(user.timezone_offset_minutes)
        .bind(user.health)
        .bind(user.max_health)
        .bind(user.experience)
        .bind(user.cron_count)
        .bind(user.perfect_days)
        .bind(user.subscribed)
        .bind(user.sleeping)
        .bind(&user.party_id)
        .bind(user.pending_boss_damage)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, last_cron_at, cron_state, cron_lease_token, cron_lease_expires_at,
                   cron_epoch, day_start_hour, timezone_offset_minutes, health, max_health,
                   experience, cron_count, perfect_days, subscribed, sleeping, party_id,
                   pending_boss_damage, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    async fn save_user(&self, user: &User) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET health = ?1,
                experience = ?2,
                cron_count = ?3,
                perfect_days = ?4,
                pending_boss_damage = ?5
            WHERE id = ?6
            "#,
        )
        .bind(user.health)
        .bind(user.experience)
        .bind(user.cron_count)
        .bind(user.perfect_days)
        .bind(user.pending_boss_damage)
        .bind(&user.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UserNotFound {
                user_id: user.id.clone(),
            });
        }

        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        let json = TaskJson::encode(task)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user_id, kind, text, completed, date_completed, value, priority, streak,
                checklist, repeat_mask, frequency, up, down, counter_up, counter_down,
                challenge_id, group_id, group_task_id, assigned_users, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.kind.as_str())
        .bind(&task.text)
        .bind(task.completed)
        .bind(task.date_completed)
        .bind(task.value)
        .bind(task.priority)
        .bind(task.streak)
        .bind(&json.checklist)
        .bind(i32::from(task.repeat.bits()))
        .bind(task.frequency.as_str())
        .bind(task.up)
        .bind(task.down)
        .bind(task.counter_up)
        .bind(task.counter_down)
        .bind(&task.challenge_id)
        .bind(&task.group_id)
        .bind(&task.group_task_id)
        .bind(&json.assigned_users)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, kind, text, completed, date_completed, value, priority,
                   streak, checklist, repeat_mask, frequency, up, down, counter_up,
                   counter_down, challenge_id, group_id, group_task_id, assigned_users,
                   created_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn load_active_tasks(&self, user_id: &str) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, kind, text, completed, date_completed, value, priority,
                   streak, checklist, repeat_mask, frequency, up, down, counter_up,
                   counter_down, challenge_id, group_id, group_task_id, assigned_users,
                   created_at
            FROM tasks
            WHERE user_id = ?
              AND (kind IN ('habit', 'daily', 'reward')
                   OR (kind = 'todo' AND completed = 0))
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        decode_tasks(rows)
    }

    async fn save_task(&self, task: &Task) -> Result<(), CoreError> {
        let json = TaskJson::encode(task)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET completed = ?1,
                value = ?2,
                streak = ?3,
                checklist = ?4,
                counter_up = ?5,
                counter_down = ?6
            WHERE id = ?7
            "#,
        )
        .bind(task.completed)
        .bind(task.value)
        .bind(task.streak)
        .bind(&json.checklist)
        .bind(task.counter_up)
        .bind(task.counter_down)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound {
                task_id: task.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete_completed_todos_older_than(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE user_id = ?1
              AND kind = 'todo'
              AND completed = 1
              AND date_completed IS NOT NULL
              AND date_completed < ?2
              AND challenge_id IS NULL
              AND group_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_group(&self, group: &Group) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO parties (id, name, quest_active, boss_health, boss_rage)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(group.quest_active)
        .bind(group.boss_health)
        .bind(group.boss_rage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>, CoreError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, name, quest_active, boss_health, boss_rage
            FROM parties
            WHERE id = ?
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Group::from))
    }

    async fn atomic_adjust_boss(
        &self,
        group_id: &str,
        health_delta: f64,
        rage_delta: f64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE parties
            SET boss_health = MAX(boss_health + ?1, 0),
                boss_rage = boss_rage + ?2
            WHERE id = ?3
            "#,
        )
        .bind(health_delta)
        .bind(rage_delta)
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn atomic_adjust_task_value(
        &self,
        task_id: &str,
        delta: f64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET value = value + ?1
            WHERE id = ?2
            "#,
        )
        .bind(delta)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_cron_lease(&self, claim: &CronLeaseClaim) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET cron_state = 'running',
                cron_lease_token = ?1,
                cron_lease_expires_at = ?2,
                last_cron_at = ?3,
                cron_epoch = cron_epoch + 1
            WHERE id = ?4
              AND cron_epoch = ?5
              AND (cron_state <> 'running'
                   OR cron_lease_expires_at IS NULL
                   OR cron_lease_expires_at <= ?3)
            "#,
        )
        .bind(&claim.token)
        .bind(claim.expires_at)
        .bind(claim.now)
        .bind(&claim.user_id)
        .bind(claim.expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_cron_lease(&self, user_id: &str, token: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET cron_state = 'not_running',
                cron_lease_token = NULL,
                cron_lease_expires_at = NULL
            WHERE id = ?1
              AND cron_lease_token = ?2
            "#,
        )
        .bind(user_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn force_release_cron_lease(&self, user_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET cron_state = 'not_running',
                cron_lease_token = NULL,
                cron_lease_expires_at = NULL
            WHERE id = ?1
              AND cron_state = 'running'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
