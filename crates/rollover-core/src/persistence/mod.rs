//! Persistence interfaces and backends for rollover-core.
//!
//! This module defines the user/task/group records, the persistence
//! abstraction the rollover engine talks to, and the backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of a task. Drives every type-specific rule of the rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Positive/negative habit, scored any number of times a day.
    Habit,
    /// Recurring task due on a schedule.
    Daily,
    /// One-off task.
    Todo,
    /// Purchasable reward.
    Reward,
}

impl TaskKind {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Habit => "habit",
            Self::Daily => "daily",
            Self::Todo => "todo",
            Self::Reward => "reward",
        }
    }

    /// Parse a stored kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "habit" => Some(Self::Habit),
            "daily" => Some(Self::Daily),
            "todo" => Some(Self::Todo),
            "reward" => Some(Self::Reward),
            _ => None,
        }
    }
}

/// Cron sentinel state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronState {
    /// No rollover in flight.
    #[default]
    NotRunning,
    /// A rollover holds the lease.
    Running,
}

impl CronState {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Running => "running",
        }
    }

    /// Parse a stored state. Unknown values are treated as not running.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            _ => Self::NotRunning,
        }
    }
}

/// How often a habit's up/down counters start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HabitFrequency {
    /// Counters reset every game day.
    #[default]
    Daily,
    /// Counters reset when a new ISO week starts.
    Weekly,
    /// Counters reset when a new month starts.
    Monthly,
}

impl HabitFrequency {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Parse a stored frequency.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Whether moving from game day `from` to game day `to` starts a new period.
    pub fn period_changed(&self, from: NaiveDate, to: NaiveDate) -> bool {
        if to <= from {
            return false;
        }
        match self {
            Self::Daily => true,
            Self::Weekly => from.iso_week() != to.iso_week(),
            Self::Monthly => (from.year(), from.month()) != (to.year(), to.month()),
        }
    }
}

/// Days of the week on which a daily is due, as a Monday-first bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklyRepeat(u8);

impl WeeklyRepeat {
    /// Due every day.
    pub const EVERY_DAY: Self = Self(0b111_1111);

    /// Build a schedule from the weekdays a daily is due on.
    pub fn on(days: &[Weekday]) -> Self {
        Self(
            days.iter()
                .fold(0, |mask, day| mask | (1 << day.num_days_from_monday())),
        )
    }

    /// Raw bitmask.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Rebuild from a stored bitmask, ignoring bits beyond Sunday.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::EVERY_DAY.0)
    }

    /// Whether the daily is due on `day`.
    pub fn is_due(&self, day: NaiveDate) -> bool {
        self.0 & (1 << day.weekday().num_days_from_monday()) != 0
    }
}

impl Default for WeeklyRepeat {
    fn default() -> Self {
        Self::EVERY_DAY
    }
}

// ============================================================================
// Records
// ============================================================================

/// One checklist entry of a daily or to-do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Item identifier.
    pub id: String,
    /// Item text.
    pub text: String,
    /// Whether the item is checked.
    #[serde(default)]
    pub completed: bool,
}

/// User aggregate as seen by the rollover engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: String,
    /// When the last rollover started. `None` before the first one.
    pub last_cron_at: Option<DateTime<Utc>>,
    /// Sentinel state.
    pub cron_state: CronState,
    /// Token of the lease currently holding the sentinel.
    pub cron_lease_token: Option<String>,
    /// When the current lease stops being honoured.
    pub cron_lease_expires_at: Option<DateTime<Utc>>,
    /// Fencing counter, incremented on every acquired lease.
    pub cron_epoch: i64,
    /// Local hour at which the user's game day starts.
    pub day_start_hour: i32,
    /// Timezone offset in minutes east of UTC.
    pub timezone_offset_minutes: i32,
    /// Current health.
    pub health: f64,
    /// Health cap.
    pub max_health: f64,
    /// Experience points.
    pub experience: f64,
    /// Number of completed rollovers.
    pub cron_count: i64,
    /// Number of rollovers where every due daily was done.
    pub perfect_days: i64,
    /// Paying subscriber (longer to-do retention).
    pub subscribed: bool,
    /// Resting: dailies reset without damage.
    pub sleeping: bool,
    /// Party the user belongs to.
    pub party_id: Option<String>,
    /// Damage dealt to the party quest boss since the last rollover.
    pub pending_boss_damage: f64,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh user with default preferences.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_cron_at: None,
            cron_state: CronState::NotRunning,
            cron_lease_token: None,
            cron_lease_expires_at: None,
            cron_epoch: 0,
            day_start_hour: 0,
            timezone_offset_minutes: 0,
            health: 50.0,
            max_health: 50.0,
            experience: 0.0,
            cron_count: 0,
            perfect_days: 0,
            subscribed: false,
            sleeping: false,
            party_id: None,
            pending_boss_damage: 0.0,
            created_at,
        }
    }
}

/// Task owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Task kind.
    pub kind: TaskKind,
    /// Display text.
    pub text: String,
    /// Completion flag (dailies and to-dos).
    pub completed: bool,
    /// When a to-do was completed.
    pub date_completed: Option<DateTime<Utc>>,
    /// Scoring value; negative is "red", positive is "blue".
    pub value: f64,
    /// Difficulty weight (0.1 trivial, 1 easy, 1.5 medium, 2 hard).
    pub priority: f64,
    /// Consecutive completions of a daily.
    pub streak: i32,
    /// Checklist items.
    pub checklist: Vec<ChecklistItem>,
    /// Days a daily is due.
    pub repeat: WeeklyRepeat,
    /// Habit counter reset period.
    pub frequency: HabitFrequency,
    /// Habit positive direction enabled.
    pub up: bool,
    /// Habit negative direction enabled.
    pub down: bool,
    /// Habit positive scores in the current period.
    pub counter_up: i32,
    /// Habit negative scores in the current period.
    pub counter_down: i32,
    /// Challenge the task was created from.
    pub challenge_id: Option<String>,
    /// Group that shares the task.
    pub group_id: Option<String>,
    /// Shared template task this task reports to.
    pub group_task_id: Option<String>,
    /// Users the shared template is assigned to.
    pub assigned_users: Vec<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A task with default scoring fields.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        kind: TaskKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            kind,
            text: String::new(),
            completed: false,
            date_completed: None,
            value: 0.0,
            priority: 1.0,
            streak: 0,
            checklist: Vec::new(),
            repeat: WeeklyRepeat::EVERY_DAY,
            frequency: HabitFrequency::Daily,
            up: true,
            down: true,
            counter_up: 0,
            counter_down: 0,
            challenge_id: None,
            group_id: None,
            group_task_id: None,
            assigned_users: Vec::new(),
            created_at,
        }
    }

    /// Whether the task belongs to a challenge or a group.
    pub fn is_linked(&self) -> bool {
        self.challenge_id.is_some() || self.group_id.is_some()
    }
}

/// Party/group record carrying the shared quest boss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether a boss quest is running.
    pub quest_active: bool,
    /// Remaining boss health.
    pub boss_health: f64,
    /// Boss rage, fed by members' missed dailies.
    pub boss_rage: f64,
}

/// Conditional lease claim written by the concurrency guard.
#[derive(Debug, Clone)]
pub struct CronLeaseClaim {
    /// User to claim.
    pub user_id: String,
    /// Fresh token identifying this execution.
    pub token: String,
    /// `cron_epoch` observed when the user was loaded.
    pub expected_epoch: i64,
    /// Rollover time; stamped into `last_cron_at`.
    pub now: DateTime<Utc>,
    /// When the lease lapses.
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Row decoding shared by the backends
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UserRow {
    id: String,
    last_cron_at: Option<DateTime<Utc>>,
    cron_state: String,
    cron_lease_token: Option<String>,
    cron_lease_expires_at: Option<DateTime<Utc>>,
    cron_epoch: i64,
    day_start_hour: i32,
    timezone_offset_minutes: i32,
    health: f64,
    max_health: f64,
    experience: f64,
    cron_count: i64,
    perfect_days: i64,
    subscribed: bool,
    sleeping: bool,
    party_id: Option<String>,
    pending_boss_damage: f64,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            last_cron_at: row.last_cron_at,
            cron_state: CronState::parse(&row.cron_state),
            cron_lease_token: row.cron_lease_token,
            cron_lease_expires_at: row.cron_lease_expires_at,
            cron_epoch: row.cron_epoch,
            day_start_hour: row.day_start_hour,
            timezone_offset_minutes: row.timezone_offset_minutes,
            health: row.health,
            max_health: row.max_health,
            experience: row.experience,
            cron_count: row.cron_count,
            perfect_days: row.perfect_days,
            subscribed: row.subscribed,
            sleeping: row.sleeping,
            party_id: row.party_id,
            pending_boss_damage: row.pending_boss_damage,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: String,
    user_id: String,
    kind: String,
    text: String,
    completed: bool,
    date_completed: Option<DateTime<Utc>>,
    value: f64,
    priority: f64,
    streak: i32,
    checklist: String,
    repeat_mask: i32,
    frequency: String,
    up: bool,
    down: bool,
    counter_up: i32,
    counter_down: i32,
    challenge_id: Option<String>,
    group_id: Option<String>,
    group_task_id: Option<String>,
    assigned_users: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, CoreError> {
        let corrupt = |details: String| CoreError::CorruptRecord {
            entity: "task",
            id: row.id.clone(),
            details,
        };
        let kind = TaskKind::parse(&row.kind)
            .ok_or_else(|| corrupt(format!("unknown kind '{}'", row.kind)))?;
        let frequency = HabitFrequency::parse(&row.frequency)
            .ok_or_else(|| corrupt(format!("unknown frequency '{}'", row.frequency)))?;
        let checklist: Vec<ChecklistItem> = serde_json::from_str(&row.checklist)
            .map_err(|e| corrupt(format!("checklist: {}", e)))?;
        let assigned_users: Vec<String> = serde_json::from_str(&row.assigned_users)
            .map_err(|e| corrupt(format!("assigned_users: {}", e)))?;
        let repeat = u8::try_from(row.repeat_mask)
            .map(WeeklyRepeat::from_bits)
            .map_err(|_| corrupt(format!("repeat mask {} out of range", row.repeat_mask)))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            kind,
            text: row.text,
            completed: row.completed,
            date_completed: row.date_completed,
            value: row.value,
            priority: row.priority,
            streak: row.streak,
            checklist,
            repeat,
            frequency,
            up: row.up,
            down: row.down,
            counter_up: row.counter_up,
            counter_down: row.counter_down,
            challenge_id: row.challenge_id,
            group_id: row.group_id,
            group_task_id: row.group_task_id,
            assigned_users,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct GroupRow {
    id: String,
    name: String,
    quest_active: bool,
    boss_health: f64,
    boss_rage: f64,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            quest_active: row.quest_active,
            boss_health: row.boss_health,
            boss_rage: row.boss_rage,
        }
    }
}

/// JSON-encoded columns of a task, shared by both backends' writes.
pub(crate) struct TaskJson {
    pub checklist: String,
    pub assigned_users: String,
}

impl TaskJson {
    pub(crate) fn encode(task: &Task) -> Result<Self, CoreError> {
        Ok(Self {
            checklist: serde_json::to_string(&task.checklist)?,
            assigned_users: serde_json::to_string(&task.assigned_users)?,
        })
    }
}

pub(crate) fn decode_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, CoreError> {
    rows.into_iter().map(Task::try_from).collect()
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Persistence interface used by the rollover handlers.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new user record.
    async fn insert_user(&self, user: &User) -> Result<(), CoreError>;

    /// Load a user by ID.
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError>;

    /// Persist the fields the rollover engine mutates.
    ///
    /// Sentinel and lease columns are owned by the guard operations and are
    /// never written here.
    async fn save_user(&self, user: &User) -> Result<(), CoreError>;

    /// Insert a new task record.
    async fn insert_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Load a task by ID.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError>;

    /// Load the tasks a rollover looks at: every habit, daily and reward,
    /// plus incomplete to-dos, in creation order.
    async fn load_active_tasks(&self, user_id: &str) -> Result<Vec<Task>, CoreError>;

    /// Persist the fields the rollover engine mutates on a task.
    async fn save_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Delete completed to-dos finished before `cutoff` that belong to no
    /// challenge and no group. Returns the number of deleted rows.
    async fn delete_completed_todos_older_than(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Insert a new group record.
    async fn insert_group(&self, group: &Group) -> Result<(), CoreError>;

    /// Load a group by ID.
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>, CoreError>;

    /// Atomically apply deltas to a group's boss health (floored at zero) and
    /// rage. Returns false when the group does not exist.
    async fn atomic_adjust_boss(
        &self,
        group_id: &str,
        health_delta: f64,
        rage_delta: f64,
    ) -> Result<bool, CoreError>;

    /// Atomically add `delta` to a task's value. Returns false when the task
    /// does not exist.
    async fn atomic_adjust_task_value(&self, task_id: &str, delta: f64)
    -> Result<bool, CoreError>;

    /// Claim the cron lease for a user.
    ///
    /// In one conditional update: stamps `last_cron_at`, sets the sentinel to
    /// running, stores token and expiry and bumps `cron_epoch`, but only if the
    /// epoch still matches `expected_epoch` and no unexpired lease is held.
    /// Returns true when the claim was applied.
    async fn try_acquire_cron_lease(&self, claim: &CronLeaseClaim) -> Result<bool, CoreError>;

    /// Clear the sentinel if `token` still holds the lease.
    /// Returns false when the lease belongs to someone else.
    async fn release_cron_lease(&self, user_id: &str, token: &str) -> Result<bool, CoreError>;

    /// Clear the sentinel unconditionally (administrative unstick).
    /// Returns true when a running lease was cleared.
    async fn force_release_cron_lease(&self, user_id: &str) -> Result<bool, CoreError>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
