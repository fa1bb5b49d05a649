// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollover engine.
//!
//! Applies the consequences of the game days a user let pass: missed dailies
//! decay and hurt, completed dailies and checklists are reset, habit counters
//! start over when their period ends. Everything happens in memory on the
//! loaded records; persisting them is the caller's job.
//!
//! One invocation walks through [`RolloverPhase`]s in order:
//!
//! ```text
//! NotStarted -> DaysComputed -> Scored -> Done
//! ```
//!
//! With zero missed days the engine goes straight from `DaysComputed` to
//! `Done` without touching anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::{self, DayBoundary};
use crate::classify::TasksByKind;
use crate::persistence::{Task, User};
use crate::scoring;

/// Habit values closer to zero than this snap to zero when drifting.
const HABIT_DRIFT_SNAP: f64 = 0.1;

/// Progress of one rollover invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverPhase {
    /// Nothing computed yet.
    #[default]
    NotStarted,
    /// Missed days are known.
    DaysComputed,
    /// Tasks and user have been scored.
    Scored,
    /// Bookkeeping finished.
    Done,
}

/// What a rollover did.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Game days elapsed since the previous rollover.
    pub days_missed: u32,
    /// Health lost to missed dailies.
    pub net_damage: f64,
    /// Value change per mutated task (0.0 for pure resets).
    pub per_task_delta: BTreeMap<String, f64>,
    /// Pending quest boss damage collected from the user.
    pub boss_damage: f64,
    /// Every due daily was completed.
    pub perfect_day: bool,
    /// Phase reached.
    pub phase: RolloverPhase,
}

impl ProgressReport {
    fn record(&mut self, task_id: &str, delta: f64) {
        *self.per_task_delta.entry(task_id.to_string()).or_insert(0.0) += delta;
    }

    /// Whether the rollover changed anything.
    pub fn is_noop(&self) -> bool {
        self.days_missed == 0
    }
}

/// Run the rollover for `user` over `tasks`.
///
/// `user` must be the record as loaded before the lease was acquired: its
/// `last_cron_at` anchors the missed game days. `days_missed` comes from
/// [`crate::calendar::days_missed`].
pub fn run(
    user: &mut User,
    tasks: &mut TasksByKind,
    now: DateTime<Utc>,
    days_missed: u32,
) -> ProgressReport {
    let mut report = ProgressReport {
        days_missed,
        phase: RolloverPhase::DaysComputed,
        ..ProgressReport::default()
    };

    if days_missed == 0 {
        report.phase = RolloverPhase::Done;
        return report;
    }

    let boundary = DayBoundary::new(user.day_start_hour, user.timezone_offset_minutes);
    let today = boundary.game_day(now);
    let missed = missed_days(user.last_cron_at, &boundary, today, days_missed);
    let previous_day = missed.first().copied().unwrap_or(today);

    let mut perfect = true;
    for daily in &mut tasks.dailies {
        let (delta, missed_due) = roll_daily(daily, &missed, user.sleeping);
        if missed_due {
            perfect = false;
        }
        if let Some((value_delta, damage)) = delta {
            report.net_damage += damage;
            report.record(&daily.id, value_delta);
        } else if missed_due || daily_was_reset(daily) {
            report.record(&daily.id, 0.0);
        }
        reset_daily(daily);
    }

    for habit in &mut tasks.habits {
        if let Some(delta) = roll_habit(habit, previous_day, today) {
            report.record(&habit.id, delta);
        }
    }

    report.phase = RolloverPhase::Scored;

    user.health = (user.health - report.net_damage).max(0.0);
    user.cron_count += 1;
    report.perfect_day = perfect && !user.sleeping;
    if report.perfect_day {
        user.perfect_days += 1;
    }
    report.boss_damage = user.pending_boss_damage;
    user.pending_boss_damage = 0.0;

    report.phase = RolloverPhase::Done;
    report
}

/// Game days that ended without a rollover, oldest first.
fn missed_days(
    last_cron_at: Option<DateTime<Utc>>,
    boundary: &DayBoundary,
    today: NaiveDate,
    days_missed: u32,
) -> Vec<NaiveDate> {
    let first = match last_cron_at {
        Some(last) => boundary.game_day(last),
        None => today
            .checked_sub_days(Days::new(u64::from(days_missed)))
            .unwrap_or(today),
    };
    calendar::consecutive_days(first, days_missed)
}

/// Score one daily for the missed days.
///
/// Each due missed day is one decay step computed from the value left by the
/// previous step, so two missed days give `missed_delta(0)` followed by
/// `missed_delta(missed_delta(0))`.
///
/// Returns the value decay and damage when it was applied, and whether any
/// due day passed with the daily incomplete.
fn roll_daily(
    daily: &mut Task,
    missed: &[NaiveDate],
    sleeping: bool,
) -> (Option<(f64, f64)>, bool) {
    if daily.completed {
        return (None, false);
    }
    let due_misses = missed.iter().filter(|day| daily.repeat.is_due(**day)).count();
    if due_misses == 0 {
        return (None, false);
    }
    if sleeping {
        return (None, true);
    }

    let unchecked = unchecked_fraction(daily);
    let mut value_delta = 0.0;
    let mut damage = 0.0;
    for _ in 0..due_misses {
        let delta = scoring::missed_delta(daily.value) * unchecked;
        daily.value += delta;
        value_delta += delta;
        damage += scoring::health_damage(delta, daily.priority);
    }
    daily.streak = 0;

    (Some((value_delta, damage)), true)
}

/// Share of checklist items left unchecked; 1.0 without a checklist.
fn unchecked_fraction(task: &Task) -> f64 {
    if task.checklist.is_empty() {
        return 1.0;
    }
    let unchecked = task.checklist.iter().filter(|item| !item.completed).count();
    unchecked as f64 / task.checklist.len() as f64
}

fn daily_was_reset(daily: &Task) -> bool {
    daily.completed || daily.checklist.iter().any(|item| item.completed)
}

fn reset_daily(daily: &mut Task) {
    daily.completed = false;
    for item in &mut daily.checklist {
        item.completed = false;
    }
}

/// Reset habit counters and let one-direction habits drift toward zero.
/// Returns the value change when the habit was mutated.
fn roll_habit(habit: &mut Task, previous_day: NaiveDate, today: NaiveDate) -> Option<f64> {
    let mut mutated = false;

    if habit.frequency.period_changed(previous_day, today)
        && (habit.counter_up != 0 || habit.counter_down != 0)
    {
        habit.counter_up = 0;
        habit.counter_down = 0;
        mutated = true;
    }

    let before = habit.value;
    if (!habit.up || !habit.down) && habit.value != 0.0 {
        habit.value = if habit.value.abs() < HABIT_DRIFT_SNAP {
            0.0
        } else {
            habit.value / 2.0
        };
        mutated = true;
    }

    mutated.then(|| habit.value - before)
}
