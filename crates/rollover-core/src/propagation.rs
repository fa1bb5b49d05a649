// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Effects of a rollover beyond the user's own records.
//!
//! After the user and their tasks are saved, a rollover still has to:
//!
//! - retire completed to-dos that fell out of the retention window,
//! - forward missed-task decay to shared group templates,
//! - report quest progress to the party boss.
//!
//! Quest progress splits the two damage figures: the user's pending boss
//! damage lowers boss health, while health lost to missed dailies feeds boss
//! rage and never heals or hurts the boss.
//!
//! Shared records are only touched through the atomic delta operations of
//! [`Persistence`], so concurrent rollovers of different members never lose
//! each other's updates. None of these steps can fail the rollover: errors are
//! logged and handed back as warnings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::TasksByKind;
use crate::persistence::{Persistence, User};
use crate::rollover::ProgressReport;
use crate::scoring;

/// How long completed to-dos are kept, by subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Days kept for free users.
    pub free_days: u32,
    /// Days kept for subscribers.
    pub subscriber_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            free_days: 30,
            subscriber_days: 90,
        }
    }
}

impl RetentionPolicy {
    /// Retention window for a user.
    pub fn days_for(&self, subscribed: bool) -> u32 {
        if subscribed {
            self.subscriber_days
        } else {
            self.free_days
        }
    }

    /// To-dos completed before this instant are eligible for deletion.
    pub fn cutoff(&self, now: DateTime<Utc>, subscribed: bool) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.days_for(subscribed)))
    }
}

/// Progress reported to a party quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestProgress {
    /// Party whose boss was hit.
    pub group_id: String,
    /// Damage dealt to the boss.
    pub boss_damage: f64,
    /// Rage added to the boss.
    pub rage: f64,
}

/// Delta forwarded to one group template task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeUpdate {
    /// The user's task.
    pub task_id: String,
    /// The shared template it reports to.
    pub group_task_id: String,
    /// Value change applied to the template.
    pub delta: f64,
}

/// Result of propagating one rollover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationOutcome {
    /// Quest progress, when the user's party has an active quest.
    pub quest_progress: Option<QuestProgress>,
    /// Template updates that were applied.
    pub challenge_updates: Vec<ChallengeUpdate>,
    /// Completed to-dos deleted.
    pub todos_deleted: u64,
    /// Steps that failed.
    pub warnings: Vec<String>,
}

impl PropagationOutcome {
    fn warn(&mut self, user_id: &str, step: &'static str, message: String) {
        warn!(user_id = %user_id, step, "{}", message);
        self.warnings.push(format!("{}: {}", step, message));
    }
}

/// Propagate a finished rollover.
///
/// `user` and `tasks` are the records after scoring, already persisted.
pub async fn propagate(
    persistence: &dyn Persistence,
    user: &User,
    tasks: &TasksByKind,
    report: &ProgressReport,
    now: DateTime<Utc>,
    retention: &RetentionPolicy,
) -> PropagationOutcome {
    let mut outcome = PropagationOutcome::default();

    retire_todos(persistence, user, now, retention, &mut outcome).await;
    forward_challenge_deltas(persistence, user, tasks, report, &mut outcome).await;
    report_quest_progress(persistence, user, report, &mut outcome).await;

    outcome
}

async fn retire_todos(
    persistence: &dyn Persistence,
    user: &User,
    now: DateTime<Utc>,
    retention: &RetentionPolicy,
    outcome: &mut PropagationOutcome,
) {
    let cutoff = retention.cutoff(now, user.subscribed);
    match persistence
        .delete_completed_todos_older_than(&user.id, cutoff)
        .await
    {
        Ok(deleted) => {
            if deleted > 0 {
                debug!(user_id = %user.id, deleted, %cutoff, "Retired completed to-dos");
            }
            outcome.todos_deleted = deleted;
        }
        Err(e) => outcome.warn(&user.id, "todo_retention", e.to_string()),
    }
}

async fn forward_challenge_deltas(
    persistence: &dyn Persistence,
    user: &User,
    tasks: &TasksByKind,
    report: &ProgressReport,
    outcome: &mut PropagationOutcome,
) {
    let linked = tasks.iter().filter(|task| {
        task.group_task_id.is_some() && report.per_task_delta.contains_key(&task.id)
    });

    for task in linked {
        let Some(group_task_id) = task.group_task_id.as_deref() else {
            continue;
        };

        let template = match persistence.get_task(group_task_id).await {
            Ok(Some(template)) => template,
            Ok(None) => {
                debug!(task_id = %task.id, group_task_id, "Group template no longer exists");
                continue;
            }
            Err(e) => {
                outcome.warn(&user.id, "challenge_delta", e.to_string());
                continue;
            }
        };

        let delta = scoring::challenge_delta(task.value, template.assigned_users.len());
        match persistence
            .atomic_adjust_task_value(group_task_id, delta)
            .await
        {
            Ok(true) => outcome.challenge_updates.push(ChallengeUpdate {
                task_id: task.id.clone(),
                group_task_id: group_task_id.to_string(),
                delta,
            }),
            Ok(false) => {
                debug!(task_id = %task.id, group_task_id, "Group template removed mid-rollover");
            }
            Err(e) => outcome.warn(&user.id, "challenge_delta", e.to_string()),
        }
    }
}

async fn report_quest_progress(
    persistence: &dyn Persistence,
    user: &User,
    report: &ProgressReport,
    outcome: &mut PropagationOutcome,
) {
    let Some(party_id) = user.party_id.as_deref() else {
        return;
    };

    let group = match persistence.get_group(party_id).await {
        Ok(Some(group)) => group,
        Ok(None) => {
            outcome.warn(&user.id, "quest_progress", format!("party {} not found", party_id));
            return;
        }
        Err(e) => {
            outcome.warn(&user.id, "quest_progress", e.to_string());
            return;
        }
    };

    if !group.quest_active {
        return;
    }

    match persistence
        .atomic_adjust_boss(party_id, -report.boss_damage, report.net_damage)
        .await
    {
        Ok(true) => {
            outcome.quest_progress = Some(QuestProgress {
                group_id: party_id.to_string(),
                boss_damage: report.boss_damage,
                rage: report.net_damage,
            });
        }
        Ok(false) => {
            outcome.warn(&user.id, "quest_progress", format!("party {} vanished", party_id));
        }
        Err(e) => outcome.warn(&user.id, "quest_progress", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::persistence::{Group, SqlitePersistence, Task, TaskKind};
    use chrono::TimeZone;

    const EPSILON: f64 = 1e-9;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 13, 10, 0, 0).unwrap()
    }

    async fn persistence() -> SqlitePersistence {
        SqlitePersistence::connect("sqlite::memory:").await.unwrap()
    }

    fn completed_todo(id: &str, user_id: &str, days_ago: i64) -> Task {
        let mut todo = Task::new(id, user_id, TaskKind::Todo, now() - Duration::days(200));
        todo.completed = true;
        todo.date_completed = Some(now() - Duration::days(days_ago));
        todo
    }

    #[test]
    fn test_retention_cutoff_by_subscription() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.cutoff(now(), false), now() - Duration::days(30));
        assert_eq!(policy.cutoff(now(), true), now() - Duration::days(90));
    }

    #[tokio::test]
    async fn test_retires_only_old_unlinked_todos() {
        let db = persistence().await;
        let user = User::new("free", now());
        db.insert_user(&user).await.unwrap();

        db.insert_task(&completed_todo("old", "free", 31)).await.unwrap();
        db.insert_task(&completed_todo("recent", "free", 29)).await.unwrap();
        let mut challenge = completed_todo("challenge", "free", 365);
        challenge.challenge_id = Some("ch-1".to_string());
        db.insert_task(&challenge).await.unwrap();
        let mut group = completed_todo("group", "free", 365);
        group.group_id = Some("g-1".to_string());
        db.insert_task(&group).await.unwrap();

        let outcome = propagate(
            &db,
            &user,
            &TasksByKind::default(),
            &ProgressReport::default(),
            now(),
            &RetentionPolicy::default(),
        )
        .await;

        assert_eq!(outcome.todos_deleted, 1);
        assert!(outcome.warnings.is_empty());
        assert!(db.get_task("old").await.unwrap().is_none());
        assert!(db.get_task("recent").await.unwrap().is_some());
        assert!(db.get_task("challenge").await.unwrap().is_some());
        assert!(db.get_task("group").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subscribers_keep_todos_longer() {
        let db = persistence().await;
        let mut user = User::new("subscriber", now());
        user.subscribed = true;
        db.insert_user(&user).await.unwrap();

        db.insert_task(&completed_todo("sixty", "subscriber", 60)).await.unwrap();
        db.insert_task(&completed_todo("hundred", "subscriber", 100)).await.unwrap();

        let outcome = propagate(
            &db,
            &user,
            &TasksByKind::default(),
            &ProgressReport::default(),
            now(),
            &RetentionPolicy::default(),
        )
        .await;

        assert_eq!(outcome.todos_deleted, 1);
        assert!(db.get_task("sixty").await.unwrap().is_some());
        assert!(db.get_task("hundred").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_challenge_delta_split_across_assignees() {
        let db = persistence().await;
        let owner = User::new("leader", now());
        db.insert_user(&owner).await.unwrap();
        let member = User::new("member", now());
        db.insert_user(&member).await.unwrap();

        let mut template = Task::new("template", "leader", TaskKind::Daily, now());
        template.group_id = Some("g-1".to_string());
        template.assigned_users = vec!["member".into(), "a".into(), "b".into(), "c".into()];
        db.insert_task(&template).await.unwrap();

        let mut copy = Task::new("copy", "member", TaskKind::Daily, now());
        copy.group_id = Some("g-1".to_string());
        copy.group_task_id = Some("template".to_string());
        copy.value = -1.0;
        let mut untouched = Task::new("untouched", "member", TaskKind::Daily, now());
        untouched.group_task_id = Some("template".to_string());
        let tasks = classify(vec![copy, untouched]);

        let mut report = ProgressReport::default();
        report.per_task_delta.insert("copy".to_string(), -1.0);

        let outcome = propagate(
            &db,
            &member,
            &tasks,
            &report,
            now(),
            &RetentionPolicy::default(),
        )
        .await;

        let expected = -(0.9747_f64.powf(-1.0)) / 4.0;
        assert_eq!(outcome.challenge_updates.len(), 1);
        assert!((outcome.challenge_updates[0].delta - expected).abs() < EPSILON);
        let stored = db.get_task("template").await.unwrap().unwrap();
        assert!((stored.value - expected).abs() < EPSILON);
    }

    #[tokio::test]
    async fn test_missing_template_is_skipped() {
        let db = persistence().await;
        let user = User::new("member", now());
        db.insert_user(&user).await.unwrap();

        let mut orphan = Task::new("orphan", "member", TaskKind::Daily, now());
        orphan.group_task_id = Some("deleted-template".to_string());
        let tasks = classify(vec![orphan]);
        let mut report = ProgressReport::default();
        report.per_task_delta.insert("orphan".to_string(), -1.0);

        let outcome = propagate(
            &db,
            &user,
            &tasks,
            &report,
            now(),
            &RetentionPolicy::default(),
        )
        .await;

        assert!(outcome.challenge_updates.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_quest_progress_hits_active_boss() {
        let db = persistence().await;
        db.insert_group(&Group {
            id: "party".to_string(),
            name: "Party".to_string(),
            quest_active: true,
            boss_health: 100.0,
            boss_rage: 0.0,
        })
        .await
        .unwrap();
        let mut user = User::new("hero", now());
        user.party_id = Some("party".to_string());
        db.insert_user(&user).await.unwrap();

        let report = ProgressReport {
            boss_damage: 12.0,
            net_damage: 3.0,
            ..ProgressReport::default()
        };
        let outcome = propagate(
            &db,
            &user,
            &TasksByKind::default(),
            &report,
            now(),
            &RetentionPolicy::default(),
        )
        .await;

        assert_eq!(
            outcome.quest_progress,
            Some(QuestProgress {
                group_id: "party".to_string(),
                boss_damage: 12.0,
                rage: 3.0,
            })
        );
        let group = db.get_group("party").await.unwrap().unwrap();
        assert_eq!(group.boss_health, 88.0);
        assert_eq!(group.boss_rage, 3.0);
    }

    #[tokio::test]
    async fn test_inactive_quest_and_missing_party() {
        let db = persistence().await;
        db.insert_group(&Group {
            id: "idle".to_string(),
            name: "Idle".to_string(),
            quest_active: false,
            boss_health: 100.0,
            boss_rage: 0.0,
        })
        .await
        .unwrap();

        let mut idle_member = User::new("idle-member", now());
        idle_member.party_id = Some("idle".to_string());
        db.insert_user(&idle_member).await.unwrap();
        let report = ProgressReport {
            boss_damage: 5.0,
            ..ProgressReport::default()
        };
        let outcome = propagate(
            &db,
            &idle_member,
            &TasksByKind::default(),
            &report,
            now(),
            &RetentionPolicy::default(),
        )
        .await;
        assert_eq!(outcome.quest_progress, None);
        assert!(outcome.warnings.is_empty());
        assert_eq!(db.get_group("idle").await.unwrap().unwrap().boss_health, 100.0);

        let mut lost = User::new("lost", now());
        lost.party_id = Some("disbanded".to_string());
        db.insert_user(&lost).await.unwrap();
        let outcome = propagate(
            &db,
            &lost,
            &TasksByKind::default(),
            &report,
            now(),
            &RetentionPolicy::default(),
        )
        .await;
        assert_eq!(outcome.quest_progress, None);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("quest_progress"));
    }
}
