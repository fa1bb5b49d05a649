// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partition of a user's tasks by kind.

use crate::persistence::{Task, TaskKind};

/// A user's tasks bucketed by kind, each bucket in load order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TasksByKind {
    /// Habits.
    pub habits: Vec<Task>,
    /// Dailies.
    pub dailies: Vec<Task>,
    /// To-dos.
    pub todos: Vec<Task>,
    /// Rewards.
    pub rewards: Vec<Task>,
}

impl TasksByKind {
    /// Total number of tasks across all buckets.
    pub fn len(&self) -> usize {
        self.habits.len() + self.dailies.len() + self.todos.len() + self.rewards.len()
    }

    /// True when every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over every task, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.habits
            .iter()
            .chain(&self.dailies)
            .chain(&self.todos)
            .chain(&self.rewards)
    }
}

/// Split `tasks` into buckets, keeping the relative order inside each one.
pub fn classify(tasks: Vec<Task>) -> TasksByKind {
    let mut buckets = TasksByKind::default();
    for task in tasks {
        match task.kind {
            TaskKind::Habit => buckets.habits.push(task),
            TaskKind::Daily => buckets.dailies.push(task),
            TaskKind::Todo => buckets.todos.push(task),
            TaskKind::Reward => buckets.rewards.push(task),
        }
    }
    buckets
}
