// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task value decay curve.
//!
//! The further a task's value has drifted into the negative, the more a miss
//! costs; blue tasks decay slowly. The same curve drives the user's own daily
//! decay and the delta forwarded to shared group templates.

/// Base of the exponential decay curve.
pub const DECAY_BASE: f64 = 0.9747;

/// Lowest value a task can reach through decay.
pub const MIN_TASK_VALUE: f64 = -47.27;

/// Highest value a task can reach.
pub const MAX_TASK_VALUE: f64 = 21.27;

/// Health lost per unit of value decay, before priority weighting.
pub const HEALTH_DAMAGE_FACTOR: f64 = 2.0;

/// Value change for one missed occurrence of a task at `value`. Always negative.
pub fn missed_delta(value: f64) -> f64 {
    let clamped = value.clamp(MIN_TASK_VALUE, MAX_TASK_VALUE);
    -DECAY_BASE.powf(clamped)
}

/// Health damage for a value decay of `delta` on a task of `priority`.
pub fn health_damage(delta: f64, priority: f64) -> f64 {
    delta.abs() * priority * HEALTH_DAMAGE_FACTOR
}

/// Share of a missed task's decay forwarded to its group template.
///
/// Split evenly across the template's assignees; with nobody assigned the
/// whole delta goes through.
pub fn challenge_delta(value: f64, assignees: usize) -> f64 {
    let delta = missed_delta(value);
    if assignees == 0 {
        delta
    } else {
        delta / assignees as f64
    }
}
