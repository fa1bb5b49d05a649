// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollover Core - Daily Rollover Engine
//!
//! This crate runs the once-per-game-day "cron" of a gamified task tracker:
//! when a user shows up after one or more day boundaries, the dailies they
//! left undone decay and cost health, completed dailies reset, habit counters
//! start over, old completed to-dos are retired, and the user's party quest
//! and shared group tasks receive their share of the outcome.
//!
//! # Flow
//!
//! ```text
//!  trigger_rollover(user_id, now)
//!          │
//!          ▼
//!   load user ──► days_missed ──► load tasks (≥ 1 day, before any write)
//!                                        │
//!                                        ▼
//!                          acquire lease (stamps last_cron_at)
//!                                        │
//!                     ┌──────────────────┼─────────────────┐
//!                     │ lease taken      │ 0 days          │ ≥ 1 day
//!                     ▼                  ▼                 ▼
//!                 Duplicate       release, NoOp      classify tasks
//!                                                          │
//!                                                          ▼
//!                                                  rollover::run (in memory)
//!                                                          │
//!                                                          ▼
//!                                                  save user and tasks
//!                                                          │
//!                                                          ▼
//!                                               propagate (warnings only)
//!                                                          │
//!                                                          ▼
//!                                                 release, Completed
//! ```
//!
//! # Cron Lease
//!
//! A per-user lease replaces a bare "running" flag. It carries a token, an
//! expiry and a fencing epoch, and is claimed in a single conditional update:
//!
//! | Situation | Result |
//! |-----------|--------|
//! | No lease, epoch matches | claimed, `last_cron_at = now` |
//! | Unexpired lease held | `Duplicate` |
//! | Lease expired | claimed by the next trigger |
//! | Another rollover finished since load | epoch mismatch, `Duplicate` |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ROLLOVER_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `ROLLOVER_HTTP_PORT` | No | `8080` | HTTP trigger port |
//! | `ROLLOVER_CRON_LEASE_TTL_SECS` | No | `300` | Cron lease lifetime |
//! | `ROLLOVER_TODO_RETENTION_DAYS` | No | `30` | Completed to-do retention |
//! | `ROLLOVER_SUBSCRIBER_TODO_RETENTION_DAYS` | No | `90` | Retention for subscribers |

#![deny(missing_docs)]

/// Game-day arithmetic.
pub mod calendar;

/// Task bucketing by kind.
pub mod classify;

/// Configuration loaded from environment variables.
pub mod config;

/// Rollover trigger and admin handlers.
pub mod cron_handlers;

/// Error types with stable error codes.
pub mod error;

/// Per-user cron lease.
pub mod guard;

/// HTTP routes for the trigger surface.
#[cfg(feature = "server")]
pub mod http;

/// Embedded database migrations.
pub mod migrations;

/// Persistence layer for users, tasks and groups.
pub mod persistence;

/// Quest, group task and retention effects of a rollover.
pub mod propagation;

/// The rollover engine.
pub mod rollover;

/// Embeddable HTTP runtime.
#[cfg(feature = "server")]
pub mod runtime;

/// Task value decay curve.
pub mod scoring;
