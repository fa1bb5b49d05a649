// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Game-day arithmetic.
//!
//! A *game day* is the calendar date a moment falls on once it is shifted into
//! the user's timezone and pulled back by their custom day-start hour. With a
//! day start of 4, `03:59` local time still belongs to the previous game day.
//!
//! Every function here is pure: the current time is always an argument.

use chrono::{DateTime, Days, Duration, FixedOffset, NaiveDate, Offset, Utc};

/// Largest timezone offset accepted, in minutes (UTC+14 / UTC-14).
pub const MAX_TIMEZONE_OFFSET_MINUTES: i32 = 14 * 60;

/// Largest accepted custom day-start hour.
pub const MAX_DAY_START_HOUR: i32 = 23;

/// User calendar preferences needed to place an instant on a game day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DayBoundary {
    /// Hour (local time) at which a new game day begins.
    pub day_start_hour: i32,
    /// Offset of the user's timezone, in minutes east of UTC.
    pub timezone_offset_minutes: i32,
}

impl DayBoundary {
    /// Build a boundary, clamping out-of-range preferences.
    pub fn new(day_start_hour: i32, timezone_offset_minutes: i32) -> Self {
        Self {
            day_start_hour: day_start_hour.clamp(0, MAX_DAY_START_HOUR),
            timezone_offset_minutes: timezone_offset_minutes
                .clamp(-MAX_TIMEZONE_OFFSET_MINUTES, MAX_TIMEZONE_OFFSET_MINUTES),
        }
    }

    fn offset(&self) -> FixedOffset {
        // Clamped to ±14h in `new`, always inside FixedOffset's ±24h range.
        FixedOffset::east_opt(self.timezone_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// The game day `instant` belongs to.
    pub fn game_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        let local = instant.with_timezone(&self.offset());
        (local - Duration::hours(i64::from(self.day_start_hour))).date_naive()
    }
}

/// Number of game-day boundaries crossed between `last_cron_at` and `now`.
///
/// Returns 0 when no rollover has ever run (`last_cron_at` is `None`), when
/// both instants share a game day, and when `last_cron_at` is in the future
/// relative to `now` (clock skew never yields negative days).
pub fn days_missed(
    now: DateTime<Utc>,
    last_cron_at: Option<DateTime<Utc>>,
    day_start_hour: i32,
    timezone_offset_minutes: i32,
) -> u32 {
    let Some(last) = last_cron_at else {
        return 0;
    };
    let boundary = DayBoundary::new(day_start_hour, timezone_offset_minutes);
    let elapsed = (boundary.game_day(now) - boundary.game_day(last)).num_days();
    u32::try_from(elapsed.max(0)).unwrap_or(u32::MAX)
}

/// The game days that ended without a rollover, oldest first.
///
/// These are the `days_missed` dates starting at the game day of the last
/// rollover and stopping before the current game day.
pub fn missed_game_days(
    now: DateTime<Utc>,
    last_cron_at: Option<DateTime<Utc>>,
    boundary: DayBoundary,
) -> Vec<NaiveDate> {
    let missed = days_missed(
        now,
        last_cron_at,
        boundary.day_start_hour,
        boundary.timezone_offset_minutes,
    );
    let Some(last) = last_cron_at else {
        return Vec::new();
    };
    consecutive_days(boundary.game_day(last), missed)
}

/// `count` consecutive dates starting at `first`.
pub fn consecutive_days(first: NaiveDate, count: u32) -> Vec<NaiveDate> {
    (0..u64::from(count))
        .filter_map(|n| first.checked_add_days(Days::new(n)))
        .collect()
}
