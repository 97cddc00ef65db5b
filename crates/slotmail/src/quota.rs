//! Per-slot daily send quota.
//!
//! A send first reserves capacity, then commits only what the transport
//! accepted. Reservations count against the limit while in flight, so parallel
//! sends on one slot can never overshoot `daily_limit`.

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::Serialize;

use crate::db::{slot_repo, Database, DatabaseError};

/// The first UTC midnight strictly after `now`.
pub fn next_reset_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

/// Snapshot of a slot's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub slot_id: String,
    pub daily_limit: u32,
    pub sent_today: u32,
    pub reserved: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct QuotaTracker {
    db: Database,
}

impl QuotaTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn reserve(
        &self,
        slot_id: &str,
        count: u32,
    ) -> Result<Option<QuotaReservation>, DatabaseError> {
        self.reserve_at(slot_id, count, Utc::now())
    }

    /// Reserves `count` sends, applying a due reset first. `None` when the
    /// slot lacks capacity (or does not exist).
    pub fn reserve_at(
        &self,
        slot_id: &str,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaReservation>, DatabaseError> {
        let granted = slot_repo::reserve_quota(&self.db, slot_id, count, now, next_reset_after(now))?;
        tracing::debug!(slot_id, count, granted, "Quota reservation");

        Ok(granted.then(|| QuotaReservation {
            db: self.db.clone(),
            slot_id: slot_id.to_string(),
            count,
            settled: false,
        }))
    }

    pub fn usage(&self, slot_id: &str) -> Result<Option<QuotaUsage>, DatabaseError> {
        self.usage_at(slot_id, Utc::now())
    }

    pub fn usage_at(
        &self,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaUsage>, DatabaseError> {
        let slot = slot_repo::quota_snapshot(&self.db, slot_id, now, next_reset_after(now))?;
        Ok(slot.map(|s| QuotaUsage {
            remaining: s
                .daily_limit
                .saturating_sub(s.emails_sent_today)
                .saturating_sub(s.quota_reserved),
            slot_id: s.id,
            daily_limit: s.daily_limit,
            sent_today: s.emails_sent_today,
            reserved: s.quota_reserved,
            resets_at: s.quota_reset_at,
        }))
    }
}

/// Capacity held for an in-flight send. Dropping it returns whatever is
/// still held; sends already consumed stay counted.
#[must_use = "an uncommitted reservation is released on drop"]
pub struct QuotaReservation {
    db: Database,
    slot_id: String,
    count: u32,
    settled: bool,
}

impl QuotaReservation {
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn commit(self, accepted: u32) -> Result<(), DatabaseError> {
        self.commit_at(accepted, Utc::now())
    }

    /// Counts `accepted` (at most the reserved count) as sent and frees the rest.
    /// A commit after the reset boundary counts in the new day.
    pub fn commit_at(mut self, accepted: u32, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.settled = true;
        slot_repo::commit_quota(
            &self.db,
            &self.slot_id,
            self.count,
            accepted,
            now,
            next_reset_after(now),
        )
    }

    pub fn consume(&mut self, sent: u32) -> Result<(), DatabaseError> {
        self.consume_at(sent, Utc::now())
    }

    /// Counts `sent` of the held sends as done now and keeps holding the rest.
    pub fn consume_at(&mut self, sent: u32, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let sent = sent.min(self.count);
        if sent == 0 {
            return Ok(());
        }
        slot_repo::commit_quota(
            &self.db,
            &self.slot_id,
            sent,
            sent,
            now,
            next_reset_after(now),
        )?;
        self.count -= sent;
        Ok(())
    }

    pub fn release(mut self) -> Result<(), DatabaseError> {
        self.settled = true;
        slot_repo::release_quota(&self.db, &self.slot_id, self.count)
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled || self.count == 0 {
            return;
        }
        if let Err(e) = slot_repo::release_quota(&self.db, &self.slot_id, self.count) {
            tracing::warn!(slot_id = %self.slot_id, error = %e, "Failed to release quota reservation");
        }
    }
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("slot_id", &self.slot_id)
            .field("count", &self.count)
            .field("settled", &self.settled)
            .finish()
    }
}
