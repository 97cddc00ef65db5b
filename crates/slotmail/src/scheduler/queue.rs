//! The scheduled send queue: records, time zone resolution and listing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{scheduled_repo, Database};
use crate::error::{EngineError, Result};
use crate::send::message::OutgoingEmail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledStatus::Pending => "pending",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scheduled status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ScheduledStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduledStatus::Pending),
            "sent" => Ok(ScheduledStatus::Sent),
            "failed" => Ok(ScheduledStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// An email waiting for (or done with) deferred dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEmail {
    pub id: String,
    pub account_id: String,
    pub message: OutgoingEmail,
    /// The absolute instant the email becomes due.
    pub send_at: DateTime<Utc>,
    /// IANA zone the user scheduled in.
    pub time_zone: String,
    pub status: ScheduledStatus,
    pub slot_id: Option<String>,
    /// Dispatch attempts made so far.
    pub attempts: u32,
    pub last_attempt_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub message: OutgoingEmail,
    #[serde(default)]
    pub slot_id: Option<String>,
    /// Wall-clock time in `time_zone`.
    pub send_at: NaiveDateTime,
    pub time_zone: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPage {
    pub items: Vec<ScheduledEmail>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Converts a wall-clock time in an IANA zone to UTC. Times skipped by a DST
/// transition are rejected; repeated times resolve to the earlier instant.
pub fn resolve_send_at(local: NaiveDateTime, time_zone: &str) -> Result<DateTime<Utc>> {
    let tz: Tz = time_zone
        .parse()
        .map_err(|_| EngineError::Validation(format!("unknown time zone '{}'", time_zone)))?;

    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Ok(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(EngineError::Validation(format!(
            "{} does not exist in {} (daylight saving gap)",
            local, time_zone
        ))),
    }
}

#[derive(Clone)]
pub struct ScheduledQueue {
    db: Database,
    max_recipients: usize,
}

impl ScheduledQueue {
    pub fn new(db: Database, max_recipients: usize) -> Self {
        Self { db, max_recipients }
    }

    pub fn schedule(&self, account_id: &str, request: ScheduleRequest) -> Result<ScheduledEmail> {
        self.schedule_at(account_id, request, Utc::now())
    }

    /// Stores a pending email. A `send_at` in the past is accepted and picked
    /// up by the next poll.
    pub fn schedule_at(
        &self,
        account_id: &str,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduledEmail> {
        if request.message.to.is_empty() {
            return Err(EngineError::Validation("no recipients".to_string()));
        }
        if request.message.to.len() > self.max_recipients {
            return Err(EngineError::Validation(format!(
                "{} recipients exceed the limit of {}",
                request.message.to.len(),
                self.max_recipients
            )));
        }
        let send_at = resolve_send_at(request.send_at, &request.time_zone)?;

        let email = ScheduledEmail {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            message: request.message,
            send_at,
            time_zone: request.time_zone,
            status: ScheduledStatus::Pending,
            slot_id: request.slot_id,
            attempts: 0,
            last_attempt_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        scheduled_repo::insert(&self.db, &email)?;
        tracing::info!(id = %email.id, account_id, send_at = %email.send_at, "Email scheduled");
        Ok(email)
    }

    /// Newest first. `page` is 1-based.
    pub fn list(&self, account_id: &str, page: u32, per_page: u32) -> Result<ScheduledPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let offset = u64::from(page - 1) * u64::from(per_page);
        let (items, total) = scheduled_repo::list_page(&self.db, account_id, per_page, offset)?;
        Ok(ScheduledPage {
            items,
            total,
            page,
            per_page,
        })
    }

    pub fn get(&self, account_id: &str, id: &str) -> Result<ScheduledEmail> {
        scheduled_repo::find(&self.db, account_id, id)?
            .ok_or_else(|| EngineError::ScheduledEmailNotFound(id.to_string()))
    }

    /// Removes the email whatever its status. A dispatch already in flight
    /// finishes, but its outcome is discarded.
    pub fn delete(&self, account_id: &str, id: &str) -> Result<()> {
        if !scheduled_repo::delete(&self.db, account_id, id)? {
            return Err(EngineError::ScheduledEmailNotFound(id.to_string()));
        }
        Ok(())
    }
}
