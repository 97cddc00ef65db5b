//! Scheduled email repository: queue storage for `scheduled_emails`.
//!
//! Dispatch outcomes are written with `status = 'pending'` in the WHERE clause;
//! a `false` return means the record was deleted or already finished.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{format_ts, parse_ts, Database, DatabaseError};
use crate::scheduler::queue::{ScheduledEmail, ScheduledStatus};
use crate::send::message::{Attachment, OutgoingEmail};

const COLUMNS: &str = "id, account_id, recipients, subject, html, text_body, attachments,
    signature, send_at, time_zone, status, slot_id, attempts, last_attempt_error, sent_at,
    created_at, updated_at";

/// A raw scheduled email row from the database.
#[derive(Debug, Clone)]
struct ScheduledRow {
    id: String,
    account_id: String,
    recipients: String,
    subject: String,
    html: String,
    text_body: Option<String>,
    attachments: String,
    signature: Option<String>,
    send_at: String,
    time_zone: String,
    status: String,
    slot_id: Option<String>,
    attempts: i64,
    last_attempt_error: Option<String>,
    sent_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduledRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            recipients: row.get("recipients")?,
            subject: row.get("subject")?,
            html: row.get("html")?,
            text_body: row.get("text_body")?,
            attachments: row.get("attachments")?,
            signature: row.get("signature")?,
            send_at: row.get("send_at")?,
            time_zone: row.get("time_zone")?,
            status: row.get("status")?,
            slot_id: row.get("slot_id")?,
            attempts: row.get("attempts")?,
            last_attempt_error: row.get("last_attempt_error")?,
            sent_at: row.get("sent_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_email(self) -> Result<ScheduledEmail, DatabaseError> {
        let to: Vec<String> = serde_json::from_str(&self.recipients)?;
        let attachments: Vec<Attachment> = serde_json::from_str(&self.attachments)?;
        let status = self
            .status
            .parse::<ScheduledStatus>()
            .map_err(|e| DatabaseError::Corrupt {
                column: "status",
                reason: e.to_string(),
            })?;

        Ok(ScheduledEmail {
            id: self.id,
            account_id: self.account_id,
            message: OutgoingEmail {
                to,
                subject: self.subject,
                html: self.html,
                text: self.text_body,
                attachments,
                signature: self.signature,
            },
            send_at: parse_ts("send_at", &self.send_at)?,
            time_zone: self.time_zone,
            status,
            slot_id: self.slot_id,
            attempts: u32::try_from(self.attempts).map_err(|e| DatabaseError::Corrupt {
                column: "attempts",
                reason: e.to_string(),
            })?,
            last_attempt_error: self.last_attempt_error,
            sent_at: self
                .sent_at
                .as_deref()
                .map(|s| parse_ts("sent_at", s))
                .transpose()?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

/// Inserts a new scheduled email.
pub fn insert(db: &Database, email: &ScheduledEmail) -> Result<(), DatabaseError> {
    let recipients = serde_json::to_string(&email.message.to)?;
    let attachments = serde_json::to_string(&email.message.attachments)?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO scheduled_emails (id, account_id, recipients, subject, html, text_body,
             attachments, signature, send_at, time_zone, status, slot_id, attempts,
             last_attempt_error, sent_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                email.id,
                email.account_id,
                recipients,
                email.message.subject,
                email.message.html,
                email.message.text,
                attachments,
                email.message.signature,
                format_ts(&email.send_at),
                email.time_zone,
                email.status.as_str(),
                email.slot_id,
                email.attempts,
                email.last_attempt_error,
                email.sent_at.as_ref().map(format_ts),
                format_ts(&email.created_at),
                format_ts(&email.updated_at),
            ],
        )?;
        Ok(())
    })
}

/// Finds a scheduled email owned by an account.
pub fn find(
    db: &Database,
    account_id: &str,
    id: &str,
) -> Result<Option<ScheduledEmail>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM scheduled_emails WHERE id = ?1 AND account_id = ?2",
            COLUMNS
        );
        let row = conn
            .query_row(&sql, params![id, account_id], ScheduledRow::from_row)
            .optional()?;
        row.map(ScheduledRow::into_email).transpose()
    })
}

/// Returns one page of an account's queue, newest first, plus the total count.
pub fn list_page(
    db: &Database,
    account_id: &str,
    limit: u32,
    offset: u64,
) -> Result<(Vec<ScheduledEmail>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_emails WHERE account_id = ?1",
            params![account_id],
            |r| r.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM scheduled_emails WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![account_id, limit, offset as i64],
                ScheduledRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let emails = rows
            .into_iter()
            .map(ScheduledRow::into_email)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((emails, total.max(0) as u64))
    })
}

/// Deletes a scheduled email owned by an account. Returns whether a row was removed.
pub fn delete(db: &Database, account_id: &str, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM scheduled_emails WHERE id = ?1 AND account_id = ?2",
            params![id, account_id],
        )?;
        Ok(n > 0)
    })
}

/// Pending emails whose `send_at` has passed, oldest first.
pub fn due(
    db: &Database,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<ScheduledEmail>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM scheduled_emails WHERE status = 'pending' AND send_at <= ?1
             ORDER BY send_at ASC, created_at ASC LIMIT ?2",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![format_ts(&now), limit], ScheduledRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ScheduledRow::into_email).collect()
    })
}

/// Marks a pending email as sent.
pub fn mark_sent(
    db: &Database,
    id: &str,
    attempts: u32,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = format_ts(&now);
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE scheduled_emails SET status = 'sent', attempts = ?2,
                last_attempt_error = ?3, sent_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![id, attempts, note, ts],
        )?;
        Ok(n > 0)
    })
}

/// Keeps a pending email pending with a later `send_at`.
pub fn reschedule(
    db: &Database,
    id: &str,
    attempts: u32,
    send_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE scheduled_emails SET attempts = ?2, send_at = ?3,
                last_attempt_error = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'pending'",
            params![id, attempts, format_ts(&send_at), error, format_ts(&now)],
        )?;
        Ok(n > 0)
    })
}

/// Moves a pending email to `failed`.
pub fn mark_failed(
    db: &Database,
    id: &str,
    attempts: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE scheduled_emails SET status = 'failed', attempts = ?2,
                last_attempt_error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![id, attempts, error, format_ts(&now)],
        )?;
        Ok(n > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, m, 0).unwrap()
    }

    fn sample(id: &str, account: &str, send_at: DateTime<Utc>, created: DateTime<Utc>) -> ScheduledEmail {
        ScheduledEmail {
            id: id.to_string(),
            account_id: account.to_string(),
            message: OutgoingEmail {
                to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
                subject: "Launch".to_string(),
                html: "<p>Launch day</p>".to_string(),
                text: Some("Launch day".to_string()),
                attachments: vec![Attachment {
                    filename: "plan.txt".to_string(),
                    content_type: Some("text/plain".to_string()),
                    content: b"step one".to_vec(),
                }],
                signature: None,
            },
            send_at,
            time_zone: "Europe/Berlin".to_string(),
            status: ScheduledStatus::Pending,
            slot_id: None,
            attempts: 0,
            last_attempt_error: None,
            sent_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample("e1", "acct", at(12, 0), at(8, 0))).unwrap();

        let found = find(&db, "acct", "e1").unwrap().unwrap();
        assert_eq!(found.message.to.len(), 2);
        assert_eq!(found.message.attachments[0].content, b"step one");
        assert_eq!(found.send_at, at(12, 0));
        assert_eq!(found.status, ScheduledStatus::Pending);

        // Other accounts cannot see it.
        assert!(find(&db, "intruder", "e1").unwrap().is_none());
    }

    #[test]
    fn test_list_page_newest_first() {
        let db = test_db();
        for (i, created) in [at(8, 0), at(9, 0), at(10, 0)].into_iter().enumerate() {
            insert(&db, &sample(&format!("e{}", i), "acct", at(12, 0), created)).unwrap();
        }
        insert(&db, &sample("x", "other", at(12, 0), at(11, 0))).unwrap();

        let (page, total) = list_page(&db, "acct", 2, 0).unwrap();
        assert_eq!(total, 3);
        let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);

        let (page, _) = list_page(&db, "acct", 2, 2).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "e0");
    }

    #[test]
    fn test_due_selects_pending_past_records() {
        let db = test_db();
        insert(&db, &sample("late", "acct", at(9, 0), at(8, 0))).unwrap();
        insert(&db, &sample("later", "acct", at(9, 30), at(8, 0))).unwrap();
        insert(&db, &sample("future", "acct", at(13, 0), at(8, 0))).unwrap();
        let mut done = sample("done", "acct", at(8, 0), at(7, 0));
        done.status = ScheduledStatus::Sent;
        insert(&db, &done).unwrap();

        let due_now = due(&db, at(10, 0), 10).unwrap();
        let ids: Vec<&str> = due_now.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "later"]);

        assert_eq!(due(&db, at(10, 0), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_outcome_updates_are_pending_only() {
        let db = test_db();
        insert(&db, &sample("e1", "acct", at(9, 0), at(8, 0))).unwrap();

        let retry_at = at(10, 0) + Duration::minutes(5);
        assert!(reschedule(&db, "e1", 1, retry_at, "TimedOut", at(10, 0)).unwrap());
        let e = find(&db, "acct", "e1").unwrap().unwrap();
        assert_eq!(e.attempts, 1);
        assert_eq!(e.send_at, retry_at);
        assert!(due(&db, at(10, 4), 10).unwrap().is_empty());

        assert!(mark_failed(&db, "e1", 2, "AuthFailed", at(10, 6)).unwrap());
        assert!(!mark_sent(&db, "e1", 3, None, at(10, 7)).unwrap());
        let e = find(&db, "acct", "e1").unwrap().unwrap();
        assert_eq!(e.status, ScheduledStatus::Failed);
        assert_eq!(e.last_attempt_error.as_deref(), Some("AuthFailed"));
    }

    #[test]
    fn test_deleted_record_discards_outcome() {
        let db = test_db();
        insert(&db, &sample("e1", "acct", at(9, 0), at(8, 0))).unwrap();
        assert!(delete(&db, "acct", "e1").unwrap());
        assert!(!delete(&db, "acct", "e1").unwrap());
        assert!(!mark_sent(&db, "e1", 1, None, at(10, 0)).unwrap());
    }

    #[test]
    fn test_mark_sent_records_timestamp() {
        let db = test_db();
        insert(&db, &sample("e1", "acct", at(9, 0), at(8, 0))).unwrap();
        assert!(mark_sent(&db, "e1", 1, Some("b@example.com: 550"), at(9, 1)).unwrap());

        let e = find(&db, "acct", "e1").unwrap().unwrap();
        assert_eq!(e.status, ScheduledStatus::Sent);
        assert_eq!(e.sent_at, Some(at(9, 1)));
        assert_eq!(e.last_attempt_error.as_deref(), Some("b@example.com: 550"));
    }
}
