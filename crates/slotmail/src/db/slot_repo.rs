//! Slot repository: CRUD, status transitions and quota counters for `smtp_slots`.
//!
//! Every write is a single statement (or a short sequence under the same
//! connection lock), so conditional updates double as the concurrency guard.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_ts, Database, DatabaseError};
use crate::slots::types::{
    AuthKind, ErrorLog, Provider, SlotNumber, SlotStatus, SmtpSlot, StoredCredentials,
};

const SLOT_COLUMNS: &str = "id, account_id, slot_number, provider, email, auth_kind,
    access_token, refresh_token, token_expires_at, smtp_host, smtp_port, smtp_secure, password,
    status, is_verified, daily_limit, emails_sent_today, quota_reserved, quota_reset_at,
    last_error, last_error_at, signature, created_at, updated_at";

/// A raw slot row from the database.
#[derive(Debug, Clone)]
struct SlotRow {
    id: String,
    account_id: String,
    slot_number: i64,
    provider: String,
    email: String,
    auth_kind: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_expires_at: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<i64>,
    smtp_secure: Option<bool>,
    password: Option<String>,
    status: String,
    is_verified: bool,
    daily_limit: i64,
    emails_sent_today: i64,
    quota_reserved: i64,
    quota_reset_at: String,
    last_error: Option<String>,
    last_error_at: Option<String>,
    signature: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SlotRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            slot_number: row.get("slot_number")?,
            provider: row.get("provider")?,
            email: row.get("email")?,
            auth_kind: row.get("auth_kind")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_expires_at: row.get("token_expires_at")?,
            smtp_host: row.get("smtp_host")?,
            smtp_port: row.get("smtp_port")?,
            smtp_secure: row.get("smtp_secure")?,
            password: row.get("password")?,
            status: row.get("status")?,
            is_verified: row.get("is_verified")?,
            daily_limit: row.get("daily_limit")?,
            emails_sent_today: row.get("emails_sent_today")?,
            quota_reserved: row.get("quota_reserved")?,
            quota_reset_at: row.get("quota_reset_at")?,
            last_error: row.get("last_error")?,
            last_error_at: row.get("last_error_at")?,
            signature: row.get("signature")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_slot(self) -> Result<SmtpSlot, DatabaseError> {
        let auth_kind: AuthKind = self.auth_kind.parse().map_err(corrupt("auth_kind"))?;
        let credentials = match auth_kind {
            AuthKind::OAuth => StoredCredentials::OAuth {
                access_token: required("access_token", self.access_token)?,
                refresh_token: required("refresh_token", self.refresh_token)?,
                expires_at: parse_ts(
                    "token_expires_at",
                    &required("token_expires_at", self.token_expires_at)?,
                )?,
            },
            AuthKind::Password => StoredCredentials::Password {
                host: required("smtp_host", self.smtp_host)?,
                port: u16::try_from(required("smtp_port", self.smtp_port)?)
                    .map_err(corrupt("smtp_port"))?,
                secure: self.smtp_secure.unwrap_or(false),
                password: required("password", self.password)?,
            },
        };

        let error_log = match (self.last_error, self.last_error_at) {
            (Some(message), Some(at)) => Some(ErrorLog {
                last_error: message,
                at: parse_ts("last_error_at", &at)?,
            }),
            _ => None,
        };

        let slot_number = u8::try_from(self.slot_number)
            .ok()
            .and_then(|n| SlotNumber::new(n).ok())
            .ok_or_else(|| DatabaseError::Corrupt {
                column: "slot_number",
                reason: self.slot_number.to_string(),
            })?;

        Ok(SmtpSlot {
            id: self.id,
            account_id: self.account_id,
            slot_number,
            provider: self.provider.parse::<Provider>().map_err(corrupt("provider"))?,
            email: self.email,
            auth_kind,
            credentials,
            status: self.status.parse::<SlotStatus>().map_err(corrupt("status"))?,
            is_verified: self.is_verified,
            daily_limit: counter("daily_limit", self.daily_limit)?,
            emails_sent_today: counter("emails_sent_today", self.emails_sent_today)?,
            quota_reserved: counter("quota_reserved", self.quota_reserved)?,
            quota_reset_at: parse_ts("quota_reset_at", &self.quota_reset_at)?,
            error_log,
            signature: self.signature,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

fn corrupt<E: std::fmt::Display>(column: &'static str) -> impl Fn(E) -> DatabaseError {
    move |e| DatabaseError::Corrupt {
        column,
        reason: e.to_string(),
    }
}

fn required<T>(column: &'static str, value: Option<T>) -> Result<T, DatabaseError> {
    value.ok_or(DatabaseError::Corrupt {
        column,
        reason: "missing value".to_string(),
    })
}

fn counter(column: &'static str, value: i64) -> Result<u32, DatabaseError> {
    u32::try_from(value).map_err(corrupt(column))
}

fn query_one(
    conn: &Connection,
    clause: &str,
    args: impl rusqlite::Params,
) -> Result<Option<SmtpSlot>, DatabaseError> {
    let sql = format!("SELECT {} FROM smtp_slots WHERE {}", SLOT_COLUMNS, clause);
    let row = conn
        .query_row(&sql, args, SlotRow::from_row)
        .optional()?;
    row.map(SlotRow::into_slot).transpose()
}

/// Credential columns in table order: access, refresh, expiry, host, port, secure, password.
type CredentialColumns<'a> = (
    Option<&'a str>,
    Option<&'a str>,
    Option<String>,
    Option<&'a str>,
    Option<u16>,
    Option<bool>,
    Option<&'a str>,
);

fn credential_columns(credentials: &StoredCredentials) -> CredentialColumns<'_> {
    match credentials {
        StoredCredentials::OAuth {
            access_token,
            refresh_token,
            expires_at,
        } => (
            Some(access_token),
            Some(refresh_token),
            Some(format_ts(expires_at)),
            None,
            None,
            None,
            None,
        ),
        StoredCredentials::Password {
            host,
            port,
            secure,
            password,
        } => (
            None,
            None,
            None,
            Some(host),
            Some(*port),
            Some(*secure),
            Some(password),
        ),
    }
}

/// Inserts a slot unless its position is already taken. Returns `false` when occupied.
pub fn insert_if_vacant(db: &Database, slot: &SmtpSlot) -> Result<bool, DatabaseError> {
    let (access, refresh, expires, host, port, secure, password) =
        credential_columns(&slot.credentials);

    db.with_conn(|conn| {
        let occupied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM smtp_slots WHERE account_id = ?1 AND slot_number = ?2)",
            params![slot.account_id, slot.slot_number.get()],
            |r| r.get(0),
        )?;
        if occupied {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO smtp_slots (id, account_id, slot_number, provider, email, auth_kind,
                access_token, refresh_token, token_expires_at, smtp_host, smtp_port, smtp_secure,
                password, status, is_verified, daily_limit, emails_sent_today, quota_reserved,
                quota_reset_at, signature, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, 0, ?18, ?19, ?20, ?21)",
            params![
                slot.id,
                slot.account_id,
                slot.slot_number.get(),
                slot.provider.as_str(),
                slot.email,
                slot.auth_kind.as_str(),
                access,
                refresh,
                expires,
                host,
                port,
                secure,
                password,
                slot.status.as_str(),
                slot.is_verified,
                slot.daily_limit,
                slot.emails_sent_today,
                format_ts(&slot.quota_reset_at),
                slot.signature,
                format_ts(&slot.created_at),
                format_ts(&slot.updated_at),
            ],
        )?;
        Ok(true)
    })
}

/// Finds the slot at a position of an account.
pub fn find_by_position(
    db: &Database,
    account_id: &str,
    slot_number: SlotNumber,
) -> Result<Option<SmtpSlot>, DatabaseError> {
    db.with_conn(|conn| {
        query_one(
            conn,
            "account_id = ?1 AND slot_number = ?2",
            params![account_id, slot_number.get()],
        )
    })
}

/// Finds a slot by id.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<SmtpSlot>, DatabaseError> {
    db.with_conn(|conn| query_one(conn, "id = ?1", params![id]))
}

/// Lists an account's slots ordered by slot number.
pub fn list_by_account(db: &Database, account_id: &str) -> Result<Vec<SmtpSlot>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM smtp_slots WHERE account_id = ?1 ORDER BY slot_number ASC",
            SLOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![account_id], SlotRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SlotRow::into_slot).collect()
    })
}

/// Deletes the slot at a position. Returns whether a row was removed.
pub fn delete_by_position(
    db: &Database,
    account_id: &str,
    slot_number: SlotNumber,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM smtp_slots WHERE account_id = ?1 AND slot_number = ?2",
            params![account_id, slot_number.get()],
        )?;
        Ok(n > 0)
    })
}

/// Sets the status. Moving to `active` only succeeds on a verified slot;
/// returns `false` when the slot is missing or the condition failed.
pub fn set_status_checked(
    db: &Database,
    id: &str,
    status: SlotStatus,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE smtp_slots SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND (?2 <> 'active' OR is_verified = 1)",
            params![id, status.as_str(), format_ts(&now)],
        )?;
        Ok(n > 0)
    })
}

/// Records a successful probe: verified, active, error log cleared.
pub fn mark_verified(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE smtp_slots SET status = 'active', is_verified = 1,
                last_error = NULL, last_error_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, format_ts(&now)],
        )?;
        Ok(n > 0)
    })
}

/// Marks the slot unverified in `status`, recording the failure.
pub fn mark_failed(
    db: &Database,
    id: &str,
    status: SlotStatus,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = format_ts(&now);
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE smtp_slots SET status = ?2, is_verified = 0,
                last_error = ?3, last_error_at = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), message, ts],
        )?;
        Ok(n > 0)
    })
}

/// Records a failure without changing status.
pub fn record_error(
    db: &Database,
    id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let ts = format_ts(&now);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE smtp_slots SET last_error = ?2, last_error_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, message, ts],
        )?;
        Ok(())
    })
}

/// Clears the error log if one is set.
pub fn clear_error(db: &Database, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE smtp_slots SET last_error = NULL, last_error_at = NULL, updated_at = ?2
             WHERE id = ?1 AND last_error IS NOT NULL",
            params![id, format_ts(&now)],
        )?;
        Ok(())
    })
}

/// Sets or clears the signature of an active, verified slot.
pub fn update_signature(
    db: &Database,
    id: &str,
    signature: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE smtp_slots SET signature = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'active' AND is_verified = 1",
            params![id, signature, format_ts(&now)],
        )?;
        Ok(n > 0)
    })
}

/// Stores a refreshed OAuth token pair.
pub fn update_oauth_tokens(
    db: &Database,
    id: &str,
    access_token: &str,
    refresh_token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE smtp_slots SET access_token = ?2, refresh_token = ?3,
                token_expires_at = ?4, updated_at = ?5
             WHERE id = ?1 AND auth_kind = 'oauth'",
            params![
                id,
                access_token,
                refresh_token,
                format_ts(&expires_at),
                format_ts(&now)
            ],
        )?;
        Ok(())
    })
}

/// Replaces the credentials and resets status/verification accordingly.
pub fn replace_credentials(
    db: &Database,
    id: &str,
    credentials: &StoredCredentials,
    status: SlotStatus,
    is_verified: bool,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let (access, refresh, expires, host, port, secure, password) =
        credential_columns(credentials);
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE smtp_slots SET auth_kind = ?2, access_token = ?3, refresh_token = ?4,
                token_expires_at = ?5, smtp_host = ?6, smtp_port = ?7, smtp_secure = ?8,
                password = ?9, status = ?10, is_verified = ?11,
                last_error = NULL, last_error_at = NULL, updated_at = ?12
             WHERE id = ?1",
            params![
                id,
                credentials.kind().as_str(),
                access,
                refresh,
                expires,
                host,
                port,
                secure,
                password,
                status.as_str(),
                is_verified,
                format_ts(&now),
            ],
        )?;
        Ok(n > 0)
    })
}

/// Zeroes the sent counter when the reset boundary has passed.
fn roll_quota(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let n = conn.execute(
        "UPDATE smtp_slots SET emails_sent_today = 0, quota_reset_at = ?3
         WHERE id = ?1 AND quota_reset_at <= ?2",
        params![id, format_ts(&now), format_ts(&next_reset)],
    )?;
    if n > 0 {
        log::debug!("Quota counter reset for slot {}", id);
    }
    Ok(())
}

/// Reserves `count` sends if the slot is active and verified and
/// `sent + reserved + count <= daily_limit`.
///
/// `next_reset` is the boundary to store when a due reset is applied.
pub fn reserve_quota(
    db: &Database,
    id: &str,
    count: u32,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        roll_quota(conn, id, now, next_reset)?;
        let n = conn.execute(
            "UPDATE smtp_slots SET quota_reserved = quota_reserved + ?2
             WHERE id = ?1 AND status = 'active' AND is_verified = 1
               AND emails_sent_today + quota_reserved + ?2 <= daily_limit",
            params![id, count],
        )?;
        Ok(n > 0)
    })
}

/// Converts a reservation of `reserved` into `accepted` sends.
pub fn commit_quota(
    db: &Database,
    id: &str,
    reserved: u32,
    accepted: u32,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let accepted = accepted.min(reserved);
    db.with_conn(|conn| {
        roll_quota(conn, id, now, next_reset)?;
        conn.execute(
            "UPDATE smtp_slots SET
                emails_sent_today = MIN(emails_sent_today + ?3, daily_limit),
                quota_reserved = MAX(quota_reserved - ?2, 0),
                updated_at = ?4
             WHERE id = ?1",
            params![id, reserved, accepted, format_ts(&now)],
        )?;
        Ok(())
    })
}

/// Returns a reservation without consuming quota.
pub fn release_quota(db: &Database, id: &str, reserved: u32) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE smtp_slots SET quota_reserved = MAX(quota_reserved - ?2, 0) WHERE id = ?1",
            params![id, reserved],
        )?;
        Ok(())
    })
}

/// Applies a due reset and returns the slot's current counters.
pub fn quota_snapshot(
    db: &Database,
    id: &str,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<Option<SmtpSlot>, DatabaseError> {
    db.with_conn(|conn| {
        roll_quota(conn, id, now, next_reset)?;
        query_one(conn, "id = ?1", params![id])
    })
}
