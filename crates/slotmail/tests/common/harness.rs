//! Test harness: a complete engine over an in-memory database with fake
//! network seams.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use slotmail::config::Config;
use slotmail::credentials::OAuthGrant;
use slotmail::db::{slot_repo, Database};
use slotmail::quota::next_reset_after;
use slotmail::secrets::SecretCipher;
use slotmail::send::OutgoingEmail;
use slotmail::slots::{
    AuthKind, CustomSmtpSettings, Provider, SlotNumber, SlotStatus, SmtpSlot, StoredCredentials,
};
use slotmail::Engine;

use super::fakes::{FakeRefresher, FakeTransport};

pub const ACCOUNT: &str = "acct-1";

const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub struct TestHarness {
    pub engine: Engine,
    pub transport: Arc<FakeTransport>,
    pub refresher: Arc<FakeRefresher>,
    pub config: Config,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let cipher = SecretCipher::from_key(&SecretString::from(TEST_KEY))
            .expect("Failed to build cipher");
        let transport = Arc::new(FakeTransport::default());
        let refresher = Arc::new(FakeRefresher::default());

        let engine = Engine::assemble(
            db,
            cipher,
            refresher.clone(),
            transport.clone(),
            &config,
        );

        Self {
            engine,
            transport,
            refresher,
            config,
        }
    }

    pub fn db(&self) -> &Database {
        &self.engine.db
    }

    /// Attaches a custom SMTP slot and leaves it unverified.
    pub fn custom_slot(&self, account: &str, slot_number: u8, email: &str) -> SmtpSlot {
        self.engine
            .slots
            .add_custom_slot(
                account,
                slot_number,
                &CustomSmtpSettings {
                    email: email.to_string(),
                    host: "smtp.example.com".to_string(),
                    port: 587,
                    secure: false,
                    password: SecretString::from("hunter2"),
                },
            )
            .expect("Failed to add custom slot")
    }

    /// Attaches a custom SMTP slot and verifies it against the fake transport.
    pub async fn verified_slot(&self, account: &str, slot_number: u8, email: &str) -> SmtpSlot {
        self.custom_slot(account, slot_number, email);
        self.engine
            .slots
            .verify_slot(account, slot_number)
            .await
            .expect("Failed to verify slot")
    }

    /// Attaches a Gmail slot whose access token expires in `expires_in` seconds.
    pub fn oauth_slot(&self, account: &str, slot_number: u8, expires_in: u64) -> SmtpSlot {
        self.engine
            .slots
            .add_oauth_slot(
                account,
                slot_number,
                Provider::Gmail,
                "ana@gmail.com",
                &OAuthGrant {
                    access_token: SecretString::from("initial-access"),
                    refresh_token: SecretString::from("refresh-1"),
                    expires_in,
                },
            )
            .expect("Failed to add OAuth slot")
    }

    pub fn reload(&self, slot_id: &str) -> SmtpSlot {
        slot_repo::find_by_id(self.db(), slot_id)
            .expect("Failed to load slot")
            .expect("Slot disappeared")
    }
}

/// A plain HTML email to the given recipients.
pub fn message(to: &[&str]) -> OutgoingEmail {
    OutgoingEmail {
        to: to.iter().map(|s| s.to_string()).collect(),
        subject: "Quarterly update".to_string(),
        html: "<p>Numbers are in.</p>".to_string(),
        text: None,
        attachments: vec![],
        signature: None,
    }
}

/// An active, verified custom slot written straight to storage, for tests
/// that control the clock.
pub fn fixture_slot(
    db: &Database,
    id: &str,
    slot_number: u8,
    daily_limit: u32,
    sent_today: u32,
    now: DateTime<Utc>,
) -> SmtpSlot {
    let slot = SmtpSlot {
        id: id.to_string(),
        account_id: ACCOUNT.to_string(),
        slot_number: SlotNumber::new(slot_number).unwrap(),
        provider: Provider::Custom,
        email: format!("{}@example.com", id),
        auth_kind: AuthKind::Password,
        credentials: StoredCredentials::Password {
            host: "smtp.example.com".to_string(),
            port: 465,
            secure: true,
            password: "unused".to_string(),
        },
        status: SlotStatus::Active,
        is_verified: true,
        daily_limit,
        emails_sent_today: sent_today,
        quota_reserved: 0,
        quota_reset_at: next_reset_after(now),
        error_log: None,
        signature: None,
        created_at: now,
        updated_at: now,
    };
    assert!(slot_repo::insert_if_vacant(db, &slot).unwrap());
    slot
}
