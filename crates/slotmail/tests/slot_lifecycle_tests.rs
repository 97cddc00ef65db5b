//! Slot registry behaviour: attach, verify, toggle, signatures, delete.

mod common;

use std::time::Duration;

use secrecy::SecretString;

use common::{TestHarness, ACCOUNT};
use slotmail::slots::{SlotStatus, SlotToggle};
use slotmail::transport::TransportError;
use slotmail::EngineError;

#[tokio::test]
async fn custom_slot_starts_inactive_and_unverified() {
    let h = TestHarness::new();
    let slot = h.custom_slot(ACCOUNT, 2, "sales@example.com");

    assert_eq!(slot.status, SlotStatus::Inactive);
    assert!(!slot.is_verified);
    assert_eq!(slot.daily_limit, h.config.quota.custom);
    assert_eq!(slot.slot_number.get(), 2);
}

#[tokio::test]
async fn activating_unverified_slot_fails_without_mutation() {
    let h = TestHarness::new();
    let before = h.custom_slot(ACCOUNT, 1, "sales@example.com");

    let err = h
        .engine
        .slots
        .set_status(ACCOUNT, 1, SlotToggle::Active)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotVerified));

    let after = h.reload(&before.id);
    assert_eq!(after.status, SlotStatus::Inactive);
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn successful_verification_activates_slot() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 1, "sales@example.com");

    let slot = h.engine.slots.verify_slot(ACCOUNT, 1).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Active);
    assert!(slot.is_verified);
    assert!(slot.error_log.is_none());
    assert_eq!(h.transport.probe_count(), 1);
    assert!(h.transport.deliveries().is_empty());
}

#[tokio::test]
async fn failed_verification_records_diagnostic() {
    let h = TestHarness::new();
    let slot = h.custom_slot(ACCOUNT, 1, "sales@example.com");
    h.transport.fail_probe(Some(TransportError::AuthFailed(
        "535 5.7.8 Username and Password not accepted".to_string(),
    )));

    let err = h.engine.slots.verify_slot(ACCOUNT, 1).await.unwrap_err();
    assert!(matches!(err, EngineError::AuthFailed(_)));

    let slot = h.reload(&slot.id);
    assert_eq!(slot.status, SlotStatus::Error);
    assert!(!slot.is_verified);
    let log = slot.error_log.expect("error log should be set");
    assert!(log.last_error.starts_with("AuthFailed:"));
    assert!(log.last_error.contains("535"));
}

#[tokio::test]
async fn network_failure_is_classified() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 3, "ops@example.com");
    h.transport.fail_probe(Some(TransportError::NetworkUnreachable(
        "connection refused".to_string(),
    )));

    let err = h.engine.slots.verify_slot(ACCOUNT, 3).await.unwrap_err();
    assert!(matches!(err, EngineError::NetworkUnreachable(_)));
    let log = h.engine.slots.error_log(ACCOUNT, 3).unwrap().unwrap();
    assert!(log.last_error.starts_with("NetworkUnreachable:"));
}

#[tokio::test]
async fn slow_probe_times_out() {
    let mut config = slotmail::Config::default();
    config.transport.probe_timeout_secs = 1;
    let h = TestHarness::with_config(config);
    h.custom_slot(ACCOUNT, 1, "sales@example.com");
    h.transport.set_probe_delay(Duration::from_secs(3));

    let err = h.engine.slots.verify_slot(ACCOUNT, 1).await.unwrap_err();
    assert!(matches!(err, EngineError::TimedOut(_)));
}

#[tokio::test]
async fn failed_verification_never_leaves_slot_active_when_racing_toggle() {
    let h = TestHarness::new();
    let slot = h.verified_slot(ACCOUNT, 1, "sales@example.com").await;
    h.engine
        .slots
        .set_status(ACCOUNT, 1, SlotToggle::Inactive)
        .unwrap();

    h.transport.set_probe_delay(Duration::from_millis(100));
    h.transport.fail_probe(Some(TransportError::AuthFailed(
        "535 credentials revoked".to_string(),
    )));

    let slots = h.engine.slots.clone();
    let verify = tokio::spawn(async move { slots.verify_slot(ACCOUNT, 1).await });

    let slots = h.engine.slots.clone();
    let toggler = tokio::spawn(async move {
        for _ in 0..20 {
            let _ = slots.set_status(ACCOUNT, 1, SlotToggle::Active);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    assert!(verify.await.unwrap().is_err());
    toggler.await.unwrap();

    let after = h.reload(&slot.id);
    assert_ne!(after.status, SlotStatus::Active);
    assert!(!after.is_verified);
    assert!(matches!(
        h.engine.slots.set_status(ACCOUNT, 1, SlotToggle::Active),
        Err(EngineError::NotVerified)
    ));
}

#[tokio::test]
async fn occupied_and_invalid_positions() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 1, "sales@example.com");

    let settings = slotmail::CustomSmtpSettings {
        email: "other@example.com".to_string(),
        host: "smtp.example.com".to_string(),
        port: 587,
        secure: false,
        password: SecretString::from("pw"),
    };
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 1, &settings),
        Err(EngineError::SlotOccupied { slot_number: 1 })
    ));
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 0, &settings),
        Err(EngineError::InvalidSlot(_))
    ));
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 6, &settings),
        Err(EngineError::InvalidSlot(_))
    ));

    // Same position on another account is independent.
    h.engine
        .slots
        .add_custom_slot("acct-2", 1, &settings)
        .unwrap();
}

#[tokio::test]
async fn custom_settings_are_validated() {
    let h = TestHarness::new();
    let mut settings = slotmail::CustomSmtpSettings {
        email: "not-an-address".to_string(),
        host: "smtp.example.com".to_string(),
        port: 587,
        secure: false,
        password: SecretString::from("pw"),
    };
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 1, &settings),
        Err(EngineError::Validation(_))
    ));

    settings.email = "ok@example.com".to_string();
    settings.host = "bad host".to_string();
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 1, &settings),
        Err(EngineError::Validation(_))
    ));

    settings.host = "smtp.example.com".to_string();
    settings.port = 0;
    assert!(matches!(
        h.engine.slots.add_custom_slot(ACCOUNT, 1, &settings),
        Err(EngineError::Validation(_))
    ));
    assert!(h.engine.slots.get_slot(ACCOUNT, 1).unwrap().is_none());
}

#[tokio::test]
async fn list_returns_all_five_positions() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 2, "two@example.com");
    h.custom_slot(ACCOUNT, 5, "five@example.com");

    let positions = h.engine.slots.list_slots(ACCOUNT).unwrap();
    let numbers: Vec<u8> = positions.iter().map(|p| p.slot_number.get()).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    let occupied: Vec<bool> = positions.iter().map(|p| p.slot.is_some()).collect();
    assert_eq!(occupied, vec![false, true, false, false, true]);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 4, "four@example.com");

    h.engine.slots.delete_slot(ACCOUNT, 4).unwrap();
    h.engine.slots.delete_slot(ACCOUNT, 4).unwrap();
    assert!(h.engine.slots.get_slot(ACCOUNT, 4).unwrap().is_none());

    // The position can be reused.
    h.custom_slot(ACCOUNT, 4, "four-again@example.com");
}

#[tokio::test]
async fn signature_requires_verified_active_slot() {
    let h = TestHarness::new();
    h.custom_slot(ACCOUNT, 1, "sales@example.com");

    assert!(matches!(
        h.engine.slots.update_signature(ACCOUNT, 1, "<b>Sales</b>"),
        Err(EngineError::NotVerified)
    ));

    h.engine.slots.verify_slot(ACCOUNT, 1).await.unwrap();
    let slot = h
        .engine
        .slots
        .update_signature(ACCOUNT, 1, "<b>Sales</b>")
        .unwrap();
    assert_eq!(slot.signature.as_deref(), Some("<b>Sales</b>"));

    h.engine
        .slots
        .set_status(ACCOUNT, 1, SlotToggle::Inactive)
        .unwrap();
    assert!(matches!(
        h.engine.slots.delete_signature(ACCOUNT, 1),
        Err(EngineError::SlotUnavailable { .. })
    ));

    h.engine
        .slots
        .set_status(ACCOUNT, 1, SlotToggle::Active)
        .unwrap();
    let slot = h.engine.slots.delete_signature(ACCOUNT, 1).unwrap();
    assert!(slot.signature.is_none());
}

#[tokio::test]
async fn oauth_slot_is_active_on_attach() {
    let h = TestHarness::new();
    let slot = h.oauth_slot(ACCOUNT, 1, 3600);

    assert_eq!(slot.status, SlotStatus::Active);
    assert!(slot.is_verified);
    assert_eq!(slot.daily_limit, h.config.quota.gmail);

    let err = h
        .engine
        .slots
        .add_oauth_slot(
            ACCOUNT,
            2,
            slotmail::Provider::Custom,
            "x@example.com",
            &slotmail::OAuthGrant {
                access_token: SecretString::from("a"),
                refresh_token: SecretString::from("r"),
                expires_in: 3600,
            },
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn password_change_requires_reverification() {
    let h = TestHarness::new();
    let slot = h.verified_slot(ACCOUNT, 1, "sales@example.com").await;

    let updated = h
        .engine
        .slots
        .update_custom_password(ACCOUNT, 1, &SecretString::from("new-password"))
        .unwrap();
    assert_eq!(updated.id, slot.id);
    assert_eq!(updated.status, SlotStatus::Inactive);
    assert!(!updated.is_verified);

    h.engine.slots.verify_slot(ACCOUNT, 1).await.unwrap();
    h.engine
        .slots
        .set_status(ACCOUNT, 1, SlotToggle::Active)
        .unwrap();
}

#[tokio::test]
async fn reconnect_restores_flagged_oauth_slot() {
    let h = TestHarness::new();
    let slot = h.oauth_slot(ACCOUNT, 1, 3600);
    h.engine
        .slots
        .mark_needs_reauth(&slot.id, "ReauthRequired: invalid_grant")
        .unwrap();
    assert_eq!(h.reload(&slot.id).status, SlotStatus::NeedsReauth);

    let slot = h
        .engine
        .slots
        .reconnect_oauth_slot(
            ACCOUNT,
            1,
            &slotmail::OAuthGrant {
                access_token: SecretString::from("new-access"),
                refresh_token: SecretString::from("new-refresh"),
                expires_in: 3600,
            },
        )
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Active);
    assert!(slot.is_verified);
}
