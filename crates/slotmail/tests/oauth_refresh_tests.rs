//! OAuth access token refresh during sends and verification.

mod common;

use std::time::Duration;

use common::{message, TestHarness, ACCOUNT};
use slotmail::send::SlotChoice;
use slotmail::slots::SlotStatus;
use slotmail::EngineError;

#[tokio::test]
async fn fresh_token_is_used_as_is() {
    let h = TestHarness::new();
    h.oauth_slot(ACCOUNT, 1, 3600);

    h.engine
        .sender
        .send(ACCOUNT, &message(&["a@example.com"]), SlotChoice::Auto)
        .await
        .unwrap();

    assert_eq!(h.refresher.calls(), 0);
    let delivery = h.transport.deliveries().pop().unwrap();
    assert_eq!(delivery.secret, "initial-access");
    assert_eq!(delivery.username, "ana@gmail.com");
}

#[tokio::test]
async fn concurrent_sends_share_one_refresh() {
    let h = TestHarness::new();
    let slot = h.oauth_slot(ACCOUNT, 1, 5);
    h.refresher.set_delay(Duration::from_millis(100));

    let first = message(&["a@example.com"]);
    let second = message(&["b@example.com"]);
    let (r1, r2) = tokio::join!(
        h.engine.sender.send(ACCOUNT, &first, SlotChoice::Auto),
        h.engine
            .sender
            .send(ACCOUNT, &second, SlotChoice::Explicit(slot.id.clone())),
    );
    assert_eq!(r1.unwrap().accepted.len(), 1);
    assert_eq!(r2.unwrap().accepted.len(), 1);

    assert_eq!(h.refresher.calls(), 1);
    let deliveries = h.transport.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.secret == "fresh-access-1"));

    // The refreshed token is persisted and reused.
    h.engine
        .sender
        .send(ACCOUNT, &message(&["c@example.com"]), SlotChoice::Auto)
        .await
        .unwrap();
    assert_eq!(h.refresher.calls(), 1);
}

#[tokio::test]
async fn rejected_refresh_flags_slot_and_releases_quota() {
    let h = TestHarness::new();
    let slot = h.oauth_slot(ACCOUNT, 1, 5);
    h.refresher.reject(true);

    let err = h
        .engine
        .sender
        .send(ACCOUNT, &message(&["a@example.com"]), SlotChoice::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReauthRequired(_)));

    let after = h.reload(&slot.id);
    assert_eq!(after.status, SlotStatus::NeedsReauth);
    assert!(!after.is_verified);
    assert!(after
        .error_log
        .unwrap()
        .last_error
        .starts_with("ReauthRequired:"));
    assert_eq!(after.quota_reserved, 0);
    assert_eq!(after.emails_sent_today, 0);
    assert!(h.transport.deliveries().is_empty());
}

#[tokio::test]
async fn verification_with_rejected_refresh_needs_reauth() {
    let h = TestHarness::new();
    let slot = h.oauth_slot(ACCOUNT, 2, 0);
    h.refresher.reject(true);

    let err = h.engine.slots.verify_slot(ACCOUNT, 2).await.unwrap_err();
    assert!(matches!(err, EngineError::ReauthRequired(_)));
    assert_eq!(h.reload(&slot.id).status, SlotStatus::NeedsReauth);
    assert_eq!(h.transport.probe_count(), 0);
}
