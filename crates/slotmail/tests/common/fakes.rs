//! Scripted stand-ins for the network-facing seams.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use slotmail::credentials::{RefreshError, RefreshedToken, TokenRefresher};
use slotmail::send::PreparedMessage;
use slotmail::slots::Provider;
use slotmail::transport::{MailSession, MailTransport, TransportCredential, TransportError};

/// One message the fake transport accepted.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub username: String,
    pub secret: String,
    pub message: PreparedMessage,
}

/// Accepts everything unless told otherwise.
#[derive(Default)]
pub struct FakeTransport {
    recipient_failures: Mutex<HashMap<String, VecDeque<TransportError>>>,
    sender_failures: Mutex<HashMap<String, TransportError>>,
    every_send: Mutex<Option<TransportError>>,
    probe_failure: Mutex<Option<TransportError>>,
    send_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    deliveries: Mutex<Vec<Delivery>>,
    sessions: AtomicUsize,
    probes: AtomicUsize,
}

impl FakeTransport {
    /// Fails the next send to `recipient` with `error`. Queued failures are consumed in order.
    pub fn fail_recipient(&self, recipient: &str, error: TransportError) {
        self.recipient_failures
            .lock()
            .unwrap()
            .entry(recipient.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fails every send authenticated as `username`.
    pub fn fail_sender(&self, username: &str, error: TransportError) {
        self.sender_failures
            .lock()
            .unwrap()
            .insert(username.to_string(), error);
    }

    /// Fails every send until cleared with `None`.
    pub fn fail_all_sends(&self, error: Option<TransportError>) {
        *self.every_send.lock().unwrap() = error;
    }

    pub fn fail_probe(&self, error: Option<TransportError>) {
        *self.probe_failure.lock().unwrap() = error;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    async fn deliver(
        &self,
        credential: &TransportCredential,
        message: &PreparedMessage,
    ) -> Result<(), TransportError> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(e) = self.every_send.lock().unwrap().clone() {
            return Err(e);
        }
        if let Some(e) = self.sender_failures.lock().unwrap().get(&credential.username) {
            return Err(e.clone());
        }
        if let Some(e) = self
            .recipient_failures
            .lock()
            .unwrap()
            .get_mut(&message.to)
            .and_then(|q| q.pop_front())
        {
            return Err(e);
        }

        self.deliveries.lock().unwrap().push(Delivery {
            username: credential.username.clone(),
            secret: credential.secret.expose_secret().to_string(),
            message: message.clone(),
        });
        Ok(())
    }
}

struct FakeSession<'a> {
    transport: &'a FakeTransport,
    credential: &'a TransportCredential,
}

#[async_trait]
impl MailSession for FakeSession<'_> {
    async fn send(&mut self, message: &PreparedMessage) -> Result<(), TransportError> {
        self.transport.deliver(self.credential, message).await
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn open<'a>(
        &'a self,
        credential: &'a TransportCredential,
    ) -> Result<Box<dyn MailSession + 'a>, TransportError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            transport: self,
            credential,
        }))
    }

    async fn probe(&self, _credential: &TransportCredential) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.probe_failure.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Counts refresh calls and hands out `fresh-access-<n>` tokens.
#[derive(Default)]
pub struct FakeRefresher {
    calls: AtomicUsize,
    reject: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeRefresher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(
        &self,
        _provider: Provider,
        _refresh_token: &SecretString,
    ) -> Result<RefreshedToken, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(RefreshError::Rejected("invalid_grant".to_string()));
        }
        Ok(RefreshedToken {
            access_token: SecretString::from(format!("fresh-access-{}", n)),
            refresh_token: None,
            expires_in: 3600,
        })
    }
}
