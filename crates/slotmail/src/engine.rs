//! Wires the services together over one database handle.

use std::sync::Arc;

use crate::config::{resolve_secret_key, Config};
use crate::credentials::{CredentialVault, HttpTokenRefresher, TokenRefresher};
use crate::db::{Database, DatabaseError};
use crate::error::ConfigError;
use crate::scheduler::{ScheduledQueue, Scheduler};
use crate::secrets::SecretCipher;
use crate::send::SendEngine;
use crate::slots::SlotManager;
use crate::transport::{MailTransport, SmtpMailer};
use crate::verify::VerificationService;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("No database path configured and no home directory found")]
    NoDatabasePath,
}

/// The services of one running instance.
pub struct Engine {
    pub db: Database,
    pub vault: Arc<CredentialVault>,
    pub slots: Arc<SlotManager>,
    pub sender: Arc<SendEngine>,
    pub queue: ScheduledQueue,
    pub scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Builds the engine with the production SMTP transport and OAuth refresher.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let path = config
            .database
            .resolved_path()
            .ok_or(StartupError::NoDatabasePath)?;
        let db = Database::open(&path)?;

        let key = resolve_secret_key(&config.secrets)?;
        let cipher = SecretCipher::from_key(&key).map_err(|source| ConfigError::Secret {
            name: "secrets.key",
            source,
        })?;

        let refresher = HttpTokenRefresher::from_config(&config.oauth)?;
        let transport = SmtpMailer::new(&config.transport);

        Ok(Self::assemble(
            db,
            cipher,
            Arc::new(refresher),
            Arc::new(transport),
            config,
        ))
    }

    /// Builds the engine from explicit parts.
    pub fn assemble(
        db: Database,
        cipher: SecretCipher,
        refresher: Arc<dyn TokenRefresher>,
        transport: Arc<dyn MailTransport>,
        config: &Config,
    ) -> Self {
        let vault = Arc::new(CredentialVault::new(
            db.clone(),
            cipher,
            refresher,
            config.oauth.refresh_margin(),
        ));
        let verifier = Arc::new(VerificationService::new(
            Arc::clone(&vault),
            Arc::clone(&transport),
            config.transport.probe_timeout(),
        ));
        let slots = Arc::new(SlotManager::new(
            db.clone(),
            Arc::clone(&vault),
            verifier,
            config.quota.clone(),
        ));
        let sender = Arc::new(SendEngine::new(
            db.clone(),
            Arc::clone(&slots),
            Arc::clone(&vault),
            transport,
            config.send.clone(),
        ));
        let queue = ScheduledQueue::new(db.clone(), config.send.max_recipients);
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            Arc::clone(&sender),
            config.scheduler.clone(),
        ));

        Self {
            db,
            vault,
            slots,
            sender,
            queue,
            scheduler,
        }
    }
}
