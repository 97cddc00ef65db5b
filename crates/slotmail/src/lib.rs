pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod error;
pub mod quota;
pub mod scheduler;
pub mod secrets;
pub mod send;
pub mod slots;
pub mod telemetry;
pub mod transport;
pub mod verify;

pub use config::{load_config, Config};
pub use credentials::{CredentialVault, HttpTokenRefresher, OAuthGrant, TokenRefresher};
pub use db::{Database, DatabaseError};
pub use engine::{Engine, StartupError};
pub use error::{ConfigError, EngineError, Result};
pub use quota::{QuotaTracker, QuotaUsage};
pub use scheduler::{PollSummary, ScheduleRequest, ScheduledEmail, ScheduledQueue, Scheduler};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretCipher, SecretError};
pub use send::{OutgoingEmail, SendEngine, SendProgress, SendReport, SlotChoice};
pub use slots::{CustomSmtpSettings, Provider, SlotManager, SlotStatus, SlotToggle, SmtpSlot};
pub use transport::{MailSession, MailTransport, SmtpMailer, TransportError};
pub use verify::{ProbeFailure, VerificationService};
