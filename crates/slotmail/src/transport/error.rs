//! Transport error taxonomy and SMTP reply classification.

use thiserror::Error;

/// Reply codes that mean the server refused our credentials.
const AUTH_REJECTION_CODES: [u16; 4] = [530, 534, 535, 538];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("permanent rejection ({code}): {message}")]
    PermanentRecipient { code: u16, message: String },

    #[error("temporary failure ({code}): {message}")]
    Transient { code: u16, message: String },

    #[error("message could not be built: {0}")]
    InvalidMessage(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::AuthFailed(_)
                | TransportError::Tls(_)
                | TransportError::PermanentRecipient { .. }
                | TransportError::InvalidMessage(_)
        )
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, TransportError::AuthFailed(_))
    }
}

/// Maps an SMTP reply to the taxonomy.
pub fn classify_smtp_reply(code: u16, message: &str) -> TransportError {
    let message = message.trim().to_string();
    if AUTH_REJECTION_CODES.contains(&code) {
        TransportError::AuthFailed(format!("{} {}", code, message))
    } else if (500..600).contains(&code) {
        TransportError::PermanentRecipient { code, message }
    } else {
        TransportError::Transient { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_codes() {
        for code in AUTH_REJECTION_CODES {
            let err = classify_smtp_reply(code, "5.7.8 Username and Password not accepted");
            assert!(err.is_auth_rejection(), "{}", code);
            assert!(err.is_permanent());
        }
    }

    #[test]
    fn test_permanent_and_transient() {
        let bounced = classify_smtp_reply(550, "5.1.1 mailbox unavailable ");
        assert_eq!(
            bounced,
            TransportError::PermanentRecipient {
                code: 550,
                message: "5.1.1 mailbox unavailable".to_string()
            }
        );
        assert!(bounced.is_permanent());

        let throttled = classify_smtp_reply(421, "4.7.0 Try again later");
        assert!(!throttled.is_permanent());
        assert!(matches!(throttled, TransportError::Transient { code: 421, .. }));

        // A temporary auth hiccup is not a credential rejection.
        assert!(!classify_smtp_reply(454, "4.7.0 Temporary authentication failure").is_permanent());
    }

    #[test]
    fn test_tls_is_permanent() {
        assert!(TransportError::Tls("handshake".into()).is_permanent());
        assert!(!TransportError::TimedOut("read".into()).is_permanent());
    }
}
