//! SMTP delivery through lettre's async transport.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

use super::error::{classify_smtp_reply, TransportError};
use super::{AuthMechanism, MailSession, MailTransport, TransportCredential};
use crate::config::TransportConfig;
use crate::send::message::PreparedMessage;

/// [`MailTransport`] over lettre. A session keeps one pooled connection, so a
/// batch authenticates once.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
    helo_name: Option<String>,
}

impl SmtpMailer {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            timeout: config.timeout(),
            helo_name: config.helo_name.clone(),
        }
    }

    fn build_transport(
        &self,
        credential: &TransportCredential,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        let builder = if credential.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&credential.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&credential.host)
        }
        .map_err(classify_lettre_error)?;

        let mechanisms = match credential.mechanism {
            AuthMechanism::XOAuth2 => vec![Mechanism::Xoauth2],
            AuthMechanism::Password => vec![Mechanism::Plain, Mechanism::Login],
        };

        let mut builder = builder
            .port(credential.port)
            .credentials(Credentials::new(
                credential.username.clone(),
                credential.secret.expose_secret().to_string(),
            ))
            .authentication(mechanisms)
            .timeout(Some(self.timeout))
            .pool_config(PoolConfig::new().max_size(1));

        if let Some(name) = &self.helo_name {
            builder = builder.hello_name(ClientId::Domain(name.clone()));
        }

        Ok(builder.build())
    }
}

/// One slot's connection for the duration of a send batch.
pub struct SmtpSession {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn send(&mut self, message: &PreparedMessage) -> Result<(), TransportError> {
        let email = build_message(message)?;
        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(classify_lettre_error)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn open<'a>(
        &'a self,
        credential: &'a TransportCredential,
    ) -> Result<Box<dyn MailSession + 'a>, TransportError> {
        let transport = self.build_transport(credential)?;
        Ok(Box::new(SmtpSession { transport }))
    }

    async fn probe(&self, credential: &TransportCredential) -> Result<(), TransportError> {
        let transport = self.build_transport(credential)?;
        match transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::NetworkUnreachable(format!(
                "{}:{} did not answer NOOP",
                credential.host, credential.port
            ))),
            Err(e) => Err(classify_lettre_error(e)),
        }
    }
}

fn classify_lettre_error(e: lettre::transport::smtp::Error) -> TransportError {
    let detail = e.to_string();
    if e.is_timeout() {
        return TransportError::TimedOut(detail);
    }
    if e.is_tls() {
        return TransportError::Tls(detail);
    }
    if let Some(code) = e.status().and_then(|c| c.to_string().parse::<u16>().ok()) {
        return classify_smtp_reply(code, &detail);
    }
    if e.is_client() {
        // e.g. no mutually supported AUTH mechanism
        return TransportError::AuthFailed(detail);
    }
    TransportError::NetworkUnreachable(detail)
}

fn parse_mailbox(address: &str, role: &str) -> Result<Mailbox, TransportError> {
    address.parse::<Mailbox>().map_err(|e| {
        TransportError::InvalidMessage(format!("invalid {} address '{}': {}", role, address, e))
    })
}

fn content_type(value: &str) -> ContentType {
    ContentType::parse(value).unwrap_or(ContentType::TEXT_PLAIN)
}

/// Renders a [`PreparedMessage`] as a MIME message.
pub fn build_message(message: &PreparedMessage) -> Result<Message, TransportError> {
    let builder = Message::builder()
        .from(parse_mailbox(&message.from, "sender")?)
        .to(parse_mailbox(&message.to, "recipient")?)
        .subject(message.subject.clone());

    let body = match &message.text {
        Some(text) => MultiPart::alternative_plain_html(text.clone(), message.html.clone()),
        None => MultiPart::alternative().singlepart(SinglePart::html(message.html.clone())),
    };

    let multipart = if message.attachments.is_empty() {
        body
    } else {
        message
            .attachments
            .iter()
            .fold(MultiPart::mixed().multipart(body), |parts, att| {
                let ct = att.resolved_content_type();
                parts.singlepart(
                    MimeAttachment::new(att.filename.clone())
                        .body(att.content.clone(), content_type(&ct)),
                )
            })
    };

    builder
        .multipart(multipart)
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::message::Attachment;

    fn prepared() -> PreparedMessage {
        PreparedMessage {
            from: "Ana <ana@example.com>".to_string(),
            to: "bob@example.org".to_string(),
            subject: "Spring catalogue".to_string(),
            html: "<p>Hi Bob</p>".to_string(),
            text: None,
            attachments: vec![],
        }
    }

    fn rendered(message: &PreparedMessage) -> String {
        String::from_utf8(build_message(message).unwrap().formatted()).unwrap()
    }

    #[test]
    fn test_html_only_message() {
        let raw = rendered(&prepared());
        assert!(raw.contains("Subject: Spring catalogue"));
        assert!(raw.contains("To: bob@example.org"));
        assert!(raw.contains("text/html"));
        assert!(!raw.contains("multipart/mixed"));
    }

    #[test]
    fn test_text_alternative_and_attachment() {
        let mut msg = prepared();
        msg.text = Some("Hi Bob".to_string());
        msg.attachments.push(Attachment {
            filename: "prices.csv".to_string(),
            content_type: None,
            content: b"sku,price\n1,2\n".to_vec(),
        });

        let raw = rendered(&msg);
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/csv"));
        assert!(raw.contains("prices.csv"));
    }

    #[test]
    fn test_invalid_recipient() {
        let mut msg = prepared();
        msg.to = "not an address".to_string();
        assert!(matches!(
            build_message(&msg),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_content_type_fallback() {
        assert_eq!(content_type("image/png"), ContentType::parse("image/png").unwrap());
        assert_eq!(content_type("///"), ContentType::TEXT_PLAIN);
    }
}
