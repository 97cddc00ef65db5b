//! Outgoing message payloads.

use serde::{Deserialize, Serialize};

/// A file attached to an outgoing email. Content is base64 in JSON.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl Attachment {
    /// The declared content type, or one guessed from the filename.
    pub fn resolved_content_type(&self) -> String {
        match &self.content_type {
            Some(ct) if !ct.trim().is_empty() => ct.clone(),
            _ => mime_guess::from_path(&self.filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("bytes", &self.content.len())
            .finish()
    }
}

/// An email to send to one or more recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Overrides the slot's stored signature when set.
    #[serde(default)]
    pub signature: Option<String>,
}

impl OutgoingEmail {
    pub fn attachment_bytes(&self) -> usize {
        self.attachments.iter().map(|a| a.content.len()).sum()
    }

    /// Renders the single-recipient message handed to the transport.
    pub fn prepare(&self, from: &str, to: &str, slot_signature: Option<&str>) -> PreparedMessage {
        let signature = self
            .signature
            .as_deref()
            .or(slot_signature)
            .filter(|s| !s.trim().is_empty());

        let html = match signature {
            Some(sig) => format!("{}<br><br>{}", self.html, sig),
            None => self.html.clone(),
        };

        PreparedMessage {
            from: from.to_string(),
            to: to.to_string(),
            subject: self.subject.clone(),
            html,
            text: self.text.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// One rendered message for exactly one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}
