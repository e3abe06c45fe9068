//! Shared types for the ingestion and reply pipeline.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// IMAP UID of a message, unique within the selected folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fetched message. Immutable and owned by one processing attempt.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// Bare sender address from `From:`.
    pub sender: String,
    /// Raw subject; `None` when the header is absent.
    pub subject: Option<String>,
    /// Full RFC 5322 content.
    pub raw: Vec<u8>,
}

/// A PDF attachment pulled out of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename as declared by the sender. Untrusted.
    pub filename: String,
    pub content: Vec<u8>,
}

// ── Conversion ──────────────────────────────────────────────────────

/// One payment decoded from a UPN QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub recipient_name: String,
    pub recipient_address: String,
    pub iban: String,
    /// Amount in EUR.
    pub amount: Decimal,
    pub reference: Option<String>,
    /// Four-letter purpose code (may be empty).
    pub purpose_code: String,
    /// Free-text purpose of the payment.
    pub purpose: String,
}

/// Per-document result after the converter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    /// Codes were found and a converted PDF produced.
    Converted { pdf: Vec<u8>, payments: Vec<Payment> },
    /// The document carries no readable UPN codes.
    NoCodesFound,
    /// The converter errored on this document.
    Failed { reason: String },
}

impl ConversionResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converted { .. } => "converted",
            Self::NoCodesFound => "no_codes_found",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_converted(&self) -> bool {
        matches!(self, Self::Converted { .. })
    }
}

/// A document paired with what the converter made of it.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub attachment: Attachment,
    pub result: ConversionResult,
}

/// Everything the converter produced for one message, in attachment order.
#[derive(Debug, Clone, Default)]
pub struct ProcessingOutcome {
    pub documents: Vec<DocumentOutcome>,
}

impl ProcessingOutcome {
    /// At least one document was converted.
    pub fn any_converted(&self) -> bool {
        self.documents.iter().any(|d| d.result.is_converted())
    }

    /// No document was converted. True for an empty outcome.
    pub fn all_failed(&self) -> bool {
        !self.any_converted()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

// ── Reply ───────────────────────────────────────────────────────────

/// A file attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAttachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// A composed reply, ready for delivery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyArtifact {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<ReplyAttachment>,
}

impl ReplyArtifact {
    pub fn attachment_names(&self) -> Vec<&str> {
        self.attachments.iter().map(|a| a.filename.as_str()).collect()
    }
}
