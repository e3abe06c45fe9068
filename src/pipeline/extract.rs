//! MIME handling: header extraction and PDF attachment selection.

use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};

use crate::error::ExtractError;
use crate::pipeline::types::{Attachment, Message, MessageId};

impl Message {
    /// Parse sender and subject out of a raw fetched message.
    pub fn from_raw(id: MessageId, raw: Vec<u8>) -> Result<Self, ExtractError> {
        let parsed = MessageParser::default()
            .parse(raw.as_slice())
            .ok_or(ExtractError::Unparseable { uid: id.0 })?;
        let sender = extract_sender(&parsed).ok_or(ExtractError::MissingSender { uid: id.0 })?;
        let subject = parsed.subject().map(str::to_string);
        Ok(Self {
            id,
            sender,
            subject,
            raw,
        })
    }
}

/// Collect every attachment whose filename ends in `.pdf`, in message order.
///
/// Walks the whole part tree including embedded `message/rfc822` parts.
/// Inline parts and other file types are ignored; duplicate names are kept.
pub fn extract_pdf_attachments(message: &Message) -> Result<Vec<Attachment>, ExtractError> {
    let parsed = MessageParser::default()
        .parse(message.raw.as_slice())
        .ok_or(ExtractError::Unparseable { uid: message.id.0 })?;
    let mut found = Vec::new();
    collect_pdfs(&parsed, &mut found);
    Ok(found)
}

fn collect_pdfs(parsed: &mail_parser::Message<'_>, found: &mut Vec<Attachment>) {
    for part in &parsed.parts {
        if let PartType::Message(nested) = &part.body {
            collect_pdfs(nested, found);
            continue;
        }
        if !is_attachment(part) {
            continue;
        }
        if let Some(name) = MimeHeaders::attachment_name(part)
            && has_pdf_extension(name)
        {
            found.push(Attachment {
                filename: name.to_string(),
                content: part.contents().to_vec(),
            });
        }
    }
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    MimeHeaders::content_disposition(part)
        .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"))
}

/// ASCII case-insensitive `.pdf` suffix check.
pub fn has_pdf_extension(filename: &str) -> bool {
    let bytes = filename.as_bytes();
    bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".pdf")
}

/// Extract the bare sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}
