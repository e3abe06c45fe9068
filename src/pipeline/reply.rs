//! Reply composition: a message plus its outcome becomes a `ReplyArtifact`.

use crate::pipeline::extract::has_pdf_extension;
use crate::pipeline::register::format_register;
use crate::pipeline::types::{
    ConversionResult, Message, ProcessingOutcome, ReplyArtifact, ReplyAttachment,
};

pub const SUBJECT_PREFIX: &str = "RE: ";

/// Suffix appended to the original base name for converted documents.
pub const CONVERTED_SUFFIX: &str = "_epc_qr.pdf";

pub const REGISTER_HEADER: &str = "Payment register(s):";

pub const NO_CODES_LINE: &str = "No UNP QR codes found in this attachment.";

pub const NO_ATTACHMENTS_LINE: &str = "No PDF attachments found in your message.";

/// Build the reply for one message. Deterministic for a given input.
pub fn compose_reply(message: &Message, outcome: &ProcessingOutcome) -> ReplyArtifact {
    let subject = format!(
        "{SUBJECT_PREFIX}{}",
        message.subject.as_deref().unwrap_or("")
    );

    if outcome.is_empty() {
        return ReplyArtifact {
            to: message.sender.clone(),
            subject,
            body: NO_ATTACHMENTS_LINE.to_string(),
            attachments: Vec::new(),
        };
    }

    let mut sections = Vec::with_capacity(outcome.len());
    let mut attachments = Vec::with_capacity(outcome.len() * 2);

    for doc in &outcome.documents {
        let name = &doc.attachment.filename;
        attachments.push(ReplyAttachment {
            filename: name.clone(),
            content: doc.attachment.content.clone(),
        });

        let section_body = match &doc.result {
            ConversionResult::Converted { pdf, payments } => {
                attachments.push(ReplyAttachment {
                    filename: converted_name(name),
                    content: pdf.clone(),
                });
                format_register(payments)
            }
            ConversionResult::NoCodesFound | ConversionResult::Failed { .. } => {
                NO_CODES_LINE.to_string()
            }
        };
        sections.push(format!("--- {name} ---\n{section_body}"));
    }

    ReplyArtifact {
        to: message.sender.clone(),
        subject,
        body: format!("{REGISTER_HEADER}\n\n{}", sections.join("\n\n")),
        attachments,
    }
}

/// `dir/Bill.PDF` → `Bill_epc_qr.pdf`. Directory parts of the untrusted name
/// are dropped.
pub fn converted_name(original: &str) -> String {
    let file = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);
    let base = if has_pdf_extension(file) {
        &file[..file.len() - 4]
    } else {
        file
    };
    format!("{base}{CONVERTED_SUFFIX}")
}
