//! Reply delivery over SMTP via lettre.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::pipeline::types::ReplyArtifact;

const SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Implicit-TLS submission port.
const SMTPS_PORT: u16 = 465;

/// Sends a composed reply. `Ok` means the server accepted it.
pub trait ReplySender: Send + Sync {
    fn send(&self, reply: &ReplyArtifact) -> Result<(), DeliveryError>;
}

pub struct SmtpDelivery {
    transport: SmtpTransport,
    from: Mailbox,
    host: String,
}

impl SmtpDelivery {
    /// STARTTLS when enabled, implicit TLS on 465, plaintext otherwise.
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let transport_err = |e: lettre::transport::smtp::Error| DeliveryError::Transport {
            host: config.host.clone(),
            reason: e.to_string(),
        };

        let builder = if config.starttls {
            SmtpTransport::starttls_relay(&config.host).map_err(transport_err)?
        } else if config.port == SMTPS_PORT {
            SmtpTransport::relay(&config.host).map_err(transport_err)?
        } else {
            SmtpTransport::builder_dangerous(&config.host)
        };

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = builder
            .port(config.port)
            .credentials(creds)
            .timeout(Some(SEND_TIMEOUT))
            .build();

        Ok(Self {
            transport,
            from: parse_mailbox(&config.from_address)?,
            host: config.host.clone(),
        })
    }

    /// The bare address replies are sent from, without any display name.
    pub fn sender_address(&self) -> String {
        self.from.email.to_string()
    }
}

impl ReplySender for SmtpDelivery {
    fn send(&self, reply: &ReplyArtifact) -> Result<(), DeliveryError> {
        let email = build_email(&self.from, reply)?;
        self.transport
            .send(&email)
            .map_err(|e| DeliveryError::SendFailed {
                to: reply.to.clone(),
                reason: e.to_string(),
            })?;
        info!(
            to = %reply.to,
            relay = %self.host,
            attachments = reply.attachments.len(),
            "Reply sent"
        );
        Ok(())
    }
}

/// Build the MIME message: a plain-text body then every attachment as
/// `application/pdf`, in artifact order.
pub fn build_email(from: &Mailbox, reply: &ReplyArtifact) -> Result<lettre::Message, DeliveryError> {
    let pdf = ContentType::parse("application/pdf")
        .map_err(|e| DeliveryError::Build(e.to_string()))?;

    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(reply.body.clone()));
    for attachment in &reply.attachments {
        body = body.singlepart(
            Attachment::new(attachment.filename.clone())
                .body(attachment.content.clone(), pdf.clone()),
        );
    }

    lettre::Message::builder()
        .from(from.clone())
        .to(parse_mailbox(&reply.to)?)
        .subject(reply.subject.as_str())
        .multipart(body)
        .map_err(|e| DeliveryError::Build(e.to_string()))
}

/// `Name <addr@host>` → `addr@host`. Input that does not parse is returned
/// trimmed.
pub fn bare_address(address: &str) -> String {
    match address.parse::<Mailbox>() {
        Ok(mailbox) => mailbox.email.to_string(),
        Err(_) => address.trim().to_string(),
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use mail_parser::{MessageParser, MimeHeaders};
    use secrecy::SecretString;

    use super::*;
    use crate::pipeline::types::ReplyAttachment;

    fn reply(to: &str) -> ReplyArtifact {
        ReplyArtifact {
            to: to.into(),
            subject: "RE: Računi".into(),
            body: "Payment register(s):\n\n--- a.pdf ---\nNo UNP QR codes found in this attachment."
                .into(),
            attachments: vec![
                ReplyAttachment {
                    filename: "a.pdf".into(),
                    content: b"%PDF-1.4 \x00\x01 original".to_vec(),
                },
                ReplyAttachment {
                    filename: "a_epc_qr.pdf".into(),
                    content: b"%PDF-1.4 converted".to_vec(),
                },
            ],
        }
    }

    fn from() -> Mailbox {
        parse_mailbox("bills@test.com").unwrap()
    }

    #[test]
    fn built_email_carries_body_and_attachments_in_order() {
        let email = build_email(&from(), &reply("alice@example.com")).unwrap();
        let raw = email.formatted();
        let parsed = MessageParser::default().parse(raw.as_slice()).unwrap();

        assert_eq!(parsed.subject(), Some("RE: Računi"));
        assert_eq!(
            parsed.to().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("alice@example.com")
        );
        assert!(parsed.body_text(0).unwrap().contains("No UNP QR codes"));

        let attachments: Vec<(&str, &[u8])> = parsed
            .attachments()
            .map(|p| (p.attachment_name().unwrap_or(""), p.contents()))
            .collect();
        assert_eq!(
            attachments,
            vec![
                ("a.pdf", &b"%PDF-1.4 \x00\x01 original"[..]),
                ("a_epc_qr.pdf", &b"%PDF-1.4 converted"[..]),
            ]
        );
    }

    #[test]
    fn reply_without_attachments_still_builds() {
        let mut r = reply("alice@example.com");
        r.attachments.clear();
        assert!(build_email(&from(), &r).is_ok());
    }

    #[test]
    fn bad_recipient_is_invalid_address() {
        assert!(matches!(
            build_email(&from(), &reply("not an address")),
            Err(DeliveryError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn plaintext_transport_builds_without_connecting() {
        let config = DeliveryConfig {
            host: "localhost".into(),
            port: 2525,
            username: "u".into(),
            password: SecretString::from("p"),
            starttls: false,
            from_address: "bills@test.com".into(),
        };
        assert!(SmtpDelivery::new(&config).is_ok());

        let named = DeliveryConfig {
            from_address: "Bills Desk <bills@test.com>".into(),
            ..config.clone()
        };
        assert_eq!(
            SmtpDelivery::new(&named).unwrap().sender_address(),
            "bills@test.com"
        );

        let bad_from = DeliveryConfig {
            from_address: "nope".into(),
            ..config
        };
        assert!(matches!(
            SmtpDelivery::new(&bad_from),
            Err(DeliveryError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn bare_address_strips_display_name() {
        assert_eq!(bare_address("Bills Desk <bills@test.com>"), "bills@test.com");
        assert_eq!(bare_address("\"Računi\" <bills@test.com>"), "bills@test.com");
        assert_eq!(bare_address(" bills@test.com "), "bills@test.com");
        assert_eq!(bare_address("not an address"), "not an address");
    }
}
