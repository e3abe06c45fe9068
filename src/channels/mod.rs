//! Mail I/O: IMAP mailbox sessions and SMTP reply delivery.

pub mod imap;
pub mod mailbox;
pub mod smtp;

pub use mailbox::{ImapMailbox, MailboxConnector, MailboxSession, SessionGuard};
pub use smtp::{ReplySender, SmtpDelivery};
