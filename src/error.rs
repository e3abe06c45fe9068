//! Error types for epc-mailer.

use std::time::Duration;

use crate::channels::imap::ImapError;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Driver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration-related errors. The only kind that stops the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox session errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// Connect, TLS, login or folder selection failed. Aborts the cycle.
    #[error("Mailbox connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: ImapError,
    },

    #[error("Listing unread messages failed: {0}")]
    Listing(#[source] ImapError),

    /// The message could not be fetched (e.g. expunged by another client).
    #[error("Fetching message {uid} failed: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("Deleting message {uid} failed: {source}")]
    Commit {
        uid: u32,
        #[source]
        source: ImapError,
    },

    #[error("Flagging message {uid} failed: {source}")]
    Flag {
        uid: u32,
        #[source]
        source: ImapError,
    },
}

/// Reply delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build reply: {0}")]
    Build(String),

    #[error("SMTP transport setup failed for {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("SMTP send to {to} failed: {reason}")]
    SendFailed { to: String, reason: String },
}

/// MIME parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Message {uid} is not a parseable MIME message")]
    Unparseable { uid: u32 },

    #[error("Message {uid} has no sender address")]
    MissingSender { uid: u32 },
}

/// Errors surfaced by a converter for a single document.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Converter command `{command}` could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Converter step {step} exited with {status}: {stderr}")]
    ExitStatus {
        step: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Converter step {step} timed out after {timeout:?}")]
    Timeout {
        step: &'static str,
        timeout: Duration,
    },

    #[error("Converter produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Converter panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
