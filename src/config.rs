//! Configuration types, built once from environment variables at startup.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::driver::{EmptyMessagePolicy, RetryPolicy};

/// IMAP side of the service.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Folder to watch.
    pub folder: String,
}

/// SMTP side of the service.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Upgrade the connection with STARTTLS before authenticating.
    pub starttls: bool,
    /// Address used in `From:`. Defaults to the mailbox login.
    pub from_address: String,
}

/// External converter invocation.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Everything the service needs to run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub mailbox: MailboxConfig,
    pub delivery: DeliveryConfig,
    pub converter: ConverterConfig,
    pub retry: RetryPolicy,
    pub empty_message: EmptyMessagePolicy,
}

impl ServiceConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Values are trimmed and
    /// empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let imap_user = required("IMAP_USER")?;
        let mailbox = MailboxConfig {
            host: required("IMAP_HOST")?,
            port: parse_or(get("IMAP_PORT"), "IMAP_PORT", 993)?,
            password: SecretString::from(required("IMAP_PASSWORD")?),
            folder: get("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            username: imap_user.clone(),
        };

        let delivery = DeliveryConfig {
            host: required("SMTP_HOST")?,
            port: parse_or(get("SMTP_PORT"), "SMTP_PORT", 587)?,
            username: required("SMTP_USER")?,
            password: SecretString::from(required("SMTP_PASSWORD")?),
            starttls: get("SMTP_USE_TLS").is_none_or(|v| parse_flag(&v)),
            from_address: get("FROM_EMAIL").unwrap_or(imap_user),
        };

        let command = get("CONVERTER_COMMAND").unwrap_or_else(|| "unp2epc".to_string());
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| ConfigError::MissingEnvVar("CONVERTER_COMMAND".into()))?;
        let converter = ConverterConfig {
            program,
            args: words.collect(),
            timeout: Duration::from_secs(parse_or(
                get("CONVERTER_TIMEOUT_SECS"),
                "CONVERTER_TIMEOUT_SECS",
                120,
            )?),
        };

        let poll_secs: u64 = parse_or(get("POLL_INTERVAL"), "POLL_INTERVAL", 60)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL".into(),
                message: "must be at least 1 second".into(),
            });
        }

        let empty_message = match get("EMPTY_MESSAGE_POLICY").as_deref() {
            None => EmptyMessagePolicy::Reply,
            Some(v) => v.parse().map_err(|message| ConfigError::InvalidValue {
                key: "EMPTY_MESSAGE_POLICY".into(),
                message,
            })?,
        };

        Ok(Self {
            mailbox,
            delivery,
            converter,
            retry: RetryPolicy::every(Duration::from_secs(poll_secs)),
            empty_message,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// `1`, `true` and `yes` (any case) enable a flag; anything else disables it.
fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
