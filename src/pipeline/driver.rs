//! Pipeline driver: the poll loop that owns the mailbox session.
//!
//! One cycle:
//! 1. Open a session and snapshot the unread UIDs
//! 2. For each message: fetch → extract → convert → compose → send
//! 3. Delete the message only once its reply was accepted
//! 4. Close the session, sleep `poll_interval`, repeat
//!
//! Anything not deleted stays unread and is picked up again next cycle.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::channels::mailbox::{MailboxConnector, MailboxSession, SessionGuard};
use crate::channels::smtp::{ReplySender, bare_address};
use crate::error::MailboxError;
use crate::pipeline::convert::{Converter, ConverterAdapter, convert_all};
use crate::pipeline::extract::extract_pdf_attachments;
use crate::pipeline::reply::compose_reply;
use crate::pipeline::types::{Message, MessageId};

// ── Policies ────────────────────────────────────────────────────────

/// When to look at the mailbox again. The only retry mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
}

impl RetryPolicy {
    pub fn every(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::every(Duration::from_secs(60))
    }
}

/// What to do with a message that carries no PDF attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyMessagePolicy {
    /// Send the "no PDF attachments" reply, then delete.
    #[default]
    Reply,
    /// Leave it unread and untouched.
    Skip,
}

impl FromStr for EmptyMessagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reply" => Ok(Self::Reply),
            "skip" => Ok(Self::Skip),
            other => Err(format!("expected \"reply\" or \"skip\", got {other:?}")),
        }
    }
}

// ── Reporting ───────────────────────────────────────────────────────

/// Where a message ended up after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Reply sent and the message expunged.
    Committed,
    /// Reply sent but deletion failed; the message will be answered again.
    SentNotCommitted { reason: String },
    /// Delivery failed; retried next cycle.
    LeftUnread { reason: String },
    /// Not processed this cycle (fetch/parse failure, self-sent, policy).
    Skipped { reason: String },
}

impl MessageDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::SentNotCommitted { .. } => "sent_not_committed",
            Self::LeftUnread { .. } => "left_unread",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// Whether a reply went out for this message.
    pub fn was_sent(&self) -> bool {
        matches!(self, Self::Committed | Self::SentNotCommitted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    /// In processing order.
    pub messages: Vec<(MessageId, MessageDisposition)>,
    /// Shutdown stopped the cycle before every listed message was handled.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn count(&self, label: &str) -> usize {
        self.messages
            .iter()
            .filter(|(_, d)| d.label() == label)
            .count()
    }

    pub fn disposition(&self, id: MessageId) -> Option<&MessageDisposition> {
        self.messages
            .iter()
            .find(|(uid, _)| *uid == id)
            .map(|(_, d)| d)
    }
}

// ── Driver ──────────────────────────────────────────────────────────

pub struct PipelineDriver {
    mailbox: Arc<dyn MailboxConnector>,
    delivery: Arc<dyn ReplySender>,
    adapter: ConverterAdapter,
    /// Our own bare sender address; mail from it is never answered.
    own_address: String,
    retry: RetryPolicy,
    empty_message: EmptyMessagePolicy,
    cycles: AtomicU64,
    shutdown: AtomicBool,
    wake: Notify,
}

impl PipelineDriver {
    /// `own_address` may carry a display name; only the address is compared.
    pub fn new(
        mailbox: Arc<dyn MailboxConnector>,
        delivery: Arc<dyn ReplySender>,
        converter: Arc<dyn Converter>,
        own_address: impl AsRef<str>,
    ) -> Self {
        Self {
            mailbox,
            delivery,
            adapter: ConverterAdapter::new(converter),
            own_address: bare_address(own_address.as_ref()),
            retry: RetryPolicy::default(),
            empty_message: EmptyMessagePolicy::default(),
            cycles: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_empty_message_policy(mut self, policy: EmptyMessagePolicy) -> Self {
        self.empty_message = policy;
        self
    }

    /// Ask the loop to stop. Takes effect between messages or cycles.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Poll until shutdown. Cycles run on the blocking pool; a failed or
    /// panicked cycle is logged and the loop carries on.
    pub async fn run_forever(self: Arc<Self>) {
        info!(
            interval_secs = self.retry.poll_interval.as_secs(),
            converter = %self.adapter.converter_name(),
            "Pipeline driver started"
        );

        while !self.shutdown_requested() {
            let driver = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || driver.run_cycle()).await {
                Ok(Ok(report)) => log_report(&report),
                Ok(Err(e)) => error!(error = %e, "Cycle aborted"),
                Err(e) => error!(error = %e, "Cycle task panicked"),
            }

            if self.shutdown_requested() {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.retry.poll_interval) => {}
                () = self.wake.notified() => {}
            }
        }

        info!("Pipeline driver stopped");
    }

    /// One full cycle. Only session-level failures are returned; everything
    /// per-message ends up in the report.
    pub fn run_cycle(&self) -> Result<CycleReport, MailboxError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("cycle", n = cycle, trace = %Uuid::new_v4());
        let _entered = span.enter();

        let mut report = CycleReport {
            cycle,
            started_at: Utc::now(),
            messages: Vec::new(),
            interrupted: false,
        };

        let mut session = SessionGuard::new(self.mailbox.open()?);
        let unread = session.list_unread()?;
        if unread.is_empty() {
            debug!("No unread messages");
            return Ok(report);
        }
        info!(count = unread.len(), "Unread messages found");

        for (done, id) in unread.iter().copied().enumerate() {
            if self.shutdown_requested() {
                info!(remaining = unread.len() - done, "Shutdown requested, ending cycle early");
                report.interrupted = true;
                break;
            }
            let disposition = self.process_message(&mut *session, id);
            report.messages.push((id, disposition));
        }

        Ok(report)
    }

    /// Carry one message as far as it goes. Deletion is attempted only after
    /// the reply has been accepted by the delivery side.
    pub fn process_message(
        &self,
        session: &mut dyn MailboxSession,
        id: MessageId,
    ) -> MessageDisposition {
        let skipped = |reason: String| {
            warn!(uid = %id, reason = %reason, "Message skipped");
            MessageDisposition::Skipped { reason }
        };

        let raw = match session.fetch(id) {
            Ok(raw) => raw,
            Err(e) => return skipped(e.to_string()),
        };
        let message = match Message::from_raw(id, raw) {
            Ok(message) => message,
            Err(e) => return skipped(e.to_string()),
        };
        if message.sender.eq_ignore_ascii_case(&self.own_address) {
            debug!(uid = %id, "Ignoring message sent by this service");
            if let Err(e) = session.mark_seen(id) {
                warn!(uid = %id, error = %e, "Could not mark own message seen");
            }
            return MessageDisposition::Skipped {
                reason: "sent by this service".into(),
            };
        }
        let attachments = match extract_pdf_attachments(&message) {
            Ok(found) => found,
            Err(e) => return skipped(e.to_string()),
        };
        if attachments.is_empty() && self.empty_message == EmptyMessagePolicy::Skip {
            debug!(uid = %id, sender = %message.sender, "No PDF attachments, leaving message");
            return MessageDisposition::Skipped {
                reason: "no PDF attachments".into(),
            };
        }

        info!(
            uid = %id,
            sender = %message.sender,
            pdfs = attachments.len(),
            "Processing message"
        );
        let outcome = convert_all(&self.adapter, attachments);
        if !outcome.is_empty() && outcome.all_failed() {
            debug!(uid = %id, "No attachment could be converted");
        }
        let reply = compose_reply(&message, &outcome);

        if let Err(e) = self.delivery.send(&reply) {
            warn!(uid = %id, error = %e, "Reply not sent, message stays unread");
            return MessageDisposition::LeftUnread {
                reason: e.to_string(),
            };
        }

        match session.mark_deleted_and_commit(id) {
            Ok(()) => {
                info!(uid = %id, "Message answered and deleted");
                MessageDisposition::Committed
            }
            Err(e) => {
                error!(uid = %id, error = %e, "Reply sent but message not deleted");
                MessageDisposition::SentNotCommitted {
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn log_report(report: &CycleReport) {
    if report.messages.is_empty() {
        return;
    }
    info!(
        cycle = report.cycle,
        committed = report.count("committed"),
        left_unread = report.count("left_unread"),
        skipped = report.count("skipped"),
        sent_not_committed = report.count("sent_not_committed"),
        interrupted = report.interrupted,
        "Cycle finished"
    );
}
