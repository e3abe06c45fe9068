//! Mailbox access: the session boundary the pipeline drives, and its IMAP
//! implementation over rustls.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::imap::{
    Greeting, ImapConnection, ImapError, fetched_body, parse_capabilities, parse_search,
};
use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::pipeline::types::MessageId;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens one authenticated session per cycle.
pub trait MailboxConnector: Send + Sync {
    fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An open, folder-selected mailbox.
pub trait MailboxSession: Send {
    /// Identifiers of messages not yet marked seen, in server order.
    fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError>;

    /// Full raw message. Must not mark the message seen.
    fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>, MailboxError>;

    /// Flag the message deleted and make the deletion durable.
    fn mark_deleted_and_commit(&mut self, id: MessageId) -> Result<(), MailboxError>;

    /// Flag the message seen so it drops out of `list_unread`.
    fn mark_seen(&mut self, id: MessageId) -> Result<(), MailboxError>;

    /// Release the session. Safe to call more than once.
    fn close(&mut self);
}

/// Closes the wrapped session when dropped, on every exit path.
pub struct SessionGuard(Box<dyn MailboxSession>);

impl SessionGuard {
    pub fn new(session: Box<dyn MailboxSession>) -> Self {
        Self(session)
    }
}

impl Deref for SessionGuard {
    type Target = dyn MailboxSession;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Connects to an IMAPS server (implicit TLS) with webpki roots.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    fn connect(&self) -> Result<ImapSession<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>, ImapError> {
        let tcp = TcpStream::connect((&*self.config.host, self.config.port))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        ImapSession::establish(rustls::StreamOwned::new(conn, tcp), &self.config)
    }
}

impl MailboxConnector for ImapMailbox {
    fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let session = self.connect().map_err(|source| MailboxError::Connection {
            host: self.config.host.clone(),
            source,
        })?;
        info!(
            host = %self.config.host,
            folder = %self.config.folder,
            uidplus = session.uidplus,
            "Mailbox session opened"
        );
        Ok(Box::new(session))
    }
}

/// A logged-in session with the watched folder selected.
///
/// All message addressing is by UID so identifiers stay valid while other
/// clients expunge.
pub struct ImapSession<S> {
    conn: ImapConnection<S>,
    uidplus: bool,
    closed: bool,
}

impl<S: Read + Write> ImapSession<S> {
    /// Greeting, LOGIN (unless pre-authenticated), CAPABILITY, SELECT.
    pub fn establish(stream: S, config: &MailboxConfig) -> Result<Self, ImapError> {
        let mut conn = ImapConnection::new(stream);

        if conn.read_greeting()? == Greeting::Ok {
            conn.command_with_strings(
                "LOGIN",
                &[&config.username, config.password.expose_secret()],
            )?;
        }

        let capabilities = parse_capabilities(&conn.command("CAPABILITY")?);
        let uidplus = capabilities.iter().any(|c| c == "UIDPLUS");

        conn.command_with_strings("SELECT", &[&config.folder])?;

        Ok(Self {
            conn,
            uidplus,
            closed: false,
        })
    }
}

impl<S: Read + Write + Send> MailboxSession for ImapSession<S> {
    fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        let lines = self
            .conn
            .command("UID SEARCH UNSEEN")
            .map_err(MailboxError::Listing)?;
        Ok(parse_search(&lines).into_iter().map(MessageId).collect())
    }

    fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>, MailboxError> {
        let lines = self
            .conn
            .command(&format!("UID FETCH {id} (BODY.PEEK[])"))
            .map_err(|e| MailboxError::Fetch {
                uid: id.0,
                reason: e.to_string(),
            })?;
        fetched_body(lines).ok_or_else(|| MailboxError::Fetch {
            uid: id.0,
            reason: "message no longer exists".into(),
        })
    }

    fn mark_deleted_and_commit(&mut self, id: MessageId) -> Result<(), MailboxError> {
        let commit = |source| MailboxError::Commit { uid: id.0, source };
        self.conn
            .command(&format!("UID STORE {id} +FLAGS.SILENT (\\Deleted)"))
            .map_err(commit)?;
        // Plain EXPUNGE also removes anything else already flagged \Deleted.
        let expunge = if self.uidplus {
            format!("UID EXPUNGE {id}")
        } else {
            "EXPUNGE".to_string()
        };
        self.conn.command(&expunge).map_err(commit)?;
        debug!(uid = %id, "Message expunged");
        Ok(())
    }

    fn mark_seen(&mut self, id: MessageId) -> Result<(), MailboxError> {
        self.conn
            .command(&format!("UID STORE {id} +FLAGS.SILENT (\\Seen)"))
            .map_err(|source| MailboxError::Flag { uid: id.0, source })?;
        Ok(())
    }

    fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.conn.command("LOGOUT") {
            warn!(error = %e, "IMAP logout failed");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::channels::imap::tests::FakeStream;

    fn config() -> MailboxConfig {
        MailboxConfig {
            host: "imap.test.com".into(),
            port: 993,
            username: "bills@test.com".into(),
            password: SecretString::from("p\"w"),
            folder: "INBOX".into(),
        }
    }

    const LOGIN: &str = "* OK ready\r\n\
        A1 OK logged in\r\n\
        * CAPABILITY IMAP4rev1 UIDPLUS\r\n\
        A2 OK\r\n\
        * 2 EXISTS\r\n\
        A3 OK [READ-WRITE] selected\r\n";

    fn session(rest: &str) -> (ImapSession<FakeStream>, Arc<std::sync::Mutex<Vec<u8>>>) {
        let stream = FakeStream::new(format!("{LOGIN}{rest}").as_bytes());
        let written = stream.written.clone();
        (ImapSession::establish(stream, &config()).unwrap(), written)
    }

    fn sent(written: &Arc<std::sync::Mutex<Vec<u8>>>) -> Vec<String> {
        String::from_utf8(written.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn establish_logs_in_and_selects() {
        let (s, written) = session("");
        assert!(s.uidplus);
        assert_eq!(
            sent(&written),
            vec![
                "A1 LOGIN \"bills@test.com\" \"p\\\"w\"",
                "A2 CAPABILITY",
                "A3 SELECT \"INBOX\"",
            ]
        );
    }

    #[test]
    fn preauth_skips_login() {
        let stream = FakeStream::new(b"* PREAUTH\r\n* CAPABILITY IMAP4rev1\r\nA1 OK\r\nA2 OK\r\n");
        let written = stream.written.clone();
        let s = ImapSession::establish(stream, &config()).unwrap();
        assert!(!s.uidplus);
        assert_eq!(sent(&written), vec!["A1 CAPABILITY", "A2 SELECT \"INBOX\""]);
    }

    #[test]
    fn failed_login_is_rejected() {
        let stream = FakeStream::new(b"* OK\r\nA1 NO bad credentials\r\n");
        assert!(matches!(
            ImapSession::establish(stream, &config()),
            Err(ImapError::Rejected { .. })
        ));
    }

    #[test]
    fn list_fetch_and_commit_by_uid() {
        let (mut s, written) = session(
            "* SEARCH 41 42\r\nA4 OK\r\n\
             * 1 FETCH (UID 41 BODY[] {4}\r\nabcd)\r\nA5 OK\r\n\
             A6 OK\r\nA7 OK\r\n\
             * BYE\r\nA8 OK\r\n",
        );
        assert_eq!(s.list_unread().unwrap(), vec![MessageId(41), MessageId(42)]);
        assert_eq!(s.fetch(MessageId(41)).unwrap(), b"abcd");
        s.mark_deleted_and_commit(MessageId(41)).unwrap();
        s.close();
        s.close();

        assert_eq!(
            sent(&written)[3..],
            [
                "A4 UID SEARCH UNSEEN",
                "A5 UID FETCH 41 (BODY.PEEK[])",
                "A6 UID STORE 41 +FLAGS.SILENT (\\Deleted)",
                "A7 UID EXPUNGE 41",
                "A8 LOGOUT",
            ]
        );
    }

    #[test]
    fn non_ascii_password_sent_as_literal() {
        let mut cfg = config();
        cfg.password = SecretString::from("geslo-čšž");
        let stream = FakeStream::new(
            b"* OK ready\r\n+ go ahead\r\nA1 OK\r\nA2 OK\r\nA3 OK\r\n",
        );
        let written = stream.written.clone();
        ImapSession::establish(stream, &cfg).unwrap();

        let raw = written.lock().unwrap().clone();
        let expected = "A1 LOGIN \"bills@test.com\" {12}\r\ngeslo-čšž\r\n";
        assert!(raw.starts_with(expected.as_bytes()));
    }

    #[test]
    fn mark_seen_stores_flag_by_uid() {
        let (mut s, written) = session("A4 OK\r\n");
        s.mark_seen(MessageId(8)).unwrap();
        assert_eq!(
            sent(&written).last().map(String::as_str),
            Some("A4 UID STORE 8 +FLAGS.SILENT (\\Seen)")
        );
    }

    #[test]
    fn vanished_message_is_a_fetch_error() {
        let (mut s, _) = session("A4 OK no such message\r\n");
        assert!(matches!(
            s.fetch(MessageId(99)),
            Err(MailboxError::Fetch { uid: 99, .. })
        ));
    }

    #[test]
    fn rejected_store_is_a_commit_error() {
        let (mut s, _) = session("A4 NO read-only\r\n");
        assert!(matches!(
            s.mark_deleted_and_commit(MessageId(5)),
            Err(MailboxError::Commit { uid: 5, .. })
        ));
    }

    #[test]
    fn guard_closes_on_drop() {
        struct CountingSession(Arc<std::sync::atomic::AtomicUsize>);
        impl MailboxSession for CountingSession {
            fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError> {
                Ok(vec![])
            }
            fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>, MailboxError> {
                Err(MailboxError::Fetch {
                    uid: id.0,
                    reason: "counting".into(),
                })
            }
            fn mark_deleted_and_commit(&mut self, _: MessageId) -> Result<(), MailboxError> {
                Ok(())
            }
            fn mark_seen(&mut self, _: MessageId) -> Result<(), MailboxError> {
                Ok(())
            }
            fn close(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let mut guard = SessionGuard::new(Box::new(CountingSession(closes.clone())));
            assert!(guard.list_unread().unwrap().is_empty());
        }
        assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
