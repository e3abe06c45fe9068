//! Minimal blocking IMAP4rev1 client: tagged commands, untagged responses
//! and binary-safe `{n}` literals over any `Read + Write` stream.

use std::io::{Read, Write};

/// Longest response line accepted before the server is considered broken.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ImapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{command} rejected: {status} {text}")]
    Rejected {
        command: String,
        status: String,
        text: String,
    },

    #[error("Connection closed by server")]
    Closed,
}

/// One logical response line with its literals cut out.
///
/// `text` keeps everything outside the literals, so
/// `* 3 FETCH (UID 9 BODY[] {120}\r\n<120 bytes>)\r\n` becomes
/// `* 3 FETCH (UID 9 BODY[] )` plus one literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// How the server opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Ok,
    PreAuth,
}

pub struct ImapConnection<S> {
    stream: S,
    buf: Vec<u8>,
    next_tag: u32,
}

impl<S: Read + Write> ImapConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            next_tag: 1,
        }
    }

    /// Read the server greeting. `* BYE` is a rejection.
    pub fn read_greeting(&mut self) -> Result<Greeting, ImapError> {
        let line = self.read_response_line()?;
        if line.text.starts_with("* OK") {
            Ok(Greeting::Ok)
        } else if line.text.starts_with("* PREAUTH") {
            Ok(Greeting::PreAuth)
        } else {
            Err(ImapError::Rejected {
                command: "greeting".into(),
                status: line.text.split_whitespace().nth(1).unwrap_or("").to_string(),
                text: line.text,
            })
        }
    }

    /// Send one command and collect its untagged responses.
    ///
    /// Only the command verb ends up in errors so credentials never leak
    /// into logs.
    pub fn command(&mut self, command: &str) -> Result<Vec<ResponseLine>, ImapError> {
        self.command_with_strings(command, &[])
    }

    /// Send `command` followed by string arguments. Printable ASCII goes out
    /// as a quoted string, anything else as a synchronizing `{n}` literal.
    pub fn command_with_strings(
        &mut self,
        command: &str,
        strings: &[&str],
    ) -> Result<Vec<ResponseLine>, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        let verb = command_verb(command);
        let mut untagged = Vec::new();

        let mut pending = format!("{tag} {command}").into_bytes();
        for value in strings {
            pending.push(b' ');
            if needs_literal(value) {
                pending.extend_from_slice(format!("{{{}}}\r\n", value.len()).as_bytes());
                self.send(&pending)?;
                self.await_continuation(&tag, &verb, &mut untagged)?;
                pending = value.as_bytes().to_vec();
            } else {
                pending.extend_from_slice(quote(value).as_bytes());
            }
        }
        pending.extend_from_slice(b"\r\n");
        self.send(&pending)?;

        loop {
            let line = self.read_response_line()?;
            if let Some(done) = completion(&line.text, &tag, &verb) {
                return done.map(|()| untagged);
            }
            if line.text.starts_with('+') {
                return Err(ImapError::Protocol(format!(
                    "unexpected continuation request during {verb}"
                )));
            }
            untagged.push(line);
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ImapError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Wait for the `+` that lets a literal through.
    fn await_continuation(
        &mut self,
        tag: &str,
        verb: &str,
        untagged: &mut Vec<ResponseLine>,
    ) -> Result<(), ImapError> {
        loop {
            let line = self.read_response_line()?;
            if line.text.starts_with('+') {
                return Ok(());
            }
            if let Some(done) = completion(&line.text, tag, verb) {
                done?;
                return Err(ImapError::Protocol(format!(
                    "{verb} completed before its literal was sent"
                )));
            }
            untagged.push(line);
        }
    }

    fn read_response_line(&mut self) -> Result<ResponseLine, ImapError> {
        let mut text = String::new();
        let mut literals = Vec::new();
        loop {
            let raw = self.read_raw_line()?;
            let chunk = String::from_utf8_lossy(&raw);
            match literal_size(&chunk) {
                Some((prefix_len, size)) => {
                    text.push_str(&chunk[..prefix_len]);
                    literals.push(self.read_bytes(size)?);
                }
                None => {
                    text.push_str(&chunk);
                    return Ok(ResponseLine { text, literals });
                }
            }
        }
    }

    /// One CRLF-terminated line, without the CRLF.
    fn read_raw_line(&mut self) -> Result<Vec<u8>, ImapError> {
        let mut scanned = 0;
        loop {
            if let Some(i) = self.buf[scanned..].windows(2).position(|w| w == b"\r\n") {
                let end = scanned + i;
                let line = self.buf[..end].to_vec();
                self.buf.drain(..end + 2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE {
                return Err(ImapError::Protocol("response line too long".into()));
            }
            scanned = self.buf.len().saturating_sub(1);
            self.fill()?;
        }
    }

    fn read_bytes(&mut self, size: usize) -> Result<Vec<u8>, ImapError> {
        while self.buf.len() < size {
            self.fill()?;
        }
        Ok(self.buf.drain(..size).collect())
    }

    fn fill(&mut self) -> Result<(), ImapError> {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(ImapError::Closed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// `Some((index of '{', n))` if the line announces a literal of `n` bytes.
fn literal_size(line: &str) -> Option<(usize, usize)> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    let size = body[open + 1..].parse().ok()?;
    Some((open, size))
}

fn command_verb(command: &str) -> String {
    let mut words = command.split_whitespace();
    match words.next() {
        Some(first) if first.eq_ignore_ascii_case("UID") => {
            format!("UID {}", words.next().unwrap_or(""))
        }
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

/// `Some` once `text` is the tagged completion for `tag`.
fn completion(text: &str, tag: &str, verb: &str) -> Option<Result<(), ImapError>> {
    let rest = text.strip_prefix(tag)?.strip_prefix(' ')?;
    let (status, detail) = rest.split_once(' ').unwrap_or((rest, ""));
    Some(if status.eq_ignore_ascii_case("OK") {
        Ok(())
    } else {
        Err(ImapError::Rejected {
            command: verb.to_string(),
            status: status.to_string(),
            text: detail.to_string(),
        })
    })
}

/// Quoted strings carry 7-bit text only and no line breaks.
fn needs_literal(value: &str) -> bool {
    !value.is_ascii() || value.contains(['\r', '\n', '\0'])
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Numbers from every `* SEARCH` response.
pub fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Upper-cased capability atoms from `* CAPABILITY` responses.
pub fn parse_capabilities(lines: &[ResponseLine]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* CAPABILITY"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_ascii_uppercase))
        .collect()
}

/// The message body from a `UID FETCH ... (BODY.PEEK[])` response.
///
/// Unsolicited FETCH responses (flag updates) carry no literal and are skipped.
pub fn fetched_body(lines: Vec<ResponseLine>) -> Option<Vec<u8>> {
    lines
        .into_iter()
        .filter(|l| l.text.starts_with("* ") && l.text.contains(" FETCH "))
        .find_map(|l| l.literals.into_iter().next())
}
