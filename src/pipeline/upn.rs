//! UPN QR payload parsing (Slovenian payment order, upn-qr.si layout).
//!
//! A payload is a newline-separated list of fields:
//!
//! | line | field |
//! |------|-------|
//! | 0 | `UPNQR` leader |
//! | 8 | amount, 11 digits, last two are cents |
//! | 11 | purpose code |
//! | 12 | purpose text |
//! | 14 | recipient IBAN |
//! | 15 | recipient reference |
//! | 16–18 | recipient name, street, city |
//!
//! An optional 3-digit checksum line may follow the 19 data lines.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::pipeline::types::Payment;

const LEADER: &str = "UPNQR";
const DATA_LINES: usize = 19;
const AMOUNT_DIGITS: usize = 11;

static SLOVENIAN_IBAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SI\d{17}$").unwrap());

/// Parse one decoded QR string. Returns `None` if it is not a valid UPN payload.
pub fn parse_upn_payload(payload: &str) -> Option<Payment> {
    if payload.trim().is_empty() {
        return None;
    }
    // Every field is LF-terminated, so trailing blank fields still count.
    let mut lines: Vec<&str> = payload.trim_start().split('\n').map(str::trim).collect();
    while lines.len() > DATA_LINES && lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.len() > DATA_LINES
        && lines
            .last()
            .is_some_and(|l| l.len() == 3 && l.bytes().all(|b| b.is_ascii_digit()))
    {
        lines.pop();
    }
    if lines.len() < DATA_LINES || lines[0] != LEADER {
        return None;
    }

    let amount = parse_amount(lines[8])?;

    let iban = normalize_iban(lines[14]);
    if !SLOVENIAN_IBAN.is_match(&iban) {
        return None;
    }

    let purpose_code: String = lines[11].chars().take(4).collect();
    let purpose = [lines[12], purpose_code.as_str()]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("UPN payment")
        .to_string();
    let recipient_name = if lines[16].is_empty() {
        "Recipient".to_string()
    } else {
        lines[16].to_string()
    };
    let recipient_address = [lines[17], lines[18]]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let reference = Some(lines[15].to_string()).filter(|r| !r.is_empty());

    Some(Payment {
        recipient_name,
        recipient_address,
        iban,
        amount,
        reference,
        purpose_code,
        purpose,
    })
}

/// Parse every payload, dropping invalid ones and duplicates by
/// `(iban, reference, amount)`. Source order is kept.
pub fn parse_upn_payloads<S: AsRef<str>>(payloads: &[S]) -> Vec<Payment> {
    let mut seen = HashSet::new();
    payloads
        .iter()
        .filter_map(|s| parse_upn_payload(s.as_ref()))
        .filter(|p| seen.insert((p.iban.clone(), p.reference.clone(), p.amount)))
        .collect()
}

fn parse_amount(field: &str) -> Option<Decimal> {
    let digits: String = field.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != AMOUNT_DIGITS {
        return None;
    }
    let cents: i64 = digits.parse().ok()?;
    Some(Decimal::new(cents, 2))
}

fn normalize_iban(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}
