//! Plain-text payment register for reply bodies.

use rust_decimal::Decimal;

use crate::pipeline::types::Payment;

/// Longest recipient name shown before truncation.
const MAX_RECIPIENT_CHARS: usize = 50;

const RULE_WIDTH: usize = 60;

/// Render payments as a tab-separated table followed by the total.
pub fn format_register(payments: &[Payment]) -> String {
    let rule = "-".repeat(RULE_WIDTH);
    let total: Decimal = payments.iter().map(|p| p.amount).sum();

    let mut lines = vec![
        "Payment register".to_string(),
        String::new(),
        "#\tRecipient\tReference\tAmount (EUR)".to_string(),
        rule.clone(),
    ];
    for (idx, p) in payments.iter().enumerate() {
        lines.push(format!(
            "{}\t{}\t{}\t{:.2}",
            idx + 1,
            shorten(&ascii_slovenian(&p.recipient_name)),
            p.reference.as_deref().unwrap_or(""),
            p.amount
        ));
    }
    lines.push(rule);
    lines.push(format!("TOTAL\t\t\t{total:.2}"));
    lines.join("\n")
}

/// Replace Slovenian diacritics with their base letters.
pub fn ascii_slovenian(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'č' => 'c',
            'Č' => 'C',
            'š' => 's',
            'Š' => 'S',
            'ž' => 'z',
            'Ž' => 'Z',
            other => other,
        })
        .collect()
}

fn shorten(name: &str) -> String {
    if name.chars().count() > MAX_RECIPIENT_CHARS {
        let head: String = name.chars().take(MAX_RECIPIENT_CHARS).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}
