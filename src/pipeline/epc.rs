//! EPC QR payload (EPC069-12, SEPA credit transfer) built from a payment.

use crate::pipeline::types::Payment;

const SERVICE_TAG: &str = "BCD";
const VERSION: &str = "002";
/// Character set 1 = UTF-8.
const CHARSET: &str = "1";
const IDENTIFICATION: &str = "SCT";

/// Build the newline-separated EPC payload for one payment. BIC is left
/// empty, which the guidelines allow inside the EEA.
pub fn build_epc_payload(payment: &Payment) -> String {
    let iban: String = payment
        .iban
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    let mut fields = vec![
        SERVICE_TAG.to_string(),
        VERSION.to_string(),
        CHARSET.to_string(),
        IDENTIFICATION.to_string(),
        String::new(),
        truncate(&payment.recipient_name, 70),
        truncate(&iban, 34),
        format!("EUR{:.2}", payment.amount),
        truncate(&payment.purpose_code, 4),
        truncate(payment.reference.as_deref().unwrap_or(""), 35),
        truncate(&payment.purpose, 70),
    ];
    while fields.len() > 1 && fields.last().is_some_and(String::is_empty) {
        fields.pop();
    }
    fields.join("\n")
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
