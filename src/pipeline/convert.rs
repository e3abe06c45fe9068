//! Converter boundary and the per-message conversion orchestrator.
//!
//! The [`Converter`] is the external QR engine. [`ConverterAdapter`] turns
//! whatever it does into a [`ConversionResult`] so one bad document never
//! takes its siblings down with it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ConversionError;
use crate::pipeline::types::{
    Attachment, ConversionResult, DocumentOutcome, Payment, ProcessingOutcome,
};

/// What a converter can report for a document it handled without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Converted { pdf: Vec<u8>, payments: Vec<Payment> },
    NoCodesFound,
}

/// Turns one PDF with UPN codes into one with EPC codes.
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    fn convert(&self, pdf: &[u8]) -> Result<Conversion, ConversionError>;
}

/// Stateless wrapper that maps converter errors and panics to `Failed`.
#[derive(Clone)]
pub struct ConverterAdapter {
    converter: Arc<dyn Converter>,
}

impl ConverterAdapter {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }

    pub fn converter_name(&self) -> &str {
        self.converter.name()
    }

    /// Convert one document. Never fails; never retries.
    pub fn convert(&self, pdf: &[u8]) -> ConversionResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.converter.convert(pdf)))
            .unwrap_or_else(|payload| Err(ConversionError::Panicked(panic_message(&*payload))));

        match outcome {
            Ok(Conversion::Converted { payments, .. }) if payments.is_empty() => {
                ConversionResult::NoCodesFound
            }
            Ok(Conversion::Converted { pdf, payments }) => {
                ConversionResult::Converted { pdf, payments }
            }
            Ok(Conversion::NoCodesFound) => ConversionResult::NoCodesFound,
            Err(e) => ConversionResult::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Run every attachment through the adapter, in order, one entry each.
pub fn convert_all(adapter: &ConverterAdapter, attachments: Vec<Attachment>) -> ProcessingOutcome {
    let documents = attachments
        .into_iter()
        .map(|attachment| {
            let result = adapter.convert(&attachment.content);
            match &result {
                ConversionResult::Converted { payments, .. } => {
                    let total: rust_decimal::Decimal = payments.iter().map(|p| p.amount).sum();
                    info!(
                        file = %attachment.filename,
                        payments = payments.len(),
                        total = %format!("{total:.2}"),
                        "Converted attachment"
                    );
                }
                ConversionResult::NoCodesFound => {
                    debug!(file = %attachment.filename, "No UNP codes in attachment");
                }
                ConversionResult::Failed { reason } => {
                    warn!(file = %attachment.filename, reason = %reason, "Convert failed");
                }
            }
            DocumentOutcome { attachment, result }
        })
        .collect();

    ProcessingOutcome { documents }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    /// Converter driven by the first bytes of the document:
    /// `ok:<n>` → n payments, `none` → no codes, `err` → error, `panic` → panic.
    pub(crate) struct ScriptedConverter;

    impl Converter for ScriptedConverter {
        fn name(&self) -> &str {
            "scripted"
        }

        fn convert(&self, pdf: &[u8]) -> Result<Conversion, ConversionError> {
            let text = String::from_utf8_lossy(pdf);
            if let Some(n) = text.strip_prefix("ok:") {
                let n: u32 = n.trim().parse().unwrap_or(1);
                let payments = (1..=n)
                    .map(|i| Payment {
                        recipient_name: format!("Recipient {i}"),
                        recipient_address: String::new(),
                        iban: "SI56011006000001234".into(),
                        amount: dec!(10.25) * rust_decimal::Decimal::from(i),
                        reference: Some(format!("SI12-{i}")),
                        purpose_code: "OTHR".into(),
                        purpose: "Invoice".into(),
                    })
                    .collect();
                Ok(Conversion::Converted {
                    pdf: format!("converted {text}").into_bytes(),
                    payments,
                })
            } else if text.starts_with("none") {
                Ok(Conversion::NoCodesFound)
            } else if text.starts_with("panic") {
                panic!("decoder blew up");
            } else {
                Err(ConversionError::InvalidOutput("not a pdf".into()))
            }
        }
    }

    fn adapter() -> ConverterAdapter {
        ConverterAdapter::new(Arc::new(ScriptedConverter))
    }

    fn attachment(name: &str, body: &str) -> Attachment {
        Attachment {
            filename: name.into(),
            content: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn converted_document_keeps_payments() {
        match adapter().convert(b"ok:2") {
            ConversionResult::Converted { pdf, payments } => {
                assert_eq!(pdf, b"converted ok:2");
                assert_eq!(payments.len(), 2);
                assert_eq!(payments[1].amount, dec!(20.50));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn converter_error_becomes_failed() {
        assert!(matches!(
            adapter().convert(b"garbage"),
            ConversionResult::Failed { reason } if reason.contains("not a pdf")
        ));
    }

    #[test]
    fn converter_panic_becomes_failed() {
        assert!(matches!(
            adapter().convert(b"panic"),
            ConversionResult::Failed { reason } if reason.contains("decoder blew up")
        ));
    }

    #[test]
    fn converted_without_payments_counts_as_no_codes() {
        assert_eq!(adapter().convert(b"ok:0"), ConversionResult::NoCodesFound);
    }

    #[test]
    fn outcome_has_one_entry_per_attachment_in_order() {
        let outcome = convert_all(
            &adapter(),
            vec![
                attachment("a.pdf", "ok:1"),
                attachment("b.pdf", "panic"),
                attachment("c.pdf", "none"),
                attachment("d.pdf", "garbage"),
                attachment("e.pdf", "ok:3"),
            ],
        );
        let summary: Vec<(&str, &str)> = outcome
            .documents
            .iter()
            .map(|d| (d.attachment.filename.as_str(), d.result.label()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a.pdf", "converted"),
                ("b.pdf", "failed"),
                ("c.pdf", "no_codes_found"),
                ("d.pdf", "failed"),
                ("e.pdf", "converted"),
            ]
        );
    }

    #[test]
    fn failure_does_not_change_sibling_status() {
        let alone = convert_all(&adapter(), vec![attachment("a.pdf", "ok:2")]);
        let with_failure = convert_all(
            &adapter(),
            vec![attachment("x.pdf", "panic"), attachment("a.pdf", "ok:2")],
        );
        assert_eq!(alone.documents[0].result, with_failure.documents[1].result);
    }

    #[test]
    fn empty_input_gives_empty_outcome() {
        assert!(convert_all(&adapter(), vec![]).is_empty());
    }
}
