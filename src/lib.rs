//! epc-mailer: answers mailed UPN payment slips with EPC QR versions.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
