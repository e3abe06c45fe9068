//! Message processing pipeline.
//!
//! Every unread message flows through:
//! 1. `extract::extract_pdf_attachments()`: MIME → PDF attachments
//! 2. `convert::convert_all()`: each PDF through the `Converter`
//! 3. `reply::compose_reply()`: originals, converted copies, payment register
//! 4. `driver::PipelineDriver`: send, then delete only after a confirmed send
//!
//! **Deletion never precedes delivery.** A message whose reply was not
//! accepted stays unread for the next cycle.

pub mod convert;
pub mod converter_command;
pub mod driver;
pub mod epc;
pub mod extract;
pub mod register;
pub mod reply;
pub mod types;
pub mod upn;
