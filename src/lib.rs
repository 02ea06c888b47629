//! Supplier mailer — rate-limited batch delivery of supplier attachments.

pub mod audit;
pub mod batch;
pub mod collector;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;

pub use batch::BatchSender;
pub use dispatch::{ProgressEvent, SendSummary};
