//! Rate-limited sequential delivery of supplier tasks.

pub mod engine;
pub mod progress;
pub mod smtp;
pub mod transport;

pub use engine::{Dispatcher, SendSummary, TaskOutcome};
pub use progress::{ProgressEvent, ProgressTracker};
pub use smtp::{SmtpConnector, SmtpMailer};
pub use transport::{Connector, MailTransport, OutboundEmail};
