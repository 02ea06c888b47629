//! Entry points used by callers: batch send, cancel, pending count, log
//! retrieval, and credential maintenance.
//!
//! Run-level failures never surface as errors here. They are written to the
//! audit log and folded into the returned [`SendSummary`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::collector;
use crate::config::{self, DispatchConfig, SmtpEndpoint};
use crate::directory::AddressDirectory;
use crate::dispatch::{Connector, Dispatcher, ProgressEvent, SendSummary, SmtpConnector, smtp};
use crate::error::{ConfigError, Result};

/// Clears the running flag when a run ends, on every path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Batch sender bound to one work root.
///
/// Each call to [`send_batch`](Self::send_batch) gets a fresh cancellation
/// token; [`cancel`](Self::cancel) trips the token of the current run.
/// Only one run may be active at a time.
pub struct BatchSender {
    work_root: PathBuf,
    config: DispatchConfig,
    connector: Arc<dyn Connector>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl BatchSender {
    /// Sender delivering over SMTP with the default pacing.
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            config: DispatchConfig::default(),
            connector: Arc::new(SmtpConnector),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::for_root(&self.work_root)
    }

    /// Cancel the active run, if any. Idempotent.
    pub fn cancel(&self) {
        match self.cancel.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    fn endpoint(&self) -> std::result::Result<SmtpEndpoint, ConfigError> {
        let endpoint = config::load_smtp_endpoint(&self.work_root)?
            .ok_or_else(|| ConfigError::MissingSmtp("no [smtp] section found".into()))?;
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Send every pending task of the selected projects (all projects when
    /// `projects` is empty).
    pub async fn send_batch(
        &self,
        projects: &[String],
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> SendSummary {
        let audit = self.audit();
        let mut summary = SendSummary::default();

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            audit.error("A batch is already running; concurrent runs are not supported.");
            return summary;
        }
        let _guard = RunGuard(&self.running);
        let cancel = self.fresh_token();

        let endpoint = match self.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                audit.error(format!("SMTP configuration missing or invalid, aborting: {e}"));
                return summary;
            }
        };

        let directory = AddressDirectory::load(&self.work_root, &audit);
        let signature = config::load_signature(&self.work_root);
        let collection = collector::collect_tasks(&self.work_root, projects, &directory, &audit);
        summary.skipped = collection.unaddressed;

        if collection.tasks.is_empty() {
            audit.info("No tasks to send.");
            return summary;
        }

        let transport = match self.connector.connect(&endpoint, &self.config) {
            Ok(transport) => transport,
            Err(e) => {
                audit.error(format!("Cannot open mail transport, aborting: {e}"));
                return summary;
            }
        };

        let dispatcher = Dispatcher::new(
            &self.work_root,
            self.config.clone(),
            transport,
            audit,
            endpoint.username.clone(),
            signature,
        );
        let outcome = dispatcher
            .run(collection.tasks, &cancel, progress.as_ref())
            .await;

        SendSummary {
            skipped: summary.skipped,
            ..outcome
        }
    }

    /// Number of emails a run over `projects` would send.
    pub fn count_pending(&self, projects: &[String]) -> usize {
        let directory = AddressDirectory::load(&self.work_root, &self.audit());
        collector::count_pending(&self.work_root, projects, &directory)
    }

    /// Last `max_lines` lines of the audit log.
    pub fn load_log(&self, max_lines: usize) -> String {
        self.audit().tail(max_lines)
    }

    /// Verify the stored SMTP credentials against the server.
    pub async fn test_smtp_connection(&self) -> Result<String> {
        let endpoint = self.endpoint()?;
        smtp::test_connection(&endpoint, &self.config).await?;
        Ok("SMTP connection succeeded".to_string())
    }

    pub fn save_smtp_credentials(&self, username: &str, password: &str) -> Result<String> {
        Ok(config::save_smtp_credentials(&self.work_root, username, password)?)
    }

    pub fn load_signature(&self) -> String {
        config::load_signature(&self.work_root)
    }

    pub fn save_signature(&self, content: &str) -> Result<String> {
        Ok(config::save_signature(&self.work_root, content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_smtp_config_returns_zero_summary() {
        let tmp = TempDir::new().unwrap();
        let sender = BatchSender::new(tmp.path());

        let summary = sender.send_batch(&[], None).await;
        assert_eq!(summary, SendSummary::default());
        assert!(!sender.is_running());

        let log = sender.load_log(10);
        assert!(log.contains(" - ERROR - SMTP configuration missing or invalid"));
    }

    #[tokio::test]
    async fn blank_username_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(config::paths::SMTP_CONFIG),
            "[smtp]\nhost = smtp.example.com\nusername =\n",
        )
        .unwrap();
        let sender = BatchSender::new(tmp.path());

        let summary = sender.send_batch(&[], None).await;
        assert_eq!(summary, SendSummary::default());
        assert!(sender.test_smtp_connection().await.is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let sender = BatchSender::new(tmp.path());
        sender.cancel();
        sender.cancel();
        assert!(!sender.is_running());
    }

    #[test]
    fn credential_and_signature_maintenance() {
        let tmp = TempDir::new().unwrap();
        let sender = BatchSender::new(tmp.path());
        assert!(sender.save_smtp_credentials("me@corp.com", "pw").is_ok());
        assert!(sender.save_signature("Regards").is_ok());
        assert_eq!(sender.load_signature(), "Regards");
        assert!(sender.endpoint().is_ok());
    }
}
