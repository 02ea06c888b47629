//! The dispatch loop: pace, send, retry, relocate, report.
//!
//! Tasks are sent strictly one at a time. The only suspension points are
//! the pacing wait and the retry backoff; both race the run's cancellation
//! token, so a cancel takes effect without waiting out the timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::collector::SupplierTask;
use crate::config::{DispatchConfig, layout};
use crate::dispatch::progress::{ProgressEvent, ProgressTracker};
use crate::dispatch::transport::{MailTransport, OutboundEmail};

/// Final counters of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    pub success: usize,
    pub failed: usize,
    /// Supplier groups excluded at collection time for lack of an address.
    /// Filled in by the batch entry point, never by the dispatch loop.
    pub skipped: usize,
    pub cancelled: bool,
}

/// How a single task left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Sent,
    Failed,
    /// Cancelled before an attempt; neither sent nor failed, files untouched.
    Abandoned,
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when
/// the wait was cut short.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// `send_interval ± send_jitter`, never negative.
fn pacing_delay(config: &DispatchConfig) -> Duration {
    let jitter = config.send_jitter.as_secs_f64();
    let offset = if jitter > 0.0 {
        rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        0.0
    };
    Duration::from_secs_f64((config.send_interval.as_secs_f64() + offset).max(0.0))
}

/// `retry_base_delay × uniform(retry_jitter)`.
fn retry_delay(config: &DispatchConfig) -> Duration {
    let (low, high) = config.retry_jitter;
    let factor = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    };
    config.retry_base_delay.mul_f64(factor.max(0.0))
}

/// Executes one run over a fixed task snapshot.
pub struct Dispatcher {
    work_root: PathBuf,
    config: DispatchConfig,
    transport: Arc<dyn MailTransport>,
    audit: AuditLog,
    /// Authenticating account: sender and cc of every email.
    account: String,
    signature: String,
}

impl Dispatcher {
    pub fn new(
        work_root: impl Into<PathBuf>,
        config: DispatchConfig,
        transport: Arc<dyn MailTransport>,
        audit: AuditLog,
        account: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            work_root: work_root.into(),
            config,
            transport,
            audit,
            account: account.into(),
            signature: signature.into(),
        }
    }

    /// Send every task in order, honoring `cancel`. Progress events go to
    /// `progress` when given; a closed receiver is ignored. The transport
    /// is shut down before returning.
    pub async fn run(
        &self,
        tasks: Vec<SupplierTask>,
        cancel: &CancellationToken,
        progress: Option<&mpsc::UnboundedSender<ProgressEvent>>,
    ) -> SendSummary {
        let summary = self.run_tasks(tasks, cancel, progress).await;
        self.transport.shutdown().await;
        summary
    }

    async fn run_tasks(
        &self,
        tasks: Vec<SupplierTask>,
        cancel: &CancellationToken,
        progress: Option<&mpsc::UnboundedSender<ProgressEvent>>,
    ) -> SendSummary {
        let mut summary = SendSummary::default();
        let total = tasks.len();
        if total == 0 {
            self.audit.info("No tasks to send.");
            return summary;
        }

        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, total, "Dispatch run started");
        let mut tracker = ProgressTracker::new(total, self.config.ema_alpha);

        for (index, task) in tasks.iter().enumerate() {
            if cancel.is_cancelled() {
                self.audit.info("Sending cancelled by user, stopping early.");
                summary.cancelled = true;
                break;
            }

            if index > 0 {
                let wait = pacing_delay(&self.config);
                self.audit.info(format!(
                    "Waiting {:.1}s before the next email ...",
                    wait.as_secs_f64()
                ));
                if !cancellable_sleep(wait, cancel).await {
                    self.audit.info("Sending cancelled by user during pacing wait.");
                    summary.cancelled = true;
                    break;
                }
            }

            match self.deliver(task, cancel).await {
                TaskOutcome::Sent => {
                    summary.success += 1;
                    self.audit
                        .info(format!("{}success - email sent.", log_prefix(task)));
                    let sent_dir = self.project_dir(task).join(layout::SENT_DIR);
                    self.relocate(task, &sent_dir);
                }
                TaskOutcome::Failed => {
                    summary.failed += 1;
                    self.audit
                        .error(format!("{}failed - email could not be sent.", log_prefix(task)));
                    let failed_dir = self.project_dir(task).join(layout::FAILED_DIR);
                    match std::fs::create_dir_all(&failed_dir) {
                        Ok(()) => self.relocate(task, &failed_dir),
                        Err(e) => self.audit.error(format!(
                            "{}cannot create {}/: {e}",
                            log_prefix(task),
                            layout::FAILED_DIR
                        )),
                    }
                }
                TaskOutcome::Abandoned => {
                    self.audit.info(format!(
                        "{}abandoned - cancelled before delivery.",
                        log_prefix(task)
                    ));
                    summary.cancelled = true;
                    continue;
                }
            }

            let event = tracker.record(
                &task.supplier_code,
                &task.project_folder,
                summary.success,
                summary.failed,
            );
            if let Some(tx) = progress {
                let _ = tx.send(event);
            }
        }

        tracing::info!(
            %run_id,
            success = summary.success,
            failed = summary.failed,
            cancelled = summary.cancelled,
            completed = tracker.completed(),
            "Dispatch run finished"
        );
        summary
    }

    /// Attempt delivery up to `max_attempts` times with backoff between
    /// attempts. Cancellation is checked before every attempt.
    async fn deliver(&self, task: &SupplierTask, cancel: &CancellationToken) -> TaskOutcome {
        let prefix = log_prefix(task);
        let email = OutboundEmail::compose(task, &self.account, &self.signature);
        let max_attempts = self.config.max_attempts.max(1);

        self.audit.info(format!(
            "{prefix}sending email to {}, attachments: {}",
            task.to_addresses,
            task.files.len()
        ));

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return TaskOutcome::Abandoned;
            }

            match self.transport.send(&email).await {
                Ok(()) => return TaskOutcome::Sent,
                Err(e) => {
                    self.audit.error(format!(
                        "{prefix}send failed (attempt {attempt}/{max_attempts}): {e}"
                    ));
                }
            }

            if attempt < max_attempts {
                let wait = retry_delay(&self.config);
                self.audit.info(format!(
                    "Retry {attempt}/{}, waiting {:.1}s ...",
                    max_attempts - 1,
                    wait.as_secs_f64()
                ));
                // A cancelled wait is caught by the check at the top of the loop.
                cancellable_sleep(wait, cancel).await;
            }
        }

        TaskOutcome::Failed
    }

    fn project_dir(&self, task: &SupplierTask) -> PathBuf {
        self.work_root.join(&task.project_folder)
    }

    /// Move every file of `task` into `dest`. Per-file failures are logged
    /// and never change the task's classification.
    fn relocate(&self, task: &SupplierTask, dest: &Path) {
        let dest_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        for file in &task.files {
            let Some(name) = file.file_name() else {
                continue;
            };
            match std::fs::rename(file, dest.join(name)) {
                Ok(()) => self.audit.info(format!(
                    "{}moved to {dest_name}/: {}",
                    log_prefix(task),
                    name.to_string_lossy()
                )),
                Err(e) => self.audit.error(format!(
                    "{}failed to move {} to {dest_name}/: {e}",
                    log_prefix(task),
                    name.to_string_lossy()
                )),
            }
        }
    }
}

fn log_prefix(task: &SupplierTask) -> String {
    format!("Supplier {} ({}): ", task.supplier_code, task.project_folder)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::error::MailError;

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyTransport {
        failures: usize,
        attempts: AtomicUsize,
        sent_at: Mutex<Vec<Instant>>,
        shutdowns: AtomicUsize,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicUsize::new(0),
                sent_at: Mutex::new(Vec::new()),
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MailTransport for FlakyTransport {
        async fn send(&self, _email: &OutboundEmail) -> Result<(), MailError> {
            self.sent_at.lock().unwrap().push(Instant::now());
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(MailError::SendFailed("421 try later".into()))
            } else {
                Ok(())
            }
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture(root: &Path, project: &str, files: &[&str]) -> SupplierTask {
        let pending = root.join(project).join(layout::PENDING_DIR);
        std::fs::create_dir_all(&pending).unwrap();
        std::fs::create_dir_all(root.join(project).join(layout::SENT_DIR)).unwrap();
        let paths = files
            .iter()
            .map(|f| {
                let p = pending.join(f);
                std::fs::write(&p, b"xlsx").unwrap();
                p
            })
            .collect();
        SupplierTask {
            project_folder: project.into(),
            supplier_code: "12345".into(),
            files: paths,
            to_addresses: "a@x.com".into(),
        }
    }

    fn dispatcher(root: &Path, transport: Arc<FlakyTransport>) -> Dispatcher {
        Dispatcher::new(
            root,
            DispatchConfig::default(),
            transport,
            AuditLog::for_root(root),
            "me@corp.com",
            "sig",
        )
    }

    #[test]
    fn pacing_delay_within_jitter() {
        let config = DispatchConfig::default();
        for _ in 0..100 {
            let d = pacing_delay(&config);
            assert!(d >= Duration::from_secs(11) && d <= Duration::from_secs(13));
        }
    }

    #[test]
    fn retry_delay_within_range() {
        let config = DispatchConfig::default();
        for _ in 0..100 {
            let d = retry_delay(&config);
            assert!(d >= Duration::from_secs(48) && d <= Duration::from_secs(72));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_sleep_completes_and_cancels() {
        let token = CancellationToken::new();
        assert!(cancellable_sleep(Duration::from_secs(5), &token).await);
        token.cancel();
        let start = Instant::now();
        assert!(!cancellable_sleep(Duration::from_secs(5), &token).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_run_is_noop() {
        let tmp = TempDir::new().unwrap();
        let transport = FlakyTransport::new(0);
        let summary = dispatcher(tmp.path(), transport.clone())
            .run(Vec::new(), &CancellationToken::new(), None)
            .await;
        assert_eq!(summary, SendSummary::default());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let tmp = TempDir::new().unwrap();
        let task = fixture(tmp.path(), "A项目", &["x_12345_1.xlsx"]);
        let transport = FlakyTransport::new(2);

        let summary = dispatcher(tmp.path(), transport.clone())
            .run(vec![task], &CancellationToken::new(), None)
            .await;
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert!(tmp
            .path()
            .join("A项目")
            .join(layout::SENT_DIR)
            .join("x_12345_1.xlsx")
            .exists());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_attempts_three_times_with_two_delays() {
        let tmp = TempDir::new().unwrap();
        let task = fixture(tmp.path(), "A项目", &["x_12345_1.xlsx"]);
        let transport = FlakyTransport::new(usize::MAX);

        let started = Instant::now();
        let summary = dispatcher(tmp.path(), transport.clone())
            .run(vec![task], &CancellationToken::new(), None)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(summary.failed, 1);
        let sent_at = transport.sent_at.lock().unwrap().clone();
        assert_eq!(sent_at.len(), 3);
        for pair in sent_at.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(48) && gap <= Duration::from_secs(72));
        }
        // No delay after the final attempt.
        assert!(elapsed <= Duration::from_secs(144) + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_event_per_resolution() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = vec![fixture(tmp.path(), "A项目", &["x_12345_1.xlsx"])];
        let mut second = fixture(tmp.path(), "B项目", &["y_67890_1.xlsx"]);
        second.supplier_code = "67890".into();
        tasks.push(second);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = FlakyTransport::new(0);
        let summary = dispatcher(tmp.path(), transport)
            .run(tasks, &CancellationToken::new(), Some(&tx))
            .await;
        drop(tx);

        assert_eq!(summary.success, 2);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].current_supplier, "12345");
        assert_eq!(events[1].current_project, "B项目");
        assert_eq!(events[1].completed, events[1].total);
        assert_eq!(events[1].percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_abandons_task() {
        let tmp = TempDir::new().unwrap();
        let task = fixture(tmp.path(), "A项目", &["x_12345_1.xlsx"]);
        let pending_file = task.files[0].clone();
        let transport = FlakyTransport::new(usize::MAX);
        let token = CancellationToken::new();

        let engine = dispatcher(tmp.path(), transport.clone());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                token.cancel();
            })
        };
        let summary = engine.run(vec![task], &token, None).await;
        canceller.await.unwrap();

        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.cancelled);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(pending_file.exists());
        assert!(!tmp.path().join("A项目").join(layout::FAILED_DIR).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn relocation_failure_keeps_success() {
        let tmp = TempDir::new().unwrap();
        let mut task = fixture(tmp.path(), "A项目", &["x_12345_1.xlsx"]);
        let missing = tmp.path().join("A项目").join(layout::PENDING_DIR);
        task.files.push(missing.join("gone_12345_2.xlsx"));

        let audit = AuditLog::for_root(tmp.path());
        let summary = dispatcher(tmp.path(), FlakyTransport::new(0))
            .run(vec![task], &CancellationToken::new(), None)
            .await;

        assert_eq!(summary.success, 1);
        let log = std::fs::read_to_string(audit.path()).unwrap();
        assert!(log.contains("moved to 已外发/: x_12345_1.xlsx"));
        assert!(
            log.contains(" - ERROR - Supplier 12345 (A项目): failed to move gone_12345_2.xlsx")
        );
    }
}
