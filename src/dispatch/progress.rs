//! Throughput smoothing and per-task progress events.

use serde::Serialize;
use tokio::time::Instant;

/// Published after every task resolution (sent or failed).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub percent: f64,
    /// Smoothed tasks per second.
    pub rate: f64,
    pub eta_seconds: Option<f64>,
    pub completed: usize,
    pub total: usize,
    pub current_supplier: String,
    pub current_project: String,
    pub success: usize,
    pub failed: usize,
}

/// Tracks completed tasks and an exponential moving average of the rate.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    alpha: f64,
    rate_ema: Option<f64>,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize, alpha: f64) -> Self {
        Self {
            total,
            completed: 0,
            alpha,
            rate_ema: None,
            started: Instant::now(),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Record one resolved task, measuring elapsed time since the run started.
    pub fn record(
        &mut self,
        supplier: &str,
        project: &str,
        success: usize,
        failed: usize,
    ) -> ProgressEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.record_at(elapsed, supplier, project, success, failed)
    }

    fn record_at(
        &mut self,
        elapsed_secs: f64,
        supplier: &str,
        project: &str,
        success: usize,
        failed: usize,
    ) -> ProgressEvent {
        self.completed += 1;

        let instant_rate = if elapsed_secs > 0.0 {
            self.completed as f64 / elapsed_secs
        } else {
            0.0
        };
        // The first observation seeds the average.
        let rate = match self.rate_ema {
            None => instant_rate,
            Some(prev) => self.alpha * instant_rate + (1.0 - self.alpha) * prev,
        };
        self.rate_ema = Some(rate);

        let remaining = self.total.saturating_sub(self.completed);
        let eta_seconds = (rate > 0.0).then(|| remaining as f64 / rate);
        let percent = if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        };

        ProgressEvent {
            percent,
            rate,
            eta_seconds,
            completed: self.completed,
            total: self.total,
            current_supplier: supplier.to_string(),
            current_project: project.to_string(),
            success,
            failed,
        }
    }
}
