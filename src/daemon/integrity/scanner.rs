//! Per-job scan worker.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntegrityConfig;
use crate::diskaccess::DiskAccessController;
use crate::error::StoreError;
use crate::meta::MetaStore;
use crate::types::IntegrityVerificationJob;

const TRUNCATION_MARKER: &str = "[report truncated: error limit reached, scan aborted]\n";

/// How a scan run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every record after the cursor was visited.
    Completed,
    /// Cancelled between records; resumable from the saved cursor.
    Stopped,
    /// The report outgrew its cap.
    Aborted,
}

pub(super) struct Scanner {
    pub(super) dac: Arc<DiskAccessController>,
    pub(super) meta: Arc<dyn MetaStore>,
    pub(super) config: IntegrityConfig,
    pub(super) token: CancellationToken,
}

impl Scanner {
    /// Scans from the job's cursor. Progress is saved on the way out whatever the
    /// outcome, including when the scan itself failed.
    pub(super) async fn run(
        self,
        mut job: IntegrityVerificationJob,
    ) -> Result<JobOutcome, StoreError> {
        info!(
            job_id = %job.id,
            volume_id = job.volume_id,
            cursor = ?job.last_completed_blob_ref,
            "integrity scan started"
        );

        let result = self.scan(&mut job).await;

        match result {
            Ok(JobOutcome::Completed) | Ok(JobOutcome::Aborted) => {
                job.completed = Some(Utc::now());
            }
            _ => {}
        }
        self.meta.save_integrity_job(&job).await?;

        match &result {
            Ok(outcome) => info!(
                job_id = %job.id,
                ?outcome,
                bytes_scanned = job.bytes_scanned,
                errors_found = job.errors_found,
                "integrity scan finished"
            ),
            Err(e) => warn!(job_id = %job.id, "integrity scan failed: {e}"),
        }
        result
    }

    async fn scan(&self, job: &mut IntegrityVerificationJob) -> Result<JobOutcome, StoreError> {
        let mut last_checkpoint = Instant::now();

        loop {
            if self.token.is_cancelled() {
                return Ok(JobOutcome::Stopped);
            }

            let batch = self
                .meta
                .scan_blobs(job.last_completed_blob_ref.as_ref(), self.config.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(JobOutcome::Completed);
            }

            for blob in batch {
                if self.token.is_cancelled() {
                    return Ok(JobOutcome::Stopped);
                }

                if blob.is_on_volume(job.volume_id) {
                    match self.dac.scrub(&blob.blob_ref, job.volume_id).await {
                        Ok(scanned) => job.bytes_scanned += scanned,
                        Err(e) => {
                            debug!(job_id = %job.id, blob = %blob.blob_ref, "scrub failed: {e}");
                            job.errors_found += 1;
                            job.report.push_str(&format!("{}: {e}\n", blob.blob_ref));
                        }
                    }
                }
                job.last_completed_blob_ref = Some(blob.blob_ref);

                if job.report.len() > self.config.max_report_bytes {
                    truncate_report(&mut job.report, self.config.max_report_bytes);
                    warn!(job_id = %job.id, errors_found = job.errors_found, "integrity report full, aborting scan");
                    return Ok(JobOutcome::Aborted);
                }

                if last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                    if let Err(e) = self.meta.save_integrity_job(job).await {
                        warn!(job_id = %job.id, "integrity checkpoint failed: {e}");
                    }
                    last_checkpoint = Instant::now();
                }
            }
        }
    }
}

fn truncate_report(report: &mut String, cap: usize) {
    let mut end = cap.saturating_sub(TRUNCATION_MARKER.len()).min(report.len());
    while !report.is_char_boundary(end) {
        end -= 1;
    }
    // cut back to the last whole line
    end = report[..end].rfind('\n').map_or(0, |i| i + 1);
    report.truncate(end);
    report.push_str(TRUNCATION_MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_report_keeps_whole_lines_under_cap() {
        let mut report = String::new();
        for i in 0..100 {
            report.push_str(&format!("{i:064x}: integrity mismatch\n"));
        }
        truncate_report(&mut report, 1000);
        assert!(report.len() <= 1000);
        assert!(report.ends_with(TRUNCATION_MARKER));
        let body = &report[..report.len() - TRUNCATION_MARKER.len()];
        assert!(body.lines().all(|l| l.ends_with("integrity mismatch")));
    }

    #[test]
    fn test_truncate_report_tiny_cap() {
        let mut report = "abc\n".repeat(10);
        truncate_report(&mut report, 3);
        assert_eq!(report, TRUNCATION_MARKER);
    }
}
