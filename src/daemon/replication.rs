//! Replication controller
//!
//! A discovery tick turns the metadata store's pending-replication queue into
//! `(blob, from, to)` jobs and feeds them through a bounded channel to a fixed pool of
//! workers. A failed job leaves the blob record untouched, so the next tick finds it
//! again.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::diskaccess::DiskAccessController;
use crate::error::StoreError;
use crate::meta::MetaStore;
use crate::types::{BlobRef, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicationJob {
    pub blob_ref: BlobRef,
    pub from_volume_id: VolumeId,
    pub to_volume_id: VolumeId,
}

type JobReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ReplicationJob>>>;

pub struct ReplicationController {
    dac: Arc<DiskAccessController>,
    meta: Arc<dyn MetaStore>,
    config: ReplicationConfig,
    /// `(blob, target)` pairs queued or being copied.
    inflight: Mutex<HashSet<(BlobRef, VolumeId)>>,
}

impl ReplicationController {
    pub fn new(
        dac: Arc<DiskAccessController>,
        meta: Arc<dyn MetaStore>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            dac,
            meta,
            config,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Runs until `token` is cancelled, then closes the queue and waits for the
    /// workers to finish the job they hold.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let (tx, rx) = mpsc::channel(self.config.batch_size.max(1));
        let rx: JobReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            workers.spawn(self.clone().worker(worker_id, rx.clone(), token.clone()));
        }
        info!(
            workers = self.config.workers,
            meta = self.meta.name(),
            interval = ?self.config.interval,
            "replication controller started"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'ticks: loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let jobs = match self.discover_batch().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!("replication discovery failed: {e}");
                    continue;
                }
            };
            if !jobs.is_empty() {
                debug!(count = jobs.len(), "replication jobs discovered");
            }

            let mut jobs = jobs.into_iter();
            while let Some(job) = jobs.next() {
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    res = tx.send(job) => res.is_ok(),
                };
                if !sent {
                    self.release(&job);
                    jobs.by_ref().for_each(|rest| self.release(&rest));
                    break 'ticks;
                }
            }
        }

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("replication worker panicked: {e}");
            }
        }

        // jobs still queued when the workers left
        let mut rx = rx.lock().await;
        while let Ok(job) = rx.try_recv() {
            self.release(&job);
        }
        info!("replication controller stopped");
    }

    async fn worker(self: Arc<Self>, worker_id: usize, rx: JobReceiver, token: CancellationToken) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };

            if token.is_cancelled() {
                self.release(&job);
                break;
            }

            let result = self.replicate_one(&job).await;
            self.release(&job);

            if let Err(e) = result {
                warn!(
                    worker_id,
                    blob = %job.blob_ref,
                    from = job.from_volume_id,
                    to = job.to_volume_id,
                    "replication failed: {e}"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.config.failure_pause) => {}
                }
            }
        }
        debug!(worker_id, "replication worker exited");
    }

    /// One tick of discovery. Pairs already in flight and volumes this node does not
    /// drive are skipped; returned jobs are marked in flight.
    pub async fn discover_batch(&self) -> Result<Vec<ReplicationJob>, StoreError> {
        let pending = self
            .meta
            .blobs_pending_replication(self.config.batch_size)
            .await?;

        let mut jobs = Vec::new();
        let mut inflight = self.inflight.lock();
        for blob in pending {
            let from_volume_id = match self.dac.best_volume_id(&blob.volumes) {
                Ok(id) => id,
                Err(e) => {
                    debug!(blob = %blob.blob_ref, "no replication source here: {e}");
                    continue;
                }
            };
            for &to_volume_id in &blob.volumes_pending_replication {
                if jobs.len() >= self.config.batch_size {
                    return Ok(jobs);
                }
                if !self.dac.is_mounted(to_volume_id) {
                    continue;
                }
                if !inflight.insert((blob.blob_ref, to_volume_id)) {
                    continue;
                }
                jobs.push(ReplicationJob {
                    blob_ref: blob.blob_ref,
                    from_volume_id,
                    to_volume_id,
                });
            }
        }
        Ok(jobs)
    }

    pub async fn replicate_one(&self, job: &ReplicationJob) -> Result<(), StoreError> {
        self.dac
            .replicate(job.from_volume_id, job.to_volume_id, &job.blob_ref)
            .await
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    fn release(&self, job: &ReplicationJob) {
        self.inflight
            .lock()
            .remove(&(job.blob_ref, job.to_volume_id));
    }
}
