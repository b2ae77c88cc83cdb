//! Integrity verification controller
//!
//! One control loop owns the table of running scans. Every lifecycle request
//! (resume, stop, list) is a message to that loop, so there is a single answer to
//! "which jobs are running". Scans themselves run as separate tasks and stop
//! cooperatively between records.

mod scanner;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntegrityConfig;
use crate::diskaccess::DiskAccessController;
use crate::error::StoreError;
use crate::meta::MetaStore;
use crate::types::{IntegrityVerificationJob, JobId, VolumeId};

pub use scanner::JobOutcome;
use scanner::Scanner;

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum Command {
    Resume { job_id: JobId, reply: Reply<()> },
    Stop { job_id: JobId, reply: Reply<JobOutcome> },
    ListRunning { reply: Reply<Vec<JobId>> },
    Shutdown { reply: Reply<()> },
}

/// Cloneable handle to the control loop.
#[derive(Clone)]
pub struct IntegrityController {
    commands: mpsc::Sender<Command>,
    meta: Arc<dyn MetaStore>,
}

impl IntegrityController {
    /// Starts the control loop. Cancelling `token` stops every running scan (each saves
    /// its progress) and ends the loop.
    pub fn spawn(
        dac: Arc<DiskAccessController>,
        meta: Arc<dyn MetaStore>,
        config: IntegrityConfig,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let control = ControlLoop {
            dac,
            meta: meta.clone(),
            config,
            token,
            running: HashMap::new(),
            next_run: 0,
            done_tx,
        };
        let handle = tokio::spawn(control.run(rx, done_rx));
        (Self { commands: tx, meta }, handle)
    }

    /// Persists a fresh job for `volume_id`. It does not start scanning until resumed.
    pub async fn create_job(&self, volume_id: VolumeId) -> Result<IntegrityVerificationJob, StoreError> {
        self.meta.query_volume(volume_id).await?;
        let job = IntegrityVerificationJob::new(volume_id);
        self.meta.save_integrity_job(&job).await?;
        debug!(job_id = %job.id, volume_id, "integrity job created");
        Ok(job)
    }

    pub async fn resume(&self, job_id: JobId) -> Result<(), StoreError> {
        self.request(|reply| Command::Resume { job_id, reply }).await
    }

    /// Stops a running scan and waits until it has saved its final progress.
    pub async fn stop(&self, job_id: JobId) -> Result<JobOutcome, StoreError> {
        self.request(|reply| Command::Stop { job_id, reply }).await
    }

    pub async fn list_running_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        self.request(|reply| Command::ListRunning { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| StoreError::ControllerStopped)?;
        rx.await.map_err(|_| StoreError::ControllerStopped)?
    }
}

struct RunningJob {
    run: u64,
    token: CancellationToken,
    handle: JoinHandle<Result<JobOutcome, StoreError>>,
}

struct ControlLoop {
    dac: Arc<DiskAccessController>,
    meta: Arc<dyn MetaStore>,
    config: IntegrityConfig,
    token: CancellationToken,
    running: HashMap<JobId, RunningJob>,
    /// Generation counter; a finished run only evicts its own entry.
    next_run: u64,
    done_tx: mpsc::UnboundedSender<(JobId, u64)>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::UnboundedReceiver<(JobId, u64)>,
    ) {
        info!(meta = self.meta.name(), "integrity controller started");
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                Some((job_id, run)) = done.recv() => self.reap(job_id, run).await,
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            info!("integrity controller stopped");
                            return;
                        }
                    }
                    None => break,
                },
            }
        }
        self.stop_all().await;
        info!("integrity controller stopped");
    }

    /// Returns false once the loop should exit.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Resume { job_id, reply } => {
                let _ = reply.send(self.resume(job_id).await);
            }
            Command::Stop { job_id, reply } => {
                let _ = reply.send(self.stop(job_id).await);
            }
            Command::ListRunning { reply } => {
                let mut ids: Vec<_> = self.running.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(Ok(ids));
            }
            Command::Shutdown { reply } => {
                self.stop_all().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn resume(&mut self, job_id: JobId) -> Result<(), StoreError> {
        if self.running.contains_key(&job_id) {
            return Err(StoreError::JobAlreadyRunning(job_id));
        }

        let job = self.meta.load_integrity_job(&job_id).await?;
        if job.is_completed() {
            return Err(StoreError::JobCompleted(job_id));
        }
        if !self.dac.is_mounted(job.volume_id) {
            return Err(StoreError::not_mounted(job.volume_id));
        }

        self.next_run += 1;
        let run = self.next_run;
        let token = self.token.child_token();
        let scanner = Scanner {
            dac: self.dac.clone(),
            meta: self.meta.clone(),
            config: self.config.clone(),
            token: token.clone(),
        };
        let done_tx = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            let result = scanner.run(job).await;
            let _ = done_tx.send((job_id, run));
            result
        });

        self.running.insert(job_id, RunningJob { run, token, handle });
        debug!(%job_id, run, "integrity job resumed");
        Ok(())
    }

    async fn stop(&mut self, job_id: JobId) -> Result<JobOutcome, StoreError> {
        let entry = self
            .running
            .remove(&job_id)
            .ok_or(StoreError::JobNotRunning(job_id))?;
        entry.token.cancel();
        join_scan(entry.handle).await
    }

    async fn reap(&mut self, job_id: JobId, run: u64) {
        if self.running.get(&job_id).is_none_or(|entry| entry.run != run) {
            return;
        }
        if let Some(entry) = self.running.remove(&job_id) {
            if let Err(e) = join_scan(entry.handle).await {
                warn!(%job_id, "integrity job ended with error: {e}");
            }
        }
    }

    async fn stop_all(&mut self) {
        let entries: Vec<_> = self.running.drain().collect();
        for (_, entry) in &entries {
            entry.token.cancel();
        }
        for (job_id, entry) in entries {
            if let Err(e) = join_scan(entry.handle).await {
                warn!(%job_id, "integrity job ended with error: {e}");
            }
        }
    }
}

async fn join_scan(
    handle: JoinHandle<Result<JobOutcome, StoreError>>,
) -> Result<JobOutcome, StoreError> {
    handle
        .await
        .map_err(|e| StoreError::from(anyhow::Error::from(e)))?
}
