//! Liveness signal for a running job.
//!
//! While a stage executes, a background task writes `last_heartbeat_at` every
//! `interval`, independent of checkpoint writes. The task stops when the guard
//! is stopped or dropped, and on its own once the store reports that the
//! owner token no longer holds the job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use docpipe_core::{JobId, OwnerToken};

use crate::jobs::JobStore;

/// Starts heartbeat tasks against a job store.
#[derive(Clone)]
pub struct HeartbeatEmitter {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begin emitting for `job_id` under `owner`. The first beat fires one
    /// interval from now; the claim itself already stamped liveness.
    pub fn start(&self, job_id: JobId, owner: OwnerToken) -> HeartbeatGuard {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));
        let beats = Arc::new(AtomicU64::new(0));

        let store = self.store.clone();
        let interval = self.interval;
        let task_lost = lost.clone();
        let task_beats = beats.clone();

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match store.heartbeat(job_id, owner, Utc::now()).await {
                            Ok(true) => {
                                task_beats.fetch_add(1, Ordering::Relaxed);
                                debug!(job_id = %job_id, "heartbeat");
                            }
                            Ok(false) => {
                                warn!(job_id = %job_id, owner = %owner, "heartbeat rejected; ownership lost");
                                task_lost.store(true, Ordering::Relaxed);
                                break;
                            }
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "heartbeat write failed");
                            }
                        }
                    }
                }
            }
        });

        HeartbeatGuard {
            stop: Some(stop_tx),
            task: Some(task),
            lost,
            beats,
        }
    }
}

/// Handle to one heartbeat task.
#[derive(Debug)]
pub struct HeartbeatGuard {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
}

/// What happened while the guard was alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub beats: u64,
    pub ownership_lost: bool,
}

impl HeartbeatGuard {
    pub fn ownership_lost(&self) -> bool {
        self.lost.load(Ordering::Relaxed)
    }

    /// Stop emitting and wait for the task to finish.
    pub async fn stop(mut self) -> HeartbeatReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        HeartbeatReport {
            beats: self.beats.load(Ordering::Relaxed),
            ownership_lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ClaimOutcome, InMemoryJobStore, Job, JobKind};

    async fn running_job(store: &Arc<InMemoryJobStore>) -> (JobId, OwnerToken) {
        let job = store
            .insert(Job::new(JobKind::DocumentProcessing, "doc"))
            .await
            .unwrap();
        let owner = OwnerToken::new();
        let now = Utc::now();
        let outcome = store.claim(job.id, owner, now, now).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        (job.id, owner)
    }

    #[tokio::test]
    async fn emits_while_running_and_stops_cleanly() {
        let store = InMemoryJobStore::arc();
        let (job_id, owner) = running_job(&store).await;
        let before = store.get(job_id).await.unwrap().unwrap();

        let emitter = HeartbeatEmitter::new(store.clone(), Duration::from_millis(10));
        let guard = emitter.start(job_id, owner);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = guard.stop().await;

        assert!(report.beats >= 2);
        assert!(!report.ownership_lost);
        let after = store.get(job_id).await.unwrap().unwrap();
        assert!(after.last_heartbeat_at > before.last_heartbeat_at);
        assert_eq!(after.updated_at, before.updated_at);

        // Stopped: no further beats.
        let settled = store.get(job_id).await.unwrap().unwrap().last_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            store.get(job_id).await.unwrap().unwrap().last_heartbeat_at,
            settled
        );
    }

    #[tokio::test]
    async fn detects_lost_ownership() {
        let store = InMemoryJobStore::arc();
        let (job_id, _owner) = running_job(&store).await;

        let emitter = HeartbeatEmitter::new(store.clone(), Duration::from_millis(5));
        let guard = emitter.start(job_id, OwnerToken::new());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(guard.ownership_lost());
        let report = guard.stop().await;
        assert_eq!(report.beats, 0);
        assert!(report.ownership_lost);
    }
}
