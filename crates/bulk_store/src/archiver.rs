//! Periodic migration of stale terminal requests into the archive.
//!
//! Only the leader sweeps. Leadership is pushed in from outside through
//! [`LeadershipListener`]; the archiver never elects itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::now_millis;
use crate::request_store::RequestStore;
use crate::scheduler::TaskScheduler;

/// Callbacks of an external leader election.
pub trait LeadershipListener: Send + Sync {
    fn is_leader(&self);
    fn not_leader(&self);
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Requests written to the archive
    pub archived: usize,
    /// UIDs that could not be archived and were kept
    pub failed: Vec<String>,
    /// Requests removed from the live tables
    pub deleted: u64,
}

struct ArchiverState {
    store: RequestStore,
    scheduler: TaskScheduler,
    window: Duration,
    period: Duration,
    leader: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Clone is cheap and shares state.
#[derive(Clone)]
pub struct RequestArchiver {
    state: Arc<ArchiverState>,
}

impl RequestArchiver {
    /// Archive terminal requests untouched for `window`, checking every
    /// `period`. Nothing is scheduled until [`reset`](Self::reset).
    pub fn new(store: RequestStore, window: Duration, period: Duration) -> Self {
        let scheduler = store.scheduler().clone();
        Self {
            state: Arc::new(ArchiverState {
                store,
                scheduler,
                window,
                period,
                leader: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn is_leading(&self) -> bool {
        self.state.leader.load(Ordering::SeqCst)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.state.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)schedule the periodic sweep, first run one period from now.
    pub fn reset(&self) {
        let archiver = self.clone();
        let handle = self.state.scheduler.schedule_with_fixed_delay(
            self.state.period,
            self.state.period,
            move || {
                let archiver = archiver.clone();
                async move {
                    if let Err(e) = archiver.run().await {
                        error!(error = %e, "Archiver sweep failed");
                    }
                }
            },
        );

        if let Some(previous) = self.task().replace(handle) {
            previous.abort();
        }
        info!(
            window_secs = self.state.window.as_secs(),
            period_secs = self.state.period.as_secs(),
            "Archiver scheduled"
        );
    }

    /// Sweep now if leader; `None` otherwise.
    pub async fn run_now(&self) -> Result<Option<SweepReport>> {
        if !self.is_leading() {
            debug!("Not leader, ignoring archiver run request");
            return Ok(None);
        }
        self.sweep().await.map(Some)
    }

    /// Scheduled entry point; does nothing unless leader.
    pub async fn run(&self) -> Result<SweepReport> {
        if !self.is_leading() {
            debug!("Not leader, skipping scheduled sweep");
            return Ok(SweepReport::default());
        }
        self.sweep().await
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let store = &self.state.store;
        let window = i64::try_from(self.state.window.as_millis()).unwrap_or(i64::MAX);
        let threshold = now_millis().saturating_sub(window);

        let uids = store.archivable_uids(threshold).await?;
        debug!(candidates = uids.len(), threshold, "Archiver sweep started");

        let mut report = SweepReport::default();
        let mut archived = Vec::with_capacity(uids.len());
        for uid in uids {
            let request = match store.fetch(&uid).await {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Could not load request for archiving");
                    report.failed.push(uid);
                    continue;
                }
            };

            match store.archive_request(&request).await {
                Ok(()) => archived.push(uid),
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Could not archive request");
                    report.failed.push(uid);
                }
            }
        }

        report.archived = archived.len();
        report.deleted = store.delete_archived(&archived, threshold).await?;
        info!(
            archived = report.archived,
            failed = report.failed.len(),
            deleted = report.deleted,
            "Archiver sweep finished"
        );
        Ok(report)
    }

    /// Cancel the scheduled sweep.
    pub fn shutdown(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
            info!("Archiver stopped");
        }
    }
}

impl LeadershipListener for RequestArchiver {
    fn is_leader(&self) {
        self.state.leader.store(true, Ordering::SeqCst);
        info!("Archiver is leader");
    }

    fn not_leader(&self) {
        self.state.leader.store(false, Ordering::SeqCst);
        info!("Archiver is no longer leader");
    }
}
