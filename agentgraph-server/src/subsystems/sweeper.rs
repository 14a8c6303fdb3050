//! Lifecycle sweeper: background reconciliation of sessions, cached objects
//! and session directories.
//!
//! Cycle, every `sweeper.interval_minutes`:
//! 1. Scan: sessions whose record expired in the store
//! 2. Reconcile: evict cached objects, remove the directory, drop the record,
//!    each session under its own timeout
//! 3. Orphans: directories and object tables with no live record
//! 4. Report
//!
//! A failed reconciliation is logged and picked up again next cycle. The
//! sweeper never renews a session; it only reads records with `peek`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use agentgraph_core::config::SweeperConfig;
use agentgraph_core::{
    AgentGraphError, AgentGraphResult, ObjectRegistry, SessionDirectoryAllocator, SessionId,
    SessionRegistry,
};

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions_reclaimed: usize,
    pub directories_removed: usize,
    pub entries_evicted: usize,
    pub bytes_freed: u64,
    pub failures: usize,
    pub elapsed_ms: u64,
}

/// What reclaiming one session released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reclaimed {
    pub entries_evicted: usize,
    pub directory_removed: bool,
    pub bytes_freed: u64,
}

impl SweepReport {
    fn absorb(&mut self, reclaimed: &Reclaimed) {
        self.entries_evicted += reclaimed.entries_evicted;
        self.bytes_freed += reclaimed.bytes_freed;
        if reclaimed.directory_removed {
            self.directories_removed += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.sessions_reclaimed == 0
            && self.directories_removed == 0
            && self.entries_evicted == 0
            && self.failures == 0
    }
}

pub struct LifecycleSweeper {
    sessions: Arc<SessionRegistry>,
    objects: Arc<ObjectRegistry>,
    directories: SessionDirectoryAllocator,
    reconcile_timeout: Duration,
    /// Serializes cycles so a manual sweep never overlaps the periodic one.
    cycle: Mutex<()>,
}

impl LifecycleSweeper {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        objects: Arc<ObjectRegistry>,
        directories: SessionDirectoryAllocator,
        config: &SweeperConfig,
    ) -> Self {
        Self {
            sessions,
            objects,
            directories,
            reconcile_timeout: config.reconcile_timeout(),
            cycle: Mutex::new(()),
        }
    }

    /// Run one full sweep cycle.
    pub async fn run_sweep_cycle(&self) -> SweepReport {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let mut report = SweepReport::default();

        // 1 + 2. expired sessions
        for session_id in self.sessions.list_expired().await {
            match self.reconcile(session_id).await {
                Ok(reclaimed) => {
                    report.sessions_reclaimed += 1;
                    report.absorb(&reclaimed);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(session_id = %session_id, error = %e, "Reconciliation failed, retrying next cycle");
                }
            }
        }

        // 3. orphans
        self.sweep_orphan_directories(&mut report).await;
        self.sweep_orphan_tables(&mut report).await;

        match self.sessions.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Expired store records purged"),
            Err(e) => tracing::warn!(error = %e, "Store purge failed (non-fatal)"),
        }

        // 4. report
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.is_empty() {
            tracing::debug!(elapsed_ms = report.elapsed_ms, "Sweep cycle found nothing to reclaim");
        } else {
            tracing::info!(
                sessions_reclaimed = report.sessions_reclaimed,
                directories_removed = report.directories_removed,
                entries_evicted = report.entries_evicted,
                bytes_freed = report.bytes_freed,
                failures = report.failures,
                elapsed_ms = report.elapsed_ms,
                "Sweep cycle complete"
            );
        }
        report
    }

    /// Reclaim one session on demand, live or not: cached objects, directory
    /// and record.
    pub async fn reclaim_session(&self, session_id: SessionId) -> AgentGraphResult<Reclaimed> {
        let reclaimed = self.reconcile(session_id).await?;
        tracing::info!(
            session_id = %session_id,
            entries_evicted = reclaimed.entries_evicted,
            bytes_freed = reclaimed.bytes_freed,
            "Session reclaimed"
        );
        Ok(reclaimed)
    }

    /// Evict, remove, destroy, in that order, bounded by the reconcile
    /// timeout. Each step is idempotent, so a partial run is finished by the
    /// next attempt.
    ///
    /// A timeout is reported against the step that stalled: the directory as
    /// `StorageUnavailable`, the record as `StoreUnavailable`.
    async fn reconcile(&self, session_id: SessionId) -> AgentGraphResult<Reclaimed> {
        let root = self.directories.layout(session_id).root;
        let destroying = AtomicBool::new(false);

        let work = async {
            let entries_evicted = self.objects.evict_session(session_id);

            let existed = tokio::fs::try_exists(&root).await.unwrap_or(false);
            let bytes_freed = self.directories.remove(session_id).await?;

            destroying.store(true, Ordering::Release);
            self.sessions.destroy_session(session_id).await?;
            Ok::<_, AgentGraphError>(Reclaimed {
                entries_evicted,
                directory_removed: existed,
                bytes_freed,
            })
        };

        match tokio::time::timeout(self.reconcile_timeout, work).await {
            Ok(result) => result,
            Err(_) if destroying.load(Ordering::Acquire) => Err(AgentGraphError::StoreUnavailable(format!(
                "destroying the record of {session_id} exceeded {}s",
                self.reconcile_timeout.as_secs()
            ))),
            Err(_) => Err(AgentGraphError::storage(
                &root,
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("removing the directory exceeded {}s", self.reconcile_timeout.as_secs()),
                ),
            )),
        }
    }

    /// Whether the store still holds a record for `session_id`. `None` when
    /// the store could not answer.
    async fn is_live(&self, session_id: SessionId) -> Option<bool> {
        match self.sessions.peek(session_id).await {
            Ok(record) => Some(record.is_some()),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Liveness check failed");
                None
            }
        }
    }

    async fn sweep_orphan_directories(&self, report: &mut SweepReport) {
        let dirs = match self.directories.list_session_dirs().await {
            Ok(dirs) => dirs,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "Listing session directories failed");
                return;
            }
        };

        for session_id in dirs {
            match self.is_live(session_id).await {
                Some(false) => {}
                Some(true) => continue,
                None => {
                    report.failures += 1;
                    continue;
                }
            }
            match self.reconcile(session_id).await {
                Ok(reclaimed) => {
                    tracing::info!(session_id = %session_id, bytes = reclaimed.bytes_freed, "Orphan session directory removed");
                    report.absorb(&reclaimed);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(session_id = %session_id, error = %e, "Orphan directory removal failed");
                }
            }
        }
    }

    async fn sweep_orphan_tables(&self, report: &mut SweepReport) {
        for session_id in self.objects.sessions() {
            match self.is_live(session_id).await {
                Some(false) => {
                    let evicted = self.objects.evict_session(session_id);
                    report.entries_evicted += evicted;
                }
                Some(true) => {}
                None => report.failures += 1,
            }
        }
    }
}

/// Called from main.rs to start the periodic sweep loop.
pub async fn run_sweep_loop(
    sweeper: Arc<LifecycleSweeper>,
    config: SweeperConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick fires immediately; startup is not a sweep
    ticker.tick().await;

    tracing::info!(interval_minutes = config.interval_minutes, "Sweep loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweeper.run_sweep_cycle().await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Sweep loop shutting down");
                break;
            }
        }
    }
}
