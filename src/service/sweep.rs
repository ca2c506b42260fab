use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::storage::{CancellationLedger, IdentityStore, Store};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub marks_processed: usize,
    pub marks_failed: usize,
    pub people_removed: usize,
    pub orphans_removed: u64,
}

/// Purges whatever cancelled enrollment sessions left in the identity store.
///
/// Every mark is handled on its own: a failure is logged, the mark stays in
/// the ledger for the next run, and the remaining marks are still processed.
/// Running the sweep again over the same state is harmless.
#[derive(Clone)]
pub struct Reconciler {
    identity: IdentityStore,
    ledger: CancellationLedger,
}

impl Reconciler {
    pub fn new(store: &Store) -> Self {
        Self {
            identity: store.identity(),
            ledger: store.ledger(),
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let marks = self.ledger.list_all_marks().await?;
        let mut report = SweepReport::default();

        if marks.is_empty() {
            debug!("no cancelled registrations to clean up");
        } else {
            info!(count = marks.len(), "cleaning up cancelled registrations");
        }

        for session_id in &marks {
            match self.purge_session(session_id).await {
                Ok(people_removed) => {
                    report.marks_processed += 1;
                    report.people_removed += people_removed;
                    debug!(session_id = %session_id, people_removed, "cancelled registration purged");
                }
                Err(e) => {
                    report.marks_failed += 1;
                    error!(session_id = %session_id, error = %e, "failed to purge cancelled registration");
                }
            }
        }

        match self.identity.delete_orphaned_embeddings().await {
            Ok(0) => {}
            Ok(n) => {
                report.orphans_removed = n;
                info!(count = n, "deleted orphaned embeddings");
            }
            Err(e) => warn!(error = %e, "orphaned embedding cleanup failed"),
        }

        info!(
            processed = report.marks_processed,
            failed = report.marks_failed,
            people_removed = report.people_removed,
            orphans_removed = report.orphans_removed,
            "sweep finished"
        );
        Ok(report)
    }

    async fn purge_session(&self, session_id: &str) -> Result<usize> {
        let affected = self.identity.delete_embeddings_for_session(session_id).await?;

        let mut removed = 0;
        for person_id in &affected {
            if self.identity.delete_person_if_empty(person_id).await? {
                info!(person_id = %person_id, "deleted person with no remaining embeddings");
                removed += 1;
            }
        }

        self.ledger.clear(session_id).await?;
        Ok(removed)
    }

    /// Runs the sweep every `interval` until the returned task is aborted.
    /// A zero interval disables the timer.
    pub fn spawn_periodic(self, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "sweep failed");
                }
            }
        }))
    }
}
