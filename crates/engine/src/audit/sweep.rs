//! Background balance audit sweep.
//!
//! Verifies every party's cached balance against entry history as an
//! asynchronous task, with progress reporting and cancellation. A sweep
//! never blocks new postings: each party is checked under its own lock for
//! the instant of its consistent read, and the task yields between parties.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use thiserror::Error;
use tokio::sync::RwLock;

use khata_core::PartyId;
use khata_parties::Party;

use crate::balances::BalanceSnapshot;
use crate::entry_store::EntryStore;
use crate::read_model::KvStore;

use super::{ReconciliationService, VerifyReport};

/// Error type for sweep operations.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep cancelled")]
    Cancelled,

    #[error("verification failed: {0}")]
    Verify(String),
}

/// Progress information for a running sweep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepProgress {
    /// Total number of parties to verify.
    pub total_parties: u64,
    /// Number of parties verified so far.
    pub verified_parties: u64,
    /// Number of parties found drifted so far.
    pub drifted_parties: u64,
    /// Current phase of the sweep.
    pub phase: SweepPhase,
    /// Whether the sweep is complete.
    pub is_complete: bool,
    /// Optional error message if the sweep failed.
    pub error: Option<String>,
}

/// Phase of a sweep operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    /// Verifying parties one by one.
    Verifying,
    /// Completed successfully.
    Complete,
    /// Failed or cancelled.
    Failed,
}

/// Handle for monitoring and controlling a sweep.
#[derive(Clone)]
pub struct SweepHandle {
    progress: Arc<RwLock<SweepProgress>>,
    drifts: Arc<RwLock<Vec<VerifyReport>>>,
    cancellation: Arc<AtomicBool>,
}

impl SweepHandle {
    /// Get current progress.
    pub async fn progress(&self) -> SweepProgress {
        self.progress.read().await.clone()
    }

    /// Drift reports collected so far.
    pub async fn drifts(&self) -> Vec<VerifyReport> {
        self.drifts.read().await.clone()
    }

    /// Cancel the sweep.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    /// Check if the sweep was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    /// Wait for the sweep to complete.
    pub async fn wait_for_completion(&self) -> Result<SweepProgress, SweepError> {
        loop {
            let progress = self.progress.read().await.clone();
            if progress.is_complete || progress.phase == SweepPhase::Failed {
                if let Some(ref error) = progress.error {
                    return Err(SweepError::Verify(error.clone()));
                }
                if progress.phase == SweepPhase::Failed && progress.error.is_none() {
                    return Err(SweepError::Cancelled);
                }
                return Ok(progress);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    }
}

/// Start a background sweep over the given parties.
///
/// Must be called from within a tokio runtime. The returned handle reports
/// progress and collects a [`VerifyReport`] for every drifted party.
pub fn spawn_sweep<E, P, B>(
    audit: Arc<ReconciliationService<E, P, B>>,
    parties: Vec<PartyId>,
) -> SweepHandle
where
    E: EntryStore + 'static,
    P: KvStore<PartyId, Party> + 'static,
    B: KvStore<PartyId, BalanceSnapshot> + 'static,
{
    let progress = Arc::new(RwLock::new(SweepProgress {
        total_parties: parties.len() as u64,
        verified_parties: 0,
        drifted_parties: 0,
        phase: SweepPhase::Verifying,
        is_complete: false,
        error: None,
    }));
    let drifts = Arc::new(RwLock::new(Vec::new()));
    let cancellation = Arc::new(AtomicBool::new(false));

    let handle = SweepHandle {
        progress: progress.clone(),
        drifts: drifts.clone(),
        cancellation: cancellation.clone(),
    };

    tokio::spawn(async move {
        let mut verified = 0u64;
        let mut drifted = 0u64;

        for party_id in parties {
            if cancellation.load(Ordering::Relaxed) {
                let mut prog = progress.write().await;
                prog.phase = SweepPhase::Failed;
                prog.is_complete = true;
                return;
            }

            // Each verify takes the party lock only for its consistent read.
            match audit.verify(party_id) {
                Ok(report) => {
                    verified += 1;
                    if !report.ok {
                        drifted += 1;
                        drifts.write().await.push(report);
                    }
                }
                Err(e) => {
                    let mut prog = progress.write().await;
                    prog.phase = SweepPhase::Failed;
                    prog.error = Some(e.to_string());
                    prog.is_complete = true;
                    return;
                }
            }

            {
                let mut prog = progress.write().await;
                prog.verified_parties = verified;
                prog.drifted_parties = drifted;
            }

            // Let postings and other tasks in between parties.
            tokio::task::yield_now().await;
        }

        let mut prog = progress.write().await;
        prog.verified_parties = verified;
        prog.drifted_parties = drifted;
        prog.phase = SweepPhase::Complete;
        prog.is_complete = true;
    });

    handle
}
