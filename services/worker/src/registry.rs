//! Lifecycle records for container-backed workloads.
//!
//! Each record follows the [`WorkloadState`] machine. Terminal states are
//! entered at most once, so when the exit-wait and the timeout race, only
//! the first reported outcome sticks.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_id::WorkloadId;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::workload::{WorkloadState, WorkloadType};

/// Point-in-time view of a workload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub workload_id: WorkloadId,
    pub workload_type: WorkloadType,
    pub state: WorkloadState,
    pub image: Option<String>,
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Record {
    status: WorkloadStatus,
    state_tx: watch::Sender<WorkloadState>,
}

/// Extra facts recorded alongside a transition.
#[derive(Debug, Default)]
pub struct TransitionDetail {
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

/// All workloads this process has started, keyed by id.
#[derive(Default)]
pub struct WorkloadRegistry {
    records: Mutex<HashMap<WorkloadId, Record>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workload in `Pending`.
    pub fn insert(&self, workload_id: WorkloadId, workload_type: WorkloadType, image: Option<String>) {
        let (state_tx, _) = watch::channel(WorkloadState::Pending);
        let record = Record {
            status: WorkloadStatus {
                workload_id,
                workload_type,
                state: WorkloadState::Pending,
                image,
                container_id: None,
                exit_code: None,
                error_message: None,
                created_at: Utc::now(),
                finished_at: None,
            },
            state_tx,
        };
        self.records().insert(workload_id, record);
    }

    /// Moves a workload to `next` if that transition is legal.
    ///
    /// Returns `false` (and changes nothing) for unknown workloads, illegal
    /// transitions and workloads that already reached a terminal state.
    pub fn transition(&self, workload_id: &WorkloadId, next: WorkloadState) -> bool {
        self.transition_with(workload_id, next, TransitionDetail::default())
    }

    pub fn transition_with(
        &self,
        workload_id: &WorkloadId,
        next: WorkloadState,
        detail: TransitionDetail,
    ) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(workload_id) else {
            warn!(workload_id = %workload_id, state = %next, "Transition for unknown workload");
            return false;
        };

        let current = record.status.state;
        if !current.can_transition_to(next) {
            debug!(
                workload_id = %workload_id,
                from = %current,
                to = %next,
                "Ignoring transition"
            );
            return false;
        }

        let status = &mut record.status;
        status.state = next;
        if detail.container_id.is_some() {
            status.container_id = detail.container_id;
        }
        if detail.exit_code.is_some() {
            status.exit_code = detail.exit_code;
        }
        if detail.error_message.is_some() {
            status.error_message = detail.error_message;
        }
        if next.is_terminal() {
            status.finished_at = Some(Utc::now());
        }
        record.state_tx.send_replace(next);

        debug!(workload_id = %workload_id, from = %current, to = %next, "Workload transitioned");
        true
    }

    /// Records an error on a workload that is still active, without moving
    /// it. Returns `false` for unknown or finished workloads.
    pub fn annotate(&self, workload_id: &WorkloadId, error_message: String) -> bool {
        match self.records().get_mut(workload_id) {
            Some(record) if !record.status.state.is_terminal() => {
                record.status.error_message = Some(error_message);
                true
            }
            _ => false,
        }
    }

    /// Drops a finished workload's record and returns its final status.
    /// Active workloads are left in place and yield `None`.
    pub fn remove(&self, workload_id: &WorkloadId) -> Option<WorkloadStatus> {
        let mut records = self.records();
        if !records.get(workload_id)?.status.state.is_terminal() {
            return None;
        }
        records.remove(workload_id).map(|r| r.status)
    }

    /// Drops every record that finished at least `retention` ago. Returns
    /// how many were dropped.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| {
            let Some(finished_at) = record.status.finished_at else {
                return true;
            };
            (now - finished_at)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true)
        });
        let pruned = before - records.len();
        if pruned > 0 {
            debug!(pruned, remaining = records.len(), "Pruned finished workloads");
        }
        pruned
    }

    pub fn status(&self, workload_id: &WorkloadId) -> Option<WorkloadStatus> {
        self.records().get(workload_id).map(|r| r.status.clone())
    }

    /// Resolves with the terminal state once the workload reaches one.
    /// Returns `None` for unknown workloads.
    pub async fn wait_terminal(&self, workload_id: &WorkloadId) -> Option<WorkloadState> {
        let mut rx = self.records().get(workload_id)?.state_tx.subscribe();
        let state = *rx.wait_for(WorkloadState::is_terminal).await.ok()?;
        Some(state)
    }

    /// Number of workloads not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.records()
            .values()
            .filter(|r| !r.status.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<WorkloadId, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
