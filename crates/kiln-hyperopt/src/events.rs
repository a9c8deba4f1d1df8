//! Search lifecycle notifications.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::results::Termination;
use crate::space::Assignment;
use crate::trial::TrialStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    SearchStarted {
        experiment: String,
        sampler: String,
        backend: String,
    },
    TrialLaunched {
        trial_id: Uuid,
        trial_number: usize,
        parameters: Assignment,
    },
    TrialFinished {
        trial_id: Uuid,
        trial_number: usize,
        status: TrialStatus,
        metric: Option<f64>,
    },
    SearchFinished {
        total_trials: usize,
        termination: Termination,
    },
}

/// Sending half of the event channel held by the executor.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<SearchEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<SearchEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with an unbounded receiver.
    pub fn unbounded() -> (Self, Receiver<SearchEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: SearchEvent) {
        tracing::trace!(?event, "Search event");
        // Best-effort send; a dropped or full receiver never blocks the search.
        let _ = self.tx.try_send(event);
    }
}
