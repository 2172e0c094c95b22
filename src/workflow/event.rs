//! Events a run emits to its caller
//!
//! Each run owns one ordered channel. Progress fractions never move
//! backwards, and exactly one `Finished` event is delivered; nothing is sent
//! after it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::plan::Step;
use super::state::WorkflowState;
use crate::error::{ErrorKind, WorkflowError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Progress {
        step: Step,
        /// Overall run completion in `0.0..=1.0`
        fraction: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        error: WorkflowError,
    },
    Finished {
        state: WorkflowState,
        summary: String,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<WorkflowEvent>;

struct SinkState {
    last_fraction: Mutex<f64>,
    finished: AtomicBool,
}

/// Sending half of a run's event channel
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
    state: Arc<SinkState>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            state: Arc::new(SinkState {
                last_fraction: Mutex::new(0.0),
                finished: AtomicBool::new(false),
            }),
        };
        (sink, rx)
    }

    fn send(&self, event: WorkflowEvent) {
        // A caller that stopped listening does not stop the run
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, step: Step, fraction: f64, detail: Option<String>) {
        if self.is_finished() {
            return;
        }
        let fraction = {
            let mut last = self
                .state
                .last_fraction
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *last = fraction.clamp(0.0, 1.0).max(*last);
            *last
        };
        self.send(WorkflowEvent::Progress {
            step,
            fraction,
            detail,
        });
    }

    pub fn error(&self, error: &WorkflowError) {
        if !self.is_finished() {
            self.send(WorkflowEvent::Error {
                error: error.clone(),
            });
        }
    }

    /// Deliver the terminal event. Returns false if one was already sent.
    pub fn finish(&self, state: WorkflowState, summary: &str) -> bool {
        if self.state.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(WorkflowEvent::Finished {
            state,
            summary: summary.to_string(),
        });
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Guard that reports the run as failed if it is dropped before a
    /// terminal event was sent, e.g. when the run task is aborted.
    pub fn finish_on_drop(&self) -> FinishGuard {
        FinishGuard { sink: self.clone() }
    }
}

pub struct FinishGuard {
    sink: EventSink,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.sink.is_finished() {
            return;
        }
        let error = WorkflowError::new(
            ErrorKind::FatalBackend,
            "Run aborted before reaching a terminal state",
        );
        self.sink.error(&error);
        self.sink.finish(WorkflowState::Failed, &error.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut EventReceiver) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (sink, mut rx) = EventSink::channel();
        sink.progress(Step::PullData, 0.4, None);
        sink.progress(Step::PullData, 0.2, None);
        sink.progress(Step::CheckoutData, 1.5, None);

        let fractions: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::Progress { fraction, .. } => Some(fraction),
                _ => None,
            })
            .collect();
        assert_eq!(fractions, vec![0.4, 0.4, 1.0]);
    }

    #[test]
    fn test_finished_delivered_once_and_last() {
        let (sink, mut rx) = EventSink::channel();
        let clone = sink.clone();
        assert!(sink.finish(WorkflowState::Completed, "done"));
        assert!(!clone.finish(WorkflowState::Failed, "late"));
        clone.progress(Step::Commit, 0.9, None);
        clone.error(&WorkflowError::io("late"));

        assert_eq!(
            drain(&mut rx),
            vec![WorkflowEvent::Finished {
                state: WorkflowState::Completed,
                summary: "done".to_string()
            }]
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = WorkflowEvent::Progress {
            step: Step::PushData,
            fraction: 0.5,
            detail: None,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"progress","step":"push_data","fraction":0.5}"#
        );
    }

    #[test]
    fn test_finish_guard_reports_abandoned_run() {
        let (sink, mut rx) = EventSink::channel();
        sink.progress(Step::PushData, 0.5, None);
        drop(sink.finish_on_drop());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], WorkflowEvent::Error { error } if error.kind == ErrorKind::FatalBackend));
        assert_eq!(
            events[2],
            WorkflowEvent::Finished {
                state: WorkflowState::Failed,
                summary: "Run aborted before reaching a terminal state".to_string()
            }
        );
    }

    #[test]
    fn test_finish_guard_silent_after_finish() {
        let (sink, mut rx) = EventSink::channel();
        let guard = sink.finish_on_drop();
        sink.finish(WorkflowState::Completed, "done");
        drop(guard);

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.progress(Step::PullMetadata, 0.1, None);
        assert!(sink.finish(WorkflowState::Cancelled, "Cancelled by user."));
    }
}
