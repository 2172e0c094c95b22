//! Dataset workflows
//!
//! A [`WorkflowRequest`] is turned into an ordered step [`plan`] and driven
//! by the [`WorkflowEngine`] on its own task. The caller gets a
//! [`WorkflowHandle`] carrying an ordered [`WorkflowEvent`] stream and a
//! cancel switch. Runs that mutate shared state hold the dataset lock from
//! the `AcquireLock` step until the finalizer releases it, which always
//! happens before the terminal `Finished` event.
//!
//! The [`WorkflowSupervisor`] sits in front of the engine in long-lived hosts:
//! one active run per dataset, and a bounded shutdown that cancels and waits.

pub mod engine;
pub mod event;
pub mod plan;
pub mod request;
pub mod state;
pub mod supervisor;

pub use engine::{EngineSettings, RunOutcome, WorkflowEngine, WorkflowHandle};
pub use event::{EventReceiver, EventSink, FinishGuard, WorkflowEvent};
pub use plan::{plan, Step};
pub use request::WorkflowRequest;
pub use state::{validate_transition, TransitionError, WorkflowKind, WorkflowRun, WorkflowState};
pub use supervisor::{ActiveRun, ShutdownReport, SupervisorError, WorkflowSupervisor};
