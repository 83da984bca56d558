//! Ordered step execution with cooperative cancellation.
//!
//! A [`Pipeline`] runs its steps one after another against a shared
//! [`BuildState`]. Only [`StepAction::Continue`] advances; any halt ends the
//! loop, after which the cleanup hooks of every step that ran are invoked in
//! reverse order. [`Pipeline::cancel`] may be called from another task while
//! a step is in flight: it trips the run's cancellation token and forwards
//! [`Step::cancel`] to the current step, which is expected to halt on its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod state;

pub use state::{BuildOutcome, BuildState, SshKeyMaterial, StepError};

/// Result of running a single step.
#[derive(Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop without recording an error.
    Halt,
    /// Stop and record the error in the state bag.
    HaltWithError(StepError),
}

/// Future returned by [`Step::run`].
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepAction> + Send + 'a>>;

/// Future returned by [`Step::cleanup`].
pub type CleanupFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// One provisioning action of a build.
pub trait Step: std::fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Performs the step's action.
    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a>;

    /// Called from another task when the build is cancelled while this step
    /// runs. Must not block.
    fn cancel(&self) {}

    /// Releases what [`Step::run`] created. Runs after the loop ends, in
    /// reverse order, for every step whose `run` was invoked. Failures are
    /// reported, never returned.
    fn cleanup<'a>(&'a self, _state: &'a mut BuildState) -> CleanupFuture<'a> {
        Box::pin(async {})
    }
}

/// How a finished run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Every step continued.
    Completed,
    /// A step halted without an error.
    Halted,
    /// A step halted with an error.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

/// Observable lifecycle of a pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineStatus {
    /// Not yet run.
    Idle,
    /// Executing steps.
    Running,
    /// Cancellation requested; the current step is winding down.
    Cancelling,
    /// Finished, including cleanup.
    Done(Termination),
}

/// Runs an ordered list of steps.
pub struct Pipeline {
    steps: Vec<Arc<dyn Step>>,
    cancellation: CancellationToken,
    current: Mutex<Option<Arc<dyn Step>>>,
    status: Mutex<PipelineStatus>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Pipeline")
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline observing `cancellation`.
    #[must_use]
    pub const fn new(steps: Vec<Arc<dyn Step>>, cancellation: CancellationToken) -> Self {
        Self {
            steps,
            cancellation,
            current: Mutex::new(None),
            status: Mutex::new(PipelineStatus::Idle),
        }
    }

    /// Returns the current lifecycle status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        *lock(&self.status)
    }

    /// Returns the token tripped by [`Pipeline::cancel`].
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Runs every step in order until one halts, then cleans up.
    pub async fn run(&self, state: &mut BuildState) -> Termination {
        {
            let mut status = lock(&self.status);
            if *status == PipelineStatus::Idle {
                *status = PipelineStatus::Running;
            }
        }

        let mut executed: Vec<Arc<dyn Step>> = Vec::with_capacity(self.steps.len());
        let mut termination = Termination::Completed;

        for step in &self.steps {
            if self.cancellation.is_cancelled() {
                info!(step = step.name(), "build cancelled before step started");
                termination = Termination::Cancelled;
                break;
            }

            *lock(&self.current) = Some(Arc::clone(step));
            executed.push(Arc::clone(step));
            debug!(step = step.name(), "step started");
            let action = step.run(state).await;
            *lock(&self.current) = None;

            match action {
                StepAction::Continue => debug!(step = step.name(), "step finished"),
                StepAction::Halt => {
                    termination = if self.cancellation.is_cancelled() {
                        Termination::Cancelled
                    } else {
                        Termination::Halted
                    };
                    warn!(step = step.name(), ?termination, "step halted");
                    break;
                }
                StepAction::HaltWithError(err) => {
                    error!(step = step.name(), error = %err, "step failed");
                    state.record_error(err);
                    termination = Termination::Failed;
                    break;
                }
            }
        }

        for step in executed.iter().rev() {
            debug!(step = step.name(), "cleaning up");
            step.cleanup(state).await;
        }

        *lock(&self.status) = PipelineStatus::Done(termination);
        termination
    }

    /// Requests cancellation and forwards it to the step in flight.
    pub fn cancel(&self) {
        self.cancellation.cancel();
        {
            let mut status = lock(&self.status);
            if matches!(*status, PipelineStatus::Idle | PipelineStatus::Running) {
                *status = PipelineStatus::Cancelling;
            }
        }

        let current = lock(&self.current).clone();
        if let Some(step) = current {
            info!(step = step.name(), "cancelling step");
            step.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
