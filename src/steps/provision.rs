//! Runs provisioning hooks over the SSH session.

use crate::hook::HookEvent;
use crate::pipeline::{BuildState, Step, StepAction, StepError, StepFuture};

use super::conclude;

/// Fires [`HookEvent::Provision`]; halts quietly when the run is cancelled.
#[derive(Clone, Copy, Debug, Default)]
pub struct Provision;

impl Provision {
    async fn execute(state: &BuildState) -> Result<StepAction, StepError> {
        let session = state.session()?;
        tokio::select! {
            () = state.cancellation().cancelled() => Ok(StepAction::Halt),
            result = state.hook().run(HookEvent::Provision, state.ui(), session) => {
                result?;
                Ok(StepAction::Continue)
            }
        }
    }
}

impl Step for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = Self::execute(state).await;
            conclude(state, result)
        })
    }
}
