//! Instance creation and readiness.

use std::time::Duration;

use tracing::{info, warn};

use crate::pipeline::{BuildState, CleanupFuture, Step, StepAction, StepError, StepFuture};
use crate::provider::{InstanceNetworking, InstanceRequest, InstanceStatus};

use super::{conclude, poll_instance, provider_error};

/// Orders the build instance. Cleanup cancels it.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateInstance;

impl CreateInstance {
    async fn execute(state: &mut BuildState) -> Result<StepAction, StepError> {
        let key_ids = state.ssh_key()?.provider_key_ids();
        let request = InstanceRequest::from_config(state.config(), key_ids);

        state.ui().say("Creating instance...");
        let handle = state
            .client()
            .create_instance(&request)
            .await
            .map_err(provider_error("create instance"))?;
        info!(instance_id = handle.id, datacenter = %handle.datacenter, "instance created");
        state
            .ui()
            .message(&format!("Created instance '{}'", handle.id));

        state.set_instance(handle)?;
        Ok(StepAction::Continue)
    }
}

impl Step for CreateInstance {
    fn name(&self) -> &'static str {
        "create instance"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = Self::execute(state).await;
            conclude(state, result)
        })
    }

    fn cleanup<'a>(&'a self, state: &'a mut BuildState) -> CleanupFuture<'a> {
        Box::pin(async move {
            let Some(handle) = state.recorded_instance() else {
                return;
            };

            state.ui().say("Destroying instance...");
            if let Err(err) = state.client().delete_instance(handle).await {
                warn!(instance_id = handle.id, error = %err, "failed to destroy instance");
                state.ui().error(&format!(
                    "Error destroying instance {}. Please destroy it manually: {err}",
                    handle.id
                ));
            }
        })
    }
}

/// Waits until the instance is running, transaction-free and addressed,
/// then records how to reach it.
#[derive(Clone, Copy, Debug)]
pub struct WaitForInstance {
    poll_interval: Duration,
}

impl WaitForInstance {
    /// Creates the step polling every `poll_interval`.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<StepAction, StepError> {
        let handle = state.instance()?.clone();
        let limit = state.config().state_timeout;

        state.ui().say("Waiting for the instance to become ACTIVE...");
        let ready = poll_instance(
            state,
            &handle,
            self.poll_interval,
            limit,
            "instance to become active",
            InstanceStatus::ready_address,
        )
        .await?;
        let Some(public_ip) = ready else {
            return Ok(StepAction::Halt);
        };

        let ssh_port = state.config().ssh_port;
        info!(instance_id = handle.id, %public_ip, "instance is active");
        state.set_networking(InstanceNetworking {
            public_ip,
            ssh_port,
        })?;
        Ok(StepAction::Continue)
    }
}

impl Step for WaitForInstance {
    fn name(&self) -> &'static str {
        "wait for instance"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = self.execute(state).await;
            conclude(state, result)
        })
    }
}
