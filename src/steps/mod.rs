//! Concrete SoftLayer build steps.
//!
//! [`softlayer_steps`] returns the default sequence: create an SSH key,
//! create the instance, wait for it to become active, connect over SSH,
//! provision, then capture the image. Every step reports failures to the UI
//! before halting, and every wait observes the run's cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::ClientSettings;
use crate::pipeline::{BuildState, Step, StepAction, StepError};
use crate::provider::{InstanceHandle, InstanceStatus, ProviderError};
use crate::ssh::{CommandRunner, SshOptions};

mod capture;
mod connect;
mod instance;
mod provision;
mod ssh_key;

pub use capture::CaptureImage;
pub use connect::ConnectSsh;
pub use instance::{CreateInstance, WaitForInstance};
pub use provision::Provision;
pub use ssh_key::CreateSshKey;

/// Builds the default step sequence for a SoftLayer build.
#[must_use]
pub fn softlayer_steps(
    settings: &ClientSettings,
    runner: Arc<dyn CommandRunner>,
) -> Vec<Arc<dyn Step>> {
    let poll_interval = settings.poll_interval();
    vec![
        Arc::new(CreateSshKey::new(
            Arc::clone(&runner),
            settings.ssh_keygen_bin.clone(),
        )),
        Arc::new(CreateInstance),
        Arc::new(WaitForInstance::new(poll_interval)),
        Arc::new(ConnectSsh::new(
            runner,
            SshOptions::from(settings),
            poll_interval,
        )),
        Arc::new(Provision),
        Arc::new(CaptureImage::new(poll_interval)),
    ]
}

/// Converts a step body's result into an action, echoing errors to the UI.
fn conclude(state: &BuildState, result: Result<StepAction, StepError>) -> StepAction {
    match result {
        Ok(action) => action,
        Err(err) => {
            state.ui().error(&err.to_string());
            StepAction::HaltWithError(err)
        }
    }
}

fn provider_error(action: &'static str) -> impl FnOnce(ProviderError) -> StepError {
    move |source| StepError::Provider { action, source }
}

/// Sleeps for `interval`, returning `false` if the run is cancelled first.
async fn pause(token: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = sleep(interval) => true,
    }
}

/// Polls the instance until `ready` yields a value.
///
/// Returns `Ok(None)` when the run is cancelled and
/// [`StepError::Timeout`] once `limit` elapses.
async fn poll_instance<T>(
    state: &BuildState,
    handle: &InstanceHandle,
    interval: Duration,
    limit: Duration,
    action: &'static str,
    ready: impl Fn(&InstanceStatus) -> Option<T> + Send,
) -> Result<Option<T>, StepError> {
    let deadline = Instant::now() + limit;
    loop {
        let status = state
            .client()
            .instance_status(handle)
            .await
            .map_err(provider_error("read instance status"))?;
        if let Some(value) = ready(&status) {
            return Ok(Some(value));
        }

        if Instant::now() >= deadline {
            return Err(StepError::Timeout {
                action,
                after: limit,
            });
        }
        if !pause(state.cancellation(), interval).await {
            return Ok(None);
        }
    }
}
