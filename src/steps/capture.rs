//! Image capture.

use std::time::Duration;

use tracing::info;

use crate::pipeline::{BuildState, Step, StepAction, StepError, StepFuture};
use crate::provider::ImageCapture;

use super::{conclude, pause, poll_instance, provider_error};

/// Captures the instance, waits for the capture transaction to drain, then
/// records the identifier of the newest image carrying the configured name.
#[derive(Clone, Copy, Debug)]
pub struct CaptureImage {
    poll_interval: Duration,
}

impl CaptureImage {
    /// Creates the step polling every `poll_interval`.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<StepAction, StepError> {
        let handle = state.instance()?.clone();
        let capture = ImageCapture::from_config(state.config());
        let limit = state.config().state_timeout;

        state.ui().say(&format!(
            "Creating {} image '{}'...",
            capture.image_type, capture.name
        ));
        state
            .client()
            .capture_image(&handle, &capture)
            .await
            .map_err(provider_error("capture image"))?;

        // The capture transaction is not always visible on the first poll.
        if !pause(state.cancellation(), self.poll_interval).await {
            return Ok(StepAction::Halt);
        }
        let drained = poll_instance(
            state,
            &handle,
            self.poll_interval,
            limit,
            "image capture to finish",
            |status| status.is_idle().then_some(()),
        )
        .await?;
        if drained.is_none() {
            return Ok(StepAction::Halt);
        }

        let image_id = state
            .client()
            .find_image(&capture.name)
            .await
            .map_err(provider_error("look up image"))?
            .ok_or_else(|| StepError::ImageNotFound {
                name: capture.name.clone(),
            })?;
        info!(image_id = %image_id, image_name = %capture.name, "image captured");
        state.ui().message(&format!("Image ID: {image_id}"));

        state.set_image_id(image_id)?;
        Ok(StepAction::Continue)
    }
}

impl Step for CaptureImage {
    fn name(&self) -> &'static str {
        "capture image"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = self.execute(state).await;
            conclude(state, result)
        })
    }
}
