//! Build entry point: runs the step pipeline and turns its outcome into an
//! [`Artifact`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::config::ClientSettings;
use crate::hook::Hook;
use crate::pipeline::{BuildState, Pipeline, Step, StepError, Termination};
use crate::provider::{Provider, ProviderError};
use crate::resolve::ResolvedConfig;
use crate::softlayer::SoftLayerClient;
use crate::ssh::CommandRunner;
use crate::steps::softlayer_steps;
use crate::ui::Ui;

/// Drives one build at a time and exposes cancellation to other tasks.
#[derive(Debug)]
pub struct BuildOrchestrator {
    config: Arc<ResolvedConfig>,
    client: Arc<dyn Provider>,
    steps: Vec<Arc<dyn Step>>,
    running: Mutex<Option<Arc<Pipeline>>>,
}

impl BuildOrchestrator {
    /// Creates an orchestrator running `steps` against `client`.
    #[must_use]
    pub fn new(
        config: ResolvedConfig,
        client: Arc<dyn Provider>,
        steps: Vec<Arc<dyn Step>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            steps,
            running: Mutex::new(None),
        }
    }

    /// Creates an orchestrator with a SoftLayer client and the default steps.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the client cannot be built.
    pub fn softlayer(
        config: ResolvedConfig,
        settings: &ClientSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProviderError> {
        let client =
            SoftLayerClient::new(config.username.clone(), config.api_key.clone(), settings)?;
        let steps = softlayer_steps(settings, runner);
        Ok(Self::new(config, Arc::new(client), steps))
    }

    /// Returns the configuration the build runs with.
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Runs the steps and reports the outcome.
    ///
    /// Returns `Ok(Some(artifact))` once an image was captured and
    /// `Ok(None)` when the run was cancelled or halted without producing
    /// one.
    ///
    /// # Errors
    ///
    /// Returns the error recorded by the step that halted the run.
    pub async fn execute(
        &self,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<Artifact>, StepError> {
        let cancellation = CancellationToken::new();
        let pipeline = Arc::new(Pipeline::new(self.steps.clone(), cancellation.clone()));
        *lock(&self.running) = Some(Arc::clone(&pipeline));

        let mut state = BuildState::new(
            Arc::clone(&self.config),
            Arc::clone(&self.client),
            ui,
            hook,
            cancellation,
        );
        let termination = pipeline.run(&mut state).await;
        *lock(&self.running) = None;

        let outcome = state.into_outcome();
        if let Some(err) = outcome.error {
            return Err(err);
        }

        let Some(image_id) = outcome.image_id else {
            if termination == Termination::Cancelled {
                info!("build cancelled");
            } else {
                warn!(?termination, "build finished without producing an image");
            }
            return Ok(None);
        };

        Ok(Some(Artifact::new(
            self.config.image_name.clone(),
            image_id,
            self.config.datacenter_name.clone(),
            Arc::clone(&self.client),
        )))
    }

    /// Cancels the running build, if any. Safe to call from any task.
    pub fn cancel(&self) {
        let running = lock(&self.running).clone();
        match running {
            Some(pipeline) => pipeline.cancel(),
            None => debug!("cancel requested with no build running"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeProvider, RecordingHook, RecordingUi, ScriptedStep, StepJournal, StepScript,
        sample_config,
    };
    use std::time::Duration;
    use tracing_test::traced_test;

    fn orchestrator(
        client: Arc<FakeProvider>,
        journal: &StepJournal,
        scripts: Vec<(&'static str, StepScript)>,
    ) -> BuildOrchestrator {
        let steps = scripts
            .into_iter()
            .map(|(name, script)| {
                Arc::new(ScriptedStep::new(name, script, journal.clone())) as Arc<dyn Step>
            })
            .collect();
        BuildOrchestrator::new(sample_config(), client, steps)
    }

    async fn execute(
        orchestrator: &BuildOrchestrator,
    ) -> Result<Option<Artifact>, StepError> {
        orchestrator
            .execute(
                Arc::new(RecordingUi::default()),
                Arc::new(RecordingHook::default()),
            )
            .await
    }

    #[tokio::test]
    async fn completed_run_yields_an_artifact_sharing_the_client() {
        let client = Arc::new(FakeProvider::new());
        let journal = StepJournal::default();
        let orchestrator = orchestrator(
            Arc::clone(&client),
            &journal,
            vec![("capture", StepScript::RecordImage(String::from("img-7")))],
        );

        let artifact = execute(&orchestrator)
            .await
            .expect("build should succeed")
            .expect("artifact expected");

        assert_eq!(artifact.to_string(), "ams01::img-7 (kiln-image)");
        artifact.destroy().await.expect("destroy should succeed");
        assert_eq!(client.calls(), vec!["delete_image img-7"]);
    }

    #[tokio::test]
    async fn recorded_error_is_returned_verbatim() {
        let failure = StepError::Provider {
            action: "create instance",
            source: ProviderError::Config(String::from("boom")),
        };
        let journal = StepJournal::default();
        let orchestrator = orchestrator(
            Arc::new(FakeProvider::new()),
            &journal,
            vec![
                ("create", StepScript::Fail(failure.clone())),
                ("capture", StepScript::RecordImage(String::from("img-7"))),
            ],
        );

        let err = execute(&orchestrator).await.expect_err("build should fail");

        assert_eq!(err, failure);
        assert_eq!(journal.entries(), vec!["run:create", "cleanup:create"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn halted_run_without_image_is_flagged() {
        let journal = StepJournal::default();
        let orchestrator = orchestrator(
            Arc::new(FakeProvider::new()),
            &journal,
            vec![("stop", StepScript::Halt)],
        );

        let outcome = execute(&orchestrator).await.expect("halt is not an error");

        assert!(outcome.is_none());
        assert!(logs_contain("build finished without producing an image"));
    }

    #[tokio::test]
    #[traced_test]
    async fn cancel_during_a_step_yields_no_artifact() {
        let journal = StepJournal::default();
        let orchestrator = orchestrator(
            Arc::new(FakeProvider::new()),
            &journal,
            vec![
                ("wait", StepScript::AwaitCancellation),
                ("capture", StepScript::RecordImage(String::from("img-7"))),
            ],
        );
        let cancel = async {
            while !journal.entries().contains(&String::from("run:wait")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            orchestrator.cancel();
        };

        let (outcome, ()) = tokio::join!(execute(&orchestrator), cancel);
        let outcome = outcome.expect("cancellation is not an error");

        assert!(outcome.is_none());
        assert_eq!(
            journal.entries(),
            vec!["run:wait", "cancel:wait", "cleanup:wait"]
        );
        assert!(logs_contain("build cancelled"));
    }

    #[test]
    fn cancel_without_a_running_build_is_a_no_op() {
        let orchestrator = orchestrator(
            Arc::new(FakeProvider::new()),
            &StepJournal::default(),
            Vec::new(),
        );

        orchestrator.cancel();
    }

    #[test]
    fn softlayer_orchestrator_runs_the_default_steps() {
        let orchestrator = BuildOrchestrator::softlayer(
            sample_config(),
            &ClientSettings::default(),
            Arc::new(crate::ssh::ProcessCommandRunner),
        )
        .expect("client should build");

        assert_eq!(orchestrator.steps.len(), 6);
        assert_eq!(orchestrator.config().image_name, "kiln-image");
    }
}
