//! Shared state threaded through the steps of one build.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::hook::{Hook, HookError};
use crate::provider::{InstanceHandle, InstanceNetworking, Provider, ProviderError};
use crate::resolve::ResolvedConfig;
use crate::ssh::{SshError, SshSession};
use crate::ui::Ui;

/// Errors raised by steps and carried by [`super::StepAction::HaltWithError`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepError {
    /// Raised when SSH key material cannot be prepared.
    #[error("ssh key setup failed: {message}")]
    SshKey {
        /// Human-readable description of the failure.
        message: String,
    },
    /// Raised when a provider call fails.
    #[error("failed to {action}: {source}")]
    Provider {
        /// Operation being attempted.
        action: &'static str,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// Raised when a bounded wait expires.
    #[error("timed out after {after:?} waiting for {action}")]
    Timeout {
        /// Condition being waited on.
        action: &'static str,
        /// Bound that expired.
        after: Duration,
    },
    /// Raised when a step reads a slot an earlier step should have filled.
    #[error("build state is missing {key}")]
    MissingState {
        /// Slot name.
        key: &'static str,
    },
    /// Raised when a step writes a slot that is already filled.
    #[error("build state already holds {key}")]
    StateConflict {
        /// Slot name.
        key: &'static str,
    },
    /// Raised when the SSH communicator fails.
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),
    /// Raised when provisioning hooks fail.
    #[error("provisioning failed: {0}")]
    Provision(#[from] HookError),
    /// Raised when the captured image cannot be found afterwards.
    #[error("image '{name}' not found after capture")]
    ImageNotFound {
        /// Image name searched for.
        name: String,
    },
}

/// Private key used to reach the instance, plus provider bookkeeping.
#[derive(Debug)]
pub struct SshKeyMaterial {
    /// Private key file handed to `ssh -i`.
    pub private_key_file: Utf8PathBuf,
    /// Provider identifier of an uploaded public key.
    pub provider_key_id: Option<i64>,
    /// Scratch directory holding a generated key pair; removed on drop.
    pub scratch: Option<TempDir>,
}

impl SshKeyMaterial {
    /// Material for a key file supplied by the user.
    #[must_use]
    pub const fn supplied(private_key_file: Utf8PathBuf) -> Self {
        Self {
            private_key_file,
            provider_key_id: None,
            scratch: None,
        }
    }

    /// Returns the private key path.
    #[must_use]
    pub fn private_key_file(&self) -> &Utf8Path {
        &self.private_key_file
    }

    /// Returns the provider key identifiers to authorise on new instances.
    #[must_use]
    pub fn provider_key_ids(&self) -> Vec<i64> {
        self.provider_key_id.into_iter().collect()
    }
}

#[derive(Debug)]
struct Slot<T> {
    key: &'static str,
    value: Option<T>,
}

impl<T> Slot<T> {
    const fn empty(key: &'static str) -> Self {
        Self { key, value: None }
    }

    fn set(&mut self, value: T) -> Result<(), StepError> {
        if self.value.is_some() {
            return Err(StepError::StateConflict { key: self.key });
        }
        self.value = Some(value);
        Ok(())
    }

    fn get(&self) -> Result<&T, StepError> {
        self.value
            .as_ref()
            .ok_or(StepError::MissingState { key: self.key })
    }

    const fn peek(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// What a finished run left behind for the orchestrator.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// Error reported by the halting step, if any.
    pub error: Option<StepError>,
    /// Identifier of the built image, if capture completed.
    pub image_id: Option<String>,
}

/// Typed state bag shared by the steps of one run.
///
/// Handles are fixed at construction; every other slot is written at most
/// once and never removed while the run lasts.
#[derive(Debug)]
pub struct BuildState {
    config: Arc<ResolvedConfig>,
    client: Arc<dyn Provider>,
    ui: Arc<dyn Ui>,
    hook: Arc<dyn Hook>,
    cancellation: CancellationToken,
    ssh_key: Slot<SshKeyMaterial>,
    instance: Slot<InstanceHandle>,
    networking: Slot<InstanceNetworking>,
    session: Slot<SshSession>,
    image_id: Slot<String>,
    error: Option<StepError>,
}

impl BuildState {
    /// Seeds a state bag for a new run.
    #[must_use]
    pub fn new(
        config: Arc<ResolvedConfig>,
        client: Arc<dyn Provider>,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            ui,
            hook,
            cancellation,
            ssh_key: Slot::empty("ssh key"),
            instance: Slot::empty("instance"),
            networking: Slot::empty("instance networking"),
            session: Slot::empty("ssh session"),
            image_id: Slot::empty("image id"),
            error: None,
        }
    }

    /// Returns the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Returns the provider client.
    #[must_use]
    pub fn client(&self) -> &dyn Provider {
        self.client.as_ref()
    }

    /// Returns the UI.
    #[must_use]
    pub fn ui(&self) -> &dyn Ui {
        self.ui.as_ref()
    }

    /// Returns the hook.
    #[must_use]
    pub fn hook(&self) -> &dyn Hook {
        self.hook.as_ref()
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Records SSH key material.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::StateConflict`] when already recorded.
    pub fn set_ssh_key(&mut self, material: SshKeyMaterial) -> Result<(), StepError> {
        self.ssh_key.set(material)
    }

    /// Returns the SSH key material.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::MissingState`] when not yet recorded.
    pub fn ssh_key(&self) -> Result<&SshKeyMaterial, StepError> {
        self.ssh_key.get()
    }

    /// Records the created instance.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::StateConflict`] when already recorded.
    pub fn set_instance(&mut self, handle: InstanceHandle) -> Result<(), StepError> {
        self.instance.set(handle)
    }

    /// Returns the created instance.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::MissingState`] when not yet recorded.
    pub fn instance(&self) -> Result<&InstanceHandle, StepError> {
        self.instance.get()
    }

    /// Records how to reach the instance.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::StateConflict`] when already recorded.
    pub fn set_networking(&mut self, networking: InstanceNetworking) -> Result<(), StepError> {
        self.networking.set(networking)
    }

    /// Returns how to reach the instance.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::MissingState`] when not yet recorded.
    pub fn networking(&self) -> Result<&InstanceNetworking, StepError> {
        self.networking.get()
    }

    /// Records the connected SSH session.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::StateConflict`] when already recorded.
    pub fn set_session(&mut self, session: SshSession) -> Result<(), StepError> {
        self.session.set(session)
    }

    /// Returns the connected SSH session.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::MissingState`] when not yet recorded.
    pub fn session(&self) -> Result<&SshSession, StepError> {
        self.session.get()
    }

    /// Records the built image identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::StateConflict`] when already recorded.
    pub fn set_image_id(&mut self, image_id: String) -> Result<(), StepError> {
        self.image_id.set(image_id)
    }

    /// Returns the built image identifier, if recorded.
    #[must_use]
    pub fn image_id(&self) -> Option<&str> {
        self.image_id.peek().map(String::as_str)
    }

    /// Returns the SSH key material if recorded, for cleanup.
    #[must_use]
    pub const fn recorded_ssh_key(&self) -> Option<&SshKeyMaterial> {
        self.ssh_key.peek()
    }

    /// Returns the instance if recorded, for cleanup.
    #[must_use]
    pub const fn recorded_instance(&self) -> Option<&InstanceHandle> {
        self.instance.peek()
    }

    /// Returns the error reported by the halting step, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    pub(super) fn record_error(&mut self, error: StepError) {
        self.error.get_or_insert(error);
    }

    /// Consumes the bag, keeping what the orchestrator inspects.
    #[must_use]
    pub fn into_outcome(self) -> BuildOutcome {
        BuildOutcome {
            error: self.error,
            image_id: self.image_id.value,
        }
    }
}
