//! SSH key preparation: a supplied private key or a generated throwaway pair.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::local_fs;
use crate::pipeline::{
    BuildState, CleanupFuture, SshKeyMaterial, Step, StepAction, StepError, StepFuture,
};
use crate::ssh::{CommandRunner, SshError};

use super::{conclude, provider_error};

const KEY_FILE_NAME: &str = "id_rsa";
const PUBLIC_KEY_FILE_NAME: &str = "id_rsa.pub";

/// Records the key used to reach the instance.
///
/// A configured `ssh_private_key_file` is checked for readability and used
/// as is. Otherwise an RSA pair is generated with `ssh-keygen` into a scratch
/// directory and its public half is uploaded to the account; cleanup deletes
/// the uploaded key and dropping the state removes the scratch directory.
#[derive(Debug)]
pub struct CreateSshKey {
    runner: Arc<dyn CommandRunner>,
    keygen_bin: String,
}

impl CreateSshKey {
    /// Creates the step, running `keygen_bin` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, keygen_bin: impl Into<String>) -> Self {
        Self {
            runner,
            keygen_bin: keygen_bin.into(),
        }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<StepAction, StepError> {
        if let Some(path) = state.config().ssh_private_key_file.clone() {
            local_fs::ensure_readable(&path).map_err(|err| StepError::SshKey {
                message: format!("cannot read private key {path}: {err}"),
            })?;
            state.ui().say(&format!("Using private key {path}"));
            state.set_ssh_key(SshKeyMaterial::supplied(path))?;
            return Ok(StepAction::Continue);
        }

        state.ui().say("Creating temporary ssh key for instance...");
        let scratch = tempfile::Builder::new()
            .prefix("kiln-ssh-")
            .tempdir()
            .map_err(|err| key_error("failed to create scratch directory", &err))?;
        let dir = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|path| {
            StepError::SshKey {
                message: format!("scratch directory {} is not UTF-8", path.display()),
            }
        })?;
        let label = format!("kiln-{}", Uuid::new_v4().simple());
        let private_key_file = dir.join(KEY_FILE_NAME);

        self.generate(&label, &private_key_file).await?;
        let public_key = local_fs::read_to_string(&dir.join(PUBLIC_KEY_FILE_NAME))
            .map_err(|err| key_error("failed to read generated public key", &err))?;

        let key_id = state
            .client()
            .create_ssh_key(&label, public_key.trim())
            .await
            .map_err(provider_error("upload ssh key"))?;
        info!(key_id, label = %label, "uploaded temporary ssh key");

        state.set_ssh_key(SshKeyMaterial {
            private_key_file,
            provider_key_id: Some(key_id),
            scratch: Some(scratch),
        })?;
        Ok(StepAction::Continue)
    }

    async fn generate(&self, label: &str, private_key_file: &Utf8Path) -> Result<(), StepError> {
        let args: Vec<OsString> = [
            "-q",
            "-t",
            "rsa",
            "-b",
            "2048",
            "-N",
            "",
            "-C",
            label,
            "-f",
            private_key_file.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let runner = Arc::clone(&self.runner);
        let program = self.keygen_bin.clone();
        let output = tokio::task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| StepError::Ssh(SshError::Join(err.to_string())))??;

        if output.is_success() {
            return Ok(());
        }
        Err(StepError::Ssh(SshError::CommandFailed {
            command: self.keygen_bin.clone(),
            status_text: output.status_text(),
            stderr: output.stderr,
        }))
    }
}

fn key_error(context: &str, err: &std::io::Error) -> StepError {
    StepError::SshKey {
        message: format!("{context}: {err}"),
    }
}

impl Step for CreateSshKey {
    fn name(&self) -> &'static str {
        "create ssh key"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = self.execute(state).await;
            conclude(state, result)
        })
    }

    fn cleanup<'a>(&'a self, state: &'a mut BuildState) -> CleanupFuture<'a> {
        Box::pin(async move {
            let Some(key_id) = state
                .recorded_ssh_key()
                .and_then(|material| material.provider_key_id)
            else {
                return;
            };

            state.ui().say("Deleting temporary ssh key...");
            if let Err(err) = state.client().delete_ssh_key(key_id).await {
                warn!(key_id, error = %err, "failed to delete temporary ssh key");
                state.ui().error(&format!(
                    "Error cleaning up ssh key {key_id}. Please delete the key manually: {err}"
                ));
            }
        })
    }
}
