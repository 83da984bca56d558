//! SSH communicator driving the host's `ssh` client.
//!
//! Remote commands are wrapped in `sh -c` with shell escaping so the remote
//! login shell does not change their meaning. Commands run on the blocking
//! thread pool; the runner itself is synchronous.

use std::borrow::Cow;
use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

use crate::config::ClientSettings;

mod types;

pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput};

/// Errors raised by the SSH communicator.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when a local command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exits unsuccessfully.
    #[error("{command} exited with status {status_text}: {stderr}")]
    CommandFailed {
        /// Command that was run.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the blocking task running the command is lost.
    #[error("command task failed: {0}")]
    Join(String),
}

/// Host-side SSH client options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Known hosts file handed to `UserKnownHostsFile`.
    pub known_hosts_file: String,
}

impl From<&ClientSettings> for SshOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            ssh_bin: settings.ssh_bin.clone(),
            known_hosts_file: settings.ssh_known_hosts_file.clone(),
        }
    }
}

/// Remote endpoint and credentials for a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Address of the instance.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Remote user.
    pub user: String,
    /// Private key used for authentication.
    pub identity_file: Utf8PathBuf,
}

/// Established connection parameters for running commands on an instance.
#[derive(Clone, Debug)]
pub struct SshSession {
    runner: Arc<dyn CommandRunner>,
    options: SshOptions,
    target: SshTarget,
    connect_timeout: Option<Duration>,
}

impl SshSession {
    /// Creates a session; no connection is made until a command runs.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, options: SshOptions, target: SshTarget) -> Self {
        Self {
            runner,
            options,
            target,
            connect_timeout: None,
        }
    }

    /// Bounds connection establishment with `ConnectTimeout`, rounded up to
    /// whole seconds.
    #[must_use]
    pub const fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = Some(limit);
        self
    }

    /// Returns the remote endpoint.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Builds the argument list passed to `ssh` for `command`.
    #[must_use]
    pub fn args(&self, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            OsString::from("-i"),
            OsString::from(self.target.identity_file.as_str()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
        ];

        if let Some(limit) = self.connect_timeout {
            let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("ConnectTimeout={}", secs.max(1))));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args.push(OsString::from(format!(
            "{}@{}",
            self.target.user, self.target.host
        )));
        args.push(OsString::from(format!(
            "sh -c {}",
            escape(Cow::Borrowed(command))
        )));
        args
    }

    /// Runs `command` on the instance, returning its output whatever the exit
    /// status.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when `ssh` cannot be started and
    /// [`SshError::Join`] when the blocking task is lost.
    pub async fn run(&self, command: &str) -> Result<RemoteCommandOutput, SshError> {
        let runner = Arc::clone(&self.runner);
        let program = self.options.ssh_bin.clone();
        let args = self.args(command);
        debug!(host = %self.target.host, port = self.target.port, command, "running remote command");

        let output = tokio::task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| SshError::Join(err.to_string()))??;
        Ok(output.into())
    }

    /// Runs `command` and fails unless it exits with zero.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CommandFailed`] for a non-zero or missing exit
    /// status, plus every error of [`SshSession::run`].
    pub async fn run_checked(&self, command: &str) -> Result<RemoteCommandOutput, SshError> {
        let output = self.run(command).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(SshError::CommandFailed {
            command: command.to_owned(),
            status_text: output
                .exit_code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr,
        })
    }
}
