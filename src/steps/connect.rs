//! Waits for the SSH daemon and opens the communicator session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::pipeline::{BuildState, Step, StepAction, StepError, StepFuture};
use crate::ssh::{CommandRunner, SshError, SshOptions, SshSession, SshTarget};

use super::{conclude, pause};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes the SSH port, then runs `true` over SSH until it succeeds or
/// `ssh_timeout` elapses.
#[derive(Debug)]
pub struct ConnectSsh {
    runner: Arc<dyn CommandRunner>,
    options: SshOptions,
    poll_interval: Duration,
}

impl ConnectSsh {
    /// Creates the step.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        options: SshOptions,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            options,
            poll_interval,
        }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<StepAction, StepError> {
        let networking = state.networking()?.clone();
        let target = SshTarget {
            host: networking.public_ip,
            port: networking.ssh_port,
            user: state.config().ssh_username.clone(),
            identity_file: state.ssh_key()?.private_key_file().to_owned(),
        };
        let session = SshSession::new(Arc::clone(&self.runner), self.options.clone(), target)
            .with_connect_timeout(PROBE_TIMEOUT);
        let limit = state.config().ssh_timeout;
        let deadline = Instant::now() + limit;

        state.ui().say("Waiting for SSH to become available...");
        loop {
            let address = (networking.public_ip, networking.ssh_port);
            let reachable = matches!(
                timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await,
                Ok(Ok(_))
            );

            if reachable {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let attempt = tokio::select! {
                    () = state.cancellation().cancelled() => return Ok(StepAction::Halt),
                    result = timeout(remaining, session.run("true")) => result,
                };
                match attempt {
                    Ok(Ok(output)) if output.is_success() => break,
                    Ok(Ok(output)) => {
                        debug!(
                            exit_code = ?output.exit_code,
                            stderr = %output.stderr,
                            "ssh handshake rejected"
                        );
                    }
                    Ok(Err(err @ SshError::Spawn { .. })) => return Err(err.into()),
                    Ok(Err(err)) => debug!(error = %err, "ssh handshake failed"),
                    Err(_) => debug!("ssh handshake still running at the deadline"),
                }
            }

            if Instant::now() >= deadline {
                return Err(StepError::Timeout {
                    action: "ssh to become available",
                    after: limit,
                });
            }
            if !pause(state.cancellation(), self.poll_interval).await {
                return Ok(StepAction::Halt);
            }
        }

        state.ui().say("Connected to SSH!");
        state.set_session(session)?;
        Ok(StepAction::Continue)
    }
}

impl Step for ConnectSsh {
    fn name(&self) -> &'static str {
        "connect ssh"
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            let result = self.execute(state).await;
            conclude(state, result)
        })
    }
}
