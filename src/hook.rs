//! Hooks invoked by the pipeline at fixed points of a build.
//!
//! The only event today is [`HookEvent::Provision`], fired once the instance
//! accepts SSH. [`ProvisionHook`] runs the template's shell provisioners in
//! order.

use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::ssh::{SshError, SshSession};
use crate::ui::Ui;

/// Points in a build at which hooks run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookEvent {
    /// The instance is reachable and ready for software installation.
    Provision,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => formatter.write_str("provision"),
        }
    }
}

/// Errors raised while running hooks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HookError {
    /// Raised when a remote command fails or cannot be run.
    #[error("provisioning command failed: {0}")]
    Ssh(#[from] SshError),
    /// Raised when an environment entry is not `KEY=VALUE`.
    #[error("invalid environment variable '{0}': expected KEY=VALUE")]
    InvalidEnvironmentVar(String),
}

/// Future returned by [`Hook::run`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'a>>;

/// Extension point invoked by the pipeline.
pub trait Hook: Debug + Send + Sync {
    /// Handles `event` using the connected session.
    fn run<'a>(
        &'a self,
        event: HookEvent,
        ui: &'a dyn Ui,
        session: &'a SshSession,
    ) -> HookFuture<'a>;
}

/// Shell provisioner: inline commands run in order over SSH.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShellProvisioner {
    /// Commands to run, each in its own remote shell.
    #[serde(default)]
    pub inline: Vec<String>,
    /// `KEY=VALUE` pairs exported before every command.
    #[serde(default)]
    pub environment_vars: Vec<String>,
}

impl ShellProvisioner {
    /// Renders `command` with the provisioner's environment exported first.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::InvalidEnvironmentVar`] for entries without `=`
    /// or with an empty or non-identifier key.
    pub fn render(&self, command: &str) -> Result<String, HookError> {
        let mut rendered = String::new();
        for entry in &self.environment_vars {
            let (key, value) = entry
                .split_once('=')
                .filter(|(key, _)| is_identifier(key))
                .ok_or_else(|| HookError::InvalidEnvironmentVar(entry.clone()))?;
            rendered.push_str("export ");
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(&escape(Cow::Borrowed(value)));
            rendered.push_str("; ");
        }
        rendered.push_str(command);
        Ok(rendered)
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

/// Hook running shell provisioners on [`HookEvent::Provision`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionHook {
    provisioners: Vec<ShellProvisioner>,
}

impl ProvisionHook {
    /// Creates a hook running `provisioners` in order.
    #[must_use]
    pub const fn new(provisioners: Vec<ShellProvisioner>) -> Self {
        Self { provisioners }
    }

    async fn provision(&self, ui: &dyn Ui, session: &SshSession) -> Result<(), HookError> {
        for provisioner in &self.provisioners {
            for command in &provisioner.inline {
                let rendered = provisioner.render(command)?;
                ui.say(&format!("Provisioning with shell: {command}"));
                info!(command = %command, "running provisioner command");
                let output = session.run_checked(&rendered).await?;
                if !output.stdout.trim().is_empty() {
                    ui.message(output.stdout.trim_end());
                }
            }
        }
        Ok(())
    }
}

impl Hook for ProvisionHook {
    fn run<'a>(
        &'a self,
        event: HookEvent,
        ui: &'a dyn Ui,
        session: &'a SshSession,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            match event {
                HookEvent::Provision => self.provision(ui, session).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{SshOptions, SshTarget};
    use crate::test_support::{RecordingUi, ScriptedRunner};
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn session(runner: &ScriptedRunner) -> SshSession {
        SshSession::new(
            Arc::new(runner.clone()),
            SshOptions {
                ssh_bin: String::from("ssh"),
                known_hosts_file: String::from("/dev/null"),
            },
            SshTarget {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 22,
                user: String::from("root"),
                identity_file: Utf8PathBuf::from("/keys/id_rsa"),
            },
        )
    }

    #[rstest]
    #[case(&[], "apt-get update", "apt-get update")]
    #[case(&["DEBIAN_FRONTEND=noninteractive"], "true", "export DEBIAN_FRONTEND=noninteractive; true")]
    #[case(&["GREETING=hello world"], "echo", "export GREETING='hello world'; echo")]
    #[case(&["EMPTY="], "env", "export EMPTY=''; env")]
    fn render_exports_environment(
        #[case] environment: &[&str],
        #[case] command: &str,
        #[case] expected: &str,
    ) {
        let provisioner = ShellProvisioner {
            inline: Vec::new(),
            environment_vars: environment.iter().map(|entry| (*entry).to_owned()).collect(),
        };
        assert_eq!(provisioner.render(command).as_deref(), Ok(expected));
    }

    #[rstest]
    #[case("NOVALUE")]
    #[case("=value")]
    #[case("1ABC=x")]
    #[case("BAD-KEY=x")]
    fn render_rejects_malformed_environment(#[case] entry: &str) {
        let provisioner = ShellProvisioner {
            inline: Vec::new(),
            environment_vars: vec![entry.to_owned()],
        };
        assert_eq!(
            provisioner.render("true"),
            Err(HookError::InvalidEnvironmentVar(entry.to_owned()))
        );
    }

    #[tokio::test]
    async fn provision_runs_commands_in_order() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "updated\n", "");
        runner.push_success();
        let hook = ProvisionHook::new(vec![ShellProvisioner {
            inline: vec![String::from("apt-get update"), String::from("touch /done")],
            environment_vars: Vec::new(),
        }]);
        let ui = RecordingUi::default();

        hook.run(HookEvent::Provision, &ui, &session(&runner))
            .await
            .expect("provisioning should succeed");

        let commands: Vec<String> = runner
            .invocations()
            .iter()
            .map(|call| call.command_string())
            .collect();
        assert_eq!(commands.len(), 2);
        assert!(commands.first().is_some_and(|cmd| cmd.ends_with("sh -c 'apt-get update'")));
        assert!(commands.get(1).is_some_and(|cmd| cmd.ends_with("sh -c 'touch /done'")));
        assert!(ui.messages().contains(&String::from("updated")));
    }

    #[tokio::test]
    async fn provision_stops_at_first_failure() {
        let runner = ScriptedRunner::new();
        runner.push_failure(100);
        runner.push_success();
        let hook = ProvisionHook::new(vec![ShellProvisioner {
            inline: vec![String::from("exit 100"), String::from("never")],
            environment_vars: Vec::new(),
        }]);

        let err = hook
            .run(HookEvent::Provision, &RecordingUi::default(), &session(&runner))
            .await
            .expect_err("failing command should fail the hook");

        assert!(matches!(err, HookError::Ssh(SshError::CommandFailed { .. })));
        assert_eq!(runner.invocations().len(), 1);
    }
}
