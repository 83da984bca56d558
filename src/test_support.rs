//! Test support utilities shared across unit and integration tests.
//!
//! Doubles for every seam the pipeline talks through: a scripted command
//! runner, an in-memory provider, a recording UI and hook, and a scripted step.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::hook::{Hook, HookError, HookEvent, HookFuture};
use crate::pipeline::{BuildState, CleanupFuture, Step, StepAction, StepError, StepFuture};
use crate::provider::{
    ImageCapture, InstanceHandle, InstanceRequest, InstanceStatus, Provider, ProviderError,
    ProviderFuture,
};
use crate::resolve::{BaseImage, ImageType, ResolvedConfig};
use crate::ssh::{CommandOutput, CommandRunner, SshError, SshSession};
use crate::ui::Ui;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolved configuration for an OS-code build with every default applied.
#[must_use]
pub fn sample_config() -> ResolvedConfig {
    ResolvedConfig {
        username: String::from("builder"),
        api_key: String::from("api-key"),
        datacenter_name: String::from("ams01"),
        image_name: String::from("kiln-image"),
        image_description: String::from("Instance snapshot. Generated by kiln"),
        image_type: ImageType::Flex,
        base: BaseImage::OsCode(String::from("UBUNTU_LATEST")),
        instance_name: String::from("kiln-1700000000"),
        instance_domain: String::from("defaultdomain.com"),
        instance_cpu: 1,
        instance_memory: 1024,
        instance_network_speed: 10,
        instance_disk_capacity: 25,
        ssh_port: 22,
        ssh_username: String::from("root"),
        ssh_private_key_file: None,
        ssh_timeout: Duration::from_secs(300),
        state_timeout: Duration::from_secs(600),
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SshError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| SshError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// In-memory [`Provider`] recording every call.
///
/// Instance status polls consume the scripted queue; the final entry repeats
/// once the queue is down to one.
#[derive(Debug)]
pub struct FakeProvider {
    state: Mutex<FakeProviderState>,
}

#[derive(Debug, Default)]
struct FakeProviderState {
    calls: Vec<String>,
    requests: Vec<InstanceRequest>,
    captures: Vec<ImageCapture>,
    statuses: VecDeque<InstanceStatus>,
    image_id: Option<String>,
    failures: BTreeMap<&'static str, ProviderError>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// Identifier returned for uploaded keys.
    pub const KEY_ID: i64 = 1001;
    /// Identifier returned for created instances.
    pub const INSTANCE_ID: i64 = 4242;

    /// Creates a provider whose instances are immediately ready on
    /// `127.0.0.1` and whose captures produce image `img-guid`.
    #[must_use]
    pub fn new() -> Self {
        let state = FakeProviderState {
            statuses: VecDeque::from([Self::ready_status("127.0.0.1")]),
            image_id: Some(String::from("img-guid")),
            ..FakeProviderState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Status of a running, idle instance at `ip`.
    #[must_use]
    pub fn ready_status(ip: &str) -> InstanceStatus {
        InstanceStatus {
            power_state: Some(String::from("RUNNING")),
            active_transactions: 0,
            primary_ip: Some(ip.to_owned()),
        }
    }

    /// Replaces the scripted status sequence.
    #[must_use]
    pub fn with_statuses(self, statuses: impl IntoIterator<Item = InstanceStatus>) -> Self {
        lock(&self.state).statuses = statuses.into_iter().collect();
        self
    }

    /// Sets the image returned by name lookups.
    #[must_use]
    pub fn with_image(self, image_id: Option<&str>) -> Self {
        lock(&self.state).image_id = image_id.map(str::to_owned);
        self
    }

    /// Makes operation `op` (a [`Provider`] method name) fail.
    #[must_use]
    pub fn failing(self, op: &'static str, error: ProviderError) -> Self {
        lock(&self.state).failures.insert(op, error);
        self
    }

    /// Returns the calls made so far, e.g. `create_instance kiln-1`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Returns the instance requests received.
    #[must_use]
    pub fn instance_requests(&self) -> Vec<InstanceRequest> {
        lock(&self.state).requests.clone()
    }

    /// Returns the capture requests received.
    #[must_use]
    pub fn captures(&self) -> Vec<ImageCapture> {
        lock(&self.state).captures.clone()
    }

    fn record(&self, op: &'static str, detail: impl std::fmt::Display) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{op} {detail}"));
        state.failures.get(op).cloned().map_or(Ok(()), Err)
    }
}

impl Provider for FakeProvider {
    fn create_ssh_key<'a>(
        &'a self,
        label: &'a str,
        _public_key: &'a str,
    ) -> ProviderFuture<'a, i64> {
        Box::pin(async move {
            self.record("create_ssh_key", label)?;
            Ok(Self::KEY_ID)
        })
    }

    fn delete_ssh_key(&self, key_id: i64) -> ProviderFuture<'_, ()> {
        Box::pin(async move { self.record("delete_ssh_key", key_id) })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            self.record("create_instance", &request.hostname)?;
            lock(&self.state).requests.push(request.clone());
            Ok(InstanceHandle {
                id: Self::INSTANCE_ID,
                datacenter: request.datacenter.clone(),
            })
        })
    }

    fn instance_status<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            self.record("instance_status", handle.id)?;
            let mut state = lock(&self.state);
            let status = if state.statuses.len() > 1 {
                state.statuses.pop_front()
            } else {
                state.statuses.front().cloned()
            };
            Ok(status.unwrap_or_default())
        })
    }

    fn capture_image<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        capture: &'a ImageCapture,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("capture_image", handle.id)?;
            lock(&self.state).captures.push(capture.clone());
            Ok(())
        })
    }

    fn find_image<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<String>> {
        Box::pin(async move {
            self.record("find_image", name)?;
            Ok(lock(&self.state).image_id.clone())
        })
    }

    fn delete_instance<'a>(&'a self, handle: &'a InstanceHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.record("delete_instance", handle.id) })
    }

    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.record("delete_image", image_id) })
    }
}

/// [`Ui`] that keeps every line for assertions.
#[derive(Debug, Default)]
pub struct RecordingUi {
    says: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingUi {
    /// Returns the `say` lines.
    #[must_use]
    pub fn says(&self) -> Vec<String> {
        lock(&self.says).clone()
    }

    /// Returns the `message` lines.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    /// Returns the `error` lines.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        lock(&self.says).push(message.to_owned());
    }

    fn message(&self, message: &str) {
        lock(&self.messages).push(message.to_owned());
    }

    fn error(&self, message: &str) {
        lock(&self.errors).push(message.to_owned());
    }
}

/// [`Hook`] counting events, optionally failing them.
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: Mutex<Vec<HookEvent>>,
    failure: Option<HookError>,
}

impl RecordingHook {
    /// Creates a hook failing every event with `error`.
    #[must_use]
    pub fn failing(error: HookError) -> Self {
        Self {
            events: Mutex::default(),
            failure: Some(error),
        }
    }

    /// Returns the events received.
    #[must_use]
    pub fn events(&self) -> Vec<HookEvent> {
        lock(&self.events).clone()
    }
}

impl Hook for RecordingHook {
    fn run<'a>(
        &'a self,
        event: HookEvent,
        _ui: &'a dyn Ui,
        _session: &'a SshSession,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            lock(&self.events).push(event);
            self.failure.clone().map_or(Ok(()), Err)
        })
    }
}

/// Shared, ordered record of step activity (`run:`, `cancel:`, `cleanup:`).
#[derive(Clone, Debug, Default)]
pub struct StepJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StepJournal {
    /// Returns the entries so far.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    fn push(&self, kind: &str, step: &str) {
        lock(&self.entries).push(format!("{kind}:{step}"));
    }
}

/// Behaviour of a [`ScriptedStep`].
#[derive(Clone, Debug)]
pub enum StepScript {
    /// Return [`StepAction::Continue`].
    Continue,
    /// Return [`StepAction::Halt`].
    Halt,
    /// Return [`StepAction::HaltWithError`].
    Fail(StepError),
    /// Record the image id, then continue.
    RecordImage(String),
    /// Wait for the run's cancellation token, then halt.
    AwaitCancellation,
}

/// [`Step`] following a fixed script and journaling its activity.
#[derive(Debug)]
pub struct ScriptedStep {
    name: &'static str,
    script: StepScript,
    journal: StepJournal,
}

impl ScriptedStep {
    /// Creates a step named `name`.
    #[must_use]
    pub const fn new(name: &'static str, script: StepScript, journal: StepJournal) -> Self {
        Self {
            name,
            script,
            journal,
        }
    }
}

impl Step for ScriptedStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run<'a>(&'a self, state: &'a mut BuildState) -> StepFuture<'a> {
        Box::pin(async move {
            self.journal.push("run", self.name);
            match &self.script {
                StepScript::Continue => StepAction::Continue,
                StepScript::Halt => StepAction::Halt,
                StepScript::Fail(err) => StepAction::HaltWithError(err.clone()),
                StepScript::RecordImage(image_id) => match state.set_image_id(image_id.clone()) {
                    Ok(()) => StepAction::Continue,
                    Err(err) => StepAction::HaltWithError(err),
                },
                StepScript::AwaitCancellation => {
                    state.cancellation().cancelled().await;
                    StepAction::Halt
                }
            }
        })
    }

    fn cancel(&self) {
        self.journal.push("cancel", self.name);
    }

    fn cleanup<'a>(&'a self, _state: &'a mut BuildState) -> CleanupFuture<'a> {
        Box::pin(async move { self.journal.push("cleanup", self.name) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
