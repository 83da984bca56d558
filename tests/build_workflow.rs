//! End-to-end build runs against an in-memory provider and scripted SSH.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use kiln::ssh::SshOptions;
use kiln::steps::{
    CaptureImage, ConnectSsh, CreateInstance, CreateSshKey, Provision, WaitForInstance,
};
use kiln::test_support::{FakeProvider, RecordingUi, ScriptedRunner, sample_config};
use kiln::{
    BuildOrchestrator, ClientSettings, HookError, ProvisionHook, ResolvedConfig, ShellProvisioner,
    SshError, Step, StepError,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::net::TcpListener;

const POLL: Duration = Duration::from_millis(1);

struct Workspace {
    _keys: TempDir,
    _listener: TcpListener,
    config: ResolvedConfig,
}

#[fixture]
async fn workspace() -> Workspace {
    let keys = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(keys.path().to_path_buf()).expect("utf-8 tempdir");
    let key = root.join("id_rsa");
    std::fs::write(&key, "PRIVATE").expect("write key");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("address").port();

    Workspace {
        _keys: keys,
        _listener: listener,
        config: ResolvedConfig {
            ssh_port: port,
            ssh_private_key_file: Some(key),
            ..sample_config()
        },
    }
}

fn steps(runner: &ScriptedRunner) -> Vec<Arc<dyn Step>> {
    let options = SshOptions::from(&ClientSettings::default());
    vec![
        Arc::new(CreateSshKey::new(Arc::new(runner.clone()), "ssh-keygen")),
        Arc::new(CreateInstance),
        Arc::new(WaitForInstance::new(POLL)),
        Arc::new(ConnectSsh::new(Arc::new(runner.clone()), options, POLL)),
        Arc::new(Provision),
        Arc::new(CaptureImage::new(POLL)),
    ]
}

fn hook() -> ProvisionHook {
    ProvisionHook::new(vec![ShellProvisioner {
        inline: vec![String::from("echo hi")],
        environment_vars: Vec::new(),
    }])
}

#[rstest]
#[tokio::test]
async fn successful_build_produces_an_artifact_and_cleans_up(#[future] workspace: Workspace) {
    let workspace = workspace.await;
    let client = Arc::new(FakeProvider::new());
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(0), "hi\n", "");
    let ui = Arc::new(RecordingUi::default());
    let orchestrator = BuildOrchestrator::new(
        workspace.config.clone(),
        Arc::clone(&client) as Arc<dyn kiln::Provider>,
        steps(&runner),
    );

    let artifact = orchestrator
        .execute(Arc::clone(&ui) as Arc<dyn kiln::Ui>, Arc::new(hook()))
        .await
        .expect("build should succeed")
        .expect("artifact expected");

    assert_eq!(artifact.to_string(), "ams01::img-guid (kiln-image)");
    assert_eq!(artifact.builder_id(), kiln::BUILDER_ID);
    assert_eq!(
        client.calls(),
        vec![
            "create_instance kiln-1700000000",
            "instance_status 4242",
            "capture_image 4242",
            "instance_status 4242",
            "find_image kiln-image",
            "delete_instance 4242",
        ]
    );
    let requests = client.instance_requests();
    assert!(requests.iter().all(|request| request.ssh_key_ids.is_empty()));
    assert!(ui.says().contains(&String::from("Provisioning with shell: echo hi")));
    assert!(ui.messages().contains(&String::from("hi")));
    assert!(ui.errors().is_empty());
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn failed_provisioning_destroys_the_instance(#[future] workspace: Workspace) {
    let workspace = workspace.await;
    let client = Arc::new(FakeProvider::new());
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_failure(2);
    let ui = Arc::new(RecordingUi::default());
    let orchestrator = BuildOrchestrator::new(
        workspace.config.clone(),
        Arc::clone(&client) as Arc<dyn kiln::Provider>,
        steps(&runner),
    );

    let err = orchestrator
        .execute(Arc::clone(&ui) as Arc<dyn kiln::Ui>, Arc::new(hook()))
        .await
        .expect_err("build should fail");

    assert_eq!(
        err,
        StepError::Provision(HookError::Ssh(SshError::CommandFailed {
            command: String::from("echo hi"),
            status_text: String::from("2"),
            stderr: String::from("simulated failure"),
        }))
    );
    let calls = client.calls();
    assert!(!calls.iter().any(|call| call.starts_with("capture_image")));
    assert_eq!(calls.last().map(String::as_str), Some("delete_instance 4242"));
    assert_eq!(ui.errors().len(), 1);
}

#[rstest]
#[tokio::test]
async fn instance_that_never_becomes_ready_times_out(#[future] workspace: Workspace) {
    let workspace = workspace.await;
    let client = Arc::new(FakeProvider::new().with_statuses([kiln::InstanceStatus {
        power_state: Some(String::from("HALTED")),
        active_transactions: 1,
        primary_ip: None,
    }]));
    let config = ResolvedConfig {
        state_timeout: Duration::from_millis(20),
        ..workspace.config.clone()
    };
    let runner = ScriptedRunner::new();
    let orchestrator = BuildOrchestrator::new(
        config,
        Arc::clone(&client) as Arc<dyn kiln::Provider>,
        steps(&runner),
    );

    let err = orchestrator
        .execute(Arc::new(RecordingUi::default()), Arc::new(hook()))
        .await
        .expect_err("build should time out");

    assert_eq!(
        err,
        StepError::Timeout {
            action: "instance to become active",
            after: Duration::from_millis(20),
        }
    );
    assert!(runner.invocations().is_empty());
    assert_eq!(
        client.calls().last().map(String::as_str),
        Some("delete_instance 4242")
    );
}
