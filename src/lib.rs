//! Core library for the kiln SoftLayer image builder.
//!
//! A build resolves a template's builder section into a [`ResolvedConfig`],
//! then runs an ordered [`pipeline::Pipeline`] of steps against a
//! [`Provider`]: create an SSH key, create an instance, wait for it, connect,
//! provision, and capture an image. Steps clean up in reverse order, and a
//! run can be cancelled from another task. A successful run yields an
//! [`Artifact`] describing the captured image.

pub mod artifact;
pub mod build;
pub mod config;
pub mod hook;
mod local_fs;
pub mod pipeline;
pub mod provider;
pub mod resolve;
pub mod softlayer;
pub mod ssh;
pub mod steps;
pub mod template;
pub mod test_support;
pub mod ui;

pub use artifact::{Artifact, BUILDER_ID};
pub use build::BuildOrchestrator;
pub use config::{ClientSettings, SettingsError};
pub use hook::{Hook, HookError, HookEvent, ProvisionHook, ShellProvisioner};
pub use pipeline::{
    BuildState, Pipeline, PipelineStatus, Step, StepAction, StepError, Termination,
};
pub use provider::{
    ImageCapture, InstanceHandle, InstanceNetworking, InstanceRequest, InstanceStatus, Provider,
    ProviderError,
};
pub use resolve::{
    BaseImage, ConfigError, ConfigErrors, ImageType, ResolveContext, ResolvedConfig,
};
pub use softlayer::SoftLayerClient;
pub use ssh::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput, SshError,
    SshSession,
};
pub use template::{Template, TemplateFileError, parse_override};
pub use ui::{TerminalUi, Ui};
