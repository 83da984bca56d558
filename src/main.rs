//! Binary entry point for the kiln CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kiln::{
    BuildOrchestrator, ClientSettings, ConfigErrors, ProcessCommandRunner, ProviderError,
    ProvisionHook, ResolveContext, ResolvedConfig, SettingsError, StepError, Template,
    TemplateFileError, TerminalUi, Ui, parse_override,
};

mod cli;

use cli::{Cli, TemplateArgs};

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "KILN_LOG";

/// Exit status reported when a build is interrupted.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Template(#[from] TemplateFileError),
    #[error("invalid builder configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("failed to create SoftLayer client: {0}")]
    Client(#[from] ProviderError),
    #[error("build failed: {0}")]
    Build(#[from] StepError),
}

#[derive(Debug)]
struct Prepared {
    config: ResolvedConfig,
    hook: ProvisionHook,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Validate(args) => validate(&args),
        Cli::Build(args) => build(&args).await,
    }
}

fn prepare(args: &TemplateArgs) -> Result<Prepared, CliError> {
    let template = Template::load(Utf8Path::new(&args.template))?;
    let overrides = args
        .vars
        .iter()
        .map(|argument| parse_override(argument))
        .collect::<Result<Vec<_>, _>>()?;
    let variables = template.user_variables(&overrides)?;
    let context = ResolveContext::from_process_env().with_user_vars(variables);

    let config = template.resolve(&context)?;
    let hook = template.provision_hook(&context)?;
    Ok(Prepared { config, hook })
}

fn validate(args: &TemplateArgs) -> Result<i32, CliError> {
    prepare(args)?;
    writeln!(io::stdout(), "Template validated successfully.").ok();
    Ok(0)
}

async fn build(args: &TemplateArgs) -> Result<i32, CliError> {
    let Prepared { config, hook } = prepare(args)?;
    let settings = ClientSettings::load_without_cli_args()?;
    let orchestrator = Arc::new(BuildOrchestrator::softlayer(
        config,
        &settings,
        Arc::new(ProcessCommandRunner),
    )?);
    let ui: Arc<dyn Ui> = Arc::new(TerminalUi);
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler = spawn_interrupt_handler(Arc::clone(&orchestrator), Arc::clone(&interrupted));

    let outcome = orchestrator.execute(Arc::clone(&ui), Arc::new(hook)).await;
    handler.abort();

    if let Some(artifact) = outcome? {
        ui.say("Build finished. The artifact of the successful build is:");
        ui.message(&format!("--> {artifact}"));
        return Ok(0);
    }

    if interrupted.load(Ordering::SeqCst) {
        ui.error("Build was cancelled.");
        return Ok(INTERRUPTED_EXIT_CODE);
    }
    ui.error("Build finished without producing an image.");
    Ok(1)
}

fn spawn_interrupt_handler(
    orchestrator: Arc<BuildOrchestrator>,
    interrupted: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match await_interrupts(tokio::signal::ctrl_c, &orchestrator, &interrupted).await {
            Ok(()) => process::exit(INTERRUPTED_EXIT_CODE),
            Err(err) => warn!(error = %err, "failed to listen for interrupts"),
        }
    })
}

/// Cancels the build on the first interrupt and returns on the second.
async fn await_interrupts<F, Fut>(
    mut next_interrupt: F,
    orchestrator: &BuildOrchestrator,
    interrupted: &AtomicBool,
) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    next_interrupt().await?;
    info!("interrupt received, cancelling build");
    interrupted.store(true, Ordering::SeqCst);
    orchestrator.cancel();

    next_interrupt().await?;
    warn!("second interrupt received, exiting without cleanup");
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
