//! `ktl` - declarative Kubernetes deploys with plan, diff, and guards.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ktl_capture::CaptureRecorder;
use ktl_core::apply::{ApplyEngine, ApplyOptions, Confirmer};
use ktl_core::cancel::CancelToken;
use ktl_core::client::KubeClient;
use ktl_core::compare::compare_gate;
use ktl_core::destroy::{DestroyEngine, DestroyOptions};
use ktl_core::drift::DriftMode;
use ktl_core::plan::{PlanEngine, PlanOptions};
use ktl_core::render::ValueOverrides;
use ktl_core::secrets::{EnvSecrets, SecretResolver};
use ktl_events::{EventBus, JsonlRecorder, PhaseTimer};
use ktl_types::KtlError;

mod confirm;
mod console;
mod helm;
mod kubectl;

use confirm::PromptConfirmer;
use console::ConsoleObserver;
use helm::Helm;
use kubectl::Kubectl;

#[derive(Parser, Debug)]
#[command(name = "ktl", version)]
#[command(about = "Declarative Kubernetes deploys: plan, diff, confirm, apply")]
struct Cli {
    /// kubeconfig context to use.
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Debug, Default)]
struct ValueArgs {
    /// Values file (repeatable).
    #[arg(short = 'f', long = "values")]
    values: Vec<PathBuf>,

    /// Inline override, key=value (repeatable).
    #[arg(long = "set")]
    set: Vec<String>,

    /// Inline override forced to a string (repeatable).
    #[arg(long = "set-string")]
    set_string: Vec<String>,

    /// Override whose value is read from a file, key=path (repeatable).
    #[arg(long = "set-file")]
    set_file: Vec<String>,
}

impl ValueArgs {
    fn parse(&self) -> Result<ValueOverrides> {
        Ok(ValueOverrides::parse(
            &self.values,
            &self.set,
            &self.set_string,
            &self.set_file,
        )?)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render, diff against the live cluster, and print the plan artifact.
    Plan {
        #[arg(long)]
        chart: String,
        #[arg(long)]
        release: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        chart_version: Option<String>,
        #[command(flatten)]
        values: ValueArgs,
        #[arg(long)]
        include_crds: bool,
        /// Write the plan artifact here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Compare against a previously persisted plan artifact.
        #[arg(long)]
        compare_to: Option<PathBuf>,
        /// Exit non-zero when the comparison shows regressions.
        #[arg(long)]
        compare_exit: bool,
        /// Attach phase timing and API statistics to the artifact.
        #[arg(long)]
        telemetry: bool,
        /// Print per-resource diffs to the terminal.
        #[arg(long)]
        show_diff: bool,
    },
    /// Plan, confirm, and install or upgrade a release.
    Apply {
        #[arg(long)]
        chart: String,
        #[arg(long)]
        release: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        chart_version: Option<String>,
        #[command(flatten)]
        values: ValueArgs,
        #[arg(long)]
        include_crds: bool,
        /// Create the target namespace if it does not exist.
        #[arg(long)]
        create_namespace: bool,
        /// Plan and preview only; mutate nothing.
        #[arg(long)]
        dry_run: bool,
        /// Skip interactive confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Abort when live state drifted (last-applied or desired).
        #[arg(long)]
        drift: Option<String>,
        /// Verify report whose chart digest must match the render.
        #[arg(long)]
        verify_report: Option<PathBuf>,
        /// Roll back automatically if the install fails.
        #[arg(long)]
        atomic: bool,
        /// Do not wait for resources to become ready.
        #[arg(long)]
        no_wait: bool,
        /// Bound on every installer-visible wait (e.g. 5m, 90s).
        #[arg(long, default_value = "5m")]
        timeout: String,
        /// Keep streaming resource status for this long after the summary.
        #[arg(long)]
        watch: Option<String>,
        /// Record the session into this SQLite capture database.
        #[arg(long)]
        capture: Option<PathBuf>,
        /// Append every stream event to this JSONL transcript.
        #[arg(long)]
        transcript: Option<PathBuf>,
        #[arg(long)]
        compare_to: Option<PathBuf>,
        #[arg(long)]
        compare_exit: bool,
        #[arg(long)]
        show_diff: bool,
    },
    /// Uninstall a release, confirming by exact release name.
    Destroy {
        #[arg(long)]
        release: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        /// Skip interactive confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Keep release history after uninstalling.
        #[arg(long)]
        keep_history: bool,
        /// Skip uninstall hooks.
        #[arg(long)]
        no_hooks: bool,
        /// Ignore missing objects; foreground deletion propagation.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_wait: bool,
        #[arg(long, default_value = "5m")]
        timeout: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("KTL_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            err.downcast_ref::<KtlError>()
                .map(KtlError::exit_code)
                .unwrap_or(3)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Plan {
            chart,
            release,
            namespace,
            chart_version,
            values,
            include_crds,
            out,
            compare_to,
            compare_exit,
            telemetry,
            show_diff,
        } => {
            let cancel = install_signal_handler(CancelToken::new());
            let kube = Kubectl::new(cli.context.clone());
            let helm = Helm::new(&namespace, cli.context.clone());
            let bus = EventBus::new();
            bus.attach(Box::new(ConsoleObserver::new(show_diff)));
            let timer = PhaseTimer::new();
            let secrets = default_secret_resolver();

            let engine = PlanEngine {
                renderer: &helm,
                client: &kube,
                installer: &helm,
                secrets: &secrets,
                bus: &bus,
                timer: &timer,
            };
            let print_to_stdout = out.is_none();
            let result = engine.execute(
                &PlanOptions {
                    chart,
                    version: chart_version,
                    release,
                    namespace,
                    values: values.parse()?,
                    include_crds,
                    use_cluster: true,
                    compare_to,
                    out,
                    telemetry,
                },
                &cancel,
            );
            bus.close_all(Duration::from_secs(5));
            let plan = result?;
            if print_to_stdout {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&plan).context("failed to serialize plan")?
                );
            }
            compare_gate(&plan, compare_exit)?;
            Ok(())
        }

        Commands::Apply {
            chart,
            release,
            namespace,
            chart_version,
            values,
            include_crds,
            create_namespace,
            dry_run,
            yes,
            drift,
            verify_report,
            atomic,
            no_wait,
            timeout,
            watch,
            capture,
            transcript,
            compare_to,
            compare_exit,
            show_diff,
        } => {
            let timeout = parse_duration(&timeout)?;
            let cancel = install_signal_handler(CancelToken::with_timeout(timeout));
            let kube: Arc<dyn KubeClient> = Arc::new(Kubectl::new(cli.context.clone()));
            let helm = Helm::new(&namespace, cli.context.clone());
            let bus = EventBus::new();
            let timer = PhaseTimer::new();
            let secrets = default_secret_resolver();

            bus.attach(Box::new(ConsoleObserver::new(show_diff)));
            if let Some(path) = &transcript {
                bus.attach(Box::new(JsonlRecorder::open(path)?));
            }
            let artifacts = match &capture {
                Some(path) => {
                    let recorder = CaptureRecorder::open(
                        path,
                        &format!("ktl apply --chart {chart} --release {release}"),
                        &serde_json::json!({ "namespace": namespace }),
                    )?;
                    let writer = recorder.artifact_writer();
                    bus.attach(Box::new(recorder));
                    Some(writer)
                }
                None => None,
            };

            let prompter = PromptConfirmer;
            let confirmer: Option<&dyn Confirmer> = if std::io::stdin().is_terminal() {
                Some(&prompter)
            } else {
                None
            };

            let engine = ApplyEngine {
                renderer: &helm,
                client: Arc::clone(&kube),
                installer: &helm,
                secrets: &secrets,
                confirmer,
                bus: &bus,
                timer: &timer,
            };
            let result = engine.execute(
                &ApplyOptions {
                    chart,
                    version: chart_version,
                    release,
                    namespace,
                    values: values.parse()?,
                    include_crds,
                    create_namespace,
                    dry_run,
                    auto_approve: yes,
                    drift: drift.as_deref().map(DriftMode::parse).transpose()?,
                    verify_report,
                    atomic,
                    wait: !no_wait,
                    timeout,
                    watch: watch.as_deref().map(parse_duration).transpose()?,
                    compare_to,
                    compare_exit,
                },
                &cancel,
            );
            if let (Some(artifacts), Ok(summary)) = (&artifacts, &result) {
                let _ = artifacts.record(
                    "summary",
                    &serde_json::to_string_pretty(summary).unwrap_or_default(),
                );
            }
            bus.close_all(Duration::from_secs(5));
            result.map(|_| ())
        }

        Commands::Destroy {
            release,
            namespace,
            yes,
            keep_history,
            no_hooks,
            force,
            no_wait,
            timeout,
        } => {
            let timeout = parse_duration(&timeout)?;
            let cancel = install_signal_handler(CancelToken::with_timeout(timeout));
            let helm = Helm::new(&namespace, cli.context.clone());
            let bus = EventBus::new();
            bus.attach(Box::new(ConsoleObserver::new(false)));
            let timer = PhaseTimer::new();

            let prompter = PromptConfirmer;
            let confirmer: Option<&dyn Confirmer> = if std::io::stdin().is_terminal() {
                Some(&prompter)
            } else {
                None
            };

            let engine = DestroyEngine {
                installer: &helm,
                confirmer,
                bus: &bus,
                timer: &timer,
            };
            let result = engine.execute(
                &DestroyOptions {
                    release,
                    namespace,
                    wait: !no_wait,
                    keep_history,
                    disable_hooks: no_hooks,
                    force,
                    auto_approve: yes,
                    timeout,
                },
                &cancel,
            );
            bus.close_all(Duration::from_secs(5));
            result.map(|_| ())
        }
    }
}

fn default_secret_resolver() -> SecretResolver {
    let mut resolver = SecretResolver::new();
    resolver.register(Arc::new(EnvSecrets));
    resolver
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))
}

fn install_signal_handler(cancel: CancelToken) -> CancelToken {
    let handler = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler.cancel("interrupt signal")) {
        tracing::warn!(%err, "could not install signal handler");
    }
    cancel
}
