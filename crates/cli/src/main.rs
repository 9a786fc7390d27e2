use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_core::{Labels, ManagedResource, ObjectKind, Settings, Stage};
use keel_feedback::{CallbackNotifier, CallbackOutcome, ChannelIntake, FeedbackEmitter};
use keel_kubehub::{KindAccessor, KubeClusterClient};
use keel_labels::ReconciledMetadata;
use keel_lifecycle::{sweep_pending, JobGate, LifecycleController};
use keel_persist::{ResourceStore, SqliteStore};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel managed resource CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace owned objects live in (default: KEEL_NAMESPACE or "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Resource database path (default: KEEL_DB_PATH or ~/.keel/keel.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register or replace a resource record from a JSON file
    Put { file: PathBuf },
    /// Print the stored record
    Show { uniqid: String },
    /// Whether any owned object exists in the cluster
    Exists {
        uniqid: String,
        #[arg(long = "include-pvc", action = ArgAction::SetTrue)]
        include_pvc: bool,
    },
    /// Whether the resource's volume claims are all bound
    Pvc {
        uniqid: String,
        /// Claim name (default: the resource name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete every owned object
    Clear { uniqid: String },
    /// Delete owned objects but keep volume claims
    Stop { uniqid: String },
    /// Record a failed attempt and decide whether to retry
    Retry {
        uniqid: String,
        /// Stage being reported (default: derived from the desired state)
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        threshold: Option<u32>,
    },
    /// Inspect the cluster once and complete or retry
    Check {
        uniqid: String,
        #[arg(long)]
        threshold: Option<u32>,
    },
    /// Check every pending resource, optionally on an interval until Ctrl-C
    Sweep {
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long = "every")]
        every_secs: Option<u64>,
    },
    /// Reset the attempt count
    Reset { uniqid: String },
    /// Show (or apply) reconciled labels for the first owned object of a kind
    Labels {
        uniqid: String,
        #[arg(long)]
        kind: ObjectKind,
        /// Extra tag folded into the fingerprint, KEY=VALUE (repeatable)
        #[arg(long = "tag", value_parser = parse_kv)]
        tags: Vec<(String, String)>,
        #[arg(long, action = ArgAction::SetTrue)]
        apply: bool,
    },
    /// Send one best-effort callback
    Notify {
        #[arg(long)]
        url: String,
        #[arg(long = "type")]
        kind: String,
        /// JSON object sent as data[...]
        #[arg(long, default_value = "{}")]
        params: String,
        /// JSON object sent as messages[...]
        #[arg(long, default_value = "{}")]
        messages: String,
    },
}

fn init_tracing(directives: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?} ({}); using info", directives, e);
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn metrics_listener(addr: &str) -> Result<SocketAddr> {
    addr.parse().with_context(|| format!("metrics address {:?} is not host:port", addr))
}

/// Serve Prometheus metrics when an exporter address is configured.
fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    let listener = metrics_listener(addr)?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listener)
        .install()
        .context("installing metrics exporter")?;
    info!(%listener, "metrics exporter listening");
    Ok(())
}

fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

/// Shared handles for one invocation. Dropping it closes the task intake.
struct Ctx {
    settings: Settings,
    accessor: Arc<KindAccessor>,
    store: Arc<dyn ResourceStore>,
    emitter: Arc<FeedbackEmitter>,
}

impl Ctx {
    async fn build(settings: Settings) -> Result<(Self, JoinHandle<usize>)> {
        let store: Arc<dyn ResourceStore> =
            Arc::new(SqliteStore::open(&settings.db_path).with_context(|| format!("opening {}", settings.db_path))?);
        let accessor = match KubeClusterClient::try_default(settings.namespace.clone()).await {
            Ok(client) => KindAccessor::new(client),
            Err(e) => {
                warn!(error = %e, "no cluster client; cluster lookups will come back empty");
                KindAccessor::detached()
            }
        };
        let (intake, mut rx) = ChannelIntake::new(64);
        let drain = tokio::spawn(async move {
            let mut n = 0usize;
            while let Some(ev) = rx.recv().await {
                n += 1;
                info!(
                    event_id = %ev.event_id,
                    uniqid = %ev.feedback.uniqid,
                    code = %ev.feedback.code,
                    stage = %ev.feedback.stage,
                    details = %ev.feedback.details,
                    "task event"
                );
            }
            n
        });
        let emitter = Arc::new(FeedbackEmitter::new(store.clone(), Arc::new(intake)));
        Ok((Self { settings, accessor: Arc::new(accessor), store, emitter }, drain))
    }

    fn controller(&self, uniqid: &str) -> Result<LifecycleController> {
        Ok(LifecycleController::load(uniqid, self.accessor.clone(), self.store.clone(), self.emitter.clone())?)
    }

    fn threshold(&self, flag: Option<u32>) -> u32 {
        flag.unwrap_or(self.settings.retry_threshold)
    }
}

fn print<T: serde::Serialize>(output: Output, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    match output {
        Output::Human => println!("{}", human()),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn describe(r: &ManagedResource) -> String {
    format!(
        "{} • {} • {} • state={} desired={} attempts={}",
        r.uniqid, r.name, r.resource_type, r.state, r.desired_state, r.attempt_times
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    init_tracing(&settings.log_filter);
    if let Err(e) = init_metrics(settings.metrics_addr.as_deref()) {
        warn!(error = %format!("{:#}", e), "metrics disabled");
    }
    if let Some(ns) = cli.namespace.clone() {
        settings.namespace = ns;
    }
    if let Some(db) = cli.db.clone() {
        settings.db_path = db;
    }

    if let Commands::Notify { url, kind, params, messages } = &cli.command {
        let params: serde_json::Value = serde_json::from_str(params).context("--params must be JSON")?;
        let messages: serde_json::Value = serde_json::from_str(messages).context("--messages must be JSON")?;
        let notifier = CallbackNotifier::new(settings.callback_timeout());
        let outcome = notifier.notify_callback(url, kind, &messages, &params).await;
        let label = match &outcome {
            CallbackOutcome::Skipped => "skipped".to_string(),
            CallbackOutcome::Delivered(status) => format!("delivered ({})", status),
            CallbackOutcome::Failed(e) => format!("failed: {}", e),
        };
        return print(cli.output, &serde_json::json!({ "outcome": &label }), || label.clone());
    }

    let (ctx, drain) = Ctx::build(settings).await?;
    let res = run(&ctx, cli.output, cli.command).await;
    drop(ctx);
    match drain.await {
        Ok(n) => info!(events = n, "task intake drained"),
        Err(e) => error!(error = %e, "task intake consumer failed"),
    }
    res
}

async fn run(ctx: &Ctx, output: Output, command: Commands) -> Result<()> {
    metrics::counter!("cli_commands_total", 1u64);
    match command {
        Commands::Put { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let resource: ManagedResource = serde_json::from_str(&raw).context("parsing resource record")?;
            ctx.store.put(&resource)?;
            info!(uniqid = %resource.uniqid, "resource stored");
            print(output, &resource, || describe(&resource))
        }
        Commands::Show { uniqid } => {
            let ctl = ctx.controller(&uniqid)?;
            let r = ctl.resource();
            print(output, r, || {
                let mut s = describe(r);
                if let Some(m) = &r.message {
                    s.push_str(&format!("\nmessage: {}", m));
                }
                s
            })
        }
        Commands::Exists { uniqid, include_pvc } => {
            let ctl = ctx.controller(&uniqid)?;
            let exists = ctl.try_resource_exists(include_pvc).await?;
            print(output, &serde_json::json!({ "uniqid": uniqid, "exists": exists }), || exists.to_string())
        }
        Commands::Pvc { uniqid, name } => {
            let ctl = ctx.controller(&uniqid)?;
            let available = ctl.pvc_available(name.as_deref(), None).await;
            print(output, &serde_json::json!({ "uniqid": uniqid, "available": available }), || available.to_string())
        }
        Commands::Clear { uniqid } => {
            let deleted = ctx.controller(&uniqid)?.clear().await;
            print(output, &serde_json::json!({ "uniqid": uniqid, "deleted": deleted }), || format!("deleted {}", deleted))
        }
        Commands::Stop { uniqid } => {
            let deleted = ctx.controller(&uniqid)?.stop().await;
            print(output, &serde_json::json!({ "uniqid": uniqid, "deleted": deleted }), || format!("deleted {}", deleted))
        }
        Commands::Retry { uniqid, stage, threshold } => {
            let mut ctl = ctx.controller(&uniqid)?;
            let stage = stage.unwrap_or_else(|| Stage::for_desired(ctl.resource().desired_state));
            let d = ctl.decide_retry(ctx.threshold(threshold), stage).await?;
            print(output, &d, || format!("attempts={} state={}", d.attempts, d.state))
        }
        Commands::Check { uniqid, threshold } => {
            let mut ctl = ctx.controller(&uniqid)?;
            let outcome = ctl.check(ctx.threshold(threshold)).await?;
            print(output, &outcome, || format!("{:?}", outcome))
        }
        Commands::Sweep { threshold, every_secs } => {
            let gate = JobGate::new();
            let threshold = ctx.threshold(threshold);
            let Some(secs) = every_secs else {
                let report = sweep_pending(&gate, ctx.accessor.clone(), ctx.store.clone(), ctx.emitter.clone(), threshold).await?;
                return print(output, &report, || format!("{:?}", report));
            };
            let mut tick = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match sweep_pending(&gate, ctx.accessor.clone(), ctx.store.clone(), ctx.emitter.clone(), threshold).await {
                            Ok(report) => print(output, &report, || format!("{:?}", report))?,
                            Err(e) => error!(error = %e, "sweep failed"),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("interrupted; stopping sweeps");
                        break;
                    }
                }
            }
            Ok(())
        }
        Commands::Reset { uniqid } => {
            let mut ctl = ctx.controller(&uniqid)?;
            ctl.reset_attempts()?;
            print(output, ctl.resource(), || describe(ctl.resource()))
        }
        Commands::Labels { uniqid, kind, tags, apply } => {
            let ctl = ctx.controller(&uniqid)?;
            let r = ctl.resource();
            if !ctl.owned_kinds().contains(kind) {
                return Err(anyhow!("{} does not own {} objects", r.resource_type, kind));
            }
            let identity = r.identity().to_labels();
            let target = ctx
                .accessor
                .try_get(kind, None, Some(&identity))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no {} found for {}", kind, uniqid))?;
            let extra: Labels = tags.into_iter().collect();
            let patch = ReconciledMetadata::for_resource(r, &target.labels, &extra).to_merge_patch();
            if apply {
                ctx.accessor
                    .try_patch_metadata(kind, &target.name, &patch, &ctx.settings.field_manager)
                    .await?;
            }
            print(output, &patch, || format!("{} {}\n{}", kind, target.name, patch))
        }
        // handled before the context is built
        Commands::Notify { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_listener_requires_host_and_port() {
        assert!(metrics_listener("nope").is_err());
        assert!(metrics_listener("9000").is_err());
        assert_eq!(metrics_listener("127.0.0.1:9000").unwrap().port(), 9000);
    }

    #[test]
    fn no_metrics_address_installs_nothing() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn tags_parse_as_key_value() {
        assert_eq!(parse_kv("tier=db").unwrap(), ("tier".to_string(), "db".to_string()));
        assert!(parse_kv("=db").is_err());
        assert!(parse_kv("tier").is_err());
    }
}
