use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use fable_core::credential::SessionAuthenticator;
use fable_core::directory::{MemoryDirectory, StaticPrimaryAuth};
use fable_core::generate::ReplyGenerator;
use fable_core::history::MemoryHistory;
use fable_core::ids::PrincipalId;
use fable_llm::{PacedGenerator, RemoteGenerator, RetryGenerator, ScriptedGenerator, ScriptedReply};
use fable_server::{BindPolicy, Collaborators, ServerConfig};
use fable_telemetry::TelemetryConfig;

/// Streams persona replies to connected clients over authenticated
/// WebSocket channels.
#[derive(Parser, Debug)]
#[command(name = "fable", version)]
struct Args {
    /// Port to listen on. 0 asks the OS for a free one.
    #[arg(long, env = "FABLE_PORT", default_value_t = 8787)]
    port: u16,

    /// What a second channel for a bound session means: "displace" the
    /// holder or "reject" the newcomer.
    #[arg(long, env = "FABLE_BIND_POLICY", default_value = "displace")]
    bind_policy: BindPolicy,

    /// Events queued per channel before sends are dropped.
    #[arg(long, env = "FABLE_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,

    /// Seconds between server heartbeat pings.
    #[arg(long, env = "FABLE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Seconds of inbound silence before a channel is dropped.
    #[arg(long, env = "FABLE_LIVENESS_SECS", default_value_t = 90)]
    liveness_secs: u64,

    /// Accepted turn ids remembered per session for retransmit detection.
    #[arg(long, env = "FABLE_DEDUP_WINDOW", default_value_t = 128)]
    dedup_window: usize,

    /// Key for signing channel credentials. An ephemeral key is minted
    /// when unset, so credentials die with the process.
    #[arg(long, env = "FABLE_SIGNING_KEY")]
    signing_key: Option<String>,

    /// Account token accepted by the session-creation endpoint.
    #[arg(long, env = "FABLE_PRIMARY_TOKEN", default_value = "local-dev-token")]
    primary_token: String,

    /// Where replies come from.
    #[arg(long, env = "FABLE_GENERATOR", value_enum, default_value_t = GeneratorMode::Scripted)]
    generator: GeneratorMode,

    /// Model-serving endpoint for the remote generator.
    #[arg(long, env = "FABLE_GENERATION_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer key for the remote generator.
    #[arg(long, env = "FABLE_GENERATION_API_KEY")]
    api_key: Option<String>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, env = "FABLE_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Skip the SQLite warn+ log sink.
    #[arg(long, env = "FABLE_NO_SQLITE_LOGS")]
    no_sqlite_logs: bool,

    /// Skip the in-process metrics recorder.
    #[arg(long, env = "FABLE_NO_METRICS")]
    no_metrics: bool,

    /// Directory for the telemetry databases. Defaults under ~/.fable.
    #[arg(long, env = "FABLE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum GeneratorMode {
    /// Canned paced replies, no network.
    Scripted,
    /// Stream from a model-serving endpoint.
    Remote,
}

impl Args {
    fn telemetry_config(&self) -> TelemetryConfig {
        let mut config = TelemetryConfig {
            log_level: self.log_level,
            log_to_sqlite: !self.no_sqlite_logs,
            metrics_enabled: !self.no_metrics,
            ..TelemetryConfig::default()
        };
        if let Some(dir) = &self.data_dir {
            config.log_db_path = dir.join("fable-logs.db");
            config.metrics_db_path = dir.join("fable-metrics.db");
        }
        config
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            bind_policy: self.bind_policy,
            send_queue: self.send_queue,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            liveness_timeout: Duration::from_secs(self.liveness_secs),
            dedup_window: self.dedup_window,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry_config = args.telemetry_config();
    let telemetry = fable_telemetry::init_telemetry(telemetry_config.clone());
    if let Some(recorder) = telemetry.metrics() {
        fable_telemetry::start_snapshot_task(recorder, &telemetry_config);
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting fable");

    let signing_key = match args.signing_key.clone() {
        Some(key) => SecretString::from(key),
        None => {
            tracing::info!("no signing key configured, minting an ephemeral one");
            SecretString::from(random_key())
        }
    };

    let generator = build_generator(&args)?;
    let collaborators = Collaborators {
        authenticator: Arc::new(SessionAuthenticator::new(signing_key)),
        primary_auth: Arc::new(StaticPrimaryAuth::single(
            args.primary_token.clone(),
            PrincipalId::new(),
        )),
        directory: Arc::new(MemoryDirectory::new()),
        history: Arc::new(MemoryHistory::new()),
        generator,
    };

    let handle = fable_server::start(args.server_config(), collaborators)
        .await
        .context("bind server port")?;
    tracing::info!(port = handle.port, "fable ready");

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!("shutting down");
    Ok(())
}

fn build_generator(args: &Args) -> anyhow::Result<Arc<dyn ReplyGenerator>> {
    match args.generator {
        GeneratorMode::Scripted => Ok(Arc::new(PacedGenerator::with_defaults(
            ScriptedGenerator::new(demo_script()),
        ))),
        GeneratorMode::Remote => {
            let endpoint = args
                .endpoint
                .clone()
                .context("--endpoint is required when --generator=remote")?;
            let api_key = args.api_key.clone().map(SecretString::from);
            let remote =
                RemoteGenerator::new(endpoint, api_key).context("build remote generator")?;
            Ok(Arc::new(RetryGenerator::with_defaults(remote)))
        }
    }
}

/// A long rotation of canned replies, enough for a demo session to keep
/// answering without a model endpoint behind it.
fn demo_script() -> Vec<ScriptedReply> {
    const LINES: [&str; 6] = [
        "Call me Ishmael.",
        "Some years ago, never mind how long precisely, I thought I would sail about a little.",
        "It is a way I have of driving off the spleen and regulating the circulation.",
        "There is nothing surprising in this. If they but knew it, almost all men cherish very nearly the same feelings towards the ocean with me.",
        "Whenever I find myself growing grim about the mouth, I account it high time to get to sea as soon as I can.",
        "With a philosophical flourish Cato throws himself upon his sword; I quietly take to the ship.",
    ];
    LINES
        .iter()
        .cycle()
        .take(240)
        .map(|line| ScriptedReply::text(line))
        .collect()
}

fn random_key() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
