//! Reference worker.
//!
//! Dials the supervisor's control port, serves the admin endpoints on the UI
//! port and runs a few built-in workloads:
//!
//! - `noop`: completes immediately
//! - `sleep:<ms>`: sleeps, interruptible
//! - `spin`: runs until interrupted
//! - `warn:<text>` / `error:<text>`: logs `<text>` under `capsule_worker::app`

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use capsule::admin::{self, AdminState, TraceOutcome};
use capsule::log_spy::{LogSpy, SpyBook};
use capsule::worker::{Workload, WorkerConfig, WorkerExit, WorkerHandler, run_worker};
use capsule::{CAPSULE_VERSION, VersionInfo};

const ADMIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "capsule-worker", version, about = "Reference worker for capsule supervision")]
struct Args {
    /// Directory for the worker's persistent data
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Admin service port (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    ui_port: u16,

    /// Keep stored traces in memory only
    #[arg(long)]
    mem_db: bool,

    /// Aggregation interval in seconds
    #[arg(long)]
    aggregate_interval: Option<u32>,

    #[arg(long)]
    library_path: Option<String>,

    #[arg(long)]
    agent: Option<PathBuf>,

    /// Instrumentation flags passed through by the supervisor
    #[arg(long = "instrument")]
    instrument: Vec<String>,

    /// Wait this long before dialing the control port
    #[arg(long, default_value_t = 0)]
    connect_delay_ms: u64,

    /// Do not install the log spy
    #[arg(long)]
    no_log_spy: bool,

    entry_point: String,

    control_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum App {
    Noop,
    Sleep(Duration),
    Spin,
    Warn(String),
    Error(String),
}

impl App {
    fn parse(id: &str) -> Result<Self, String> {
        match id.split_once(':') {
            None if id == "noop" => Ok(Self::Noop),
            None if id == "spin" => Ok(Self::Spin),
            Some(("sleep", ms)) => ms
                .parse()
                .map(|ms| Self::Sleep(Duration::from_millis(ms)))
                .map_err(|_| format!("invalid sleep duration: {ms}")),
            Some(("warn", text)) => Ok(Self::Warn(text.to_string())),
            Some(("error", text)) => Ok(Self::Error(text.to_string())),
            _ => Err(format!("unknown app: {id}")),
        }
    }

    async fn run(self, interrupt: CancellationToken) -> TraceOutcome {
        match self {
            Self::Noop => TraceOutcome::Completed,
            Self::Sleep(duration) => tokio::select! {
                _ = interrupt.cancelled() => TraceOutcome::Interrupted,
                _ = tokio::time::sleep(duration) => TraceOutcome::Completed,
            },
            Self::Spin => {
                interrupt.cancelled().await;
                TraceOutcome::Interrupted
            }
            Self::Warn(text) => {
                tracing::warn!(target: "capsule_worker::app", "{text}");
                TraceOutcome::Completed
            }
            Self::Error(text) => {
                tracing::error!(target: "capsule_worker::app", "{text}");
                TraceOutcome::Failed
            }
        }
    }
}

struct ReferenceWorker {
    admin: Arc<AdminState>,
    service_port: Option<u16>,
    spy: Option<SpyBook>,
}

impl WorkerHandler for ReferenceWorker {
    fn service_port(&self) -> Option<u16> {
        self.service_port
    }

    fn prepare(&self, app: &str, interrupt: CancellationToken) -> Result<Workload, String> {
        let parsed = App::parse(app)?;
        let trace = self.admin.begin_trace(app);
        Ok(Box::pin(async move {
            let outcome = parsed.run(interrupt).await;
            trace.finish(outcome);
        }))
    }

    fn log_spy(&self) -> Option<&dyn LogSpy> {
        self.spy.as_ref().map(|spy| spy as &dyn LogSpy)
    }
}

/// Initialize tracing with CAPSULE_LOG and LOG_FORMAT support.
///
/// The spy sees every event regardless of the console filter.
fn init_tracing(spy: Option<&SpyBook>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("CAPSULE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "capsule={level},capsule_worker={level}",
            level = base_level
        ))
    };

    let spy_layer = spy.map(SpyBook::layer);
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr).with_filter(filter))
            .with(spy_layer);
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
            .with(spy_layer);
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let spy = (!args.no_log_spy).then(SpyBook::new);
    init_tracing(spy.as_ref());

    tracing::info!(
        entry_point = %args.entry_point,
        control_port = args.control_port,
        "capsule-worker {}",
        CAPSULE_VERSION
    );
    tracing::debug!(
        mem_db = args.mem_db,
        aggregate_interval = ?args.aggregate_interval,
        library_path = ?args.library_path,
        agent = ?args.agent,
        instrument = ?args.instrument,
        "Worker options"
    );

    if let Some(ref dir) = args.data_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let admin = Arc::new(AdminState::new(
        VersionInfo::new().with_entry_point(&args.entry_point),
    ));
    let shutdown = CancellationToken::new();

    let (service_port, server) =
        match TcpListener::bind((Ipv4Addr::LOCALHOST, args.ui_port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                let server = tokio::spawn(admin::serve(
                    listener,
                    Arc::clone(&admin),
                    shutdown.clone(),
                    ADMIN_DRAIN_TIMEOUT,
                ));
                (Some(port), Some(server))
            }
            Err(e) => {
                tracing::error!(ui_port = args.ui_port, error = %e, "Could not bind service port");
                (None, None)
            }
        };

    if args.connect_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.connect_delay_ms)).await;
    }

    let handler = Arc::new(ReferenceWorker {
        admin,
        service_port,
        spy,
    });
    let exit = run_worker(handler, args.control_port, WorkerConfig::default()).await?;

    if exit == WorkerExit::Killed {
        std::process::exit(0);
    }

    shutdown.cancel();
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Admin service failed"),
            Err(e) => tracing::warn!(error = %e, "Admin service task failed"),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}
