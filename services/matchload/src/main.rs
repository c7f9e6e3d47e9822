use anyhow::Context;
use clap::{Parser, ValueEnum};
use matchload_core::config::LoggingConfig;
use matchload_core::{
    ClientContext, Config, EventBus, MetricEvent, Operation, Protocol, ProtocolMode, UserReport,
    VirtualUser,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// How often running totals are logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "matchload")]
#[command(about = "Load generator for vector similarity search endpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file (default: ./matchload.toml if present)
    #[arg(long, env = "MATCHLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of concurrent virtual users
    #[arg(long)]
    users: Option<usize>,

    /// Target queries per second for each user; 0 uses think time
    #[arg(long)]
    qps_per_user: Option<f64>,

    /// Stop after this many seconds (default: run until interrupted)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Wire protocol to drive
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Call each user issues; upserts are HTTP only
    #[arg(long, value_enum)]
    operation: Option<OperationArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    FindNeighbors,
    UpsertDatapoints,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::FindNeighbors => Self::FindNeighbors,
            OperationArg::UpsertDatapoints => Self::UpsertDatapoints,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Http,
    Grpc,
    Both,
}

impl From<ProtocolArg> for ProtocolMode {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Http => Self::Http,
            ProtocolArg::Grpc => Self::Grpc,
            ProtocolArg::Both => Self::Both,
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(users) = self.users {
            config.load.users = users;
        }
        if let Some(qps) = self.qps_per_user {
            config.load.qps_per_user = qps;
        }
        if let Some(secs) = self.duration_secs {
            config.load.duration_seconds = Some(secs);
        }
        if let Some(protocol) = self.protocol {
            config.target.protocol = Some(protocol.into());
        }
        if let Some(operation) = self.operation {
            config.target.operation = operation.into();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.clone()).context("failed to load configuration")?;
    cli.apply(&mut config);
    let run_config = config.resolve().context("invalid configuration")?;

    init_logging(&config.logging);

    info!(
        users = run_config.users,
        operation = run_config.operation.as_str(),
        protocol = ?run_config.protocol,
        network = ?run_config.network,
        embedding = ?run_config.embedding.kind,
        dimensions = run_config.embedding.dimensions,
        pacing = %run_config.pacing.description(),
        duration = ?run_config.run_duration,
        "starting load run"
    );

    let (bus, events) = EventBus::channel();
    let aggregator = tokio::spawn(aggregate(events));

    let ctx = ClientContext::new(run_config, Arc::new(bus)).context("failed to build clients")?;

    let mut users = Vec::with_capacity(ctx.config().users);
    for id in 0..ctx.config().users {
        let user = VirtualUser::new(id, &ctx)
            .await
            .with_context(|| format!("failed to initialize user {id}"))?;
        users.push(user);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let deadline = ctx.config().run_duration.map(|d| Instant::now() + d);

    let mut running = JoinSet::new();
    for user in users {
        running.spawn(user.run(stop_rx.clone(), deadline));
    }
    drop(stop_rx);
    info!(users = running.len(), "all users running");

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut reports: Vec<UserReport> = Vec::new();
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "user task failed"),
        }
    }

    // Releases the last event senders so the aggregator drains and exits.
    drop(ctx);
    let totals = aggregator.await.context("event aggregator failed")?;

    let iterations: u64 = reports.iter().map(|r| r.iterations).sum();
    let failures: u64 = reports.iter().map(|r| r.failures).sum();
    info!(users = reports.len(), iterations, failures, "load run complete");
    totals.log("final");

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("matchload={0},matchload_core={0}", logging.level)));

    let subscriber = fmt().with_env_filter(filter);
    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[derive(Debug, Default)]
struct ProtocolTotals {
    requests: u64,
    failures: u64,
    response_bytes: u64,
    latency_sum: Duration,
    latency_max: Duration,
}

#[derive(Debug, Default)]
struct EventTotals {
    by_protocol: HashMap<Protocol, ProtocolTotals>,
}

impl EventTotals {
    fn record(&mut self, event: &MetricEvent) {
        let totals = self.by_protocol.entry(event.protocol).or_default();
        totals.requests += 1;
        if !event.success {
            totals.failures += 1;
        }
        totals.response_bytes += event.response_bytes as u64;
        totals.latency_sum += event.latency;
        totals.latency_max = totals.latency_max.max(event.latency);
    }

    fn log(&self, label: &str) {
        for (protocol, totals) in &self.by_protocol {
            let mean_ms = if totals.requests == 0 {
                0.0
            } else {
                totals.latency_sum.as_secs_f64() * 1000.0 / totals.requests as f64
            };
            info!(
                report = label,
                protocol = %protocol,
                requests = totals.requests,
                failures = totals.failures,
                response_bytes = totals.response_bytes,
                mean_latency_ms = mean_ms,
                max_latency_ms = totals.latency_max.as_millis() as u64,
                "request totals"
            );
        }
    }
}

/// Consumes metric events until every sender is gone.
async fn aggregate(mut events: mpsc::UnboundedReceiver<MetricEvent>) -> EventTotals {
    let mut totals = EventTotals::default();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => totals.record(&event),
                None => break,
            },
            _ = ticker.tick() => totals.log("interval"),
        }
    }
    totals
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, stopping users");
        },
        _ = terminate => {
            info!("received SIGTERM, stopping users");
        },
    }
}
