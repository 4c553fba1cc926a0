use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use device_registry as devreg;
use knx_bridge::{Bridge, DispatchConfig, FailurePolicy, PollerConfig};
use knx_transport::{GroupBus, GroupTunnel, MockBus, MockFeed, TunnelConfig};

mod http;

#[derive(Parser, Debug)]
#[command(
    name = "knx-exporter",
    version,
    about = "Exports KNX group telegrams as Prometheus metrics"
)]
struct Cli {
    /// Address on which to expose metrics; a bare ":port" listens on all interfaces
    #[arg(long, default_value = ":8080")]
    listen_address: String,

    /// Path under which to expose metrics
    #[arg(long, default_value = "/metrics")]
    path: String,

    /// KNXnet/IP gateway as host:port
    #[arg(long, default_value = "192.168.1.144:3671")]
    gateway_address: String,

    /// YAML file mapping group addresses to devices
    #[arg(long, default_value = "devices.yaml")]
    devices: PathBuf,

    /// Maximum number of telegrams decoded concurrently
    #[arg(long, default_value_t = 64)]
    max_in_flight: u32,

    /// What to do when a startup read request cannot be sent
    #[arg(long, value_enum, default_value_t = PollFailure::Abort)]
    poll_failure: PollFailure,

    /// Extra attempts per startup read request
    #[arg(long, default_value_t = 0)]
    poll_retries: u32,

    /// Use the in-process mock bus instead of a gateway
    #[arg(long, action = ArgAction::SetTrue)]
    mock: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PollFailure {
    Abort,
    Continue,
}

impl From<PollFailure> for FailurePolicy {
    fn from(value: PollFailure) -> Self {
        match value {
            PollFailure::Abort => FailurePolicy::Abort,
            PollFailure::Continue => FailurePolicy::Continue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "starting knx-exporter");

    let listen = parse_listen_address(&cli.listen_address)?;
    if !cli.path.starts_with('/') {
        bail!("metrics path must start with '/': {}", cli.path);
    }

    let registry = devreg::load_registry(&cli.devices, &devreg::DecoderTable::builtin())?;
    info!(
        devices = registry.len(),
        file = %cli.devices.display(),
        "device registry loaded"
    );
    if registry.is_empty() {
        warn!("no devices configured, nothing will be exported");
    }
    let bridge = Bridge::new(registry, devreg::MetricStore::new()?);

    // The feed must outlive the run or the mock inbound stream ends at once.
    let (mut bus, _feed) = open_bus(&cli).await?;
    let inbound = bus
        .take_inbound()
        .ok_or_else(|| anyhow!("bus has no inbound stream"))?;
    let bus: Arc<dyn GroupBus> = Arc::from(bus);

    let dispatcher = bridge.dispatcher(DispatchConfig {
        max_in_flight: cli.max_in_flight,
    });
    let mut dispatch = tokio::spawn(async move { dispatcher.run(inbound).await });

    let poller = bridge.poller(PollerConfig {
        policy: cli.poll_failure.into(),
        retries: cli.poll_retries,
        ..PollerConfig::default()
    });
    let poll_bus = bus.clone();
    let mut poll = tokio::spawn(async move { poller.run(poll_bus.as_ref()).await });

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(address = %listen, path = %cli.path, "serving metrics");
    let mut server = tokio::spawn(http::serve(
        listener,
        bridge.store().clone(),
        cli.path.clone(),
    ));

    let mut polled = false;
    let outcome: Result<()> = loop {
        tokio::select! {
            res = &mut poll, if !polled => {
                polled = true;
                match res {
                    Ok(Ok(report)) => debug!(?report, "startup poll complete"),
                    Ok(Err(e)) => break Err(e).context("startup poll failed"),
                    Err(e) => break Err(anyhow!("startup poller task failed: {e}")),
                }
            }
            res = &mut dispatch => {
                break match res {
                    Ok(stats) => Err(anyhow!("bus connection closed after {} telegrams", stats.received)),
                    Err(e) => Err(anyhow!("dispatcher task failed: {e}")),
                };
            }
            res = &mut server => {
                break match res {
                    Ok(Ok(())) => Err(anyhow!("metrics server stopped")),
                    Ok(Err(e)) => Err(e.context("metrics server failed")),
                    Err(e) => Err(anyhow!("metrics server task failed: {e}")),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break Ok(());
            }
        }
    };

    if let Err(e) = bus.close().await {
        debug!(error = %e, "closing bus connection");
    }
    outcome
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn open_bus(cli: &Cli) -> Result<(Box<dyn GroupBus>, Option<MockFeed>)> {
    if cli.mock {
        warn!("using mock bus, no telegrams will arrive");
        let (bus, feed) = MockBus::new(1024);
        return Ok((Box::new(bus), Some(feed)));
    }
    let tunnel = GroupTunnel::connect(cli.gateway_address.as_str(), TunnelConfig::default())
        .await
        .with_context(|| format!("connecting to KNX gateway {}", cli.gateway_address))?;
    Ok((Box::new(tunnel), None))
}

/// Parse a listen address, treating a bare `:port` as all interfaces.
fn parse_listen_address(raw: &str) -> Result<SocketAddr> {
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address: {raw}"))
}
