//! Packet Interceptor CLI
//!
//! Replays a synthetic packet stream through the interception pipeline over an
//! in-memory connection and prints the resulting metrics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use packet_interceptor_core::config::{InterceptorConfig, LoggingConfig};
use packet_interceptor_core::error::{ConnectionError, ListenerResult};
use packet_interceptor_core::metrics::DropReason;
use packet_interceptor_core::{
    Connection, ConnectionId, DispatchOutcome, Interceptor, ListenerPriority, ListeningWhitelist,
    Packet, PacketEvent, PacketListener, PacketRegistry, PacketType, Protocol, Sender,
};

/// Packet ids registered in each direction of the replay protocol.
const PACKET_IDS: i32 = 16;

/// Packet interception replay driver.
#[derive(Parser)]
#[command(name = "packet-interceptor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of packets to replay.
    #[arg(short = 'n', long, default_value_t = 1000)]
    packets: u64,

    /// Seed for the synthetic packet stream.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Fraction of packets the filter listener cancels.
    #[arg(long, default_value_t = 0.05)]
    cancel_rate: f64,

    /// Upper bound of the simulated async listener latency, in milliseconds.
    #[arg(long, default_value_t = 5)]
    max_delay_ms: u8,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => InterceptorConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => InterceptorConfig::default(),
    };

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        packets = args.packets,
        seed = args.seed,
        max_concurrency = config.pipeline.max_concurrency,
        queue_full_policy = ?config.pipeline.queue_full_policy,
        "starting packet replay"
    );

    // Run the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_replay(config, args).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_replay(config: InterceptorConfig, args: Args) -> anyhow::Result<()> {
    let metrics_enabled = config.metrics.enabled;
    let interceptor = Interceptor::builder()
        .config(config)
        .registry(Arc::new(replay_registry()))
        .build()?;

    register_listeners(&interceptor)?;
    info!(
        listeners = interceptor.registrations().len(),
        intercepted = interceptor.intercepted_types().len(),
        "listeners registered"
    );

    let connection = Arc::new(ReplayConnection::new(ConnectionId(1)));
    let stats = tokio::select! {
        result = replay(&interceptor, &connection, &args) => result?,
        () = shutdown_signal() => {
            info!("shutdown signal received, stopping replay");
            ReplayStats::default()
        }
    };

    // Let the pipeline finish what is still in flight
    drain(&interceptor, Duration::from_secs(10)).await;
    interceptor.shutdown().await;

    info!(
        dispatched = stats.dispatched,
        forwarded = stats.forwarded,
        queued = stats.queued,
        cancelled = stats.cancelled,
        dropped = stats.dropped,
        sent = connection.sent.load(Ordering::Relaxed),
        received = connection.received.load(Ordering::Relaxed),
        reordered = connection.reordered.load(Ordering::Relaxed),
        async_cancelled = interceptor.metrics().dropped(DropReason::Cancelled),
        timed_out = interceptor.metrics().dropped(DropReason::Timeout),
        "replay complete"
    );

    if metrics_enabled {
        print!("{}", interceptor.metrics().encode()?);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct ReplayStats {
    dispatched: u64,
    forwarded: u64,
    queued: u64,
    cancelled: u64,
    dropped: u64,
}

/// Dispatch the synthetic stream, transmitting packets handed back for forwarding.
async fn replay(
    interceptor: &Arc<Interceptor>,
    connection: &Arc<ReplayConnection>,
    args: &Args,
) -> anyhow::Result<ReplayStats> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut stats = ReplayStats::default();
    let handle: Arc<dyn Connection> = connection.clone();

    for sequence in 0..args.packets {
        let packet = synthetic_packet(&mut rng, sequence, args);
        stats.dispatched += 1;

        match interceptor.dispatch(handle.clone(), packet).await? {
            DispatchOutcome::Forward(packet) => {
                connection.transmit(packet)?;
                stats.forwarded += 1;
            }
            DispatchOutcome::Queued { sending_index } => {
                debug!(sequence, sending_index, "packet queued");
                stats.queued += 1;
            }
            DispatchOutcome::Cancelled => stats.cancelled += 1,
            DispatchOutcome::Dropped => stats.dropped += 1,
        }
    }
    Ok(stats)
}

/// Packet body layout: `[flags, delay_ms, sequence (8 bytes, big endian)]`.
fn synthetic_packet(rng: &mut StdRng, sequence: u64, args: &Args) -> Packet {
    let sender = if rng.gen_bool(0.7) {
        Sender::Server
    } else {
        Sender::Client
    };
    let packet_type = PacketType::new(Protocol::Play, sender, rng.gen_range(0..PACKET_IDS));

    let flags = u8::from(rng.gen_bool(args.cancel_rate.clamp(0.0, 1.0)));
    let delay = rng.gen_range(0..=args.max_delay_ms);

    let mut body = Vec::with_capacity(10);
    body.push(flags);
    body.push(delay);
    body.extend_from_slice(&sequence.to_be_bytes());
    Packet::new(packet_type, body)
}

fn sequence_of(packet: &Packet) -> Option<u64> {
    let body = packet.body()?;
    let bytes: [u8; 8] = body.get(2..10)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn replay_registry() -> PacketRegistry {
    let mut registry = PacketRegistry::new();
    for id in 0..PACKET_IDS {
        for sender in [Sender::Client, Sender::Server] {
            registry.register(
                PacketType::new(Protocol::Play, sender, id),
                format!("Replay{}{id:#04x}", sender.as_str()),
            );
        }
    }
    registry
}

fn types_from(sender: Sender) -> impl Iterator<Item = PacketType> {
    (0..PACKET_IDS).map(move |id| PacketType::new(Protocol::Play, sender, id))
}

fn register_listeners(interceptor: &Arc<Interceptor>) -> anyhow::Result<()> {
    let all_types = || types_from(Sender::Server).chain(types_from(Sender::Client));

    interceptor.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::High)
            .types(all_types())
            .build(),
        Arc::new(FilterListener),
    )?;

    interceptor.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::Normal)
            .types(types_from(Sender::Server))
            .asynchronous()
            .build(),
        Arc::new(LatencyListener),
    )?;

    interceptor.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::Monitor)
            .types(all_types())
            .asynchronous()
            .build(),
        Arc::new(AuditListener::default()),
    )?;

    Ok(())
}

/// Cancels packets flagged by the stream generator.
struct FilterListener;

#[async_trait]
impl PacketListener for FilterListener {
    fn owner(&self) -> &str {
        "filter"
    }

    fn on_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        let flagged = event.packet().body().and_then(|body| body.first()).copied() == Some(1);
        if flagged {
            event.cancel()?;
        }
        Ok(())
    }
}

/// Simulates slow plugin work with the delay carried by each packet.
struct LatencyListener;

#[async_trait]
impl PacketListener for LatencyListener {
    fn owner(&self) -> &str {
        "latency"
    }

    async fn on_async_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        let delay = event.packet().body().and_then(|body| body.get(1)).copied().unwrap_or_default();
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        Ok(())
    }
}

/// Counts every packet that reaches the end of the async chain.
#[derive(Default)]
struct AuditListener {
    seen: AtomicU64,
}

#[async_trait]
impl PacketListener for AuditListener {
    fn owner(&self) -> &str {
        "audit"
    }

    async fn on_async_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % 1000 == 0 {
            debug!(seen, packet_type = %event.packet_type(), "audit checkpoint");
        }
        Ok(())
    }
}

/// In-memory connection that checks packets arrive in stream order.
struct ReplayConnection {
    id: ConnectionId,
    sent: AtomicUsize,
    received: AtomicUsize,
    reordered: AtomicUsize,
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl ReplayConnection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            reordered: AtomicUsize::new(0),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    fn check_order(&self, last: &AtomicU64, packet: &Packet) {
        let Some(sequence) = sequence_of(packet) else {
            return;
        };
        // Stored one-based so that zero means nothing seen yet.
        let previous = last.swap(sequence + 1, Ordering::Relaxed);
        if previous > sequence + 1 {
            self.reordered.fetch_add(1, Ordering::Relaxed);
            warn!(
                sequence,
                previous = previous - 1,
                packet_type = %packet.packet_type(),
                "packet delivered out of order"
            );
        }
    }
}

impl Connection for ReplayConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.check_order(&self.last_sent, &packet);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.check_order(&self.last_received, &packet);
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Wait until no packet is held by a sending queue, or until `limit` passes.
async fn drain(interceptor: &Interceptor, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while interceptor.pipeline().in_flight() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                in_flight = interceptor.pipeline().in_flight(),
                "pipeline did not drain in time"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
