//! vigild - the vigil host agent daemon.
//!
//! Wires the core subsystems together: the capture ring and policy
//! engine on the producer thread, the 1 Hz control tick, the egress
//! queue, and the observability surface (tracing, prometheus, crash
//! dumps). The kernel event source connects over a unix socket; rule
//! evaluation, scope inventory, and container control use the built-in
//! adapters unless a production integration replaces them.

mod adapters;
mod crash;
mod metrics;
mod source;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vigil_core::clock;
use vigil_core::config::AgentConfig;
use vigil_core::egress::{BoundedSinkQueue, EgressHandler, MessageType};
use vigil_core::event::source::{ChannelEventSource, EventSource, SourceItem};
use vigil_core::policy::store::PolicyStore;
use vigil_core::ring::MemoryDumper;
use vigil_core::SecurityEngine;

use crate::adapters::{ExecContainerControl, LabelInfraState, SimpleFilterCompiler, SimpleRuleEngine};
use crate::metrics::AgentMetrics;

/// Cadence of the control tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Poll deadline for the producer's source pulls.
const SOURCE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "vigild", about = "vigil host security and telemetry agent")]
struct Args {
    /// Agent configuration file.
    #[arg(long, default_value = "/etc/vigil/agent.yaml")]
    config: PathBuf,

    /// Rules file for the built-in rule engine.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Unix socket the kernel event source connects to.
    #[arg(long)]
    event_socket: Option<PathBuf>,

    /// Container runtime CLI used for pause/stop actions.
    #[arg(long, default_value = "docker")]
    container_runtime: String,

    /// Prometheus exposition address.
    #[arg(long, default_value = "127.0.0.1:9544")]
    metrics_addr: SocketAddr,

    /// Default log level (overridden by `VIGIL_LOG`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        AgentConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        AgentConfig::default()
    };

    telemetry::init(&args.log_level)?;
    info!(config = %args.config.display(), "starting vigild");

    std::fs::create_dir_all(&config.run_root)
        .with_context(|| format!("creating run root {}", config.run_root.display()))?;
    crash::install(&config.run_root.join("vigild-crash.log"))?;

    // The runtime only hosts the metrics endpoint, the intake socket,
    // and signal handling; the data path stays on plain threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let agent_metrics = AgentMetrics::new()?;
    {
        let metrics = Arc::clone(&agent_metrics);
        let addr = args.metrics_addr;
        runtime.spawn(async move {
            if let Err(err) = metrics::serve(metrics, addr).await {
                error!(%err, "metrics endpoint failed");
            }
        });
    }

    // Egress and the capture ring.
    let sink = Arc::new(BoundedSinkQueue::new(config.egress.queue_capacity));
    let sink_port: Arc<dyn vigil_core::egress::Sink> = sink.clone();
    let egress = Arc::new(EgressHandler::new(sink_port, config.egress.compression));
    let dumper = MemoryDumper::open(&config.memdump, &config.run_root, Arc::clone(&egress))?;
    if dumper.is_disabled() && config.memdump.enabled {
        warn!("memory dump disabled at startup; captures will fail");
    }

    // Policy evaluation over the built-in adapters.
    let rules = match &args.rules {
        Some(path) => SimpleRuleEngine::load(path)
            .with_context(|| format!("loading rules from {}", path.display()))?,
        None => SimpleRuleEngine::from_rules(Vec::new())?,
    };
    let infra = LabelInfraState::new(
        [("host.hostName".to_string(), config.machine_id.clone())]
            .into_iter()
            .collect(),
    );
    let store = Arc::new(PolicyStore::new(rules.clone()));
    let loaded = store.load(&config.security.policies);
    info!(policies = loaded, "compiled security policies");

    let engine = SecurityEngine::new(
        &config.security,
        config.machine_id.clone(),
        Arc::clone(&store),
        rules,
        infra,
        ExecContainerControl::new(args.container_runtime.clone()),
        Some(Arc::new(SimpleFilterCompiler)),
        Arc::clone(&dumper),
        Arc::clone(&egress),
    );

    if config.compliance.enabled {
        // The compliance module speaks gRPC from its own process; the
        // production integration injects that client. Nothing to wire
        // here without it.
        warn!("compliance is enabled but no module endpoint is integrated; skipping");
    }

    // Event intake.
    let (event_tx, event_source) = ChannelEventSource::new(SOURCE_POLL);
    if let Some(socket) = &args.event_socket {
        let socket = socket.clone();
        let tx = event_tx.clone();
        let engine = Arc::clone(&engine);
        runtime.spawn(async move {
            if let Err(err) = source::serve(&socket, tx, engine).await {
                error!(%err, "event intake failed");
            }
        });
    } else {
        info!("no event socket configured; agent runs idle");
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    // The collector transport attaches here in production; without it,
    // drain the queue so backpressure stays visible instead of silent.
    {
        let sink = Arc::clone(&sink);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("vigil-transport".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    if let Some(frame) = sink.pop(Duration::from_millis(250)) {
                        tracing::trace!(
                            msg_type = ?frame.msg_type,
                            len = frame.body.len(),
                            "frame drained (no transport attached)"
                        );
                    }
                }
            })
            .context("spawning transport thread")?;
    }

    let producer = {
        let shutdown = Arc::clone(&shutdown);
        let dumper = Arc::clone(&dumper);
        let engine = Arc::clone(&engine);
        let metrics = Arc::clone(&agent_metrics);
        std::thread::Builder::new()
            .name("vigil-producer".to_string())
            .spawn(move || producer_loop(event_source, &shutdown, &dumper, &engine, &metrics))
            .context("spawning producer thread")?
    };

    let control = {
        let shutdown = Arc::clone(&shutdown);
        let dumper = Arc::clone(&dumper);
        let engine = Arc::clone(&engine);
        let metrics = Arc::clone(&agent_metrics);
        let egress = Arc::clone(&egress);
        let report_interval = config.security.report_interval;
        std::thread::Builder::new()
            .name("vigil-control".to_string())
            .spawn(move || {
                control_loop(&shutdown, &dumper, &engine, &egress, &metrics, report_interval);
            })
            .context("spawning control thread")?
    };

    // Block until SIGINT/SIGTERM.
    runtime.block_on(async {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
        anyhow::Ok(())
    })?;

    info!("shutting down");
    shutdown.store(true, Ordering::Release);
    drop(event_tx);

    if producer.join().is_err() {
        error!("producer thread panicked");
    }
    if control.join().is_err() {
        error!("control thread panicked");
    }

    engine.check_outstanding_actions();
    engine.flush(clock::wall_ns());
    dumper.close();
    runtime.shutdown_timeout(Duration::from_secs(2));
    Ok(())
}

fn producer_loop(
    mut source: ChannelEventSource,
    shutdown: &AtomicBool,
    dumper: &Arc<MemoryDumper>,
    engine: &Arc<SecurityEngine>,
    metrics: &Arc<AgentMetrics>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match source.next() {
            Ok(SourceItem::Event(event)) => {
                metrics.events_total.inc();
                dumper.append(&event);
                if engine.process_event(&event) {
                    metrics.policy_matches_total.inc();
                }
            },
            Ok(SourceItem::Timeout) => {},
            Ok(SourceItem::Eof) => {
                info!("event source finished");
                return;
            },
            Err(err) => {
                error!(%err, "event source failed");
                return;
            },
        }
    }
}

fn control_loop(
    shutdown: &AtomicBool,
    dumper: &Arc<MemoryDumper>,
    engine: &Arc<SecurityEngine>,
    egress: &Arc<EgressHandler>,
    metrics: &Arc<AgentMetrics>,
    report_interval: Duration,
) {
    let mut last_flush = Instant::now();
    let mut last_missed = 0u64;
    let mut last_egress_dropped = 0u64;

    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(TICK_INTERVAL);

        engine.check_outstanding_actions();
        dumper.check_jobs();

        if last_flush.elapsed() >= report_interval {
            engine.flush(clock::wall_ns());
            last_flush = Instant::now();
        }

        // Health gauges and counter deltas.
        metrics
            .ring_segments
            .set(i64::try_from(dumper.segment_count()).unwrap_or(i64::MAX));
        let missed = dumper.missed_events();
        metrics.ring_missed_events.set(i64::try_from(missed).unwrap_or(i64::MAX));
        if missed > last_missed {
            metrics.events_dropped_total.inc_by(missed - last_missed);
        }
        last_missed = missed;

        let egress_dropped: u64 = MessageType::ALL
            .iter()
            .map(|t| egress.dropped(*t))
            .sum();
        if egress_dropped > last_egress_dropped {
            metrics
                .egress_dropped_total
                .inc_by(egress_dropped - last_egress_dropped);
        }
        last_egress_dropped = egress_dropped;
    }
}
