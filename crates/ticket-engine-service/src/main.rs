use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ticket_engine::events::{EventBusExt, EventFilter};
use ticket_engine::StaticAgentDirectory;
use ticket_engine_service::config::load_roster;
use ticket_engine_service::telemetry::{append_stats, init_tracing};
use ticket_engine_service::transport::load_replay;
use ticket_engine_service::{EngineConfig, Service};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (overrides ENGINE_* environment defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of delivery workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between SLA sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Agent roster file (`[[agents]]` tables)
    #[arg(long)]
    roster: Option<PathBuf>,

    /// JSONL file of `{"routingKey": ..., "payload": ...}` deliveries to inject
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Exit once the replayed deliveries are settled and one sweep has run
    #[arg(long, requires = "replay")]
    drain: bool,

    /// Append a stats snapshot to this JSONL file on shutdown
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Only log outbound events for this ticket ID
    #[arg(long)]
    watch_ticket: Option<String>,

    /// Only log outbound events with these routing keys (comma separated)
    #[arg(long, value_delimiter = ',')]
    watch_events: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweep_interval_secs = secs;
    }
    if let Some(roster) = args.roster {
        config.roster_path = Some(roster);
    }

    let records = match config.roster_path.as_deref() {
        Some(path) => load_roster(path).context("loading agent roster")?,
        None => {
            warn!("No roster configured; every ticket will wait for agents");
            Vec::new()
        }
    };
    info!(agents = records.len(), "Agent roster loaded");

    let service = Service::build(config, Arc::new(StaticAgentDirectory::new(records)))
        .context("building service")?;

    // Stand-in downstream consumer: log outbound events
    let mut filter = EventFilter::new();
    if let Some(ticket_id) = args.watch_ticket.as_deref() {
        filter = filter.ticket(ticket_id);
    }
    if !args.watch_events.is_empty() {
        filter = filter.types(args.watch_events.iter().map(String::as_str).collect());
    }
    let mut outbound = service.bus().subscribe_filtered(filter);
    tokio::spawn(async move {
        while let Ok(event) = outbound.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => info!(event_type = event.routing_key(), %payload, "Outbound event"),
                Err(e) => warn!(error = %e, "Failed to encode outbound event"),
            }
        }
    });

    if !service
        .engine()
        .refresh_roster()
        .await
        .context("loading roster into workload tracker")?
    {
        warn!("Agent directory unavailable at startup; roster loads on first assignment");
    }

    let cancel = CancellationToken::new();
    let running = service.start(cancel.clone());

    if let Some(path) = args.replay.as_deref() {
        let deliveries = load_replay(path).context("loading replay file")?;
        info!(count = deliveries.len(), path = %path.display(), "Replaying deliveries");
        for delivery in deliveries {
            service.queue().enqueue(delivery)?;
        }
    }

    if args.drain {
        service.queue().wait_idle().await;
        if let Some(report) = service.sweeper().tick(Utc::now()).await {
            info!(?report, "Final sweep");
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("Shutdown requested");
    }

    cancel.cancel();
    running.join().await;

    let snapshot = service.stats().snapshot();
    info!(
        applied = snapshot.applied,
        dropped = snapshot.dropped,
        redelivered = snapshot.redelivered,
        dead_lettered = snapshot.dead_lettered,
        outbox = service.publisher().outbox_len(),
        "Ticket engine service stopped"
    );
    if let Some(path) = args.stats_file.as_deref() {
        append_stats(&snapshot, path);
    }

    Ok(())
}
