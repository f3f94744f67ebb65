//! Composition root: wires the Configuration Registry, System Monitor,
//! Connection Manager, Subscription Registry, Message Dispatcher, DEX
//! Parsers, Event Router, and Price Monitor into a running ingestion
//! pipeline, then waits for a shutdown signal.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chain_event_ingest::config::{default_schema, ConfigRegistry, ConfigValue};
use chain_event_ingest::connection::{ConnectionManager, SocketParams};
use chain_event_ingest::dex::DexParserRegistry;
use chain_event_ingest::dispatcher::{MessageDispatcher, DEFAULT_SINK_CAPACITY};
use chain_event_ingest::domain::{BlockchainEvent, DexKind, SubscriptionKind};
use chain_event_ingest::error::Result;
use chain_event_ingest::events::{EventRouter, DEFAULT_REFERENCE_CURRENCY_PRICE};
use chain_event_ingest::monitor::{SystemMonitor, Thresholds};
use chain_event_ingest::price::{HttpPriceFetcher, PriceFetcher, PriceMonitor, PriceMonitorConfig};
use chain_event_ingest::subscription::{PendingOutcome, SubscriptionRegistry};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(ConfigRegistry::new(default_schema()));
    let env_values: HashMap<String, String> = env::vars().collect();
    let report = config.load(&env_values);
    if !report.missing_required.is_empty() {
        anyhow::bail!("missing required configuration: {:?}", report.missing_required);
    }

    let system_monitor = Arc::new(SystemMonitor::new(Thresholds::default(), 200));
    let cancel = CancellationToken::new();
    let report_interval = config
        .get_or("MONITORING_INTERVAL_SECONDS", ConfigValue::Integer(60))
        .as_u64()
        .unwrap_or(60);
    let _report_loop = system_monitor.spawn_report_loop(Duration::from_secs(report_interval), cancel.clone());

    let primary_wss = config.get("PRIMARY_WSS_URL").map(|v| v.as_str()).unwrap_or_default();
    let fallback_wss = config.get("FALLBACK_WSS_URL").map(|v| v.as_str()).filter(|s| !s.is_empty());
    let connection_manager = Arc::new(ConnectionManager::new(primary_wss, fallback_wss, SocketParams::default()));

    let subscriptions = SubscriptionRegistry::new();
    let parsers = Arc::new(DexParserRegistry::with_defaults());
    let reference_price = config
        .get("REFERENCE_CURRENCY_FALLBACK_PRICE")
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_REFERENCE_CURRENCY_PRICE);
    let router = Arc::new(EventRouter::new(system_monitor.clone(), reference_price));

    let (sink_tx, mut sink_rx) = mpsc::channel::<BlockchainEvent>(DEFAULT_SINK_CAPACITY);
    let dispatcher = Arc::new(MessageDispatcher::new(
        subscriptions.clone(),
        parsers,
        router,
        system_monitor.clone(),
        sink_tx,
    ));

    let reference_primary_url = config.get("REFERENCE_CURRENCY_PRIMARY_URL").map(|v| v.as_str()).unwrap_or_default();
    let reference_backup_url = config.get("REFERENCE_CURRENCY_BACKUP_URL").map(|v| v.as_str()).unwrap_or_default();
    let price_monitor = Arc::new(PriceMonitor::new(
        system_monitor.clone(),
        Arc::new(HttpPriceFetcher::new(reference_primary_url.clone(), 0.6)) as Arc<dyn PriceFetcher>,
        Arc::new(HttpPriceFetcher::new(reference_backup_url.clone(), 0.5)) as Arc<dyn PriceFetcher>,
        Arc::new(HttpPriceFetcher::new(reference_primary_url, 0.9)) as Arc<dyn PriceFetcher>,
        Arc::new(HttpPriceFetcher::new(reference_backup_url, 0.7)) as Arc<dyn PriceFetcher>,
        PriceMonitorConfig {
            interval_secs: config.get("PRICEMONITOR_INTERVAL").and_then(|v| v.as_f64()).unwrap_or(30.0),
            reference_ttl_secs: config.get("SOL_PRICE_CACHE_DURATION").and_then(|v| v.as_f64()).unwrap_or(300.0),
            max_history: config.get("MAX_PRICE_HISTORY").and_then(|v| v.as_u64()).unwrap_or(100) as usize,
            reference_fallback_price: reference_price,
        },
    ));
    let _price_poll_loop = price_monitor.spawn_poll_loop(cancel.clone());

    let sink_task = {
        let price_monitor = price_monitor.clone();
        let system_monitor = system_monitor.clone();
        tokio::spawn(async move {
            while let Some(event) = sink_rx.recv().await {
                match &event {
                    BlockchainEvent::Swap { swap_info, price, base, .. } => {
                        if let (Some(mint), Some(p)) = (base.pool_address.clone(), *price) {
                            price_monitor.push_blockchain_price(&mint, p, base.dex_kind, swap_info.parsing_confidence);
                        }
                    }
                    BlockchainEvent::AccountUpdate { price, base, .. } => {
                        if let (Some(mint), Some(p)) = (base.pool_address.clone(), *price) {
                            price_monitor.push_blockchain_price(&mint, p, base.dex_kind, 0.7);
                        }
                    }
                    BlockchainEvent::PoolCreation { creation_metadata, .. } => {
                        info!(pool = %creation_metadata.pool_address, "new pool observed");
                    }
                    BlockchainEvent::Unhandled { reason, .. } => {
                        warn!(?reason, "unhandled event");
                    }
                    BlockchainEvent::LogNotification { .. } => {}
                }
                system_monitor.increment_counter("sink_events_consumed", 1);
            }
        })
    };

    let watched = parse_watched_pools(&env::var("WATCHED_POOLS").unwrap_or_default());
    if watched.is_empty() {
        warn!("WATCHED_POOLS is empty; connection manager is idle");
    }

    let mut request_id = 1u64;
    for target in watched {
        request_id += 1;
        if let Err(e) = subscribe_pool(
            connection_manager.clone(),
            subscriptions.clone(),
            dispatcher.clone(),
            system_monitor.clone(),
            request_id,
            target,
        )
        .await
        {
            error!(error = %e, "failed to establish subscription");
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    cancel.cancel();
    sink_task.abort();
    Ok(())
}

#[derive(Debug, Clone)]
struct WatchedPool {
    program_id: String,
    pool_address: String,
    dex_kind: DexKind,
}

/// Parses `WATCHED_POOLS` as a comma-separated `dex_kind:pool_address` list.
/// Empty or absent means the pipeline starts up idle rather than failing.
fn parse_watched_pools(raw: &str) -> Vec<WatchedPool> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(2, ':');
            let kind = parts.next()?.trim();
            let pool_address = parts.next()?.trim().to_string();
            let dex_kind = match kind {
                "constant_product" => DexKind::ConstantProduct,
                "concentrated_liquidity" => DexKind::ConcentratedLiquidity,
                other => {
                    warn!(kind = other, "unrecognized dex kind in WATCHED_POOLS, skipping");
                    return None;
                }
            };
            Some(WatchedPool { program_id: dex_kind.program_id().to_string(), pool_address, dex_kind })
        })
        .collect()
}

/// Establishes (or reuses) the connection for a pool's program id, sends the
/// `logsSubscribe` request, awaits confirmation, and binds the resulting
/// subscription id. The per-connection read loop is spawned exactly once per
/// connection — `Connection::take_frames` returns `None` on every call after
/// the first, which signals a reader is already forwarding frames for pools
/// sharing that program id.
async fn subscribe_pool(
    connection_manager: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    system_monitor: Arc<SystemMonitor>,
    request_id: u64,
    target: WatchedPool,
) -> Result<()> {
    let conn = connection_manager.ensure_connection(&target.program_id).await?;

    let handle = subscriptions.register_pending(request_id);
    let payload = dispatcher.subscribe_request(request_id, "logsSubscribe", &target.pool_address, target.dex_kind, SubscriptionKind::Logs);
    conn.send_text(payload).await?;

    let outcome = handle.await_outcome().await?;
    if let PendingOutcome::Success { subscription_id } = outcome {
        subscriptions.bind(subscription_id, request_id, target.pool_address.clone(), target.dex_kind, SubscriptionKind::Logs, target.program_id.clone());
        info!(pool = %target.pool_address, subscription_id, "subscription confirmed");
    }

    if let Some(mut frames) = conn.take_frames().await {
        let program_id = target.program_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                dispatcher.dispatch_message(&frame, &program_id).await;
                system_monitor.increment_counter("frames_processed", 1);
            }
            warn!(%program_id, "frame stream ended");
        });
    }

    Ok(())
}
