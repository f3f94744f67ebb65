//! Price Monitor & Aggregator (§4.5): a uniform `current_price` surface over
//! three sources — blockchain-derived pushes from the dispatcher, smart-routed
//! REST polling, and a TTL-cached reference-currency quote. Grounded on the
//! parent infrastructure's `realtime_price_monitor.rs` (bounded cache-by-mint,
//! `update_price`/`get_all_prices` shape) and `jupiter_rate_limiter.rs` (the
//! `reqwest::Client` request pattern this module's REST fetchers follow).
//! Never surfaces a source error to its caller: `current_price` degrades to
//! `None` or a stale cached value instead.

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{now_ts, DexKind, PriceRecord, PriceSource};
use crate::monitor::SystemMonitor;

/// A quote returned by a REST price source.
#[derive(Debug, Clone)]
pub struct RestQuote {
    pub price: f64,
    pub confidence: f64,
}

/// Object-safe async fetcher, standing in for `#[async_trait]` with a manual
/// boxed future — the crate has no other use for `async_trait` so this keeps
/// the dependency list lean.
pub trait PriceFetcher: Send + Sync {
    fn fetch<'a>(&'a self, mint: &'a str) -> BoxFuture<'a, anyhow::Result<RestQuote>>;
}

/// Queries a REST endpoint of the shape `GET {base_url}?ids={mint}` returning
/// `{"data": {"<mint>": {"price": <f64>}}}`, the common shape across
/// aggregator-style price APIs (Jupiter's `price` endpoint among them).
pub struct HttpPriceFetcher {
    client: reqwest::Client,
    base_url: String,
    confidence: f64,
}

impl HttpPriceFetcher {
    pub fn new(base_url: impl Into<String>, confidence: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .build()
            .expect("failed to build REST price client");
        Self { client, base_url: base_url.into(), confidence }
    }
}

impl PriceFetcher for HttpPriceFetcher {
    fn fetch<'a>(&'a self, mint: &'a str) -> BoxFuture<'a, anyhow::Result<RestQuote>> {
        Box::pin(async move {
            let response = self.client.get(&self.base_url).query(&[("ids", mint)]).send().await?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("price source {} returned {status}", self.base_url);
            }
            let body: serde_json::Value = response.json().await?;
            let price = body
                .get("data")
                .and_then(|d| d.get(mint))
                .and_then(|m| m.get("price"))
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| anyhow::anyhow!("no price field in response from {}", self.base_url))?;
            Ok(RestQuote { price, confidence: self.confidence })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteChoice {
    PoolNative,
    Generalist,
}

#[derive(Debug, Clone)]
struct CachedPrice {
    record: PriceRecord,
    fetched_at: f64,
}

#[derive(Debug, Default)]
pub struct PriceStatsSnapshot {
    pub primary_requests: u64,
    pub secondary_requests: u64,
    pub fallback_requests: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub last_update_time: f64,
}

#[derive(Default)]
struct Stats {
    primary_requests: AtomicU64,
    secondary_requests: AtomicU64,
    fallback_requests: AtomicU64,
    successful_updates: AtomicU64,
    failed_updates: AtomicU64,
    last_update_time_bits: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> PriceStatsSnapshot {
        PriceStatsSnapshot {
            primary_requests: self.primary_requests.load(Ordering::Relaxed),
            secondary_requests: self.secondary_requests.load(Ordering::Relaxed),
            fallback_requests: self.fallback_requests.load(Ordering::Relaxed),
            successful_updates: self.successful_updates.load(Ordering::Relaxed),
            failed_updates: self.failed_updates.load(Ordering::Relaxed),
            last_update_time: f64::from_bits(self.last_update_time_bits.load(Ordering::Relaxed)),
        }
    }

    fn mark_success(&self) {
        self.successful_updates.fetch_add(1, Ordering::Relaxed);
        self.last_update_time_bits.store(now_ts().to_bits(), Ordering::Relaxed);
    }
}

pub struct PriceMonitorConfig {
    pub interval_secs: f64,
    pub reference_ttl_secs: f64,
    pub max_history: usize,
    pub reference_fallback_price: f64,
}

impl Default for PriceMonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30.0,
            reference_ttl_secs: 300.0,
            max_history: 100,
            reference_fallback_price: 150.0,
        }
    }
}

/// Per-mint routing, caching, and merging. The routed REST sources are
/// pluggable (`Arc<dyn PriceFetcher>`) so tests substitute deterministic
/// fakes instead of making network calls.
pub struct PriceMonitor {
    monitor: Arc<SystemMonitor>,
    pool_native: Arc<dyn PriceFetcher>,
    generalist: Arc<dyn PriceFetcher>,
    reference_primary: Arc<dyn PriceFetcher>,
    reference_backup: Arc<dyn PriceFetcher>,
    cache: RwLock<HashMap<String, CachedPrice>>,
    reference_cache: RwLock<Option<CachedPrice>>,
    routes: RwLock<HashMap<String, RouteChoice>>,
    history: Mutex<HashMap<String, VecDeque<PriceRecord>>>,
    stats: Stats,
    config: PriceMonitorConfig,
}

impl PriceMonitor {
    pub fn new(
        monitor: Arc<SystemMonitor>,
        pool_native: Arc<dyn PriceFetcher>,
        generalist: Arc<dyn PriceFetcher>,
        reference_primary: Arc<dyn PriceFetcher>,
        reference_backup: Arc<dyn PriceFetcher>,
        config: PriceMonitorConfig,
    ) -> Self {
        Self {
            monitor,
            pool_native,
            generalist,
            reference_primary,
            reference_backup,
            cache: RwLock::new(HashMap::new()),
            reference_cache: RwLock::new(None),
            routes: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            stats: Stats::default(),
            config,
        }
    }

    /// First resolution per mint caches the route: constant-product pools
    /// with a native quote endpoint route there; everything else (including
    /// concentrated-liquidity pools, which have no native REST quote in this
    /// design) routes to the generalist aggregator.
    fn route_for(&self, mint: &str, dex_kind: Option<DexKind>) -> RouteChoice {
        if let Some(choice) = self.routes.read().get(mint) {
            return *choice;
        }
        let choice = match dex_kind {
            Some(DexKind::ConstantProduct) => RouteChoice::PoolNative,
            _ => RouteChoice::Generalist,
        };
        self.routes.write().insert(mint.to_string(), choice);
        choice
    }

    /// Manual override, e.g. from configuration.
    pub fn override_route_to_generalist(&self, mint: &str) {
        self.routes.write().insert(mint.to_string(), RouteChoice::Generalist);
    }

    /// Pushed by the dispatcher/event router when an account-update or swap
    /// yields a fresh on-chain price. Blockchain prices always win the merge
    /// against a same-confidence REST poll (see `merge`).
    pub fn push_blockchain_price(&self, mint: &str, price: f64, dex_kind: Option<DexKind>, confidence: f64) {
        if price <= 0.0 {
            return;
        }
        let record = PriceRecord {
            mint: mint.to_string(),
            price_in_base_asset: price,
            price_in_reference_currency: None,
            source: PriceSource::Blockchain,
            dex_kind,
            ts: now_ts(),
            confidence,
            volume: None,
        };
        self.store(mint, record);
    }

    fn store(&self, mint: &str, candidate: PriceRecord) {
        let merged = {
            let cache = self.cache.read();
            match cache.get(mint) {
                Some(existing) => merge(&existing.record, candidate),
                None => candidate,
            }
        };
        self.cache.write().insert(mint.to_string(), CachedPrice { record: merged.clone(), fetched_at: now_ts() });
        self.push_history(mint, merged);
        self.stats.mark_success();
    }

    fn push_history(&self, mint: &str, record: PriceRecord) {
        let mut history = self.history.lock();
        let ring = history.entry(mint.to_string()).or_default();
        ring.push_back(record);
        while ring.len() > self.config.max_history {
            ring.pop_front();
        }
    }

    /// Never throws. Returns the cached base-asset price if fresh enough;
    /// otherwise attempts a routed REST refresh, falling back to the
    /// secondary source on failure; if both fail, returns whatever is cached
    /// (however stale) or `None`.
    pub async fn current_price(&self, mint: &str, max_age: Duration) -> Option<f64> {
        let dex_kind = self.cache.read().get(mint).and_then(|c| c.record.dex_kind);
        if let Some(cached) = self.cache.read().get(mint) {
            if now_ts() - cached.fetched_at <= max_age.as_secs_f64() {
                return Some(cached.record.price_in_base_asset);
            }
        }

        let route = self.route_for(mint, dex_kind);
        let primary: &Arc<dyn PriceFetcher> = match route {
            RouteChoice::PoolNative => &self.pool_native,
            RouteChoice::Generalist => &self.generalist,
        };

        self.stats.primary_requests.fetch_add(1, Ordering::Relaxed);
        match primary.fetch(mint).await {
            Ok(quote) => {
                self.store(mint, rest_record(mint, quote, dex_kind, PriceSource::RestPrimary));
                return self.cache.read().get(mint).map(|c| c.record.price_in_base_asset);
            }
            Err(e) => {
                warn!(%mint, error = %e, "primary price source failed, falling back");
            }
        }

        self.stats.fallback_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.secondary_requests.fetch_add(1, Ordering::Relaxed);
        match self.generalist.fetch(mint).await {
            Ok(quote) => {
                self.store(mint, rest_record(mint, quote, dex_kind, PriceSource::RestSecondary));
                self.cache.read().get(mint).map(|c| c.record.price_in_base_asset)
            }
            Err(e) => {
                self.stats.failed_updates.fetch_add(1, Ordering::Relaxed);
                warn!(%mint, error = %e, "secondary price source also failed");
                self.cache.read().get(mint).map(|c| c.record.price_in_base_asset)
            }
        }
    }

    /// Longer-TTL reference-currency (e.g. native-token-to-fiat) price, with
    /// its own primary/backup pair and a configurable hardcoded fallback
    /// when both sources and the cache are unavailable.
    pub async fn reference_currency_price(&self) -> f64 {
        if let Some(cached) = self.reference_cache.read().as_ref() {
            if now_ts() - cached.fetched_at <= self.config.reference_ttl_secs {
                return cached.record.price_in_base_asset;
            }
        }

        self.stats.primary_requests.fetch_add(1, Ordering::Relaxed);
        let result = match self.reference_primary.fetch("reference").await {
            Ok(quote) => Some(quote),
            Err(e) => {
                warn!(error = %e, "reference currency primary source failed");
                self.stats.fallback_requests.fetch_add(1, Ordering::Relaxed);
                self.stats.secondary_requests.fetch_add(1, Ordering::Relaxed);
                self.reference_backup.fetch("reference").await.ok()
            }
        };

        match result {
            Some(quote) => {
                let record = PriceRecord {
                    mint: "reference".to_string(),
                    price_in_base_asset: quote.price,
                    price_in_reference_currency: None,
                    source: PriceSource::RestPrimary,
                    dex_kind: None,
                    ts: now_ts(),
                    confidence: quote.confidence,
                    volume: None,
                };
                self.stats.mark_success();
                let price = record.price_in_base_asset;
                *self.reference_cache.write() = Some(CachedPrice { record, fetched_at: now_ts() });
                price
            }
            None => {
                self.stats.failed_updates.fetch_add(1, Ordering::Relaxed);
                self.reference_cache
                    .read()
                    .as_ref()
                    .map(|c| c.record.price_in_base_asset)
                    .unwrap_or(self.config.reference_fallback_price)
            }
        }
    }

    pub fn stats(&self) -> PriceStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn history(&self, mint: &str) -> Vec<PriceRecord> {
        self.history.lock().get(mint).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn health(&self) -> crate::monitor::HealthStatus {
        let snapshot = self.stats.snapshot();
        let total = snapshot.successful_updates + snapshot.failed_updates;
        if total == 0 {
            crate::monitor::HealthStatus::Initializing
        } else if snapshot.failed_updates as f64 / total as f64 > 0.5 {
            crate::monitor::HealthStatus::Degraded
        } else {
            crate::monitor::HealthStatus::Healthy
        }
    }

    /// Background poller task per §5 ("one per mint-polling batch"): refreshes
    /// every tracked mint on a fixed interval so `current_price` rarely blocks
    /// on a live fetch.
    pub fn spawn_poll_loop(self: &Arc<Self>, cancel: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_secs_f64(monitor.config.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mints: Vec<String> = monitor.cache.read().keys().cloned().collect();
                        debug!(count = mints.len(), "price monitor poll tick");
                        for mint in mints {
                            let _ = monitor.current_price(&mint, Duration::from_secs_f64(monitor.config.interval_secs)).await;
                        }
                        monitor.monitor.update_component_health("price_monitor", monitor.health(), HashMap::new());
                    }
                }
            }
        })
    }
}

fn rest_record(mint: &str, quote: RestQuote, dex_kind: Option<DexKind>, source: PriceSource) -> PriceRecord {
    PriceRecord {
        mint: mint.to_string(),
        price_in_base_asset: quote.price,
        price_in_reference_currency: None,
        source,
        dex_kind,
        ts: now_ts(),
        confidence: quote.confidence,
        volume: None,
    }
}

/// Highest confidence wins; ties (within floating-point epsilon) broken by
/// recency. A same-confidence blockchain update still wins over a REST poll
/// because its `ts` is set at observation time, which is always >= the
/// REST source's.
fn merge(existing: &PriceRecord, candidate: PriceRecord) -> PriceRecord {
    const EPSILON: f64 = 1e-9;
    if candidate.confidence > existing.confidence + EPSILON {
        candidate
    } else if existing.confidence > candidate.confidence + EPSILON {
        existing.clone()
    } else if candidate.ts >= existing.ts {
        candidate
    } else {
        existing.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Thresholds;

    struct FixedFetcher {
        result: Result<RestQuote, String>,
    }

    impl PriceFetcher for FixedFetcher {
        fn fetch<'a>(&'a self, _mint: &'a str) -> BoxFuture<'a, anyhow::Result<RestQuote>> {
            let result = self.result.clone();
            Box::pin(async move { result.map_err(|e| anyhow::anyhow!(e)) })
        }
    }

    fn monitor_with(primary_fails: bool, secondary_price: f64, secondary_confidence: f64) -> PriceMonitor {
        let sys_monitor = Arc::new(SystemMonitor::new(Thresholds::default(), 50));
        let pool_native: Arc<dyn PriceFetcher> = Arc::new(FixedFetcher {
            result: if primary_fails { Err("HTTP 500".to_string()) } else { Ok(RestQuote { price: 1.0, confidence: 0.6 }) },
        });
        let generalist: Arc<dyn PriceFetcher> = Arc::new(FixedFetcher { result: Ok(RestQuote { price: secondary_price, confidence: secondary_confidence }) });
        let reference_primary: Arc<dyn PriceFetcher> = Arc::new(FixedFetcher { result: Ok(RestQuote { price: 150.0, confidence: 0.9 }) });
        let reference_backup: Arc<dyn PriceFetcher> = Arc::new(FixedFetcher { result: Ok(RestQuote { price: 149.0, confidence: 0.7 }) });
        PriceMonitor::new(sys_monitor, pool_native, generalist, reference_primary, reference_backup, PriceMonitorConfig::default())
    }

    #[tokio::test]
    async fn scenario_s6_degraded_primary_falls_back_to_secondary() {
        let monitor = monitor_with(true, 0.42, 0.8);
        let price = monitor.current_price("M", Duration::from_secs(0)).await;
        assert_eq!(price, Some(0.42));
        let stats = monitor.stats();
        assert_eq!(stats.fallback_requests, 1);
        assert_eq!(monitor.health(), crate::monitor::HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn fresh_cache_entry_short_circuits_rest_fetch() {
        let monitor = monitor_with(false, 0.5, 0.5);
        monitor.push_blockchain_price("M", 2.0, Some(DexKind::ConstantProduct), 0.95);
        let price = monitor.current_price("M", Duration::from_secs(600)).await;
        assert_eq!(price, Some(2.0));
        assert_eq!(monitor.stats().primary_requests, 0);
    }

    #[test]
    fn merge_prefers_higher_confidence_then_recency() {
        let older = PriceRecord {
            mint: "M".to_string(),
            price_in_base_asset: 1.0,
            price_in_reference_currency: None,
            source: PriceSource::RestPrimary,
            dex_kind: None,
            ts: 100.0,
            confidence: 0.5,
            volume: None,
        };
        let newer_lower_confidence = PriceRecord { ts: 200.0, confidence: 0.3, price_in_base_asset: 2.0, ..older.clone() };
        assert_eq!(merge(&older, newer_lower_confidence).price_in_base_asset, 1.0);

        let equal_confidence_newer = PriceRecord { ts: 300.0, confidence: 0.5, price_in_base_asset: 3.0, ..older.clone() };
        assert_eq!(merge(&older, equal_confidence_newer).price_in_base_asset, 3.0);
    }

    #[tokio::test]
    async fn history_ring_bounded_by_max_history() {
        let monitor = monitor_with(false, 1.0, 0.5);
        for i in 0..150 {
            monitor.push_blockchain_price("M", 1.0 + i as f64, Some(DexKind::ConstantProduct), 0.9);
        }
        assert_eq!(monitor.history("M").len(), 100);
    }
}
