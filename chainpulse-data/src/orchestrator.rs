//! Fan-out of one independent fetch per [`Category`] into a single [`AggregateView`].
//!
//! Each category fetch runs `cache -> provider (retried) -> validate -> analytics -> cache`.
//! A category that cannot be fetched degrades to its fallback bundle and never blocks or
//! poisons the others. Results are published through the [`DashboardStore`] as soon as each
//! category settles.

use crate::{
    cache::CacheStore,
    config::{DataConfig, MAX_AUTO_REFRESH_INTERVAL},
    error::DataError,
    fallback,
    history::{HistoryKey, PaginatedHistory},
    model::{
        AiAnalysis, CacheInfo, CashflowMetrics, Category, CategoryBundle, CategoryMetrics,
        DataSource, MarketOverview, NetworkId, Timeframe, TvlMetrics, UsageMetrics,
    },
    provider::{CategoryProvider, HistoryProvider},
    retry::RetryController,
    store::{AggregateView, DashboardStore},
    validate,
};
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cache key of a category bundle: `{network}/{category}-{timeframe}`.
pub fn category_key(network: &NetworkId, category: Category, timeframe: Timeframe) -> String {
    format!("{network}/{category}-{timeframe}")
}

/// Regex matching every cache entry scoped to `(network, timeframe)`: category bundles and
/// history pages alike.
pub fn scope_pattern(network: &NetworkId, timeframe: Timeframe) -> Result<Regex, DataError> {
    Regex::new(&format!(
        "^{}/[^/]+-{}(-page-\\d+)?$",
        regex::escape(network),
        regex::escape(&timeframe.to_string())
    ))
    .map_err(|error| DataError::Cache(error.to_string()))
}

/// Loads every [`Category`] for a (network, timeframe) pair and keeps the result fresh.
#[derive(Debug)]
pub struct MetricsOrchestrator<Provider> {
    provider: Provider,
    cache: Arc<CacheStore>,
    config: DataConfig,
    store: DashboardStore,
    target: Mutex<Option<(NetworkId, Timeframe)>>,
    request: Mutex<CancellationToken>,
    lifetime: CancellationToken,
    refresh_generation: AtomicU64,
}

impl<Provider> MetricsOrchestrator<Provider>
where
    Provider: CategoryProvider,
{
    pub fn new(provider: Provider, config: DataConfig) -> Self {
        Self::with_cache(provider, Arc::new(CacheStore::new()), config)
    }

    /// Construct an orchestrator sharing an existing [`CacheStore`].
    pub fn with_cache(provider: Provider, cache: Arc<CacheStore>, config: DataConfig) -> Self {
        let lifetime = CancellationToken::new();
        Self {
            provider,
            cache,
            config,
            store: DashboardStore::new(NetworkId::default(), Timeframe::default()),
            target: Mutex::new(None),
            request: Mutex::new(lifetime.child_token()),
            lifetime,
            refresh_generation: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn store(&self) -> &DashboardStore {
        &self.store
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<AggregateView> {
        self.store.subscribe()
    }

    pub fn view(&self) -> AggregateView {
        self.store.view()
    }

    /// (network, timeframe) of the most recent [`load`](Self::load), if any.
    pub fn target(&self) -> Option<(NetworkId, Timeframe)> {
        self.target.lock().clone()
    }

    /// Construct a [`PaginatedHistory`] sharing this orchestrator's cache and configuration.
    pub fn history<History>(&self, provider: History, key: HistoryKey) -> PaginatedHistory<History>
    where
        History: HistoryProvider,
    {
        PaginatedHistory::new(key, provider, Arc::clone(&self.cache), &self.config)
    }

    /// Load every category for `(network, timeframe)`, superseding any in-flight load.
    ///
    /// Always resolves to a complete view. `is_error` is only set if the orchestrator is shut
    /// down before the load completes.
    pub async fn load(&self, network: NetworkId, timeframe: Timeframe) -> AggregateView {
        let token = self.begin_request();
        *self.target.lock() = Some((network.clone(), timeframe));
        self.store.begin_cycle(network.clone(), timeframe);

        info!(%network, %timeframe, "loading dashboard metrics");
        let started = Instant::now();

        tokio::join!(
            async {
                if let Some((bundle, info)) = self
                    .fetch_category::<UsageMetrics>(&network, timeframe, &token)
                    .await
                {
                    self.store.set_usage_metrics(bundle, info);
                }
            },
            async {
                if let Some((bundle, info)) = self
                    .fetch_category::<TvlMetrics>(&network, timeframe, &token)
                    .await
                {
                    self.store.set_tvl_metrics(bundle, info);
                }
            },
            async {
                if let Some((bundle, info)) = self
                    .fetch_category::<CashflowMetrics>(&network, timeframe, &token)
                    .await
                {
                    self.store.set_cashflow_metrics(bundle, info);
                }
            },
            async {
                if let Some((bundle, info)) = self
                    .fetch_category::<MarketOverview>(&network, timeframe, &token)
                    .await
                {
                    self.store.set_market_overview(bundle, info);
                }
            },
            async {
                if let Some((bundle, info)) = self
                    .fetch_category::<AiAnalysis>(&network, timeframe, &token)
                    .await
                {
                    self.store.set_ai_analysis(bundle, info);
                }
            },
        );

        if token.is_cancelled() {
            if self.lifetime.is_cancelled() {
                error!(%network, %timeframe, "orchestrator shut down before load completed");
                self.store
                    .set_error("orchestrator shut down before the load completed");
            } else {
                debug!(%network, %timeframe, "load superseded by a newer request");
            }
            return self.store.view();
        }

        self.store.set_loading(false);
        let view = self.store.view();

        info!(
            %network,
            %timeframe,
            degraded = view.is_degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dashboard metrics loaded"
        );
        view
    }

    /// Invalidate the cached data of the current pair and reload it.
    ///
    /// Trailing-edge debounced: calls arriving within the configured debounce window collapse
    /// into a single refresh performed by the last caller. Superseded callers, and calls made
    /// before any [`load`](Self::load), resolve to `None`.
    pub async fn refresh(&self) -> Option<AggregateView> {
        let generation = self.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => return None,
            _ = tokio::time::sleep(self.config.refresh_debounce) => {}
        }

        if self.refresh_generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "refresh collapsed into a later request");
            return None;
        }

        let (network, timeframe) = self.target()?;
        Some(self.invalidate_and_load(network, timeframe).await)
    }

    /// Start the periodic background refresh of the current pair.
    ///
    /// The task stops when the returned [`RefreshHandle`] is stopped or dropped, or when the
    /// orchestrator is shut down.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> RefreshHandle
    where
        Provider: 'static,
    {
        let token = self.lifetime.child_token();
        let period = self
            .config
            .auto_refresh_interval
            .clamp(Duration::from_millis(1), MAX_AUTO_REFRESH_INTERVAL);
        let orchestrator = Arc::clone(self);
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "auto refresh started");
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some((network, timeframe)) = orchestrator.target() else {
                    continue;
                };

                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        orchestrator.store.set_loading(false);
                        break;
                    }
                    _ = orchestrator.invalidate_and_load(network, timeframe) => {}
                }
            }

            info!("auto refresh stopped");
        });

        RefreshHandle { token, task }
    }

    /// Cancel every in-flight and future request (consumer unmount).
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.lifetime.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    async fn invalidate_and_load(&self, network: NetworkId, timeframe: Timeframe) -> AggregateView {
        match scope_pattern(&network, timeframe) {
            Ok(pattern) => {
                let removed = self.cache.delete_by_pattern(&pattern);
                debug!(%network, %timeframe, removed, "cache invalidated for refresh");
            }
            Err(error) => warn!(%network, %timeframe, %error, "failed to build invalidation pattern"),
        }

        self.load(network, timeframe).await
    }

    /// Fetch one category, resolving to `None` if the request was cancelled.
    async fn fetch_category<M>(
        &self,
        network: &NetworkId,
        timeframe: Timeframe,
        token: &CancellationToken,
    ) -> Option<(CategoryBundle<M>, CacheInfo)>
    where
        M: CategoryMetrics,
    {
        let key = category_key(network, M::CATEGORY, timeframe);

        let outcome = match self.cache.get::<CategoryBundle<M>>(&key) {
            Some(bundle) => {
                debug!(%key, "category served from cache");
                let info = self.cache.entry_info(&key);
                Some((
                    CategoryBundle {
                        source: DataSource::Cache,
                        ..bundle
                    },
                    CacheInfo {
                        hit: true,
                        timestamp: info.map(|info| info.timestamp),
                        size: info.map(|info| info.size),
                    },
                ))
            }
            None => self.fetch_live::<M>(network, timeframe, &key, token).await,
        };

        outcome.filter(|_| !token.is_cancelled())
    }

    async fn fetch_live<M>(
        &self,
        network: &NetworkId,
        timeframe: Timeframe,
        key: &str,
        token: &CancellationToken,
    ) -> Option<(CategoryBundle<M>, CacheInfo)>
    where
        M: CategoryMetrics,
    {
        let provider = &self.provider;

        let result = RetryController::new(self.config.retry, token.clone())
            .run(move |attempt| async move {
                debug!(category = %M::CATEGORY, %network, attempt, "fetching category");
                let raw = provider
                    .fetch_category(network, timeframe, M::CATEGORY)
                    .await?;
                validate::category_bundle::<M>(network, timeframe, &raw, Utc::now())
            })
            .await;

        match result {
            Ok(bundle) => {
                let bundle = bundle.with_analytics(self.config.spike_threshold_percent);

                if let Err(error) = self.cache.set(key, &bundle, M::CATEGORY.cache_ttl()) {
                    warn!(%key, %error, "failed to cache category bundle");
                }
                let info = self.cache.entry_info(key);

                Some((
                    bundle,
                    CacheInfo {
                        hit: false,
                        timestamp: info.map(|info| info.timestamp),
                        size: info.map(|info| info.size),
                    },
                ))
            }
            Err(DataError::Aborted) => None,
            Err(error) => {
                warn!(
                    category = %M::CATEGORY,
                    %network,
                    %timeframe,
                    %error,
                    "category fetch failed, serving fallback"
                );
                Some((
                    fallback::synthesize_with_diagnostic(network, timeframe, error.to_string()),
                    CacheInfo::default(),
                ))
            }
        }
    }

    /// Cancel the current request and hand out a fresh token for a new one.
    fn begin_request(&self) -> CancellationToken {
        let token = self.lifetime.child_token();
        let previous = std::mem::replace(&mut *self.request.lock(), token.clone());
        previous.cancel();
        token
    }
}

impl<Provider> Drop for MetricsOrchestrator<Provider> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Handle to a periodic refresh task started by
/// [`MetricsOrchestrator::spawn_auto_refresh`]. Dropping the handle stops the task.
#[derive(Debug)]
pub struct RefreshHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.task.is_finished()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Err(error) = (&mut self.task).await {
            warn!(%error, "auto refresh task failed");
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Trend, retry::RetryPolicy, stats::SeriesSummary};
    use async_trait::async_trait;
    use fnv::FnvHashMap;
    use serde_json::{Map, Value, json};

    #[derive(Debug, Clone)]
    enum Behaviour {
        Fail(DataError),
        Malformed,
    }

    #[derive(Debug, Default)]
    struct MockProvider {
        behaviour: Mutex<FnvHashMap<Category, Behaviour>>,
        delay: Duration,
        calls: Mutex<Vec<(Category, Timeframe)>>,
    }

    impl MockProvider {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn set(&self, category: Category, behaviour: Behaviour) {
            self.behaviour.lock().insert(category, behaviour);
        }

        fn calls(&self, category: Category) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|(called, _)| *called == category)
                .count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    fn payload(category: Category) -> Value {
        let mut payload: Map<String, Value> = category
            .metrics()
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    json!({ "value": 100.0, "change": 2.0, "changePercent": 2.0 }),
                )
            })
            .collect();

        let series: Vec<Value> = (1..=8)
            .map(|day| {
                json!({
                    "timestamp": format!("2026-10-{day:02}T00:00:00Z"),
                    "value": if day == 8 { 130.0 } else { 100.0 },
                })
            })
            .collect();
        payload.insert(
            "series".to_string(),
            json!({ category.metrics()[0]: series }),
        );

        Value::Object(payload)
    }

    #[async_trait]
    impl CategoryProvider for MockProvider {
        async fn fetch_category(
            &self,
            _: &NetworkId,
            timeframe: Timeframe,
            category: Category,
        ) -> Result<Value, DataError> {
            self.calls.lock().push((category, timeframe));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let behaviour = self.behaviour.lock().get(&category).cloned();
            match behaviour {
                None => Ok(payload(category)),
                Some(Behaviour::Fail(error)) => Err(error),
                Some(Behaviour::Malformed) => Ok(json!({ "unexpected": true })),
            }
        }
    }

    fn orchestrator(provider: &Arc<MockProvider>) -> Arc<MetricsOrchestrator<Arc<MockProvider>>> {
        Arc::new(MetricsOrchestrator::new(
            Arc::clone(provider),
            DataConfig::default(),
        ))
    }

    fn ethereum() -> NetworkId {
        NetworkId::new("ethereum")
    }

    #[test]
    fn test_cache_keys_and_scope_pattern() {
        assert_eq!(
            category_key(&ethereum(), Category::Usage, Timeframe::Month),
            "ethereum/usage-30D"
        );

        let pattern = scope_pattern(&ethereum(), Timeframe::Month).unwrap();
        assert!(pattern.is_match("ethereum/usage-30D"));
        assert!(pattern.is_match("ethereum/activeAddresses-30D-page-3"));
        assert!(!pattern.is_match("ethereum/usage-7D"));
        assert!(!pattern.is_match("solana/usage-30D"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_all_categories_live() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = orchestrator(&provider);

        let view = orchestrator.load(ethereum(), Timeframe::Month).await;

        assert!(!view.is_loading);
        assert!(!view.is_error);
        assert!(!view.is_degraded);
        assert_eq!(view.usage.source, DataSource::Live);
        assert_eq!(view.ai.source, DataSource::Live);
        assert_eq!(view.usage.metrics.active_addresses.value, Some(100.0));
        assert!(Category::ALL.iter().all(|category| !view.cache_info[category].hit));
        assert_eq!(orchestrator.cache().len(), Category::ALL.len());

        // Analytics cover every metric; the series carries a +30% final sample
        assert_eq!(view.usage.rolling_averages.len(), 4);
        assert!(view.usage.rolling_averages["activeAddresses"].d7.is_some());
        assert!(view.usage.spikes["activeAddresses"].is_spike);
        assert!(!view.usage.spikes["gasUsed"].is_spike);

        let summary = view.usage.summaries["activeAddresses"];
        assert_eq!(summary.total, 830.0);
        assert_eq!(summary.max, 130.0);
        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.trend, Trend::Up);
        assert_eq!(view.usage.summaries.len(), 4);
        assert_eq!(view.usage.summaries["gasUsed"], SeriesSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_load_is_served_from_cache() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = orchestrator(&provider);

        orchestrator.load(ethereum(), Timeframe::Month).await;
        let view = orchestrator.load(ethereum(), Timeframe::Month).await;

        assert_eq!(provider.total_calls(), Category::ALL.len());
        assert_eq!(view.market.source, DataSource::Cache);
        assert!(view.cache_info[&Category::Market].hit);
        assert!(view.cache_info[&Category::Market].size.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_category_degrades_to_fallback() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        provider.set(
            Category::Tvl,
            Behaviour::Fail(DataError::Network("HTTP error: 500".to_string())),
        );
        provider.set(Category::Ai, Behaviour::Malformed);
        let orchestrator = orchestrator(&provider);

        let view = orchestrator.load(ethereum(), Timeframe::Month).await;

        assert!(!view.is_error);
        assert!(view.is_degraded);
        assert!(view.tvl.is_fallback());
        assert!(view.ai.is_fallback());
        assert_eq!(view.usage.source, DataSource::Live);
        assert!(view.error.as_deref().unwrap().starts_with("tvl: retries exhausted"));

        // Network failures use the full retry budget, validation failures none
        assert_eq!(provider.calls(Category::Tvl), 3);
        assert_eq!(provider.calls(Category::Ai), 1);

        // Fallback bundles are never cached
        assert_eq!(orchestrator.cache().len(), 3);
        orchestrator.load(ethereum(), Timeframe::Month).await;
        assert_eq!(provider.calls(Category::Tvl), 6);
        assert_eq!(provider.calls(Category::Usage), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_debounced_and_invalidates() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = orchestrator(&provider);
        assert_eq!(orchestrator.refresh().await, None);

        orchestrator.load(ethereum(), Timeframe::Month).await;

        let (first, second, third) = tokio::join!(
            orchestrator.refresh(),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                orchestrator.refresh().await
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                orchestrator.refresh().await
            },
        );

        assert_eq!(first, None);
        assert_eq!(second, None);
        let view = third.unwrap();
        assert_eq!(view.usage.source, DataSource::Live);
        assert_eq!(provider.total_calls(), 2 * Category::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_load_supersedes_older() {
        let provider = MockProvider::with_delay(Duration::from_millis(100));
        let orchestrator = orchestrator(&provider);

        let (first, second) = tokio::join!(
            orchestrator.load(ethereum(), Timeframe::Month),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                orchestrator.load(ethereum(), Timeframe::Week).await
            },
        );

        assert!(!first.is_error);
        assert_eq!(second.timeframe, Timeframe::Week);
        assert_eq!(second.usage.timeframe, Timeframe::Week);
        assert_eq!(second.usage.source, DataSource::Live);
        assert!(!second.is_loading);

        // The superseded load never wrote its cache entries
        assert!(orchestrator
            .cache()
            .get::<Value>(&category_key(&ethereum(), Category::Usage, Timeframe::Month))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_load_sets_error() {
        let provider = MockProvider::with_delay(Duration::from_millis(100));
        let orchestrator = orchestrator(&provider);

        let (view, _) = tokio::join!(orchestrator.load(ethereum(), Timeframe::Month), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            orchestrator.shutdown();
        });

        assert!(view.is_error);
        assert!(!view.is_loading);
        assert!(view.usage.is_fallback());
        assert!(orchestrator.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_runs_until_stopped() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = Arc::new(MetricsOrchestrator::new(
            Arc::clone(&provider),
            DataConfig::default()
                .with_auto_refresh_interval(Duration::from_secs(60))
                .with_retry(RetryPolicy::once()),
        ));
        orchestrator.load(ethereum(), Timeframe::Month).await;
        let rx = orchestrator.subscribe();

        let handle = orchestrator.spawn_auto_refresh();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(provider.total_calls(), 2 * Category::ALL.len());
        assert!(rx.has_changed().unwrap());

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(provider.total_calls(), 2 * Category::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_with_oversized_interval_is_capped() {
        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = Arc::new(MetricsOrchestrator::new(
            Arc::clone(&provider),
            DataConfig {
                auto_refresh_interval: Duration::from_secs(u64::MAX),
                ..DataConfig::default().with_retry(RetryPolicy::once())
            },
        ));
        orchestrator.load(ethereum(), Timeframe::Month).await;

        let handle = orchestrator.spawn_auto_refresh();
        tokio::time::sleep(MAX_AUTO_REFRESH_INTERVAL + Duration::from_secs(1)).await;

        assert!(!handle.is_stopped());
        assert_eq!(provider.total_calls(), 2 * Category::ALL.len());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_shares_cache() {
        #[derive(Debug)]
        struct EmptyHistory;

        #[async_trait]
        impl HistoryProvider for EmptyHistory {
            async fn fetch_page(
                &self,
                _: &NetworkId,
                _: &str,
                _: Timeframe,
                _: usize,
                _: usize,
            ) -> Result<Vec<crate::model::MetricSeriesPoint>, DataError> {
                Ok(Vec::new())
            }
        }

        let provider = MockProvider::with_delay(Duration::ZERO);
        let orchestrator = orchestrator(&provider);
        let history = orchestrator.history(
            EmptyHistory,
            HistoryKey::new("ethereum", "gasUsed", Timeframe::Month),
        );

        history.load().await.unwrap();
        assert!(!history.view().has_more);
        assert_eq!(orchestrator.cache().len(), 1);
    }
}
