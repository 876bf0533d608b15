//! Paginated, cached, cancellable loading of long metric histories.
//!
//! Each [`PaginatedHistory`] owns one (network, metric, timeframe) key and moves through
//! `Idle -> Loading -> Ready | Error`, then `Ready -> LoadingMore -> Ready` for every
//! [`load_more`](PaginatedHistory::load_more). A page shorter than the configured page size
//! marks the end of the series.
//!
//! Every logical request owns a [`CancellationToken`] derived from the fetcher's own token.
//! Starting a new request cancels the previous one and a cancelled request resolves to an empty
//! result, leaving the state as it was before that request, so a late response can never
//! overwrite a fresher one.

use crate::{
    cache::{self, CacheStore},
    config::DataConfig,
    error::DataError,
    model::{CacheInfo, MetricSeriesPoint, NetworkId, Timeframe, normalize_series},
    provider::HistoryProvider,
    retry::{RetryController, RetryPolicy},
};
use derive_more::Display;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of one history series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{network}/{metric}-{timeframe}")]
pub struct HistoryKey {
    pub network: NetworkId,
    pub metric: SmolStr,
    pub timeframe: Timeframe,
}

impl HistoryKey {
    pub fn new(
        network: impl Into<NetworkId>,
        metric: impl Into<SmolStr>,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            network: network.into(),
            metric: metric.into(),
            timeframe,
        }
    }

    /// Cache key prefix shared by every page: `{network}/{metric}-{timeframe}`.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    /// Cache key of a single page: `{network}/{metric}-{timeframe}-page-{page}`.
    pub fn page_key(&self, page: usize) -> String {
        format!("{self}-page-{page}")
    }
}

/// Lifecycle of a [`PaginatedHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    LoadingMore,
    Error,
}

/// Consumer facing snapshot of a [`PaginatedHistory`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryView {
    pub data: Vec<MetricSeriesPoint>,
    pub status: HistoryStatus,
    pub is_loading: bool,
    pub is_error: bool,
    pub error: Option<DataError>,
    pub has_more: bool,
    pub cache_info: CacheInfo,
}

#[derive(Debug, Default)]
struct State {
    status: HistoryStatus,
    data: Vec<MetricSeriesPoint>,
    error: Option<DataError>,
    has_more: bool,
    next_page: usize,
    cache_info: CacheInfo,
    /// Status before the in-flight request, restored if that request is cancelled
    settled: HistoryStatus,
    /// Incremented by every request; a request may only restore `settled` while still current
    generation: u64,
}

impl State {
    fn settle(&mut self, status: HistoryStatus) {
        self.status = status;
        self.settled = status;
    }

    /// Undo the in-flight status of request `generation` unless a newer request replaced it.
    fn restore(&mut self, generation: u64) {
        if self.generation == generation {
            self.status = self.settled;
        }
    }
}

/// Page-by-page loader of one metric history.
#[derive(Debug)]
pub struct PaginatedHistory<Provider> {
    key: HistoryKey,
    provider: Provider,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
    page_size: usize,
    ttl: Duration,
    state: Mutex<State>,
    request: Mutex<CancellationToken>,
    lifetime: CancellationToken,
}

impl<Provider> PaginatedHistory<Provider>
where
    Provider: HistoryProvider,
{
    pub fn new(
        key: HistoryKey,
        provider: Provider,
        cache: Arc<CacheStore>,
        config: &DataConfig,
    ) -> Self {
        let lifetime = CancellationToken::new();
        Self {
            key,
            provider,
            cache,
            retry: config.retry,
            page_size: config.page_size.max(1),
            ttl: config.history_ttl,
            state: Mutex::new(State::default()),
            request: Mutex::new(lifetime.child_token()),
            lifetime,
        }
    }

    pub fn key(&self) -> &HistoryKey {
        &self.key
    }

    pub fn view(&self) -> HistoryView {
        let state = self.state.lock();
        HistoryView {
            data: state.data.clone(),
            status: state.status,
            is_loading: matches!(
                state.status,
                HistoryStatus::Loading | HistoryStatus::LoadingMore
            ),
            is_error: state.error.is_some(),
            error: state.error.clone(),
            has_more: state.has_more,
            cache_info: state.cache_info,
        }
    }

    /// Fetch a single page, serving it from the cache when a live entry exists.
    pub async fn fetch_page(
        &self,
        page: usize,
    ) -> Result<(Vec<MetricSeriesPoint>, CacheInfo), DataError> {
        let page_key = self.key.page_key(page);

        if let Some(points) = self.cache.get::<Vec<MetricSeriesPoint>>(&page_key) {
            debug!(key = %page_key, "history page served from cache");
            let info = self.cache.entry_info(&page_key);
            return Ok((
                points,
                CacheInfo {
                    hit: true,
                    timestamp: info.map(|info| info.timestamp),
                    size: info.map(|info| info.size),
                },
            ));
        }

        let points = self
            .provider
            .fetch_page(
                &self.key.network,
                &self.key.metric,
                self.key.timeframe,
                page,
                self.page_size,
            )
            .await?;

        if let Err(error) = self.cache.set(page_key.clone(), &points, self.ttl) {
            warn!(key = %page_key, %error, "failed to cache history page");
        }
        let info = self.cache.entry_info(&page_key);

        Ok((
            points,
            CacheInfo {
                hit: false,
                timestamp: info.map(|info| info.timestamp),
                size: info.map(|info| info.size),
            },
        ))
    }

    /// Load the first page, retrying with exponential backoff.
    ///
    /// Supersedes any in-flight request for this key. Resolves to an empty result if this request
    /// is itself superseded or the fetcher is cancelled.
    pub async fn load(&self) -> Result<Vec<MetricSeriesPoint>, DataError> {
        let (token, generation) = {
            let mut state = self.state.lock();
            let request = self.begin_request(&mut state);
            state.status = HistoryStatus::Loading;
            request
        };

        let result = RetryController::new(self.retry, token.clone())
            .run(move |_| self.fetch_page(0))
            .await;

        let mut state = self.state.lock();
        if token.is_cancelled() {
            debug!(key = %self.key, "initial history load superseded");
            state.restore(generation);
            return Ok(Vec::new());
        }

        match result {
            Ok((points, cache_info)) => {
                let page_len = points.len();
                state.data = normalize_series(points);
                state.settle(HistoryStatus::Ready);
                state.error = None;
                state.has_more = page_len >= self.page_size;
                state.next_page = 1;
                state.cache_info = cache_info;

                info!(
                    key = %self.key,
                    points = state.data.len(),
                    has_more = state.has_more,
                    cache_hit = cache_info.hit,
                    "history loaded"
                );
                Ok(state.data.clone())
            }
            Err(DataError::Aborted) => {
                state.restore(generation);
                Ok(Vec::new())
            }
            Err(error) => {
                warn!(key = %self.key, %error, "history load failed");
                state.settle(HistoryStatus::Error);
                state.error = Some(error.clone());
                state.cache_info = CacheInfo::default();
                Err(error)
            }
        }
    }

    /// Append the next page to the loaded series.
    ///
    /// A no-op unless the fetcher is `Ready` with more data available. Failures are surfaced
    /// immediately without retry and leave the already loaded data in place.
    pub async fn load_more(&self) -> Result<Vec<MetricSeriesPoint>, DataError> {
        let (token, generation, page) = {
            let mut state = self.state.lock();
            if state.status != HistoryStatus::Ready || !state.has_more {
                return Ok(Vec::new());
            }
            let (token, generation) = self.begin_request(&mut state);
            state.status = HistoryStatus::LoadingMore;
            (token, generation, state.next_page)
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DataError::Aborted),
            result = self.fetch_page(page) => result,
        };

        let mut state = self.state.lock();
        if token.is_cancelled() {
            debug!(key = %self.key, page, "load more superseded");
            state.restore(generation);
            return Ok(Vec::new());
        }

        state.settle(HistoryStatus::Ready);
        match result {
            Ok((points, cache_info)) => {
                let page_len = points.len();
                let last = state.data.last().map(|point| point.timestamp);
                let appended: Vec<_> = normalize_series(points)
                    .into_iter()
                    .filter(|point| last.is_none_or(|last| point.timestamp > last))
                    .collect();

                state.data.extend(appended.iter().copied());
                state.error = None;
                state.has_more = page_len >= self.page_size;
                state.next_page = page + 1;
                state.cache_info = cache_info;

                debug!(key = %self.key, page, appended = appended.len(), has_more = state.has_more, "history page appended");
                Ok(appended)
            }
            Err(DataError::Aborted) => Ok(Vec::new()),
            Err(error) => {
                warn!(key = %self.key, page, %error, "load more failed");
                state.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Invalidate every cached page of this key and perform a fresh initial load.
    pub async fn refetch(&self) -> Result<Vec<MetricSeriesPoint>, DataError> {
        let pattern = cache::page_pattern(&self.key.cache_key())?;
        let removed = self.cache.delete_by_pattern(&pattern);
        debug!(key = %self.key, removed, "history cache invalidated");

        self.load().await
    }

    /// Replace the in-memory series without a network call and re-prime the page-0 cache entry.
    ///
    /// Supersedes any in-flight request so a late response cannot overwrite the new data.
    pub fn mutate(&self, series: Vec<MetricSeriesPoint>) -> Result<(), DataError> {
        let series = normalize_series(series);
        let page_key = self.key.page_key(0);
        self.cache.set(page_key.clone(), &series, self.ttl)?;
        let info = self.cache.entry_info(&page_key);

        let mut state = self.state.lock();
        self.begin_request(&mut state);
        state.has_more = series.len() >= self.page_size;
        state.data = series;
        state.settle(HistoryStatus::Ready);
        state.error = None;
        state.next_page = 1;
        state.cache_info = CacheInfo {
            hit: false,
            timestamp: info.map(|info| info.timestamp),
            size: info.map(|info| info.size),
        };
        Ok(())
    }

    /// Cancel every in-flight and future request of this fetcher (consumer unmount).
    pub fn cancel(&self) {
        self.lifetime.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Cancel the current request and hand out a fresh token and generation for a new one.
    fn begin_request(&self, state: &mut State) -> (CancellationToken, u64) {
        let token = self.lifetime.child_token();
        let previous = std::mem::replace(&mut *self.request.lock(), token.clone());
        previous.cancel();

        state.generation += 1;
        (token, state.generation)
    }
}

impl<Provider> Drop for PaginatedHistory<Provider> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}
