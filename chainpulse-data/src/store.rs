use crate::{
    fallback,
    model::{
        AiAnalysis, CacheInfo, CashflowMetrics, Category, CategoryBundle, CategoryMetrics,
        MarketOverview, NetworkId, Timeframe, TvlMetrics, UsageMetrics,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Unified view of every category for one (network, timeframe) pair.
///
/// Every category slot always holds a complete bundle: live, cached, or fallback.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
    pub network: NetworkId,
    pub timeframe: Timeframe,
    pub usage: CategoryBundle<UsageMetrics>,
    pub tvl: CategoryBundle<TvlMetrics>,
    pub cashflow: CategoryBundle<CashflowMetrics>,
    pub market: CategoryBundle<MarketOverview>,
    pub ai: CategoryBundle<AiAnalysis>,
    pub cache_info: BTreeMap<Category, CacheInfo>,
    /// True while any category of the current cycle is outstanding
    pub is_loading: bool,
    /// True only if no view could be produced for the current cycle
    pub is_error: bool,
    /// True if any category absorbed a failure into its fallback bundle
    pub is_degraded: bool,
    /// First absorbed diagnostic, in [`Category::ALL`] order
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AggregateView {
    /// View holding a fallback bundle for every category.
    pub fn placeholder(network: NetworkId, timeframe: Timeframe) -> Self {
        Self {
            usage: fallback::synthesize(&network, timeframe),
            tvl: fallback::synthesize(&network, timeframe),
            cashflow: fallback::synthesize(&network, timeframe),
            market: fallback::synthesize(&network, timeframe),
            ai: fallback::synthesize(&network, timeframe),
            cache_info: Category::ALL
                .into_iter()
                .map(|category| (category, CacheInfo::default()))
                .collect(),
            network,
            timeframe,
            is_loading: false,
            is_error: false,
            is_degraded: false,
            error: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Diagnostics of every degraded category, in [`Category::ALL`] order.
    pub fn diagnostics(&self) -> Vec<(Category, &str)> {
        [
            (Category::Usage, self.usage.diagnostic.as_deref()),
            (Category::Tvl, self.tvl.diagnostic.as_deref()),
            (Category::Cashflow, self.cashflow.diagnostic.as_deref()),
            (Category::Market, self.market.diagnostic.as_deref()),
            (Category::Ai, self.ai.diagnostic.as_deref()),
        ]
        .into_iter()
        .filter_map(|(category, diagnostic)| diagnostic.map(|diagnostic| (category, diagnostic)))
        .collect()
    }

    fn recompute_degradation(&mut self) {
        self.error = self
            .diagnostics()
            .first()
            .map(|(category, diagnostic)| format!("{category}: {diagnostic}"));
        self.is_degraded = self.error.is_some();
    }
}

/// Explicit state container for the dashboard.
///
/// All writes go through named mutations, and every mutation publishes the new
/// [`AggregateView`] to every subscriber through a single `watch` channel.
#[derive(Debug)]
pub struct DashboardStore {
    tx: watch::Sender<AggregateView>,
}

impl DashboardStore {
    pub fn new(network: NetworkId, timeframe: Timeframe) -> Self {
        let (tx, _) = watch::channel(AggregateView::placeholder(network, timeframe));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<AggregateView> {
        self.tx.subscribe()
    }

    pub fn view(&self) -> AggregateView {
        self.tx.borrow().clone()
    }

    /// Start a fetch cycle for `(network, timeframe)`.
    ///
    /// Switching to a different pair resets every category to its fallback bundle so a view
    /// never mixes data from two pairs.
    pub fn begin_cycle(&self, network: NetworkId, timeframe: Timeframe) {
        self.tx.send_modify(|view| {
            if view.network != network || view.timeframe != timeframe {
                *view = AggregateView::placeholder(network, timeframe);
            }
            view.is_loading = true;
            view.is_error = false;
        });
    }

    pub fn set_usage_metrics(&self, bundle: CategoryBundle<UsageMetrics>, cache_info: CacheInfo) {
        self.set_category(bundle, cache_info, |view| &mut view.usage);
    }

    pub fn set_tvl_metrics(&self, bundle: CategoryBundle<TvlMetrics>, cache_info: CacheInfo) {
        self.set_category(bundle, cache_info, |view| &mut view.tvl);
    }

    pub fn set_cashflow_metrics(
        &self,
        bundle: CategoryBundle<CashflowMetrics>,
        cache_info: CacheInfo,
    ) {
        self.set_category(bundle, cache_info, |view| &mut view.cashflow);
    }

    pub fn set_market_overview(
        &self,
        bundle: CategoryBundle<MarketOverview>,
        cache_info: CacheInfo,
    ) {
        self.set_category(bundle, cache_info, |view| &mut view.market);
    }

    pub fn set_ai_analysis(&self, bundle: CategoryBundle<AiAnalysis>, cache_info: CacheInfo) {
        self.set_category(bundle, cache_info, |view| &mut view.ai);
    }

    pub fn set_loading(&self, is_loading: bool) {
        self.tx.send_modify(|view| {
            view.is_loading = is_loading;
            view.recompute_degradation();
        });
    }

    /// Mark the current cycle as failed outright.
    pub fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_modify(|view| {
            view.is_loading = false;
            view.is_error = true;
            view.error = Some(error);
        });
    }

    fn set_category<M>(
        &self,
        bundle: CategoryBundle<M>,
        cache_info: CacheInfo,
        slot: impl FnOnce(&mut AggregateView) -> &mut CategoryBundle<M>,
    ) where
        M: CategoryMetrics,
    {
        // Ignore late writes for a pair the view has already moved away from
        self.tx.send_if_modified(|view| {
            if view.network != bundle.network || view.timeframe != bundle.timeframe {
                return false;
            }
            view.cache_info.insert(M::CATEGORY, cache_info);
            *slot(view) = bundle;
            view.updated_at = Utc::now();
            view.recompute_degradation();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataSource;

    fn ethereum() -> NetworkId {
        NetworkId::new("ethereum")
    }

    #[test]
    fn test_placeholder_view_is_schema_complete() {
        let view = AggregateView::placeholder(ethereum(), Timeframe::Month);

        assert_eq!(view.cache_info.len(), Category::ALL.len());
        assert!(view.usage.is_fallback());
        assert!(view.ai.is_fallback());
        assert!(view.diagnostics().is_empty());
        assert!(!view.is_error);
    }

    #[test]
    fn test_named_mutations_publish_to_subscribers() {
        let store = DashboardStore::new(ethereum(), Timeframe::Month);
        let mut rx = store.subscribe();

        store.begin_cycle(ethereum(), Timeframe::Month);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_loading);

        let mut bundle = fallback::synthesize::<TvlMetrics>(&ethereum(), Timeframe::Month);
        bundle.source = DataSource::Live;
        store.set_tvl_metrics(
            bundle.clone(),
            CacheInfo {
                hit: false,
                timestamp: None,
                size: Some(42),
            },
        );

        assert!(rx.has_changed().unwrap());
        let view = rx.borrow_and_update().clone();
        assert_eq!(view.tvl, bundle);
        assert_eq!(view.cache_info[&Category::Tvl].size, Some(42));
    }

    #[test]
    fn test_degradation_reports_first_diagnostic() {
        let store = DashboardStore::new(ethereum(), Timeframe::Month);
        store.begin_cycle(ethereum(), Timeframe::Month);

        store.set_market_overview(
            fallback::synthesize_with_diagnostic(&ethereum(), Timeframe::Month, "market down"),
            CacheInfo::default(),
        );
        store.set_usage_metrics(
            fallback::synthesize_with_diagnostic(&ethereum(), Timeframe::Month, "usage down"),
            CacheInfo::default(),
        );
        store.set_loading(false);

        let view = store.view();
        assert!(view.is_degraded);
        assert!(!view.is_error);
        assert_eq!(view.error.as_deref(), Some("usage: usage down"));
        assert_eq!(view.diagnostics().len(), 2);
    }

    #[test]
    fn test_stale_pair_writes_are_ignored() {
        let store = DashboardStore::new(ethereum(), Timeframe::Month);
        store.begin_cycle(NetworkId::new("solana"), Timeframe::Week);

        store.set_usage_metrics(
            fallback::synthesize_with_diagnostic(&ethereum(), Timeframe::Month, "late"),
            CacheInfo::default(),
        );

        let view = store.view();
        assert_eq!(view.network, "solana");
        assert_eq!(view.usage.network, "solana");
        assert_eq!(view.usage.diagnostic, None);
    }

    #[test]
    fn test_set_error_marks_cycle_failed() {
        let store = DashboardStore::new(ethereum(), Timeframe::Month);
        store.begin_cycle(ethereum(), Timeframe::Month);
        store.set_error("orchestrator shut down");

        let view = store.view();
        assert!(view.is_error);
        assert!(!view.is_loading);
        assert_eq!(view.error.as_deref(), Some("orchestrator shut down"));
    }
}
