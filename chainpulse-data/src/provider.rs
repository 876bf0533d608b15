//! Upstream collaborators: the sources of category payloads and history pages.
//!
//! Providers are opaque to the rest of the crate; they return either a value or a
//! [`DataError`]. Category payloads stay untyped until they pass the
//! [`validate`](crate::validate) boundary.

use crate::{
    error::DataError,
    model::{Category, MetricSeriesPoint, NetworkId, Timeframe},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

/// Default per-request timeout of the [`HttpProvider`].
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of raw category snapshot payloads.
#[async_trait]
pub trait CategoryProvider: Send + Sync {
    async fn fetch_category(
        &self,
        network: &NetworkId,
        timeframe: Timeframe,
        category: Category,
    ) -> Result<Value, DataError>;
}

/// Source of paginated metric history.
///
/// A page shorter than `page_size` signals the end of the series.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_page(
        &self,
        network: &NetworkId,
        metric: &str,
        timeframe: Timeframe,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<MetricSeriesPoint>, DataError>;
}

#[async_trait]
impl<T> CategoryProvider for Arc<T>
where
    T: CategoryProvider + ?Sized,
{
    async fn fetch_category(
        &self,
        network: &NetworkId,
        timeframe: Timeframe,
        category: Category,
    ) -> Result<Value, DataError> {
        (**self).fetch_category(network, timeframe, category).await
    }
}

#[async_trait]
impl<T> HistoryProvider for Arc<T>
where
    T: HistoryProvider + ?Sized,
{
    async fn fetch_page(
        &self,
        network: &NetworkId,
        metric: &str,
        timeframe: Timeframe,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<MetricSeriesPoint>, DataError> {
        (**self)
            .fetch_page(network, metric, timeframe, page, page_size)
            .await
    }
}

/// JSON-over-HTTP provider.
///
/// Endpoints, relative to `base_url`:
/// - `networks/{network}/{category}?timeframe={timeframe}`
/// - `networks/{network}/history/{metric}?timeframe={timeframe}&page={page}&page_size={page_size}`
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            client,
            base_url,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Set per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Join `segments` onto the base url, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, DataError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DataError::Network(format!("base url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T>(&self, url: Url, query: &[(&str, String)]) -> Result<T, DataError>
    where
        T: serde::de::DeserializeOwned,
    {
        debug!(%url, "provider request");

        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl CategoryProvider for HttpProvider {
    async fn fetch_category(
        &self,
        network: &NetworkId,
        timeframe: Timeframe,
        category: Category,
    ) -> Result<Value, DataError> {
        let url = self.endpoint(&["networks", network.as_str(), category.as_str()])?;
        self.get_json(url, &[("timeframe", timeframe.to_string())])
            .await
    }
}

#[async_trait]
impl HistoryProvider for HttpProvider {
    async fn fetch_page(
        &self,
        network: &NetworkId,
        metric: &str,
        timeframe: Timeframe,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<MetricSeriesPoint>, DataError> {
        let url = self.endpoint(&["networks", network.as_str(), "history", metric])?;
        self.get_json(
            url,
            &[
                ("timeframe", timeframe.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ],
        )
        .await
    }
}
