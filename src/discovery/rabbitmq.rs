//! RabbitMQ management API client for queue discovery.
//!
//! Lists queues of the virtual host named in the AMQP URL through
//! `GET /api/queues/{vhost}` with pagination, and reads queue details for
//! existence and length checks.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DiscoveryError, QueueInformationProvider, QueueLengthProvider, Result};
use crate::config::AmqpConfig;

/// Queues requested per page.
const PAGE_SIZE: u32 = 500;

#[derive(Debug, Deserialize)]
struct QueuePage {
    #[serde(default)]
    items: Vec<QueueSummary>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    page_count: u32,
}

#[derive(Debug, Deserialize)]
struct QueueSummary {
    name: String,
    #[serde(default)]
    messages: u64,
}

/// Queue information from the RabbitMQ management plugin.
pub struct RabbitMqManagementClient {
    client: Client,
    base_url: Url,
    vhost: String,
    username: String,
    password: String,
}

impl RabbitMqManagementClient {
    /// Build a client from the AMQP settings.
    ///
    /// Credentials default to the ones embedded in the AMQP URL.
    pub fn new(config: &AmqpConfig) -> Result<Self> {
        let amqp_url = Url::parse(&config.url)
            .map_err(|e| DiscoveryError::Config(format!("invalid AMQP url: {}", e)))?;
        let base_url = Url::parse(&config.management_url)
            .map_err(|e| DiscoveryError::Config(format!("invalid management url: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DiscoveryError::Config(e.to_string()))?;

        let username = config
            .username
            .clone()
            .unwrap_or_else(|| non_empty_or(amqp_url.username(), "guest"));
        let password = config
            .password
            .clone()
            .unwrap_or_else(|| non_empty_or(amqp_url.password().unwrap_or(""), "guest"));

        Ok(Self {
            client,
            base_url,
            vhost: vhost_from_url(&amqp_url),
            username,
            password,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DiscoveryError::Config("management url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(3)
            .with_jitter()
    }

    async fn get(&self, url: Url) -> Result<Option<reqwest::Response>> {
        let response = (|| async {
            self.client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await
        })
        .retry(Self::backoff())
        .when(|e: &reqwest::Error| e.is_timeout() || e.is_connect())
        .notify(|e, delay| {
            warn!(error = %e, delay_ms = delay.as_millis() as u64, "Retrying management API request");
        })
        .await
        .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(DiscoveryError::Response(format!(
                "{} returned HTTP {}",
                url.path(),
                status
            ))),
        }
    }

    async fn queue_page(&self, page: u32) -> Result<QueuePage> {
        let mut url = self.endpoint(&["api", "queues", &self.vhost])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("page_size", &PAGE_SIZE.to_string())
            .append_pair("pagination", "true")
            .append_pair("columns", "name,messages");

        let response = self
            .get(url)
            .await?
            .ok_or_else(|| DiscoveryError::Response(format!("vhost '{}' not found", self.vhost)))?;
        let page: QueuePage = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Response(e.to_string()))?;

        debug!(
            page = page.page,
            page_count = page.page_count,
            items = page.items.len(),
            "Fetched queue page"
        );
        Ok(page)
    }

    async fn queue(&self, name: &str) -> Result<Option<QueueSummary>> {
        let url = self.endpoint(&["api", "queues", &self.vhost, name])?;
        match self.get(url).await? {
            Some(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| DiscoveryError::Response(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl QueueInformationProvider for RabbitMqManagementClient {
    fn queues(&self) -> BoxStream<'_, Result<String>> {
        stream::try_unfold(Some(1u32), move |page| async move {
            let Some(page) = page else {
                return Ok::<_, DiscoveryError>(None);
            };
            let response = self.queue_page(page).await?;
            let next = (page < response.page_count).then_some(page + 1);
            let names = response
                .items
                .into_iter()
                .map(|queue| Ok::<_, DiscoveryError>(queue.name));
            Ok(Some((stream::iter(names), next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.queue(name).await?.is_some())
    }
}

#[async_trait]
impl QueueLengthProvider for RabbitMqManagementClient {
    async fn length(&self, name: &str) -> Result<u64> {
        self.queue(name)
            .await?
            .map(|queue| queue.messages)
            .ok_or_else(|| DiscoveryError::Response(format!("queue '{}' not found", name)))
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Virtual host named by an AMQP URL path (`/` when empty).
fn vhost_from_url(url: &Url) -> String {
    let raw = url.path().trim_start_matches('/');
    if raw.is_empty() {
        return "/".to_string();
    }
    percent_decode(raw)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
