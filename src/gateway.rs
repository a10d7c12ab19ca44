//! Status/balance gateway
//!
//! Async query path to a worker's local API, with a bounded timeout and a
//! short-TTL cache so repeated UI polling does not amplify load. `peek`
//! serves the `status` endpoint from cache only; failures are surfaced,
//! never papered over with data older than the cache window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;

/// Balance reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub currency: String,
    pub total: Decimal,
    pub free: Decimal,
    pub fetched_at: DateTime<Utc>,
}

/// Seam for the actual worker/exchange query. Mocked in tests.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch(&self, subscriber_id: Uuid, api_port: u16)
        -> Result<BalanceSnapshot, GatewayError>;
}

/// Queries the worker's local REST API.
pub struct HttpBalanceSource {
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct WorkerBalanceResponse {
    currency: String,
    total: Decimal,
    free: Decimal,
}

impl HttpBalanceSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl BalanceSource for HttpBalanceSource {
    async fn fetch(
        &self,
        subscriber_id: Uuid,
        api_port: u16,
    ) -> Result<BalanceSnapshot, GatewayError> {
        let url = format!("http://127.0.0.1:{}/api/v1/balance", api_port);
        debug!(subscriber = %subscriber_id, "fetching balance from {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                GatewayError::Unreachable {
                    detail: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(GatewayError::Unreachable {
                detail: format!("worker returned {}", response.status()),
            });
        }

        let body: WorkerBalanceResponse =
            response.json().await.map_err(|e| GatewayError::Unreachable {
                detail: e.to_string(),
            })?;

        Ok(BalanceSnapshot {
            currency: body.currency,
            total: body.total,
            free: body.free,
            fetched_at: Utc::now(),
        })
    }
}

pub struct BalanceGateway {
    source: Arc<dyn BalanceSource>,
    cache: RwLock<HashMap<Uuid, BalanceSnapshot>>,
    query_timeout: Duration,
    cache_ttl: Duration,
}

impl BalanceGateway {
    pub fn new(source: Arc<dyn BalanceSource>, query_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            query_timeout,
            cache_ttl,
        }
    }

    /// Cache-only read. Returns a snapshot only while it is inside the
    /// validity window; never performs network I/O.
    pub async fn peek(&self, subscriber_id: Uuid) -> Option<BalanceSnapshot> {
        let cache = self.cache.read().await;
        cache
            .get(&subscriber_id)
            .filter(|snap| self.is_fresh(snap))
            .cloned()
    }

    /// Balance for a subscriber's worker: fresh cache hit, or a
    /// bounded-timeout fetch whose result refreshes the cache.
    pub async fn query(
        &self,
        subscriber_id: Uuid,
        api_port: u16,
    ) -> Result<BalanceSnapshot, GatewayError> {
        if let Some(hit) = self.peek(subscriber_id).await {
            debug!(subscriber = %subscriber_id, "balance served from cache");
            return Ok(hit);
        }

        let fetched = tokio::time::timeout(
            self.query_timeout,
            self.source.fetch(subscriber_id, api_port),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            timeout_ms: self.query_timeout.as_millis() as u64,
        })??;

        self.cache
            .write()
            .await
            .insert(subscriber_id, fetched.clone());
        Ok(fetched)
    }

    /// Drop a subscriber's cached balance (called when their worker stops).
    pub async fn invalidate(&self, subscriber_id: Uuid) {
        self.cache.write().await.remove(&subscriber_id);
    }

    fn is_fresh(&self, snap: &BalanceSnapshot) -> bool {
        let age = Utc::now().signed_duration_since(snap.fetched_at);
        age < chrono::Duration::milliseconds(self.cache_ttl.as_millis() as i64)
    }
}
