//! Subscriber snapshots and the store they are read from.
//!
//! The supervisor receives one snapshot per operation and must never keep
//! credentials around beyond the config artifact it produces. The store is
//! owned by the chat/command collaborator; here it is a trait with an
//! in-memory implementation fed over the control API.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Exchange binding for one subscriber. The secret never leaves this struct
/// except into the subscriber's own config artifact.
#[derive(Clone)]
pub struct ExchangeCredentials {
    pub exchange: String,
    pub api_key: String,
    pub api_secret: String,
}

// Hand-written so credentials cannot leak through `{:?}` logging.
impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("exchange", &self.exchange)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Point-in-time snapshot of one subscriber's purchased setup.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: Uuid,
    pub tier: String,
    pub risk_level: String,
    pub strategy: String,
    pub exchange: ExchangeCredentials,
}

/// Source of subscriber snapshots, looked up before `start` proceeds.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Subscriber>>;
    async fn upsert(&self, subscriber: Subscriber) -> anyhow::Result<()>;
}

/// In-memory store, populated via the control API.
pub struct InMemorySubscriberStore {
    inner: RwLock<HashMap<Uuid, Subscriber>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySubscriberStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Subscriber>> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn upsert(&self, subscriber: Subscriber) -> anyhow::Result<()> {
        self.inner.write().await.insert(subscriber.id, subscriber);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_subscriber(id: Uuid) -> Subscriber {
        Subscriber {
            id,
            tier: "pro".to_string(),
            risk_level: "moderate".to_string(),
            strategy: "dca".to_string(),
            exchange: ExchangeCredentials {
                exchange: "binance".to_string(),
                api_key: "key-abc".to_string(),
                api_secret: "super-secret".to_string(),
            },
        }
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let sub = sample_subscriber(Uuid::new_v4());
        let rendered = format!("{:?}", sub);

        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("key-abc"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("binance"));
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let store = InMemorySubscriberStore::new();
        let id = Uuid::new_v4();

        assert!(store.fetch(id).await.unwrap().is_none());

        store.upsert(sample_subscriber(id)).await.unwrap();
        let fetched = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(fetched.tier, "pro");
        assert_eq!(fetched.exchange.api_key, "key-abc");
    }
}
