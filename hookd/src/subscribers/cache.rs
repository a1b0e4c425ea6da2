//! Cache-aside layer in front of the subscription store.
//!
//! Entries are keyed `subscribers:<event_type>` and expire after a fixed TTL.
//! A hit never touches the store, so writes to subscriptions can take up to one
//! TTL to become visible unless the writer calls [`SubscriberCache::invalidate`].
//! An empty subscriber list is cached like any other.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use moka::future::Cache;
use tracing::{debug, instrument};

use crate::config::CacheConfig;
use crate::db::errors::Result;
use crate::db::models::subscriptions::Subscriber;
use crate::storage::SubscriptionStore;

/// Cache key for an event type's subscriber list.
pub fn cache_key(event_type: &str) -> String {
    format!("subscribers:{event_type}")
}

/// TTL cache over [`SubscriptionStore::active_subscribers`].
#[derive(Clone)]
pub struct SubscriberCache {
    store: Arc<dyn SubscriptionStore>,
    cache: Cache<String, Arc<Vec<Subscriber>>>,
}

impl SubscriberCache {
    pub fn new(store: Arc<dyn SubscriptionStore>, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            store,
            cache: Cache::builder().max_capacity(max_capacity).time_to_live(ttl).build(),
        }
    }

    pub fn from_config(store: Arc<dyn SubscriptionStore>, config: &CacheConfig) -> Self {
        Self::new(store, config.ttl, config.max_capacity)
    }

    /// Active subscribers for `event_type`, served from cache when present.
    ///
    /// Store errors propagate and are not cached.
    #[instrument(skip(self), err)]
    pub async fn resolve_subscribers(&self, event_type: &str) -> Result<Arc<Vec<Subscriber>>> {
        let key = cache_key(event_type);

        if let Some(subscribers) = self.cache.get(&key).await {
            debug!(count = subscribers.len(), "Cache hit");
            counter!("hookd_subscriber_cache_total", "result" => "hit").increment(1);
            return Ok(subscribers);
        }

        counter!("hookd_subscriber_cache_total", "result" => "miss").increment(1);
        let subscribers = Arc::new(self.store.active_subscribers(event_type).await?);
        debug!(count = subscribers.len(), "Cache miss, populated from store");
        self.cache.insert(key, subscribers.clone()).await;

        Ok(subscribers)
    }

    /// Evict the cached list for `event_type`.
    pub async fn invalidate(&self, event_type: &str) {
        self.cache.invalidate(&cache_key(event_type)).await;
    }
}
