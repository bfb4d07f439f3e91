//! Store providers: which tenant stores exist right now?
//!
//! A provider enumerates the stores a poller should visit and resolves
//! routed writes by tenant key. Two variants:
//!
//! - [`ConfiguredStoreProvider`] - a fixed list supplied at registration.
//! - [`DynamicStoreProvider`] - wraps a [`DatabaseDiscovery`] and refreshes
//!   on an interval: new stores are added, stale stores torn down, changed
//!   connections re-bound. Lookups are served from the cached snapshot, and
//!   a failed refresh keeps the previous snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConveyorError;
use crate::row::StoreId;

// =============================================================================
// StoreHandle
// =============================================================================

/// One tenant store plus its identifier.
#[derive(Debug)]
pub struct StoreHandle<Q: ?Sized> {
    pub id: StoreId,
    pub store: Arc<Q>,
}

impl<Q: ?Sized> StoreHandle<Q> {
    pub fn new(id: impl Into<StoreId>, store: Arc<Q>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }
}

impl<Q: ?Sized> Clone for StoreHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

// =============================================================================
// StoreProvider
// =============================================================================

/// Enumerates stores for polling and resolves routed writes.
#[async_trait]
pub trait StoreProvider<Q: ?Sized>: Send + Sync {
    /// Snapshot of the current stores.
    async fn stores(&self) -> Vec<StoreHandle<Q>>;

    /// The store owning `key`'s data, if known.
    async fn store_for_key(&self, key: &str) -> Option<StoreHandle<Q>>;
}

// =============================================================================
// ConfiguredStoreProvider
// =============================================================================

/// Fixed store list supplied at registration time.
pub struct ConfiguredStoreProvider<Q: ?Sized> {
    handles: Vec<StoreHandle<Q>>,
    by_key: HashMap<String, usize>,
}

impl<Q: ?Sized> ConfiguredStoreProvider<Q> {
    /// Keys default to the store identifiers.
    pub fn new(handles: Vec<StoreHandle<Q>>) -> Self {
        let by_key = handles
            .iter()
            .enumerate()
            .map(|(i, h)| (h.id.as_str().to_string(), i))
            .collect();
        Self { handles, by_key }
    }

    /// A provider for the single-tenant case.
    pub fn single(id: impl Into<StoreId>, store: Arc<Q>) -> Self {
        Self::new(vec![StoreHandle::new(id, store)])
    }
}

#[async_trait]
impl<Q: Send + Sync + ?Sized> StoreProvider<Q> for ConfiguredStoreProvider<Q> {
    async fn stores(&self) -> Vec<StoreHandle<Q>> {
        self.handles.clone()
    }

    async fn store_for_key(&self, key: &str) -> Option<StoreHandle<Q>> {
        self.by_key.get(key).map(|&i| self.handles[i].clone())
    }
}

// =============================================================================
// DatabaseDiscovery
// =============================================================================

/// One discovered tenant database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDatabase {
    pub identifier: String,
    pub connection: String,
}

/// Source of the current tenant database list (a control-plane table, a
/// config service, ...).
#[async_trait]
pub trait DatabaseDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredDatabase>>;
}

/// Binds a discovered database to a live store.
pub type StoreBinder<Q> =
    dyn Fn(&DiscoveredDatabase) -> anyhow::Result<Arc<Q>> + Send + Sync;

// =============================================================================
// DynamicStoreProvider
// =============================================================================

struct DynamicSnapshot<Q: ?Sized> {
    handles: Vec<StoreHandle<Q>>,
    /// identifier → connection string used at bind time, to detect re-binds.
    connections: HashMap<String, String>,
    refreshed_at: Option<Instant>,
}

/// Discovery-backed provider with periodic refresh.
pub struct DynamicStoreProvider<Q: ?Sized> {
    discovery: Arc<dyn DatabaseDiscovery>,
    binder: Arc<StoreBinder<Q>>,
    refresh_interval: Duration,
    snapshot: RwLock<DynamicSnapshot<Q>>,
}

impl<Q: Send + Sync + ?Sized + 'static> DynamicStoreProvider<Q> {
    /// Default refresh interval is five minutes.
    pub fn new<F>(discovery: Arc<dyn DatabaseDiscovery>, binder: F) -> Self
    where
        F: Fn(&DiscoveredDatabase) -> anyhow::Result<Arc<Q>> + Send + Sync + 'static,
    {
        Self::with_refresh_interval(discovery, binder, Duration::from_secs(5 * 60))
    }

    pub fn with_refresh_interval<F>(
        discovery: Arc<dyn DatabaseDiscovery>,
        binder: F,
        refresh_interval: Duration,
    ) -> Self
    where
        F: Fn(&DiscoveredDatabase) -> anyhow::Result<Arc<Q>> + Send + Sync + 'static,
    {
        Self {
            discovery,
            binder: Arc::new(binder),
            refresh_interval,
            snapshot: RwLock::new(DynamicSnapshot {
                handles: Vec::new(),
                connections: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Force a refresh regardless of interval. Returns the store count.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let discovered = self.discovery.discover().await?;
        let mut snapshot = self.snapshot.write().await;

        let mut handles = Vec::with_capacity(discovered.len());
        let mut connections = HashMap::with_capacity(discovered.len());

        for db in &discovered {
            let reusable = snapshot
                .connections
                .get(&db.identifier)
                .is_some_and(|conn| conn == &db.connection);

            let handle = if reusable {
                // Connection unchanged; keep the live store.
                snapshot
                    .handles
                    .iter()
                    .find(|h| h.id.as_str() == db.identifier)
                    .cloned()
            } else {
                None
            };

            let handle = match handle {
                Some(h) => h,
                None => {
                    let store = (self.binder)(db)?;
                    info!(store = %db.identifier, "bound store");
                    StoreHandle::new(db.identifier.clone(), store)
                }
            };
            connections.insert(db.identifier.clone(), db.connection.clone());
            handles.push(handle);
        }

        for stale in snapshot
            .connections
            .keys()
            .filter(|id| !connections.contains_key(*id))
        {
            info!(store = %stale, "dropped stale store");
        }

        let count = handles.len();
        snapshot.handles = handles;
        snapshot.connections = connections;
        snapshot.refreshed_at = Some(Instant::now());
        debug!(stores = count, "store list refreshed");
        Ok(count)
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let snapshot = self.snapshot.read().await;
            match snapshot.refreshed_at {
                None => true,
                Some(at) => at.elapsed() >= self.refresh_interval,
            }
        };
        if stale {
            if let Err(error) = self.refresh().await {
                // Keep serving the previous snapshot.
                warn!(error = %error, "store discovery refresh failed");
            }
        }
    }
}

#[async_trait]
impl<Q: Send + Sync + ?Sized + 'static> StoreProvider<Q> for DynamicStoreProvider<Q> {
    async fn stores(&self) -> Vec<StoreHandle<Q>> {
        self.refresh_if_stale().await;
        self.snapshot.read().await.handles.clone()
    }

    async fn store_for_key(&self, key: &str) -> Option<StoreHandle<Q>> {
        self.refresh_if_stale().await;
        let snapshot = self.snapshot.read().await;
        snapshot
            .handles
            .iter()
            .find(|h| h.id.as_str() == key)
            .cloned()
    }
}

// =============================================================================
// StoreRouter
// =============================================================================

/// Routes application writes to the store owning a tenant's data.
pub struct StoreRouter<Q: ?Sized> {
    provider: Arc<dyn StoreProvider<Q>>,
}

impl<Q: ?Sized> StoreRouter<Q> {
    pub fn new(provider: Arc<dyn StoreProvider<Q>>) -> Self {
        Self { provider }
    }

    /// The store for `key`, or [`ConveyorError::UnknownStoreKey`].
    pub async fn get(&self, key: &str) -> Result<StoreHandle<Q>, ConveyorError> {
        self.provider
            .store_for_key(key)
            .await
            .ok_or_else(|| ConveyorError::UnknownStoreKey(key.to_string()))
    }
}
