//! Connection pool registry
//!
//! Owns zero or one live pool per label. Each resolution looks the label up
//! in the current snapshot and compares the descriptor's fingerprint with
//! the live pool's; on mismatch the old pool is retired in the background
//! and a new one installed. Check and swap happen under one lock, so
//! concurrent resolutions of a stale label build exactly one replacement.
//!
//! Per label the state machine is `absent -> live(fingerprint)`, with a
//! replaced or pruned pool moving to `retiring` (no new borrows, in-flight
//! work drains, then every connection is closed).

use parking_lot::Mutex as SyncMutex;
use sqlgate_rdbc::connection::{ConnectionConfig, ConnectionFactory};
use sqlgate_rdbc::pool::{ConnectionPool, PoolConfig, PooledConnection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectionDescriptor, TargetSummary};
use crate::error::{Error, Result};
use crate::fingerprint::PoolFingerprint;
use crate::loader::ConfigLoader;

/// Timeouts applied to every pool the registry builds
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Upper bound on establishing one connection
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a free pool slot
    pub acquire_timeout: Duration,
    /// Application name reported to the server
    pub application_name: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            application_name: "sqlgate".into(),
        }
    }
}

/// The live pool for one label, tagged with the fingerprint it was built from
#[derive(Clone)]
pub struct PoolHandle {
    label: Arc<str>,
    fingerprint: PoolFingerprint,
    pool: Arc<ConnectionPool>,
}

impl PoolHandle {
    /// Label this pool serves
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Fingerprint of the descriptor the pool was built from
    pub fn fingerprint(&self) -> &PoolFingerprint {
        &self.fingerprint
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Borrow a connection
    pub async fn get(&self) -> sqlgate_rdbc::Result<PooledConnection> {
        self.pool.get().await
    }

    /// Whether retirement has begun
    pub fn is_retired(&self) -> bool {
        self.pool.is_closed()
    }

    /// Whether both handles refer to the same pool instance
    pub fn same_pool(&self, other: &PoolHandle) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint)
            .field("size", &self.pool.size())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Pools currently live
    pub live_pools: usize,
    /// Pools constructed since start
    pub pools_created: u64,
    /// Pools sent to retirement since start
    pub pools_retired: u64,
}

struct LiveSlot {
    handle: PoolHandle,
    descriptor: Arc<ConnectionDescriptor>,
    /// Generation of the snapshot the pool was built from
    generation: u64,
}

#[derive(Default)]
struct Slots {
    live: HashMap<String, LiveSlot>,
    /// Newest snapshot generation seen, for pruning removed labels
    generation: u64,
}

/// Maps labels to live pools, consistent with the current configuration
pub struct PoolRegistry {
    loader: Arc<ConfigLoader>,
    factory: Arc<dyn ConnectionFactory>,
    settings: RegistrySettings,
    slots: Mutex<Slots>,
    retiring: SyncMutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    pools_created: AtomicU64,
    pools_retired: AtomicU64,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("loader", &self.loader)
            .field("settings", &self.settings)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new(
        loader: Arc<ConfigLoader>,
        factory: Arc<dyn ConnectionFactory>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            loader,
            factory,
            settings,
            slots: Mutex::new(Slots::default()),
            retiring: SyncMutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            pools_created: AtomicU64::new(0),
            pools_retired: AtomicU64::new(0),
        }
    }

    /// Config loader backing this registry
    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    /// Live pool for `label`
    pub async fn pool_for(&self, label: &str) -> Result<PoolHandle> {
        self.resolve(label).await.map(|(_, handle)| handle)
    }

    /// Descriptor and live pool for `label`, building or swapping the pool
    /// when needed.
    ///
    /// Configuration failures surface as [`Error::LabelNotFound`] with no
    /// available labels, so a broken source degrades calls instead of
    /// failing the process.
    pub async fn resolve(&self, label: &str) -> Result<(Arc<ConnectionDescriptor>, PoolHandle)> {
        self.ensure_running()?;

        let snapshot = self.loader.current().await.map_err(|e| {
            warn!(label, error = %e, "configuration unavailable; label cannot be resolved");
            Error::LabelNotFound {
                label: label.to_string(),
                available: Vec::new(),
                reason: Some(format!("configuration unavailable: {e}")),
            }
        })?;

        let Some(descriptor) = snapshot.get(label).cloned() else {
            return Err(Error::LabelNotFound {
                label: label.to_string(),
                available: snapshot.labels(),
                reason: None,
            });
        };
        let fingerprint = PoolFingerprint::of(&descriptor);

        let mut slots = self.slots.lock().await;
        self.ensure_running()?;

        if snapshot.generation > slots.generation {
            slots.generation = snapshot.generation;
            let removed: Vec<String> = slots
                .live
                .keys()
                .filter(|l| snapshot.get(l).is_none())
                .cloned()
                .collect();
            for removed in removed {
                if let Some(slot) = slots.live.remove(&removed) {
                    info!(label = %removed, "target removed from configuration; retiring pool");
                    self.retire_in_background(slot.handle);
                }
            }
        }

        if let Some(slot) = slots.live.get(label) {
            if slot.handle.fingerprint == fingerprint {
                debug!(label, fingerprint = %fingerprint, "reusing pool");
                return Ok((descriptor, slot.handle.clone()));
            }
            if slot.generation > snapshot.generation {
                // a caller holding a newer snapshot already swapped this label
                debug!(label, "snapshot superseded; using newer pool");
                return Ok((Arc::clone(&slot.descriptor), slot.handle.clone()));
            }
        }

        let handle = self.build_pool(&descriptor, fingerprint);
        let previous = slots.live.insert(
            label.to_string(),
            LiveSlot {
                handle: handle.clone(),
                descriptor: Arc::clone(&descriptor),
                generation: snapshot.generation,
            },
        );
        drop(slots);

        if let Some(previous) = previous {
            info!(
                label,
                old = %previous.handle.fingerprint,
                new = %handle.fingerprint,
                "descriptor changed; retiring pool"
            );
            self.retire_in_background(previous.handle);
        }

        Ok((descriptor, handle))
    }

    /// Summaries of every enabled, in-scope target; empty when the
    /// configuration cannot be loaded
    pub async fn targets(&self) -> Vec<TargetSummary> {
        match self.loader.current().await {
            Ok(snapshot) => snapshot.iter().map(|d| d.summary()).collect(),
            Err(e) => {
                warn!(error = %e, "configuration unavailable; listing no targets");
                Vec::new()
            }
        }
    }

    /// Registry counters
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_pools: self.slots.lock().await.live.len(),
            pools_created: self.pools_created.load(Ordering::Relaxed),
            pools_retired: self.pools_retired.load(Ordering::Relaxed),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Retire every live pool and wait for all retirements to finish.
    ///
    /// Later resolutions fail. Idempotent.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let live: Vec<LiveSlot> = {
            let mut slots = self.slots.lock().await;
            slots.live.drain().map(|(_, slot)| slot).collect()
        };
        if !live.is_empty() {
            info!(pools = live.len(), "shutting down connection pools");
        }
        self.pools_retired
            .fetch_add(live.len() as u64, Ordering::Relaxed);
        futures::future::join_all(live.iter().map(|slot| slot.handle.pool.retire())).await;

        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.retiring.lock());
        for task in pending {
            if let Err(e) = task.await {
                warn!(error = %e, "pool retirement task failed");
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn build_pool(&self, descriptor: &ConnectionDescriptor, fingerprint: PoolFingerprint) -> PoolHandle {
        let connection = ConnectionConfig::with_endpoint(descriptor.target.endpoint())
            .with_tls(descriptor.tls.clone())
            .with_connect_timeout(self.settings.connect_timeout)
            .with_application_name(self.settings.application_name.clone());
        let config = PoolConfig::from_connection(connection)
            .with_max_size(descriptor.pool_size)
            .with_acquire_timeout(self.settings.acquire_timeout);

        self.pools_created.fetch_add(1, Ordering::Relaxed);
        info!(
            label = %descriptor.label,
            endpoint = %descriptor.target.redacted(),
            fingerprint = %fingerprint,
            max_size = descriptor.pool_size,
            "creating connection pool"
        );

        PoolHandle {
            label: Arc::from(descriptor.label.as_str()),
            fingerprint,
            pool: ConnectionPool::new(config, Arc::clone(&self.factory)),
        }
    }

    fn retire_in_background(&self, handle: PoolHandle) {
        self.pools_retired.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            handle.pool.retire().await;
            debug!(label = %handle.label, fingerprint = %handle.fingerprint, "pool retired");
        });

        let mut retiring = self.retiring.lock();
        retiring.retain(|t| !t.is_finished());
        retiring.push(task);
    }
}
