use crate::config::{BlockConfig, StatePaths, load_or_migrate};
use crate::devices::DeviceMap;
use crate::error::Result;
use crate::events::EventBus;
use crate::index::{self, DomainIndex, DomainRecord};
use crate::metrics::Metrics;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

/// Shared state of the filtering engine, owned by startup and handed to the
/// query handler, the background loops and the admin API as one `Arc`.
///
/// Write-lock acquisition order (outermost first): download -> staging ->
/// index. The config and device-map locks are leaf-level: their writers
/// (admin handlers, the minute tick) never acquire another lock while
/// holding them. The query path reads config and then the index, which is
/// safe because index writers take no further locks.
pub struct Core {
    index: RwLock<Option<DomainIndex>>,
    config: RwLock<BlockConfig>,
    pub devices: Arc<DeviceMap>,
    pub metrics: Metrics,
    pub events: Arc<dyn EventBus>,

    /// At most one outer download at a time; queued callers abandon.
    pub(crate) download_lock: Mutex<()>,
    /// Serializes staging ingestion against the production swap.
    pub(crate) staging_lock: Mutex<()>,

    spr_enabled: bool,
    paths: StatePaths,
    shutdown: broadcast::Sender<()>,
}

impl Core {
    /// Open the production index and load the config document. Failure to
    /// open the index is the one fatal startup error.
    pub fn open(
        paths: StatePaths,
        spr_enabled: bool,
        events: Arc<dyn EventBus>,
    ) -> Result<Arc<Self>> {
        let config = if spr_enabled {
            load_or_migrate(&paths)
        } else {
            BlockConfig::default()
        };

        let index = DomainIndex::open(&paths.db_path())?;
        let metrics = Metrics::new()?;
        metrics.set_blocked_domains(index.count());

        let (shutdown, _) = broadcast::channel(1);

        info!(
            spr_enabled,
            domains = index.count(),
            db = %paths.db_path().display(),
            "filtering core opened"
        );

        Ok(Arc::new(Self {
            index: RwLock::new(Some(index)),
            config: RwLock::new(config),
            devices: Arc::new(DeviceMap::new()),
            metrics,
            events,
            download_lock: Mutex::new(()),
            staging_lock: Mutex::new(()),
            spr_enabled,
            paths,
            shutdown,
        }))
    }

    pub fn spr_enabled(&self) -> bool {
        self.spr_enabled
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn config(&self) -> RwLockReadGuard<'_, BlockConfig> {
        self.config.read()
    }

    /// Write access for the admin API. Callers persist with `save_config`
    /// after releasing the guard.
    pub fn config_mut(&self) -> RwLockWriteGuard<'_, BlockConfig> {
        self.config.write()
    }

    /// Re-read the config document from disk, keeping the in-memory value
    /// on failure.
    pub fn reload_config(&self) {
        if !self.spr_enabled {
            return;
        }
        let fresh = load_or_migrate(&self.paths);
        *self.config.write() = fresh;
    }

    pub fn save_config(&self) -> Result<()> {
        let snapshot = self.config.read().clone();
        snapshot.save(&self.paths.config_path())
    }

    /// Enabled lists with their original positions as list ids, or the
    /// hard-coded default list when SPR mode is off.
    pub fn enabled_block_lists(&self) -> Vec<(String, i64)> {
        if self.spr_enabled {
            self.config
                .read()
                .block_lists
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.enabled)
                .map(|(id, entry)| (entry.uri.clone(), id as i64))
                .collect()
        } else {
            vec![(crate::ingest::DEFAULT_BLOCKLIST_URI.to_string(), 0)]
        }
    }

    /// Query-path read. Storage errors are treated as "not present" so a
    /// sick index degrades to not-blocking rather than an outage.
    pub fn index_get(&self, fqdn: &str) -> Option<DomainRecord> {
        let guard = self.index.read();
        match guard.as_ref()?.get(fqdn) {
            Ok(record) => record,
            Err(e) => {
                warn!(fqdn, error = %e, "index read failed, treating as absent");
                None
            }
        }
    }

    pub fn index_put(&self, fqdn: &str, record: &DomainRecord) -> Result<()> {
        let guard = self.index.read();
        match guard.as_ref() {
            Some(index) => index.put(fqdn, record),
            None => Ok(()),
        }
    }

    pub fn index_count(&self) -> i64 {
        self.index
            .read()
            .as_ref()
            .map(|index| index.count())
            .unwrap_or(0)
    }

    pub fn index_keys(&self) -> Result<Vec<String>> {
        match self.index.read().as_ref() {
            Some(index) => index.keys(),
            None => Ok(Vec::new()),
        }
    }

    /// Promote the staging index built by the list ingestor. Holds the
    /// staging lock for the whole swap and the index write lock while the
    /// production handle is closed, so no reader ever sees a dead handle.
    /// On failure the previous production index is reopened untouched.
    pub async fn transfer_staging(&self) -> Result<()> {
        let _staging = self.staging_lock.lock().await;
        let db_path = self.paths.db_path();

        let mut guard = self.index.write();
        drop(guard.take()); // close production before the rename

        let result = index::swap_staging_into_production(&db_path);
        match result {
            Ok(fresh) => {
                let count = fresh.count();
                *guard = Some(fresh);
                drop(guard);
                self.metrics.set_blocked_domains(count);
                info!(domains = count, "block index refreshed");
                Ok(())
            }
            Err(e) => {
                // staging was unusable; put the old production back
                *guard = Some(DomainIndex::open(&db_path)?);
                Err(e)
            }
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
