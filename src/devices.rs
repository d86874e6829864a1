use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Policy string that quarantines a device.
const QUARANTINE_POLICY: &str = "quarantine";
/// Prefix of policies surfaced to the downstream forwarder.
const DNS_POLICY_PREFIX: &str = "dns:";

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// One device in the externally-maintained inventory file. Fields the
/// engine does not consult (MAC, WGPubKey, ...) are ignored on decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "RecentIP", default)]
    pub recent_ip: String,
    #[serde(rename = "DeviceTags", default)]
    pub device_tags: Vec<String>,
    #[serde(rename = "Policies", default)]
    pub policies: Vec<String>,
}

#[derive(Debug, Default)]
struct DeviceTables {
    tags: HashMap<String, HashSet<String>>,
    policies: HashMap<String, Vec<String>>,
}

/// Read-mostly view of the device inventory, keyed by client IP.
///
/// Rebuilt from scratch on every refresh and swapped under a single write
/// lock; a failed read leaves the previous maps intact.
#[derive(Default)]
pub struct DeviceMap {
    tables: RwLock<DeviceTables>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read the inventory file and swap in fresh maps. Missing or
    /// unparseable files keep the current state.
    pub fn refresh_from_file(&self, path: &Path) {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "device inventory not readable");
                return;
            }
        };

        let devices: HashMap<String, DeviceEntry> = match serde_json::from_slice(&data) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "device inventory parse failed");
                return;
            }
        };

        let mut fresh = DeviceTables::default();
        for entry in devices.into_values() {
            if entry.recent_ip.is_empty() {
                continue;
            }
            fresh
                .tags
                .insert(entry.recent_ip.clone(), entry.device_tags.into_iter().collect());
            fresh.policies.insert(entry.recent_ip, entry.policies);
        }

        let count = fresh.policies.len();
        *self.tables.write() = fresh;
        debug!(devices = count, "device maps refreshed");
    }

    /// True iff the client carries the quarantine policy.
    pub fn ip_quarantined(&self, ip: &str) -> bool {
        self.tables
            .read()
            .policies
            .get(ip)
            .is_some_and(|policies| policies.iter().any(|p| p == QUARANTINE_POLICY))
    }

    /// True iff the client's tags intersect `required`. An empty
    /// `required` set never matches.
    pub fn ip_has_tags(&self, ip: &str, required: &[String]) -> bool {
        if required.is_empty() {
            return false;
        }
        self.tables
            .read()
            .tags
            .get(ip)
            .is_some_and(|tags| required.iter().any(|t| tags.contains(t)))
    }

    /// DNS-steering policies of the client, in inventory order.
    pub fn client_dns_policies(&self, ip: &str) -> Vec<String> {
        self.tables
            .read()
            .policies
            .get(ip)
            .map(|policies| {
                policies
                    .iter()
                    .filter(|p| p.starts_with(DNS_POLICY_PREFIX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Test seam: install maps directly without a file.
    pub fn set_device(&self, ip: &str, tags: &[&str], policies: &[&str]) {
        let mut tables = self.tables.write();
        tables
            .tags
            .insert(ip.to_string(), tags.iter().map(|t| t.to_string()).collect());
        tables
            .policies
            .insert(ip.to_string(), policies.iter().map(|p| p.to_string()).collect());
    }
}

/// Minute tick keeping the maps fresh, with one refresh at startup.
pub async fn refresh_loop(
    devices: Arc<DeviceMap>,
    path: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) {
    devices.refresh_from_file(&path);

    let mut tick = interval(REFRESH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = tick.tick() => devices.refresh_from_file(&path),
            _ = shutdown.recv() => {
                info!("device refresh loop stopping");
                return;
            }
        }
    }
}
