use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Override entry kinds. Serialized as `"Permit"` / `"Block"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideType {
    Permit,
    Block,
}

/// One remote blocklist. Position in `BlockConfig::block_lists` is the
/// list id recorded against every domain ingested from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockList {
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(rename = "Enabled")]
    pub enabled: bool,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Category", default)]
    pub category: String,
    #[serde(rename = "DontBlock", default)]
    pub dont_block: bool,
}

/// A permit or block override for a single domain.
///
/// `client_ip` scopes the entry: empty or `"*"` applies to every client,
/// anything else must equal the requesting IP. `expiration` is unix
/// seconds, 0 means never.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainOverride {
    #[serde(rename = "Type")]
    pub r#type: OverrideType,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "ResultIP", default)]
    pub result_ip: String,
    #[serde(rename = "ResultCNAME", default)]
    pub result_cname: String,
    #[serde(rename = "ClientIP", default)]
    pub client_ip: String,
    #[serde(rename = "Expiration", default)]
    pub expiration: i64,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

/// Named group of overrides. Only entries of enabled lists are evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideList {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Enabled")]
    pub enabled: bool,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "PermitDomains", default)]
    pub permit_domains: Vec<DomainOverride>,
    #[serde(rename = "BlockDomains", default)]
    pub block_domains: Vec<DomainOverride>,
}

/// The persisted configuration document, owned by the admin API and
/// consumed read-mostly by the evaluator and the list ingestor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(rename = "BlockLists", default)]
    pub block_lists: Vec<BlockList>,
    #[serde(rename = "OverrideLists", default)]
    pub override_lists: Vec<OverrideList>,
    #[serde(rename = "ClientIPExclusions", default)]
    pub client_ip_exclusions: Vec<String>,
    #[serde(rename = "RefreshSeconds", default)]
    pub refresh_seconds: u64,
    #[serde(rename = "QuarantineHostIP", default)]
    pub quarantine_host_ip: String,
    #[serde(rename = "RebindingCheckDisable", default)]
    pub rebinding_check_disable: bool,
}

/// Pre-OverrideLists config shape, still found on upgraded routers.
#[derive(Debug, Default, Deserialize)]
struct LegacyBlockConfig {
    #[serde(rename = "BlockLists", default)]
    block_lists: Vec<BlockList>,
    #[serde(rename = "PermitDomains", default)]
    permit_domains: Vec<DomainOverride>,
    #[serde(rename = "BlockDomains", default)]
    block_domains: Vec<DomainOverride>,
    #[serde(rename = "ClientIPExclusions", default)]
    client_ip_exclusions: Vec<String>,
    #[serde(rename = "RefreshSeconds", default)]
    refresh_seconds: u64,
    #[serde(rename = "QuarantineHostIP", default)]
    quarantine_host_ip: String,
    #[serde(rename = "RebindingCheckDisable", default)]
    rebinding_check_disable: bool,
}

pub const DEFAULT_REFRESH_SECONDS: u64 = 7 * 24 * 60 * 60;

impl BlockConfig {
    /// Refresh interval with the 7-day default applied.
    pub fn effective_refresh_seconds(&self) -> u64 {
        if self.refresh_seconds == 0 {
            DEFAULT_REFRESH_SECONDS
        } else {
            self.refresh_seconds
        }
    }

    /// Permit entries of every enabled override list, in list order.
    pub fn permit_domains(&self) -> impl Iterator<Item = &DomainOverride> {
        self.override_lists
            .iter()
            .filter(|l| l.enabled)
            .flat_map(|l| l.permit_domains.iter())
    }

    /// Block entries of every enabled override list, in list order.
    pub fn block_domains(&self) -> impl Iterator<Item = &DomainOverride> {
        self.override_lists
            .iter()
            .filter(|l| l.enabled)
            .flat_map(|l| l.block_domains.iter())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config = serde_json::from_slice(&data)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    fn from_legacy(legacy: LegacyBlockConfig) -> Self {
        let mut override_lists = Vec::new();
        if !legacy.permit_domains.is_empty() || !legacy.block_domains.is_empty() {
            override_lists.push(OverrideList {
                name: "Default".to_string(),
                enabled: true,
                tags: Vec::new(),
                permit_domains: legacy.permit_domains,
                block_domains: legacy.block_domains,
            });
        }
        BlockConfig {
            block_lists: legacy.block_lists,
            override_lists,
            client_ip_exclusions: legacy.client_ip_exclusions,
            refresh_seconds: legacy.refresh_seconds,
            quarantine_host_ip: legacy.quarantine_host_ip,
            rebinding_check_disable: legacy.rebinding_check_disable,
        }
    }
}

/// Filesystem layout rooted at the runtime prefix (`$TEST_PREFIX`).
#[derive(Debug, Clone)]
pub struct StatePaths {
    prefix: PathBuf,
}

impl StatePaths {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn from_env() -> Self {
        let prefix = std::env::var("TEST_PREFIX").unwrap_or_default();
        Self::new(prefix)
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn config_path(&self) -> PathBuf {
        self.prefix.join("configs/dns/block_rules.json")
    }

    pub fn legacy_config_path(&self) -> PathBuf {
        self.prefix.join("state/dns/block_rules.json")
    }

    pub fn devices_path(&self) -> PathBuf {
        self.prefix.join("state/public/devices-public.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.prefix.join("state/dns/dns_block_plugin")
    }

    pub fn db_path(&self) -> PathBuf {
        self.prefix.join("state/dns/dns.db")
    }
}

/// Load the config document, migrating the legacy file into the new
/// location when only the old one exists. A missing or unreadable file
/// yields the default config; the previous on-disk state is never
/// clobbered by a parse failure.
pub fn load_or_migrate(paths: &StatePaths) -> BlockConfig {
    let config_path = paths.config_path();
    if config_path.exists() {
        match BlockConfig::load(&config_path) {
            Ok(config) => return config,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "failed to read block config");
                return BlockConfig::default();
            }
        }
    }

    let legacy_path = paths.legacy_config_path();
    if legacy_path.exists() {
        match fs::read(&legacy_path)
            .map_err(GateError::from)
            .and_then(|data| serde_json::from_slice::<LegacyBlockConfig>(&data).map_err(Into::into))
        {
            Ok(legacy) => {
                let config = BlockConfig::from_legacy(legacy);
                info!(from = %legacy_path.display(), to = %config_path.display(),
                    "migrated legacy block config");
                if let Err(e) = config.save(&config_path) {
                    warn!(error = %e, "failed to write migrated block config");
                }
                return config;
            }
            Err(e) => {
                warn!(path = %legacy_path.display(), error = %e, "failed to read legacy block config");
            }
        }
    }

    BlockConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> BlockConfig {
        BlockConfig {
            block_lists: vec![BlockList {
                uri: "https://example.invalid/hosts".to_string(),
                enabled: true,
                tags: vec!["kids".to_string()],
                category: "ads".to_string(),
                dont_block: false,
            }],
            override_lists: vec![OverrideList {
                name: "Default".to_string(),
                enabled: true,
                tags: vec![],
                permit_domains: vec![DomainOverride {
                    r#type: OverrideType::Permit,
                    domain: "good.example.".to_string(),
                    result_ip: String::new(),
                    result_cname: String::new(),
                    client_ip: "*".to_string(),
                    expiration: 0,
                    tags: vec![],
                }],
                block_domains: vec![],
            }],
            client_ip_exclusions: vec!["192.168.1.10".to_string()],
            refresh_seconds: 3600,
            quarantine_host_ip: "10.0.0.1".to_string(),
            rebinding_check_disable: false,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block_rules.json");

        let config = sample_config();
        config.save(&path).unwrap();
        let loaded = BlockConfig::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert!(json.get("BlockLists").is_some());
        assert!(json.get("OverrideLists").is_some());
        assert!(json.get("ClientIPExclusions").is_some());
        assert_eq!(json["BlockLists"][0]["URI"], "https://example.invalid/hosts");
        assert_eq!(json["BlockLists"][0]["DontBlock"], false);
        assert_eq!(
            json["OverrideLists"][0]["PermitDomains"][0]["Type"],
            "Permit"
        );
    }

    #[test]
    fn test_legacy_migration_wraps_flat_overrides() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());

        let legacy = serde_json::json!({
            "BlockLists": [{"URI": "https://example.invalid/hosts", "Enabled": true}],
            "PermitDomains": [{"Type": "Permit", "Domain": "good.example.", "ClientIP": "*"}],
            "BlockDomains": [{"Type": "Block", "Domain": "bad.example."}],
            "ClientIPExclusions": ["10.1.2.3"],
            "RefreshSeconds": 1234,
            "QuarantineHostIP": "10.0.0.1"
        });
        fs::create_dir_all(paths.legacy_config_path().parent().unwrap()).unwrap();
        fs::write(
            paths.legacy_config_path(),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let config = load_or_migrate(&paths);

        assert_eq!(config.block_lists.len(), 1);
        assert_eq!(config.refresh_seconds, 1234);
        assert_eq!(config.quarantine_host_ip, "10.0.0.1");
        assert_eq!(config.override_lists.len(), 1);
        let list = &config.override_lists[0];
        assert_eq!(list.name, "Default");
        assert!(list.enabled);
        assert!(list.tags.is_empty());
        assert_eq!(list.permit_domains.len(), 1);
        assert_eq!(list.block_domains.len(), 1);

        // the migrated config was persisted to the new path
        assert!(paths.config_path().exists());
        let reloaded = load_or_migrate(&paths);
        assert_eq!(config, reloaded);
    }

    #[test]
    fn test_missing_config_yields_default() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let config = load_or_migrate(&paths);
        assert_eq!(config, BlockConfig::default());
    }

    #[test]
    fn test_disabled_override_lists_are_skipped() {
        let mut config = sample_config();
        config.override_lists[0].enabled = false;
        assert_eq!(config.permit_domains().count(), 0);

        config.override_lists[0].enabled = true;
        assert_eq!(config.permit_domains().count(), 1);
    }

    #[test]
    fn test_effective_refresh_default() {
        let mut config = BlockConfig::default();
        assert_eq!(config.effective_refresh_seconds(), DEFAULT_REFRESH_SECONDS);
        config.refresh_seconds = 60;
        assert_eq!(config.effective_refresh_seconds(), 60);
    }
}
