use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::{Path, PathBuf};
use tracing::debug;

const DOMAIN_TREE: &str = "domains";

/// Value stored against each blocked FQDN.
///
/// `list_ids` are positions into the configured block lists at ingestion
/// time; stale positions are ignored at evaluation. A `disabled` record is
/// treated as absent for blocking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub list_ids: Vec<i64>,
    #[serde(default)]
    pub disabled: bool,
}

impl DomainRecord {
    pub fn for_list(list_id: i64) -> Self {
        Self {
            list_ids: vec![list_id],
            disabled: false,
        }
    }
}

/// Persistent, crash-safe mapping `fqdn -> DomainRecord`.
///
/// One instance owns the production path; a second, staging instance at
/// `<path>-staging` is built by the list ingestor and swapped in wholesale.
/// Dropping the index closes the underlying store.
#[derive(Debug)]
pub struct DomainIndex {
    tree: sled::Tree,
    // kept alive for the lifetime of the tree handle
    _db: sled::Db,
    path: PathBuf,
}

/// Staging sibling of a production index path.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("-staging");
    path.with_file_name(name)
}

impl DomainIndex {
    /// Open (or create) the index at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        let tree = db.open_tree(DOMAIN_TREE)?;
        Ok(Self {
            tree,
            _db: db,
            path: path.to_path_buf(),
        })
    }

    /// Open a fresh staging index next to the production path. Any previous
    /// staging leftovers are discarded.
    pub fn open_staging(production_path: &Path) -> Result<Self> {
        let path = staging_path(production_path);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Self::open(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, fqdn: &str) -> Result<Option<DomainRecord>> {
        match self.tree.get(fqdn.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Single-key write in its own transaction. Admin paths only; bulk
    /// ingestion goes through `bulk_put`.
    pub fn put(&self, fqdn: &str, record: &DomainRecord) -> Result<()> {
        let raw = serde_json::to_vec(record)?;
        self.tree.insert(fqdn.as_bytes(), raw)?;
        Ok(())
    }

    /// Write a batch atomically. A key that already exists keeps its record
    /// and gains the incoming `list_ids`; evaluation tolerates duplicates so
    /// no dedup happens here.
    pub fn bulk_put(&self, batch: &[(String, DomainRecord)]) -> Result<()> {
        self.tree
            .transaction(|tx| {
                for (fqdn, record) in batch {
                    let merged = match tx.get(fqdn.as_bytes())? {
                        Some(raw) => {
                            let mut current: DomainRecord = serde_json::from_slice(&raw)
                                .map_err(|e| {
                                    ConflictableTransactionError::Abort(GateError::Parse(
                                        e.to_string(),
                                    ))
                                })?;
                            current.list_ids.extend_from_slice(&record.list_ids);
                            current
                        }
                        None => record.clone(),
                    };
                    let raw = serde_json::to_vec(&merged).map_err(|e| {
                        ConflictableTransactionError::Abort(GateError::Parse(e.to_string()))
                    })?;
                    tx.insert(fqdn.as_bytes(), raw)?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => e.into(),
            })
    }

    pub fn count(&self) -> i64 {
        self.tree.len() as i64
    }

    /// Every key in the index, for the admin dump endpoint.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, _) = entry?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Swap a fully-built staging index into the production path.
///
/// The caller must have closed (dropped) both the production and staging
/// handles and must hold the core's staging lock. Verifies the staging
/// directory exists before touching production, so a failed build never
/// destroys the live index.
pub fn swap_staging_into_production(production_path: &Path) -> Result<DomainIndex> {
    let staging = staging_path(production_path);
    if !staging.exists() {
        return Err(GateError::StagingMissing(
            staging.to_string_lossy().into_owned(),
        ));
    }
    if production_path.exists() {
        std::fs::remove_dir_all(production_path)?;
    }
    std::fs::rename(&staging, production_path)?;
    debug!(path = %production_path.display(), "staging index promoted");
    DomainIndex::open(production_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = DomainIndex::open(&dir.path().join("dns.db")).unwrap();

        let rec = DomainRecord::for_list(3);
        index.put("ads.example.", &rec).unwrap();

        assert_eq!(index.get("ads.example.").unwrap(), Some(rec));
        assert_eq!(index.get("other.example.").unwrap(), None);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_bulk_put_merges_list_ids() {
        let dir = TempDir::new().unwrap();
        let index = DomainIndex::open(&dir.path().join("dns.db")).unwrap();

        index
            .bulk_put(&[
                ("a.example.".to_string(), DomainRecord::for_list(0)),
                ("b.example.".to_string(), DomainRecord::for_list(0)),
            ])
            .unwrap();
        index
            .bulk_put(&[("a.example.".to_string(), DomainRecord::for_list(1))])
            .unwrap();

        let rec = index.get("a.example.").unwrap().unwrap();
        assert_eq!(rec.list_ids, vec![0, 1]);
        assert!(!rec.disabled);
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_disabled_survives_merge() {
        let dir = TempDir::new().unwrap();
        let index = DomainIndex::open(&dir.path().join("dns.db")).unwrap();

        index
            .put(
                "a.example.",
                &DomainRecord {
                    list_ids: vec![0],
                    disabled: true,
                },
            )
            .unwrap();
        index
            .bulk_put(&[("a.example.".to_string(), DomainRecord::for_list(2))])
            .unwrap();

        let rec = index.get("a.example.").unwrap().unwrap();
        assert!(rec.disabled);
        assert_eq!(rec.list_ids, vec![0, 2]);
    }

    #[test]
    fn test_staging_swap_replaces_production() {
        let dir = TempDir::new().unwrap();
        let prod_path = dir.path().join("dns.db");

        let prod = DomainIndex::open(&prod_path).unwrap();
        prod.put("old.example.", &DomainRecord::for_list(0)).unwrap();
        prod.flush().unwrap();
        drop(prod);

        let staging = DomainIndex::open_staging(&prod_path).unwrap();
        staging
            .put("new.example.", &DomainRecord::for_list(0))
            .unwrap();
        staging.flush().unwrap();
        drop(staging);

        let prod = swap_staging_into_production(&prod_path).unwrap();
        assert_eq!(prod.get("old.example.").unwrap(), None);
        assert!(prod.get("new.example.").unwrap().is_some());
        assert_eq!(prod.count(), 1);
    }

    #[test]
    fn test_swap_without_staging_preserves_production() {
        let dir = TempDir::new().unwrap();
        let prod_path = dir.path().join("dns.db");

        let prod = DomainIndex::open(&prod_path).unwrap();
        prod.put("keep.example.", &DomainRecord::for_list(0))
            .unwrap();
        prod.flush().unwrap();
        drop(prod);

        let err = swap_staging_into_production(&prod_path).unwrap_err();
        assert!(matches!(err, GateError::StagingMissing(_)));

        let prod = DomainIndex::open(&prod_path).unwrap();
        assert!(prod.get("keep.example.").unwrap().is_some());
    }

    #[test]
    fn test_empty_staging_swap_yields_empty_production() {
        let dir = TempDir::new().unwrap();
        let prod_path = dir.path().join("dns.db");

        let prod = DomainIndex::open(&prod_path).unwrap();
        prod.put("old.example.", &DomainRecord::for_list(0)).unwrap();
        prod.flush().unwrap();
        drop(prod);

        let staging = DomainIndex::open_staging(&prod_path).unwrap();
        staging.flush().unwrap();
        drop(staging);

        let prod = swap_staging_into_production(&prod_path).unwrap();
        assert_eq!(prod.count(), 0);
    }

    #[test]
    fn test_open_staging_discards_leftovers() {
        let dir = TempDir::new().unwrap();
        let prod_path = dir.path().join("dns.db");

        let staging = DomainIndex::open_staging(&prod_path).unwrap();
        staging
            .put("stale.example.", &DomainRecord::for_list(0))
            .unwrap();
        staging.flush().unwrap();
        drop(staging);

        let staging = DomainIndex::open_staging(&prod_path).unwrap();
        assert_eq!(staging.count(), 0);
    }

    #[test]
    fn test_keys_lists_everything() {
        let dir = TempDir::new().unwrap();
        let index = DomainIndex::open(&dir.path().join("dns.db")).unwrap();

        index.put("a.example.", &DomainRecord::for_list(0)).unwrap();
        index.put("b.example.", &DomainRecord::for_list(0)).unwrap();

        let mut keys = index.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a.example.", "b.example."]);
    }
}
