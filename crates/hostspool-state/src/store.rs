//! StateStore — redb-backed coordination store for the hosts pool.
//!
//! Provides checkpointed CRUD over host records and plain CRUD over
//! location configurations. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Every host write runs in a single write transaction that re-reads the
//! stored checkpoint, compares it with the caller's, and bumps the
//! location's pool checkpoint. The new pool checkpoint becomes the host's
//! checkpoint, so checkpoints are unique and increasing within a location.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type BytesTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type CheckpointTable<'txn> = Table<'txn, &'static str, u64>;

/// One change of a whole-pool update.
#[derive(Debug, Clone, PartialEq)]
pub enum HostWrite {
    Put(Host),
    Delete(String),
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
        txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Get a host with the checkpoint it was stored at.
    pub fn get_host(&self, location: &str, name: &str) -> StateResult<Option<Versioned<Host>>> {
        let key = host_key(location, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: Versioned<Host> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every host of a location together with the pool checkpoint,
    /// both read from the same snapshot.
    pub fn list_hosts(&self, location: &str) -> StateResult<(Vec<Versioned<Host>>, u64)> {
        let prefix = location_prefix(location);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
        let checkpoint = pools
            .get(location)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: Versioned<Host> =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok((results, checkpoint))
    }

    /// Current pool checkpoint of a location (0 if nothing was ever written).
    pub fn pool_checkpoint(&self, location: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
        Ok(pools
            .get(location)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    /// Create a host. Fails with `AlreadyExists` if the key is taken.
    pub fn create_host(&self, location: &str, host: &Host) -> StateResult<u64> {
        let key = host_key(location, &host.name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let checkpoint;
        {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            if read_checkpoint(&hosts, &key)?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            let mut pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
            checkpoint = bump_pool(&mut pools, location)?;
            write_host(&mut hosts, &key, host, checkpoint)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, checkpoint, "host created");
        Ok(checkpoint)
    }

    /// Replace a host if its stored checkpoint still equals `expected`.
    pub fn update_host(&self, location: &str, host: &Host, expected: u64) -> StateResult<u64> {
        let key = host_key(location, &host.name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let checkpoint;
        {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            check_host_checkpoint(&hosts, &key, expected)?;
            let mut pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
            checkpoint = bump_pool(&mut pools, location)?;
            write_host(&mut hosts, &key, host, checkpoint)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, checkpoint, "host updated");
        Ok(checkpoint)
    }

    /// Delete a host if its stored checkpoint still equals `expected`.
    /// The key is matched exactly, never as a prefix.
    pub fn delete_host(&self, location: &str, name: &str, expected: u64) -> StateResult<()> {
        let key = host_key(location, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            check_host_checkpoint(&hosts, &key, expected)?;
            hosts.remove(key.as_str()).map_err(map_err!(Write))?;
            let mut pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
            bump_pool(&mut pools, location)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "host deleted");
        Ok(())
    }

    /// Apply a batch of host writes atomically if the pool checkpoint of
    /// the location still equals `expected`. Returns the new pool checkpoint.
    pub fn apply_hosts(&self, location: &str, expected: u64, writes: &[HostWrite]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let checkpoint;
        {
            let mut pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
            let found = pools
                .get(location)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            if found != expected {
                return Err(StateError::Conflict {
                    key: location.to_string(),
                    expected,
                    found,
                });
            }
            checkpoint = bump_pool(&mut pools, location)?;

            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            for write in writes {
                match write {
                    HostWrite::Put(host) => {
                        let key = host_key(location, &host.name);
                        write_host(&mut hosts, &key, host, checkpoint)?;
                    }
                    HostWrite::Delete(name) => {
                        let key = host_key(location, name);
                        hosts.remove(key.as_str()).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%location, checkpoint, writes = writes.len(), "pool applied");
        Ok(checkpoint)
    }

    // ── Locations ──────────────────────────────────────────────────

    /// Insert or update a location configuration.
    pub fn put_location(&self, location: &LocationConfig) -> StateResult<()> {
        let value = serde_json::to_vec(location).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(location.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %location.name, "location stored");
        Ok(())
    }

    /// Insert a location configuration. Fails with `AlreadyExists` if taken.
    pub fn create_location(&self, location: &LocationConfig) -> StateResult<()> {
        let value = serde_json::to_vec(location).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            let exists = table
                .get(location.name.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::AlreadyExists(location.name.clone()));
            }
            table
                .insert(location.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %location.name, "location created");
        Ok(())
    }

    /// Get a location configuration by name.
    pub fn get_location(&self, name: &str) -> StateResult<Option<LocationConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let location: LocationConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(location))
            }
            None => Ok(None),
        }
    }

    /// List all location configurations, ordered by name.
    pub fn list_locations(&self) -> StateResult<Vec<LocationConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let location: LocationConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(location);
        }
        Ok(results)
    }

    /// Delete a location with every host stored under it, in one write
    /// transaction, if the pool checkpoint still equals `expected`.
    /// Returns true if the location existed.
    pub fn delete_location(&self, name: &str, expected: u64) -> StateResult<bool> {
        let prefix = location_prefix(name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let removed;
        {
            let mut pools = txn.open_table(POOL_CHECKPOINTS).map_err(map_err!(Table))?;
            let found = pools
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            if found != expected {
                return Err(StateError::Conflict {
                    key: name.to_string(),
                    expected,
                    found,
                });
            }
            // Bumped rather than removed: checkpoints read before the
            // delete stay stale if the location is created again.
            bump_pool(&mut pools, name)?;

            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in hosts.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                hosts.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = keys.len();

            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed, hosts = removed, "location deleted");
        Ok(existed)
    }
}

/// Stored checkpoint of a host key, if the host exists.
fn read_checkpoint(hosts: &BytesTable<'_>, key: &str) -> StateResult<Option<u64>> {
    match hosts.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: Versioned<Host> =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record.checkpoint))
        }
        None => Ok(None),
    }
}

fn check_host_checkpoint(hosts: &BytesTable<'_>, key: &str, expected: u64) -> StateResult<()> {
    match read_checkpoint(hosts, key)? {
        None => Err(StateError::NotFound(key.to_string())),
        Some(found) if found != expected => Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            found,
        }),
        Some(_) => Ok(()),
    }
}

fn bump_pool(pools: &mut CheckpointTable<'_>, location: &str) -> StateResult<u64> {
    let current = pools
        .get(location)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    pools.insert(location, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn write_host(hosts: &mut BytesTable<'_>, key: &str, host: &Host, checkpoint: u64) -> StateResult<()> {
    let record = Versioned {
        checkpoint,
        value: host.clone(),
    };
    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
    hosts.insert(key, value.as_slice()).map_err(map_err!(Write))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_host(name: &str) -> Host {
        let mut labels = HashMap::new();
        labels.insert(LABEL_NUM_CPUS.to_string(), "4".to_string());
        Host::new(
            name,
            Connection {
                host: "10.0.0.1".to_string(),
                user: "root".to_string(),
                ..Default::default()
            },
            labels,
        )
    }

    fn test_location(name: &str) -> LocationConfig {
        LocationConfig {
            name: name.to_string(),
            location_type: "hostspool".to_string(),
            properties: serde_json::Map::new(),
        }
    }

    // ── Host CRUD ──────────────────────────────────────────────────

    #[test]
    fn host_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let host = test_host("host1");

        let checkpoint = store.create_host("lab", &host).unwrap();
        let retrieved = store.get_host("lab", "host1").unwrap().unwrap();

        assert_eq!(retrieved.value, host);
        assert_eq!(retrieved.checkpoint, checkpoint);
    }

    #[test]
    fn host_create_twice_fails() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_host("lab", &test_host("host1")).unwrap();

        let err = store.create_host("lab", &test_host("host1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn host_update_with_current_checkpoint() {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = test_host("host1");
        let first = store.create_host("lab", &host).unwrap();

        host.labels.insert("os".to_string(), "linux".to_string());
        let second = store.update_host("lab", &host, first).unwrap();

        assert!(second > first);
        let retrieved = store.get_host("lab", "host1").unwrap().unwrap();
        assert_eq!(retrieved.value.labels.get("os"), Some(&"linux".to_string()));
        assert_eq!(retrieved.checkpoint, second);
    }

    #[test]
    fn host_update_with_stale_checkpoint_is_rejected_without_mutation() {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = test_host("host1");
        let first = store.create_host("lab", &host).unwrap();

        host.labels.insert("os".to_string(), "linux".to_string());
        let second = store.update_host("lab", &host, first).unwrap();

        host.labels.insert("os".to_string(), "windows".to_string());
        let err = store.update_host("lab", &host, first).unwrap_err();
        match err {
            StateError::Conflict { expected, found, .. } => {
                assert_eq!(expected, first);
                assert_eq!(found, second);
            }
            other => panic!("unexpected error: {other}"),
        }

        let retrieved = store.get_host("lab", "host1").unwrap().unwrap();
        assert_eq!(retrieved.value.labels.get("os"), Some(&"linux".to_string()));
        assert_eq!(retrieved.checkpoint, second);
    }

    #[test]
    fn host_update_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update_host("lab", &test_host("ghost"), 1).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn host_delete_matches_exact_key() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_host("lab", &test_host("host1")).unwrap();
        store.create_host("lab", &test_host("host10")).unwrap();

        let checkpoint = store.get_host("lab", "host1").unwrap().unwrap().checkpoint;
        store.delete_host("lab", "host1", checkpoint).unwrap();

        assert!(store.get_host("lab", "host1").unwrap().is_none());
        assert!(store.get_host("lab", "host10").unwrap().is_some());
    }

    #[test]
    fn list_hosts_is_scoped_to_location() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_host("lab", &test_host("a")).unwrap();
        store.create_host("lab", &test_host("b")).unwrap();
        store.create_host("lab2", &test_host("c")).unwrap();

        let (lab, _) = store.list_hosts("lab").unwrap();
        assert_eq!(lab.len(), 2);

        let (lab2, _) = store.list_hosts("lab2").unwrap();
        assert_eq!(lab2.len(), 1);
        assert_eq!(lab2[0].value.name, "c");
    }

    #[test]
    fn pool_checkpoint_increases_on_every_host_write() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.pool_checkpoint("lab").unwrap(), 0);

        let c1 = store.create_host("lab", &test_host("a")).unwrap();
        let c2 = store.create_host("lab", &test_host("b")).unwrap();
        assert!(c2 > c1);
        assert_eq!(store.pool_checkpoint("lab").unwrap(), c2);

        store.delete_host("lab", "a", c1).unwrap();
        assert!(store.pool_checkpoint("lab").unwrap() > c2);
        // Other locations are unaffected.
        assert_eq!(store.pool_checkpoint("lab2").unwrap(), 0);
    }

    // ── Pool apply ─────────────────────────────────────────────────

    #[test]
    fn apply_hosts_is_atomic_and_checkpointed() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_host("lab", &test_host("old")).unwrap();
        let (_, checkpoint) = store.list_hosts("lab").unwrap();

        let writes = vec![
            HostWrite::Put(test_host("new1")),
            HostWrite::Put(test_host("new2")),
            HostWrite::Delete("old".to_string()),
        ];
        let next = store.apply_hosts("lab", checkpoint, &writes).unwrap();
        assert!(next > checkpoint);

        let (hosts, listed) = store.list_hosts("lab").unwrap();
        assert_eq!(listed, next);
        let mut names: Vec<_> = hosts.iter().map(|h| h.value.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["new1", "new2"]);
        assert!(hosts.iter().all(|h| h.checkpoint == next));
    }

    #[test]
    fn apply_hosts_with_stale_checkpoint_changes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let stale = store.pool_checkpoint("lab").unwrap();
        store.create_host("lab", &test_host("a")).unwrap();

        let err = store
            .apply_hosts("lab", stale, &[HostWrite::Delete("a".to_string())])
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
        assert!(store.get_host("lab", "a").unwrap().is_some());
    }

    // ── Locations ──────────────────────────────────────────────────

    #[test]
    fn location_crud() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_location(&test_location("lab")).unwrap();
        store.put_location(&test_location("cloud")).unwrap();

        assert!(matches!(
            store.create_location(&test_location("lab")).unwrap_err(),
            StateError::AlreadyExists(_)
        ));
        assert_eq!(store.get_location("lab").unwrap(), Some(test_location("lab")));

        let names: Vec<_> = store
            .list_locations()
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["cloud", "lab"]);

        let checkpoint = store.pool_checkpoint("lab").unwrap();
        assert!(store.delete_location("lab", checkpoint).unwrap());
        let checkpoint = store.pool_checkpoint("lab").unwrap();
        assert!(!store.delete_location("lab", checkpoint).unwrap());
        assert!(store.get_location("lab").unwrap().is_none());
    }

    #[test]
    fn delete_location_takes_its_hosts_along() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_location(&test_location("lab")).unwrap();
        store.create_location(&test_location("lab2")).unwrap();
        store.create_host("lab", &test_host("a")).unwrap();
        store.create_host("lab", &test_host("b")).unwrap();
        store.create_host("lab2", &test_host("c")).unwrap();

        let (_, checkpoint) = store.list_hosts("lab").unwrap();
        assert!(store.delete_location("lab", checkpoint).unwrap());

        assert!(store.list_hosts("lab").unwrap().0.is_empty());
        assert!(store.pool_checkpoint("lab").unwrap() > checkpoint);
        assert!(store.get_location("lab").unwrap().is_none());
        assert!(store.get_host("lab2", "c").unwrap().is_some());
        assert!(store.get_location("lab2").unwrap().is_some());
    }

    #[test]
    fn delete_location_with_stale_checkpoint_changes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_location(&test_location("lab")).unwrap();
        store.create_host("lab", &test_host("a")).unwrap();
        let (_, stale) = store.list_hosts("lab").unwrap();

        // A host write lands between the listing and the delete.
        let mut host = store.get_host("lab", "a").unwrap().unwrap();
        host.value.labels.insert("os".to_string(), "linux".to_string());
        store.update_host("lab", &host.value, host.checkpoint).unwrap();

        let err = store.delete_location("lab", stale).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
        assert!(store.get_location("lab").unwrap().is_some());
        assert!(store.get_host("lab", "a").unwrap().is_some());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pool.redb");

        let checkpoint = {
            let store = StateStore::open(&db_path).unwrap();
            store.create_host("lab", &test_host("host1")).unwrap()
        };

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let host = store.get_host("lab", "host1").unwrap().unwrap();
        assert_eq!(host.checkpoint, checkpoint);
        assert_eq!(store.pool_checkpoint("lab").unwrap(), checkpoint);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_hosts("any").unwrap().0.is_empty());
        assert!(store.list_locations().unwrap().is_empty());
        assert!(store.get_host("any", "h").unwrap().is_none());
        assert!(matches!(
            store.delete_host("any", "h", 0).unwrap_err(),
            StateError::NotFound(_)
        ));
    }
}
