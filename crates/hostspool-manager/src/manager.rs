//! HostsPoolManager — the only writer of hosts pool state.
//!
//! Every host mutation is a read-modify-write guarded by the host
//! checkpoint. A write that lost the race re-reads the host and retries,
//! up to `max_update_retries` times, before failing with
//! `OutdatedCheckpoint`. `apply` is the exception: the caller supplies the
//! pool checkpoint it read, so a conflict is reported, never retried.
//!
//! `allocate` records the allocation as pending but does not consume
//! capacity; the caller follows it with `update_resources_labels`, which
//! settles it. Until then, other allocation decisions, in this process or
//! another one sharing the store, count the pending allocation as
//! consumed. Callers in one process hold
//! [`HostsPoolManager::lock_allocations`] across the pair.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hostspool_core::config::{HOSTS_POOL_LOCATION_TYPE, ManagerConfig};
use hostspool_placement::{
    ElementOp, Filter, GenericResourceDemand, PlacementPolicy, ResourceOp, available_labels, fits,
    host_to_candidate, matches_all, normalize_labels, rank_candidates, remaining_from_declared,
    update_generic_resource_labels, update_resource_labels,
};
use hostspool_state::{
    Allocation, Connection, GenericResource, Host, HostStatus, HostWrite, LocationConfig,
    StateError, StateStore, Versioned,
};

use crate::connection::{ConnectionChecker, NoopChecker, TcpChecker};
use crate::error::{PoolError, PoolResult};

/// Tunables of the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_update_retries: u32,
    pub check_connections: bool,
    pub connection_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for ManagerOptions {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            max_update_retries: config.max_update_retries,
            check_connections: config.check_connections,
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
        }
    }
}

/// Declaration of one host in a whole-location `apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub connection: Connection,
    /// Declared labels; capacity labels are totals.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Hosts of a location matching a set of filters.
#[derive(Debug, Clone, Serialize)]
pub struct HostList {
    pub hosts: Vec<Versioned<Host>>,
    pub warnings: Vec<String>,
    /// Pool checkpoint to pass back to `apply`.
    pub checkpoint: u64,
}

/// What one node instance asks of the pool.
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub deployment_id: String,
    pub node_name: String,
    pub instance: String,
    pub shareable: bool,
    /// Prefer shareable hosts already carrying this deployment node.
    pub colocate: bool,
    /// Capacity to consume, keyed by capacity label.
    pub resources: HashMap<String, String>,
    pub generic_resources: Vec<GenericResourceDemand>,
    pub placement_policy: Option<String>,
}

impl AllocationRequest {
    pub fn id(&self) -> String {
        Allocation::build_id(&self.deployment_id, &self.node_name, &self.instance)
    }
}

#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub hostname: String,
    pub warnings: Vec<String>,
    pub allocation: Allocation,
}

struct Inner {
    store: StateStore,
    checker: Box<dyn ConnectionChecker>,
    options: ManagerOptions,
    allocation_lock: Mutex<()>,
}

/// Thread-safe handle on the hosts pool. Clones share the allocation lock.
#[derive(Clone)]
pub struct HostsPoolManager {
    inner: Arc<Inner>,
}

impl HostsPoolManager {
    /// Create a manager probing connections over TCP when
    /// `check_connections` is set.
    pub fn new(store: StateStore, options: ManagerOptions) -> Self {
        let checker: Box<dyn ConnectionChecker> = if options.check_connections {
            Box::new(TcpChecker::new(options.connection_timeout))
        } else {
            Box::new(NoopChecker)
        };
        Self::with_checker(store, options, checker)
    }

    pub fn with_checker(
        store: StateStore,
        options: ManagerOptions,
        checker: Box<dyn ConnectionChecker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                checker,
                options,
                allocation_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Serialize allocation decisions with their capacity accounting.
    pub fn lock_allocations(&self) -> MutexGuard<'_, ()> {
        self.inner
            .allocation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Locations ──────────────────────────────────────────────────

    /// Names of the hosts pool locations, ordered by name.
    pub fn list_locations(&self) -> PoolResult<Vec<String>> {
        Ok(self
            .inner
            .store
            .list_locations()?
            .into_iter()
            .filter(|l| l.location_type == HOSTS_POOL_LOCATION_TYPE)
            .map(|l| l.name)
            .collect())
    }

    /// Every configured location, whatever its type.
    pub fn locations(&self) -> PoolResult<Vec<LocationConfig>> {
        Ok(self.inner.store.list_locations()?)
    }

    pub fn get_location(&self, name: &str) -> PoolResult<LocationConfig> {
        self.inner
            .store
            .get_location(name)?
            .ok_or_else(|| PoolError::LocationNotFound(name.to_string()))
    }

    pub fn create_location(&self, location: &LocationConfig) -> PoolResult<()> {
        validate_location_name(&location.name)?;
        self.inner
            .store
            .create_location(location)
            .map_err(|e| match e {
                StateError::AlreadyExists(_) => PoolError::DuplicateName(location.name.clone()),
                e => e.into(),
            })?;
        info!(location = %location.name, kind = %location.location_type, "location created");
        Ok(())
    }

    pub fn update_location(&self, location: &LocationConfig) -> PoolResult<()> {
        self.get_location(&location.name)?;
        self.inner.store.put_location(location)?;
        info!(location = %location.name, "location updated");
        Ok(())
    }

    /// Delete a location and its hosts. Refused while a host is allocated.
    /// Hosts and location go in one store transaction guarded by the pool
    /// checkpoint, so an allocation recorded meanwhile forces a re-check.
    pub fn delete_location(&self, name: &str) -> PoolResult<()> {
        self.get_location(name)?;
        let removed = self.retry_on_conflict(name, name, || {
            let (hosts, checkpoint) = self.inner.store.list_hosts(name)?;
            if let Some(busy) = hosts.iter().find(|h| !h.value.allocations.is_empty()) {
                return Err(PoolError::HostAllocated(busy.value.name.clone()));
            }
            self.inner.store.delete_location(name, checkpoint)?;
            Ok(hosts.len())
        })?;
        info!(location = %name, hosts = removed, "location deleted");
        Ok(())
    }

    fn ensure_location(&self, location: &str) -> PoolResult<()> {
        match self.inner.store.get_location(location)? {
            Some(l) if l.location_type == HOSTS_POOL_LOCATION_TYPE => Ok(()),
            _ => Err(PoolError::LocationNotFound(location.to_string())),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Hosts of `location` matching every filter, with the warnings raised
    /// while matching and the pool checkpoint.
    pub fn list(&self, location: &str, filters: &[&str]) -> PoolResult<HostList> {
        self.ensure_location(location)?;
        let filters = filters
            .iter()
            .map(|f| Filter::parse(f))
            .collect::<Result<Vec<_>, _>>()?;
        let (hosts, checkpoint) = self.inner.store.list_hosts(location)?;

        let mut warnings = Vec::new();
        let mut matched = Vec::new();
        for stored in hosts {
            let (ok, host_warnings) = matches_all(&filters, &stored.value.labels);
            warnings.extend(
                host_warnings
                    .into_iter()
                    .map(|w| format!("host {}: {w}", stored.value.name)),
            );
            if ok {
                matched.push(stored);
            }
        }
        Ok(HostList {
            hosts: matched,
            warnings,
            checkpoint,
        })
    }

    pub fn get_host(&self, location: &str, name: &str) -> PoolResult<Versioned<Host>> {
        self.inner
            .store
            .get_host(location, name)?
            .ok_or_else(|| host_not_found(location, name))
    }

    // ── Host registration ──────────────────────────────────────────

    /// Register one host. Capacity labels are the host totals.
    pub fn add(
        &self,
        location: &str,
        name: &str,
        connection: Connection,
        mut labels: HashMap<String, String>,
    ) -> PoolResult<()> {
        validate_host_name(name)?;
        self.ensure_location(location)?;
        normalize_labels(&mut labels);
        let mut host = Host::new(name, connection, labels);
        self.probe(&mut host);
        self.inner
            .store
            .create_host(location, &host)
            .map_err(|e| match e {
                StateError::AlreadyExists(_) => PoolError::DuplicateName(name.to_string()),
                e => e.into(),
            })?;
        info!(%location, host = %name, status = %host.status, "host added");
        Ok(())
    }

    /// Make the location hold exactly `specs`: missing hosts are created,
    /// existing ones updated, unlisted ones deleted. All or nothing.
    pub fn apply(&self, location: &str, specs: &[HostSpec], checkpoint: u64) -> PoolResult<u64> {
        self.ensure_location(location)?;
        let mut declared = HashSet::new();
        for spec in specs {
            validate_host_name(&spec.name)?;
            if !declared.insert(spec.name.as_str()) {
                return Err(PoolError::DuplicateName(spec.name.clone()));
            }
        }

        let (existing, found) = self.inner.store.list_hosts(location)?;
        if found != checkpoint {
            return Err(PoolError::OutdatedCheckpoint {
                expected: checkpoint,
                found,
            });
        }

        let mut writes = Vec::new();
        for stored in &existing {
            if declared.contains(stored.value.name.as_str()) {
                continue;
            }
            if !stored.value.allocations.is_empty() {
                return Err(PoolError::HostAllocated(stored.value.name.clone()));
            }
            writes.push(HostWrite::Delete(stored.value.name.clone()));
        }

        let current: HashMap<&str, &Host> = existing
            .iter()
            .map(|v| (v.value.name.as_str(), &v.value))
            .collect();
        for spec in specs {
            let mut host = match current.get(spec.name.as_str()) {
                Some(stored) => {
                    let update = remaining_from_declared(&spec.labels, &stored.allocations)?;
                    for w in &update.warnings {
                        warn!(%location, host = %spec.name, "{w}");
                    }
                    let mut host = (*stored).clone();
                    host.connection = spec.connection.clone();
                    host.labels = update.labels;
                    host
                }
                None => {
                    let mut labels = spec.labels.clone();
                    normalize_labels(&mut labels);
                    Host::new(&spec.name, spec.connection.clone(), labels)
                }
            };
            self.probe(&mut host);
            writes.push(HostWrite::Put(host));
        }

        let checkpoint = self.inner.store.apply_hosts(location, checkpoint, &writes)?;
        info!(%location, hosts = specs.len(), checkpoint, "pool applied");
        Ok(checkpoint)
    }

    /// Update connection settings; empty fields keep their stored value.
    pub fn update_connection(
        &self,
        location: &str,
        name: &str,
        connection: &Connection,
    ) -> PoolResult<()> {
        self.retry_on_conflict(location, name, || {
            let stored = self.get_host(location, name)?;
            let mut host = stored.value;
            host.connection = host.connection.merged_with(connection);
            self.probe(&mut host);
            self.store_host(location, &host, stored.checkpoint)?;
            Ok(())
        })?;
        info!(%location, host = %name, "host connection updated");
        Ok(())
    }

    /// Add or replace labels. Capacity labels are totals; the stored value
    /// discounts what the host's allocations consume.
    pub fn add_labels(
        &self,
        location: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> PoolResult<Vec<String>> {
        self.retry_on_conflict(location, name, || {
            let stored = self.get_host(location, name)?;
            let mut host = stored.value;
            let update = remaining_from_declared(labels, &host.allocations)?;
            host.labels.extend(update.labels);
            self.store_host(location, &host, stored.checkpoint)?;
            for w in &update.warnings {
                warn!(%location, host = %name, "{w}");
            }
            Ok(update.warnings)
        })
    }

    pub fn remove_labels(&self, location: &str, name: &str, keys: &[String]) -> PoolResult<()> {
        self.retry_on_conflict(location, name, || {
            let stored = self.get_host(location, name)?;
            let mut host = stored.value;
            for key in keys {
                host.labels.remove(key);
            }
            self.store_host(location, &host, stored.checkpoint)?;
            Ok(())
        })
    }

    /// Remove a free host.
    pub fn remove(&self, location: &str, name: &str) -> PoolResult<()> {
        self.retry_on_conflict(location, name, || {
            let stored = self.get_host(location, name)?;
            if !stored.value.allocations.is_empty() {
                return Err(PoolError::HostAllocated(name.to_string()));
            }
            self.inner
                .store
                .delete_host(location, name, stored.checkpoint)
                .map_err(|e| state_error(location, name, e))
        })?;
        info!(%location, host = %name, "host removed");
        Ok(())
    }

    // ── Allocation ─────────────────────────────────────────────────

    pub fn check_placement_policy(&self, policy_type: &str) -> PoolResult<()> {
        PlacementPolicy::from_type(Some(policy_type))?;
        Ok(())
    }

    /// Pick a host for `request` and record the allocation on it.
    ///
    /// Candidates are hosts not in error, compatible with the request's
    /// shareability, matching every filter (plus one per generic resource)
    /// and with enough remaining capacity. The placement policy orders them.
    pub fn allocate(
        &self,
        location: &str,
        request: &AllocationRequest,
        filters: &[Filter],
    ) -> PoolResult<AllocationOutcome> {
        self.ensure_location(location)?;
        let policy = PlacementPolicy::from_type(request.placement_policy.as_deref())?;
        let mut filters = filters.to_vec();
        filters.extend(request.generic_resources.iter().map(GenericResourceDemand::filter));
        let id = request.id();
        self.retry_on_conflict(location, &id, || {
            self.try_allocate(location, request, &filters, policy)
        })
    }

    fn try_allocate(
        &self,
        location: &str,
        request: &AllocationRequest,
        filters: &[Filter],
        policy: PlacementPolicy,
    ) -> PoolResult<AllocationOutcome> {
        let id = request.id();
        let (hosts, _) = self.inner.store.list_hosts(location)?;

        let mut warnings = Vec::new();
        let mut eligible: Vec<Eligible> = Vec::new();
        for stored in hosts {
            if !accepts(&stored.value, request) {
                continue;
            }
            // Capacity as left once pending allocations are settled.
            let mut view = stored.value.clone();
            view.labels = match available_labels(&view.labels, &view.allocations) {
                Ok(labels) => labels,
                Err(e) => {
                    warnings.push(format!("host {}: {e}", view.name));
                    continue;
                }
            };
            let (matched, host_warnings) = matches_all(filters, &view.labels);
            warnings.extend(
                host_warnings
                    .into_iter()
                    .map(|w| format!("host {}: {w}", view.name)),
            );
            if !matched || !fits(&view.labels, &request.resources) {
                continue;
            }
            let Some(generic) = pick_generic(&view, &request.generic_resources) else {
                continue;
            };
            eligible.push(Eligible {
                stored,
                view,
                generic,
            });
        }

        if request.shareable && request.colocate {
            let hosts_node = |h: &Host| {
                h.allocations
                    .iter()
                    .any(|a| a.is_for_node(&request.deployment_id, &request.node_name))
            };
            if eligible.iter().any(|e| hosts_node(&e.view)) {
                eligible.retain(|e| hosts_node(&e.view));
            }
        }

        let no_candidate = || PoolError::NoCandidateHost {
            location: location.to_string(),
            allocation: id.clone(),
        };
        let candidates = eligible.iter().map(|e| host_to_candidate(&e.view)).collect();
        let best = rank_candidates(policy, candidates)
            .into_iter()
            .next()
            .ok_or_else(no_candidate)?;
        let Eligible {
            stored,
            generic: generic_resources,
            ..
        } = eligible
            .into_iter()
            .find(|e| e.view.name == best.name)
            .ok_or_else(no_candidate)?;

        let allocation = Allocation {
            id: id.clone(),
            deployment_id: request.deployment_id.clone(),
            node_name: request.node_name.clone(),
            instance: request.instance.clone(),
            shareable: request.shareable,
            resources: request.resources.clone(),
            generic_resources,
            placement_policy: policy.type_name().map(str::to_string),
            pending: true,
        };
        let mut host = stored.value;
        host.allocations.push(allocation.clone());
        host.status = HostStatus::Allocated;
        self.store_host(location, &host, stored.checkpoint)?;

        let shared = host.allocations.len() > 1;
        info!(%location, host = %host.name, allocation = %id, shared, "host allocated");
        Ok(AllocationOutcome {
            hostname: host.name,
            warnings,
            allocation,
        })
    }

    /// Remove the allocation of one node instance and return it, so the
    /// caller can give its resources back.
    pub fn release(
        &self,
        location: &str,
        hostname: &str,
        deployment_id: &str,
        node_name: &str,
        instance: &str,
    ) -> PoolResult<Allocation> {
        let id = Allocation::build_id(deployment_id, node_name, instance);
        let allocation = self.retry_on_conflict(location, hostname, || {
            let stored = self.get_host(location, hostname)?;
            let mut host = stored.value;
            let index = host
                .find_allocation(deployment_id, node_name, instance)
                .ok_or_else(|| PoolError::AllocationNotFound {
                    host: hostname.to_string(),
                    allocation: id.clone(),
                })?;
            let allocation = host.allocations.remove(index);
            if host.status != HostStatus::Error {
                host.status = host.allocation_status();
            }
            self.store_host(location, &host, stored.checkpoint)?;
            Ok(allocation)
        })?;
        info!(%location, host = %hostname, allocation = %id, "host released");
        Ok(allocation)
    }

    /// Apply capacity arithmetic to a stored host. Returns the
    /// inconsistencies found (clamped values, missing or doubled items).
    ///
    /// A subtraction settles one pending allocation consuming exactly
    /// these resources, in the same write.
    pub fn update_resources_labels(
        &self,
        location: &str,
        hostname: &str,
        resources: &HashMap<String, String>,
        op: ResourceOp,
        generic_resources: &[GenericResource],
        generic_op: ElementOp,
    ) -> PoolResult<Vec<String>> {
        self.retry_on_conflict(location, hostname, || {
            let stored = self.get_host(location, hostname)?;
            let mut host = stored.value;
            let numeric = update_resource_labels(&host.labels, resources, op)?;
            let generic = update_generic_resource_labels(&numeric.labels, generic_resources, generic_op);
            host.labels = generic.labels;
            if op == ResourceOp::Subtract {
                if let Some(allocation) = host.allocations.iter_mut().find(|a| {
                    a.pending
                        && a.resources == *resources
                        && a.generic_resources == generic_resources
                }) {
                    allocation.pending = false;
                }
            }
            self.store_host(location, &host, stored.checkpoint)?;
            debug!(%location, host = %hostname, ?op, ?generic_op, "resource labels updated");
            let mut warnings = numeric.warnings;
            warnings.extend(generic.warnings);
            Ok(warnings)
        })
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn store_host(&self, location: &str, host: &Host, checkpoint: u64) -> PoolResult<u64> {
        self.inner
            .store
            .update_host(location, host, checkpoint)
            .map_err(|e| state_error(location, &host.name, e))
    }

    fn retry_on_conflict<T>(
        &self,
        location: &str,
        subject: &str,
        mut op: impl FnMut() -> PoolResult<T>,
    ) -> PoolResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(PoolError::OutdatedCheckpoint { expected, found })
                    if attempt < self.inner.options.max_update_retries =>
                {
                    attempt += 1;
                    debug!(%location, %subject, expected, found, attempt, "checkpoint conflict, retrying");
                }
                result => return result,
            }
        }
    }

    /// Probe the host connection; a failure puts the host in error, a
    /// success takes it out.
    fn probe(&self, host: &mut Host) {
        match self.inner.checker.check(&host.connection) {
            Ok(()) => {
                if host.status == HostStatus::Error {
                    host.settle_status();
                }
            }
            Err(reason) => {
                warn!(host = %host.name, %reason, "host connection check failed");
                host.mark_error(reason);
            }
        }
    }
}

/// A host passing the allocation checks, with its labels net of pending
/// allocations and the generic items it would give.
struct Eligible {
    stored: Versioned<Host>,
    view: Host,
    generic: Vec<GenericResource>,
}

fn accepts(host: &Host, request: &AllocationRequest) -> bool {
    let held = host
        .find_allocation(&request.deployment_id, &request.node_name, &request.instance)
        .is_some();
    if host.status == HostStatus::Error || held {
        return false;
    }
    if request.shareable {
        host.is_shared()
    } else {
        host.allocations.is_empty()
    }
}

fn pick_generic(host: &Host, demands: &[GenericResourceDemand]) -> Option<Vec<GenericResource>> {
    demands
        .iter()
        .map(|d| d.pick(&host.generic_resource_items(&d.name)))
        .collect()
}

fn host_not_found(location: &str, name: &str) -> PoolError {
    PoolError::HostNotFound {
        location: location.to_string(),
        host: name.to_string(),
    }
}

fn state_error(location: &str, name: &str, err: StateError) -> PoolError {
    match err {
        StateError::NotFound(_) => host_not_found(location, name),
        e => e.into(),
    }
}

fn validate_host_name(name: &str) -> PoolResult<()> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(PoolError::InvalidHostName(name.to_string()));
    }
    Ok(())
}

fn validate_location_name(name: &str) -> PoolResult<()> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(PoolError::InvalidProperty {
            name: "name".to_string(),
            reason: format!("invalid location name {name:?}"),
        });
    }
    Ok(())
}
