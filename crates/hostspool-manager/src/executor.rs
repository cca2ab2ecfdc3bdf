//! Delegate executor — installs and uninstalls a deployment node on the
//! hosts pool.
//!
//! Install allocates one host per node instance and writes the host's
//! connection data back to the instance. Uninstall releases them. Every
//! instance is handled on its own: an install stops at the first instance
//! that cannot get a host, an uninstall goes through all instances and
//! reports the failures together.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hostspool_core::{Value, ValueError};
use hostspool_placement::{ElementOp, Filter, GenericResourceRequest, ResourceOp};
use hostspool_state::{
    Allocation, LABEL_DISK_SIZE, LABEL_MEM_SIZE, LABEL_NUM_CPUS, LABEL_PRIVATE_ADDRESS,
    LABEL_PUBLIC_ADDRESS, split_items,
};

use crate::error::{PoolError, PoolResult};
use crate::manager::{AllocationOutcome, AllocationRequest, HostsPoolManager};
use crate::topology::{DeploymentStore, NodeState};

/// Node metadata naming the location to allocate from.
pub const LOCATION_METADATA_KEY: &str = "location";
/// Capability holding the compute requirements of a node.
pub const HOST_CAPABILITY: &str = "host";
/// Capability receiving the connection data of the allocated host.
pub const ENDPOINT_CAPABILITY: &str = "endpoint";

const CAPACITY_PROPERTIES: [(&str, &str); 3] = [
    ("num_cpus", LABEL_NUM_CPUS),
    ("mem_size", LABEL_MEM_SIZE),
    ("disk_size", LABEL_DISK_SIZE),
];

/// Allocation parameters shared by every instance of a node.
#[derive(Debug, Default)]
struct NodePlan {
    resources: HashMap<String, String>,
    filters: Vec<Filter>,
    shareable: bool,
    colocate: bool,
    placement_policy: Option<String>,
    generic_resources: Vec<GenericResourceRequest>,
}

/// Compensation for a completed forward step.
#[derive(Debug, Clone, Copy)]
enum UndoStep {
    Release,
    RestoreResources,
}

/// Undo log of one instance install.
struct Saga<'a> {
    manager: &'a HostsPoolManager,
    location: &'a str,
    hostname: String,
    allocation: Allocation,
    steps: Vec<UndoStep>,
}

impl<'a> Saga<'a> {
    fn new(manager: &'a HostsPoolManager, location: &'a str, outcome: &AllocationOutcome) -> Self {
        Self {
            manager,
            location,
            hostname: outcome.hostname.clone(),
            allocation: outcome.allocation.clone(),
            steps: vec![UndoStep::Release],
        }
    }

    fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    /// Undo the completed steps, latest first. Failures are logged only.
    fn rollback(self) {
        let a = &self.allocation;
        for step in self.steps.into_iter().rev() {
            let result = match step {
                UndoStep::Release => self
                    .manager
                    .release(self.location, &self.hostname, &a.deployment_id, &a.node_name, &a.instance)
                    .map(|_| ()),
                UndoStep::RestoreResources => self
                    .manager
                    .update_resources_labels(
                        self.location,
                        &self.hostname,
                        &a.resources,
                        ResourceOp::Add,
                        &a.generic_resources,
                        ElementOp::AddElements,
                    )
                    .map(|_| ()),
            };
            match result {
                Ok(()) => debug!(host = %self.hostname, allocation = %a.id, ?step, "rolled back"),
                Err(e) => warn!(
                    location = %self.location,
                    host = %self.hostname,
                    allocation = %a.id,
                    ?step,
                    error = %e,
                    "failed to roll back host allocation"
                ),
            }
        }
    }
}

/// Runs delegate operations of deployment nodes against the pool.
pub struct DelegateExecutor {
    manager: HostsPoolManager,
    deployments: Arc<dyn DeploymentStore>,
}

impl DelegateExecutor {
    pub fn new(manager: HostsPoolManager, deployments: Arc<dyn DeploymentStore>) -> Self {
        Self {
            manager,
            deployments,
        }
    }

    /// Run `install` or `uninstall`. Returns the warnings raised on the way.
    pub fn execute(&self, deployment: &str, node: &str, operation: &str) -> PoolResult<Vec<String>> {
        match operation.to_ascii_lowercase().as_str() {
            "install" => self.install(deployment, node),
            "uninstall" => self.uninstall(deployment, node),
            _ => Err(PoolError::UnsupportedOperation(operation.to_string())),
        }
    }

    /// Allocate a host to every instance of the node.
    pub fn install(&self, deployment: &str, node: &str) -> PoolResult<Vec<String>> {
        let location = self.resolve_location(deployment, node)?;
        let plan = self.node_plan(deployment, node)?;
        let instances = self.deployments.node_instances(deployment, node)?;
        info!(%deployment, %node, %location, instances = instances.len(), "installing node on hosts pool");

        let mut warnings = Vec::new();
        for (position, instance) in instances.iter().enumerate() {
            self.set_state(deployment, node, instance, NodeState::Creating);
            let index = instance.parse().unwrap_or(position);
            match self.install_instance(deployment, node, instance, index, &location, &plan) {
                Ok(instance_warnings) => {
                    warnings.extend(instance_warnings);
                    self.set_state(deployment, node, instance, NodeState::Started);
                }
                Err(e) => {
                    self.set_state(deployment, node, instance, NodeState::Error);
                    return Err(PoolError::InstallFailed {
                        deployment: deployment.to_string(),
                        node: node.to_string(),
                        instance: instance.to_string(),
                        location,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(warnings)
    }

    /// Release the host of every instance of the node.
    pub fn uninstall(&self, deployment: &str, node: &str) -> PoolResult<Vec<String>> {
        let location = self.resolve_location(deployment, node)?;
        let instances = self.deployments.node_instances(deployment, node)?;
        info!(%deployment, %node, %location, instances = instances.len(), "uninstalling node from hosts pool");

        let mut warnings = Vec::new();
        let mut failures = Vec::new();
        for instance in &instances {
            self.set_state(deployment, node, instance, NodeState::Deleting);
            match self.uninstall_instance(deployment, node, instance, &location) {
                Ok(instance_warnings) => {
                    warnings.extend(instance_warnings);
                    self.set_state(deployment, node, instance, NodeState::Deleted);
                }
                Err(e) => {
                    warn!(%deployment, %node, %instance, error = %e, "failed to release host");
                    failures.push(format!("instance {instance}: {e}"));
                    self.set_state(deployment, node, instance, NodeState::Error);
                }
            }
        }
        if failures.is_empty() {
            Ok(warnings)
        } else {
            Err(PoolError::ReleaseFailed { failures })
        }
    }

    fn install_instance(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        index: usize,
        location: &str,
        plan: &NodePlan,
    ) -> PoolResult<Vec<String>> {
        let generic_resources = plan
            .generic_resources
            .iter()
            .map(|r| r.for_instance(index))
            .collect::<Result<Vec<_>, _>>()?;
        let request = AllocationRequest {
            deployment_id: deployment.to_string(),
            node_name: node.to_string(),
            instance: instance.to_string(),
            shareable: plan.shareable,
            colocate: plan.colocate,
            resources: plan.resources.clone(),
            generic_resources,
            placement_policy: plan.placement_policy.clone(),
        };

        let (outcome, mut saga, mut warnings) = {
            let _guard = self.manager.lock_allocations();
            let outcome = self.manager.allocate(location, &request, &plan.filters)?;
            let mut saga = Saga::new(&self.manager, location, &outcome);
            let consumed = match self.manager.update_resources_labels(
                location,
                &outcome.hostname,
                &outcome.allocation.resources,
                ResourceOp::Subtract,
                &outcome.allocation.generic_resources,
                ElementOp::RemoveElements,
            ) {
                Ok(consumed) => consumed,
                Err(e) => {
                    saga.rollback();
                    return Err(e);
                }
            };
            saga.push(UndoStep::RestoreResources);
            let mut warnings = outcome.warnings.clone();
            warnings.extend(consumed);
            (outcome, saga, warnings)
        };

        if let Err(e) = self.write_back(deployment, node, instance, location, &outcome, &mut warnings) {
            // Hold the lock while handing capacity back.
            let _guard = self.manager.lock_allocations();
            saga.rollback();
            return Err(e);
        }
        saga.steps.clear();
        info!(%deployment, %node, %instance, host = %outcome.hostname, "instance allocated");
        Ok(warnings)
    }

    fn uninstall_instance(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        location: &str,
    ) -> PoolResult<Vec<String>> {
        let hostname = self
            .deployments
            .instance_attribute(deployment, node, instance, "hostname")?
            .map(|v| v.raw_string())
            .filter(|h| !h.is_empty());
        let Some(hostname) = hostname else {
            let msg = format!(
                "instance {instance} of node {node} has no hostname, it was never allocated"
            );
            warn!(%deployment, %node, %instance, "{msg}");
            return Ok(vec![msg]);
        };

        let _guard = self.manager.lock_allocations();
        // A missing allocation leaves the host labels untouched.
        let allocation = self
            .manager
            .release(location, &hostname, deployment, node, instance)?;
        if allocation.pending {
            let msg = format!(
                "allocation {} on host {hostname} never consumed its resources, nothing to give back",
                allocation.id
            );
            warn!(%deployment, %node, %instance, host = %hostname, "{msg}");
            return Ok(vec![msg]);
        }
        self.manager.update_resources_labels(
            location,
            &hostname,
            &allocation.resources,
            ResourceOp::Add,
            &allocation.generic_resources,
            ElementOp::AddElements,
        )
    }

    /// Publish the allocated host on the instance.
    fn write_back(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        location: &str,
        outcome: &AllocationOutcome,
        warnings: &mut Vec<String>,
    ) -> PoolResult<()> {
        let host = self.manager.get_host(location, &outcome.hostname)?.value;
        let set_attribute = |name: &str, value: Value| {
            self.deployments
                .set_instance_attribute(deployment, node, instance, name, value)
        };
        let set_endpoint = |name: &str, value: Value| {
            self.deployments.set_capability_attribute(
                deployment,
                node,
                instance,
                ENDPOINT_CAPABILITY,
                name,
                value,
            )
        };

        set_attribute("hostname", host.name.as_str().into())?;
        for resource in &outcome.allocation.generic_resources {
            set_attribute(&resource.name, resource.value().into())?;
        }

        let connection = &host.connection;
        set_endpoint("ip_address", connection.host.as_str().into())?;
        let mut credentials = BTreeMap::new();
        if !connection.user.is_empty() {
            credentials.insert("user".to_string(), Value::from(connection.user.as_str()));
        }
        if !connection.password.is_empty() {
            credentials.insert("token".to_string(), Value::from(connection.password.as_str()));
        }
        if !connection.private_key.is_empty() {
            let keys = BTreeMap::from([("0".to_string(), Value::from(connection.private_key.as_str()))]);
            credentials.insert("keys".to_string(), Value::Map(keys));
        }
        set_endpoint("credentials", Value::Map(credentials))?;

        let private_address = match host.labels.get(LABEL_PRIVATE_ADDRESS) {
            Some(address) => address.clone(),
            None => {
                let msg = format!(
                    "host {} has no {LABEL_PRIVATE_ADDRESS} label, using its connection host {:?}",
                    host.name, connection.host
                );
                warn!(%location, host = %host.name, "{msg}");
                warnings.push(msg);
                connection.host.clone()
            }
        };
        set_attribute("ip_address", private_address.as_str().into())?;
        set_attribute("private_address", private_address.into())?;
        if let Some(public) = host.labels.get(LABEL_PUBLIC_ADDRESS) {
            set_attribute("public_address", public.as_str().into())?;
            set_attribute("public_ip_address", public.as_str().into())?;
        }
        if connection.port != 0 {
            set_endpoint("port", Value::Integer(i64::from(connection.port)))?;
        }
        Ok(())
    }

    // ── Topology inputs ────────────────────────────────────────────

    /// The location named in the node metadata, or the first configured one.
    fn resolve_location(&self, deployment: &str, node: &str) -> PoolResult<String> {
        let locations = self.manager.list_locations()?;
        let requested = self
            .deployments
            .node_metadata(deployment, node, LOCATION_METADATA_KEY)?
            .filter(|l| !l.is_empty());
        match requested {
            Some(name) if locations.contains(&name) => Ok(name),
            Some(name) => Err(PoolError::LocationNotFound(name)),
            None => locations.into_iter().next().ok_or(PoolError::NoLocation),
        }
    }

    fn node_plan(&self, deployment: &str, node: &str) -> PoolResult<NodePlan> {
        let mut plan = NodePlan::default();
        for (property, label) in CAPACITY_PROPERTIES {
            let value = self
                .deployments
                .capability_property(deployment, node, HOST_CAPABILITY, property)?;
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            let raw = value.raw_string();
            plan.filters.push(Filter::at_least(label, &raw)?);
            plan.resources.insert(label.to_string(), raw);
        }

        if let Some(value) = self.deployments.node_property(deployment, node, "filters")? {
            let filters = value
                .to_string_list()
                .map_err(|e| invalid_property("filters", e))?;
            for filter in filters {
                plan.filters.push(Filter::parse(&filter)?);
            }
        }

        plan.shareable = self.bool_property(deployment, node, "shareable")?;
        plan.colocate = self.bool_property(deployment, node, "colocate")?;

        let policies = self.deployments.placement_policies(deployment, node)?;
        if policies.len() > 1 {
            return Err(PoolError::MultiplePlacementPolicies(node.to_string()));
        }
        if let Some(policy) = policies.first() {
            self.manager.check_placement_policy(&policy.policy_type)?;
            plan.placement_policy = Some(policy.policy_type.clone());
        }

        if let Some(value) =
            self.deployments
                .capability_property(deployment, node, HOST_CAPABILITY, "resources")?
        {
            plan.generic_resources = parse_generic_requests(&value)?;
        }
        debug!(%deployment, %node, ?plan, "node allocation plan");
        Ok(plan)
    }

    fn bool_property(&self, deployment: &str, node: &str, name: &str) -> PoolResult<bool> {
        match self.deployments.node_property(deployment, node, name)? {
            Some(value) => value.to_bool().map_err(|e| invalid_property(name, e)),
            None => Ok(false),
        }
    }

    fn set_state(&self, deployment: &str, node: &str, instance: &str, state: NodeState) {
        if let Err(e) = self
            .deployments
            .set_instance_state(deployment, node, instance, state)
        {
            warn!(%deployment, %node, %instance, ?state, error = %e, "failed to set instance state");
        }
    }
}

fn invalid_property(name: &str, err: ValueError) -> PoolError {
    PoolError::InvalidProperty {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

/// Parse the `resources` property: a list of `{name, ids, number}` maps.
/// `ids` holds one entry per instance, either a list or a comma-separated
/// string.
fn parse_generic_requests(value: &Value) -> PoolResult<Vec<GenericResourceRequest>> {
    let invalid = |reason: String| PoolError::InvalidProperty {
        name: "resources".to_string(),
        reason,
    };
    let mut requests = Vec::new();
    for item in value.as_list().map_err(|e| invalid(e.to_string()))? {
        let fields = item.as_map().map_err(|e| invalid(e.to_string()))?;
        let name = fields
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("generic resource without a name".to_string()))?;

        let ids = match fields.get("ids") {
            None | Some(Value::Null) => Vec::new(),
            Some(ids) => ids
                .as_list()
                .map_err(|e| invalid(e.to_string()))?
                .iter()
                .map(|entry| match entry {
                    Value::List(_) => entry.to_string_list().map_err(|e| invalid(e.to_string())),
                    other => Ok(split_items(&other.raw_string())),
                })
                .collect::<PoolResult<Vec<_>>>()?,
        };

        let number = match fields.get("number") {
            None | Some(Value::Null) => 0,
            Some(Value::Integer(n)) => {
                usize::try_from(*n).map_err(|_| invalid(format!("invalid number {n} for {name}")))?
            }
            Some(other) => other
                .raw_string()
                .trim()
                .parse()
                .map_err(|_| invalid(format!("invalid number {other} for {name}")))?,
        };

        if ids.is_empty() && number == 0 {
            return Err(invalid(format!("generic resource {name} requests no item")));
        }
        requests.push(GenericResourceRequest {
            name: name.to_string(),
            ids,
            number,
        });
    }
    Ok(requests)
}
