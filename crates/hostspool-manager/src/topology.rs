//! Deployment store contract consumed by the delegate executor.
//!
//! The executor reads node properties, capabilities, and policies from a
//! deployment, and writes allocation results back as instance and
//! capability attributes. `MemoryDeployments` is an in-process
//! implementation used by the daemon's tests and embedders without an
//! external topology store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use hostspool_core::Value;

/// Lifecycle state of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Initial,
    Creating,
    Started,
    Deleting,
    Deleted,
    Error,
}

/// A placement policy targeting a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicyDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub policy_type: String,
}

/// Read/write access to deployment topology and instance state.
pub trait DeploymentStore: Send + Sync {
    fn node_metadata(&self, deployment: &str, node: &str, key: &str) -> Result<Option<String>>;

    fn node_property(&self, deployment: &str, node: &str, name: &str) -> Result<Option<Value>>;

    fn capability_property(
        &self,
        deployment: &str,
        node: &str,
        capability: &str,
        name: &str,
    ) -> Result<Option<Value>>;

    /// Placement policies applying to the node.
    fn placement_policies(&self, deployment: &str, node: &str) -> Result<Vec<PlacementPolicyDecl>>;

    fn node_instances(&self, deployment: &str, node: &str) -> Result<Vec<String>>;

    fn instance_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        name: &str,
    ) -> Result<Option<Value>>;

    fn set_instance_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        name: &str,
        value: Value,
    ) -> Result<()>;

    fn set_capability_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        capability: &str,
        name: &str,
        value: Value,
    ) -> Result<()>;

    fn set_instance_state(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        state: NodeState,
    ) -> Result<()>;
}

type NodeKey = (String, String);
type InstanceKey = (String, String, String);

#[derive(Default)]
struct NodeRecord {
    metadata: HashMap<String, String>,
    properties: HashMap<String, Value>,
    capabilities: HashMap<String, HashMap<String, Value>>,
    policies: Vec<PlacementPolicyDecl>,
    instances: Vec<String>,
}

#[derive(Default)]
struct InstanceRecord {
    state: NodeState,
    attributes: BTreeMap<String, Value>,
    capabilities: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Default)]
struct Topology {
    nodes: HashMap<NodeKey, NodeRecord>,
    instances: HashMap<InstanceKey, InstanceRecord>,
    failing_attributes: Vec<String>,
}

/// In-memory deployment store.
#[derive(Default)]
pub struct MemoryDeployments {
    topology: Mutex<Topology>,
}

fn node_key(deployment: &str, node: &str) -> NodeKey {
    (deployment.to_string(), node.to_string())
}

fn instance_key(deployment: &str, node: &str, instance: &str) -> InstanceKey {
    (deployment.to_string(), node.to_string(), instance.to_string())
}

impl MemoryDeployments {
    pub fn new() -> Self {
        Self::default()
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a node with its instances.
    pub fn add_node(&self, deployment: &str, node: &str, instances: &[&str]) {
        let mut topology = self.topology();
        let record = topology.nodes.entry(node_key(deployment, node)).or_default();
        record.instances = instances.iter().map(|i| i.to_string()).collect();
        for instance in instances {
            topology
                .instances
                .entry(instance_key(deployment, node, instance))
                .or_default();
        }
    }

    pub fn set_node_metadata(&self, deployment: &str, node: &str, key: &str, value: &str) {
        self.topology()
            .nodes
            .entry(node_key(deployment, node))
            .or_default()
            .metadata
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_node_property(&self, deployment: &str, node: &str, name: &str, value: Value) {
        self.topology()
            .nodes
            .entry(node_key(deployment, node))
            .or_default()
            .properties
            .insert(name.to_string(), value);
    }

    pub fn set_capability_property(
        &self,
        deployment: &str,
        node: &str,
        capability: &str,
        name: &str,
        value: Value,
    ) {
        self.topology()
            .nodes
            .entry(node_key(deployment, node))
            .or_default()
            .capabilities
            .entry(capability.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn add_placement_policy(&self, deployment: &str, node: &str, name: &str, policy_type: &str) {
        self.topology()
            .nodes
            .entry(node_key(deployment, node))
            .or_default()
            .policies
            .push(PlacementPolicyDecl {
                name: name.to_string(),
                policy_type: policy_type.to_string(),
            });
    }

    /// Make every later write of the named instance attribute fail.
    pub fn fail_attribute_writes(&self, name: &str) {
        self.topology().failing_attributes.push(name.to_string());
    }

    pub fn state(&self, deployment: &str, node: &str, instance: &str) -> NodeState {
        self.topology()
            .instances
            .get(&instance_key(deployment, node, instance))
            .map(|i| i.state)
            .unwrap_or_default()
    }

    pub fn attributes(&self, deployment: &str, node: &str, instance: &str) -> BTreeMap<String, Value> {
        self.topology()
            .instances
            .get(&instance_key(deployment, node, instance))
            .map(|i| i.attributes.clone())
            .unwrap_or_default()
    }

    pub fn capability_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        capability: &str,
        name: &str,
    ) -> Option<Value> {
        self.topology()
            .instances
            .get(&instance_key(deployment, node, instance))
            .and_then(|i| i.capabilities.get(capability))
            .and_then(|c| c.get(name))
            .cloned()
    }
}

impl DeploymentStore for MemoryDeployments {
    fn node_metadata(&self, deployment: &str, node: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .topology()
            .nodes
            .get(&node_key(deployment, node))
            .and_then(|n| n.metadata.get(key).cloned()))
    }

    fn node_property(&self, deployment: &str, node: &str, name: &str) -> Result<Option<Value>> {
        Ok(self
            .topology()
            .nodes
            .get(&node_key(deployment, node))
            .and_then(|n| n.properties.get(name).cloned()))
    }

    fn capability_property(
        &self,
        deployment: &str,
        node: &str,
        capability: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .topology()
            .nodes
            .get(&node_key(deployment, node))
            .and_then(|n| n.capabilities.get(capability))
            .and_then(|c| c.get(name).cloned()))
    }

    fn placement_policies(&self, deployment: &str, node: &str) -> Result<Vec<PlacementPolicyDecl>> {
        Ok(self
            .topology()
            .nodes
            .get(&node_key(deployment, node))
            .map(|n| n.policies.clone())
            .unwrap_or_default())
    }

    fn node_instances(&self, deployment: &str, node: &str) -> Result<Vec<String>> {
        match self.topology().nodes.get(&node_key(deployment, node)) {
            Some(n) => Ok(n.instances.clone()),
            None => bail!("node {node:?} not found in deployment {deployment:?}"),
        }
    }

    fn instance_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .topology()
            .instances
            .get(&instance_key(deployment, node, instance))
            .and_then(|i| i.attributes.get(name).cloned()))
    }

    fn set_instance_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let mut topology = self.topology();
        if topology.failing_attributes.iter().any(|a| a == name) {
            bail!("failed to store attribute {name:?} of {deployment}/{node}/{instance}");
        }
        topology
            .instances
            .entry(instance_key(deployment, node, instance))
            .or_default()
            .attributes
            .insert(name.to_string(), value);
        Ok(())
    }

    fn set_capability_attribute(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        capability: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.topology()
            .instances
            .entry(instance_key(deployment, node, instance))
            .or_default()
            .capabilities
            .entry(capability.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn set_instance_state(
        &self,
        deployment: &str,
        node: &str,
        instance: &str,
        state: NodeState,
    ) -> Result<()> {
        self.topology()
            .instances
            .entry(instance_key(deployment, node, instance))
            .or_default()
            .state = state;
        Ok(())
    }
}
