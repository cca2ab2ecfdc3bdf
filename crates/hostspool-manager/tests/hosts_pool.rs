//! End-to-end tests of the delegate executor over an in-memory pool.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};

use hostspool_core::Value;
use hostspool_core::config::HOSTS_POOL_LOCATION_TYPE;
use hostspool_manager::*;
use hostspool_placement::WEIGHT_BALANCED;
use hostspool_state::{Connection, HostStatus, LocationConfig, StateStore};

fn location(name: &str) -> LocationConfig {
    LocationConfig {
        name: name.to_string(),
        location_type: HOSTS_POOL_LOCATION_TYPE.to_string(),
        properties: Default::default(),
    }
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn connection(host: &str) -> Connection {
    Connection {
        host: host.to_string(),
        user: "centos".to_string(),
        ..Default::default()
    }
}

struct Pool {
    manager: HostsPoolManager,
    deployments: Arc<MemoryDeployments>,
    executor: DelegateExecutor,
}

impl Pool {
    fn new() -> Self {
        Self::on(StateStore::open_in_memory().unwrap())
    }

    fn on(store: StateStore) -> Self {
        let manager = HostsPoolManager::new(store, ManagerOptions::default());
        if manager.get_location("lab").is_err() {
            manager.create_location(&location("lab")).unwrap();
        }
        let deployments = Arc::new(MemoryDeployments::new());
        let executor = DelegateExecutor::new(manager.clone(), deployments.clone());
        Self {
            manager,
            deployments,
            executor,
        }
    }

    fn add_host(&self, name: &str, pairs: &[(&str, &str)]) {
        self.manager
            .add("lab", name, connection(&format!("10.0.0.{}", name.len())), labels(pairs))
            .unwrap();
    }

    /// A node requiring `cpus` CPUs per instance; 0 declares no requirement.
    fn add_node(&self, node: &str, instances: &[&str], cpus: i64, shareable: bool) {
        self.deployments.add_node("dep", node, instances);
        if cpus > 0 {
            self.deployments
                .set_capability_property("dep", node, "host", "num_cpus", Value::Integer(cpus));
        }
        self.deployments
            .set_node_property("dep", node, "shareable", Value::Bool(shareable));
    }

    fn host(&self, name: &str) -> hostspool_state::Host {
        self.manager.get_host("lab", name).unwrap().value
    }

    fn attribute(&self, node: &str, instance: &str, name: &str) -> Option<Value> {
        self.deployments.attributes("dep", node, instance).get(name).cloned()
    }
}

#[test]
fn install_and_uninstall_single_instance() {
    let pool = Pool::new();
    for name in ["host21", "host22", "host23"] {
        pool.add_host(name, &[("host.num_cpus", "4"), ("private_address", "192.168.0.1")]);
    }
    pool.add_node("Compute", &["0"], 4, false);

    pool.executor.execute("dep", "Compute", "install").unwrap();

    let allocated: Vec<_> = ["host21", "host22", "host23"]
        .into_iter()
        .map(|name| pool.host(name))
        .filter(|h| h.status == HostStatus::Allocated)
        .collect();
    assert_eq!(allocated.len(), 1);
    let host = &allocated[0];
    assert_eq!(host.labels["host.num_cpus"], "0");
    assert_eq!(
        pool.attribute("Compute", "0", "hostname"),
        Some(Value::from(host.name.as_str()))
    );
    assert_eq!(pool.deployments.state("dep", "Compute", "0"), NodeState::Started);

    pool.executor.execute("dep", "Compute", "uninstall").unwrap();
    let host = pool.host(&host.name);
    assert_eq!(host.status, HostStatus::Free);
    assert_eq!(host.labels["host.num_cpus"], "4");
    assert!(host.allocations.is_empty());
    assert_eq!(pool.deployments.state("dep", "Compute", "0"), NodeState::Deleted);
}

#[test]
fn concurrent_installs_never_share_the_last_host() {
    let pool = Pool::new();
    pool.add_host("host1", &[("host.num_cpus", "4")]);
    pool.add_node("A", &["0"], 2, false);
    pool.add_node("B", &["0"], 2, false);

    let barrier = Barrier::new(2);
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|node| {
                let (executor, barrier) = (&pool.executor, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    executor.install("dep", node)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err.root(), PoolError::NoCandidateHost { .. }), "{err}");
    assert_eq!(pool.host("host1").allocations.len(), 1);
}

#[test]
fn shared_capacity_is_never_exceeded() {
    let pool = Pool::new();
    pool.add_host("big", &[("host.num_cpus", "4")]);
    let nodes: Vec<String> = (0..8).map(|i| format!("N{i}")).collect();
    for node in &nodes {
        pool.add_node(node, &["0"], 1, true);
    }

    let successes = std::thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let executor = &pool.executor;
                s.spawn(move || executor.install("dep", node).is_ok())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });

    assert_eq!(successes, 4);
    let host = pool.host("big");
    assert_eq!(host.allocations.len(), 4);
    assert_eq!(host.labels["host.num_cpus"], "0");
}

#[test]
fn managers_without_a_shared_lock_rely_on_checkpoints() {
    let store = StateStore::open_in_memory().unwrap();
    let first = Pool::on(store.clone());
    let second = HostsPoolManager::new(store, ManagerOptions::default());
    first.add_host("only", &[]);

    let barrier = Barrier::new(2);
    let request = |node: &str| AllocationRequest {
        deployment_id: "dep".to_string(),
        node_name: node.to_string(),
        instance: "0".to_string(),
        ..Default::default()
    };
    let results: Vec<_> = std::thread::scope(|s| {
        let a = s.spawn(|| {
            barrier.wait();
            first.manager.allocate("lab", &request("A"), &[])
        });
        let b = s.spawn(|| {
            barrier.wait();
            second.allocate("lab", &request("B"), &[])
        });
        vec![a.join().unwrap(), b.join().unwrap()]
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PoolError::NoCandidateHost { .. }))));
    assert_eq!(first.host("only").allocations.len(), 1);
}

#[test]
fn pending_allocations_hold_capacity_across_managers() {
    let store = StateStore::open_in_memory().unwrap();
    let first = Pool::on(store.clone());
    let second = HostsPoolManager::new(store, ManagerOptions::default());
    first.add_host("h1", &[("host.num_cpus", "4")]);

    let request = |node: &str, cpus: &str| AllocationRequest {
        deployment_id: "dep".to_string(),
        node_name: node.to_string(),
        instance: "0".to_string(),
        shareable: true,
        resources: labels(&[("host.num_cpus", cpus)]),
        ..Default::default()
    };

    // The first manager records its allocation but has not consumed yet.
    let outcome = {
        let _guard = first.manager.lock_allocations();
        first.manager.allocate("lab", &request("A", "3"), &[]).unwrap()
    };
    assert!(outcome.allocation.pending);
    assert_eq!(first.host("h1").labels["host.num_cpus"], "4");

    let overlapping = {
        let _guard = second.lock_allocations();
        second.allocate("lab", &request("B", "3"), &[])
    };
    assert!(matches!(overlapping, Err(PoolError::NoCandidateHost { .. })));

    let warnings = first
        .manager
        .update_resources_labels(
            "lab",
            "h1",
            &outcome.allocation.resources,
            hostspool_placement::ResourceOp::Subtract,
            &outcome.allocation.generic_resources,
            hostspool_placement::ElementOp::RemoveElements,
        )
        .unwrap();
    assert!(warnings.is_empty());
    let host = first.host("h1");
    assert_eq!(host.labels["host.num_cpus"], "1");
    assert!(host.allocations.iter().all(|a| !a.pending));

    // What is left is still allocatable, and no more.
    assert!(second.allocate("lab", &request("C", "1"), &[]).is_ok());
    assert!(second.allocate("lab", &request("D", "1"), &[]).is_err());
}

#[test]
fn uninstall_of_unconsumed_allocation_gives_nothing_back() {
    let pool = Pool::new();
    pool.add_host("h1", &[("host.num_cpus", "4")]);
    pool.add_node("Compute", &["0"], 2, false);
    let request = AllocationRequest {
        deployment_id: "dep".to_string(),
        node_name: "Compute".to_string(),
        instance: "0".to_string(),
        resources: labels(&[("host.num_cpus", "2")]),
        ..Default::default()
    };
    pool.manager.allocate("lab", &request, &[]).unwrap();
    pool.deployments
        .set_instance_attribute("dep", "Compute", "0", "hostname", Value::from("h1"))
        .unwrap();

    let warnings = pool.executor.uninstall("dep", "Compute").unwrap();
    assert_eq!(warnings.len(), 1);
    let host = pool.host("h1");
    assert!(host.allocations.is_empty());
    assert_eq!(host.labels["host.num_cpus"], "4");
}

#[test]
fn failed_write_back_rolls_the_allocation_back() {
    let pool = Pool::new();
    pool.add_host("h1", &[("host.num_cpus", "4"), ("host.resource.gpu", "gpu0,gpu1")]);
    pool.add_node("Compute", &["0"], 2, false);
    pool.deployments.set_capability_property(
        "dep",
        "Compute",
        "host",
        "resources",
        Value::List(vec![Value::Map(
            [
                ("name".to_string(), Value::from("gpu")),
                ("number".to_string(), Value::Integer(1)),
            ]
            .into_iter()
            .collect(),
        )]),
    );
    pool.deployments.fail_attribute_writes("hostname");

    let err = pool.executor.install("dep", "Compute").unwrap_err();
    assert!(matches!(err.root(), PoolError::Deployment(_)), "{err}");

    let host = pool.host("h1");
    assert_eq!(host.status, HostStatus::Free);
    assert!(host.allocations.is_empty());
    assert_eq!(host.labels["host.num_cpus"], "4");
    assert_eq!(host.labels["host.resource.gpu"], "gpu0,gpu1");
    assert_eq!(pool.deployments.state("dep", "Compute", "0"), NodeState::Error);
}

#[test]
fn uninstall_reports_every_failure_and_releases_the_rest() {
    let pool = Pool::new();
    pool.add_host("h1", &[("host.num_cpus", "4")]);
    pool.add_node("Compute", &["0", "1"], 1, true);
    pool.executor.install("dep", "Compute").unwrap();
    assert_eq!(pool.host("h1").labels["host.num_cpus"], "2");

    // Instance 0's allocation disappears behind the executor's back.
    pool.manager.release("lab", "h1", "dep", "Compute", "0").unwrap();

    let err = pool.executor.uninstall("dep", "Compute").unwrap_err();
    let PoolError::ReleaseFailed { failures } = &err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("instance 0:"));
    assert!(err.to_string().contains("Some hosts maybe not properly released"));

    let host = pool.host("h1");
    assert!(host.allocations.is_empty());
    assert_eq!(host.status, HostStatus::Free);
    // Instance 0's CPU was never given back: its allocation record was gone.
    assert_eq!(host.labels["host.num_cpus"], "3");
    assert_eq!(pool.deployments.state("dep", "Compute", "0"), NodeState::Error);
    assert_eq!(pool.deployments.state("dep", "Compute", "1"), NodeState::Deleted);
}

#[test]
fn uninstall_skips_instances_never_allocated() {
    let pool = Pool::new();
    pool.add_node("Compute", &["0"], 1, false);
    let warnings = pool.executor.uninstall("dep", "Compute").unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("no hostname"));
    assert_eq!(pool.deployments.state("dep", "Compute", "0"), NodeState::Deleted);
}

#[test]
fn location_comes_from_metadata_or_defaults_to_first() {
    let pool = Pool::new();
    pool.manager.create_location(&location("zone-b")).unwrap();
    pool.manager
        .add("zone-b", "hb", connection("10.1.0.1"), HashMap::new())
        .unwrap();
    pool.add_host("ha", &[]);

    pool.add_node("Default", &["0"], 0, true);
    pool.executor.install("dep", "Default").unwrap();
    assert_eq!(pool.attribute("Default", "0", "hostname"), Some(Value::from("ha")));

    pool.add_node("Pinned", &["0"], 0, true);
    pool.deployments
        .set_node_metadata("dep", "Pinned", "location", "zone-b");
    pool.executor.install("dep", "Pinned").unwrap();
    assert_eq!(pool.attribute("Pinned", "0", "hostname"), Some(Value::from("hb")));

    pool.add_node("Lost", &["0"], 0, true);
    pool.deployments
        .set_node_metadata("dep", "Lost", "location", "zone-z");
    assert!(matches!(
        pool.executor.install("dep", "Lost"),
        Err(PoolError::LocationNotFound(name)) if name == "zone-z"
    ));
}

#[test]
fn install_without_location_fails() {
    let manager = HostsPoolManager::new(StateStore::open_in_memory().unwrap(), ManagerOptions::default());
    let deployments = Arc::new(MemoryDeployments::new());
    deployments.add_node("dep", "Compute", &["0"]);
    let executor = DelegateExecutor::new(manager, deployments);
    assert!(matches!(
        executor.install("dep", "Compute"),
        Err(PoolError::NoLocation)
    ));
}

#[test]
fn placement_policies_are_validated() {
    let pool = Pool::new();
    pool.add_host("h1", &[]);
    pool.add_node("Compute", &["0"], 0, true);
    pool.deployments
        .add_placement_policy("dep", "Compute", "spread", "hostspool.placement.Random");
    assert!(matches!(
        pool.executor.install("dep", "Compute"),
        Err(PoolError::UnsupportedPlacementPolicy(_))
    ));

    pool.add_node("Other", &["0"], 0, true);
    pool.deployments
        .add_placement_policy("dep", "Other", "spread", WEIGHT_BALANCED);
    pool.deployments
        .add_placement_policy("dep", "Other", "again", WEIGHT_BALANCED);
    assert!(matches!(
        pool.executor.install("dep", "Other"),
        Err(PoolError::MultiplePlacementPolicies(node)) if node == "Other"
    ));
}

#[test]
fn install_publishes_connection_data() {
    let pool = Pool::new();
    pool.manager
        .add(
            "lab",
            "linux1",
            Connection {
                host: "10.0.0.5".to_string(),
                user: "centos".to_string(),
                password: "secret".to_string(),
                private_key: "KEY".to_string(),
                port: 2222,
            },
            labels(&[
                ("os", "linux"),
                ("private_address", "192.168.1.5"),
                ("public_address", "1.2.3.4"),
                ("host.resource.gpu", "gpu0,gpu1"),
            ]),
        )
        .unwrap();
    pool.add_host("win1", &[("os", "windows"), ("host.resource.gpu", "gpu0,gpu1")]);
    pool.add_node("Compute", &["0"], 0, false);
    pool.deployments.set_node_property(
        "dep",
        "Compute",
        "filters",
        Value::from(r#"["os == linux"]"#),
    );
    pool.deployments.set_capability_property(
        "dep",
        "Compute",
        "host",
        "resources",
        Value::List(vec![Value::Map(
            [
                ("name".to_string(), Value::from("gpu")),
                (
                    "ids".to_string(),
                    Value::List(vec![Value::from("gpu1")]),
                ),
            ]
            .into_iter()
            .collect(),
        )]),
    );

    let warnings = pool.executor.install("dep", "Compute").unwrap();
    assert!(warnings.is_empty(), "{warnings:?}");

    let attr = |name: &str| pool.attribute("Compute", "0", name);
    assert_eq!(attr("hostname"), Some(Value::from("linux1")));
    assert_eq!(attr("gpu"), Some(Value::from("gpu1")));
    assert_eq!(attr("ip_address"), Some(Value::from("192.168.1.5")));
    assert_eq!(attr("private_address"), Some(Value::from("192.168.1.5")));
    assert_eq!(attr("public_address"), Some(Value::from("1.2.3.4")));
    assert_eq!(attr("public_ip_address"), Some(Value::from("1.2.3.4")));

    let endpoint = |name: &str| {
        pool.deployments
            .capability_attribute("dep", "Compute", "0", "endpoint", name)
    };
    assert_eq!(endpoint("ip_address"), Some(Value::from("10.0.0.5")));
    assert_eq!(endpoint("port"), Some(Value::Integer(2222)));
    let Some(Value::Map(credentials)) = endpoint("credentials") else {
        panic!("credentials not published");
    };
    assert_eq!(credentials["user"], Value::from("centos"));
    assert_eq!(credentials["token"], Value::from("secret"));
    let Value::Map(keys) = &credentials["keys"] else {
        panic!("keys not published");
    };
    assert_eq!(keys["0"], Value::from("KEY"));

    assert_eq!(pool.host("linux1").labels["host.resource.gpu"], "gpu0");
}

#[test]
fn missing_private_address_falls_back_to_connection_host() {
    let pool = Pool::new();
    pool.add_host("h1", &[]);
    pool.add_node("Compute", &["0"], 0, false);
    let warnings = pool.executor.install("dep", "Compute").unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("private_address"));
    assert_eq!(
        pool.attribute("Compute", "0", "private_address"),
        Some(Value::from("10.0.0.2"))
    );
    assert_eq!(
        pool.attribute("Compute", "0", "ip_address"),
        Some(Value::from("10.0.0.2"))
    );
    assert_eq!(pool.attribute("Compute", "0", "public_address"), None);
}

#[test]
fn generic_resource_ids_are_taken_per_instance() {
    let pool = Pool::new();
    pool.add_host("h1", &[("host.resource.gpu", "gpu0,gpu1,gpu2")]);
    pool.add_node("Compute", &["0", "1"], 0, true);
    pool.deployments.set_capability_property(
        "dep",
        "Compute",
        "host",
        "resources",
        Value::List(vec![Value::Map(
            [
                ("name".to_string(), Value::from("gpu")),
                (
                    "ids".to_string(),
                    Value::List(vec![Value::from("gpu2"), Value::from("gpu0")]),
                ),
            ]
            .into_iter()
            .collect(),
        )]),
    );

    pool.executor.install("dep", "Compute").unwrap();
    assert_eq!(pool.attribute("Compute", "0", "gpu"), Some(Value::from("gpu2")));
    assert_eq!(pool.attribute("Compute", "1", "gpu"), Some(Value::from("gpu0")));
    assert_eq!(pool.host("h1").labels["host.resource.gpu"], "gpu1");

    pool.executor.uninstall("dep", "Compute").unwrap();
    assert_eq!(pool.host("h1").labels["host.resource.gpu"], "gpu0,gpu1,gpu2");
}

#[test]
fn unknown_operation_is_rejected() {
    let pool = Pool::new();
    assert!(matches!(
        pool.executor.execute("dep", "Compute", "configure"),
        Err(PoolError::UnsupportedOperation(_))
    ));
}

#[test]
fn allocations_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.redb");
    {
        let pool = Pool::on(StateStore::open(&path).unwrap());
        pool.add_host("h1", &[("host.num_cpus", "2")]);
        pool.add_node("Compute", &["0"], 2, false);
        pool.executor.install("dep", "Compute").unwrap();
    }
    let manager = HostsPoolManager::new(StateStore::open(&path).unwrap(), ManagerOptions::default());
    let host = manager.get_host("lab", "h1").unwrap().value;
    assert_eq!(host.status, HostStatus::Allocated);
    assert_eq!(host.allocations[0].id, "dep/Compute/0");
    assert_eq!(host.labels["host.num_cpus"], "0");
}
