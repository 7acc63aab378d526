//! Cluster Formation Tests
//!
//! Tests for nodes talking to each other on localhost covering:
//! - Bootstrapping a chain of nodes and full-mesh convergence
//! - Reseeding a node while keeping its id
//! - Replication of GLOBAL stores and the anti-entropy snapshot
//! - Domain leader election

mod common;

use common::{shutdown_all, start_configured_node, start_node, stored_local_node_id, wait_for, TestNode};
use parking_lot::Mutex;
use solisync::cluster::{ClusterListener, ClusterNode, ElectionState, NodeId};
use solisync::sync::{Occurred, SYSTEM_NODE_STORE};
use solisync::{Scope, StoreClient};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const JOIN_WAIT: Duration = Duration::from_millis(3000);
const CONVERGE_WAIT: Duration = Duration::from_millis(5000);

fn sorted_nodes(node: &TestNode) -> Vec<ClusterNode> {
    let mut nodes = node.stored_nodes();
    nodes.sort_by_key(|n| n.node_id);
    nodes
}

fn node_store(node: &TestNode) -> StoreClient<NodeId, ClusterNode> {
    node.manager
        .get_store_client(SYSTEM_NODE_STORE)
        .expect("node store is always registered")
}

/// Start `count` nodes, each seeded from the one before it
async fn start_chain(count: usize) -> Vec<TestNode> {
    let mut nodes: Vec<TestNode> = Vec::new();
    for i in 0..count {
        let seeds = match nodes.last() {
            Some(previous) => previous.address(),
            None => String::new(),
        };
        let node = start_node(&seeds).await;
        let joined = wait_for(JOIN_WAIT, || stored_local_node_id(&node.manager).is_some()).await;
        assert!(joined, "node {} did not receive a node id", i);
        nodes.push(node);
    }
    nodes
}

async fn converged(nodes: &[TestNode], expected: usize) -> bool {
    wait_for(CONVERGE_WAIT, || {
        nodes.iter().all(|n| n.stored_nodes().len() == expected)
    })
    .await
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_node_bootstrap_converges() {
    let nodes = start_chain(4).await;
    assert!(converged(&nodes, 4).await, "node stores did not converge");

    let reference = sorted_nodes(&nodes[0]);
    for node in &nodes[1..] {
        assert_eq!(sorted_nodes(node), reference);
    }

    let ids: BTreeSet<NodeId> = reference.iter().map(|n| n.node_id).collect();
    assert_eq!(ids.len(), 4);
    for node in &nodes {
        let id = node.local_node_id().expect("node has an id");
        let entry = reference.iter().find(|n| n.node_id == id).unwrap();
        assert_eq!(entry.hostname, "127.0.0.1");
        assert_eq!(entry.port, node.port);
        assert_eq!(entry.domain_id, id);
        assert_eq!(stored_local_node_id(&node.manager), Some(id.to_string()));
    }

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reseed_restores_membership_and_keeps_ids() {
    let nodes = start_chain(4).await;
    assert!(converged(&nodes, 4).await, "node stores did not converge");
    let ids_before: BTreeSet<NodeId> = nodes.iter().filter_map(|n| n.local_node_id()).collect();

    let target = &nodes[3];
    let target_id = target.local_node_id().unwrap();
    let old_version = node_store(target).get(&target_id).unwrap().version().clone();

    target.manager.cluster_service().reseed().unwrap();

    // every node ends up with a fresh live entry for the reseeded node
    let rejoined = wait_for(CONVERGE_WAIT, || {
        nodes.iter().all(|n| {
            let entry = node_store(n).get(&target_id).unwrap();
            entry.value().is_some() && entry.version().compare(&old_version) == Occurred::After
        })
    })
    .await;
    assert!(rejoined, "reseeded node did not rejoin");
    assert!(converged(&nodes, 4).await);

    let ids_after: BTreeSet<NodeId> = nodes.iter().filter_map(|n| n.local_node_id()).collect();
    assert_eq!(ids_after, ids_before);
    let reference = sorted_nodes(&nodes[0]);
    for node in &nodes[1..] {
        assert_eq!(sorted_nodes(node), reference);
    }
    let entry = reference.iter().find(|n| n.node_id == target_id).unwrap();
    assert_eq!(entry.domain_id, target_id);
    assert_eq!(entry.port, target.port);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deleted_node_rejoins() {
    let nodes = start_chain(2).await;
    assert!(converged(&nodes, 2).await);
    let second = nodes[1].local_node_id().unwrap();

    let service = nodes[0].manager.cluster_service();
    assert!(matches!(
        service.delete_node(nodes[0].local_node_id().unwrap()),
        Err(solisync::SyncError::DeleteLocalNode(_))
    ));
    service.delete_node(second).unwrap();

    // the live node sees its entry vanish and adds itself back
    let back = wait_for(CONVERGE_WAIT, || {
        nodes
            .iter()
            .all(|n| node_store(n).get_value(&second).unwrap().is_some())
    })
    .await;
    assert!(back);
    assert_eq!(nodes[1].local_node_id(), Some(second));

    shutdown_all(&nodes).await;
}

// ============================================================================
// Replication
// ============================================================================

fn register_app_stores(manager: &solisync::SyncManager) {
    manager.register_store("apps", Scope::Global).unwrap();
    manager.register_store("prefs", Scope::Unsynchronized).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_writes_replicate_and_unsynchronized_stay_local() {
    let first = start_configured_node(Some(""), register_app_stores).await;
    assert!(wait_for(JOIN_WAIT, || first.local_node_id().is_some()).await);

    // written before the second node exists: reaches it via the snapshot
    let apps = first.manager.get_store_client::<String, String>("apps").unwrap();
    apps.put(&"early".to_string(), "1".to_string()).unwrap();

    let seeds = first.address();
    let second = start_configured_node(Some(&seeds), register_app_stores).await;
    assert!(wait_for(JOIN_WAIT, || second.local_node_id().is_some()).await);

    let prefs = first.manager.get_store_client::<String, String>("prefs").unwrap();
    prefs.put(&"theme".to_string(), "dark".to_string()).unwrap();
    apps.put(&"late".to_string(), "2".to_string()).unwrap();

    let remote_apps = second.manager.get_store_client::<String, String>("apps").unwrap();
    let replicated = wait_for(CONVERGE_WAIT, || {
        remote_apps.get_value(&"early".to_string()).unwrap() == Some("1".to_string())
            && remote_apps.get_value(&"late".to_string()).unwrap() == Some("2".to_string())
    })
    .await;
    assert!(replicated, "GLOBAL writes did not reach the second node");

    // writes flow back the other way, deletes included
    remote_apps.delete(&"early".to_string()).unwrap();
    assert!(
        wait_for(CONVERGE_WAIT, || apps.get_value(&"early".to_string()).unwrap().is_none()).await
    );

    let remote_prefs = second.manager.get_store_client::<String, String>("prefs").unwrap();
    assert_eq!(remote_prefs.get_value(&"theme".to_string()).unwrap(), None);

    let peers = [first, second];
    assert!(wait_for(CONVERGE_WAIT, || {
        let b = peers[1].local_node_id().unwrap();
        peers[0].manager.cluster_service().is_connected(b)
    })
    .await);
    shutdown_all(&peers).await;
}

// ============================================================================
// Leadership
// ============================================================================

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<Option<NodeId>>>,
}

impl ClusterListener for RecordingListener {
    fn notify_leader(&self) {
        self.events.lock().push(None);
    }

    fn notify_follower(&self, leader: NodeId) {
        self.events.lock().push(Some(leader));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_leads_its_domain() {
    let listener = Arc::new(RecordingListener::default());
    let registered = listener.clone();
    let node = start_configured_node(Some(""), move |manager| {
        manager.cluster_service().register_listener(registered);
    })
    .await;
    let id = node.local_node_id().expect("new cluster assigns an id");

    let service = node.manager.cluster_service();
    assert!(wait_for(CONVERGE_WAIT, || service.get_domain_leader() == Some(id)).await);
    assert_eq!(node.manager.election().state(), ElectionState::Leader);
    assert!(listener.events.lock().contains(&None));

    node.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rigged_election_in_shared_domain() {
    let same_domain = |manager: &solisync::SyncManager| {
        manager.cluster_service().set_local_domain_id(1).unwrap();
    };
    let first = start_configured_node(Some(""), same_domain).await;
    assert!(wait_for(JOIN_WAIT, || first.local_node_id().is_some()).await);
    let seeds = first.address();
    let second = start_configured_node(Some(&seeds), same_domain).await;
    assert!(wait_for(JOIN_WAIT, || second.local_node_id().is_some()).await);
    let nodes = [first, second];
    assert!(converged(&nodes, 2).await);

    let ids: Vec<NodeId> = nodes.iter().map(|n| n.local_node_id().unwrap()).collect();
    let leaders = |expected: NodeId| {
        nodes
            .iter()
            .all(|n| n.manager.cluster_service().get_domain_leader() == Some(expected))
    };

    // both nodes agree on a leader from the domain
    let agreed = wait_for(CONVERGE_WAIT, || leaders(ids[0]) || leaders(ids[1])).await;
    assert!(agreed, "no agreed leader");
    let current = nodes[0].manager.cluster_service().get_domain_leader().unwrap();

    // a rigged election hands leadership to the other node
    let (challenger, id) = if current == ids[0] {
        (&nodes[1], ids[1])
    } else {
        (&nodes[0], ids[0])
    };
    challenger.manager.cluster_service().new_election(true);
    assert!(
        wait_for(CONVERGE_WAIT, || leaders(id)).await,
        "rigged election did not move leadership"
    );

    shutdown_all(&nodes).await;
}
