//! Replication and reconciliation between nodes.

use std::sync::Arc;
use std::time::Duration;

use courier_cluster::{
    ClusterConfig, ClusterTiming, Fanout, FirstReachable, Membership, NodeConfig, ReplicaPeer,
    ReplicaServer, Reconciler, TcpPeer,
};
use bytes::Bytes;
use courier_core::{Limits, Message, NodeId, Offset, PartitionId};
use courier_server::{Node, NodeOptions};
use tokio::sync::mpsc;

use crate::local_peer::LocalNode;

fn membership(self_id: &str, nodes: &[(&str, &str)]) -> Membership {
    let config = ClusterConfig {
        nodes: nodes
            .iter()
            .map(|(id, host)| NodeConfig {
                id: (*id).to_string(),
                host: (*host).to_string(),
            })
            .collect(),
    };
    Membership::from_config(NodeId::new(self_id), config).unwrap()
}

/// Builds a reconciler for `node` pulling through `peers`.
fn reconciler(
    node: &LocalNode,
    membership: &Membership,
    peers: Vec<Arc<dyn ReplicaPeer>>,
    timing: ClusterTiming,
) -> (Arc<Fanout>, Reconciler) {
    let fanout = Arc::new(Fanout::new(node.id.clone(), peers, timing));
    let selector = Arc::new(FirstReachable::new(membership, Arc::clone(&fanout)));
    let reconciler = Reconciler::new(
        node.catalog.clone(),
        node.log.clone(),
        Arc::clone(&fanout),
        selector,
        timing.reconcile_interval,
    );
    (fanout, reconciler)
}

fn publish(node: &LocalNode, topic: &str, partition: u32, payload: &str) -> Message {
    let mut message = Message::new(topic, PartitionId::new(partition), "k", payload.to_string(), "p");
    node.log.append(&mut message).unwrap();
    message
}

#[tokio::test]
async fn test_cluster_dropped_broadcast_repaired_by_reconciler() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let timing = ClusterTiming::fast_for_testing();
    for node in [&a, &b] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }

    // A's broadcast to B is dropped.
    let b_peer = b.peer();
    b_peer.set_drop_broadcasts(true);
    let a_fanout = Fanout::new(a.id.clone(), vec![b_peer.clone() as Arc<dyn ReplicaPeer>], timing);

    let m = publish(&a, "t", 0, "hello");
    assert_eq!(m.offset, Offset::new(0));
    assert!(a_fanout.broadcast(vec![m.clone()]).join().await.is_empty());
    assert_eq!(b_peer.dropped(), 1);
    assert!(b.log.read("t", PartitionId::new(0), Offset::new(0), 10).unwrap().is_empty());

    // B's next tick, with A as sole peer, pulls the message.
    let b_membership = membership("n2", &[("n1", "local:1"), ("n2", "local:2")]);
    let (_fanout, b_reconciler) = reconciler(&b, &b_membership, vec![a.peer() as Arc<dyn ReplicaPeer>], timing);
    let report = b_reconciler.tick().await;
    assert_eq!(report.peer, Some(NodeId::new("n1")));
    assert_eq!(report.applied, 1);
    assert_eq!(report.failures, 0);

    let read = b.log.read("t", PartitionId::new(0), Offset::new(0), 10).unwrap();
    assert_eq!(read, vec![m]);

    // Nothing left to pull.
    assert_eq!(b_reconciler.tick().await.applied, 0);
}

#[tokio::test]
async fn test_cluster_reconcile_pages_across_topics_and_partitions() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let timing = ClusterTiming::fast_for_testing();
    for node in [&a, &b] {
        node.catalog.create_topic("orders", 3, "alice").unwrap();
        node.catalog.create_topic("audit", 1, "alice").unwrap();
    }

    let mut expected = Vec::new();
    for p in 0..3 {
        for i in 0..9 {
            expected.push(publish(&a, "orders", p, &format!("o{p}-{i}")));
        }
    }
    for i in 0..5 {
        expected.push(publish(&a, "audit", 0, &format!("a{i}")));
    }

    let b_membership = membership("n2", &[("n1", "local:1"), ("n2", "local:2")]);
    let (_fanout, b_reconciler) = reconciler(&b, &b_membership, vec![a.peer() as Arc<dyn ReplicaPeer>], timing);
    let report = b_reconciler.tick().await;
    assert_eq!(report.partitions, 4);
    assert_eq!(report.applied, expected.len() as u64);

    for p in 0..3 {
        let local = a.log.read("orders", PartitionId::new(p), Offset::new(0), 100).unwrap();
        let replica = b.log.read("orders", PartitionId::new(p), Offset::new(0), 100).unwrap();
        assert_eq!(local, replica);
        assert_eq!(b.log.end_offset("orders", PartitionId::new(p)).unwrap(), Offset::new(9));
    }
}

#[tokio::test]
async fn test_cluster_reconcile_resumes_from_local_hwm() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let timing = ClusterTiming::fast_for_testing();
    for node in [&a, &b] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }

    // B already holds the first three offsets.
    let first: Vec<Message> = (0..3).map(|i| publish(&a, "t", 0, &format!("m{i}"))).collect();
    b.replica.replicate(&first).unwrap();
    let rest: Vec<Message> = (3..6).map(|i| publish(&a, "t", 0, &format!("m{i}"))).collect();

    let b_membership = membership("n2", &[("n1", "local:1"), ("n2", "local:2")]);
    let (_fanout, b_reconciler) = reconciler(&b, &b_membership, vec![a.peer() as Arc<dyn ReplicaPeer>], timing);
    let report = b_reconciler.tick().await;
    assert_eq!(report.applied, 3);

    let read = b.log.read("t", PartitionId::new(0), Offset::new(3), 10).unwrap();
    assert_eq!(read, rest);
}

#[tokio::test]
async fn test_cluster_unreachable_peer_is_noop() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    for node in [&a, &b] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }
    publish(&a, "t", 0, "x");

    let a_peer = a.peer();
    a_peer.set_unreachable(true);
    let b_membership = membership("n2", &[("n1", "local:1"), ("n2", "local:2")]);
    let (_fanout, b_reconciler) = reconciler(
        &b,
        &b_membership,
        vec![a_peer.clone() as Arc<dyn ReplicaPeer>],
        ClusterTiming::fast_for_testing(),
    );

    let report = b_reconciler.tick().await;
    assert!(report.peer.is_none());
    assert_eq!(report.applied, 0);

    // Self-heals once the peer is back.
    a_peer.set_unreachable(false);
    assert_eq!(b_reconciler.tick().await.applied, 1);
}

#[tokio::test]
async fn test_cluster_reconciler_picks_first_reachable_peer() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let c = LocalNode::open("n3");
    for node in [&a, &b, &c] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }
    let m = publish(&b, "t", 0, "from-b");

    let a_peer = a.peer();
    a_peer.set_unreachable(true);
    let c_membership = membership(
        "n3",
        &[("n1", "local:1"), ("n2", "local:2"), ("n3", "local:3")],
    );
    let (_fanout, c_reconciler) = reconciler(
        &c,
        &c_membership,
        vec![a_peer as Arc<dyn ReplicaPeer>, b.peer()],
        ClusterTiming::fast_for_testing(),
    );

    let report = c_reconciler.tick().await;
    assert_eq!(report.peer, Some(NodeId::new("n2")));
    let read = c.log.read("t", PartitionId::new(0), Offset::new(0), 10).unwrap();
    assert_eq!(read, vec![m]);
}

#[tokio::test]
async fn test_cluster_broadcast_and_catch_up_over_tcp() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let timing = ClusterTiming::fast_for_testing();
    for node in [&a, &b] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }

    let a_server = ReplicaServer::bind("127.0.0.1:0").await.unwrap();
    let b_server = ReplicaServer::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a_server.local_addr().to_string();
    let b_addr = b_server.local_addr().to_string();
    let (a_tx, a_rx) = mpsc::channel(1);
    let (b_tx, b_rx) = mpsc::channel(1);
    let a_handle = a_server.spawn(a.replica.clone(), a_rx);
    let b_handle = b_server.spawn(b.replica.clone(), b_rx);

    // A live broadcast reaches B.
    let a_fanout = Fanout::new(
        a.id.clone(),
        vec![Arc::new(TcpPeer::new(NodeId::new("n2"), b_addr.clone(), timing)) as Arc<dyn ReplicaPeer>],
        timing,
    );
    let m0 = publish(&a, "t", 0, "first");
    let acks = a_fanout.broadcast(vec![m0.clone()]).join().await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].applied, 1);

    // A later message is never broadcast; B's reconciler pulls it.
    let m1 = publish(&a, "t", 0, "second");
    let b_membership = membership("n2", &[("n1", a_addr.as_str()), ("n2", b_addr.as_str())]);
    let (_fanout, b_reconciler) = reconciler(
        &b,
        &b_membership,
        vec![Arc::new(TcpPeer::new(NodeId::new("n1"), a_addr.clone(), timing)) as Arc<dyn ReplicaPeer>],
        timing,
    );
    let report = b_reconciler.tick().await;
    assert_eq!(report.applied, 1);

    let read = b.log.read("t", PartitionId::new(0), Offset::new(0), 10).unwrap();
    assert_eq!(read, vec![m0, m1]);

    a_tx.send(()).await.unwrap();
    b_tx.send(()).await.unwrap();
    a_handle.await.unwrap();
    b_handle.await.unwrap();
}

#[tokio::test]
async fn test_cluster_catch_up_over_tcp_with_maximal_payloads() {
    let a = LocalNode::open("n1");
    let b = LocalNode::open("n2");
    let limits = Limits::default();
    for node in [&a, &b] {
        node.catalog.create_topic("t", 1, "alice").unwrap();
    }

    // More maximal messages than one response frame can hold.
    let count = 66;
    let payload = Bytes::from(vec![0xAB; limits.max_payload_bytes as usize]);
    for _ in 0..count {
        let mut message = Message::new("t", PartitionId::new(0), "k", payload.clone(), "p");
        message.validate(&limits).unwrap();
        a.log.append(&mut message).unwrap();
    }
    assert!(count * payload.len() as u64 > u64::from(limits.max_frame_bytes));

    let a_server = ReplicaServer::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a_server.local_addr().to_string();
    let (a_tx, a_rx) = mpsc::channel(1);
    let a_handle = a_server.spawn(a.replica.clone(), a_rx);

    let timing = ClusterTiming {
        request_timeout: Duration::from_secs(30),
        ..ClusterTiming::default()
    };
    let b_membership = membership("n2", &[("n1", a_addr.as_str()), ("n2", "127.0.0.1:1")]);
    let (_fanout, b_reconciler) = reconciler(
        &b,
        &b_membership,
        vec![Arc::new(TcpPeer::new(NodeId::new("n1"), a_addr.clone(), timing)) as Arc<dyn ReplicaPeer>],
        timing,
    );
    let report = b_reconciler.tick().await;
    assert_eq!(report.failures, 0);
    assert_eq!(report.applied, count);
    assert_eq!(
        b.log.end_offset("t", PartitionId::new(0)).unwrap(),
        Offset::new(count)
    );

    // Nothing is left to pull.
    assert_eq!(b_reconciler.tick().await.applied, 0);

    a_tx.send(()).await.unwrap();
    a_handle.await.unwrap();
}

/// Returns a free loopback port.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_cluster_two_nodes_publish_replicates() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("cluster.json");
    let (p1, p2) = (free_port(), free_port());
    std::fs::write(
        &config,
        format!(
            r#"{{"nodes":[{{"id":"n1","host":"127.0.0.1:{p1}"}},{{"id":"n2","host":"127.0.0.1:{p2}"}}]}}"#
        ),
    )
    .unwrap();

    let timing = ClusterTiming::fast_for_testing().with_reconcile_interval(Duration::from_secs(60));
    let start = |id: &str| {
        NodeOptions::new(NodeId::new(id), dir.path().join(id))
            .with_cluster_config(&config)
            .with_timing(timing)
    };
    let n1 = Node::start(start("n1")).await.unwrap();
    let n2 = Node::start(start("n2")).await.unwrap();
    assert_eq!(n1.leader().await, NodeId::new("n1"));
    assert_eq!(n2.leader().await, NodeId::new("n1"));

    for node in [&n1, &n2] {
        node.broker().create_topic("events", 1, "alice").unwrap();
    }
    let receipt = n1.broker().publish("events", "k", "payload", "svc").unwrap();

    let mut replicated = Vec::new();
    for _ in 0..100 {
        replicated = n2
            .broker()
            .pull("events", "g", PartitionId::new(0), 10)
            .unwrap();
        if !replicated.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(replicated.len(), 1);
    assert_eq!(replicated[0].id, receipt.id);
    assert_eq!(replicated[0].offset, receipt.offset);

    // A reconcile pass finds nothing missing.
    let report = n2.reconcile_now().await.unwrap();
    assert_eq!(report.peer, Some(NodeId::new("n1")));
    assert_eq!(report.applied, 0);

    n1.shutdown().await.unwrap();
    n2.shutdown().await.unwrap();
}
