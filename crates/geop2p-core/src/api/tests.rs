// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::clock::TestClock;
use crate::dispatch::{serve_session, DispatchScope, Dispatcher};
use crate::error::OverlayError;
use crate::events::test_support::ChangeCounter;
use crate::ids::NodeId;
use crate::peer::{
    NetworkEndpoint, NodeContact, NodeDbEntry, NodeProfile, NodeRelation, NodeRole,
};
use crate::remote::{NodeHandle, NodeProxyFactory};
use crate::session::Session;
use crate::spatial_db::{InMemorySpatialDb, SpatialDatabase};
use crate::wire::{
    LocalServiceRequest, Message, MessageBody, NeighbourhoodChange, Request, RequestPayload,
    ResponsePayload, Status,
};

const EXPIRATION: Duration = Duration::from_secs(3600);

/// In-process proxy factory: endpoints resolve to other engine values
/// directly, no sockets involved.
#[derive(Default)]
struct NodeRegistry {
    nodes: RwLock<HashMap<NetworkEndpoint, Arc<Node>>>,
}

impl NodeRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, node: Arc<Node>) {
        let endpoint = node.node_info().profile.contact.node_endpoint();
        self.nodes
            .write()
            .expect("registry lock poisoned")
            .insert(endpoint, node);
    }
}

#[async_trait]
impl NodeProxyFactory for NodeRegistry {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<NodeHandle, OverlayError> {
        match self
            .nodes
            .read()
            .expect("registry lock poisoned")
            .get(endpoint)
        {
            Some(node) => Ok(Arc::clone(node) as NodeHandle),
            None => Err(OverlayError::Connection(format!(
                "connection refused: {endpoint}"
            ))),
        }
    }
}

fn info(id: &str, lat: f64, lon: f64, port: u16) -> NodeInfo {
    NodeInfo {
        profile: NodeProfile {
            id: NodeId::new(id).expect("valid id"),
            contact: NodeContact {
                address: "10.0.0.1".parse().expect("valid ip"),
                node_port: port,
                client_port: port + 1,
            },
        },
        location: GpsLocation::new(lat, lon).expect("valid location"),
    }
}

struct TestNode {
    node: Arc<Node>,
    db: Arc<InMemorySpatialDb>,
    clock: Arc<TestClock>,
}

fn build_node(
    registry: &Arc<NodeRegistry>,
    info: NodeInfo,
    tweak: impl FnOnce(&mut NodeConfig),
) -> TestNode {
    let clock = Arc::new(TestClock::at(1_000));
    let db = InMemorySpatialDb::with_seed(info.clone(), clock.clone(), EXPIRATION, Some(11))
        .expect("open db");
    let mut config = NodeConfig::new(info);
    config.sampler_seed = Some(5);
    tweak(&mut config);
    let node = Node::new(config, db.clone(), Arc::clone(registry) as Arc<dyn NodeProxyFactory>);
    registry.register(Arc::clone(&node));
    TestNode { node, db, clock }
}

fn relation_of(db: &InMemorySpatialDb, id: &str) -> Option<(NodeRelation, NodeRole)> {
    db.load(&NodeId::new(id).expect("valid id"))
        .map(|entry| (entry.relation, entry.role))
}

// ── bootstrap ───────────────────────────────────────────────────────────

#[tokio::test]
async fn seed_bootstrap_with_single_peer_forms_mutual_neighbourhood() {
    let registry = NodeRegistry::new();
    let b_info = info("node-b", 48.0, 20.0, 7000);
    let b = build_node(&registry, b_info.clone(), |_| {});
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |config| {
        config.seed_nodes = vec![b_info.profile.contact.node_endpoint()];
    });

    assert!(a.node.initialize_world().await.expect("initialize world"));
    assert_eq!(
        relation_of(&a.db, "node-b"),
        Some((NodeRelation::Colleague, NodeRole::Initiator))
    );
    assert_eq!(
        relation_of(&b.db, "node-a"),
        Some((NodeRelation::Colleague, NodeRole::Acceptor))
    );

    assert!(a
        .node
        .initialize_neighbourhood()
        .await
        .expect("initialize neighbourhood"));
    assert_eq!(
        relation_of(&a.db, "node-b"),
        Some((NodeRelation::Neighbour, NodeRole::Initiator))
    );
    // B upgraded its colleague entry for A in place.
    assert_eq!(
        relation_of(&b.db, "node-a").map(|(relation, _)| relation),
        Some(NodeRelation::Neighbour)
    );
}

#[tokio::test]
async fn initialize_world_skips_dead_seeds() {
    let registry = NodeRegistry::new();
    let b_info = info("node-b", 48.0, 20.0, 7000);
    let _b = build_node(&registry, b_info.clone(), |_| {});
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |config| {
        config.seed_nodes = vec![
            NetworkEndpoint {
                address: "10.9.9.9".parse().expect("valid ip"),
                port: 1,
            },
            b_info.profile.contact.node_endpoint(),
        ];
    });

    assert!(a.node.initialize_world().await.expect("initialize world"));
    assert!(relation_of(&a.db, "node-b").is_some());
}

#[tokio::test]
async fn initialize_world_returns_false_without_reachable_seeds() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |config| {
        config.seed_nodes = vec![NetworkEndpoint {
            address: "10.9.9.9".parse().expect("valid ip"),
            port: 1,
        }];
    });
    assert!(!a.node.initialize_world().await.expect("initialize world"));
}

#[tokio::test]
async fn ensure_map_filled_bootstraps_an_empty_node() {
    let registry = NodeRegistry::new();
    let b_info = info("node-b", 48.0, 20.0, 7000);
    let _b = build_node(&registry, b_info.clone(), |_| {});
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |config| {
        config.seed_nodes = vec![b_info.profile.contact.node_endpoint()];
    });

    a.node.ensure_map_filled().await.expect("ensure map filled");
    assert_eq!(
        relation_of(&a.db, "node-b").map(|(relation, _)| relation),
        Some(NodeRelation::Neighbour)
    );
}

// ── acceptance policy ───────────────────────────────────────────────────

#[tokio::test]
async fn accept_colleague_stores_entry_and_returns_own_info() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});

    let answer = a
        .node
        .accept_colleague(info("node-x", 10.0, 10.0, 7200))
        .await
        .expect("accept colleague");
    assert_eq!(answer.map(|info| info.id().clone()), NodeId::new("node-a").ok());
    assert_eq!(
        relation_of(&a.db, "node-x"),
        Some((NodeRelation::Colleague, NodeRole::Acceptor))
    );
}

#[tokio::test]
async fn accept_colleague_refuses_already_stored_caller() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let x = info("node-x", 10.0, 10.0, 7200);
    assert!(a.node.accept_colleague(x.clone()).await.expect("first").is_some());
    assert!(a.node.accept_colleague(x).await.expect("second").is_none());
}

#[tokio::test]
async fn accept_colleague_rejects_overlapping_bubble() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    a.db.store(
        NodeDbEntry::new(
            info("node-c", 47.51, 19.01, 7200),
            NodeRelation::Neighbour,
            NodeRole::Acceptor,
        ),
        true,
    )
    .expect("store neighbour");

    // A few metres from C: far inside both minimum-radius bubbles.
    let candidate = info("node-d", 47.510001, 19.010001, 7300);
    let answer = a
        .node
        .accept_colleague(candidate)
        .await
        .expect("accept colleague");
    assert!(answer.is_none());
    assert!(relation_of(&a.db, "node-d").is_none());
}

#[tokio::test]
async fn accept_colleague_rejects_own_id() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let err = a
        .node
        .accept_colleague(info("node-a", 1.0, 1.0, 7100))
        .await
        .expect_err("must fail");
    assert!(matches!(err, OverlayError::BadRequest(_)));
}

#[tokio::test]
async fn renew_colleague_refreshes_deadline_and_is_idempotent() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let x = info("node-x", 10.0, 10.0, 7200);
    a.node.accept_colleague(x.clone()).await.expect("accept");
    let first = a.db.load(x.id()).unwrap().expires_at;

    a.clock.elapse(100);
    assert!(a.node.renew_colleague(x.clone()).await.expect("renew").is_some());
    let second = a.db.load(x.id()).unwrap().expires_at;
    assert!(second > first);

    // Renewing twice in a row leaves the same single entry with a deadline
    // at least as late as after the first renewal.
    assert!(a.node.renew_colleague(x.clone()).await.expect("renew").is_some());
    let third = a.db.load(x.id()).unwrap().expires_at;
    assert!(third >= second);
    assert_eq!(a.db.get_node_count(Some(NodeRelation::Colleague)), 1);
}

#[tokio::test]
async fn renew_refuses_unknown_or_mismatched_relation() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let x = info("node-x", 10.0, 10.0, 7200);

    assert!(a.node.renew_colleague(x.clone()).await.expect("renew").is_none());
    assert!(a.node.renew_neighbour(x.clone()).await.expect("renew").is_none());

    a.node.accept_colleague(x.clone()).await.expect("accept");
    assert!(a.node.renew_neighbour(x).await.expect("renew").is_none());
}

#[tokio::test]
async fn accept_neighbour_upgrades_stored_colleague() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let x = info("node-x", 47.6, 19.1, 7200);
    a.node.accept_colleague(x.clone()).await.expect("accept colleague");

    assert!(a.node.accept_neighbour(x.clone()).await.expect("accept").is_some());
    assert_eq!(
        relation_of(&a.db, "node-x").map(|(relation, _)| relation),
        Some(NodeRelation::Neighbour)
    );
    // Still a single entry for that id.
    assert_eq!(a.db.get_node_count(None), 2);
}

#[tokio::test]
async fn accept_neighbour_on_existing_neighbour_acts_as_renewal() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let x = info("node-x", 47.6, 19.1, 7200);
    a.node.accept_neighbour(x.clone()).await.expect("accept");
    let first = a.db.load(x.id()).unwrap().expires_at;

    a.clock.elapse(100);
    assert!(a.node.accept_neighbour(x.clone()).await.expect("re-accept").is_some());
    let second = a.db.load(x.id()).unwrap().expires_at;
    assert!(second > first);
    assert_eq!(a.db.get_node_count(Some(NodeRelation::Neighbour)), 1);
}

#[tokio::test]
async fn neighbourhood_never_exceeds_target_size() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 0.0, 0.0, 7100), |config| {
        config.neighbourhood_target_size = 3;
    });

    for idx in 0..6 {
        let candidate = info(
            &format!("node-{idx}"),
            1.0 + f64::from(idx),
            1.0,
            7200 + u16::from(idx as u8),
        );
        let _ = a.node.accept_neighbour(candidate).await.expect("accept");
        assert!(a.db.get_node_count(Some(NodeRelation::Neighbour)) <= 3);
    }
}

#[tokio::test]
async fn closer_candidate_demotes_farthest_neighbour() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 0.0, 0.0, 7100), |config| {
        config.neighbourhood_target_size = 2;
        config.min_bubble_radius_km = 0.5;
    });

    a.node.accept_neighbour(info("far", 20.0, 20.0, 7200)).await.expect("accept far");
    a.node.accept_neighbour(info("mid", 10.0, 10.0, 7300)).await.expect("accept mid");

    // Farther than the current farthest: refused outright.
    assert!(a
        .node
        .accept_neighbour(info("farther", 30.0, 30.0, 7400))
        .await
        .expect("accept farther")
        .is_none());

    // Closer than the current farthest: accepted, `far` demoted.
    assert!(a
        .node
        .accept_neighbour(info("near", 1.0, 1.0, 7500))
        .await
        .expect("accept near")
        .is_some());
    assert_eq!(
        relation_of(&a.db, "near").map(|(relation, _)| relation),
        Some(NodeRelation::Neighbour)
    );
    assert_eq!(
        relation_of(&a.db, "far").map(|(relation, _)| relation),
        Some(NodeRelation::Colleague)
    );
    assert_eq!(a.db.get_node_count(Some(NodeRelation::Neighbour)), 2);
}

#[tokio::test]
async fn demoted_neighbour_is_dropped_when_its_bubble_overlaps() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 0.0, 0.0, 7100), |config| {
        config.neighbourhood_target_size = 2;
        config.min_bubble_radius_km = 10.0;
    });

    // `huddle` sits right next to a colleague, so as a colleague it would
    // violate the bubble rule and must be removed instead of demoted.
    a.db.store(
        NodeDbEntry::new(
            info("crowd", 5.01, 5.01, 7600),
            NodeRelation::Colleague,
            NodeRole::Acceptor,
        ),
        true,
    )
    .expect("store colleague");
    a.node.accept_neighbour(info("huddle", 5.0, 5.0, 7200)).await.expect("accept");
    a.node.accept_neighbour(info("mid", 3.0, 3.0, 7300)).await.expect("accept");

    assert!(a
        .node
        .accept_neighbour(info("near", 0.1, 0.1, 7400))
        .await
        .expect("accept near")
        .is_some());
    assert!(relation_of(&a.db, "huddle").is_none());
}

// ── renewal maintenance ─────────────────────────────────────────────────

#[tokio::test]
async fn renewal_keeps_agreeing_peers_and_drops_refusing_ones() {
    let registry = NodeRegistry::new();
    let b = build_node(&registry, info("node-b", 48.0, 20.0, 7000), |_| {});
    let c = build_node(&registry, info("node-c", 49.0, 21.0, 7050), |_| {});
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});

    // Mutual relation with B, one-sided entry for C (C never agreed).
    assert!(a
        .node
        .safe_store_node(b.node.node_info(), NodeRelation::Colleague, None)
        .await);
    a.db.store(
        NodeDbEntry::new(c.node.node_info(), NodeRelation::Colleague, NodeRole::Initiator),
        true,
    )
    .expect("store c");

    let before = a.db.load(&NodeId::new("node-b").unwrap()).unwrap().expires_at;
    a.clock.elapse(100);
    a.node.renew_node_relations().await;

    let after = a.db.load(&NodeId::new("node-b").unwrap()).unwrap().expires_at;
    assert!(after > before);
    assert!(a.db.load(&NodeId::new("node-c").unwrap()).is_none());
    assert!(b.db.load(&NodeId::new("node-a").unwrap()).is_some());
    assert!(c.db.load(&NodeId::new("node-a").unwrap()).is_none());
}

#[tokio::test]
async fn renewal_removes_unreachable_peers() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    a.db.store(
        NodeDbEntry::new(
            info("ghost", 50.0, 20.0, 7999),
            NodeRelation::Neighbour,
            NodeRole::Initiator,
        ),
        true,
    )
    .expect("store ghost");

    a.node.renew_node_relations().await;
    assert!(a.db.load(&NodeId::new("ghost").unwrap()).is_none());
}

#[tokio::test]
async fn expired_neighbour_emits_one_removal_event() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let counter = ChangeCounter::new("10.0.0.9:40001");
    a.db.listener_registry().add(counter.clone());

    a.node
        .accept_neighbour(info("node-n", 47.6, 19.1, 7200))
        .await
        .expect("accept");
    a.clock.elapse(EXPIRATION.as_secs() + 1);
    a.node.expire_old_nodes();

    assert!(a.db.load(&NodeId::new("node-n").unwrap()).is_none());
    assert_eq!(counter.removed.load(AtomicOrdering::SeqCst), 1);
}

// ── exploration and discovery ───────────────────────────────────────────

#[tokio::test]
async fn explore_merges_hops_and_sorts_by_distance() {
    let registry = NodeRegistry::new();
    let center = GpsLocation::new(0.0, 0.0).expect("valid location");

    // First-hop target knows five extra nodes near the centre.
    let x1 = build_node(&registry, info("x1", 1.0, 1.0, 7200), |_| {});
    for idx in 0..5 {
        x1.db.store(
            NodeDbEntry::new(
                info(&format!("y{idx}"), 0.2 + f64::from(idx) * 0.1, 0.2, 7300 + idx as u16),
                NodeRelation::Colleague,
                NodeRole::Acceptor,
            ),
            true,
        )
        .expect("store y");
    }
    // Second-hop target returns one new node and one duplicate.
    let y0 = build_node(&registry, info("y0", 0.2, 0.2, 7300), |_| {});
    y0.db.store(
        NodeDbEntry::new(info("z0", 0.05, 0.05, 7400), NodeRelation::Colleague, NodeRole::Acceptor),
        true,
    )
    .expect("store z0");
    y0.db.store(
        NodeDbEntry::new(info("y1", 0.3, 0.2, 7301), NodeRelation::Colleague, NodeRole::Acceptor),
        true,
    )
    .expect("store dup");

    let a = build_node(&registry, info("node-a", 3.0, 3.0, 7100), |_| {});
    for local in ["x1", "x2", "x3"] {
        let port = if local == "x1" { 7200 } else { 7500 };
        a.db.store(
            NodeDbEntry::new(
                info(local, 1.0, 1.0, port),
                NodeRelation::Colleague,
                NodeRole::Acceptor,
            ),
            true,
        )
        .expect("store local");
    }

    let found = a
        .node
        .explore_network_nodes_by_distance(center, 20, 2)
        .await
        .expect("explore");

    let ids: Vec<&str> = found.iter().map(|info| info.id().as_str()).collect();
    // Hop 1 went to x1 (closest to centre), hop 2 to y0; z0 only exists in
    // y0's store, proving the second hop merged in.
    assert!(ids.contains(&"z0"));
    // Deduplicated: y1 appears once even though two hops returned it.
    assert_eq!(ids.iter().filter(|id| **id == "y1").count(), 1);
    // Sorted ascending by distance from the centre.
    assert_eq!(ids.first(), Some(&"z0"));
    let distances: Vec<f64> = found
        .iter()
        .map(|info| crate::geo::distance_km(&center, &info.location))
        .collect();
    assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn explore_stops_at_hop_budget_even_below_target() {
    let registry = NodeRegistry::new();
    let center = GpsLocation::new(0.0, 0.0).expect("valid location");

    // A chain: a -> x1 -> y0 -> z-chain; with one hop only y's surface.
    let x1 = build_node(&registry, info("x1", 1.0, 1.0, 7200), |_| {});
    x1.db.store(
        NodeDbEntry::new(info("y0", 0.2, 0.2, 7300), NodeRelation::Colleague, NodeRole::Acceptor),
        true,
    )
    .expect("store y0");
    let y0 = build_node(&registry, info("y0", 0.2, 0.2, 7300), |_| {});
    y0.db.store(
        NodeDbEntry::new(info("z0", 0.05, 0.05, 7400), NodeRelation::Colleague, NodeRole::Acceptor),
        true,
    )
    .expect("store z0");

    let a = build_node(&registry, info("node-a", 3.0, 3.0, 7100), |_| {});
    a.db.store(
        NodeDbEntry::new(info("x1", 1.0, 1.0, 7200), NodeRelation::Colleague, NodeRole::Acceptor),
        true,
    )
    .expect("store x1");

    let found = a
        .node
        .explore_network_nodes_by_distance(center, 50, 1)
        .await
        .expect("explore");
    let ids: Vec<&str> = found.iter().map(|info| info.id().as_str()).collect();
    assert!(ids.contains(&"y0"));
    // z0 is two hops away and the budget was one.
    assert!(!ids.contains(&"z0"));
}

#[tokio::test]
async fn discovery_wins_new_colleagues_through_a_known_node() {
    let registry = NodeRegistry::new();
    let far = build_node(&registry, info("far", -30.0, 100.0, 7400), |_| {});
    let via = build_node(&registry, info("via", 48.0, 20.0, 7000), |_| {});
    via.db
        .store(
            NodeDbEntry::new(far.node.node_info(), NodeRelation::Colleague, NodeRole::Acceptor),
            true,
        )
        .expect("store far");

    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    assert!(a
        .node
        .safe_store_node(via.node.node_info(), NodeRelation::Colleague, None)
        .await);

    a.node.discover_unknown_areas().await;
    assert_eq!(
        relation_of(&a.db, "far").map(|(relation, _)| relation),
        Some(NodeRelation::Colleague)
    );
    assert_eq!(
        relation_of(&far.db, "node-a").map(|(relation, _)| relation),
        Some(NodeRelation::Colleague)
    );
}

// ── local service surface ───────────────────────────────────────────────

#[tokio::test]
async fn register_service_answers_with_own_location() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let location = a
        .node
        .register_service(ServiceInfo {
            service_type: "profile".into(),
            address: "10.0.0.1".parse().expect("valid ip"),
            port: 16985,
            payload: None,
        })
        .await
        .expect("register");
    assert_eq!(location, a.node.node_info().location);
    assert_eq!(a.node.registered_services().len(), 1);

    a.node.deregister_service("profile").await.expect("deregister");
    let err = a
        .node
        .deregister_service("profile")
        .await
        .expect_err("second deregister must fail");
    assert!(matches!(err, OverlayError::BadRequest(_)));
}

#[tokio::test]
async fn detected_external_address_rewrites_unroutable_contact() {
    let registry = NodeRegistry::new();
    let mut unroutable = info("node-a", 47.5, 19.0, 7100);
    unroutable.profile.contact.address = "0.0.0.0".parse().expect("valid ip");
    let a = build_node(&registry, unroutable, |_| {});

    let external: std::net::IpAddr = "203.0.113.7".parse().expect("valid ip");
    a.node.detected_external_address(external).expect("detect");
    assert_eq!(a.node.node_info().profile.contact.address, external);

    // A routable configured address is left alone.
    let other: std::net::IpAddr = "198.51.100.1".parse().expect("valid ip");
    a.node.detected_external_address(other).expect("detect");
    assert_eq!(a.node.node_info().profile.contact.address, external);
}

// ── sessions: keepalive and framing errors ──────────────────────────────

async fn wait_for_listener(db: &InMemorySpatialDb) {
    for _ in 0..100 {
        if !db.listener_registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("listener was never installed");
}

#[tokio::test]
async fn keepalive_session_streams_neighbourhood_changes() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});

    let (client_io, server_io) = tokio::io::duplex(8192);
    let server_session = Session::for_test(server_io, "127.0.0.1:50000");
    let serve = tokio::spawn(serve_session(
        server_session,
        Arc::clone(&a.node),
        DispatchScope::ClientPort,
    ));

    let mut client = Session::for_test(client_io, "127.0.0.1:16981");
    client
        .send_message(&Message {
            id: 1,
            body: MessageBody::Request(Request::new(RequestPayload::LocalService(
                LocalServiceRequest::GetNeighbourNodes { keep_alive: true },
            ))),
        })
        .await
        .expect("send request");

    let reply = client.receive_message().await.expect("receive response");
    assert_eq!(reply.id, 1);
    match reply.body {
        MessageBody::Response(response) => {
            assert_eq!(response.status, Status::Ok);
            assert_eq!(response.payload, Some(ResponsePayload::NodeList(vec![])));
        }
        MessageBody::Request(_) => panic!("expected response"),
    }

    wait_for_listener(&a.db).await;
    let x = info("node-x", 47.6, 19.1, 7200);
    a.node.accept_neighbour(x.clone()).await.expect("accept");

    // The next frame arrives without any further request.
    let note = client.receive_message().await.expect("receive notification");
    match note.body {
        MessageBody::Request(request) => match request.payload {
            RequestPayload::LocalService(LocalServiceRequest::NeighbourhoodChanged { changes }) => {
                assert_eq!(changes, vec![NeighbourhoodChange::Added(x)]);
            }
            other => panic!("unexpected payload: {other:?}"),
        },
        MessageBody::Response(_) => panic!("expected notification request"),
    }

    // Closing the client ends the notification stream: the next delivery
    // fails to send, and the session deregisters its listener.
    drop(client);
    a.node
        .accept_neighbour(info("node-y", 47.7, 19.2, 7300))
        .await
        .expect("accept");
    serve.await.expect("serve task");
    assert!(a.db.listener_registry().is_empty());
}

#[tokio::test]
async fn empty_frame_is_answered_with_bad_request() {
    use tokio::io::AsyncWriteExt;

    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});

    let (mut client_io, server_io) = tokio::io::duplex(1024);
    let serve = tokio::spawn(serve_session(
        Session::for_test(server_io, "127.0.0.1:50001"),
        Arc::clone(&a.node),
        DispatchScope::ClientPort,
    ));

    // A well-formed zero-length frame: header only, no payload variant.
    client_io.write_all(&[1, 0, 0, 0, 0]).await.expect("write");

    let mut client = Session::for_test(client_io, "127.0.0.1:16981");
    let reply = client.receive_message().await.expect("receive response");
    match reply.body {
        MessageBody::Response(response) => assert_eq!(response.status, Status::BadRequest),
        MessageBody::Request(_) => panic!("expected response"),
    }
    serve.await.expect("serve task");
}

#[tokio::test]
async fn local_service_requests_are_refused_on_the_node_port() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let dispatcher = Dispatcher::new(Arc::clone(&a.node), DispatchScope::NodePort);

    let (response, keep_alive) = dispatcher
        .handle_request(Request::new(RequestPayload::LocalService(
            LocalServiceRequest::GetNeighbourNodes { keep_alive: true },
        )))
        .await;
    assert_eq!(response.status, Status::Unsupported);
    assert!(!keep_alive);
}

#[tokio::test]
async fn inbound_neighbourhood_change_is_unsupported() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});
    let dispatcher = Dispatcher::new(Arc::clone(&a.node), DispatchScope::ClientPort);

    let (response, _) = dispatcher
        .handle_request(Request::new(RequestPayload::LocalService(
            LocalServiceRequest::NeighbourhoodChanged { changes: vec![] },
        )))
        .await;
    assert_eq!(response.status, Status::Unsupported);
}

#[tokio::test]
async fn dispatcher_echoes_correlation_id_and_keeps_serving() {
    let registry = NodeRegistry::new();
    let a = build_node(&registry, info("node-a", 47.5, 19.0, 7100), |_| {});

    let (client_io, server_io) = tokio::io::duplex(8192);
    let serve = tokio::spawn(serve_session(
        Session::for_test(server_io, "127.0.0.1:50002"),
        Arc::clone(&a.node),
        DispatchScope::ClientPort,
    ));

    let mut client = Session::for_test(client_io, "127.0.0.1:16981");
    // First a failing request: unknown service type.
    client
        .send_message(&Message {
            id: 21,
            body: MessageBody::Request(Request::new(RequestPayload::LocalService(
                LocalServiceRequest::DeregisterService {
                    service_type: "missing".into(),
                },
            ))),
        })
        .await
        .expect("send");
    let reply = client.receive_message().await.expect("receive");
    assert_eq!(reply.id, 21);
    match reply.body {
        MessageBody::Response(response) => {
            assert_eq!(response.status, Status::BadRequest);
            assert!(!response.details.is_empty());
        }
        MessageBody::Request(_) => panic!("expected response"),
    }

    // The session survives a domain error and answers the next request.
    client
        .send_message(&Message {
            id: 22,
            body: MessageBody::Request(Request::new(RequestPayload::Client(
                crate::wire::ClientRequest::GetNodeInfo,
            ))),
        })
        .await
        .expect("send");
    let reply = client.receive_message().await.expect("receive");
    assert_eq!(reply.id, 22);

    drop(client);
    serve.await.expect("serve task");
}
