//! End-to-end behavior of the mesh through its public API.

use mesh_core::{
    provider_fn, AccountId, ApiRequest, Backoff, Decision, DenyReason, DispatchOutcome, EventBus,
    JobRequest, JobStatus, LoopbackTransport, Mesh, MeshConfig, MeshError, Method, NetworkClient,
    NetworkConfig, NodeDescriptor, NodeFilter, NodeRegistry, Orchestrator, OrchestratorConfig,
    PolicyConfig, PolicyGate, RegistryConfig, WorldService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use world_engine::{ComponentType, InMemoryBackend, ManualClock, RegionId, Timestamp, WorldState};

struct Cluster {
    clock: Arc<ManualClock>,
    transport: Arc<LoopbackTransport>,
    registry: Arc<NodeRegistry>,
    gate: Arc<PolicyGate>,
    orchestrator: Arc<Orchestrator>,
    account: AccountId,
}

async fn cluster() -> Cluster {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let events = EventBus::default();
    let transport = Arc::new(LoopbackTransport::new());
    let network = Arc::new(NetworkClient::new(
        transport.clone(),
        &NetworkConfig::default(),
        events.clone(),
    ));
    network.connect().await.unwrap();

    let registry = Arc::new(NodeRegistry::new(
        RegistryConfig::default(),
        clock.clone(),
        events.clone(),
    ));
    let gate = Arc::new(PolicyGate::new(PolicyConfig::default(), clock.clone()));
    let account = AccountId::new("acct");
    gate.record_consent(account.clone(), "mesh.maintenance", true, Value::Null);

    let orchestrator = Arc::new(
        Orchestrator::new(
            OrchestratorConfig::default(),
            registry.clone(),
            gate.clone(),
            network,
            clock.clone(),
            events,
        )
        .unwrap(),
    );
    Cluster {
        clock,
        transport,
        registry,
        gate,
        orchestrator,
        account,
    }
}

fn maintenance_worker(endpoint: &str) -> NodeDescriptor {
    NodeDescriptor::new("worker", endpoint).with_capability("maintenance")
}

#[tokio::test]
async fn test_discovery_never_returns_stale_nodes() {
    let cluster = cluster().await;
    let interval = RegistryConfig::default().heartbeat_interval();
    cluster
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();

    cluster.clock.advance(interval * 3);
    assert_eq!(cluster.registry.discover(&NodeFilter::default()).len(), 1);

    cluster.clock.advance(Duration::from_millis(1));
    assert!(cluster.registry.discover(&NodeFilter::default()).is_empty());
}

#[tokio::test]
async fn test_reregistration_returns_same_id() {
    let cluster = cluster().await;
    let first = cluster
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();
    let second = cluster
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();

    assert_eq!(first, second);
    let found = cluster
        .registry
        .discover(&NodeFilter::default().with_capability("maintenance"));
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_higher_priority_dispatches_first() {
    let cluster = cluster().await;
    cluster.transport.register(
        "node-a",
        provider_fn(|_| async { Ok(json!({"done": true})) }),
    );
    cluster
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();

    let low = cluster
        .orchestrator
        .submit(
            &cluster.account,
            JobRequest::new("maintenance", Value::Null).with_priority(1),
        )
        .unwrap();
    let high = cluster
        .orchestrator
        .submit(
            &cluster.account,
            JobRequest::new("maintenance", Value::Null).with_priority(9),
        )
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..2 {
        match cluster.orchestrator.dispatch_once() {
            DispatchOutcome::Dispatched { job_id, .. } => order.push(job_id),
            other => panic!("expected a dispatch, got {other:?}"),
        }
    }
    assert_eq!(order, vec![high, low]);
}

#[tokio::test]
async fn test_maintenance_waits_for_capable_node() {
    let cluster = cluster().await;
    cluster.transport.register(
        "node-a",
        provider_fn(|_| async { std::future::pending::<Result<Value, String>>().await }),
    );

    let job_id = cluster
        .orchestrator
        .submit(
            &cluster.account,
            JobRequest::new("maintenance", Value::Null).with_priority(1),
        )
        .unwrap();
    assert_eq!(
        cluster.orchestrator.dispatch_once(),
        DispatchOutcome::NoCandidate
    );
    assert_eq!(
        cluster.orchestrator.get(job_id).unwrap().status,
        JobStatus::Pending
    );

    let node_id = cluster
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();
    assert_eq!(
        cluster.orchestrator.dispatch_once(),
        DispatchOutcome::Dispatched { job_id, node_id }
    );
    let job = cluster.orchestrator.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.node_id, Some(node_id));
}

#[tokio::test]
async fn test_consent_grant_and_revoke() {
    let cluster = cluster().await;
    let account = AccountId::new("player");

    cluster
        .gate
        .record_consent(account.clone(), "world.write", true, Value::Null);
    assert_eq!(cluster.gate.check(&account, "world.write"), Decision::Allow);

    cluster
        .gate
        .record_consent(account.clone(), "world.write", false, Value::Null);
    assert_eq!(
        cluster.gate.check(&account, "world.write"),
        Decision::Deny(DenyReason::NoConsent)
    );
}

#[tokio::test]
async fn test_free_tier_rate_limit_rolls_over() {
    let cluster = cluster().await;
    let config = PolicyConfig::default();
    let account = AccountId::new("free");
    cluster
        .gate
        .record_consent(account.clone(), "world.write", true, Value::Null);

    for _ in 0..config.free_quota {
        assert!(cluster.gate.check(&account, "world.write").is_allowed());
    }
    assert_eq!(
        cluster.gate.check(&account, "world.write"),
        Decision::Deny(DenyReason::RateLimited)
    );

    cluster.clock.advance(config.window());
    assert_eq!(cluster.gate.check(&account, "world.write"), Decision::Allow);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_is_bounded() {
    let config = NetworkConfig {
        heartbeat_interval_ms: 1_000,
        backoff_base_ms: 100,
        backoff_cap_ms: 1_000,
        request_timeout_ms: 500,
    };
    let transport = Arc::new(LoopbackTransport::new());
    transport.set_online(false);
    let client = Arc::new(NetworkClient::new(
        transport.clone(),
        &config,
        EventBus::default(),
    ));
    assert!(client.connect().await.is_err());

    let mut previous = Duration::ZERO;
    for failures in 1..=8 {
        assert_eq!(client.consecutive_failures(), failures);
        let delay = client.next_reconnect_delay();
        assert!(delay >= previous);
        assert!(delay <= config.backoff_cap());
        previous = delay;
        tokio::time::sleep(delay + Duration::from_millis(1)).await;
    }
    assert_eq!(previous, config.backoff_cap());

    let backoff = Backoff::new(config.backoff_base(), config.backoff_cap());
    assert_eq!(backoff.delay(u32::MAX), config.backoff_cap());

    transport.set_online(true);
    tokio::time::sleep(previous + Duration::from_millis(1)).await;
    assert!(client.is_connected());
    assert_eq!(client.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_component_queries_and_destroy() {
    let cluster = cluster().await;
    let account = AccountId::new("builder");
    cluster
        .gate
        .record_consent(account.clone(), "world.write", true, Value::Null);
    let world = WorldService::new(
        WorldState::with_clock(cluster.clock.clone()).into_shared(),
        cluster.gate.clone(),
        cluster.registry.clone(),
    );

    let position = ComponentType::new("position");
    let health = ComponentType::new("health");
    let e1 = world
        .create_entity(&account, "npc", RegionId::new("north"))
        .await
        .unwrap();
    world
        .add_component(&account, e1, position.clone(), json!({"x": 1, "y": 2}))
        .await
        .unwrap();
    world
        .add_component(&account, e1, health.clone(), json!({"hp": 10}))
        .await
        .unwrap();

    let both = [position.clone(), health.clone()];
    assert!(world.entities_with_components(&both).await.contains(&e1));

    world.remove_component(&account, e1, &health).await.unwrap();
    assert!(!world.entities_with_components(&both).await.contains(&e1));
    assert!(world.entities_with_component(&position).await.contains(&e1));

    world.destroy_entity(&account, e1).await.unwrap();
    for component_type in [&position, &health] {
        let err = world.get_component(e1, component_type).await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_distinct_from_failure() {
    let mut config = MeshConfig::default();
    config.orchestrator.retry_limit = 0;
    let transport = Arc::new(LoopbackTransport::new());
    transport.register(
        "node-a",
        provider_fn(|_| async { Err::<Value, String>("provider crashed".into()) }),
    );
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let handle = Mesh::with_clock(config, transport, Arc::new(InMemoryBackend::new()), clock)
        .unwrap()
        .start()
        .await;
    let gateway = handle.gateway().clone();
    let submit = ApiRequest::new(Method::Post, "/jobs")
        .with_account("acct")
        .with_body(json!({"job_type": "maintenance", "priority": 1}));

    let rejected = gateway.handle(submit.clone()).await;
    assert_eq!(rejected.status, 403);
    assert!(handle.services().orchestrator.list(None).is_empty());

    handle
        .services()
        .gate
        .record_consent(AccountId::new("acct"), "mesh.maintenance", true, Value::Null);
    handle
        .services()
        .registry
        .register(maintenance_worker("node-a"))
        .unwrap();
    let accepted = gateway.handle(submit).await;
    assert_eq!(accepted.status, 201);
    let job_id = accepted.body["job_id"].as_str().unwrap().to_string();

    let mut body = Value::Null;
    for _ in 0..200 {
        let response = gateway
            .handle(ApiRequest::new(Method::Get, format!("/jobs/{job_id}")))
            .await;
        assert_eq!(response.status, 200);
        body = response.body;
        if body["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["kind"], "exhausted");

    handle.shutdown().await;
}
