//! Assembly of the full mesh and its background tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use world_engine::{
    system_clock, InvariantAudit, MergeReport, SharedClock, SharedWorld, SnapshotSource,
    SyncWorker, System, TickLoop, Timestamp, WorldState,
};

use crate::config::MeshConfig;
use crate::error::Result;
use crate::events::{EventBus, MeshEvent};
use crate::gateway::Gateway;
use crate::network::{NetworkClient, Transport};
use crate::orchestrator::{JobTypeClassifier, Orchestrator};
use crate::policy::PolicyGate;
use crate::registry::NodeRegistry;
use crate::world_service::WorldService;

/// Ticked time between two world invariant audits.
const AUDIT_EVERY: Duration = Duration::from_secs(10);

/// Shared handles to every service of a mesh.
#[derive(Clone)]
pub struct MeshServices {
    pub events: EventBus,
    pub network: Arc<NetworkClient>,
    pub registry: Arc<NodeRegistry>,
    pub gate: Arc<PolicyGate>,
    pub world: Arc<WorldService>,
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<Gateway>,
}

/// A wired but not yet running mesh.
pub struct Mesh {
    services: MeshServices,
    tick_loop: TickLoop,
    sync: SyncWorker,
}

impl Mesh {
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        Self::with_clock(config, transport, source, system_clock())
    }

    /// Build with an explicit clock for liveness, rate windows and timestamps.
    pub fn with_clock(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let network = Arc::new(NetworkClient::new(transport, &config.network, events.clone()));
        let registry = Arc::new(NodeRegistry::new(
            config.registry.clone(),
            clock.clone(),
            events.clone(),
        ));
        let gate = Arc::new(
            PolicyGate::new(config.policy.clone(), clock.clone())
                .with_classifier(Arc::new(JobTypeClassifier)),
        );
        let world: SharedWorld = WorldState::with_clock(clock.clone()).into_shared();

        let sync_events = events.clone();
        let sync = SyncWorker::new(world.clone(), source, config.world.sync_interval())
            .with_tombstone_ttl(config.world.tombstone_ttl())
            .with_observer(Arc::new(move |at: Timestamp, report: &MergeReport| {
                sync_events.publish(MeshEvent::WorldSynced { at, report: *report });
            }));

        let world_service = Arc::new(
            WorldService::new(world.clone(), gate.clone(), registry.clone())
                .with_sync_trigger(sync.trigger()),
        );
        let orchestrator = Arc::new(
            Orchestrator::new(
                config.orchestrator.clone(),
                registry.clone(),
                gate.clone(),
                network.clone(),
                clock,
                events.clone(),
            )?
            .with_effects(world_service.clone()),
        );
        let gateway = Arc::new(Gateway::new(
            registry.clone(),
            orchestrator.clone(),
            gate.clone(),
            world_service.clone(),
            events.clone(),
        ));

        let tick_loop =
            TickLoop::new(world, config.world.tick_hz).with_system(InvariantAudit::new(AUDIT_EVERY));

        Ok(Self {
            services: MeshServices {
                events,
                network,
                registry,
                gate,
                world: world_service,
                orchestrator,
                gateway,
            },
            tick_loop,
            sync,
        })
    }

    pub fn services(&self) -> &MeshServices {
        &self.services
    }

    /// Register a per-tick system. Systems run after the built-in audit.
    pub fn add_system(&mut self, system: impl System + 'static) -> &mut Self {
        self.tick_loop.add_system(system);
        self
    }

    /// Bootstrap the world from the backend, connect, and spawn every loop.
    ///
    /// A failed first connect or bootstrap is logged, not fatal: the network
    /// supervisor keeps reconnecting and the sync worker keeps pulling.
    pub async fn start(self) -> MeshHandle {
        let Mesh {
            services,
            tick_loop,
            sync,
        } = self;

        if let Err(e) = sync.bootstrap().await {
            warn!(error = %e, "world bootstrap failed, starting empty");
        }
        if let Err(e) = services.network.connect().await {
            warn!(error = %e, "initial connect failed, reconnecting in background");
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(services.registry.clone().run_sweeper(rx.clone())),
            tokio::spawn(services.orchestrator.clone().run(rx.clone())),
            tokio::spawn(services.orchestrator.clone().run_recurring(rx.clone())),
            tokio::spawn(tick_loop.run(rx.clone())),
            tokio::spawn(sync.run(rx)),
        ];
        info!(tasks = tasks.len(), "mesh started");

        MeshHandle {
            services,
            shutdown,
            tasks,
        }
    }
}

/// A running mesh.
pub struct MeshHandle {
    services: MeshServices,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshHandle {
    pub fn services(&self) -> &MeshServices {
        &self.services
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.services.gateway
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) {
        info!("mesh shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "mesh task ended abnormally");
            }
        }
        self.services.network.disconnect();
        info!("mesh stopped");
    }
}
