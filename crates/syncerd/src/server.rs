//! syncerd server - lifecycle of all subsystems
//!
//! Startup order: local state store, gossip membership, pull transport,
//! registry bridge probe, reconciliation engine (event handler, timer and
//! eager worker). Shutdown releases the same subsystems in reverse. A
//! failed startup step stops whatever already started and is fatal.

use crate::config::Config;
use crate::engine::{Engine, EngineStats};
use crate::export::{ExportCache, Exporter};
use crate::membership::{EventHandler, MemberView, Membership};
use crate::registry::{MemoryRegistry, RegistryBridge};
use crate::signal::TerminationSignal;
use crate::storage::Storage;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncer_core::types::*;
use syncer_net::transport::{PullClient, TcpPullClient, TransportServer};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to start {component}: {reason}")]
    Startup {
        component: &'static str,
        reason: String,
    },
}

fn startup(component: &'static str, reason: impl ToString) -> ServerError {
    ServerError::Startup {
        component,
        reason: reason.to_string(),
    }
}

/// Point-in-time view of the daemon
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Known members other than ourselves, in any state
    pub members: usize,
    pub live_members: usize,
    pub export_version: u64,
    pub checkpoints: Vec<Checkpoint>,
    pub engine: EngineStats,
}

/// Server state
pub struct Server {
    config: Config,
    registry: Arc<dyn RegistryBridge>,
    /// Answers pulls; exists before the engine so the transport can start first
    export_cache: Arc<ExportCache>,
    client: Arc<dyn PullClient>,
    storage: RwLock<Option<Arc<Storage>>>,
    membership: RwLock<Option<Arc<Membership>>>,
    transport: RwLock<Option<Arc<TransportServer>>>,
    engine: RwLock<Option<Arc<Engine>>>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    engine_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Engine counters as of `stop`
    final_engine_stats: Mutex<EngineStats>,
    /// Subsystems released by `stop`, in order
    released: Mutex<Vec<&'static str>>,
    /// Requests shutdown of a running server
    shutdown: CancellationToken,
    /// Stops the timer, the eager worker and in-flight pulls
    engine_token: CancellationToken,
    stopped: AtomicBool,
}

impl Server {
    /// Create a server backed by the in-memory registry (seeded from
    /// `--registry-file` if given)
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let cluster = config.cluster_id();
        let registry = match &config.registry_file {
            Some(path) => MemoryRegistry::from_seed_file(cluster, path)
                .map_err(|e| startup("registry bridge", e))?,
            None => MemoryRegistry::new(cluster),
        };
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    /// Create a server around an externally provided registry bridge
    pub fn with_registry(config: Config, registry: Arc<dyn RegistryBridge>) -> Self {
        let shutdown = CancellationToken::new();
        let engine_token = shutdown.child_token();
        Self {
            export_cache: Arc::new(ExportCache::new(config.cluster_id())),
            config,
            registry,
            client: Arc::new(TcpPullClient::new()),
            storage: RwLock::new(None),
            membership: RwLock::new(None),
            transport: RwLock::new(None),
            engine: RwLock::new(None),
            handler: Mutex::new(None),
            engine_tasks: Mutex::new(Vec::new()),
            final_engine_stats: Mutex::new(EngineStats::default()),
            released: Mutex::new(Vec::new()),
            shutdown,
            engine_token,
            stopped: AtomicBool::new(false),
        }
    }

    /// Run the server until a termination signal or [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut signals =
            TerminationSignal::install().map_err(|e| startup("signal handler", e))?;

        if let Err(e) = self.start().await {
            error!("{}", e);
            self.stop().await;
            return Err(e);
        }

        tokio::select! {
            name = signals.recv() => info!("Received {}, shutting down", name),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }
        self.stop().await;
        Ok(())
    }

    async fn start(&self) -> Result<(), ServerError> {
        let node = self.config.local_node();
        info!(
            "Starting syncerd node {} for cluster {}",
            node.id, node.cluster
        );

        let storage = Arc::new(
            Storage::open(&self.config.data_dir).map_err(|e| startup("local state store", e))?,
        );
        *self.storage.write() = Some(storage.clone());

        let membership = Arc::new(Membership::new(self.config.membership_config()));
        *self.membership.write() = Some(membership.clone());
        membership
            .start()
            .await
            .map_err(|e| startup("membership", e))?;

        let transport = TransportServer::bind(
            self.config.rpc_addr,
            self.export_cache.clone(),
            CancellationToken::new(),
        )
        .await
        .map_err(|e| startup("transport server", e))?;
        *self.transport.write() = Some(Arc::new(transport));

        let probe = self.config.engine_config().pull_timeout;
        match tokio::time::timeout(probe, self.registry.health()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(startup("registry bridge", e)),
            Err(_) => return Err(startup("registry bridge", format!("no answer within {:?}", probe))),
        }

        let exporter = Arc::new(Exporter::new(
            self.registry.clone(),
            storage.clone(),
            self.export_cache.clone(),
        ));
        let members: Arc<dyn MemberView> = membership.clone();
        let engine = Arc::new(Engine::new(
            self.config.engine_config(),
            members,
            self.client.clone(),
            self.registry.clone(),
            storage,
            exporter,
        ));
        *self.engine.write() = Some(engine.clone());

        let handler = engine.event_handler();
        membership.register_event_handler(handler.clone());
        *self.handler.lock() = Some(handler);

        let mut tasks = self.engine_tasks.lock();
        tasks.push(engine.spawn_eager_worker(self.engine_token.clone()));
        tasks.push(engine.spawn_timer(self.engine_token.clone()));

        info!(
            "syncerd started: gossip {}, pull rpc {}",
            membership.advertise_addr(),
            node.rpc_addr
        );
        Ok(())
    }

    /// Release every started subsystem in reverse startup order. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping syncerd");

        // no cycle may start once membership teardown begins
        self.engine_token.cancel();
        let tasks: Vec<JoinHandle<()>> = self.engine_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        let engine = self.engine.write().take();
        if let Some(engine) = engine {
            *self.final_engine_stats.lock() = engine.stats();
            self.released("engine");
        }

        let membership = self.membership.read().clone();
        let handler = self.handler.lock().take();
        if let Some(membership) = membership {
            if let Some(handler) = handler {
                membership.deregister_event_handler(&handler);
            }
            membership.leave().await;
            membership.shutdown().await;
            self.released("membership");
        }

        let transport = self.transport.read().clone();
        if let Some(transport) = transport {
            transport.stop().await;
            self.released("transport server");
        }

        let storage = self.storage.write().take();
        if let Some(storage) = storage {
            if let Err(e) = storage.flush() {
                error!("Failed to flush local state store: {}", e);
            }
            drop(storage);
            self.released("local state store");
        }
        info!("syncerd stopped");
    }

    fn released(&self, component: &'static str) {
        debug!("Released {}", component);
        self.released.lock().push(component);
    }

    /// Subsystems released by [`stop`](Self::stop), in release order
    pub fn released_components(&self) -> Vec<&'static str> {
        self.released.lock().clone()
    }

    /// Request shutdown of a running server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bound pull RPC address, once the transport is up
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.transport.read().as_ref().map(|t| t.local_addr())
    }

    /// Advertised gossip address, once membership is up
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.membership.read().as_ref().map(|m| m.advertise_addr())
    }

    pub fn stats(&self) -> ServerStats {
        let (members, live_members) = match self.membership.read().as_ref() {
            Some(m) => (m.member_count(), m.live_members().len()),
            None => (0, 0),
        };
        let checkpoints = match self.storage.read().as_ref() {
            Some(storage) => storage.list_checkpoints().unwrap_or_else(|e| {
                warn!("Failed to list checkpoints: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let engine = match self.engine.read().as_ref() {
            Some(engine) => engine.stats(),
            None => self.final_engine_stats.lock().clone(),
        };
        ServerStats {
            members,
            live_members,
            export_version: self.export_cache.current_version(),
            checkpoints,
            engine,
        }
    }
}
