//! Gateway runtime lifecycle
//!
//! Wires configuration, connection pool, topology and streamer together and
//! exposes the collaborator interfaces: topology (re)registration, address
//! updates, scaling, request submission and graceful shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::Stream;
use log::{info, warn};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

use super::streamer::{RequestStreamer, ResponseHandle};
use crate::{
    config::{self, Config},
    core::{DataRequest, GatewayResult, Transport},
    pool::{ConnectionPool, HttpTransport},
    topology::{GraphDescription, RoutingTarget, TopologyGraph, TopologyStore},
};

pub struct GatewayRuntime {
    name: String,
    pool_settings: config::Pool,
    shutdown_grace: Duration,
    routing: ArcSwap<BTreeMap<String, RoutingTarget>>,
    topology: Arc<TopologyStore>,
    pool: Arc<ConnectionPool>,
    streamer: Arc<RequestStreamer>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayRuntime {
    /// Builds the runtime from `config`, talking to replicas through `transport`.
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> GatewayResult<Self> {
        info!("Initializing gateway '{}'...", config.gateway.name);

        let pool = Arc::new(ConnectionPool::with_deployments(
            config.pool.clone(),
            transport,
            &config.deployments,
        )?);

        let graph = TopologyGraph::compile_with_routing(&config.graph, &config.routing)?;
        let topology = Arc::new(TopologyStore::new(graph));
        let streamer = Arc::new(RequestStreamer::new(
            topology.clone(),
            pool.clone(),
            &config.gateway,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        let runtime = Self {
            name: config.gateway.name.clone(),
            pool_settings: config.pool.clone(),
            shutdown_grace: config.gateway.shutdown_grace(),
            routing: ArcSwap::from_pointee(config.routing.clone()),
            topology,
            pool,
            streamer,
            shutdown_tx,
            health_task: Mutex::new(None),
        };
        runtime.check_deployments();

        info!("Gateway '{}' initialized", runtime.name);
        Ok(runtime)
    }

    /// Builds the runtime with the HTTP transport.
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        Self::new(config, Arc::new(HttpTransport::new()?))
    }

    /// Spawns the replica health check when `pool.health_check_interval_ms` is set.
    pub async fn start(&self) {
        let Some(interval) = self.pool_settings.health_check_interval() else {
            return;
        };
        let mut health_task = self.health_task.lock().await;
        if health_task.is_some() {
            return;
        }
        let pool = self.pool.clone();
        *health_task = Some(tokio::spawn(
            pool.run_health_check(interval, self.shutdown_tx.subscribe()),
        ));
    }

    /// Compiles and activates a new graph with the current routing overrides.
    ///
    /// On error the active topology keeps serving.
    pub fn register_topology(&self, description: &GraphDescription) -> GatewayResult<()> {
        let routing = self.routing.load_full();
        self.topology.activate(description, &routing)?;
        info!("Topology activated with {} node(s)", description.len());
        self.check_deployments();
        Ok(())
    }

    pub fn register_topology_with_routing(
        &self,
        description: &GraphDescription,
        routing: BTreeMap<String, RoutingTarget>,
    ) -> GatewayResult<()> {
        self.topology.activate(description, &routing)?;
        self.routing.store(Arc::new(routing));
        info!("Topology activated with {} node(s)", description.len());
        self.check_deployments();
        Ok(())
    }

    /// Replaces the replica addresses of `deployment`; the topology is untouched.
    pub fn update_addresses(&self, deployment: &str, addresses: Vec<String>) -> GatewayResult<()> {
        self.pool.register(deployment, addresses)
    }

    pub fn scale(&self, deployment: &str, replicas: usize) -> GatewayResult<()> {
        self.pool.scale(deployment, replicas)
    }

    pub fn dispatch(&self, request: DataRequest) -> GatewayResult<ResponseHandle> {
        self.streamer.dispatch(request)
    }

    pub async fn submit(&self, request: DataRequest) -> GatewayResult<DataRequest> {
        self.streamer.submit(request).await
    }

    pub fn stream<S>(
        &self,
        requests: S,
    ) -> impl Stream<Item = GatewayResult<DataRequest>> + Send + 'static
    where
        S: Stream<Item = DataRequest> + Send + 'static,
    {
        self.streamer.stream(requests)
    }

    pub fn topology(&self) -> Arc<TopologyGraph> {
        self.topology.current()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn streamer(&self) -> &Arc<RequestStreamer> {
        &self.streamer
    }

    /// Configured grace period for [`GatewayRuntime::shutdown`].
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Drains requests within `grace`, cancels the rest, then stops the
    /// health check and closes the pool.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Starting graceful shutdown of gateway '{}'...", self.name);

        self.streamer.shutdown(grace).await;

        let _ = self.shutdown_tx.send(true);
        if let Some(health_task) = self.health_task.lock().await.take() {
            if let Err(e) = health_task.await {
                warn!("Health check task ended abnormally: {e}");
            }
        }

        self.pool.close().await;
        info!("Graceful shutdown completed");
    }

    fn check_deployments(&self) {
        let graph = self.topology.current();
        let registered = self.pool.deployments();
        for deployment in graph.deployments() {
            if !registered.iter().any(|name| name == deployment) {
                warn!("Deployment '{deployment}' is routed to but has no registered addresses");
            }
        }
    }
}
