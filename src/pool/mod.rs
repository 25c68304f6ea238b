//! Connection pool
//!
//! Maps deployment names to replica sets, load-balances calls across the
//! replicas of a deployment, retries transient failures and tracks the
//! passive health of every replica.

pub mod backoff;
pub mod replica;
pub mod transport;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::{sync::watch, sync::Notify, time::Instant};

use crate::config::{self, validate_address};
use crate::core::{
    metrics::{POOL_ATTEMPTS, REPLICA_UNHEALTHY},
    DataRequest, Dispatcher, GatewayError, GatewayResult, Transport, TransportError,
};

pub use backoff::Backoff;
pub use replica::{Replica, ReplicaSet};
pub use transport::HttpTransport;

pub struct ConnectionPool {
    deployments: DashMap<String, Arc<ReplicaSet>>,
    transport: Arc<dyn Transport>,
    settings: config::Pool,
    backoff: Backoff,
    in_flight: AtomicUsize,
    drained: Notify,
    closed: AtomicBool,
}

// Counts a send as in flight until dropped.
struct InFlight<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.pool.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.drained.notify_waiters();
        }
    }
}

impl ConnectionPool {
    pub fn new(settings: config::Pool, transport: Arc<dyn Transport>) -> Self {
        Self {
            deployments: DashMap::new(),
            transport,
            backoff: Backoff::from(&settings.backoff),
            settings,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a pool and registers every deployment of `deployments`.
    pub fn with_deployments<'a, I>(
        settings: config::Pool,
        transport: Arc<dyn Transport>,
        deployments: I,
    ) -> GatewayResult<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    {
        let pool = Self::new(settings, transport);
        for (name, addresses) in deployments {
            pool.register(name, addresses.clone())?;
        }
        Ok(pool)
    }

    /// Registers or replaces the address list of `deployment`.
    ///
    /// Addresses kept across the update keep their health state, and the
    /// rotation continues where it was. A deployment scaled below its
    /// registered count keeps that replica count.
    pub fn register(&self, deployment: &str, addresses: Vec<String>) -> GatewayResult<()> {
        if deployment.is_empty() {
            return Err(GatewayError::Configuration(
                "deployment name must not be empty".to_string(),
            ));
        }
        for address in &addresses {
            validate_address(address)?;
        }
        if addresses.is_empty() {
            warn!("Deployment '{deployment}' registered without replicas");
        }

        self.deployments
            .entry(deployment.to_string())
            .and_modify(|set| *set = Arc::new(set.with_addresses(&addresses)))
            .or_insert_with(|| Arc::new(ReplicaSet::new(addresses.iter().cloned())));

        info!(
            "Deployment '{deployment}' registered with {} replica(s)",
            addresses.len()
        );
        Ok(())
    }

    /// Removes `deployment`. Returns false when it was unknown.
    pub fn deregister(&self, deployment: &str) -> bool {
        let removed = self.deployments.remove(deployment).is_some();
        if removed {
            info!("Deployment '{deployment}' deregistered");
        }
        removed
    }

    /// Restricts traffic of `deployment` to its first `replicas` registered addresses.
    pub fn scale(&self, deployment: &str, replicas: usize) -> GatewayResult<()> {
        let mut entry = self.deployments.get_mut(deployment).ok_or_else(|| {
            GatewayError::Configuration(format!("cannot scale unknown deployment '{deployment}'"))
        })?;

        let registered = entry.registered().len();
        if replicas == 0 || replicas > registered {
            return Err(GatewayError::Configuration(format!(
                "cannot scale deployment '{deployment}' to {replicas} replica(s), {registered} registered"
            )));
        }

        let scaled = Arc::new(entry.with_active(replicas));
        *entry = scaled;
        info!("Deployment '{deployment}' scaled to {replicas} replica(s)");
        Ok(())
    }

    pub fn deployments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.deployments.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Addresses currently taking traffic for `deployment`.
    pub fn addresses(&self, deployment: &str) -> Option<Vec<String>> {
        self.deployments.get(deployment).map(|set| {
            set.active()
                .iter()
                .map(|replica| replica.address().to_string())
                .collect()
        })
    }

    pub fn is_healthy(&self, deployment: &str, address: &str) -> Option<bool> {
        let set = self.deployments.get(deployment)?;
        set.registered()
            .iter()
            .find(|replica| replica.address() == address)
            .map(|replica| replica.is_healthy())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn replica_set(&self, deployment: &str) -> GatewayResult<Arc<ReplicaSet>> {
        self.deployments
            .get(deployment)
            .map(|set| set.value().clone())
            .ok_or_else(|| {
                GatewayError::Connection(format!("deployment '{deployment}' is not registered"))
            })
    }

    fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight { pool: self }
    }

    /// Sends `request` to one replica of `deployment`, retrying transient
    /// failures on the next replicas until `timeout` elapses.
    pub async fn send(
        &self,
        deployment: &str,
        request: DataRequest,
        endpoint: &str,
        timeout: Duration,
    ) -> GatewayResult<DataRequest> {
        let _in_flight = self.enter();
        if self.is_closed() {
            return Err(GatewayError::Connection(format!(
                "connection pool is closed, '{deployment}' not reached"
            )));
        }

        let deadline = Instant::now() + timeout;
        let attempts = self.settings.retries.saturating_add(1);
        let cooldown = self.settings.unhealthy_cooldown();
        let mut last_failure: Option<(Arc<Replica>, TransportError)> = None;

        for attempt in 0..attempts {
            if Instant::now() >= deadline {
                break;
            }

            let replicas = self.replica_set(deployment)?;
            let replica = replicas.select(cooldown).ok_or_else(|| {
                GatewayError::Connection(format!("deployment '{deployment}' has no replicas"))
            })?;

            let call = self
                .transport
                .call(replica.address(), endpoint, request.clone());
            let outcome = tokio::time::timeout_at(deadline, call)
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout(format!(
                        "no response within {timeout:?}"
                    )))
                });

            match outcome {
                Ok(response) => {
                    if replica.mark_healthy() {
                        info!(
                            "Replica {} of '{deployment}' answered again, marked healthy",
                            replica.address()
                        );
                    }
                    POOL_ATTEMPTS.with_label_values(&[deployment, "ok"]).inc();
                    return Ok(response);
                }
                Err(err) if !err.is_transient() => {
                    POOL_ATTEMPTS.with_label_values(&[deployment, "failed"]).inc();
                    return Err(GatewayError::Connection(format!(
                        "deployment '{deployment}' replica {} failed: {err}",
                        replica.address()
                    )));
                }
                Err(err) => {
                    POOL_ATTEMPTS.with_label_values(&[deployment, "retry"]).inc();
                    debug!(
                        "Attempt {} to '{deployment}' via {} failed: {err}",
                        attempt + 1,
                        replica.address()
                    );
                    last_failure = Some((replica, err));
                }
            }

            if attempt + 1 < attempts {
                let delay = self
                    .backoff
                    .delay(attempt)
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(delay).await;
            }
        }

        match last_failure {
            Some((replica, err)) => {
                replica.mark_unhealthy();
                REPLICA_UNHEALTHY.with_label_values(&[deployment]).inc();
                warn!(
                    "Replica {} of '{deployment}' marked unhealthy: {err}",
                    replica.address()
                );
                Err(GatewayError::Connection(format!(
                    "deployment '{deployment}' unreachable, last replica {}: {err}",
                    replica.address()
                )))
            }
            None => Err(GatewayError::Connection(format!(
                "deadline of {timeout:?} passed before '{deployment}' was reached"
            ))),
        }
    }

    /// Checks every unhealthy replica once and marks the reachable ones healthy.
    ///
    /// Returns the number of replicas that recovered.
    pub async fn check_unhealthy(&self) -> usize {
        let unhealthy: Vec<(String, Arc<Replica>)> = self
            .deployments
            .iter()
            .flat_map(|entry| {
                let name = entry.key().clone();
                entry
                    .registered()
                    .iter()
                    .filter(|replica| !replica.is_healthy())
                    .map(|replica| (name.clone(), replica.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        if unhealthy.is_empty() {
            return 0;
        }

        let timeout = self.settings.health_check_timeout();
        let checks = unhealthy.iter().map(|(deployment, replica)| async move {
            let reachable = self.transport.is_reachable(replica.address(), timeout).await;
            if reachable && replica.mark_healthy() {
                info!(
                    "Replica {} of '{deployment}' passed health check, marked healthy",
                    replica.address()
                );
                true
            } else {
                false
            }
        });

        join_all(checks).await.into_iter().filter(|ok| *ok).count()
    }

    /// Checks unhealthy replicas every `interval` until `shutdown` flips to true.
    pub async fn run_health_check(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Replica health check started, interval {interval:?}");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let recovered = self.check_unhealthy().await;
                    if recovered > 0 {
                        debug!("Health check recovered {recovered} replica(s)");
                    }
                }
            }
        }
        info!("Replica health check stopped");
    }

    /// Rejects new sends, waits for in-flight ones and closes the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drain_timeout = self.settings.drain_timeout();
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(drain_timeout, drained).await.is_err() {
            warn!(
                "Connection pool closed with {} send(s) still in flight",
                self.in_flight.load(Ordering::Acquire)
            );
        }

        self.transport.close().await;
        self.deployments.clear();
        info!("Connection pool closed");
    }
}

#[async_trait]
impl Dispatcher for ConnectionPool {
    async fn send(
        &self,
        deployment: &str,
        request: DataRequest,
        endpoint: &str,
        timeout: Duration,
    ) -> GatewayResult<DataRequest> {
        ConnectionPool::send(self, deployment, request, endpoint, timeout).await
    }
}
