//! Per-request execution over a compiled topology
//!
//! Every request gets its own [`RequestExecution`]: one join slot per node
//! and a one-shot outcome channel. Node tasks run on a per-request
//! [`TaskTracker`] so the request is only considered drained once every
//! node task, hanging branches included, has terminated.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, warn};
use tokio::sync::{oneshot, Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::merge::merge_reduce;
use crate::core::{
    metrics::{NODE_DISPATCHES, REQUESTS, REQUESTS_IN_FLIGHT, REQUEST_LATENCY},
    DataRequest, Dispatcher, GatewayError, GatewayResult,
};
use crate::request_error;
use crate::topology::{Node, TopologyGraph};

pub(crate) type Outcome = oneshot::Sender<GatewayResult<DataRequest>>;

/// Merge buffer of one node for one request.
struct JoinSlot {
    capacity: usize,
    arrivals: Mutex<Vec<DataRequest>>,
    dispatched: AtomicBool,
}

impl JoinSlot {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            arrivals: Mutex::new(Vec::with_capacity(capacity)),
            dispatched: AtomicBool::new(false),
        }
    }

    /// Buffers `payload`; returns the full buffer to the one delivery that completes it.
    async fn push(&self, payload: DataRequest) -> Option<Vec<DataRequest>> {
        let mut arrivals = self.arrivals.lock().await;
        arrivals.push(payload);
        if arrivals.len() < self.capacity {
            return None;
        }
        if self.dispatched.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(std::mem::take(&mut *arrivals))
    }
}

pub(crate) struct RequestExecution {
    correlation_id: String,
    endpoint: String,
    graph: Arc<TopologyGraph>,
    dispatcher: Arc<dyn Dispatcher>,
    send_timeout: Duration,
    slots: HashMap<String, JoinSlot>,
    outcome: Mutex<Option<Outcome>>,
    failed: AtomicBool,
    started: Instant,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl RequestExecution {
    pub(crate) fn new(
        correlation_id: String,
        endpoint: String,
        graph: Arc<TopologyGraph>,
        dispatcher: Arc<dyn Dispatcher>,
        send_timeout: Duration,
        outcome: Outcome,
        cancel: CancellationToken,
    ) -> Self {
        let slots = graph
            .nodes()
            .map(|node| (node.name.clone(), JoinSlot::new(node.in_degree)))
            .collect();
        Self {
            correlation_id,
            endpoint,
            graph,
            dispatcher,
            send_timeout,
            slots,
            outcome: Mutex::new(Some(outcome)),
            failed: AtomicBool::new(false),
            started: Instant::now(),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Drives the request: seeds the origin's children, then waits until every
    /// node task has terminated or the request is cancelled.
    pub(crate) async fn run(self: Arc<Self>, request: DataRequest) {
        REQUESTS_IN_FLIGHT.inc();
        debug!("[{}] request started", self.correlation_id);

        for child in self.graph.origin_children() {
            self.deliver(child, request.clone()).await;
        }
        // Node tasks spawn their successors before they exit, so the tracker
        // only empties once the whole request has drained.
        self.tracker.close();

        tokio::select! {
            _ = self.tracker.wait() => {}
            _ = self.cancel.cancelled() => {
                self.failed.store(true, Ordering::Release);
                self.resolve(Err(GatewayError::Cancellation(format!(
                    "request {} aborted",
                    self.correlation_id
                ))))
                .await;
                self.tracker.wait().await;
            }
        }

        self.resolve(Err(GatewayError::Internal(format!(
            "request {} drained without reaching the end-gateway",
            self.correlation_id
        ))))
        .await;

        REQUESTS_IN_FLIGHT.dec();
        debug!(
            "[{}] request drained after {:?}",
            self.correlation_id,
            self.started.elapsed()
        );
    }

    /// Delivers one predecessor payload to `node` and schedules it once its join is complete.
    async fn deliver(self: &Arc<Self>, node: &str, payload: DataRequest) {
        let Some(slot) = self.slots.get(node) else {
            self.fail(GatewayError::Internal(format!(
                "node '{node}' has no join slot"
            )))
            .await;
            return;
        };

        if let Some(inputs) = slot.push(payload).await {
            self.schedule(node.to_string(), inputs);
        } else {
            debug!("[{}] delivery to '{node}' buffered", self.correlation_id);
        }
    }

    fn schedule(self: &Arc<Self>, node: String, inputs: Vec<DataRequest>) {
        if self.failed.load(Ordering::Acquire) {
            debug!(
                "[{}] request failed, '{node}' not scheduled",
                self.correlation_id
            );
            return;
        }
        NODE_DISPATCHES.with_label_values(&[node.as_str()]).inc();
        self.tracker.spawn(self.clone().run_node(node, inputs));
    }

    fn run_node(self: Arc<Self>, name: String, inputs: Vec<DataRequest>) -> BoxFuture<'static, ()> {
        async move {
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[{}] node '{name}' cancelled", self.correlation_id);
                }
                _ = self.process(&name, inputs) => {}
            }
        }
        .boxed()
    }

    async fn process(self: &Arc<Self>, name: &str, inputs: Vec<DataRequest>) {
        let Some(node) = self.graph.node(name) else {
            self.fail(GatewayError::Internal(format!("unknown node '{name}'")))
                .await;
            return;
        };

        match self.forward(node, inputs).await {
            Ok(Some(response)) => {
                for child in &node.children {
                    self.deliver(child, response.clone()).await;
                }
            }
            Ok(None) => {}
            Err(err) if node.reaches_sink => {
                error!(
                    "[{}] node '{name}' failed: {err}",
                    self.correlation_id
                );
                self.fail(err).await;
            }
            Err(err) => {
                warn!(
                    "[{}] hanging node '{name}' failed: {err}",
                    self.correlation_id
                );
            }
        }
    }

    /// Merges the join inputs and sends them on. Returns `None` at the end-gateway.
    async fn forward(
        &self,
        node: &Node,
        mut inputs: Vec<DataRequest>,
    ) -> GatewayResult<Option<DataRequest>> {
        let merged = if inputs.len() > 1 {
            merge_reduce(inputs)?
        } else {
            inputs.pop().ok_or_else(|| {
                GatewayError::Internal(format!("node '{}' scheduled without input", node.name))
            })?
        };

        if node.is_sink() {
            self.resolve(Ok(merged)).await;
            return Ok(None);
        }

        let target = node.target.as_ref().ok_or_else(|| {
            GatewayError::Internal(format!("node '{}' has no routing target", node.name))
        })?;
        let endpoint = target.endpoint.as_deref().unwrap_or(&self.endpoint);
        let expected = merged.docs.len();
        let template = merged.with_docs(Vec::new());

        debug!(
            "[{}] node '{}' -> {}{endpoint}",
            self.correlation_id, node.name, target.deployment
        );
        let response = self
            .dispatcher
            .send(&target.deployment, merged, endpoint, self.send_timeout)
            .await?;

        if response.docs.len() != expected {
            return Err(request_error!(
                "deployment '{}' returned {} documents for {}",
                target.deployment,
                response.docs.len(),
                expected
            ));
        }
        Ok(Some(template.with_docs(response.docs)))
    }

    async fn fail(&self, err: GatewayError) {
        self.failed.store(true, Ordering::Release);
        self.resolve(Err(err)).await;
    }

    /// Sends the terminal result. Only the first call has an effect.
    async fn resolve(&self, result: GatewayResult<DataRequest>) -> bool {
        let Some(outcome) = self.outcome.lock().await.take() else {
            return false;
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        REQUESTS.with_label_values(&[label]).inc();
        REQUEST_LATENCY.observe(self.started.elapsed().as_secs_f64() * 1000.0);

        if outcome.send(result).is_err() {
            debug!(
                "[{}] caller went away before the result",
                self.correlation_id
            );
        }
        true
    }
}
