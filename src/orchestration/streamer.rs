//! Entry point for protocol adapters.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use super::executor::RequestExecution;
use crate::config;
use crate::core::{DataRequest, Dispatcher, GatewayError, GatewayResult};
use crate::topology::TopologyStore;

/// Runs requests over the active topology, each with its own execution state.
pub struct RequestStreamer {
    topology: Arc<TopologyStore>,
    dispatcher: Arc<dyn Dispatcher>,
    send_timeout: Duration,
    prefetch: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    // Held for reading across admission so shutdown cannot interleave
    accepting: RwLock<bool>,
}

impl RequestStreamer {
    pub fn new(
        topology: Arc<TopologyStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: &config::Gateway,
    ) -> Self {
        Self {
            topology,
            dispatcher,
            send_timeout: settings.timeout_send(),
            prefetch: settings.prefetch.max(1),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            accepting: RwLock::new(true),
        }
    }

    /// Starts `request` and returns a handle resolving to its response.
    ///
    /// The topology is snapshotted here; later recompilations do not affect
    /// this request.
    pub fn dispatch(&self, mut request: DataRequest) -> GatewayResult<ResponseHandle> {
        let accepting = self.accepting.read().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(GatewayError::Cancellation(
                "gateway is shutting down".to_string(),
            ));
        }
        request.validate()?;
        if request.request_id.is_empty() {
            request.request_id = Uuid::new_v4().to_string();
        }

        let correlation_id = request.request_id.clone();
        let (sender, receiver) = oneshot::channel();
        let cancel = self.shutdown.child_token();
        let execution = Arc::new(RequestExecution::new(
            correlation_id.clone(),
            request.endpoint.clone(),
            self.topology.current(),
            self.dispatcher.clone(),
            self.send_timeout,
            sender,
            cancel.clone(),
        ));
        self.tracker.spawn(execution.run(request));
        drop(accepting);

        Ok(ResponseHandle {
            correlation_id,
            receiver,
            cancel,
            completed: false,
        })
    }

    pub async fn submit(&self, request: DataRequest) -> GatewayResult<DataRequest> {
        self.dispatch(request)?.await
    }

    /// Runs a sequence of requests with at most `prefetch` in flight.
    ///
    /// Results are yielded as they resolve, not in request order.
    pub fn stream<S>(
        self: &Arc<Self>,
        requests: S,
    ) -> impl Stream<Item = GatewayResult<DataRequest>> + Send + 'static
    where
        S: Stream<Item = DataRequest> + Send + 'static,
    {
        let streamer = self.clone();
        requests
            .map(move |request| {
                let streamer = streamer.clone();
                async move { streamer.submit(request).await }
            })
            .buffer_unordered(self.prefetch)
    }

    /// Number of requests that have not drained yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops accepting requests and waits up to `grace` for in-flight ones;
    /// whatever is left is cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        *self.accepting.write().unwrap_or_else(PoisonError::into_inner) = false;
        self.tracker.close();
        info!(
            "Request streamer shutting down, {} request(s) in flight",
            self.tracker.len()
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} request(s) still running after {grace:?}, cancelling",
                self.tracker.len()
            );
            self.shutdown.cancel();
            self.tracker.wait().await;
        }
        info!("Request streamer stopped");
    }
}

/// Pending response of one dispatched request.
///
/// Dropping the handle before it resolves cancels the request.
pub struct ResponseHandle {
    correlation_id: String,
    receiver: oneshot::Receiver<GatewayResult<DataRequest>>,
    cancel: CancellationToken,
    completed: bool,
}

impl ResponseHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Aborts the request; the handle then resolves to a cancellation error.
    pub fn cancel(&self) {
        debug!("[{}] cancel requested", self.correlation_id);
        self.cancel.cancel();
    }
}

impl Future for ResponseHandle {
    type Output = GatewayResult<DataRequest>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.completed = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(GatewayError::Cancellation(format!(
                        "request {} dropped before it resolved",
                        this.correlation_id
                    )))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.completed {
            self.cancel.cancel();
        }
    }
}
