use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::cache::{ResourceKind, SnapshotCache, SnapshotWatch};
use crate::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use crate::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService,
    endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService,
    listener::v3::listener_discovery_service_server::ListenerDiscoveryService,
    route::v3::route_discovery_service_server::RouteDiscoveryService,
    runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryService,
    secret::v3::secret_discovery_service_server::SecretDiscoveryService,
};

use super::stream::{build_response, node_id, StreamState};

const STREAM_BUFFER: usize = 16;

pub(crate) type DiscoveryStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;
pub(crate) type DeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send + 'static>>;

/// Serves snapshots from the cache over every discovery service.
///
/// Each accepted stream gets its own task that owns the stream state and
/// a watch on its node's snapshot.
#[derive(Clone)]
pub(crate) struct DiscoveryService {
    cache: Arc<dyn SnapshotCache>,
    control_plane: String,
    token: CancellationToken,
}

impl DiscoveryService {
    pub(crate) fn new(
        cache: Arc<dyn SnapshotCache>,
        control_plane: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            cache,
            control_plane: control_plane.into(),
            token,
        }
    }

    fn open_stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        kind: Option<ResourceKind>,
    ) -> Response<DiscoveryStream> {
        let remote_addr = request.remote_addr();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let state = StreamState::new(kind, self.control_plane.clone());

        debug!(?remote_addr, ?kind, "stream opened");

        tokio::spawn(run_stream(
            self.cache.clone(),
            request.into_inner(),
            tx,
            state,
            self.token.child_token(),
        ));

        Response::new(Box::pin(ReceiverStream::new(rx)))
    }

    async fn fetch(
        &self,
        request: DiscoveryRequest,
        kind: ResourceKind,
    ) -> Result<DiscoveryResponse, Status> {
        if !request.type_url.is_empty() && request.type_url != kind.type_url() {
            return Err(Status::invalid_argument(format!(
                "{} cannot be fetched from the {kind} discovery service",
                request.type_url
            )));
        }

        let node = node_id(&request)
            .ok_or_else(|| Status::invalid_argument("fetch request must identify its node"))?;

        let snapshot = self
            .cache
            .snapshot(node)
            .await
            .ok_or_else(|| Status::unavailable(format!("no snapshot for node {node}")))?;

        if request.version_info == snapshot.version_info() {
            return Err(Status::failed_precondition("version up to date"));
        }

        debug!(node, %kind, version = snapshot.version(), "fetch answered");

        Ok(build_response(
            kind,
            &snapshot,
            &request.resource_names,
            &snapshot.version_info(),
            &self.control_plane,
        ))
    }
}

/// Drives one stream until the proxy hangs up, the stream breaks, or the
/// server shuts down
async fn run_stream(
    cache: Arc<dyn SnapshotCache>,
    mut inbound: Streaming<DiscoveryRequest>,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    mut state: StreamState,
    token: CancellationToken,
) {
    let mut updates: Option<SnapshotWatch> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(node = state.node().unwrap_or_default(), "stream cancelled by shutdown");
                break;
            }
            message = inbound.next() => {
                let request = match message {
                    Some(Ok(request)) => request,
                    Some(Err(status)) => {
                        warn!(node = state.node().unwrap_or_default(), %status, "stream failed");
                        break;
                    }
                    None => {
                        debug!(node = state.node().unwrap_or_default(), "proxy closed stream");
                        break;
                    }
                };

                match state.register(&request) {
                    Ok(Some(node)) => updates = Some(cache.watch(&node).await),
                    Ok(None) => {}
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }

                let snapshot = updates.as_ref().and_then(|rx| rx.borrow().clone());

                match state.on_request(request, snapshot.as_deref()) {
                    Ok(Some(response)) => {
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
            alive = changed(&mut updates) => {
                if !alive {
                    updates = None;
                    continue;
                }

                let snapshot = updates.as_mut().and_then(|rx| rx.borrow_and_update().clone());

                let Some(snapshot) = snapshot else {
                    continue;
                };

                let mut delivered = true;

                for response in state.on_snapshot(&snapshot) {
                    if tx.send(Ok(response)).await.is_err() {
                        delivered = false;
                        break;
                    }
                }

                if !delivered {
                    break;
                }
            }
        }
    }

    let phase = state.phase();
    state.close();
    info!(node = state.node().unwrap_or_default(), ?phase, "stream closed");
}

/// Resolves on the next snapshot install, never if nothing is watched yet.
/// `false` means the cache went away.
async fn changed(updates: &mut Option<SnapshotWatch>) -> bool {
    match updates {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryService {
    type StreamAggregatedResourcesStream = DiscoveryStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.open_stream(request, None))
    }

    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("incremental discovery is not supported"))
    }
}

/// Implements a single-kind discovery service on top of [`DiscoveryService`]
macro_rules! single_kind_service {
    (
        $service:ident,
        $kind:expr,
        $stream:ident,
        $stream_ty:ident,
        $delta:ident,
        $delta_ty:ident,
        $fetch:ident
    ) => {
        #[tonic::async_trait]
        impl $service for DiscoveryService {
            type $stream_ty = DiscoveryStream;

            async fn $stream(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                Ok(self.open_stream(request, Some($kind)))
            }

            type $delta_ty = DeltaStream;

            async fn $delta(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                Err(Status::unimplemented("incremental discovery is not supported"))
            }

            async fn $fetch(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                self.fetch(request.into_inner(), $kind).await.map(Response::new)
            }
        }
    };
}

single_kind_service!(
    ClusterDiscoveryService,
    ResourceKind::Cluster,
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    fetch_clusters
);

single_kind_service!(
    ListenerDiscoveryService,
    ResourceKind::Listener,
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    fetch_listeners
);

single_kind_service!(
    RouteDiscoveryService,
    ResourceKind::Route,
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    fetch_routes
);

single_kind_service!(
    EndpointDiscoveryService,
    ResourceKind::Endpoint,
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    fetch_endpoints
);

single_kind_service!(
    SecretDiscoveryService,
    ResourceKind::Secret,
    stream_secrets,
    StreamSecretsStream,
    delta_secrets,
    DeltaSecretsStream,
    fetch_secrets
);

single_kind_service!(
    RuntimeDiscoveryService,
    ResourceKind::Runtime,
    stream_runtime,
    StreamRuntimeStream,
    delta_runtime,
    DeltaRuntimeStream,
    fetch_runtime
);
