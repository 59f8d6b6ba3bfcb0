mod plane;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::cache::SnapshotCache;
use crate::error::ServerError;
use crate::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer,
    discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer,
    endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer,
    listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer,
    route::v3::route_discovery_service_server::RouteDiscoveryServiceServer,
    runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryServiceServer,
    secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer,
};

pub(crate) use plane::DiscoveryService;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    /// HTTP/2 ping interval towards idle proxies
    pub keepalive_interval: Duration,
    /// How long a ping may go unanswered before the connection is dropped
    pub keepalive_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub max_concurrent_streams: u32,
    /// How long open streams may keep running after shutdown starts
    pub shutdown_grace: Duration,
    pub control_plane_id: String,
}

/// gRPC host for all discovery services plus gRPC health
pub struct DiscoveryServer {
    cache: Arc<dyn SnapshotCache>,
    options: ServerOptions,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<dyn SnapshotCache>, options: ServerOptions) -> Self {
        Self { cache, options }
    }

    /// Binds every interface on the configured port and serves until
    /// `token` is cancelled
    pub async fn start(self, token: CancellationToken) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.options.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.serve(listener, token).await
    }

    /// Serves on an already bound listener.
    ///
    /// Cancelling `token` stops accepting connections, gives open streams
    /// the grace period to finish, then closes them.
    pub async fn serve(
        self,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr().ok();
        let grace = self.options.shutdown_grace;

        let incoming = TcpIncoming::from_listener(listener, true, Some(self.options.tcp_keepalive))
            .map_err(|err| ServerError::Incoming(err.to_string()))?;

        // Stream tasks outlive the accept loop until the grace period is over
        let streams = CancellationToken::new();
        let _streams_guard = streams.clone().drop_guard();

        let service = DiscoveryService::new(
            self.cache.clone(),
            self.options.control_plane_id.clone(),
            streams.clone(),
        );

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<AggregatedDiscoveryServiceServer<DiscoveryService>>()
            .await;

        let router = Server::builder()
            .http2_keepalive_interval(Some(self.options.keepalive_interval))
            .http2_keepalive_timeout(Some(self.options.keepalive_timeout))
            .max_concurrent_streams(Some(self.options.max_concurrent_streams))
            .add_service(health_service)
            .add_service(AggregatedDiscoveryServiceServer::new(service.clone()))
            .add_service(ClusterDiscoveryServiceServer::new(service.clone()))
            .add_service(ListenerDiscoveryServiceServer::new(service.clone()))
            .add_service(RouteDiscoveryServiceServer::new(service.clone()))
            .add_service(EndpointDiscoveryServiceServer::new(service.clone()))
            .add_service(SecretDiscoveryServiceServer::new(service.clone()))
            .add_service(RuntimeDiscoveryServiceServer::new(service));

        info!(?addr, control_plane = %self.options.control_plane_id, "discovery server listening");

        let signal = token.clone();
        let server = router.serve_with_incoming_shutdown(incoming, async move {
            signal.cancelled().await;
        });
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = token.cancelled() => {
                health_reporter
                    .set_not_serving::<AggregatedDiscoveryServiceServer<DiscoveryService>>()
                    .await;
                info!(?grace, "draining discovery streams");

                if let Ok(result) = timeout(grace, &mut server).await {
                    result?;
                } else {
                    warn!("grace period elapsed, closing remaining streams");
                    streams.cancel();

                    match timeout(grace, &mut server).await {
                        Ok(result) => result?,
                        Err(_) => warn!("connections still open, dropping them"),
                    }
                }
            }
        }

        info!("discovery server stopped");

        Ok(())
    }
}
