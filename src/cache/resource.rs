use derive_more::Display;

pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ENDPOINT_TYPE: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
pub const RUNTIME_TYPE: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";

/// Resource kinds a snapshot carries. Only clusters, route configurations
/// and listeners are ever populated, the rest are served empty.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cluster,
    Route,
    Listener,
    Endpoint,
    Secret,
    Runtime,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        Self::Cluster,
        Self::Route,
        Self::Listener,
        Self::Endpoint,
        Self::Secret,
        Self::Runtime,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Cluster => CLUSTER_TYPE,
            Self::Route => ROUTE_TYPE,
            Self::Listener => LISTENER_TYPE,
            Self::Endpoint => ENDPOINT_TYPE,
            Self::Secret => SECRET_TYPE,
            Self::Runtime => RUNTIME_TYPE,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_url() == type_url)
    }

    /// Wildcard kinds are always answered in full, the others only with the
    /// names a proxy subscribed to
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Cluster | Self::Listener)
    }
}
