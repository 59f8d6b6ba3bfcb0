use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

/// Errors returned by route manager operations
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    /// Empty name, malformed hostname, match or backend
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("route {0} already exists")]
    AlreadyExists(String),

    #[error("route {0} does not exist")]
    NotFound(String),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse route table: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to generate snapshot: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("snapshot install timed out after {0:?}")]
    CacheTimeout(Duration),

    #[error("failed to install snapshot: {0}")]
    Cache(#[from] CacheError),
}

impl ManagerError {
    /// The request was rejected before anything was mutated
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::AlreadyExists(_))
    }
}

/// Errors that happen while rendering proxy resources
#[derive(thiserror::Error, Debug)]
pub enum SynthesisError {
    #[error("failed to read TLS material {}: {source}", .path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TLS material {} is not PEM encoded", .0.display())]
    NotPem(PathBuf),

    #[error("virtual host {virtual_host} routes to unknown cluster {cluster}")]
    MissingCluster {
        virtual_host: String,
        cluster: String,
    },

    #[error("listener {listener} references unknown route configuration {route_config}")]
    MissingRouteConfig {
        listener: String,
        route_config: String,
    },

    #[error("failed to decode {resource}: {source}")]
    Decode {
        resource: String,
        #[source]
        source: prost::DecodeError,
    },
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CacheError {
    #[error("snapshot version {proposed} for node {node} is not newer than {current}")]
    StaleVersion {
        node: String,
        current: u64,
        proposed: u64,
    },
}

/// Errors that stop the discovery server
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to bind discovery server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connections: {0}")]
    Incoming(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
