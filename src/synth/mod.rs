//! Renders a [`RouteTable`] into the proxy's native resources.
//!
//! Everything here is a pure function of the table and the listener
//! options, apart from reading TLS material to make sure it exists.

mod cluster;
mod listener;
mod route;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use prost::Message;
use prost_types::Any;

use crate::cache::{NamedResource, ResourceKind, Snapshot};
use crate::error::SynthesisError;
use crate::pb::envoy::config::cluster::v3::Cluster;
use crate::pb::envoy::config::core::v3 as envoy_core;
use crate::pb::envoy::config::listener::v3::{filter, Listener};
use crate::pb::envoy::config::route::v3::{route as route_entry, route_action, RouteConfiguration};
use crate::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpConnectionManager,
};
use crate::route::RouteTable;

pub(crate) use cluster::cluster_name;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONCURRENT_STREAMS: u32 = 100;
const INITIAL_STREAM_WINDOW_SIZE: u32 = 65_536;
const INITIAL_CONNECTION_WINDOW_SIZE: u32 = 1_048_576;

/// Where and how the proxy should listen
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub http_port: u16,
    /// `None` leaves the TLS listener out
    pub https: Option<TlsListenerOptions>,
    /// Proxy-side cluster that points back at this control plane
    pub xds_cluster: String,
}

#[derive(Debug, Clone)]
pub struct TlsListenerOptions {
    pub port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Typed resources of one rendering pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    pub clusters: Vec<Cluster>,
    pub route_configs: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
}

impl Resources {
    /// Every route action targets an emitted cluster and every listener
    /// fetches an emitted route configuration.
    pub fn check_consistency(&self) -> Result<(), SynthesisError> {
        let clusters: HashSet<&str> = self.clusters.iter().map(|c| c.name.as_str()).collect();
        let route_configs: HashSet<&str> =
            self.route_configs.iter().map(|r| r.name.as_str()).collect();

        for virtual_host in self.route_configs.iter().flat_map(|r| &r.virtual_hosts) {
            for entry in &virtual_host.routes {
                let Some(route_entry::Action::Route(action)) = &entry.action else {
                    continue;
                };

                if let Some(route_action::ClusterSpecifier::Cluster(cluster)) =
                    &action.cluster_specifier
                {
                    if !clusters.contains(cluster.as_str()) {
                        return Err(SynthesisError::MissingCluster {
                            virtual_host: virtual_host.name.clone(),
                            cluster: cluster.clone(),
                        });
                    }
                }
            }
        }

        for listener in &self.listeners {
            for name in rds_names(listener)? {
                if !route_configs.contains(name.as_str()) {
                    return Err(SynthesisError::MissingRouteConfig {
                        listener: listener.name.clone(),
                        route_config: name,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn into_snapshot(self, version: u64) -> Snapshot {
        let mut snapshot = Snapshot::new(version);

        for kind in ResourceKind::ALL {
            let resources = match kind {
                ResourceKind::Cluster => encode(kind, &self.clusters, |c| &c.name),
                ResourceKind::Route => encode(kind, &self.route_configs, |r| &r.name),
                ResourceKind::Listener => encode(kind, &self.listeners, |l| &l.name),
                ResourceKind::Endpoint | ResourceKind::Secret | ResourceKind::Runtime => vec![],
            };

            snapshot = snapshot.with_resources(kind, resources);
        }

        snapshot
    }
}

fn encode<M: Message>(
    kind: ResourceKind,
    messages: &[M],
    name: impl Fn(&M) -> &String,
) -> Vec<NamedResource> {
    messages
        .iter()
        .map(|message| NamedResource::encode(kind, name(message), message))
        .collect()
}

/// Route configuration names a listener's connection managers fetch over RDS
fn rds_names(listener: &Listener) -> Result<Vec<String>, SynthesisError> {
    let mut names = vec![];

    for filter in listener.filter_chains.iter().flat_map(|chain| &chain.filters) {
        let Some(filter::ConfigType::TypedConfig(config)) = &filter.config_type else {
            continue;
        };

        if config.type_url != listener::HTTP_CONNECTION_MANAGER_TYPE {
            continue;
        }

        let manager = HttpConnectionManager::decode(config.value.as_slice()).map_err(|source| {
            SynthesisError::Decode {
                resource: format!("listener {}", listener.name),
                source,
            }
        })?;

        if let Some(RouteSpecifier::Rds(rds)) = manager.route_specifier {
            names.push(rds.route_config_name);
        }
    }

    Ok(names)
}

/// Turns route tables into resources
#[derive(Debug, Clone)]
pub struct Synthesizer {
    options: ListenerOptions,
}

impl Synthesizer {
    pub fn new(options: ListenerOptions) -> Self {
        Self { options }
    }

    pub fn render(&self, table: &RouteTable) -> Result<Resources, SynthesisError> {
        let clusters = cluster::collect_backends(table)
            .iter()
            .map(cluster::make_cluster)
            .collect();
        let route_config = route::make_route_config(table);
        let listeners = listener::make_listeners(&route_config.name, &self.options)?;

        let resources = Resources {
            clusters,
            route_configs: vec![route_config],
            listeners,
        };

        resources.check_consistency()?;

        Ok(resources)
    }

    pub fn synthesize(
        &self,
        table: &RouteTable,
        version: u64,
    ) -> Result<Snapshot, SynthesisError> {
        Ok(self.render(table)?.into_snapshot(version))
    }
}

pub(crate) fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

fn proto_duration(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

fn socket_address(host: &str, port: u16) -> envoy_core::Address {
    envoy_core::Address {
        address: Some(envoy_core::address::Address::SocketAddress(
            envoy_core::SocketAddress {
                protocol: envoy_core::socket_address::Protocol::Tcp.into(),
                address: host.to_string(),
                port_specifier: Some(envoy_core::socket_address::PortSpecifier::PortValue(
                    port.into(),
                )),
                ..Default::default()
            },
        )),
    }
}

fn common_http_options() -> envoy_core::HttpProtocolOptions {
    envoy_core::HttpProtocolOptions {
        idle_timeout: Some(proto_duration(IDLE_TIMEOUT)),
        ..Default::default()
    }
}

/// HTTP/1.1 with header keys normalised to Proper-Case
fn http1_options() -> envoy_core::Http1ProtocolOptions {
    use envoy_core::http1_protocol_options::{header_key_format, HeaderKeyFormat};

    envoy_core::Http1ProtocolOptions {
        header_key_format: Some(HeaderKeyFormat {
            header_format: Some(header_key_format::HeaderFormat::ProperCaseWords(
                header_key_format::ProperCaseWords {},
            )),
        }),
        ..Default::default()
    }
}

fn http2_options() -> envoy_core::Http2ProtocolOptions {
    envoy_core::Http2ProtocolOptions {
        max_concurrent_streams: Some(MAX_CONCURRENT_STREAMS),
        initial_stream_window_size: Some(INITIAL_STREAM_WINDOW_SIZE),
        initial_connection_window_size: Some(INITIAL_CONNECTION_WINDOW_SIZE),
        ..Default::default()
    }
}
