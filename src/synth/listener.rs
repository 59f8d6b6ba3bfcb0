use std::fs;
use std::path::Path;

use crate::error::SynthesisError;
use crate::pb::envoy::config::core::v3::{
    api_config_source, config_source, data_source, grpc_service, transport_socket,
    ApiConfigSource, ApiVersion, ConfigSource, DataSource, GrpcService, TransportSocket,
};
use crate::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use crate::pb::envoy::extensions::filters::http::cors::v3::Cors;
use crate::pb::envoy::extensions::filters::http::router::v3::Router;
use crate::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use crate::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext, TlsCertificate,
};

use super::cluster::TLS_TRANSPORT_SOCKET;
use super::{
    http1_options, http2_options, socket_address, to_any, ListenerOptions, TlsListenerOptions,
};

pub(super) const HTTP_LISTENER_NAME: &str = "http_listener";
pub(super) const HTTPS_LISTENER_NAME: &str = "https_listener";

const LISTEN_ADDRESS: &str = "0.0.0.0";
const STAT_PREFIX: &str = "http";
const PEM_MARKER: &str = "-----BEGIN ";

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
pub(super) const HTTP_CONNECTION_MANAGER_TYPE: &str = concat!(
    "type.googleapis.com/envoy.extensions.filters.network.",
    "http_connection_manager.v3.HttpConnectionManager"
);
const CORS_FILTER: &str = "envoy.filters.http.cors";
const CORS_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.cors.v3.Cors";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const ROUTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const DOWNSTREAM_TLS_CONTEXT_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

/// Plaintext listener, plus a TLS one with the same routes when configured.
/// Nothing is returned if the TLS material is unusable.
pub(super) fn make_listeners(
    route_config_name: &str,
    options: &ListenerOptions,
) -> Result<Vec<Listener>, SynthesisError> {
    let mut listeners = vec![make_listener(
        HTTP_LISTENER_NAME,
        options.http_port,
        route_config_name,
        &options.xds_cluster,
        None,
    )];

    if let Some(tls) = &options.https {
        let transport_socket = downstream_tls(tls)?;

        listeners.push(make_listener(
            HTTPS_LISTENER_NAME,
            tls.port,
            route_config_name,
            &options.xds_cluster,
            Some(transport_socket),
        ));
    }

    Ok(listeners)
}

fn make_listener(
    name: &str,
    port: u16,
    route_config_name: &str,
    xds_cluster: &str,
    transport_socket: Option<TransportSocket>,
) -> Listener {
    let manager = connection_manager(route_config_name, xds_cluster);

    Listener {
        name: name.to_string(),
        address: Some(socket_address(LISTEN_ADDRESS, port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(to_any(
                    HTTP_CONNECTION_MANAGER_TYPE,
                    &manager,
                ))),
            }],
            transport_socket,
            ..Default::default()
        }],
    }
}

fn connection_manager(route_config_name: &str, xds_cluster: &str) -> HttpConnectionManager {
    HttpConnectionManager {
        codec_type: http_connection_manager::CodecType::Auto.into(),
        stat_prefix: STAT_PREFIX.to_string(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(rds_config_source(xds_cluster)),
            route_config_name: route_config_name.to_string(),
        })),
        // Router has to stay last
        http_filters: vec![
            http_filter(CORS_FILTER, CORS_TYPE, &Cors {}),
            http_filter(ROUTER_FILTER, ROUTER_TYPE, &Router::default()),
        ],
        upgrade_configs: vec![http_connection_manager::UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }],
        http_protocol_options: Some(http1_options()),
        http2_protocol_options: Some(http2_options()),
        ..Default::default()
    }
}

fn http_filter<M: prost::Message>(name: &str, type_url: &str, config: &M) -> HttpFilter {
    HttpFilter {
        name: name.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(to_any(type_url, config))),
        ..Default::default()
    }
}

/// Route configurations come over gRPC from the cluster the proxy knows
/// this control plane by
fn rds_config_source(xds_cluster: &str) -> ConfigSource {
    let grpc_service = GrpcService {
        target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
            grpc_service::EnvoyGrpc {
                cluster_name: xds_cluster.to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    };

    ConfigSource {
        resource_api_version: ApiVersion::V3.into(),
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::ApiConfigSource(
            ApiConfigSource {
                api_type: api_config_source::ApiType::Grpc.into(),
                transport_api_version: ApiVersion::V3.into(),
                set_node_on_first_message_only: true,
                grpc_services: vec![grpc_service],
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn downstream_tls(tls: &TlsListenerOptions) -> Result<TransportSocket, SynthesisError> {
    let certificate = TlsCertificate {
        certificate_chain: Some(pem_file(&tls.cert_file)?),
        private_key: Some(pem_file(&tls.key_file)?),
    };

    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificates: vec![certificate],
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        }),
        ..Default::default()
    };

    Ok(TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(to_any(
            DOWNSTREAM_TLS_CONTEXT_TYPE,
            &context,
        ))),
    })
}

/// The proxy reads the file itself, but a missing or garbled file is caught
/// here instead of in a NACK.
fn pem_file(path: &Path) -> Result<DataSource, SynthesisError> {
    let contents = fs::read_to_string(path).map_err(|source| SynthesisError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })?;

    if !contents.contains(PEM_MARKER) {
        return Err(SynthesisError::NotPem(path.to_path_buf()));
    }

    Ok(DataSource {
        specifier: Some(data_source::Specifier::Filename(
            path.to_string_lossy().into_owned(),
        )),
    })
}
