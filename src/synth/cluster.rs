use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::pb::envoy::config::cluster::v3::{cluster, Cluster};
use crate::pb::envoy::config::core::v3::{
    transport_socket, TransportSocket, UpstreamHttpProtocolOptions,
};
use crate::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use crate::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, UpstreamTlsContext,
};
use crate::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions,
};
use crate::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use crate::route::{BackendRef, RouteTable};

use super::{
    common_http_options, http1_options, http2_options, proto_duration, socket_address, to_any,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_TYPE: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

pub(crate) fn cluster_name(host: &str, port: u16) -> String {
    format!("cluster_{host}_{port}")
}

/// One upstream cluster worth of backend settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Backend {
    host: String,
    port: u16,
    http2: bool,
    tls: bool,
}

impl From<&BackendRef> for Backend {
    fn from(backend: &BackendRef) -> Self {
        Self {
            host: backend.host.clone(),
            port: backend.port,
            http2: backend.http2,
            tls: backend.tls,
        }
    }
}

/// Unique backends of the whole table, ordered by host and port.
///
/// References to the same host and port collapse into one backend whose
/// flags are the union of every reference.
pub(super) fn collect_backends(table: &RouteTable) -> Vec<Backend> {
    let mut backends: BTreeMap<(&str, u16), Backend> = BTreeMap::new();

    let refs = table
        .routes
        .values()
        .flat_map(|route| &route.rules)
        .flat_map(|rule| &rule.backend_refs);

    for backend_ref in refs {
        backends
            .entry((backend_ref.host.as_str(), backend_ref.port))
            .and_modify(|backend| {
                backend.http2 |= backend_ref.http2;
                backend.tls |= backend_ref.tls;
            })
            .or_insert_with(|| Backend::from(backend_ref));
    }

    backends.into_values().collect()
}

pub(super) fn make_cluster(backend: &Backend) -> Cluster {
    let name = cluster_name(&backend.host, backend.port);

    Cluster {
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::LogicalDns.into(),
        )),
        connect_timeout: Some(proto_duration(CONNECT_TIMEOUT)),
        lb_policy: cluster::LbPolicy::RoundRobin.into(),
        dns_lookup_family: cluster::DnsLookupFamily::V4Only.into(),
        load_assignment: Some(load_assignment(&name, backend)),
        typed_extension_protocol_options: HashMap::from([(
            HTTP_PROTOCOL_OPTIONS.to_string(),
            to_any(HTTP_PROTOCOL_OPTIONS_TYPE, &protocol_options(backend)),
        )]),
        transport_socket: backend.tls.then(|| upstream_tls(&backend.host)),
        name,
        ..Default::default()
    }
}

fn load_assignment(cluster_name: &str, backend: &Backend) -> ClusterLoadAssignment {
    let endpoint = LbEndpoint {
        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(&backend.host, backend.port)),
            ..Default::default()
        })),
        ..Default::default()
    };

    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![endpoint],
            ..Default::default()
        }],
    }
}

/// HTTP/2 towards TLS or HTTP/2 backends, Proper-Case HTTP/1.1 otherwise
fn protocol_options(backend: &Backend) -> HttpProtocolOptions {
    let protocol_config = if backend.tls || backend.http2 {
        let mut http2 = http2_options();
        http2.allow_connect = true;

        ProtocolConfig::Http2ProtocolOptions(http2)
    } else {
        ProtocolConfig::HttpProtocolOptions(http1_options())
    };

    HttpProtocolOptions {
        common_http_protocol_options: Some(common_http_options()),
        upstream_http_protocol_options: backend.tls.then(|| UpstreamHttpProtocolOptions {
            auto_sni: true,
            ..Default::default()
        }),
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(protocol_config),
            },
        )),
    }
}

fn upstream_tls(sni: &str) -> TransportSocket {
    let context = UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: vec!["h2".to_string()],
            ..Default::default()
        }),
        sni: sni.to_string(),
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(to_any(
            UPSTREAM_TLS_CONTEXT_TYPE,
            &context,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::route::{Route, Rule};
    use crate::synth::tests::table;

    fn decode_options(cluster: &Cluster) -> HttpProtocolOptions {
        let any = &cluster.typed_extension_protocol_options[HTTP_PROTOCOL_OPTIONS];

        assert_eq!(any.type_url, HTTP_PROTOCOL_OPTIONS_TYPE);
        HttpProtocolOptions::decode(any.value.as_slice()).unwrap()
    }

    fn protocol(cluster: &Cluster) -> ProtocolConfig {
        match decode_options(cluster).upstream_protocol_options {
            Some(UpstreamProtocolOptions::ExplicitHttpConfig(config)) => {
                config.protocol_config.unwrap()
            }
            other => panic!("unexpected protocol options {other:?}"),
        }
    }

    #[test]
    fn shared_backends_collapse() {
        let table = table(vec![
            (
                "a",
                Route::new(["a.example.com"])
                    .with_rule(Rule::to_backend(BackendRef::new("svc", 80)).path_prefix("/x"))
                    .with_rule(Rule::to_backend(BackendRef::new("svc", 80)).path_prefix("/y")),
            ),
            (
                "b",
                Route::new(["b.example.com"])
                    .with_rule(Rule::to_backend(BackendRef::new("svc", 80).http2())),
            ),
        ]);

        let backends = collect_backends(&table);

        assert_eq!(backends.len(), 1);
        assert!(backends[0].http2);
        assert!(!backends[0].tls);
    }

    #[test]
    fn distinct_ports_are_distinct_backends() {
        let table = table(vec![(
            "a",
            Route::new(["a.example.com"]).with_rule(Rule {
                matches: vec![],
                backend_refs: vec![BackendRef::new("svc", 80), BackendRef::new("svc", 81)],
            }),
        )]);

        let names: Vec<String> = collect_backends(&table)
            .iter()
            .map(|b| make_cluster(b).name)
            .collect();

        assert_eq!(names, vec!["cluster_svc_80", "cluster_svc_81"]);
    }

    #[test]
    fn plain_cluster_defaults() {
        let cluster = make_cluster(&Backend::from(&BackendRef::new("svc1", 8080)));

        assert_eq!(
            cluster.cluster_discovery_type,
            Some(cluster::ClusterDiscoveryType::Type(cluster::DiscoveryType::LogicalDns.into()))
        );
        assert_eq!(cluster.lb_policy, i32::from(cluster::LbPolicy::RoundRobin));
        assert_eq!(cluster.dns_lookup_family, i32::from(cluster::DnsLookupFamily::V4Only));
        assert_eq!(cluster.connect_timeout, Some(prost_types::Duration { seconds: 5, nanos: 0 }));
        assert!(cluster.transport_socket.is_none());

        let assignment = cluster.load_assignment.as_ref().unwrap();
        assert_eq!(assignment.cluster_name, "cluster_svc1_8080");
        assert_eq!(assignment.endpoints[0].lb_endpoints.len(), 1);

        assert!(matches!(protocol(&cluster), ProtocolConfig::HttpProtocolOptions(_)));
        assert!(decode_options(&cluster).upstream_http_protocol_options.is_none());
    }

    #[test]
    fn http2_backend_uses_http2() {
        let cluster = make_cluster(&Backend::from(&BackendRef::new("grpc", 9000).http2()));

        match protocol(&cluster) {
            ProtocolConfig::Http2ProtocolOptions(options) => {
                assert!(options.allow_connect);
                assert_eq!(options.max_concurrent_streams, Some(100));
                assert_eq!(options.initial_stream_window_size, Some(65_536));
                assert_eq!(options.initial_connection_window_size, Some(1_048_576));
            }
            other => panic!("expected HTTP/2, got {other:?}"),
        }
    }

    #[test]
    fn tls_backend_gets_transport_and_sni() {
        let cluster = make_cluster(&Backend::from(&BackendRef::new("secure.internal", 443).tls()));
        let socket = cluster.transport_socket.as_ref().unwrap();

        assert_eq!(socket.name, TLS_TRANSPORT_SOCKET);

        let Some(transport_socket::ConfigType::TypedConfig(any)) = &socket.config_type else {
            panic!("missing TLS context");
        };
        let context = UpstreamTlsContext::decode(any.value.as_slice()).unwrap();

        assert_eq!(context.sni, "secure.internal");
        assert!(matches!(protocol(&cluster), ProtocolConfig::Http2ProtocolOptions(_)));
        assert!(decode_options(&cluster).upstream_http_protocol_options.unwrap().auto_sni);
    }
}
