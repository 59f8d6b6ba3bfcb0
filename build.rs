const PROTOS: &[&str] = &[
    "proto/envoy/config/cluster/v3/cluster.proto",
    "proto/envoy/config/listener/v3/listener.proto",
    "proto/envoy/config/route/v3/route.proto",
    "proto/envoy/extensions/filters/http/cors/v3/cors.proto",
    "proto/envoy/extensions/filters/http/router/v3/router.proto",
    concat!(
        "proto/envoy/extensions/filters/network/",
        "http_connection_manager/v3/http_connection_manager.proto"
    ),
    "proto/envoy/extensions/transport_sockets/tls/v3/tls.proto",
    "proto/envoy/extensions/upstreams/http/v3/http_protocol_options.proto",
    "proto/envoy/service/discovery/v3/ads.proto",
    "proto/envoy/service/cluster/v3/cds.proto",
    "proto/envoy/service/endpoint/v3/eds.proto",
    "proto/envoy/service/listener/v3/lds.proto",
    "proto/envoy/service/route/v3/rds.proto",
    "proto/envoy/service/runtime/v3/rtds.proto",
    "proto/envoy/service/secret/v3/sds.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .include_file("mod.rs")
        .compile(PROTOS, &["proto"])?;

    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
