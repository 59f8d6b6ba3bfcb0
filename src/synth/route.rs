use crate::pb::envoy::config::route::v3::{
    header_matcher, route, route_action, route_match, HeaderMatcher, Route as RouteEntry,
    RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
use crate::pb::envoy::r#type::matcher::v3::{string_matcher, StringMatcher};
use crate::route::{Match, PathKind, Route, RouteTable};

use super::cluster_name;

/// The single route configuration every listener fetches
pub(super) const ROUTE_CONFIG_NAME: &str = "httproutes";

const METHOD_HEADER: &str = ":method";

pub(super) fn make_route_config(table: &RouteTable) -> RouteConfiguration {
    RouteConfiguration {
        name: ROUTE_CONFIG_NAME.to_string(),
        virtual_hosts: table.routes.values().map(make_virtual_host).collect(),
    }
}

/// One virtual host per route. Rules without backends are skipped, every
/// other rule sends all of its matches to its first backend.
fn make_virtual_host(route: &Route) -> VirtualHost {
    let host_rewrite = route.hostnames.first();
    let mut routes = vec![];

    for rule in &route.rules {
        let Some(backend) = rule.backend_refs.first() else {
            continue;
        };

        let cluster = cluster_name(&backend.host, backend.port);

        for m in rule.effective_matches() {
            routes.push(RouteEntry {
                r#match: Some(make_route_match(&m)),
                action: Some(route::Action::Route(make_route_action(&cluster, host_rewrite))),
                ..Default::default()
            });
        }
    }

    VirtualHost {
        name: format!("vh_{}", route.name),
        domains: route.domains().map(str::to_string).collect(),
        routes,
    }
}

fn make_route_match(m: &Match) -> RouteMatch {
    let path_specifier = match &m.path {
        Some(path) if path.kind == PathKind::Exact => {
            route_match::PathSpecifier::Path(path.value.clone())
        }
        Some(path) => route_match::PathSpecifier::Prefix(path.value.clone()),
        None => route_match::PathSpecifier::Prefix("/".to_string()),
    };

    let method = m
        .method
        .as_ref()
        .map(|method| exact_header(METHOD_HEADER, method.as_str()));
    let headers = m.headers.iter().map(|(name, value)| exact_header(name, value));

    RouteMatch {
        path_specifier: Some(path_specifier),
        headers: method.into_iter().chain(headers).collect(),
        ..Default::default()
    }
}

fn make_route_action(cluster: &str, host_rewrite: Option<&String>) -> RouteAction {
    RouteAction {
        cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(cluster.to_string())),
        host_rewrite_specifier: host_rewrite
            .map(|host| route_action::HostRewriteSpecifier::HostRewriteLiteral(host.clone())),
        ..Default::default()
    }
}

fn exact_header(name: &str, value: &str) -> HeaderMatcher {
    HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(header_matcher::HeaderMatchSpecifier::StringMatch(
            StringMatcher {
                match_pattern: Some(string_matcher::MatchPattern::Exact(value.to_string())),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}
