pub mod host;
pub mod manager;
pub mod matchers;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManagerError;

pub use manager::{ManagerOptions, RouteManager};
pub use matchers::{MethodMatch, PathKind, PathMatch};

use host::HostSpec;

/// Domain used by virtual hosts of routes without hostnames
pub const ANY_DOMAIN: &str = "*";

/// The desired routing state, keyed by route name.
///
/// This is also the on-disk format: a top-level `routes` mapping whose keys
/// are route names.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    #[serde(default)]
    pub routes: BTreeMap<String, Route>,
}

impl RouteTable {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        // A file that is empty or only holds comments parses as null
        let mut table = serde_yaml::from_str::<Option<Self>>(contents)?.unwrap_or_default();

        for (name, route) in table.routes.iter_mut() {
            route.name = name.clone();
        }

        Ok(table)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Checks every route, plus the one thing that is only visible across
    /// routes: two virtual hosts may not claim the same domain, compared
    /// case-insensitively.
    pub fn validate(&self) -> Result<(), ManagerError> {
        let mut owners: HashMap<HostSpec, &str> = HashMap::new();

        for (name, route) in &self.routes {
            let invalid =
                |reason: String| ManagerError::InvalidArgument(format!("route {name}: {reason}"));

            route.validate().map_err(invalid)?;

            for domain in route.domains() {
                let spec = HostSpec::from_str(domain)
                    .map_err(|err| invalid(format!("hostname {domain:?}: {err}")))?;

                if let Some(owner) = owners.insert(spec, name) {
                    return Err(ManagerError::InvalidArgument(format!(
                        "domain {domain} is claimed by both {owner} and {name}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Route {
    /// Mirrors the table key, never read from or written to the file
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Route {
    pub fn new<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: String::new(),
            hostnames: hostnames.into_iter().map(Into::into).collect(),
            rules: vec![],
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Domains of the virtual host this route becomes
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        let any = self.hostnames.is_empty().then_some(ANY_DOMAIN);

        self.hostnames.iter().map(String::as_str).chain(any)
    }

    /// Hostnames are checked by the table, together with the other routes
    fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            rule.validate()?;
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    // NOTE: matches are OR-ed, the predicates inside one match are AND-ed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

impl Rule {
    pub fn to_backend(backend: BackendRef) -> Self {
        Self {
            matches: vec![],
            backend_refs: vec![backend],
        }
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.matches.push(Match::path(PathMatch::prefix(prefix)));
        self
    }

    pub fn path_exact(mut self, path: impl Into<String>) -> Self {
        self.matches.push(Match::path(PathMatch::exact(path)));
        self
    }

    /// Matches to emit for this rule, a rule without any matches catches all
    /// traffic of its virtual host
    pub fn effective_matches(&self) -> Vec<Match> {
        if self.matches.is_empty() {
            vec![Match::catch_all()]
        } else {
            self.matches.clone()
        }
    }

    fn validate(&self) -> Result<(), String> {
        for m in &self.matches {
            m.validate()?;
        }

        for backend in &self.backend_refs {
            backend.validate()?;
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Match {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<MethodMatch>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Match {
    pub fn path(path: PathMatch) -> Self {
        Self {
            path: Some(path),
            ..Default::default()
        }
    }

    pub fn catch_all() -> Self {
        Self::path(PathMatch::prefix("/"))
    }

    pub fn with_method(mut self, method: http::Method) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.path {
            path.validate()?;
        }

        for name in self.headers.keys() {
            matchers::validate_header_name(name)?;
        }

        Ok(())
    }
}

/// An upstream destination. Backends with the same host and port share one
/// cluster.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackendRef {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub http2: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tls: bool,
}

impl BackendRef {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            http2: false,
            tls: false,
        }
    }

    pub fn http2(mut self) -> Self {
        self.http2 = true;
        self
    }

    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("backend host cannot be empty".to_string());
        }

        if self.port == 0 {
            return Err(format!("backend {} needs a non-zero port", self.host));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
routes:
  api:
    hostnames: [api.example.com]
    rules:
      - matches:
          - path: {type: Exact, value: /health}
            method: GET
          - path: {type: Prefix, value: /v1}
            headers:
              x-tenant: acme
        backendRefs:
          - host: api.internal
            port: 8080
            http2: true
  web:
    rules:
      - backendRefs:
          - host: web.internal
            port: 80
"#;

    #[test]
    fn names_come_from_keys() {
        let table = RouteTable::from_yaml(TABLE).unwrap();

        assert_eq!(table.routes["api"].name, "api");
        assert_eq!(table.routes["web"].name, "web");
    }

    #[test]
    fn parses_full_route() {
        let table = RouteTable::from_yaml(TABLE).unwrap();
        let api = &table.routes["api"];
        let rule = &api.rules[0];

        assert_eq!(api.hostnames, vec!["api.example.com"]);
        assert_eq!(rule.matches.len(), 2);
        assert_eq!(rule.matches[0].path, Some(PathMatch::exact("/health")));
        assert_eq!(rule.matches[0].method.as_ref().map(MethodMatch::as_str), Some("GET"));
        assert_eq!(rule.matches[1].headers["x-tenant"], "acme");
        assert_eq!(rule.backend_refs, vec![BackendRef::new("api.internal", 8080).http2()]);
    }

    #[test]
    fn yaml_round_trip_keeps_table() {
        let table = RouteTable::from_yaml(TABLE).unwrap();
        let written = table.to_yaml().unwrap();

        assert!(!written.contains("name:"));
        assert!(!written.contains("tls:"));
        assert_eq!(RouteTable::from_yaml(&written).unwrap(), table);
    }

    #[test]
    fn demo_table_is_valid() {
        let table = RouteTable::from_yaml(include_str!("../../demos/routes.yaml")).unwrap();

        assert_eq!(table.routes.len(), 2);
        assert!(table.routes["web"].rules[0].backend_refs[0].tls);
        table.validate().unwrap();
    }

    #[test]
    fn empty_document_is_empty_table() {
        assert!(RouteTable::from_yaml("routes: {}").unwrap().routes.is_empty());
        assert!(RouteTable::from_yaml("# nothing yet\n").unwrap().routes.is_empty());
    }

    #[test]
    fn out_of_range_port_is_a_parse_error() {
        let yaml = "routes: {a: {rules: [{backendRefs: [{host: h, port: 70000}]}]}}";

        assert!(RouteTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn unsupported_path_kind_fails_to_load() {
        let yaml = r#"
routes:
  a:
    rules:
      - matches: [{path: {type: Regex, value: /a.*}}]
        backendRefs: [{host: h, port: 80}]
"#;

        assert!(RouteTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn builders_produce_catch_all() {
        let route =
            Route::new(["a.example.com"]).with_rule(Rule::to_backend(BackendRef::new("a", 80)));

        assert_eq!(route.rules[0].effective_matches(), vec![Match::catch_all()]);
        assert_eq!(route.domains().collect::<Vec<_>>(), vec!["a.example.com"]);
        assert_eq!(Route::default().domains().collect::<Vec<_>>(), vec![ANY_DOMAIN]);
    }

    #[test]
    fn rejects_bad_routes() {
        let bad_host = Route::new(["api.*.example.com"]);
        let bad_path = Route::new(["a.com"])
            .with_rule(Rule::to_backend(BackendRef::new("a", 80)).path_prefix("v1"));
        let bad_backend =
            Route::new(["a.com"]).with_rule(Rule::to_backend(BackendRef::new("", 80)));
        let zero_port = Route::new(["a.com"]).with_rule(Rule::to_backend(BackendRef::new("a", 0)));

        for route in [bad_host, bad_path, bad_backend, zero_port] {
            let table = RouteTable {
                routes: BTreeMap::from([("r".to_string(), route)]),
            };

            assert!(matches!(table.validate(), Err(ManagerError::InvalidArgument(_))));
        }
    }

    #[test]
    fn rejects_shared_domain() {
        let table = RouteTable {
            routes: BTreeMap::from([
                ("a".to_string(), Route::new(["x.example.com"])),
                ("b".to_string(), Route::new(["y.example.com", "x.example.com"])),
            ]),
        };

        let err = table.validate().unwrap_err();

        assert!(err.to_string().contains("x.example.com"));
    }

    #[test]
    fn accepts_ip_port_and_mixed_case_hosts() {
        let table = RouteTable {
            routes: BTreeMap::from([
                ("api".to_string(), Route::new(["API.example.com"])),
                ("edge".to_string(), Route::new(["192.168.1.10", "localhost:8080"])),
                ("any".to_string(), Route::new(["*"])),
            ]),
        };

        table.validate().unwrap();
    }

    #[test]
    fn shared_domain_ignores_case() {
        let table = RouteTable {
            routes: BTreeMap::from([
                ("a".to_string(), Route::new(["api.example.com"])),
                ("b".to_string(), Route::new(["API.Example.com"])),
            ]),
        };

        assert!(matches!(table.validate(), Err(ManagerError::InvalidArgument(_))));
    }

    #[test]
    fn hostless_route_claims_any_domain() {
        let table = RouteTable {
            routes: BTreeMap::from([
                ("a".to_string(), Route::default()),
                ("b".to_string(), Route::new(["*"])),
            ]),
        };

        assert!(matches!(table.validate(), Err(ManagerError::InvalidArgument(_))));
    }
}
