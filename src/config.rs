use std::path::{Path, PathBuf};
use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Deserializer};

use crate::cli::Args;
use crate::control::ServerOptions;
use crate::error::ConfigError;
use crate::route::ManagerOptions;
use crate::synth::{ListenerOptions, TlsListenerOptions};

fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationString::deserialize(deserializer).map(Duration::from)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub xds: XdsSettings,
    pub http: HttpSettings,
    pub https: HttpsSettings,
    /// Upper bound for a single snapshot install
    #[serde(deserialize_with = "duration")]
    pub snapshot_timeout: Duration,
    /// Cluster name the proxy's bootstrap gives this control plane
    pub xds_cluster: String,
    pub routes_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct XdsSettings {
    pub port: u16,
    pub node_id: String,
    #[serde(deserialize_with = "duration")]
    pub keepalive_interval: Duration,
    #[serde(deserialize_with = "duration")]
    pub keepalive_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub tcp_keepalive: Duration,
    pub max_concurrent_streams: u32,
    #[serde(deserialize_with = "duration")]
    pub shutdown_grace: Duration,
    pub control_plane_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpSettings {
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpsSettings {
    /// Zero disables the TLS listener
    pub port: u16,
    pub tls: TlsSettings,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            xds: XdsSettings::default(),
            http: HttpSettings::default(),
            https: HttpsSettings::default(),
            snapshot_timeout: Duration::from_secs(5),
            xds_cluster: "xds_cluster".to_string(),
            routes_file: None,
        }
    }
}

impl Default for XdsSettings {
    fn default() -> Self {
        Self {
            port: 18000,
            node_id: "envoy-node".to_string(),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(5),
            tcp_keepalive: Duration::from_secs(30),
            max_concurrent_streams: 1_000_000,
            shutdown_grace: Duration::from_secs(10),
            control_plane_id: "routeplane".to_string(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { port: 10080 }
    }
}

impl Default for HttpsSettings {
    fn default() -> Self {
        Self {
            port: 10443,
            tls: TlsSettings::default(),
        }
    }
}

impl Settings {
    /// Reads the settings file if there is one, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        Ok(serde_yaml::from_str::<Option<Self>>(contents)?.unwrap_or_default())
    }

    /// Command line flags win over the file
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(routes) = &args.routes {
            self.routes_file = Some(routes.clone());
        }

        if let Some(port) = args.xds_port {
            self.xds.port = port;
        }

        if let Some(node_id) = &args.node_id {
            self.xds.node_id = node_id.clone();
        }

        self
    }

    /// The TLS listener needs a port and both files
    fn tls_listener(&self) -> Option<TlsListenerOptions> {
        let https = &self.https;

        match (https.port, &https.tls.cert_file, &https.tls.key_file) {
            (0, _, _) => None,
            (port, Some(cert_file), Some(key_file)) => Some(TlsListenerOptions {
                port,
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
            }),
            _ => None,
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            node_id: self.xds.node_id.clone(),
            listeners: ListenerOptions {
                http_port: self.http.port,
                https: self.tls_listener(),
                xds_cluster: self.xds_cluster.clone(),
            },
            snapshot_timeout: self.snapshot_timeout,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            port: self.xds.port,
            keepalive_interval: self.xds.keepalive_interval,
            keepalive_timeout: self.xds.keepalive_timeout,
            tcp_keepalive: self.xds.tcp_keepalive,
            max_concurrent_streams: self.xds.max_concurrent_streams,
            shutdown_grace: self.xds.shutdown_grace,
            control_plane_id: self.xds.control_plane_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::from_yaml("").unwrap();

        assert_eq!(settings.xds.port, 18000);
        assert_eq!(settings.xds.node_id, "envoy-node");
        assert_eq!(settings.xds.keepalive_interval, Duration::from_secs(30));
        assert_eq!(settings.xds.max_concurrent_streams, 1_000_000);
        assert_eq!(settings.http.port, 10080);
        assert_eq!(settings.https.port, 10443);
        assert!(settings.manager_options().listeners.https.is_none());
        assert_eq!(settings.snapshot_timeout, Duration::from_secs(5));
        assert_eq!(settings.xds_cluster, "xds_cluster");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::from_yaml(
            r#"
xds:
  port: 19000
  keepalive-timeout: 250ms
https:
  port: 0
snapshot-timeout: 2s
"#,
        )
        .unwrap();

        assert_eq!(settings.xds.port, 19000);
        assert_eq!(settings.xds.keepalive_timeout, Duration::from_millis(250));
        assert_eq!(settings.xds.node_id, "envoy-node");
        assert_eq!(settings.snapshot_timeout, Duration::from_secs(2));
        assert!(settings.manager_options().listeners.https.is_none());
    }

    #[test]
    fn tls_listener_needs_both_files() {
        let settings =
            Settings::from_yaml("https: {port: 8443, tls: {cert-file: /tls/crt}}").unwrap();

        assert!(settings.manager_options().listeners.https.is_none());

        let settings = Settings::from_yaml(
            "https: {port: 8443, tls: {cert-file: /tls/crt, key-file: /tls/key}}",
        )
        .unwrap();
        let tls = settings.manager_options().listeners.https.unwrap();

        assert_eq!(tls.port, 8443);
        assert_eq!(tls.key_file, PathBuf::from("/tls/key"));
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(Settings::from_yaml("snapshot-timeout: soon").is_err());
    }

    #[test]
    fn flags_override_file() {
        let args = Args::parse_from([
            "routeplane",
            "--xds-port",
            "19001",
            "--node-id",
            "edge",
            "-r",
            "routes.yaml",
        ]);
        let settings = Settings::default().with_args(&args);

        assert_eq!(settings.server_options().port, 19001);
        assert_eq!(settings.manager_options().node_id, "edge");
        assert_eq!(settings.routes_file, Some(PathBuf::from("routes.yaml")));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/settings.yaml"))).unwrap_err();

        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
