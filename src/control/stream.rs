use std::collections::BTreeMap;

use tonic::Status;
use tracing::{debug, info, warn};

use crate::cache::{ResourceKind, Snapshot};
use crate::pb::envoy::config::core::v3::ControlPlane;
use crate::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};

/// Lifecycle of one discovery stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    /// No request with a node identity seen yet
    Unregistered,
    /// Node known, nothing sent yet
    Subscribed,
    /// At least one response sent
    Streaming,
    Closed,
}

/// What a proxy asked for on one resource kind, and what it was last sent
#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    sent_version: Option<u64>,
    nonce: Option<String>,
}

/// Protocol state of a single state-of-the-world stream.
///
/// Pure bookkeeping, the owning task feeds it requests and snapshots and
/// forwards whatever responses come back.
#[derive(Debug)]
pub(crate) struct StreamState {
    phase: StreamPhase,
    node: Option<String>,
    /// Kind assumed for requests without a type URL on single-kind services
    default_kind: Option<ResourceKind>,
    subscriptions: BTreeMap<ResourceKind, Subscription>,
    nonce: u64,
    control_plane: String,
}

impl StreamState {
    pub(crate) fn new(
        default_kind: Option<ResourceKind>,
        control_plane: impl Into<String>,
    ) -> Self {
        Self {
            phase: StreamPhase::Unregistered,
            node: None,
            default_kind,
            subscriptions: BTreeMap::new(),
            nonce: 0,
            control_plane: control_plane.into(),
        }
    }

    pub(crate) fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub(crate) fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Picks up the node identity. Returns it when this request registered
    /// the stream, later requests may omit the node.
    pub(crate) fn register(
        &mut self,
        request: &DiscoveryRequest,
    ) -> Result<Option<String>, Status> {
        if self.node.is_some() {
            return Ok(None);
        }

        let node = node_id(request).ok_or_else(|| {
            Status::invalid_argument("first discovery request must identify its node")
        })?;

        info!(node, "proxy registered");

        self.node = Some(node.to_string());
        self.phase = StreamPhase::Subscribed;

        Ok(Some(node.to_string()))
    }

    /// Handles a request and returns the response it calls for, if any.
    ///
    /// Requests echoing an outdated nonce are ignored, NACKs are logged and
    /// not answered, ACKs of the current version are not answered.
    pub(crate) fn on_request(
        &mut self,
        request: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Result<Option<DiscoveryResponse>, Status> {
        let Some(kind) = self.resolve_kind(&request.type_url)? else {
            warn!(type_url = %request.type_url, "unknown resource type requested");
            return Ok(None);
        };

        let subscription = self.subscriptions.entry(kind).or_default();

        if !request.response_nonce.is_empty() {
            if subscription.nonce.as_deref() != Some(request.response_nonce.as_str()) {
                debug!(%kind, nonce = %request.response_nonce, "ignoring stale nonce");
                return Ok(None);
            }

            if let Some(error) = &request.error_detail {
                warn!(
                    node = self.node.as_deref().unwrap_or_default(),
                    %kind,
                    version = %request.version_info,
                    error = %error.message,
                    "proxy rejected resources"
                );
                subscription.names = request.resource_names;
                return Ok(None);
            }
        }

        let names_changed = subscription.names != request.resource_names;
        subscription.names = request.resource_names;

        let Some(snapshot) = snapshot else {
            debug!(%kind, "no snapshot yet, holding request");
            return Ok(None);
        };

        if subscription.sent_version == Some(snapshot.version()) && !names_changed {
            debug!(%kind, version = snapshot.version(), "proxy is up to date");
            return Ok(None);
        }

        Ok(Some(self.respond(kind, snapshot)))
    }

    /// Responses for every subscribed kind that has not seen `snapshot` yet
    pub(crate) fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let stale: Vec<ResourceKind> = self
            .subscriptions
            .iter()
            .filter(|(_, subscription)| subscription.sent_version != Some(snapshot.version()))
            .map(|(kind, _)| *kind)
            .collect();

        stale
            .into_iter()
            .map(|kind| self.respond(kind, snapshot))
            .collect()
    }

    pub(crate) fn close(&mut self) {
        self.phase = StreamPhase::Closed;
    }

    fn resolve_kind(&self, type_url: &str) -> Result<Option<ResourceKind>, Status> {
        if type_url.is_empty() {
            return self
                .default_kind
                .map(Some)
                .ok_or_else(|| Status::invalid_argument("discovery request is missing type_url"));
        }

        let kind = ResourceKind::from_type_url(type_url);

        match (self.default_kind, kind) {
            (Some(expected), Some(kind)) if expected != kind => Err(Status::invalid_argument(
                format!("{type_url} cannot be requested on the {expected} discovery service"),
            )),
            _ => Ok(kind),
        }
    }

    fn respond(&mut self, kind: ResourceKind, snapshot: &Snapshot) -> DiscoveryResponse {
        self.nonce += 1;
        let nonce = self.nonce.to_string();

        let subscription = self.subscriptions.entry(kind).or_default();
        let response = build_response(
            kind,
            snapshot,
            &subscription.names,
            &nonce,
            &self.control_plane,
        );

        subscription.sent_version = Some(snapshot.version());
        subscription.nonce = Some(nonce);
        self.phase = StreamPhase::Streaming;

        debug!(
            %kind,
            version = snapshot.version(),
            nonce = %response.nonce,
            resources = response.resources.len(),
            "sending resources"
        );

        response
    }
}

pub(crate) fn node_id(request: &DiscoveryRequest) -> Option<&str> {
    request
        .node
        .as_ref()
        .map(|node| node.id.as_str())
        .filter(|id| !id.is_empty())
}

pub(crate) fn build_response(
    kind: ResourceKind,
    snapshot: &Snapshot,
    names: &[String],
    nonce: &str,
    control_plane: &str,
) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: snapshot.version_info(),
        resources: snapshot.select(kind, names),
        type_url: kind.type_url().to_string(),
        nonce: nonce.to_string(),
        control_plane: Some(ControlPlane {
            identifier: control_plane.to_string(),
        }),
        ..Default::default()
    }
}
