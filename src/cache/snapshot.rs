use std::collections::BTreeMap;

use prost::Message;
use prost_types::Any;

use super::ResourceKind;

/// One encoded resource together with the name proxies subscribe by
#[derive(Debug, Clone, PartialEq)]
pub struct NamedResource {
    pub name: String,
    pub body: Any,
}

impl NamedResource {
    pub fn encode<M: Message>(kind: ResourceKind, name: impl Into<String>, message: &M) -> Self {
        Self {
            name: name.into(),
            body: Any {
                type_url: kind.type_url().to_string(),
                value: message.encode_to_vec(),
            },
        }
    }
}

/// A consistent, versioned set of resources served to one node.
///
/// Immutable once built, the cache hands out shared references.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: u64,
    resources: BTreeMap<ResourceKind, Vec<NamedResource>>,
}

impl Snapshot {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            resources: ResourceKind::ALL.into_iter().map(|kind| (kind, vec![])).collect(),
        }
    }

    pub fn with_resources(mut self, kind: ResourceKind, resources: Vec<NamedResource>) -> Self {
        self.resources.insert(kind, resources);
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version as it travels in `version_info`
    pub fn version_info(&self) -> String {
        self.version.to_string()
    }

    pub fn resources(&self, kind: ResourceKind) -> &[NamedResource] {
        self.resources.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resources of `kind` a proxy asked for. An empty name list, or any
    /// list for a wildcard kind, selects everything.
    pub fn select(&self, kind: ResourceKind, names: &[String]) -> Vec<Any> {
        self.resources(kind)
            .iter()
            .filter(|resource| {
                kind.is_wildcard() || names.is_empty() || names.contains(&resource.name)
            })
            .map(|resource| resource.body.clone())
            .collect()
    }
}
