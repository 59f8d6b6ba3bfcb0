use std::str::FromStr;

use http::{HeaderName, Method};
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};

/// How a path predicate compares against the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathKind {
    Exact,
    #[default]
    Prefix,
}

const PATH_KINDS: &[&str] = &["Exact", "Prefix"];

impl PathKind {
    /// Case-insensitive, any other kind of path matching is unsupported
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("exact") {
            Some(Self::Exact)
        } else if value.eq_ignore_ascii_case("prefix") {
            Some(Self::Prefix)
        } else {
            None
        }
    }

    fn stringify(&self) -> &'static str {
        match self {
            Self::Exact => "Exact",
            Self::Prefix => "Prefix",
        }
    }
}

struct PathKindVisitor;

impl<'de> Visitor<'de> for PathKindVisitor {
    type Value = PathKind;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a path match type")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        PathKind::parse(value).ok_or_else(|| E::unknown_variant(value, PATH_KINDS))
    }
}

impl<'de> Deserialize<'de> for PathKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(PathKindVisitor)
    }
}

impl Serialize for PathKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.stringify())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    #[serde(rename = "type", default)]
    pub kind: PathKind,
    pub value: String,
}

impl PathMatch {
    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            kind: PathKind::Prefix,
            value: value.into(),
        }
    }

    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            kind: PathKind::Exact,
            value: value.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.value.starts_with('/') {
            return Err(format!("path {:?} must start with '/'", self.value));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMatch(Method);

impl MethodMatch {
    /// Methods are case-sensitive on the wire and the proxy compares them
    /// verbatim, so `get` is read as `GET`
    pub fn parse(s: &str) -> Result<Self, http::method::InvalidMethod> {
        Ok(Self(Method::from_str(&s.to_ascii_uppercase())?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Method> for MethodMatch {
    fn from(method: Method) -> Self {
        Self(method)
    }
}

struct MethodMatchVisitor;

impl<'de> Visitor<'de> for MethodMatchVisitor {
    type Value = MethodMatch;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a valid HTTP method")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        MethodMatch::parse(value).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for MethodMatch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(MethodMatchVisitor)
    }
}

impl Serialize for MethodMatch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Header names are matched case-insensitively by the proxy, so only
/// syntactically valid names are accepted.
pub fn validate_header_name(name: &str) -> Result<(), String> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| format!("invalid header name {name:?}"))
}
