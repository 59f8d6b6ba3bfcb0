use std::str::FromStr;
use std::sync::OnceLock;

use derive_more::Display;
use regex::Regex;

/// Anything a header value may carry, control characters excluded
const DOMAIN_PATTERN: &str = r"^[^\x00-\x1f\x7f]+$";

fn domain_regex() -> &'static Regex {
    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    DOMAIN.get_or_init(|| Regex::new(DOMAIN_PATTERN).expect("domain pattern compiles"))
}

/// A domain a virtual host answers for.
///
/// The proxy compares domains case-insensitively, so the parsed form is
/// lower case. IPs and `host:port` pairs are plain domains. A single `*`
/// may replace a whole prefix (`*.example.com`, `*-api.example.com`) or a
/// whole suffix (`example.*`), a lone `*` matches every host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostSpec {
    Any,
    Exact(String),
    EndsWith(String),
    StartsWith(String),
}

#[derive(Debug, PartialEq, Display)]
pub enum HostSpecParseError {
    #[display(fmt = "hostname is empty")]
    EmptyStr,
    #[display(fmt = "hostname contains control characters")]
    InvalidChars,
    #[display(fmt = "wildcard must be the first or the last character")]
    InvalidWildcard,
}

impl FromStr for HostSpec {
    type Err = HostSpecParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(HostSpecParseError::EmptyStr);
        }

        if !domain_regex().is_match(value) {
            return Err(HostSpecParseError::InvalidChars);
        }

        if value == "*" {
            return Ok(Self::Any);
        }

        let domain = value.to_ascii_lowercase();

        let trimmed = domain
            .strip_prefix('*')
            .or_else(|| domain.strip_suffix('*'))
            .unwrap_or(domain.as_str());

        // Only one wildcard, and only at either end
        if trimmed.contains('*') {
            return Err(HostSpecParseError::InvalidWildcard);
        }

        let spec = if let Some(suffix) = domain.strip_prefix('*') {
            Self::EndsWith(suffix.to_string())
        } else if let Some(prefix) = domain.strip_suffix('*') {
            Self::StartsWith(prefix.to_string())
        } else {
            Self::Exact(domain)
        };

        Ok(spec)
    }
}

impl HostSpec {
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Exact(_))
    }
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(domain) => f.write_str(domain),
            Self::EndsWith(suffix) => write!(f, "*{suffix}"),
            Self::StartsWith(prefix) => write!(f, "{prefix}*"),
        }
    }
}
