//! Topic names.
//!
//! Fully qualified names look like `persistent://tenant/namespace/local-name`.
//! Short forms are expanded: `orders` becomes
//! `persistent://public/default/orders` and `acme/billing/orders` becomes
//! `persistent://acme/billing/orders`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_TENANT: &str = "public";
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name is empty")]
    Empty,

    #[error("unknown topic domain `{0}`")]
    UnknownDomain(String),

    #[error("invalid topic name `{0}`: expected `domain://tenant/namespace/name` or a short form")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl TopicDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicDomain::Persistent => "persistent",
            TopicDomain::NonPersistent => "non-persistent",
        }
    }
}

impl FromStr for TopicDomain {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(TopicDomain::Persistent),
            "non-persistent" => Ok(TopicDomain::NonPersistent),
            other => Err(TopicError::UnknownDomain(other.to_string())),
        }
    }
}

/// A validated, fully qualified topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    full: String,
    domain: TopicDomain,
    tenant: String,
    namespace: String,
    local: String,
}

impl TopicName {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }

        let (domain, path) = match raw.split_once("://") {
            Some((domain, path)) => (domain.parse::<TopicDomain>()?, path),
            None => (TopicDomain::Persistent, raw),
        };

        let invalid = || TopicError::InvalidFormat(raw.to_string());
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty() || s.chars().any(char::is_whitespace)) {
            return Err(invalid());
        }

        let (tenant, namespace, local) = match (raw.contains("://"), segments.as_slice()) {
            (false, [local]) => (DEFAULT_TENANT, DEFAULT_NAMESPACE, *local),
            (_, [tenant, namespace, local]) => (*tenant, *namespace, *local),
            _ => return Err(invalid()),
        };

        Ok(Self {
            full: format!("{}://{}/{}/{}", domain.as_str(), tenant, namespace, local),
            domain,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            local: local.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn domain(&self) -> TopicDomain {
        self.domain
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The last path segment, e.g. `orders` in `persistent://public/default/orders`.
    pub fn local_name(&self) -> &str {
        &self.local
    }
}

impl FromStr for TopicName {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::parse(s)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.full
    }
}
