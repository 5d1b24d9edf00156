use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// How a subscription spreads messages across its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Exactly one consumer may be attached.
    #[default]
    Exclusive,
    /// Consumers compete; each message goes to one of them.
    Shared,
    /// Only the first attached consumer receives; the next one takes over when it leaves.
    Failover,
    /// Messages with the same key always reach the same consumer.
    KeyShared,
}

impl SubscriptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionType::Exclusive => "exclusive",
            SubscriptionType::Shared => "shared",
            SubscriptionType::Failover => "failover",
            SubscriptionType::KeyShared => "key_shared",
        }
    }
}

impl From<SubscriptionType> for u8 {
    fn from(t: SubscriptionType) -> Self {
        match t {
            SubscriptionType::Exclusive => 0,
            SubscriptionType::Shared => 1,
            SubscriptionType::Failover => 2,
            SubscriptionType::KeyShared => 3,
        }
    }
}

impl TryFrom<u8> for SubscriptionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SubscriptionType::Exclusive),
            1 => Ok(SubscriptionType::Shared),
            2 => Ok(SubscriptionType::Failover),
            3 => Ok(SubscriptionType::KeyShared),
            other => Err(other),
        }
    }
}

impl FromStr for SubscriptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "exclusive" => Ok(SubscriptionType::Exclusive),
            "shared" => Ok(SubscriptionType::Shared),
            "failover" => Ok(SubscriptionType::Failover),
            "key_shared" | "keyshared" => Ok(SubscriptionType::KeyShared),
            _ => Err(format!(
                "unknown subscription type `{s}` (expected exclusive, shared, failover or key_shared)"
            )),
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
