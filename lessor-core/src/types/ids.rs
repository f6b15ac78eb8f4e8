use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// On-chain order identifier (opaque string assigned by the marketplace module).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bid identifier. Derived from the order and the provider address so a
/// second attempt to bid on the same order produces the same id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidId(pub String);

impl BidId {
    pub fn derive(order_id: &OrderId, provider: &ProviderAddress) -> Self {
        Self(format!("{}/{}", order_id.0, provider.0))
    }
}

impl fmt::Display for BidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bech32-ish account address of a marketplace participant.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderAddress(pub String);

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle the provisioning backend hands back for a provisioned resource.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(pub String);

impl ResourceRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for lifecycle commands. UUIDv7, so the numeric order of
/// ids follows creation time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an event-stream consumer; one checkpoint exists per subscriber.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Filesystem-safe rendering used for per-subscriber file names.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_id_is_stable_per_order_and_provider() {
        let order = OrderId::new("ord-7");
        let provider = ProviderAddress("lsr1provider".into());
        assert_eq!(BidId::derive(&order, &provider), BidId::derive(&order, &provider));
        assert_eq!(BidId::derive(&order, &provider).0, "ord-7/lsr1provider");
    }

    #[test]
    fn subscriber_file_stem_strips_separators() {
        let id = SubscriberId::new("provider/main:v1");
        assert_eq!(id.file_stem(), "provider_main_v1");
    }

    #[test]
    fn command_ids_round_trip_through_u128() {
        let id = CommandId::new();
        assert_eq!(CommandId::from_u128(id.as_u128()), id);
    }
}
