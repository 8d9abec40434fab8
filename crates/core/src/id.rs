//! Strongly-typed identifiers used by the outbox.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an outbox row.
///
/// Assigned by the store on insert (a sequence in Postgres, a counter in memory),
/// so later rows always carry larger ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(i64);

impl OutboxEventId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxEventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for OutboxEventId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for OutboxEventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("OutboxEventId: {e}")))
    }
}

/// Identifier of the business entity an event belongs to.
///
/// Marketplace aggregates are keyed by numeric ids in some services and UUIDs in
/// others, so the outbox keeps the textual form. It doubles as the partition key
/// on publish.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

/// Identity of a relay instance, used as the lease owner when claiming rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{} must not be empty", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(AggregateId, "AggregateId");
impl_string_newtype!(RelayId, "RelayId");

impl From<i64> for AggregateId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<Uuid> for AggregateId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl RelayId {
    /// Generate a unique instance id (`relay-<uuid v7>`).
    pub fn generate() -> Self {
        Self(format!("relay-{}", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ids_are_rejected() {
        assert!(AggregateId::new("").is_err());
        assert!(AggregateId::new("   ").is_err());
        assert!(RelayId::new("").is_err());
    }

    #[test]
    fn aggregate_id_from_numeric_key() {
        assert_eq!(AggregateId::from(42).as_str(), "42");
    }

    #[test]
    fn generated_relay_ids_differ() {
        assert_ne!(RelayId::generate(), RelayId::generate());
    }

    #[test]
    fn outbox_event_id_parses() {
        let id: OutboxEventId = "17".parse().unwrap();
        assert_eq!(id.get(), 17);
        assert!("x".parse::<OutboxEventId>().is_err());
    }
}
