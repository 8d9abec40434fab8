//! Aggregate types produced by the marketplace services.

pub const USER: &str = "User";
pub const PAYMENT: &str = "Payment";
pub const AUCTION: &str = "Auction";
pub const SETTLEMENT: &str = "Settlement";

/// Topic used when a handler is not given one explicitly.
pub fn default_topic(aggregate_type: &str) -> String {
    format!("{}-events", aggregate_type.to_lowercase())
}
