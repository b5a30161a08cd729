//! Per-call token and cost metering.

pub mod client;
pub mod pricing;
pub mod store;
pub mod tokens;

pub use client::{MeteredClient, MeteredStream};
pub use pricing::{ModelPrice, PricingError, PricingTable, UsageKind};
pub use store::UsageStore;
