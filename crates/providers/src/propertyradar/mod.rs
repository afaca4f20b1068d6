//! PropertyRadar lead provider.

mod client;
pub mod fields;
pub mod transform;

pub use client::{DEFAULT_BASE_URL, PropertyRadarConfig, PropertyRadarProvider};
