//! External lead-data providers.
//!
//! A provider fetches raw property records page by page and knows how to
//! normalize its own record shape into a [`PropertyBundle`](mailhaus_properties::PropertyBundle).
//! The job queue only sees the [`LeadProvider`] trait and the three-way
//! [`ProviderError`] classification.

pub mod error;
pub mod propertyradar;
pub mod provider;
pub mod registry;

pub use error::{ProviderError, ProviderErrorKind, TransformError};
pub use provider::{Criteria, FetchPage, FetchRequest, LeadProvider, ProviderCode, ProviderInfo};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};
