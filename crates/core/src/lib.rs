//! `mailhaus-core`: shared identifiers, domain errors and value coercion.
//!
//! This crate contains no IO.

pub mod error;
pub mod id;
pub mod number;

pub use error::{DomainError, DomainResult};
pub use id::{BatchJobId, CampaignId, PayloadFileId, UserId};
pub use number::{safe_flag, safe_integer, safe_number, safe_text};
