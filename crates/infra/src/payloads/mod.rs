//! Durable staging of raw provider pages.
//!
//! A page is first written to disk and registered PENDING, then ingested.
//! The status row is what makes a crash between the two steps recoverable:
//! leftover PENDING files are picked up on the next queue cycle.

pub mod disk;
pub mod postgres;
pub mod store;
pub mod types;

pub use disk::PayloadStore;
pub use postgres::PostgresPayloadFileStore;
pub use store::{InMemoryPayloadFileStore, PayloadError, PayloadFileStore};
pub use types::{CleanupReport, NewPayload, PayloadFile, PayloadStatus};
