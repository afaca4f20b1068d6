//! Infrastructure for the lead ingestion worker: the batch job queue, the
//! file-staged payload pipeline, and their Postgres adapters.

pub mod config;
pub mod db;
pub mod dnm;
pub mod ingest;
pub mod jobs;
pub mod payloads;
pub mod properties;
