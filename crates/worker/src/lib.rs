//! Worker process wiring: stores, providers, the job queue and housekeeping.

pub mod app;
pub mod housekeeping;
