//! Storage of normalized property rows.

pub mod postgres;
pub mod repository;

pub use postgres::PostgresPropertyRepository;
pub use repository::{InMemoryPropertyRepository, PropertyRepository, RepositoryError};
