use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use mailhaus_core::DomainError;
use mailhaus_properties::{PropertyBundle, RadarId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Normalized property storage keyed by `radar_id`.
#[async_trait]
pub trait PropertyRepository: Send + Sync {
    /// Upsert every bundle in one unit of work: either all rows land or none.
    ///
    /// A property is upserted on `radar_id`; its owners and loans are
    /// replaced as a set. Re-running the same batch never duplicates rows.
    async fn upsert_batch(&self, bundles: &[PropertyBundle]) -> Result<usize, RepositoryError>;

    async fn get(&self, radar_id: &RadarId) -> Result<Option<PropertyBundle>, RepositoryError>;

    async fn count(&self) -> Result<u64, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPropertyRepository {
    rows: RwLock<HashMap<RadarId, PropertyBundle>>,
}

impl InMemoryPropertyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<RadarId, PropertyBundle>>, RepositoryError> {
        self.rows
            .read()
            .map_err(|_| RepositoryError::Storage("property store lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<RadarId, PropertyBundle>>, RepositoryError> {
        self.rows
            .write()
            .map_err(|_| RepositoryError::Storage("property store lock poisoned".to_string()))
    }
}

#[async_trait]
impl PropertyRepository for InMemoryPropertyRepository {
    async fn upsert_batch(&self, bundles: &[PropertyBundle]) -> Result<usize, RepositoryError> {
        let mut rows = self.write()?;
        for bundle in bundles {
            rows.insert(bundle.radar_id().clone(), bundle.clone());
        }
        Ok(bundles.len())
    }

    async fn get(&self, radar_id: &RadarId) -> Result<Option<PropertyBundle>, RepositoryError> {
        Ok(self.read()?.get(radar_id).cloned())
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        Ok(self.read()?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhaus_properties::{Address, Loan, LoanPosition, Property, PropertyOwner};

    fn bundle(id: &str, owners: usize) -> PropertyBundle {
        let owners = (0..owners)
            .map(|i| PropertyOwner {
                position: i as u8 + 1,
                full_name: format!("Owner {i}"),
                first_name: None,
                last_name: None,
                mailing_address: Address::default(),
                deceased: None,
            })
            .collect();
        PropertyBundle {
            property: Property::new(RadarId::parse(id).unwrap()),
            owners,
            loans: vec![Loan {
                position: LoanPosition::First,
                amount: Some(100_000.0),
                rate: None,
                rate_type: None,
                term_years: None,
                loan_type: None,
                purpose: None,
                recording_date: None,
                lender: None,
            }],
        }
    }

    #[tokio::test]
    async fn reprocessing_replaces_instead_of_duplicating() {
        let repo = InMemoryPropertyRepository::new();
        repo.upsert_batch(&[bundle("P1", 2), bundle("P2", 1)]).await.unwrap();
        repo.upsert_batch(&[bundle("P1", 1)]).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        let p1 = repo.get(&RadarId::parse("P1").unwrap()).await.unwrap().unwrap();
        assert_eq!(p1.owners.len(), 1);
        assert_eq!(p1.loans.len(), 1);
    }
}
