//! Do-not-mail (DNM) suppression entries.
//!
//! Entries are created and deactivated only by operators. The ingestion
//! pipeline reads them to report how many fetched properties are suppressed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailhaus_core::{DomainError, UserId};

use crate::property::RadarId;

/// A suppression record. At least one of `radar_id` / `loan_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnmEntry {
    pub id: Uuid,
    pub radar_id: Option<RadarId>,
    pub loan_id: Option<String>,
    pub reason: String,
    pub source: String,
    pub blocked_by: Option<UserId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Operator request to block a property or loan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDnmEntry {
    pub radar_id: Option<RadarId>,
    pub loan_id: Option<String>,
    pub reason: String,
    pub source: String,
    pub blocked_by: Option<UserId>,
}

impl NewDnmEntry {
    pub fn validate(&self) -> Result<(), DomainError> {
        let loan_blank = self
            .loan_id
            .as_deref()
            .map(|l| l.trim().is_empty())
            .unwrap_or(true);
        if self.radar_id.is_none() && loan_blank {
            return Err(DomainError::validation(
                "dnm entry needs a radar_id or a loan_id",
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(DomainError::validation("dnm entry needs a reason"));
        }
        Ok(())
    }

    pub fn into_entry(self, now: DateTime<Utc>) -> Result<DnmEntry, DomainError> {
        self.validate()?;
        Ok(DnmEntry {
            id: Uuid::now_v7(),
            radar_id: self.radar_id,
            loan_id: self.loan_id.map(|l| l.trim().to_string()),
            reason: self.reason.trim().to_string(),
            source: self.source,
            blocked_by: self.blocked_by,
            active: true,
            created_at: now,
        })
    }
}
