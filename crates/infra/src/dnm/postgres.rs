use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use mailhaus_core::UserId;
use mailhaus_properties::{DnmEntry, NewDnmEntry, RadarId};

use super::DnmRegistry;
use crate::properties::RepositoryError;
use crate::properties::postgres::{decode_error, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresDnmRegistry {
    pool: PgPool,
}

impl PostgresDnmRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DnmRegistry for PostgresDnmRegistry {
    #[instrument(skip(self, request), err)]
    async fn add(&self, request: NewDnmEntry) -> Result<DnmEntry, RepositoryError> {
        let entry = request.into_entry(Utc::now())?;
        sqlx::query(
            r#"
            INSERT INTO dnm_registry (id, radar_id, loan_id, reason, source, blocked_by, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.radar_id.as_ref().map(RadarId::as_str))
        .bind(entry.loan_id.as_deref())
        .bind(&entry.reason)
        .bind(&entry.source)
        .bind(entry.blocked_by.map(Uuid::from))
        .bind(entry.active)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_dnm_entry", e))?;
        Ok(entry)
    }

    #[instrument(skip(self), err)]
    async fn deactivate(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE dnm_registry SET active = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate_dnm_entry", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("dnm entry {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_active(&self) -> Result<Vec<DnmEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, radar_id, loan_id, reason, source, blocked_by, active, created_at
            FROM dnm_registry WHERE active ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dnm_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self, radar_ids), fields(count = radar_ids.len()), err)]
    async fn blocked_among(&self, radar_ids: &[RadarId]) -> Result<HashSet<RadarId>, RepositoryError> {
        if radar_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<String> = radar_ids.iter().map(|r| r.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT DISTINCT radar_id FROM dnm_registry WHERE active AND radar_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("blocked_among", e))?;

        rows.iter()
            .map(|row| -> Result<RadarId, RepositoryError> {
                let id: String = row.try_get("radar_id").map_err(decode_error)?;
                Ok(RadarId::parse(id)?)
            })
            .collect()
    }
}

fn entry_from_row(row: &PgRow) -> Result<DnmEntry, RepositoryError> {
    let radar_id: Option<String> = row.try_get("radar_id").map_err(decode_error)?;
    let blocked_by: Option<Uuid> = row.try_get("blocked_by").map_err(decode_error)?;
    Ok(DnmEntry {
        id: row.try_get("id").map_err(decode_error)?,
        radar_id: radar_id.map(RadarId::parse).transpose()?,
        loan_id: row.try_get("loan_id").map_err(decode_error)?,
        reason: row.try_get("reason").map_err(decode_error)?,
        source: row.try_get("source").map_err(decode_error)?,
        blocked_by: blocked_by.map(UserId::from_uuid),
        active: row.try_get("active").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}
