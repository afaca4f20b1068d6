//! Postgres-backed property repository (`properties`, `property_owners`, `loans`).

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use mailhaus_properties::{
    Address, Loan, LoanPosition, Property, PropertyBundle, PropertyOwner, RadarId,
};

use super::repository::{PropertyRepository, RepositoryError};

#[derive(Debug, Clone)]
pub struct PostgresPropertyRepository {
    pool: PgPool,
}

impl PostgresPropertyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyRepository for PostgresPropertyRepository {
    #[instrument(skip(self, bundles), fields(count = bundles.len()), err)]
    async fn upsert_batch(&self, bundles: &[PropertyBundle]) -> Result<usize, RepositoryError> {
        Span::current().record("operation", "upsert_batch");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for bundle in bundles {
            upsert_property(&mut tx, &bundle.property).await?;
            replace_owners(&mut tx, bundle.radar_id(), &bundle.owners).await?;
            replace_loans(&mut tx, bundle.radar_id(), &bundle.loans).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(bundles.len())
    }

    #[instrument(skip(self), fields(radar_id = %radar_id), err)]
    async fn get(&self, radar_id: &RadarId) -> Result<Option<PropertyBundle>, RepositoryError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT radar_id, apn, address, city, state, zip, county, latitude, longitude,
                   property_type, square_feet, lot_size, beds, baths, year_built, avm,
                   available_equity, equity_percent, last_transfer_date, last_transfer_value,
                   owner_occupied, listed_for_sale, in_foreclosure, source
            FROM properties WHERE radar_id = $1
            "#,
        )
        .bind(radar_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_property", e))?
        else {
            return Ok(None);
        };

        let property = property_from_row(&row)?;

        let owners = sqlx::query(
            r#"
            SELECT position, full_name, first_name, last_name, mailing_address,
                   mailing_city, mailing_state, mailing_zip, deceased
            FROM property_owners WHERE radar_id = $1 ORDER BY position
            "#,
        )
        .bind(radar_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_owners", e))?
        .iter()
        .map(owner_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let loans = sqlx::query(
            r#"
            SELECT position, amount, rate, rate_type, term_years, loan_type, purpose,
                   recording_date, lender
            FROM loans WHERE radar_id = $1 ORDER BY position
            "#,
        )
        .bind(radar_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_loans", e))?
        .iter()
        .map(loan_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PropertyBundle {
            property,
            owners,
            loans,
        }))
    }

    #[instrument(skip(self), err)]
    async fn count(&self) -> Result<u64, RepositoryError> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM properties")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_properties", e))?
            .try_get("n")
            .map_err(decode_error)?;
        Ok(n.max(0) as u64)
    }
}

async fn upsert_property(
    tx: &mut Transaction<'_, Postgres>,
    p: &Property,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO properties (
            radar_id, apn, address, city, state, zip, county, latitude, longitude,
            property_type, square_feet, lot_size, beds, baths, year_built, avm,
            available_equity, equity_percent, last_transfer_date, last_transfer_value,
            owner_occupied, listed_for_sale, in_foreclosure, source, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, now(), now())
        ON CONFLICT (radar_id) DO UPDATE SET
            apn = EXCLUDED.apn,
            address = EXCLUDED.address,
            city = EXCLUDED.city,
            state = EXCLUDED.state,
            zip = EXCLUDED.zip,
            county = EXCLUDED.county,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            property_type = EXCLUDED.property_type,
            square_feet = EXCLUDED.square_feet,
            lot_size = EXCLUDED.lot_size,
            beds = EXCLUDED.beds,
            baths = EXCLUDED.baths,
            year_built = EXCLUDED.year_built,
            avm = EXCLUDED.avm,
            available_equity = EXCLUDED.available_equity,
            equity_percent = EXCLUDED.equity_percent,
            last_transfer_date = EXCLUDED.last_transfer_date,
            last_transfer_value = EXCLUDED.last_transfer_value,
            owner_occupied = EXCLUDED.owner_occupied,
            listed_for_sale = EXCLUDED.listed_for_sale,
            in_foreclosure = EXCLUDED.in_foreclosure,
            source = EXCLUDED.source,
            updated_at = now()
        "#,
    )
    .bind(p.radar_id.as_str())
    .bind(p.apn.as_deref())
    .bind(p.address.street.as_deref())
    .bind(p.address.city.as_deref())
    .bind(p.address.state.as_deref())
    .bind(p.address.zip.as_deref())
    .bind(p.county.as_deref())
    .bind(p.latitude)
    .bind(p.longitude)
    .bind(p.property_type.as_deref())
    .bind(p.square_feet)
    .bind(p.lot_size)
    .bind(p.beds)
    .bind(p.baths)
    .bind(p.year_built)
    .bind(p.avm)
    .bind(p.available_equity)
    .bind(p.equity_percent)
    .bind(p.last_transfer_date)
    .bind(p.last_transfer_value)
    .bind(p.owner_occupied)
    .bind(p.listed_for_sale)
    .bind(p.in_foreclosure)
    .bind(&p.source)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_property", e))?;
    Ok(())
}

async fn replace_owners(
    tx: &mut Transaction<'_, Postgres>,
    radar_id: &RadarId,
    owners: &[PropertyOwner],
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM property_owners WHERE radar_id = $1")
        .bind(radar_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_owners", e))?;

    for owner in owners {
        sqlx::query(
            r#"
            INSERT INTO property_owners (
                radar_id, position, full_name, first_name, last_name, mailing_address,
                mailing_city, mailing_state, mailing_zip, deceased
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(radar_id.as_str())
        .bind(owner.position as i16)
        .bind(&owner.full_name)
        .bind(owner.first_name.as_deref())
        .bind(owner.last_name.as_deref())
        .bind(owner.mailing_address.street.as_deref())
        .bind(owner.mailing_address.city.as_deref())
        .bind(owner.mailing_address.state.as_deref())
        .bind(owner.mailing_address.zip.as_deref())
        .bind(owner.deceased)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_owner", e))?;
    }
    Ok(())
}

async fn replace_loans(
    tx: &mut Transaction<'_, Postgres>,
    radar_id: &RadarId,
    loans: &[Loan],
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM loans WHERE radar_id = $1")
        .bind(radar_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_loans", e))?;

    for loan in loans {
        sqlx::query(
            r#"
            INSERT INTO loans (
                radar_id, position, amount, rate, rate_type, term_years, loan_type,
                purpose, recording_date, lender
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(radar_id.as_str())
        .bind(loan.position.as_i16())
        .bind(loan.amount)
        .bind(loan.rate)
        .bind(loan.rate_type.as_deref())
        .bind(loan.term_years)
        .bind(loan.loan_type.as_deref())
        .bind(loan.purpose.as_deref())
        .bind(loan.recording_date)
        .bind(loan.lender.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_loan", e))?;
    }
    Ok(())
}

fn property_from_row(row: &PgRow) -> Result<Property, RepositoryError> {
    let radar_id: String = row.try_get("radar_id").map_err(decode_error)?;
    Ok(Property {
        radar_id: RadarId::parse(radar_id)?,
        apn: row.try_get("apn").map_err(decode_error)?,
        address: Address {
            street: row.try_get("address").map_err(decode_error)?,
            city: row.try_get("city").map_err(decode_error)?,
            state: row.try_get("state").map_err(decode_error)?,
            zip: row.try_get("zip").map_err(decode_error)?,
        },
        county: row.try_get("county").map_err(decode_error)?,
        latitude: row.try_get("latitude").map_err(decode_error)?,
        longitude: row.try_get("longitude").map_err(decode_error)?,
        property_type: row.try_get("property_type").map_err(decode_error)?,
        square_feet: row.try_get("square_feet").map_err(decode_error)?,
        lot_size: row.try_get("lot_size").map_err(decode_error)?,
        beds: row.try_get("beds").map_err(decode_error)?,
        baths: row.try_get("baths").map_err(decode_error)?,
        year_built: row.try_get("year_built").map_err(decode_error)?,
        avm: row.try_get("avm").map_err(decode_error)?,
        available_equity: row.try_get("available_equity").map_err(decode_error)?,
        equity_percent: row.try_get("equity_percent").map_err(decode_error)?,
        last_transfer_date: row.try_get("last_transfer_date").map_err(decode_error)?,
        last_transfer_value: row.try_get("last_transfer_value").map_err(decode_error)?,
        owner_occupied: row.try_get("owner_occupied").map_err(decode_error)?,
        listed_for_sale: row.try_get("listed_for_sale").map_err(decode_error)?,
        in_foreclosure: row.try_get("in_foreclosure").map_err(decode_error)?,
        source: row.try_get("source").map_err(decode_error)?,
    })
}

fn owner_from_row(row: &PgRow) -> Result<PropertyOwner, RepositoryError> {
    let position: i16 = row.try_get("position").map_err(decode_error)?;
    Ok(PropertyOwner {
        position: position.clamp(0, u8::MAX as i16) as u8,
        full_name: row.try_get("full_name").map_err(decode_error)?,
        first_name: row.try_get("first_name").map_err(decode_error)?,
        last_name: row.try_get("last_name").map_err(decode_error)?,
        mailing_address: Address {
            street: row.try_get("mailing_address").map_err(decode_error)?,
            city: row.try_get("mailing_city").map_err(decode_error)?,
            state: row.try_get("mailing_state").map_err(decode_error)?,
            zip: row.try_get("mailing_zip").map_err(decode_error)?,
        },
        deceased: row.try_get("deceased").map_err(decode_error)?,
    })
}

fn loan_from_row(row: &PgRow) -> Result<Loan, RepositoryError> {
    let position: i16 = row.try_get("position").map_err(decode_error)?;
    let position = match position {
        1 => LoanPosition::First,
        2 => LoanPosition::Second,
        other => {
            return Err(RepositoryError::Storage(format!(
                "unexpected loan position {other}"
            )));
        }
    };
    Ok(Loan {
        position,
        amount: row.try_get("amount").map_err(decode_error)?,
        rate: row.try_get("rate").map_err(decode_error)?,
        rate_type: row.try_get("rate_type").map_err(decode_error)?,
        term_years: row.try_get("term_years").map_err(decode_error)?,
        loan_type: row.try_get("loan_type").map_err(decode_error)?,
        purpose: row.try_get("purpose").map_err(decode_error)?,
        recording_date: row.try_get("recording_date").map_err(decode_error)?,
        lender: row.try_get("lender").map_err(decode_error)?,
    })
}

pub(crate) fn decode_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(format!("failed to decode row: {err}"))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
