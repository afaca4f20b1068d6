use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use mailhaus_core::DomainError;

/// Provider-assigned property identifier (PropertyRadar "RadarID").
///
/// This is the upsert key for every normalized row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RadarId(String);

impl RadarId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("RadarId: empty"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(DomainError::invalid_id(format!(
                "RadarId: contains whitespace: {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RadarId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RadarId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RadarId> for String {
    fn from(value: RadarId) -> Self {
        value.0
    }
}

/// A postal address. Every part is optional because provider coverage varies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.street.is_none() && self.city.is_none() && self.state.is_none() && self.zip.is_none()
    }
}

/// Normalized property row.
///
/// Numeric attributes are `None` when the provider sent nothing or a
/// non-numeric sentinel; they are never defaulted to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub radar_id: RadarId,
    pub apn: Option<String>,
    pub address: Address,
    pub county: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub property_type: Option<String>,
    pub square_feet: Option<i64>,
    pub lot_size: Option<f64>,
    pub beds: Option<i64>,
    pub baths: Option<f64>,
    pub year_built: Option<i64>,
    pub avm: Option<f64>,
    pub available_equity: Option<f64>,
    pub equity_percent: Option<f64>,
    pub last_transfer_date: Option<NaiveDate>,
    pub last_transfer_value: Option<f64>,
    pub owner_occupied: Option<bool>,
    pub listed_for_sale: Option<bool>,
    pub in_foreclosure: Option<bool>,
    /// The provider record this row was built from.
    pub source: serde_json::Value,
}

impl Property {
    /// Empty property carrying only its key (useful for builders and tests).
    pub fn new(radar_id: RadarId) -> Self {
        Self {
            radar_id,
            apn: None,
            address: Address::default(),
            county: None,
            latitude: None,
            longitude: None,
            property_type: None,
            square_feet: None,
            lot_size: None,
            beds: None,
            baths: None,
            year_built: None,
            avm: None,
            available_equity: None,
            equity_percent: None,
            last_transfer_date: None,
            last_transfer_value: None,
            owner_occupied: None,
            listed_for_sale: None,
            in_foreclosure: None,
            source: serde_json::Value::Null,
        }
    }
}

/// An owner of record. `position` is 1-based in provider order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyOwner {
    pub position: u8,
    pub full_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub mailing_address: Address,
    pub deceased: Option<bool>,
}

/// Lien position of a loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanPosition {
    First,
    Second,
}

impl LoanPosition {
    pub fn as_i16(self) -> i16 {
        match self {
            LoanPosition::First => 1,
            LoanPosition::Second => 2,
        }
    }
}

/// An open loan recorded against the property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub position: LoanPosition,
    pub amount: Option<f64>,
    pub rate: Option<f64>,
    pub rate_type: Option<String>,
    pub term_years: Option<i64>,
    pub loan_type: Option<String>,
    pub purpose: Option<String>,
    pub recording_date: Option<NaiveDate>,
    pub lender: Option<String>,
}

/// Everything one provider record normalizes into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBundle {
    pub property: Property,
    pub owners: Vec<PropertyOwner>,
    pub loans: Vec<Loan>,
}

impl PropertyBundle {
    pub fn radar_id(&self) -> &RadarId {
        &self.property.radar_id
    }
}
