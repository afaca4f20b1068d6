//! PropertyRadar field names requested by default and read by the transform.

pub const RADAR_ID: &str = "RadarID";
pub const APN: &str = "APN";
pub const ADDRESS: &str = "Address";
pub const CITY: &str = "City";
pub const STATE: &str = "State";
pub const ZIP: &str = "ZipFive";
pub const COUNTY: &str = "County";
pub const LATITUDE: &str = "Latitude";
pub const LONGITUDE: &str = "Longitude";
pub const PROPERTY_TYPE: &str = "PType";
pub const SQUARE_FEET: &str = "SqFt";
pub const LOT_SIZE: &str = "LotSize";
pub const BEDS: &str = "Beds";
pub const BATHS: &str = "Baths";
pub const YEAR_BUILT: &str = "YearBuilt";
pub const AVM: &str = "AVM";
pub const AVAILABLE_EQUITY: &str = "AvailableEquity";
pub const EQUITY_PERCENT: &str = "EquityPercent";
pub const LAST_TRANSFER_DATE: &str = "LastTransferRecDate";
pub const LAST_TRANSFER_VALUE: &str = "LastTransferValue";
pub const OWNER_OCCUPIED: &str = "isSameMailingOrExempt";
pub const LISTED_FOR_SALE: &str = "isListedForSale";
pub const IN_FORECLOSURE: &str = "inForeclosure";

pub const OWNER: &str = "Owner";
pub const OWNER_FIRST_NAME: &str = "OwnerFirstName";
pub const OWNER_LAST_NAME: &str = "OwnerLastName";
pub const OWNER2_FIRST_NAME: &str = "Owner2FirstName";
pub const OWNER2_LAST_NAME: &str = "Owner2LastName";
pub const OWNER_ADDRESS: &str = "OwnerAddress";
pub const OWNER_CITY: &str = "OwnerCity";
pub const OWNER_STATE: &str = "OwnerState";
pub const OWNER_ZIP: &str = "OwnerZipFive";
pub const OWNER_DECEASED: &str = "isDeceasedProperty";

/// Loan attributes are requested per lien position with a `First` or
/// `Second` prefix, e.g. `FirstAmount`, `SecondRate`.
pub const LOAN_PREFIXES: [&str; 2] = ["First", "Second"];
pub const LOAN_SUFFIXES: [&str; 8] = [
    "Amount",
    "Rate",
    "RateType",
    "TermInYears",
    "LoanType",
    "Purpose",
    "Date",
    "Lender",
];

/// Every field the transform understands.
pub fn default_fields() -> Vec<String> {
    let mut fields: Vec<String> = [
        RADAR_ID,
        APN,
        ADDRESS,
        CITY,
        STATE,
        ZIP,
        COUNTY,
        LATITUDE,
        LONGITUDE,
        PROPERTY_TYPE,
        SQUARE_FEET,
        LOT_SIZE,
        BEDS,
        BATHS,
        YEAR_BUILT,
        AVM,
        AVAILABLE_EQUITY,
        EQUITY_PERCENT,
        LAST_TRANSFER_DATE,
        LAST_TRANSFER_VALUE,
        OWNER_OCCUPIED,
        LISTED_FOR_SALE,
        IN_FORECLOSURE,
        OWNER,
        OWNER_FIRST_NAME,
        OWNER_LAST_NAME,
        OWNER2_FIRST_NAME,
        OWNER2_LAST_NAME,
        OWNER_ADDRESS,
        OWNER_CITY,
        OWNER_STATE,
        OWNER_ZIP,
        OWNER_DECEASED,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    for prefix in LOAN_PREFIXES {
        for suffix in LOAN_SUFFIXES {
            fields.push(format!("{prefix}{suffix}"));
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fields_include_loans_and_key() {
        let fields = default_fields();
        assert_eq!(fields[0], RADAR_ID);
        assert!(fields.iter().any(|f| f == "SecondLender"));
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }
}
