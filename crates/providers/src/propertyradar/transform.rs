//! PropertyRadar record → normalized [`PropertyBundle`].

use chrono::NaiveDate;
use serde_json::{Map, Value};

use mailhaus_core::{safe_flag, safe_integer, safe_number, safe_text};
use mailhaus_properties::{
    Address, Loan, LoanPosition, Property, PropertyBundle, PropertyOwner, RadarId,
};

use super::fields as f;
use crate::error::TransformError;

pub fn transform_record(raw: &Value) -> Result<PropertyBundle, TransformError> {
    let obj = raw.as_object().ok_or(TransformError::NotAnObject)?;

    let radar_id = text(obj, f::RADAR_ID)
        .and_then(|s| RadarId::parse(s).ok())
        .ok_or(TransformError::MissingKey(f::RADAR_ID))?;

    let property = Property {
        radar_id,
        apn: text(obj, f::APN),
        address: Address {
            street: text(obj, f::ADDRESS),
            city: text(obj, f::CITY),
            state: text(obj, f::STATE),
            zip: text(obj, f::ZIP),
        },
        county: text(obj, f::COUNTY),
        latitude: number(obj, f::LATITUDE),
        longitude: number(obj, f::LONGITUDE),
        property_type: text(obj, f::PROPERTY_TYPE),
        square_feet: integer(obj, f::SQUARE_FEET),
        lot_size: number(obj, f::LOT_SIZE),
        beds: integer(obj, f::BEDS),
        baths: number(obj, f::BATHS),
        year_built: integer(obj, f::YEAR_BUILT),
        avm: number(obj, f::AVM),
        available_equity: number(obj, f::AVAILABLE_EQUITY),
        equity_percent: number(obj, f::EQUITY_PERCENT),
        last_transfer_date: date(obj, f::LAST_TRANSFER_DATE),
        last_transfer_value: number(obj, f::LAST_TRANSFER_VALUE),
        owner_occupied: flag(obj, f::OWNER_OCCUPIED),
        listed_for_sale: flag(obj, f::LISTED_FOR_SALE),
        in_foreclosure: flag(obj, f::IN_FORECLOSURE),
        source: raw.clone(),
    };

    Ok(PropertyBundle {
        property,
        owners: owners(obj),
        loans: loans(obj),
    })
}

fn owners(obj: &Map<String, Value>) -> Vec<PropertyOwner> {
    let mailing_address = Address {
        street: text(obj, f::OWNER_ADDRESS),
        city: text(obj, f::OWNER_CITY),
        state: text(obj, f::OWNER_STATE),
        zip: text(obj, f::OWNER_ZIP),
    };
    let deceased = flag(obj, f::OWNER_DECEASED);

    let mut out = Vec::new();

    let first = text(obj, f::OWNER_FIRST_NAME);
    let last = text(obj, f::OWNER_LAST_NAME);
    if let Some(full_name) = text(obj, f::OWNER).or_else(|| join_name(&first, &last)) {
        out.push(PropertyOwner {
            position: 1,
            full_name,
            first_name: first,
            last_name: last,
            mailing_address: mailing_address.clone(),
            deceased,
        });
    }

    let first2 = text(obj, f::OWNER2_FIRST_NAME);
    let last2 = text(obj, f::OWNER2_LAST_NAME);
    if let Some(full_name) = join_name(&first2, &last2) {
        out.push(PropertyOwner {
            position: out.len() as u8 + 1,
            full_name,
            first_name: first2,
            last_name: last2,
            mailing_address,
            deceased: None,
        });
    }

    out
}

fn loans(obj: &Map<String, Value>) -> Vec<Loan> {
    [(LoanPosition::First, "First"), (LoanPosition::Second, "Second")]
        .into_iter()
        .filter_map(|(position, prefix)| {
            let key = |suffix: &str| format!("{prefix}{suffix}");
            let loan = Loan {
                position,
                amount: number(obj, &key("Amount")),
                rate: number(obj, &key("Rate")),
                rate_type: text(obj, &key("RateType")),
                term_years: integer(obj, &key("TermInYears")),
                loan_type: text(obj, &key("LoanType")),
                purpose: text(obj, &key("Purpose")),
                recording_date: date(obj, &key("Date")),
                lender: text(obj, &key("Lender")),
            };
            let present = loan.amount.is_some()
                || loan.recording_date.is_some()
                || loan.loan_type.is_some()
                || loan.lender.is_some();
            present.then_some(loan)
        })
        .collect()
}

fn join_name(first: &Option<String>, last: &Option<String>) -> Option<String> {
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(n), None) | (None, Some(n)) => Some(n.clone()),
        (None, None) => None,
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(safe_text)
}

fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(safe_number)
}

fn integer(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(safe_integer)
}

fn flag(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(safe_flag)
}

fn date(obj: &Map<String, Value>, key: &str) -> Option<NaiveDate> {
    let raw = obj.get(key)?.as_str()?.trim();
    let iso = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(iso, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}
