//! The lead provider capability interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mailhaus_core::DomainError;
use mailhaus_properties::PropertyBundle;

use crate::error::{ProviderError, TransformError};

/// Closed set of supported providers.
///
/// Adding a provider means adding a variant here, so every `match` over
/// provider identity is checked by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCode {
    PropertyRadar,
}

impl ProviderCode {
    pub const ALL: [ProviderCode; 1] = [ProviderCode::PropertyRadar];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderCode::PropertyRadar => "propertyradar",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderCode::PropertyRadar => "PropertyRadar",
        }
    }
}

impl core::fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProviderCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderCode::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown provider: {s}")))
    }
}

/// Provider identity as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub code: ProviderCode,
    pub name: &'static str,
    pub is_configured: bool,
}

/// Provider filter document.
///
/// The criteria DSL itself is opaque here; the only structural rule is that
/// criteria are a JSON array of filter objects (or an object wrapping one
/// under `Criteria`, the shape the criteria builder stores).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Criteria(Value);

impl Criteria {
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        let inner = match value {
            Value::Array(_) => value,
            Value::Object(mut map) => match map.remove("Criteria") {
                Some(arr @ Value::Array(_)) => arr,
                _ => {
                    return Err(DomainError::validation(
                        "criteria object must contain a `Criteria` array",
                    ));
                }
            },
            other => {
                return Err(DomainError::validation(format!(
                    "criteria must be an array, got {}",
                    json_type_name(&other)
                )));
            }
        };

        if let Some(arr) = inner.as_array() {
            if let Some(idx) = arr.iter().position(|c| !c.is_object()) {
                return Err(DomainError::validation(format!(
                    "criteria entry {idx} is not an object"
                )));
            }
        }

        Ok(Self(inner))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl TryFrom<Value> for Criteria {
    type Error = DomainError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Criteria> for Value {
    fn from(criteria: Criteria) -> Self {
        criteria.0
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One page request.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub criteria: &'a Criteria,
    pub fields: &'a [String],
    /// Zero-based offset of the first record.
    pub start: u64,
    pub limit: u32,
}

/// One page of raw provider records.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<Value>,
    /// Total matches for the criteria, when the provider reports it.
    pub total: Option<u64>,
}

/// External lead-data API client.
#[async_trait]
pub trait LeadProvider: Send + Sync {
    fn code(&self) -> ProviderCode;

    /// Whether credentials are present. Unconfigured providers fail every
    /// fetch with [`ProviderError::Setup`].
    fn is_configured(&self) -> bool;

    fn info(&self) -> ProviderInfo {
        let code = self.code();
        ProviderInfo {
            code,
            name: code.display_name(),
            is_configured: self.is_configured(),
        }
    }

    /// Field list requested when the caller does not supply one.
    fn default_fields(&self) -> Vec<String>;

    /// Records per page used by [`LeadProvider::fetch_properties`].
    fn page_size(&self) -> u32 {
        500
    }

    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchPage, ProviderError>;

    /// Normalize one raw record of this provider's shape.
    fn transform(&self, raw: &Value) -> Result<PropertyBundle, TransformError>;

    /// Fetch every record matching `criteria`, page by page.
    async fn fetch_properties(
        &self,
        criteria: &Criteria,
        fields: &[String],
    ) -> Result<Vec<Value>, ProviderError> {
        let limit = self.page_size().max(1);
        let mut start = 0u64;
        let mut out = Vec::new();

        loop {
            let page = self
                .fetch_page(FetchRequest {
                    criteria,
                    fields,
                    start,
                    limit,
                })
                .await?;

            let n = page.records.len() as u64;
            out.extend(page.records);
            start += n;

            let exhausted = n < limit as u64 || page.total.is_some_and(|t| start >= t);
            if n == 0 || exhausted {
                break;
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_codes_parse_case_insensitively() {
        assert_eq!("PropertyRadar".parse::<ProviderCode>().unwrap(), ProviderCode::PropertyRadar);
        assert_eq!(ProviderCode::PropertyRadar.to_string(), "propertyradar");
        assert!("acme".parse::<ProviderCode>().is_err());
    }

    #[test]
    fn criteria_accepts_arrays() {
        let c = Criteria::from_value(json!([{"name": "State", "value": ["CA"]}])).unwrap();
        assert!(c.as_value().is_array());
    }

    #[test]
    fn criteria_unwraps_wrapped_arrays() {
        let c = Criteria::from_value(json!({"Criteria": [{"name": "State", "value": ["CA"]}]}))
            .unwrap();
        assert_eq!(c.as_value()[0]["name"], "State");
    }

    #[test]
    fn criteria_rejects_other_shapes() {
        assert!(Criteria::from_value(json!("State=CA")).is_err());
        assert!(Criteria::from_value(json!({"state": "CA"})).is_err());
        assert!(Criteria::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn deserializing_criteria_applies_the_same_rules() {
        assert!(serde_json::from_value::<Criteria>(json!("State=CA")).is_err());
        assert!(serde_json::from_value::<Criteria>(json!([{"name": "State"}, 7])).is_err());

        let c: Criteria =
            serde_json::from_value(json!({"Criteria": [{"name": "State", "value": ["CA"]}]}))
                .unwrap();
        assert!(c.as_value().is_array());
        assert_eq!(serde_json::to_value(&c).unwrap()[0]["name"], "State");
    }
}
