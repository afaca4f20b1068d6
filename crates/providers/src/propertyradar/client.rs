use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use mailhaus_properties::PropertyBundle;

use super::{fields, transform};
use crate::error::{ProviderError, TransformError};
use crate::provider::{FetchPage, FetchRequest, LeadProvider, ProviderCode};

pub const DEFAULT_BASE_URL: &str = "https://api.propertyradar.com/v1";

/// Connection settings for the PropertyRadar REST API.
#[derive(Debug, Clone)]
pub struct PropertyRadarConfig {
    /// Bearer token. `None` leaves the provider registered but unconfigured.
    pub api_token: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub page_size: u32,
}

impl Default for PropertyRadarConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            page_size: 500,
        }
    }
}

pub struct PropertyRadarProvider {
    client: reqwest::Client,
    config: PropertyRadarConfig,
}

#[derive(Debug, Deserialize)]
struct PropertiesResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(rename = "totalResultCount")]
    total_result_count: Option<u64>,
}

impl PropertyRadarProvider {
    pub fn new(config: PropertyRadarConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::setup(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.config
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::setup("PropertyRadar API token is not configured"))
    }

    fn properties_url(&self) -> String {
        format!("{}/properties", self.config.base_url.trim_end_matches('/'))
    }
}

impl core::fmt::Debug for PropertyRadarProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PropertyRadarProvider")
            .field("base_url", &self.config.base_url)
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[async_trait]
impl LeadProvider for PropertyRadarProvider {
    fn code(&self) -> ProviderCode {
        ProviderCode::PropertyRadar
    }

    fn is_configured(&self) -> bool {
        self.token().is_ok()
    }

    fn default_fields(&self) -> Vec<String> {
        fields::default_fields()
    }

    fn page_size(&self) -> u32 {
        self.config.page_size
    }

    #[instrument(
        skip(self, request),
        fields(provider = "propertyradar", start = request.start, limit = request.limit),
        err
    )]
    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchPage, ProviderError> {
        let token = self.token()?;

        let fields = if request.fields.is_empty() {
            self.default_fields().join(",")
        } else {
            request.fields.join(",")
        };

        let query = [
            ("Purchase", "1".to_string()),
            ("Limit", request.limit.to_string()),
            ("Start", request.start.to_string()),
            ("Fields", fields),
        ];

        let resp = self
            .client
            .post(self.properties_url())
            .bearer_auth(token)
            .query(&query)
            .json(&json!({ "Criteria": request.criteria.as_value() }))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let parsed: PropertiesResponse = resp.json().await.map_err(|e| {
            if e.is_decode() {
                ProviderError::http(status.as_u16(), format!("unreadable response body: {e}"))
            } else {
                map_send_error(e)
            }
        })?;

        debug!(
            records = parsed.results.len(),
            total = ?parsed.total_result_count,
            "fetched property page"
        );

        Ok(FetchPage {
            records: parsed.results,
            total: parsed.total_result_count,
        })
    }

    fn transform(&self, raw: &Value) -> Result<PropertyBundle, TransformError> {
        transform::transform_record(raw)
    }
}

fn map_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_builder() {
        ProviderError::setup(format!("invalid request: {err}"))
    } else {
        ProviderError::no_response(err.to_string())
    }
}
