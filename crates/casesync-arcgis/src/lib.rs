//! ArcGIS Online surface: token exchange, feature queries, batched edits.

use std::time::Duration;

use anyhow::Context;
use casesync_core::{CanonicalFeature, EditFailure, UpdateOutcome, UpdateRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "casesync-arcgis";

/// Requested token lifetime, in minutes.
const TOKEN_LIFETIME_MINUTES: &str = "1440";

const FEATURE_OUT_FIELDS: &str = "OBJECTID,LGA_CODE19,LGA_NAME19,STE_NAME16";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected payload from {url}: {detail}")]
    Payload { url: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct GisClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for GisClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Build the shared HTTP client every pipeline call goes through. Requests
/// get exactly one attempt; bounded latency comes from the timeout alone.
pub fn build_http_client(config: &GisClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Consume a response, mapping non-success statuses to [`FetchError`] and
/// returning the raw body otherwise.
pub async fn read_success_body(resp: reqwest::Response) -> Result<Vec<u8>, FetchError> {
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

/// Bearer token minted for a single pipeline invocation; never persisted.
///
/// The exchange response is trusted blindly: when it carries no
/// `access_token` field the token is empty and the next store call fails
/// server-side instead of here.
#[derive(Debug, Clone)]
pub struct Token {
    value: Option<String>,
}

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Exchanges client credentials for a bearer token.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    oauth_url: String,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, oauth_url: impl Into<String>) -> Self {
        Self {
            http,
            oauth_url: oauth_url.into(),
        }
    }

    /// One form-encoded credential exchange, single attempt.
    pub async fn acquire(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Token, AuthError> {
        let form = [
            ("f", "json"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
            ("expiration", TOKEN_LIFETIME_MINUTES),
        ];
        let resp = self.http.post(&self.oauth_url).form(&form).send().await?;
        let payload: TokenResponse = resp.json().await?;
        Ok(Token {
            value: payload.access_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FeatureQueryResponse {
    #[serde(default)]
    features: Vec<FeatureEnvelope>,
}

#[derive(Debug, Deserialize)]
struct FeatureEnvelope {
    attributes: FeatureAttributes,
}

#[derive(Debug, Deserialize)]
struct FeatureAttributes {
    #[serde(rename = "OBJECTID")]
    object_id: i64,
    #[serde(rename = "LGA_CODE19")]
    lga_code: String,
    #[serde(rename = "LGA_NAME19")]
    lga_name: String,
    #[serde(rename = "STE_NAME16")]
    state_name: String,
}

impl From<FeatureAttributes> for CanonicalFeature {
    fn from(attrs: FeatureAttributes) -> Self {
        CanonicalFeature {
            object_id: attrs.object_id,
            lga_code: attrs.lga_code,
            lga_name: attrs.lga_name,
            state_name: attrs.state_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    #[serde(rename = "updateResults", default)]
    update_results: Vec<EditResultRow>,
}

#[derive(Debug, Deserialize)]
struct EditResultRow {
    #[serde(rename = "objectId")]
    object_id: i64,
    #[serde(default)]
    error: Option<EditFailure>,
}

/// Partitioned per-record outcomes of one batched edit call.
#[derive(Debug, Clone, Default)]
pub struct EditSummary {
    pub succeeded: Vec<UpdateOutcome>,
    pub failed: Vec<UpdateOutcome>,
}

impl EditSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

fn partition_edit_results(rows: Vec<EditResultRow>) -> EditSummary {
    let mut summary = EditSummary::default();
    for row in rows {
        let outcome = UpdateOutcome {
            object_id: row.object_id,
            succeeded: row.error.is_none(),
            error: row.error,
        };
        if outcome.succeeded {
            summary.succeeded.push(outcome);
        } else {
            summary.failed.push(outcome);
        }
    }
    summary
}

fn edit_payload(updates: &[UpdateRecord]) -> Vec<serde_json::Value> {
    updates
        .iter()
        .map(|update| {
            serde_json::json!({
                "attributes": {
                    "OBJECTID": update.object_id,
                    "Cases": update.cases,
                    "Cases_Str": update.cases_str,
                    "LastUpdated": update.last_updated,
                }
            })
        })
        .collect()
}

/// Client for one hosted feature layer: the canonical read query and the
/// batched attribute write-back.
#[derive(Debug, Clone)]
pub struct FeatureLayerClient {
    http: reqwest::Client,
    service_url: String,
}

impl FeatureLayerClient {
    pub fn new(http: reqwest::Client, service_url: impl Into<String>) -> Self {
        Self {
            http,
            service_url: service_url.into(),
        }
    }

    /// Fetch the full canonical feature set with a fixed attribute
    /// projection and geometry omitted. The layer is assumed to fit in one
    /// response; no pagination is attempted.
    pub async fn query_features(&self, token: &Token) -> Result<Vec<CanonicalFeature>, FetchError> {
        let url = format!("{}/query", self.service_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("token", token.as_str()),
                ("where", "1=1"),
                ("f", "json"),
                ("outFields", FEATURE_OUT_FIELDS),
                ("returnGeometry", "false"),
            ])
            .send()
            .await?;
        let final_url = resp.url().to_string();
        let body = read_success_body(resp).await?;
        let payload: FeatureQueryResponse =
            serde_json::from_slice(&body).map_err(|err| FetchError::Payload {
                url: final_url,
                detail: err.to_string(),
            })?;
        Ok(payload
            .features
            .into_iter()
            .map(|envelope| envelope.attributes.into())
            .collect())
    }

    /// Submit all updates in one batched edit call and classify per-record
    /// outcomes. Rejected records are reported, not retried, and never fail
    /// the call; only the batch call's own transport/status failures do.
    pub async fn apply_updates(
        &self,
        updates: &[UpdateRecord],
        token: &Token,
    ) -> Result<EditSummary, FetchError> {
        let url = format!("{}/applyEdits", self.service_url);
        let edits = serde_json::to_string(&edit_payload(updates)).map_err(|err| {
            FetchError::Payload {
                url: url.clone(),
                detail: err.to_string(),
            }
        })?;
        let form = [
            ("updates", edits.as_str()),
            ("f", "json"),
            ("token", token.as_str()),
        ];
        let resp = self.http.post(&url).form(&form).send().await?;
        let final_url = resp.url().to_string();
        let body = read_success_body(resp).await?;
        let payload: EditResponse =
            serde_json::from_slice(&body).map_err(|err| FetchError::Payload {
                url: final_url,
                detail: err.to_string(),
            })?;

        let summary = partition_edit_results(payload.update_results);
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "features updated"
        );
        if !summary.failed.is_empty() {
            warn!(
                detail = %serde_json::to_string(&summary.failed).unwrap_or_default(),
                "some edits were rejected"
            );
        }
        Ok(summary)
    }
}
