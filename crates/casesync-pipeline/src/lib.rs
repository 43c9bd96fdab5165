//! Per-region synchronization pipeline: token, dual fetch, match, write-back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use casesync_adapters::{
    AdapterContext, AdapterError, NswNotificationsAdapter, RegionAdapter, VicDashboardAdapter,
    VicSheetAdapter, WaFeatureQueryAdapter,
};
use casesync_arcgis::{
    build_http_client, AuthError, FeatureLayerClient, FetchError, GisClientConfig, TokenClient,
};
use casesync_core::{
    esri_date, CanonicalFeature, KeyField, Region, SourceRecord, UpdateOutcome, UpdateRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casesync-pipeline";

const DEFAULT_MAX_ROWS: u32 = 50_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid region configuration: {0}")]
    Config(String),
    #[error("token exchange failed: {0}")]
    Auth(#[from] AuthError),
    #[error("read call failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("source feed failed: {0}")]
    Source(#[from] AdapterError),
}

/// Process-level settings: credentials and endpoint URLs for the canonical
/// store, shared by every region pipeline.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub service_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub registry_path: PathBuf,
}

impl SyncSettings {
    pub fn from_env() -> Self {
        Self {
            oauth_url: std::env::var("CASESYNC_OAUTH_URL")
                .unwrap_or_else(|_| "https://www.arcgis.com/sharing/rest/oauth2/token".to_string()),
            client_id: std::env::var("CASESYNC_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("CASESYNC_CLIENT_SECRET").unwrap_or_default(),
            service_url: std::env::var("CASESYNC_SERVICE_URL").unwrap_or_default(),
            http_timeout_secs: std::env::var("CASESYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("CASESYNC_USER_AGENT")
                .unwrap_or_else(|_| "casesync/0.1".to_string()),
            registry_path: std::env::var("CASESYNC_REGIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("regions.yaml")),
        }
    }
}

/// The configured set of region feeds.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionRegistry {
    pub regions: Vec<RegionConfig>,
}

impl RegionRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn region(&self, region: Region) -> Option<&RegionConfig> {
        self.regions.iter().find(|config| config.region == region)
    }

    pub fn enabled(&self) -> Vec<&RegionConfig> {
        self.regions.iter().filter(|config| config.enabled).collect()
    }
}

/// One region's feed endpoint plus the per-feed extras its adapter needs.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub region: Region,
    pub enabled: bool,
    pub source_url: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub max_rows: Option<u32>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub query_body: Option<serde_json::Value>,
}

/// Select and construct the region's adapter at configuration time.
pub fn build_adapter(config: &RegionConfig) -> Result<Box<dyn RegionAdapter>, SyncError> {
    match config.region {
        Region::Nsw => {
            let resource_id = config
                .resource_id
                .clone()
                .ok_or_else(|| SyncError::Config("nsw requires resource_id".into()))?;
            Ok(Box::new(NswNotificationsAdapter::new(
                config.source_url.clone(),
                resource_id,
                config.max_rows.unwrap_or(DEFAULT_MAX_ROWS),
            )))
        }
        Region::VicSheet => Ok(Box::new(VicSheetAdapter::new(
            config.source_url.clone(),
            config.api_key.clone(),
        ))),
        Region::VicDashboard => {
            let query_body = config
                .query_body
                .clone()
                .ok_or_else(|| SyncError::Config("vic-dashboard requires query_body".into()))?;
            Ok(Box::new(VicDashboardAdapter::new(
                config.source_url.clone(),
                query_body,
            )))
        }
        Region::Wa => Ok(Box::new(WaFeatureQueryAdapter::new(
            config.source_url.clone(),
        ))),
    }
}

/// Join source records against canonical features on the region's key
/// field. Records with no canonical counterpart are dropped without error;
/// the first feature wins if the canonical set carries duplicate keys.
pub fn match_records(
    records: &[SourceRecord],
    features: &[CanonicalFeature],
    key_field: KeyField,
) -> Vec<UpdateRecord> {
    records
        .iter()
        .filter_map(|record| {
            features
                .iter()
                .find(|feature| feature.key(key_field) == record.key)
                .map(|feature| UpdateRecord {
                    object_id: feature.object_id,
                    cases: record.cases,
                    cases_str: record.cases_display.clone(),
                    last_updated: esri_date(record.as_of),
                })
        })
        .collect()
}

/// Outcome of one completed region run. Per-record edit failures live here,
/// not in an error: a partial write is still a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RegionRunSummary {
    pub run_id: Uuid,
    pub region: Region,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_records: usize,
    pub canonical_features: usize,
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<UpdateOutcome>,
}

pub struct SyncPipeline {
    settings: SyncSettings,
    http: reqwest::Client,
    tokens: TokenClient,
    layer: FeatureLayerClient,
}

impl SyncPipeline {
    pub fn new(settings: SyncSettings) -> Result<Self> {
        let http = build_http_client(&GisClientConfig {
            timeout: Duration::from_secs(settings.http_timeout_secs),
            user_agent: Some(settings.user_agent.clone()),
        })?;
        let tokens = TokenClient::new(http.clone(), settings.oauth_url.clone());
        let layer = FeatureLayerClient::new(http.clone(), settings.service_url.clone());
        Ok(Self {
            settings,
            http,
            tokens,
            layer,
        })
    }

    /// Run one full synchronization for a single region.
    ///
    /// Steps run strictly in sequence: token, source fetch, feature fetch,
    /// match, batch write. The first failed step aborts the rest of the run;
    /// there are no retries and no rollback, so a failure after the write
    /// started can leave some records already updated. Overlapping runs for
    /// the same region are not coordinated; the store sees last write wins.
    pub async fn run_region(&self, config: &RegionConfig) -> Result<RegionRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let region = config.region;
        info!(%run_id, region = region.slug(), "synchronization started");

        let adapter = build_adapter(config)?;
        let ctx = AdapterContext {
            run_id,
            as_of: started_at.date_naive(),
        };

        let token = self
            .tokens
            .acquire(&self.settings.client_id, &self.settings.client_secret)
            .await?;
        let records = adapter.fetch_source_records(&self.http, &ctx).await?;
        let features = self.layer.query_features(&token).await?;

        let state_features: Vec<CanonicalFeature> = features
            .into_iter()
            .filter(|feature| feature.state_name == region.state_name())
            .collect();
        let updates = match_records(&records, &state_features, region.key_field());

        let summary = self.layer.apply_updates(&updates, &token).await?;

        let finished_at = Utc::now();
        info!(
            %run_id,
            region = region.slug(),
            matched = updates.len(),
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "synchronization completed"
        );
        Ok(RegionRunSummary {
            run_id,
            region,
            started_at,
            finished_at,
            source_records: records.len(),
            canonical_features: state_features.len(),
            matched: updates.len(),
            succeeded: summary.succeeded.len(),
            failed: summary.failed.len(),
            failures: summary.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casesync_core::CaseLabel;
    use chrono::NaiveDate;

    fn feature(object_id: i64, code: &str, name: &str, state: &str) -> CanonicalFeature {
        CanonicalFeature {
            object_id,
            lga_code: code.to_string(),
            lga_name: name.to_string(),
            state_name: state.to_string(),
        }
    }

    fn record(key: &str, cases: Option<i64>, display: Option<CaseLabel>) -> SourceRecord {
        SourceRecord {
            key: key.to_string(),
            cases,
            cases_display: display,
            as_of: NaiveDate::from_ymd_opt(2021, 3, 3).unwrap(),
        }
    }

    #[test]
    fn unmatched_records_are_dropped_silently() {
        let features = vec![feature(1, "17200", "Sydney (C)", "New South Wales")];
        let records = vec![
            record("17200", Some(3), Some(CaseLabel::Count(3))),
            record("99999", Some(8), Some(CaseLabel::Count(8))),
        ];
        let updates = match_records(&records, &features, KeyField::LgaCode);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].object_id, 1);
    }

    #[test]
    fn batch_never_exceeds_source_record_count() {
        let features = vec![
            feature(1, "17200", "Sydney (C)", "New South Wales"),
            feature(2, "11300", "Burwood (A)", "New South Wales"),
        ];
        let records = vec![
            record("17200", Some(3), None),
            record("11300", Some(1), None),
        ];
        let updates = match_records(&records, &features, KeyField::LgaCode);
        assert_eq!(updates.len(), records.len());
    }

    #[test]
    fn duplicate_canonical_keys_resolve_to_first_feature() {
        let features = vec![
            feature(1, "17200", "Sydney (C)", "New South Wales"),
            feature(2, "17200", "Sydney (C)", "New South Wales"),
        ];
        let records = vec![record("17200", Some(3), None)];
        let updates = match_records(&records, &features, KeyField::LgaCode);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].object_id, 1);
    }

    #[test]
    fn name_keyed_matching_carries_midpoint_and_label() {
        let features = vec![feature(1, "24600", "Melbourne (C)", "Victoria")];
        let records = vec![
            record(
                "Melbourne (C)",
                Some(15),
                Some(CaseLabel::Text("10-20".into())),
            ),
            record("Nowhere (C)", None, None),
        ];
        let updates = match_records(&records, &features, KeyField::LgaName);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].object_id, 1);
        assert_eq!(updates[0].cases, Some(15));
        assert_eq!(updates[0].cases_str, Some(CaseLabel::Text("10-20".into())));
        assert_eq!(updates[0].last_updated, "2021-3-3");
    }

    #[test]
    fn registry_parses_per_region_extras() {
        let yaml = r#"
regions:
  - region: nsw
    enabled: true
    source_url: https://data.example.nsw.gov.au/api/3/action/datastore_search
    resource_id: res-1
    max_rows: 100
  - region: vic-dashboard
    enabled: false
    source_url: https://example.analysis.windows.net/public/reports/querydata
    query_body:
      version: "1.0.0"
"#;
        let registry: RegionRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.regions.len(), 2);
        assert_eq!(registry.enabled().len(), 1);
        let nsw = registry.region(Region::Nsw).unwrap();
        assert_eq!(nsw.resource_id.as_deref(), Some("res-1"));
        assert_eq!(nsw.max_rows, Some(100));
        assert!(registry.region(Region::Wa).is_none());
    }

    #[test]
    fn adapter_factory_validates_per_region_extras() {
        let config = RegionConfig {
            region: Region::Nsw,
            enabled: true,
            source_url: "http://example".into(),
            resource_id: None,
            max_rows: None,
            api_key: None,
            query_body: None,
        };
        assert!(matches!(
            build_adapter(&config),
            Err(SyncError::Config(_))
        ));

        let config = RegionConfig {
            region: Region::Wa,
            enabled: true,
            source_url: "http://example".into(),
            resource_id: None,
            max_rows: None,
            api_key: None,
            query_body: None,
        };
        let adapter = build_adapter(&config).unwrap();
        assert_eq!(adapter.region(), Region::Wa);
    }
}
