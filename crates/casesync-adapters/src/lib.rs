//! Region source adapters: one fetch mechanism + one reshaping step per feed.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use casesync_arcgis::{read_success_body, FetchError};
use casesync_core::{
    parse_day_month_year, parse_iso_date, CaseLabel, Region, SourceRecord,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casesync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Payload(String),
}

/// Per-invocation context handed to every adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Calendar date of the run, used by feeds that publish no date.
    pub as_of: NaiveDate,
}

/// A per-region external feed. `fetch` retrieves the raw body with a single
/// attempt; `parse` flattens the feed's own schema into the common record
/// shape so the rest of the pipeline is region-agnostic.
#[async_trait]
pub trait RegionAdapter: Send + Sync {
    fn region(&self) -> Region;

    async fn fetch(
        &self,
        http: &reqwest::Client,
        ctx: &AdapterContext,
    ) -> Result<Vec<u8>, AdapterError>;

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<SourceRecord>, AdapterError>;

    async fn fetch_source_records(
        &self,
        http: &reqwest::Client,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceRecord>, AdapterError> {
        let body = self.fetch(http, ctx).await?;
        self.parse(&body, ctx)
    }
}

fn payload_error(region: Region, detail: impl Into<String>) -> AdapterError {
    AdapterError::Payload(format!("{} feed: {}", region.slug(), detail.into()))
}

fn decode<'a, T: Deserialize<'a>>(region: Region, body: &'a [u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|err| payload_error(region, err.to_string()))
}

// ---------------------------------------------------------------------------
// NSW: per-notification rows from a CKAN datastore, aggregated per LGA code.

#[derive(Debug, Deserialize)]
struct NotificationsResponse {
    result: NotificationsResult,
}

#[derive(Debug, Deserialize)]
struct NotificationsResult {
    #[serde(default)]
    records: Vec<NotificationRow>,
}

#[derive(Debug, Deserialize)]
struct NotificationRow {
    #[serde(default)]
    lga_code19: Option<String>,
    #[serde(default)]
    notification_date: Option<String>,
}

#[derive(Debug, Default)]
struct CaseTally {
    count: i64,
    latest_date: Option<String>,
}

/// Code-keyed tabular feed: one raw row per notification.
#[derive(Debug, Clone)]
pub struct NswNotificationsAdapter {
    source_url: String,
    resource_id: String,
    max_rows: u32,
}

impl NswNotificationsAdapter {
    pub fn new(source_url: impl Into<String>, resource_id: impl Into<String>, max_rows: u32) -> Self {
        Self {
            source_url: source_url.into(),
            resource_id: resource_id.into(),
            max_rows,
        }
    }
}

#[async_trait]
impl RegionAdapter for NswNotificationsAdapter {
    fn region(&self) -> Region {
        Region::Nsw
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        _ctx: &AdapterContext,
    ) -> Result<Vec<u8>, AdapterError> {
        debug!(url = %self.source_url, resource_id = %self.resource_id, "fetching notification rows");
        let limit = self.max_rows.to_string();
        let form = [
            ("resource_id", self.resource_id.as_str()),
            ("sort", "notification_date"),
            ("limit", limit.as_str()),
        ];
        let resp = http
            .post(&self.source_url)
            .form(&form)
            .send()
            .await
            .map_err(FetchError::from)?;
        Ok(read_success_body(resp).await?)
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<SourceRecord>, AdapterError> {
        let payload: NotificationsResponse = decode(self.region(), body)?;

        // Rows arrive sorted by notification_date; each row bumps its code's
        // count and the date simply tracks the last row seen for that code.
        let mut tallies: BTreeMap<String, CaseTally> = BTreeMap::new();
        for row in payload.result.records {
            let Some(code) = row.lga_code19.filter(|code| !code.is_empty()) else {
                continue;
            };
            let tally = tallies.entry(code).or_default();
            tally.count += 1;
            tally.latest_date = row.notification_date;
        }

        tallies
            .into_iter()
            .map(|(code, tally)| {
                let date = tally
                    .latest_date
                    .as_deref()
                    .and_then(parse_iso_date)
                    .ok_or_else(|| {
                        payload_error(
                            self.region(),
                            format!("code {code} has no parseable notification_date"),
                        )
                    })?;
                Ok(SourceRecord {
                    key: code,
                    cases: Some(tally.count),
                    cases_display: Some(CaseLabel::Count(tally.count)),
                    as_of: date,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// VIC sheet: spreadsheet-shaped JSON, one row per location.

const LOCATIONS_SHEET: &str = "locations";
const VIC_STATE_SHORT: &str = "VIC";

#[derive(Debug, Deserialize)]
struct SheetResponse {
    sheets: HashMap<String, Vec<SheetRow>>,
}

#[derive(Debug, Deserialize)]
struct SheetRow {
    #[serde(rename = "State", default)]
    state: Option<String>,
    #[serde(rename = "Location", default)]
    location: Option<String>,
    #[serde(rename = "Cases", default)]
    cases: Option<CaseLabel>,
    #[serde(rename = "Date", default)]
    date: Option<String>,
}

/// Name-keyed spreadsheet feed. Case figures may be plain numbers,
/// comma-thousands strings, or hyphenated ranges.
#[derive(Debug, Clone)]
pub struct VicSheetAdapter {
    source_url: String,
    api_key: Option<String>,
}

impl VicSheetAdapter {
    pub fn new(source_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            source_url: source_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl RegionAdapter for VicSheetAdapter {
    fn region(&self) -> Region {
        Region::VicSheet
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        _ctx: &AdapterContext,
    ) -> Result<Vec<u8>, AdapterError> {
        debug!(url = %self.source_url, "fetching locations sheet");
        let resp = http
            .get(&self.source_url)
            .header("Content-Type", "application/json")
            .header("x-api-key", self.api_key.as_deref().unwrap_or(""))
            .send()
            .await
            .map_err(FetchError::from)?;
        Ok(read_success_body(resp).await?)
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<SourceRecord>, AdapterError> {
        let payload: SheetResponse = decode(self.region(), body)?;
        let rows = payload
            .sheets
            .get(LOCATIONS_SHEET)
            .ok_or_else(|| payload_error(self.region(), "missing locations sheet"))?;

        let mut records = Vec::new();
        for row in rows {
            if row.state.as_deref() != Some(VIC_STATE_SHORT) {
                continue;
            }
            let Some(location) = row.location.clone().filter(|name| !name.is_empty()) else {
                continue;
            };
            let date = row
                .date
                .as_deref()
                .and_then(parse_day_month_year)
                .ok_or_else(|| {
                    payload_error(
                        self.region(),
                        format!("location {location} has no parseable Date"),
                    )
                })?;
            // Blank figures (zero or empty string) publish a row but no
            // count; the record is still emitted and written back as null.
            let raw = row.cases.clone().filter(|label| !label.is_blank());
            records.push(SourceRecord {
                key: location,
                cases: raw.as_ref().and_then(CaseLabel::resolve_count),
                cases_display: raw,
                as_of: date,
            });
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// VIC dashboard: nested pivot-table JSON with positional cells.

#[derive(Debug, Deserialize)]
struct DashboardResponse {
    results: Vec<DashboardResult>,
}

#[derive(Debug, Deserialize)]
struct DashboardResult {
    result: DashboardResultBody,
}

#[derive(Debug, Deserialize)]
struct DashboardResultBody {
    data: DashboardData,
}

#[derive(Debug, Deserialize)]
struct DashboardData {
    timestamp: String,
    dsr: DashboardRowSet,
}

#[derive(Debug, Deserialize)]
struct DashboardRowSet {
    #[serde(rename = "DS", default)]
    data_sets: Vec<DashboardDataSet>,
}

#[derive(Debug, Deserialize)]
struct DashboardDataSet {
    #[serde(rename = "PH", default)]
    pivot_headers: Vec<DashboardPivotHeader>,
}

#[derive(Debug, Deserialize)]
struct DashboardPivotHeader {
    #[serde(rename = "DM0", default)]
    rows: Vec<PivotRow>,
}

#[derive(Debug, Deserialize)]
struct PivotRow {
    #[serde(rename = "C", default)]
    cells: Vec<JsonValue>,
    #[serde(rename = "R", default)]
    repeat: Option<JsonValue>,
}

fn is_truthy(value: &Option<JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(flag)) => *flag,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn cell_label(value: &JsonValue) -> Option<CaseLabel> {
    if let Some(n) = value.as_i64() {
        return Some(CaseLabel::Count(n));
    }
    value.as_str().map(|s| CaseLabel::Text(s.to_string()))
}

/// Name-keyed pivot feed. Rows are positional `[name, value]` cells; a
/// repeat flag on row i means "use row i-1's raw value cell".
#[derive(Debug, Clone)]
pub struct VicDashboardAdapter {
    source_url: String,
    query_body: JsonValue,
}

impl VicDashboardAdapter {
    pub fn new(source_url: impl Into<String>, query_body: JsonValue) -> Self {
        Self {
            source_url: source_url.into(),
            query_body,
        }
    }
}

#[async_trait]
impl RegionAdapter for VicDashboardAdapter {
    fn region(&self) -> Region {
        Region::VicDashboard
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        _ctx: &AdapterContext,
    ) -> Result<Vec<u8>, AdapterError> {
        debug!(url = %self.source_url, "posting dashboard query");
        let resp = http
            .post(&self.source_url)
            .json(&self.query_body)
            .send()
            .await
            .map_err(FetchError::from)?;
        Ok(read_success_body(resp).await?)
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<SourceRecord>, AdapterError> {
        let payload: DashboardResponse = decode(self.region(), body)?;
        let data = payload
            .results
            .into_iter()
            .next()
            .map(|r| r.result.data)
            .ok_or_else(|| payload_error(self.region(), "empty results"))?;
        let rows = data
            .dsr
            .data_sets
            .first()
            .and_then(|ds| ds.pivot_headers.first())
            .map(|ph| &ph.rows)
            .ok_or_else(|| payload_error(self.region(), "missing pivot rows"))?;

        // Every record shares the dashboard's publication timestamp.
        let as_of = parse_iso_date(&data.timestamp)
            .ok_or_else(|| payload_error(self.region(), "unparseable timestamp"))?;

        let mut records = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let name = row
                .cells
                .first()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| payload_error(self.region(), format!("row {idx} has no name cell")))?;
            // Compressed rows omit their own value cell and point back
            // exactly one position; the first row has nothing to point at.
            let raw_cell = if is_truthy(&row.repeat) {
                let prev = idx.checked_sub(1).ok_or_else(|| {
                    payload_error(self.region(), "row 0 carries a repeat flag with no predecessor")
                })?;
                rows[prev].cells.get(1)
            } else {
                row.cells.get(1)
            };
            let label = raw_cell.and_then(cell_label);
            records.push(SourceRecord {
                key: name.to_string(),
                cases: label.as_ref().and_then(CaseLabel::resolve_count),
                cases_display: label,
                as_of,
            });
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// WA: attribute-filtered feature query, pre-filtered to nonzero counts.

#[derive(Debug, Deserialize)]
struct WaQueryResponse {
    #[serde(default)]
    features: Vec<WaFeature>,
}

#[derive(Debug, Deserialize)]
struct WaFeature {
    attributes: WaAttributes,
}

#[derive(Debug, Deserialize)]
struct WaAttributes {
    #[serde(rename = "LGA_CODE19", default)]
    lga_code: Option<String>,
    #[serde(rename = "Confirmed_cases", default)]
    confirmed_cases: Option<i64>,
    #[serde(rename = "Classification", default)]
    classification: Option<String>,
}

/// Code-keyed feature feed. The server filters to nonzero counts; the
/// classification label doubles as the display string, and the feed carries
/// no date of its own.
#[derive(Debug, Clone)]
pub struct WaFeatureQueryAdapter {
    source_url: String,
}

impl WaFeatureQueryAdapter {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
        }
    }
}

#[async_trait]
impl RegionAdapter for WaFeatureQueryAdapter {
    fn region(&self) -> Region {
        Region::Wa
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        _ctx: &AdapterContext,
    ) -> Result<Vec<u8>, AdapterError> {
        let url = format!("{}/query", self.source_url);
        debug!(url = %url, "fetching filtered case features");
        let resp = http
            .get(&url)
            .query(&[
                ("where", "Confirmed_cases>0"),
                ("f", "json"),
                ("outFields", "LGA_CODE19,Confirmed_cases,Classification"),
                ("returnGeometry", "false"),
            ])
            .send()
            .await
            .map_err(FetchError::from)?;
        Ok(read_success_body(resp).await?)
    }

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<SourceRecord>, AdapterError> {
        let payload: WaQueryResponse = decode(self.region(), body)?;
        let records = payload
            .features
            .into_iter()
            .filter_map(|feature| {
                let attrs = feature.attributes;
                let code = attrs.lga_code.filter(|code| !code.is_empty())?;
                Some(SourceRecord {
                    key: code,
                    cases: attrs.confirmed_cases.filter(|count| *count != 0),
                    cases_display: attrs.classification.map(CaseLabel::Text),
                    as_of: ctx.as_of,
                })
            })
            .collect();
        Ok(records)
    }
}
