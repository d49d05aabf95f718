//! Remote tabular store adapter: the `RecordStore` trait, the Grist HTTP
//! implementation, and an in-memory store for tests.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use atlas_core::{FieldMap, Row, RowId, Value};

pub const CRATE_NAME: &str = "atlas-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store api error ({status}) on {method} {path}: {message}")]
    Api {
        status: u16,
        method: &'static str,
        path: String,
        message: String,
    },
    #[error("unexpected store response: {0}")]
    Decode(String),
}

/// Connection settings for the remote store, read from the environment once
/// at startup.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub doc_id: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://docs.getgrist.com".to_string(),
            doc_id: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("ATLAS_STORE_URL").unwrap_or(defaults.base_url),
            doc_id: std::env::var("ATLAS_STORE_DOC").unwrap_or(defaults.doc_id),
            api_key: std::env::var("ATLAS_STORE_API_KEY").unwrap_or(defaults.api_key),
            timeout: defaults.timeout,
        }
    }
}

/// One batched business-key upsert: `require` selects the row, `fields` is
/// what gets written. The store does not echo row ids for these; callers
/// re-read the table to learn them.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRecord {
    pub require: FieldMap,
    pub fields: FieldMap,
}

impl UpsertRecord {
    pub fn keyed(key_field: &str, key: impl Into<Value>, fields: FieldMap) -> Self {
        Self {
            require: FieldMap::from([(key_field.to_string(), key.into())]),
            fields,
        }
    }
}

/// Column metadata as the store models it. `visible_col` points at the
/// column a reference list displays through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub col_type: Option<String>,
    #[serde(rename = "visibleCol", skip_serializing_if = "Option::is_none")]
    pub visible_col: Option<RowId>,
    #[serde(rename = "colRef", skip_serializing_if = "Option::is_none")]
    pub col_ref: Option<RowId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: String,
    pub fields: ColumnFields,
}

impl ColumnSpec {
    /// Label-only spec: the store picks the column type from the data.
    pub fn labeled(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: ColumnFields {
                label: Some(label.to_string()),
                ..ColumnFields::default()
            },
        }
    }

    pub fn text(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: ColumnFields {
                label: Some(label.to_string()),
                col_type: Some("Text".to_string()),
                ..ColumnFields::default()
            },
        }
    }

    pub fn numeric(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: ColumnFields {
                label: Some(label.to_string()),
                col_type: Some("Numeric".to_string()),
                ..ColumnFields::default()
            },
        }
    }

    pub fn ref_list(id: &str, label: &str, target_table: &str, visible_col: Option<RowId>) -> Self {
        Self {
            id: id.to_string(),
            fields: ColumnFields {
                label: Some(label.to_string()),
                col_type: Some(format!("RefList:{target_table}")),
                visible_col,
                ..ColumnFields::default()
            },
        }
    }
}

/// The store surface the engine runs against. Reads are whole tables; writes
/// are batched; a non-success response is a hard error, never retried
/// (rate-limit waits excepted, handled below the trait).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_records(&self, table: &str) -> Result<Vec<Row>, StoreError>;

    /// Plain insert; returns assigned row ids in input order.
    async fn add_records(&self, table: &str, records: Vec<FieldMap>) -> Result<Vec<RowId>, StoreError>;

    /// Business-key upsert. Assigned ids are not echoed back.
    async fn add_update_records(&self, table: &str, records: Vec<UpsertRecord>) -> Result<(), StoreError>;

    async fn delete_records(&self, table: &str, row_ids: Vec<RowId>) -> Result<(), StoreError>;

    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    async fn add_table(&self, table: &str, columns: Vec<ColumnSpec>) -> Result<(), StoreError>;

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnSpec>, StoreError>;

    /// Create missing columns; update the metadata of existing ones only when
    /// `update_existing` is set. Never drops a column.
    async fn add_update_columns(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
        update_existing: bool,
    ) -> Result<(), StoreError>;
}

/// Metadata row id of a column, used as a `visibleCol` pointer.
pub async fn column_ref(
    store: &dyn RecordStore,
    table: &str,
    column: &str,
) -> Result<Option<RowId>, StoreError> {
    let columns = store.list_columns(table).await?;
    Ok(columns
        .into_iter()
        .find(|c| c.id == column)
        .and_then(|c| c.fields.col_ref))
}

/// How long a rate-limited response asks us to wait, if it is one.
///
/// Recognizes `retry-after` seconds, the `x-ratelimit-remaining == 0` /
/// `x-ratelimit-reset` epoch pair, and a bare 429 (default 60s).
pub fn rate_limit_wait(resp: &reqwest::Response) -> Option<Duration> {
    fn header_u64(resp: &reqwest::Response, name: &str) -> Option<u64> {
        resp.headers()
            .get(name)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
    }

    if let Some(secs) = header_u64(resp, "retry-after") {
        if secs > 0 {
            return Some(Duration::from_secs(secs));
        }
    }
    if header_u64(resp, "x-ratelimit-remaining") == Some(0) {
        if let Some(reset) = header_u64(resp, "x-ratelimit-reset") {
            let now = Utc::now().timestamp().max(0) as u64;
            return Some(Duration::from_secs(reset.saturating_sub(now) + 1));
        }
    }
    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Some(Duration::from_secs(60));
    }
    None
}

/// HTTP client for a Grist-compatible document.
#[derive(Debug)]
pub struct GristStore {
    client: reqwest::Client,
    base_url: String,
    doc_id: String,
    api_key: String,
    /// Columns whose cells travel as JSON text and decode to structured values.
    json_columns: HashSet<(String, String)>,
}

impl GristStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building store http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            doc_id: config.doc_id,
            api_key: config.api_key,
            json_columns: HashSet::new(),
        })
    }

    pub fn with_json_column(mut self, table: &str, column: &str) -> Self {
        self.json_columns.insert((table.to_string(), column.to_string()));
        self
    }

    fn doc_url(&self, rest: &str) -> String {
        format!("{}/api/docs/{}/{rest}", self.base_url, self.doc_id)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Send a request, sleeping through rate-limit responses until the
    /// reported reset. Any other non-success status is a hard error.
    async fn send_checked(
        &self,
        method: &'static str,
        path: String,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let mut req = Some(req);
        loop {
            let attempt = match req.as_ref().and_then(|r| r.try_clone()) {
                Some(clone) => clone,
                None => req.take().ok_or_else(|| {
                    StoreError::Decode(format!("request not retryable: {method} {path}"))
                })?,
            };
            debug!(method, path = %path, "store call");
            let resp = attempt.send().await?;
            if let Some(wait) = rate_limit_wait(&resp) {
                warn!(wait_secs = wait.as_secs(), path = %path, "store rate limit hit, waiting for reset");
                tokio::time::sleep(wait).await;
                continue;
            }
            let status = resp.status();
            if !status.is_success() {
                return Err(StoreError::Api {
                    status: status.as_u16(),
                    method,
                    path,
                    message: resp.text().await.unwrap_or_default(),
                });
            }
            return Ok(resp);
        }
    }

    fn encode_fields(&self, fields: &FieldMap) -> serde_json::Map<String, serde_json::Value> {
        fields
            .iter()
            .map(|(col, value)| (col.clone(), encode_cell(value)))
            .collect()
    }

    fn decode_fields(
        &self,
        table: &str,
        raw: serde_json::Map<String, serde_json::Value>,
    ) -> FieldMap {
        raw.into_iter()
            .map(|(col, cell)| {
                let json_coded = self.json_columns.contains(&(table.to_string(), col.clone()));
                let value = if json_coded {
                    decode_json_cell(&cell)
                } else {
                    decode_cell(&cell)
                };
                (col, value)
            })
            .collect()
    }
}

/// Cell encoding on the wire: reference lists and string lists carry the
/// store's `["L", ...]` marker, maps travel as JSON text.
fn encode_cell(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::json!(b),
        Value::Int(n) => serde_json::json!(n),
        Value::Float(x) => serde_json::json!(x),
        Value::Text(s) => serde_json::json!(s),
        Value::List(items) => {
            let mut cell = vec![serde_json::json!("L")];
            cell.extend(items.iter().map(|s| serde_json::json!(s)));
            serde_json::Value::Array(cell)
        }
        Value::Refs(ids) => {
            let mut cell = vec![serde_json::json!("L")];
            cell.extend(ids.iter().map(|id| serde_json::json!(id)));
            serde_json::Value::Array(cell)
        }
        Value::Map(map) => match serde_json::to_string(map) {
            Ok(text) => serde_json::Value::String(text),
            Err(_) => serde_json::Value::Null,
        },
    }
}

fn decode_cell(cell: &serde_json::Value) -> Value {
    match cell {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => decode_list(items),
        serde_json::Value::Object(_) => Value::Text(cell.to_string()),
    }
}

fn decode_list(items: &[serde_json::Value]) -> Value {
    let rest = match items.first() {
        Some(serde_json::Value::String(tag)) if tag == "L" => &items[1..],
        _ => items,
    };
    if rest.iter().all(|v| v.is_i64()) {
        Value::Refs(rest.iter().filter_map(|v| v.as_i64()).collect())
    } else {
        Value::List(
            rest.iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )
    }
}

/// Declared JSON columns hold a serialized document; anything unparseable is
/// kept as text rather than failing the whole snapshot read.
fn decode_json_cell(cell: &serde_json::Value) -> Value {
    match cell {
        serde_json::Value::String(s) => {
            serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::Text(s.clone()))
        }
        other => decode_cell(other),
    }
}

#[derive(Debug, Deserialize)]
struct RecordsEnvelope {
    records: Vec<RecordEnvelope>,
}

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    id: RowId,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TablesEnvelope {
    tables: Vec<TableEnvelope>,
}

#[derive(Debug, Deserialize)]
struct TableEnvelope {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ColumnsEnvelope {
    columns: Vec<ColumnSpec>,
}

#[async_trait]
impl RecordStore for GristStore {
    async fn list_records(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let path = format!("tables/{table}/records");
        let url = self.doc_url(&path);
        let resp = self
            .send_checked("GET", path, self.request(reqwest::Method::GET, &url))
            .await?;
        let envelope: RecordsEnvelope = resp.json().await?;
        Ok(envelope
            .records
            .into_iter()
            .map(|r| Row {
                id: r.id,
                fields: self.decode_fields(table, r.fields),
            })
            .collect())
    }

    async fn add_records(&self, table: &str, records: Vec<FieldMap>) -> Result<Vec<RowId>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("tables/{table}/records");
        let url = self.doc_url(&path);
        let body = serde_json::json!({
            "records": records
                .iter()
                .map(|fields| serde_json::json!({ "fields": self.encode_fields(fields) }))
                .collect::<Vec<_>>(),
        });
        let resp = self
            .send_checked(
                "POST",
                path,
                self.request(reqwest::Method::POST, &url).json(&body),
            )
            .await?;
        let envelope: RecordsEnvelope = resp.json().await?;
        Ok(envelope.records.into_iter().map(|r| r.id).collect())
    }

    async fn add_update_records(&self, table: &str, records: Vec<UpsertRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = format!("tables/{table}/records");
        let url = self.doc_url(&path);
        let body = serde_json::json!({
            "records": records
                .iter()
                .map(|r| serde_json::json!({
                    "require": self.encode_fields(&r.require),
                    "fields": self.encode_fields(&r.fields),
                }))
                .collect::<Vec<_>>(),
        });
        self.send_checked(
            "PUT",
            path,
            self.request(reqwest::Method::PUT, &url).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_records(&self, table: &str, row_ids: Vec<RowId>) -> Result<(), StoreError> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let path = format!("tables/{table}/data/delete");
        let url = self.doc_url(&path);
        self.send_checked(
            "POST",
            path,
            self.request(reqwest::Method::POST, &url).json(&row_ids),
        )
        .await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let path = "tables".to_string();
        let url = self.doc_url(&path);
        let resp = self
            .send_checked("GET", path, self.request(reqwest::Method::GET, &url))
            .await?;
        let envelope: TablesEnvelope = resp.json().await?;
        Ok(envelope.tables.into_iter().map(|t| t.id).collect())
    }

    async fn add_table(&self, table: &str, columns: Vec<ColumnSpec>) -> Result<(), StoreError> {
        let path = "tables".to_string();
        let url = self.doc_url(&path);
        let body = serde_json::json!({
            "tables": [{ "id": table, "columns": columns }],
        });
        self.send_checked(
            "POST",
            path,
            self.request(reqwest::Method::POST, &url).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnSpec>, StoreError> {
        let path = format!("tables/{table}/columns");
        let url = self.doc_url(&path);
        let resp = self
            .send_checked("GET", path, self.request(reqwest::Method::GET, &url))
            .await?;
        let envelope: ColumnsEnvelope = resp.json().await?;
        Ok(envelope.columns)
    }

    async fn add_update_columns(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
        update_existing: bool,
    ) -> Result<(), StoreError> {
        let existing: HashSet<String> = self
            .list_columns(table)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let (updates, additions): (Vec<_>, Vec<_>) =
            columns.into_iter().partition(|c| existing.contains(&c.id));

        if !additions.is_empty() {
            let path = format!("tables/{table}/columns");
            let url = self.doc_url(&path);
            let body = serde_json::json!({ "columns": additions });
            self.send_checked(
                "POST",
                path,
                self.request(reqwest::Method::POST, &url).json(&body),
            )
            .await?;
        }
        if update_existing && !updates.is_empty() {
            let path = format!("tables/{table}/columns");
            let url = self.doc_url(&path);
            let body = serde_json::json!({ "columns": updates });
            self.send_checked(
                "PATCH",
                path,
                self.request(reqwest::Method::PATCH, &url).json(&body),
            )
            .await?;
        }
        Ok(())
    }
}

/// In-memory `RecordStore` used by tests across the workspace. Tables spring
/// into existence on first touch; row and column ids are sequential.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: BTreeMap<String, MemoryTable>,
    next_col_ref: RowId,
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_row_id: RowId,
    rows: Vec<Row>,
    columns: Vec<ColumnSpec>,
}

impl MemoryInner {
    fn table(&mut self, name: &str) -> &mut MemoryTable {
        self.tables.entry(name.to_string()).or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing upsert semantics. Test setup only.
    pub async fn seed(&self, table: &str, fields: FieldMap) -> RowId {
        let mut inner = self.inner.lock().await;
        let slot = inner.table(table);
        slot.next_row_id += 1;
        let id = slot.next_row_id;
        slot.rows.push(Row { id, fields });
        id
    }
}

fn require_matches(row: &Row, require: &FieldMap) -> bool {
    require.iter().all(|(col, expected)| {
        row.fields
            .get(col)
            .map_or(expected.is_falsy(), |actual| actual == expected)
    })
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_records(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.table(table).rows.clone())
    }

    async fn add_records(&self, table: &str, records: Vec<FieldMap>) -> Result<Vec<RowId>, StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.table(table);
        let mut ids = Vec::with_capacity(records.len());
        for fields in records {
            slot.next_row_id += 1;
            ids.push(slot.next_row_id);
            slot.rows.push(Row {
                id: slot.next_row_id,
                fields,
            });
        }
        Ok(ids)
    }

    async fn add_update_records(&self, table: &str, records: Vec<UpsertRecord>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.table(table);
        for record in records {
            match slot.rows.iter_mut().find(|row| require_matches(row, &record.require)) {
                Some(row) => {
                    row.fields.extend(record.fields);
                }
                None => {
                    slot.next_row_id += 1;
                    let mut fields = record.require;
                    fields.extend(record.fields);
                    slot.rows.push(Row {
                        id: slot.next_row_id,
                        fields,
                    });
                }
            }
        }
        Ok(())
    }

    async fn delete_records(&self, table: &str, row_ids: Vec<RowId>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.table(table);
        slot.rows.retain(|row| !row_ids.contains(&row.id));
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tables.keys().cloned().collect())
    }

    async fn add_table(&self, table: &str, columns: Vec<ColumnSpec>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for mut column in columns {
            inner.next_col_ref += 1;
            column.fields.col_ref = Some(inner.next_col_ref);
            inner.table(table).columns.push(column);
        }
        inner.table(table);
        Ok(())
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnSpec>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.table(table).columns.clone())
    }

    async fn add_update_columns(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
        update_existing: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for column in columns {
            inner.next_col_ref += 1;
            let col_ref = inner.next_col_ref;
            let slot = inner.table(table);
            match slot.columns.iter_mut().find(|c| c.id == column.id) {
                Some(existing) => {
                    if update_existing {
                        let keep_ref = existing.fields.col_ref;
                        existing.fields = column.fields;
                        existing.fields.col_ref = keep_ref;
                    }
                }
                None => {
                    let mut added = column;
                    added.fields.col_ref = Some(col_ref);
                    slot.columns.push(added);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::fields;

    fn mock_response(status: u16, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut builder = ::http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        reqwest::Response::from(builder.body("").expect("mock response"))
    }

    #[test]
    fn rate_limit_wait_prefers_retry_after() {
        let resp = mock_response(403, &[("retry-after", "30")]);
        assert_eq!(rate_limit_wait(&resp), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rate_limit_wait_sleeps_until_reset() {
        let reset = (Utc::now().timestamp() + 120) as u64;
        let resp = mock_response(
            403,
            &[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset", &reset.to_string()),
            ],
        );
        let wait = rate_limit_wait(&resp).expect("rate limited");
        assert!(wait >= Duration::from_secs(115) && wait <= Duration::from_secs(125));
    }

    #[test]
    fn rate_limit_wait_defaults_on_bare_429() {
        let resp = mock_response(429, &[]);
        assert_eq!(rate_limit_wait(&resp), Some(Duration::from_secs(60)));
        let ok = mock_response(200, &[("x-ratelimit-remaining", "5")]);
        assert_eq!(rate_limit_wait(&ok), None);
    }

    #[test]
    fn cells_round_trip_the_list_marker() {
        let refs = Value::Refs(vec![4, 9]);
        let encoded = encode_cell(&refs);
        assert_eq!(encoded, serde_json::json!(["L", 4, 9]));
        assert_eq!(decode_cell(&encoded), refs);

        let tags = Value::List(vec!["a".to_string(), "b".to_string()]);
        let encoded = encode_cell(&tags);
        assert_eq!(encoded, serde_json::json!(["L", "a", "b"]));
        assert_eq!(decode_cell(&encoded), tags);
    }

    #[test]
    fn json_cells_decode_to_maps() {
        let meta = Value::Map(FieldMap::from([
            ("title".to_string(), Value::from("A Site")),
            ("last_polled".to_string(), Value::Int(99)),
        ]));
        let encoded = encode_cell(&meta);
        let text = encoded.as_str().expect("json cell is text");
        assert!(text.contains("\"title\""));
        assert_eq!(decode_json_cell(&encoded), meta);
        // Unparseable content survives as text instead of failing the read.
        assert_eq!(
            decode_json_cell(&serde_json::json!("not json {")),
            Value::Text("not json {".to_string())
        );
    }

    #[tokio::test]
    async fn memory_store_upserts_by_business_key() {
        let store = MemoryStore::new();
        store
            .add_update_records(
                "Sites",
                vec![UpsertRecord::keyed(
                    fields::NORMALIZED_URL,
                    "https://example.com",
                    FieldMap::from([("name".to_string(), Value::from("one"))]),
                )],
            )
            .await
            .unwrap();
        store
            .add_update_records(
                "Sites",
                vec![UpsertRecord::keyed(
                    fields::NORMALIZED_URL,
                    "https://example.com",
                    FieldMap::from([("name".to_string(), Value::from("two"))]),
                )],
            )
            .await
            .unwrap();

        let rows = store.list_records("Sites").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["name"], Value::from("two"));
        assert_eq!(
            rows[0].fields[fields::NORMALIZED_URL],
            Value::from("https://example.com")
        );
    }

    #[tokio::test]
    async fn memory_store_assigns_sequential_ids_and_deletes() {
        let store = MemoryStore::new();
        let ids = store
            .add_records(
                "Authors",
                vec![
                    FieldMap::from([(fields::DID.to_string(), Value::from("did:plc:a"))]),
                    FieldMap::from([(fields::DID.to_string(), Value::from("did:plc:b"))]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);

        store.delete_records("Authors", vec![1]).await.unwrap();
        let rows = store.list_records("Authors").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
    }

    #[tokio::test]
    async fn memory_store_reconciles_columns_additively() {
        let store = MemoryStore::new();
        store
            .add_table("Example_tags", vec![ColumnSpec::text("Tag", "Tag")])
            .await
            .unwrap();
        store
            .add_update_columns(
                "Example_tags",
                vec![
                    ColumnSpec::text("Tag", "Renamed"),
                    ColumnSpec::text("hue", "hue"),
                ],
                false,
            )
            .await
            .unwrap();

        let columns = store.list_columns("Example_tags").await.unwrap();
        assert_eq!(columns.len(), 2);
        // Tag existed, so its label stays untouched in add-only mode.
        assert_eq!(columns[0].fields.label.as_deref(), Some("Tag"));
        assert!(columns.iter().any(|c| c.id == "hue"));
        let tag_ref = column_ref(&store, "Example_tags", "Tag").await.unwrap();
        assert!(tag_ref.is_some());
    }
}
