//! Core domain model for atlas: identities, cell values, merge and diff rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "atlas-core";

/// Opaque row identifier assigned by the remote store.
pub type RowId = i64;

/// Field name to cell value, the shape every table row shares.
pub type FieldMap = BTreeMap<String, Value>;

/// Tables the engine reads and writes. Per-source tag side tables are
/// addressed by their computed name instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sources,
    Sites,
    Repos,
    Authors,
    Lexicons,
}

impl Table {
    pub fn id(self) -> &'static str {
        match self {
            Table::Sources => "Data_Sources",
            Table::Sites => "Sites",
            Table::Repos => "Repos",
            Table::Authors => "Authors",
            Table::Lexicons => "Lexicons",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Column names shared across tables. Source-specific columns are built from
/// these suffixes with [`source_field`].
pub mod fields {
    pub const NORMALIZED_URL: &str = "normalized_url";
    pub const URL: &str = "url";
    pub const HOMEPAGE: &str = "homepageUrl";
    pub const NORMALIZED_HOMEPAGE: &str = "normalized_homepage";
    pub const ALT_URLS: &str = "alt_urls";
    pub const SITES: &str = "Sites";
    pub const SOURCES: &str = "Sources";
    pub const LEXICONS: &str = "Lexicons";
    pub const DID: &str = "did";
    pub const HANDLE: &str = "handle";
    pub const CONTACTED: &str = "contacted";
    pub const UNREACHABLE_DID: &str = "unreachable_did";
    pub const LAST_POLLED: &str = "last_polled";
    pub const SITE_META: &str = "site_meta";
    pub const FORGE_TYPE: &str = "forge_type";
    pub const SOURCE_NAME: &str = "source_name";
    pub const LABEL: &str = "label";
    pub const LAST_UPDATE: &str = "last_update_timestamp";
    pub const UPDATED_AT: &str = "record_updatedAt";
    pub const TAG: &str = "Tag";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const RATING: &str = "rating";
    pub const TAGS: &str = "tags";
    pub const TITLE: &str = "title";
    pub const ERROR: &str = "error";
}

/// Column name for a source-specific field, e.g. `Example_rating`.
pub fn source_field(source: &str, field: &str) -> String {
    format!("{source}_{field}")
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("empty url")]
    Empty,
    #[error("unparseable url {raw:?}: {source}")]
    Parse {
        raw: String,
        #[source]
        source: url::ParseError,
    },
}

/// A canonicalized URL, usable as a business key across sources and runs.
/// Only [`normalize_url`] and [`detect_forge`] mint these, so holding one
/// means the normalization rules have already been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

static TRACKING_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:utm_|fbclid|gclid|ref$)").expect("tracking param pattern"));

/// Canonicalize a URL into its business key.
///
/// Rules, in order: add an `https` scheme if none is present, downcase the
/// host, strip a leading `www.`, drop tracking query parameters (`utm_*`,
/// `fbclid*`, `gclid*`, a bare `ref`), strip a trailing `/about` segment and
/// trailing slash, demote `http` to `https`. Idempotent.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|source| NormalizeError::Parse {
        raw: raw.to_owned(),
        source,
    })?;
    if url.scheme() == "http" {
        // http -> https is always a legal scheme swap.
        let _ = url.set_scheme("https");
    }
    if let Some(bare) = url.host_str().and_then(|h| h.strip_prefix("www.")) {
        let bare = bare.to_owned();
        url.set_host(Some(&bare)).map_err(|source| NormalizeError::Parse {
            raw: raw.to_owned(),
            source,
        })?;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAM_RE.is_match(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
    }
    let path = url.path();
    let path = path.strip_suffix('/').unwrap_or(path);
    let path = path.strip_suffix("/about").unwrap_or(path).to_owned();
    url.set_path(&path);
    let mut out = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        out.pop();
    }
    Ok(NormalizedUrl(out))
}

/// Repository hosting services the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Forge {
    Github,
    Gitlab,
    Gitea,
    Tangled,
}

impl Forge {
    pub fn as_str(self) -> &'static str {
        match self {
            Forge::Github => "github",
            Forge::Gitlab => "gitlab",
            Forge::Gitea => "gitea",
            Forge::Tangled => "tangled",
        }
    }
}

static REPO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://(github\.com|gitlab\.com|codeberg\.org|tangled\.sh)/[^/]+/[^/]+")
        .expect("repo url pattern")
});

/// Recognize a normalized URL as a forge repository and truncate it to the
/// `{owner}/{repo}` prefix that serves as the Repo business key.
pub fn detect_forge(url: &NormalizedUrl) -> Option<(Forge, NormalizedUrl)> {
    let caps = REPO_URL_RE.captures(url.as_str())?;
    let forge = match caps.get(1)?.as_str() {
        "github.com" => Forge::Github,
        "gitlab.com" => Forge::Gitlab,
        "codeberg.org" => Forge::Gitea,
        "tangled.sh" => Forge::Tangled,
        _ => return None,
    };
    Some((forge, NormalizedUrl(caps.get(0)?.as_str().to_owned())))
}

/// One cell in a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
    Refs(Vec<RowId>),
    Map(FieldMap),
}

impl Value {
    /// Absent, empty and zero all count as "nothing there" when diffing.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::Float(x) => *x == 0.0,
            Value::Text(s) => s.is_empty(),
            Value::List(v) => v.is_empty(),
            Value::Refs(v) => v.is_empty(),
            Value::Map(m) => m.is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&[RowId]> {
        match self {
            Value::Refs(ids) => Some(ids),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One stored row: the store-assigned identifier plus its cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub fields: FieldMap,
}

/// How repeated sightings of the same field combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LastWins,
    Max,
    Union,
}

/// Per-field merge policies, keyed by the unprefixed field name. Everything
/// else is last-wins.
const FIELD_POLICIES: &[(&str, MergePolicy)] = &[
    (fields::RATING, MergePolicy::Max),
    (fields::TAGS, MergePolicy::Union),
    (fields::LEXICONS, MergePolicy::Union),
    (fields::SOURCES, MergePolicy::Union),
    (fields::SITES, MergePolicy::Union),
];

/// Look up the merge policy for a (possibly source-prefixed) column name.
pub fn merge_policy(field: &str) -> MergePolicy {
    let suffix = field.rsplit('_').next().unwrap_or(field);
    for (name, policy) in FIELD_POLICIES {
        if field == *name || suffix == *name {
            return *policy;
        }
    }
    MergePolicy::LastWins
}

/// Extend `dest` with the items of `src` it does not already contain,
/// preserving order on both sides.
pub fn union_into<T: PartialEq>(dest: &mut Vec<T>, src: impl IntoIterator<Item = T>) {
    for item in src {
        if !dest.contains(&item) {
            dest.push(item);
        }
    }
}

/// Combine an existing cell with a newly seen one under a policy.
pub fn merge_value(policy: MergePolicy, old: &Value, new: Value) -> Value {
    match policy {
        MergePolicy::LastWins => new,
        MergePolicy::Max => match (old.as_f64(), new.as_f64()) {
            (Some(a), Some(b)) if a >= b => old.clone(),
            _ => new,
        },
        MergePolicy::Union => match (old, new) {
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                union_into(&mut out, b);
                Value::List(out)
            }
            (Value::Refs(a), Value::Refs(b)) => {
                let mut out = a.clone();
                union_into(&mut out, b);
                Value::Refs(out)
            }
            (_, new) => new,
        },
    }
}

/// Merge `src` into `dest` field by field, each under its own policy.
/// Returns the names of last-wins fields whose value was actually overridden,
/// for collision logging at the call site.
pub fn merge_fields(dest: &mut FieldMap, src: FieldMap) -> Vec<String> {
    let mut collisions = Vec::new();
    for (key, new) in src {
        match dest.get(&key) {
            None => {
                dest.insert(key, new);
            }
            Some(old) => {
                let policy = merge_policy(&key);
                if policy == MergePolicy::LastWins
                    && !old.is_falsy()
                    && !new.is_falsy()
                    && !values_equal(old, &new)
                {
                    collisions.push(key.clone());
                }
                let merged = merge_value(policy, old, new);
                dest.insert(key, merged);
            }
        }
    }
    collisions
}

fn values_equal(old: &Value, new: &Value) -> bool {
    if old == new {
        return true;
    }
    // Int and Float spellings of the same number count as equal.
    match (old.as_f64(), new.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Structural diff of a pending record against its stored counterpart.
///
/// Walks the pending fields; a field whose stored and pending values are both
/// falsy, or equal, is dropped. Map-valued fields are compared recursively,
/// but a changed map is emitted whole: the store replaces cells, so writing
/// only the changed sub-fields would erase the untouched ones.
/// The result holds only the values to write; an empty result means no write
/// is needed.
pub fn diff_fields(stored: &FieldMap, pending: &FieldMap) -> FieldMap {
    let mut out = FieldMap::new();
    for (key, new) in pending {
        match (stored.get(key), new) {
            (Some(Value::Map(old)), Value::Map(new_map)) => {
                let nested = diff_fields(old, new_map);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Map(new_map.clone()));
                }
            }
            (old, new) => {
                if old.map_or(true, Value::is_falsy) && new.is_falsy() {
                    continue;
                }
                if old.is_some_and(|old| values_equal(old, new)) {
                    continue;
                }
                out.insert(key.clone(), new.clone());
            }
        }
    }
    out
}

/// Parse an ISO-8601 timestamp into epoch seconds, the watermark format.
pub fn parse_timestamp(raw: &str) -> Result<i64, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.timestamp())
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Whether cached data stamped `last_polled` is due for a re-fetch.
pub fn is_stale(last_polled: Option<i64>, threshold_days: f64) -> bool {
    let ts = last_polled.unwrap_or(0);
    if ts == 0 {
        return true;
    }
    (now_ts() - ts) as f64 > threshold_days * 86_400.0
}

/// One raw item handed over by a source adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lexicons: Vec<RowId>,
    #[serde(flatten)]
    pub extra: FieldMap,
}

impl Entry {
    pub fn bare(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Adapter-facing spelling of an entry: sources that are plain link lists
/// hand over bare URL strings, richer sources hand over records.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawEntry {
    Url(String),
    Record(Entry),
}

impl From<RawEntry> for Entry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Url(url) => Entry::bare(url),
            RawEntry::Record(entry) => entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "http://Example.com/x?utm_source=y",
            "www.example.com/foo/",
            "https://example.com/bar/about",
            "example.com",
            "https://github.com/Owner/Repo/tree/main",
            "https://site.test/path?a=1&utm_medium=mail&ref",
        ];
        for raw in inputs {
            let once = normalize_url(raw).unwrap();
            let twice = normalize_url(once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn normalize_strips_tracking_scheme_and_case() {
        let a = normalize_url("http://Example.com/x?utm_source=y").unwrap();
        let b = normalize_url("https://example.com/x").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/x");
    }

    #[test]
    fn normalize_strips_www_about_and_trailing_slash() {
        let url = normalize_url("http://www.Example.com/foo/about/").unwrap();
        assert_eq!(url.as_str(), "https://example.com/foo");
        let bare = normalize_url("example.com").unwrap();
        assert_eq!(bare.as_str(), "https://example.com");
    }

    #[test]
    fn normalize_keeps_real_query_params() {
        let url = normalize_url("https://a.test/p?id=7&utm_campaign=x&ref=top").unwrap();
        assert_eq!(url.as_str(), "https://a.test/p?id=7");
        let prefix = normalize_url("https://a.test/p?referrer=feed").unwrap();
        assert_eq!(prefix.as_str(), "https://a.test/p?referrer=feed");
        let gone = normalize_url("https://a.test/p?utm_campaign=x&ref").unwrap();
        assert_eq!(gone.as_str(), "https://a.test/p");
    }

    #[test]
    fn detect_forge_truncates_to_repo_key() {
        let url = normalize_url("https://github.com/acme/widget/tree/main/docs").unwrap();
        let (forge, key) = detect_forge(&url).unwrap();
        assert_eq!(forge, Forge::Github);
        assert_eq!(key.as_str(), "https://github.com/acme/widget");

        let plain = normalize_url("https://example.com/acme/widget").unwrap();
        assert!(detect_forge(&plain).is_none());
    }

    #[test]
    fn merge_policy_sees_through_source_prefix() {
        assert_eq!(merge_policy("Example_rating"), MergePolicy::Max);
        assert_eq!(merge_policy("Example_tags"), MergePolicy::Union);
        assert_eq!(merge_policy(fields::SOURCES), MergePolicy::Union);
        assert_eq!(merge_policy("Example_name"), MergePolicy::LastWins);
        assert_eq!(merge_policy(fields::NORMALIZED_URL), MergePolicy::LastWins);
    }

    #[test]
    fn merge_fields_applies_policies_and_reports_collisions() {
        let mut dest = FieldMap::from([
            ("Example_rating".to_owned(), Value::Int(1)),
            ("Example_name".to_owned(), Value::from("old name")),
            ("Example_tags".to_owned(), Value::Refs(vec![1, 2])),
        ]);
        let src = FieldMap::from([
            ("Example_rating".to_owned(), Value::Int(3)),
            ("Example_name".to_owned(), Value::from("new name")),
            ("Example_tags".to_owned(), Value::Refs(vec![2, 3])),
        ]);
        let collisions = merge_fields(&mut dest, src);
        assert_eq!(dest["Example_rating"], Value::Int(3));
        assert_eq!(dest["Example_name"], Value::from("new name"));
        assert_eq!(dest["Example_tags"], Value::Refs(vec![1, 2, 3]));
        assert_eq!(collisions, vec!["Example_name".to_owned()]);
    }

    #[test]
    fn merge_rating_keeps_maximum() {
        let merged = merge_value(MergePolicy::Max, &Value::Int(3), Value::Int(1));
        assert_eq!(merged, Value::Int(3));
        let merged = merge_value(MergePolicy::Max, &Value::Float(1.5), Value::Int(2));
        assert_eq!(merged, Value::Int(2));
    }

    #[test]
    fn diff_treats_falsy_values_as_equal() {
        let stored = FieldMap::from([
            ("a".to_owned(), Value::Text(String::new())),
            ("b".to_owned(), Value::Int(0)),
            ("c".to_owned(), Value::from("kept")),
        ]);
        let pending = FieldMap::from([
            ("a".to_owned(), Value::Null),
            ("b".to_owned(), Value::Float(0.0)),
            ("c".to_owned(), Value::from("kept")),
            ("d".to_owned(), Value::List(vec![])),
        ]);
        assert!(diff_fields(&stored, &pending).is_empty());
    }

    #[test]
    fn diff_emits_changed_maps_whole() {
        let stored = FieldMap::from([
            ("name".to_owned(), Value::from("old")),
            (
                "site_meta".to_owned(),
                Value::Map(FieldMap::from([
                    ("title".to_owned(), Value::from("t")),
                    ("last_polled".to_owned(), Value::Int(100)),
                ])),
            ),
        ]);
        let pending = FieldMap::from([
            ("name".to_owned(), Value::from("new")),
            (
                "site_meta".to_owned(),
                Value::Map(FieldMap::from([
                    ("title".to_owned(), Value::from("t")),
                    ("last_polled".to_owned(), Value::Int(200)),
                ])),
            ),
        ]);
        let diff = diff_fields(&stored, &pending);
        assert_eq!(diff["name"], Value::from("new"));
        // The whole map comes back, unchanged sub-fields included.
        assert_eq!(diff["site_meta"], pending["site_meta"]);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn diff_drops_maps_that_did_not_change() {
        let meta = Value::Map(FieldMap::from([("title".to_owned(), Value::from("t"))]));
        let stored = FieldMap::from([("site_meta".to_owned(), meta.clone())]);
        let pending = FieldMap::from([("site_meta".to_owned(), meta)]);
        assert!(diff_fields(&stored, &pending).is_empty());
    }

    #[test]
    fn diff_is_empty_for_int_float_spellings_of_one_number() {
        let stored = FieldMap::from([("rating".to_owned(), Value::Float(2.0))]);
        let pending = FieldMap::from([("rating".to_owned(), Value::Int(2))]);
        assert!(diff_fields(&stored, &pending).is_empty());
    }

    #[test]
    fn parse_timestamp_accepts_zulu_and_offsets() {
        let z = parse_timestamp("2024-05-01T00:00:00Z").unwrap();
        let offset = parse_timestamp("2024-05-01T02:00:00+02:00").unwrap();
        assert_eq!(z, offset);
    }

    #[test]
    fn staleness_handles_missing_and_fresh_stamps() {
        assert!(is_stale(None, 2.0));
        assert!(is_stale(Some(0), 2.0));
        assert!(!is_stale(Some(now_ts()), 2.0));
        assert!(is_stale(Some(now_ts() - 3 * 86_400), 2.0));
    }

    #[test]
    fn raw_entry_accepts_bare_urls_and_records() {
        let bare: RawEntry = serde_json::from_str(r#""https://example.com""#).unwrap();
        let entry = Entry::from(bare);
        assert_eq!(entry.url, "https://example.com");
        assert!(entry.tags.is_empty());

        let record: RawEntry = serde_json::from_str(
            r#"{"url": "https://example.com", "tags": ["a"], "rating": 2, "form_id": "x1"}"#,
        )
        .unwrap();
        let entry = Entry::from(record);
        assert_eq!(entry.tags, vec!["a".to_owned()]);
        assert_eq!(entry.rating, Some(2.0));
        assert_eq!(entry.extra["form_id"], Value::from("x1"));
    }
}
