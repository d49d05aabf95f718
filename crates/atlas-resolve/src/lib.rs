//! Author identity resolution: handle/DID patterns, the identity directory
//! client, the bidirectional resolver cache, and the reconciliation pass
//! that collapses duplicate author rows.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use atlas_core::{fields, union_into, FieldMap, Row, RowId, Table, Value};
use atlas_storage::{rate_limit_wait, RecordStore, StoreError, UpsertRecord};

pub const CRATE_NAME: &str = "atlas-resolve";

static DID_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Identifiers may carry colon-separated segments (did:web) but never
    // end on a colon or a bare escape.
    Regex::new(
        r"did:(?P<method>[a-z0-9]+):(?P<identifier>(?:[a-zA-Z0-9._%-]*:)*[a-zA-Z0-9._%-]*[a-zA-Z0-9._-])",
    )
    .expect("did pattern")
});

static BARE_HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@?(?P<handle>(?:[a-zA-Z0-9-]+\.)+[a-zA-Z0-9-]+)$").expect("bare handle pattern")
});

static PROFILE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bsky\.app/profile/(?P<handle>[^/?#\s]+)").expect("profile link pattern")
});

/// A decentralized identifier, the Author business key. Minted only by
/// [`Did::parse`], so holding one means the pattern already matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Extract a DID from a reference that contains one (possibly embedded
    /// in a profile URL).
    pub fn parse(reference: &str) -> Option<Did> {
        DID_RE
            .find(reference)
            .map(|m| Did(m.as_str().to_string()))
    }

    pub fn method(&self) -> &str {
        // The constructor guarantees the shape did:<method>:<identifier>.
        self.0.split(':').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pull a handle out of a reference using the two recognized spellings:
/// a bare domain-like handle (optionally `@`-prefixed) or a profile link.
/// Handles are case-insensitive, so the result is lowercased.
pub fn match_handle(reference: &str) -> Option<String> {
    let caps = BARE_HANDLE_RE
        .captures(reference.trim())
        .or_else(|| PROFILE_LINK_RE.captures(reference))?;
    Some(caps.name("handle")?.as_str().to_ascii_lowercase())
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no identifier pattern matched {0:?}")]
    Unrecognized(String),
    #[error("handle {0:?} did not resolve")]
    UnknownHandle(String),
    #[error("directory request failed: {0}")]
    Directory(#[from] reqwest::Error),
    #[error("directory status {status} for {url}")]
    DirectoryStatus { status: u16, url: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("resolver cache at {path}: {source}")]
    Cache {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The external identity layer: exactly two lookups.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` means the handle is unknown, as opposed to a transport error.
    async fn did_for_handle(&self, handle: &str) -> Result<Option<Did>, ResolveError>;

    async fn handle_for_did(&self, did: &Did) -> Result<Option<String>, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub xrpc_url: String,
    pub plc_url: String,
    pub timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            xrpc_url: "https://public.api.bsky.app".to_string(),
            plc_url: "https://plc.directory".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

impl DirectoryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            xrpc_url: std::env::var("ATLAS_XRPC_URL").unwrap_or(defaults.xrpc_url),
            plc_url: std::env::var("ATLAS_PLC_URL").unwrap_or(defaults.plc_url),
            timeout: defaults.timeout,
        }
    }
}

/// Directory client over the public XRPC endpoint and the PLC registry.
#[derive(Debug)]
pub struct XrpcDirectory {
    client: reqwest::Client,
    xrpc_url: String,
    plc_url: String,
}

impl XrpcDirectory {
    pub fn new(config: DirectoryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building directory http client")?;
        Ok(Self {
            client,
            xrpc_url: config.xrpc_url.trim_end_matches('/').to_string(),
            plc_url: config.plc_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET with the blocking rate-limit wait every outbound dependency gets.
    async fn get(&self, url: &str) -> Result<reqwest::Response, ResolveError> {
        loop {
            let resp = self.client.get(url).send().await?;
            if let Some(wait) = rate_limit_wait(&resp) {
                warn!(wait_secs = wait.as_secs(), url, "directory rate limit hit, waiting");
                tokio::time::sleep(wait).await;
                continue;
            }
            return Ok(resp);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleBody {
    did: String,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default, rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
}

#[async_trait]
impl IdentityDirectory for XrpcDirectory {
    async fn did_for_handle(&self, handle: &str) -> Result<Option<Did>, ResolveError> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={handle}",
            self.xrpc_url
        );
        let resp = self.get(&url).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ResolveError::DirectoryStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body: ResolveHandleBody = resp.json().await?;
        Ok(Did::parse(&body.did))
    }

    async fn handle_for_did(&self, did: &Did) -> Result<Option<String>, ResolveError> {
        if did.method() != "plc" {
            debug!(%did, "only plc identifiers resolve to handles here");
            return Ok(None);
        }
        let url = format!("{}/{}", self.plc_url, did.as_str());
        let resp = self.get(&url).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ResolveError::DirectoryStatus {
                status: status.as_u16(),
                url,
            });
        }
        let doc: DidDocument = resp.json().await?;
        Ok(doc
            .also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(|handle| handle.to_ascii_lowercase()))
    }
}

/// Outcome of one reconciliation pass over the Author table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub groups_merged: usize,
    pub rows_deleted: usize,
    pub handles_filled: usize,
    pub dids_filled: usize,
    pub marked_invalid: usize,
}

/// Per-run author identity session: resolves references against the cache
/// first and the directory second, keeping handle and DID mutually indexed.
pub struct AuthorResolver {
    directory: Arc<dyn IdentityDirectory>,
    by_did: HashMap<Did, Option<String>>,
    by_handle: HashMap<String, Did>,
    cache_path: Option<PathBuf>,
}

impl AuthorResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            directory,
            by_did: HashMap::new(),
            by_handle: HashMap::new(),
            cache_path: None,
        }
    }

    /// Attach a persistent cache file so resolutions survive across runs.
    /// Missing file just means an empty starting cache.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Result<Self, ResolveError> {
        let path = path.into();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let entries: HashMap<String, Option<String>> =
                    serde_json::from_str(&raw).unwrap_or_default();
                for (did_text, handle) in entries {
                    if let Some(did) = Did::parse(&did_text) {
                        self.remember(did, handle);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ResolveError::Cache {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
        self.cache_path = Some(path);
        Ok(self)
    }

    /// Write the cache back to the file supplied at construction, if any.
    pub fn save_cache(&self) -> Result<(), ResolveError> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        let entries: HashMap<&str, &Option<String>> = self
            .by_did
            .iter()
            .map(|(did, handle)| (did.as_str(), handle))
            .collect();
        let raw = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "{}".to_string());
        std::fs::write(path, raw).map_err(|source| ResolveError::Cache {
            path: path.display().to_string(),
            source,
        })
    }

    fn remember(&mut self, did: Did, handle: Option<String>) {
        if let Some(handle) = &handle {
            self.by_handle.insert(handle.clone(), did.clone());
        }
        // A known handle never degrades back to None.
        match self.by_did.get(&did) {
            Some(Some(_)) if handle.is_none() => {}
            _ => {
                self.by_did.insert(did, handle);
            }
        }
    }

    /// Cached handle for an identifier, if any sighting recorded one.
    pub fn handle_for(&self, did: &Did) -> Option<&str> {
        self.by_did.get(did).and_then(|h| h.as_deref())
    }

    /// Resolve a raw author reference to its identifier. Cache first, then
    /// the directory; every success is remembered bidirectionally.
    pub async fn resolve(&mut self, reference: &str) -> Result<Did, ResolveError> {
        if let Some(did) = Did::parse(reference) {
            if !self.by_did.contains_key(&did) {
                self.remember(did.clone(), None);
            }
            return Ok(did);
        }
        let handle =
            match_handle(reference).ok_or_else(|| ResolveError::Unrecognized(reference.to_string()))?;
        if let Some(did) = self.by_handle.get(&handle) {
            return Ok(did.clone());
        }
        match self.directory.did_for_handle(&handle).await? {
            Some(did) => {
                debug!(handle, %did, "resolved author handle");
                self.remember(did.clone(), Some(handle));
                Ok(did)
            }
            None => Err(ResolveError::UnknownHandle(handle)),
        }
    }

    /// Fetch and cache the handle for an identifier when the cache has none.
    pub async fn ensure_handle(&mut self, did: &Did) -> Result<Option<String>, ResolveError> {
        if let Some(handle) = self.handle_for(did) {
            return Ok(Some(handle.to_string()));
        }
        let handle = self.directory.handle_for_did(did).await?;
        self.remember(did.clone(), handle.clone());
        Ok(handle)
    }

    /// Load every stored Author row into the cache.
    pub async fn load_authors(&mut self, store: &dyn RecordStore) -> Result<(), ResolveError> {
        for row in store.list_records(Table::Authors.id()).await? {
            let did = row
                .fields
                .get(fields::DID)
                .and_then(Value::as_str)
                .and_then(Did::parse);
            let handle = row
                .fields
                .get(fields::HANDLE)
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_ascii_lowercase);
            if let Some(did) = did {
                self.remember(did, handle);
            }
        }
        Ok(())
    }

    /// One-per-session pass that restores the "one row per identifier"
    /// invariant: fill missing handles and identifiers, merge duplicate rows
    /// into a primary, mark unresolvable handles invalid, and reload the
    /// cache from the corrected table.
    pub async fn reconcile(&mut self, store: &dyn RecordStore) -> Result<ReconcileSummary, ResolveError> {
        let rows = store.list_records(Table::Authors.id()).await?;
        let mut summary = ReconcileSummary::default();
        let mut groups: Vec<(Did, Vec<GroupRow>)> = Vec::new();
        let mut invalid: Vec<UpsertRecord> = Vec::new();

        for row in rows {
            let stored_did = row
                .fields
                .get(fields::DID)
                .and_then(Value::as_str)
                .and_then(Did::parse);
            let handle = row
                .fields
                .get(fields::HANDLE)
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_ascii_lowercase);

            let (did, had_did) = match (&stored_did, &handle) {
                (Some(did), _) => (did.clone(), true),
                (None, Some(handle)) => match self.directory.did_for_handle(handle).await? {
                    Some(did) => {
                        summary.dids_filled += 1;
                        (did, false)
                    }
                    None => {
                        warn!(handle, row_id = row.id, "author handle did not resolve, marking invalid");
                        summary.marked_invalid += 1;
                        invalid.push(UpsertRecord::keyed(
                            fields::HANDLE,
                            handle.clone(),
                            FieldMap::from([(fields::UNREACHABLE_DID.to_string(), Value::Bool(true))]),
                        ));
                        continue;
                    }
                },
                (None, None) => {
                    debug!(row_id = row.id, "author row has neither identifier nor handle");
                    continue;
                }
            };

            let entry = GroupRow {
                row,
                had_did,
                handle,
            };
            match groups.iter_mut().find(|(group_did, _)| *group_did == did) {
                Some((_, members)) => members.push(entry),
                None => groups.push((did, vec![entry])),
            }
        }

        let mut corrections: Vec<UpsertRecord> = Vec::new();
        let mut to_delete: Vec<RowId> = Vec::new();

        for (did, mut members) in groups {
            let handle = match members.iter().find_map(|m| m.handle.clone()) {
                Some(handle) => Some(handle),
                None => {
                    let fetched = self.ensure_handle(&did).await?;
                    if fetched.is_some() {
                        summary.handles_filled += 1;
                    }
                    fetched
                }
            };

            let primary_idx = pick_primary(&members);
            let mut primary = members.swap_remove(primary_idx);
            let mut changed = !primary.had_did
                || primary.handle.as_deref() != handle.as_deref()
                || !members.is_empty();

            for other in &members {
                merge_author_fields(&mut primary.row.fields, &other.row.fields);
                to_delete.push(other.row.id);
            }
            if !members.is_empty() {
                summary.groups_merged += 1;
                info!(%did, merged = members.len(), "merged duplicate author rows");
            }

            if let Some(handle) = &handle {
                if primary.row.fields.get(fields::HANDLE).and_then(Value::as_str) != Some(handle) {
                    changed = true;
                }
                primary
                    .row
                    .fields
                    .insert(fields::HANDLE.to_string(), Value::from(handle.clone()));
            }
            primary
                .row
                .fields
                .insert(fields::DID.to_string(), Value::from(did.as_str()));

            self.remember(did.clone(), handle);

            if changed {
                // Key by the stored identifier when the row already had one,
                // otherwise by handle so the correction lands on the same row.
                let mut fields_out = primary.row.fields.clone();
                let record = if primary.had_did {
                    fields_out.remove(fields::DID);
                    UpsertRecord::keyed(fields::DID, did.as_str(), fields_out)
                } else {
                    let key = primary
                        .handle
                        .clone()
                        .unwrap_or_else(|| did.as_str().to_string());
                    fields_out.remove(fields::HANDLE);
                    UpsertRecord::keyed(fields::HANDLE, key, fields_out)
                };
                corrections.push(record);
            }
        }

        summary.rows_deleted = to_delete.len();
        store.delete_records(Table::Authors.id(), to_delete).await?;
        store
            .add_update_records(Table::Authors.id(), corrections)
            .await?;
        store.add_update_records(Table::Authors.id(), invalid).await?;

        self.by_did.clear();
        self.by_handle.clear();
        self.load_authors(store).await?;
        Ok(summary)
    }
}

struct GroupRow {
    row: Row,
    had_did: bool,
    handle: Option<String>,
}

/// Prefer a row that already carried the identifier; among the rest, the most
/// recently updated one wins.
fn pick_primary(members: &[GroupRow]) -> usize {
    let mut best = 0;
    for (idx, member) in members.iter().enumerate() {
        let better = match (member.had_did, members[best].had_did) {
            (true, false) => true,
            (false, true) => false,
            _ => updated_at(member) > updated_at(&members[best]),
        };
        if better {
            best = idx;
        }
    }
    best
}

fn updated_at(member: &GroupRow) -> i64 {
    member
        .row
        .fields
        .get(fields::UPDATED_AT)
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as i64
}

/// Fold a superseded row into the primary: union list fields (primary order
/// first), OR the contacted flag, leave other scalars to the primary.
fn merge_author_fields(primary: &mut FieldMap, other: &FieldMap) {
    for (key, value) in other {
        match value {
            Value::Refs(ids) => {
                let mut merged = primary
                    .get(key)
                    .and_then(Value::as_refs)
                    .map(<[RowId]>::to_vec)
                    .unwrap_or_default();
                union_into(&mut merged, ids.iter().copied());
                primary.insert(key.clone(), Value::Refs(merged));
            }
            Value::List(items) => {
                let mut merged = match primary.get(key) {
                    Some(Value::List(existing)) => existing.clone(),
                    _ => Vec::new(),
                };
                union_into(&mut merged, items.iter().cloned());
                primary.insert(key.clone(), Value::List(merged));
            }
            Value::Bool(flag) if key == fields::CONTACTED => {
                let current = matches!(primary.get(key), Some(Value::Bool(true)));
                primary.insert(key.clone(), Value::Bool(current || *flag));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDirectory {
        handle_to_did: HashMap<String, Did>,
        did_to_handle: HashMap<Did, String>,
        lookups: AtomicUsize,
    }

    impl StubDirectory {
        fn new(pairs: &[(&str, &str)]) -> Self {
            let mut handle_to_did = HashMap::new();
            let mut did_to_handle = HashMap::new();
            for (handle, did_text) in pairs {
                let did = Did::parse(did_text).expect("stub did");
                handle_to_did.insert((*handle).to_string(), did.clone());
                did_to_handle.insert(did, (*handle).to_string());
            }
            Self {
                handle_to_did,
                did_to_handle,
                lookups: AtomicUsize::new(0),
            }
        }

        fn lookup_count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityDirectory for StubDirectory {
        async fn did_for_handle(&self, handle: &str) -> Result<Option<Did>, ResolveError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.handle_to_did.get(handle).cloned())
        }

        async fn handle_for_did(&self, did: &Did) -> Result<Option<String>, ResolveError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.did_to_handle.get(did).cloned())
        }
    }

    #[test]
    fn did_pattern_finds_embedded_identifiers() {
        let did = Did::parse("https://bsky.app/profile/did:plc:abc123xyz").expect("embedded did");
        assert_eq!(did.as_str(), "did:plc:abc123xyz");
        assert_eq!(did.method(), "plc");
        assert!(Did::parse("just a handle.example.com").is_none());
    }

    #[test]
    fn did_pattern_spans_colon_separated_segments() {
        let did = Did::parse("did:web:example.com:u:alice").expect("multi-segment did");
        assert_eq!(did.as_str(), "did:web:example.com:u:alice");
        assert_eq!(did.method(), "web");

        // A trailing colon belongs to the surrounding text, not the DID.
        let did = Did::parse("see did:plc:abc123xyz: for details").expect("punctuated did");
        assert_eq!(did.as_str(), "did:plc:abc123xyz");
    }

    #[test]
    fn handle_patterns_cover_bare_and_profile_link_forms() {
        assert_eq!(
            match_handle("@Alice.Example.COM"),
            Some("alice.example.com".to_string())
        );
        assert_eq!(
            match_handle("https://bsky.app/profile/bob.example.com?tab=posts"),
            Some("bob.example.com".to_string())
        );
        // A single label is not a handle.
        assert_eq!(match_handle("alice"), None);
        assert_eq!(match_handle("https://example.com/u/alice"), None);
    }

    #[tokio::test]
    async fn resolve_caches_bidirectionally() {
        let directory = Arc::new(StubDirectory::new(&[("alice.example.com", "did:plc:alice1")]));
        let mut resolver = AuthorResolver::new(directory.clone());

        let did = resolver.resolve("@alice.example.com").await.unwrap();
        assert_eq!(did.as_str(), "did:plc:alice1");
        assert_eq!(directory.lookup_count(), 1);

        // Second resolution of either spelling stays in the cache.
        resolver.resolve("alice.example.com").await.unwrap();
        assert_eq!(directory.lookup_count(), 1);
        assert_eq!(resolver.handle_for(&did), Some("alice.example.com"));

        // A literal identifier never touches the directory.
        let direct = resolver.resolve("did:plc:somebodyelse").await.unwrap();
        assert_eq!(direct.as_str(), "did:plc:somebodyelse");
        assert_eq!(directory.lookup_count(), 1);
    }

    #[tokio::test]
    async fn unknown_handles_and_junk_are_recoverable_errors() {
        let directory = Arc::new(StubDirectory::new(&[]));
        let mut resolver = AuthorResolver::new(directory);

        let err = resolver.resolve("ghost.example.com").await.unwrap_err();
        assert!(matches!(err, ResolveError::UnknownHandle(_)));
        let err = resolver.resolve("not an author at all").await.unwrap_err();
        assert!(matches!(err, ResolveError::Unrecognized(_)));
    }

    #[tokio::test]
    async fn persistent_cache_survives_resolver_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = dir.path().join("authors.json");
        let directory = Arc::new(StubDirectory::new(&[("alice.example.com", "did:plc:alice1")]));

        let mut resolver = AuthorResolver::new(directory.clone())
            .with_cache_file(&cache)
            .unwrap();
        resolver.resolve("alice.example.com").await.unwrap();
        resolver.save_cache().unwrap();
        assert_eq!(directory.lookup_count(), 1);

        let mut reloaded = AuthorResolver::new(directory.clone())
            .with_cache_file(&cache)
            .unwrap();
        reloaded.resolve("alice.example.com").await.unwrap();
        assert_eq!(directory.lookup_count(), 1, "reload should not re-resolve");
    }

    #[tokio::test]
    async fn reconcile_merges_duplicate_rows_and_fills_identity() {
        let store = MemoryStore::new();
        // Canonical row: has the identifier and two linked sites.
        store
            .seed(
                Table::Authors.id(),
                FieldMap::from([
                    (fields::DID.to_string(), Value::from("did:plc:alice1")),
                    (fields::SITES.to_string(), Value::Refs(vec![1, 2])),
                ]),
            )
            .await;
        // Duplicate keyed only by handle, with extra links and a contact note.
        store
            .seed(
                Table::Authors.id(),
                FieldMap::from([
                    (fields::HANDLE.to_string(), Value::from("alice.example.com")),
                    (fields::SITES.to_string(), Value::Refs(vec![2, 3])),
                    (fields::CONTACTED.to_string(), Value::Bool(true)),
                ]),
            )
            .await;

        let directory = Arc::new(StubDirectory::new(&[("alice.example.com", "did:plc:alice1")]));
        let mut resolver = AuthorResolver::new(directory);
        let summary = resolver.reconcile(&store).await.unwrap();

        assert_eq!(summary.groups_merged, 1);
        assert_eq!(summary.rows_deleted, 1);
        assert_eq!(summary.dids_filled, 1);

        let rows = store.list_records(Table::Authors.id()).await.unwrap();
        assert_eq!(rows.len(), 1, "duplicate row should be gone");
        let row = &rows[0];
        assert_eq!(row.fields[fields::DID], Value::from("did:plc:alice1"));
        assert_eq!(row.fields[fields::HANDLE], Value::from("alice.example.com"));
        assert_eq!(row.fields[fields::SITES], Value::Refs(vec![1, 2, 3]));
        assert_eq!(row.fields[fields::CONTACTED], Value::Bool(true));

        let did = Did::parse("did:plc:alice1").unwrap();
        assert_eq!(resolver.handle_for(&did), Some("alice.example.com"));
    }

    #[tokio::test]
    async fn reconcile_marks_unresolvable_handles_without_deleting() {
        let store = MemoryStore::new();
        store
            .seed(
                Table::Authors.id(),
                FieldMap::from([(fields::HANDLE.to_string(), Value::from("gone.example.com"))]),
            )
            .await;

        let directory = Arc::new(StubDirectory::new(&[]));
        let mut resolver = AuthorResolver::new(directory);
        let summary = resolver.reconcile(&store).await.unwrap();

        assert_eq!(summary.marked_invalid, 1);
        assert_eq!(summary.rows_deleted, 0);
        let rows = store.list_records(Table::Authors.id()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[fields::UNREACHABLE_DID], Value::Bool(true));
    }

    #[tokio::test]
    async fn reconcile_prefers_stored_identifier_then_recency() {
        let store = MemoryStore::new();
        store
            .seed(
                Table::Authors.id(),
                FieldMap::from([
                    (fields::HANDLE.to_string(), Value::from("alice.example.com")),
                    (fields::UPDATED_AT.to_string(), Value::Int(100)),
                    ("note".to_string(), Value::from("older")),
                ]),
            )
            .await;
        store
            .seed(
                Table::Authors.id(),
                FieldMap::from([
                    (fields::HANDLE.to_string(), Value::from("alice.example.com")),
                    (fields::UPDATED_AT.to_string(), Value::Int(200)),
                    ("note".to_string(), Value::from("newer")),
                ]),
            )
            .await;

        let directory = Arc::new(StubDirectory::new(&[("alice.example.com", "did:plc:alice1")]));
        let mut resolver = AuthorResolver::new(directory);
        resolver.reconcile(&store).await.unwrap();

        let rows = store.list_records(Table::Authors.id()).await.unwrap();
        assert_eq!(rows.len(), 1);
        // Scalars stay with the most recently updated (primary) row.
        assert_eq!(rows[0].fields["note"], Value::from("newer"));
    }
}
