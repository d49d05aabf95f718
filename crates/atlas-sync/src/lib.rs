//! Ingestion runs: per-source merge state, tag translation, enrichment and
//! the ordered write-back protocol against the shared record store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use atlas_core::{
    detect_forge, diff_fields, fields, is_stale, merge_fields, normalize_url, now_ts,
    source_field, union_into, Entry, FieldMap, Forge, NormalizeError, NormalizedUrl, Row, RowId,
    Table, Value,
};
use atlas_resolve::{AuthorResolver, Did, ReconcileSummary, ResolveError};
use atlas_storage::{column_ref, ColumnSpec, RecordStore, StoreError, UpsertRecord};

pub const CRATE_NAME: &str = "atlas-sync";

/// Pending-site slot holding literal tag text until the side-table
/// references are swapped in. Popped before the write; the literals live on
/// in the run summary's display rows.
pub const OG_TAGS: &str = "original_tags";

/// Rejected input. The offending entry is skipped or the run aborted at the
/// caller's discretion; nothing has been written either way.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Url(#[from] NormalizeError),
    /// A homepage substitution landed on a key that another substitution
    /// already touched. One hop is the limit.
    #[error("homepage substitution from {from} to {to} revisits a substituted key")]
    SubstitutionRevisit { from: String, to: String },
}

/// A run-level failure. State already written to the store stays written;
/// the watermark is only advanced after every entity write succeeded, so a
/// failed run is retried from the same feed position.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("no Data_Sources row named {0:?}")]
    UnknownSource(String),
    #[error("site {0} was not assigned an identifier by the store")]
    MissingSite(String),
}

/// Engine knobs, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrent enrichment fetches.
    pub enrich_concurrency: usize,
    /// Age in days after which cached enrichment data is re-fetched.
    pub stale_days: f64,
    /// Optional path for the persistent resolver cache.
    pub resolver_cache: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enrich_concurrency: 8,
            stale_days: 2.0,
            resolver_cache: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enrich_concurrency: std::env::var("ATLAS_ENRICH_CONCURRENCY")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.enrich_concurrency),
            stale_days: std::env::var("ATLAS_STALE_DAYS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.stale_days),
            resolver_cache: std::env::var("ATLAS_RESOLVER_CACHE").ok().map(PathBuf::from),
        }
    }
}

/// Tags a source declares up front: plain literals, or literals with
/// descriptive fields for the side table.
#[derive(Debug, Clone)]
pub enum TagSpec {
    Plain(BTreeSet<String>),
    WithFields(BTreeMap<String, FieldMap>),
}

/// Per-run settings a source adapter hands to [`Aggregator::start`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Name of this source's row in the `Data_Sources` table.
    pub source_name: String,
    /// Unprefixed field names this source writes. Each lands in its own
    /// `{source}_{field}` column; names starting with `_` stay out of the
    /// summary's display rows.
    pub fields: Vec<String>,
    /// Tags known before ingestion. Sources that only discover tags while
    /// ingesting leave this unset and the side table is settled at the end.
    pub tags: Option<TagSpec>,
    /// Recognize forge repository URLs among plain site entries.
    pub detect_repos: bool,
    /// The feed's reported change timestamp, when the source has one.
    pub feed_timestamp: Option<i64>,
}

impl RunOptions {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            fields: default_fields(),
            tags: None,
            detect_repos: false,
            feed_timestamp: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_tags(mut self, tags: TagSpec) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_detect_repos(mut self) -> Self {
        self.detect_repos = true;
        self
    }

    pub fn with_feed_timestamp(mut self, feed_timestamp: i64) -> Self {
        self.feed_timestamp = Some(feed_timestamp);
        self
    }
}

/// The aggregated fields every source gets unless it declares its own.
pub fn default_fields() -> Vec<String> {
    [fields::NAME, fields::DESCRIPTION, fields::TAGS, fields::RATING]
        .map(str::to_owned)
        .to_vec()
}

/// Fetches page metadata for a site. Results land in the site's `site_meta`
/// cell under [`slot`](SiteMetaFetcher::slot), so fetchers with different
/// slots coexist on one row.
#[async_trait]
pub trait SiteMetaFetcher: Send + Sync {
    fn slot(&self) -> &'static str {
        "site"
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<FieldMap>;
}

/// Polls forge metadata for a repository.
#[async_trait]
pub trait RepoMetaFetcher: Send + Sync {
    async fn fetch(&self, repo: &NormalizedUrl, forge: Forge) -> anyhow::Result<FieldMap>;
}

/// Polls profile fields for an author.
#[async_trait]
pub trait AuthorProfileFetcher: Send + Sync {
    async fn fetch(&self, did: &Did) -> anyhow::Result<FieldMap>;
}

/// Optional enrichment collaborators; any subset may be present.
#[derive(Clone, Default)]
pub struct EnrichmentHooks {
    pub site_meta: Option<Arc<dyn SiteMetaFetcher>>,
    pub repo_meta: Option<Arc<dyn RepoMetaFetcher>>,
    pub author_profiles: Option<Arc<dyn AuthorProfileFetcher>>,
}

/// What [`Aggregator::start`] settles on: the fast no-op, or a live
/// aggregator ready for ingestion.
pub enum RunStart {
    /// The feed's timestamp equals the stored watermark; nothing to do.
    NoChange { source: String, watermark: i64 },
    Ready(Box<Aggregator>),
}

/// What one ingestion call settled on, after redirects and homepage
/// substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    /// Effective display URL.
    pub url: String,
    /// Business key the entry was merged under.
    pub key: NormalizedUrl,
}

/// Write counts for one entity table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableOutcome {
    pub written: usize,
    pub unchanged: usize,
    /// Business keys of stored rows carrying this source in their provenance
    /// that produced no pending record this run. Flagged for review, never
    /// deleted.
    pub missing: Vec<String>,
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries_ingested: usize,
    pub sites: TableOutcome,
    pub repos: TableOutcome,
    pub authors: TableOutcome,
    /// The watermark written back, when the run advanced it.
    pub watermark: Option<i64>,
    /// Display rows for the written sites: effective URL, original tag
    /// literals and the declared non-hidden fields.
    pub site_rows: Vec<FieldMap>,
}

/// One ingestion run. Construct with [`start`](Self::start), feed entries
/// through [`add_entry`](Self::add_entry), then settle with
/// [`finish`](Self::finish). Finishing consumes the aggregator, so a run
/// cannot write twice.
pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    options: RunOptions,
    resolver: Option<AuthorResolver>,
    hooks: EnrichmentHooks,
    span: tracing::Span,

    run_id: Uuid,
    started_at: DateTime<Utc>,
    source_id: RowId,
    source_label: String,
    new_watermark: Option<i64>,

    stored_sites: BTreeMap<NormalizedUrl, Row>,
    stored_repos: BTreeMap<NormalizedUrl, Row>,
    stored_authors: BTreeMap<Did, Row>,
    redirects: BTreeMap<NormalizedUrl, NormalizedUrl>,

    pending_sites: BTreeMap<NormalizedUrl, FieldMap>,
    pending_repos: BTreeMap<NormalizedUrl, FieldMap>,
    pending_authors: BTreeMap<Did, FieldMap>,
    /// Homepage substitutions made this run, repository key to homepage key.
    substitutions: BTreeMap<NormalizedUrl, NormalizedUrl>,

    tags_key: BTreeMap<String, RowId>,
    deferred_tags: BTreeSet<String>,
    entries_ingested: usize,
}

impl Aggregator {
    /// Opens a run: looks up the source row, compares the feed timestamp
    /// against the stored watermark and loads the table snapshots. Author
    /// linking is on exactly when a resolver is supplied; reconciliation
    /// runs before the snapshot is taken so each identifier maps to one row.
    pub async fn start(
        store: Arc<dyn RecordStore>,
        config: EngineConfig,
        options: RunOptions,
        resolver: Option<AuthorResolver>,
    ) -> Result<RunStart, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = %options.source_name);
        let run_span = span.clone();
        Self::open(store, config, options, resolver, run_id, span)
            .instrument(run_span)
            .await
    }

    async fn open(
        store: Arc<dyn RecordStore>,
        config: EngineConfig,
        options: RunOptions,
        mut resolver: Option<AuthorResolver>,
        run_id: Uuid,
        span: tracing::Span,
    ) -> Result<RunStart, RunError> {
        let started_at = Utc::now();
        let source_row = store
            .list_records(Table::Sources.id())
            .await?
            .into_iter()
            .find(|row| {
                row.fields.get(fields::SOURCE_NAME).and_then(Value::as_str)
                    == Some(options.source_name.as_str())
            })
            .ok_or_else(|| RunError::UnknownSource(options.source_name.clone()))?;
        let watermark = source_row
            .fields
            .get(fields::LAST_UPDATE)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if let Some(feed_ts) = options.feed_timestamp {
            if feed_ts == watermark {
                info!(watermark, "feed unchanged since the last run");
                return Ok(RunStart::NoChange {
                    source: options.source_name,
                    watermark,
                });
            }
        }
        let new_watermark = options.feed_timestamp;
        let source_label = source_row
            .fields
            .get(fields::LABEL)
            .and_then(Value::as_str)
            .unwrap_or(&options.source_name)
            .to_owned();

        if let Some(resolver) = resolver.as_mut() {
            let outcome = resolver.reconcile(store.as_ref()).await?;
            if outcome != ReconcileSummary::default() {
                info!(
                    merged = outcome.groups_merged,
                    deleted = outcome.rows_deleted,
                    handles_filled = outcome.handles_filled,
                    "author reconciliation corrected stored rows"
                );
            }
        }

        let mut stored_sites = BTreeMap::new();
        let mut stored_repos = BTreeMap::new();
        let mut redirects = BTreeMap::new();
        for row in store.list_records(Table::Sites.id()).await? {
            index_row(Table::Sites, row, &mut stored_sites, &mut redirects);
        }
        for row in store.list_records(Table::Repos.id()).await? {
            index_row(Table::Repos, row, &mut stored_repos, &mut redirects);
        }
        let mut stored_authors = BTreeMap::new();
        if resolver.is_some() {
            for row in store.list_records(Table::Authors.id()).await? {
                let did = row
                    .fields
                    .get(fields::DID)
                    .and_then(Value::as_str)
                    .and_then(Did::parse);
                match did {
                    Some(did) => {
                        stored_authors.insert(did, row);
                    }
                    None => debug!(row_id = row.id, "author row without a parseable identifier"),
                }
            }
        }
        info!(
            sites = stored_sites.len(),
            repos = stored_repos.len(),
            authors = stored_authors.len(),
            redirects = redirects.len(),
            "snapshot loaded"
        );

        let mut aggregator = Aggregator {
            store,
            config,
            options,
            resolver,
            hooks: EnrichmentHooks::default(),
            span,
            run_id,
            started_at,
            source_id: source_row.id,
            source_label,
            new_watermark,
            stored_sites,
            stored_repos,
            stored_authors,
            redirects,
            pending_sites: BTreeMap::new(),
            pending_repos: BTreeMap::new(),
            pending_authors: BTreeMap::new(),
            substitutions: BTreeMap::new(),
            tags_key: BTreeMap::new(),
            deferred_tags: BTreeSet::new(),
            entries_ingested: 0,
        };
        if let Some(tags) = aggregator.options.tags.clone() {
            aggregator.make_tag_key(&tags).await?;
        }
        Ok(RunStart::Ready(Box::new(aggregator)))
    }

    /// Attaches enrichment collaborators. Entities past the staleness
    /// threshold get re-fetched during [`finish`](Self::finish).
    pub fn with_hooks(mut self, hooks: EnrichmentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Merges one raw entry into the pending state. Purely in-memory;
    /// nothing reaches the store until [`finish`](Self::finish).
    pub async fn add_entry(&mut self, entry: impl Into<Entry>) -> Result<Ingested, IngestError> {
        let span = self.span.clone();
        self.ingest(entry.into()).instrument(span).await
    }

    async fn ingest(&mut self, entry: Entry) -> Result<Ingested, IngestError> {
        let mut key = normalize_url(&entry.url)?;
        let mut display = entry.url.clone();
        if let Some(target) = self.redirects.get(&key) {
            debug!(from = %key, to = %target, "alternate spelling redirected");
            display = target.as_str().to_owned();
            key = target.clone();
        }

        if let Some(repo) = &entry.repo {
            let (substituted, effective) = self.link_repo(repo, key)?;
            if let Some(home) = substituted {
                display = home;
            }
            key = effective;
        }
        if self.options.detect_repos {
            if let Some((_, repo_key)) = detect_forge(&key) {
                let raw = repo_key.as_str().to_owned();
                let (substituted, effective) = self.link_repo(&raw, repo_key)?;
                if let Some(home) = substituted {
                    display = home;
                }
                key = effective;
            }
        }

        if let Some(author) = &entry.author {
            self.link_author(author, &key).await;
        }

        let mut fresh = FieldMap::new();
        fresh.insert(fields::URL.to_owned(), Value::from(display.clone()));
        if !entry.tags.is_empty() {
            if self.tags_key.is_empty() {
                self.deferred_tags.extend(entry.tags.iter().cloned());
            } else {
                fresh.insert(self.tags_table(), Value::Refs(self.translate_tags(&entry.tags)));
            }
            fresh.insert(OG_TAGS.to_owned(), Value::List(entry.tags.clone()));
        }
        if let Some(name) = &entry.name {
            fresh.insert(self.prefixed(fields::NAME), Value::from(name.clone()));
        }
        if let Some(description) = &entry.description {
            fresh.insert(
                self.prefixed(fields::DESCRIPTION),
                Value::from(description.clone()),
            );
        }
        if let Some(rating) = entry.rating {
            fresh.insert(self.prefixed(fields::RATING), Value::Float(rating));
        }
        if !entry.lexicons.is_empty() {
            fresh.insert(fields::LEXICONS.to_owned(), Value::Refs(entry.lexicons.clone()));
        }
        for (field, value) in &entry.extra {
            fresh.insert(self.prefixed(field), value.clone());
        }

        self.entries_ingested += 1;
        if let Some(existing) = self.pending_sites.get_mut(&key) {
            debug!(site = %key, "repeat sighting in one run, merging");
            for field in merge_fields(existing, fresh) {
                warn!(site = %key, field = %field, "later entry overrode an earlier value");
            }
            return Ok(Ingested { url: display, key });
        }
        fresh.insert(
            fields::SOURCES.to_owned(),
            provenance(self.source_id, self.stored_sites.get(&key)),
        );
        self.pending_sites.insert(key.clone(), fresh);
        Ok(Ingested { url: display, key })
    }

    /// Mutable view of a pending site's fields, for adapters that attach
    /// extra data after ingestion returns.
    pub fn pending_site_mut(&mut self, key: &NormalizedUrl) -> Option<&mut FieldMap> {
        self.pending_sites.get_mut(key)
    }

    /// Settles the run: deferred tags, enrichment, per-table diffs and the
    /// ordered writes, watermark last.
    pub async fn finish(self) -> Result<RunSummary, RunError> {
        let span = self.span.clone();
        self.settle().instrument(span).await
    }

    async fn settle(mut self) -> Result<RunSummary, RunError> {
        if !self.deferred_tags.is_empty() {
            let deferred = TagSpec::Plain(std::mem::take(&mut self.deferred_tags));
            self.make_tag_key(&deferred).await?;
        }
        let og_tags = self.apply_tags_key();

        self.enrich_sites().await;
        self.enrich_repos().await;
        self.enrich_authors().await;

        self.ensure_site_columns().await?;

        let mut site_outcome = TableOutcome::default();
        let mut site_upserts = Vec::new();
        let mut written_sites = BTreeSet::new();
        let empty = FieldMap::new();
        for (key, pending) in &self.pending_sites {
            let stored = self
                .stored_sites
                .get(key)
                .map(|row| &row.fields)
                .unwrap_or(&empty);
            let diff = diff_fields(stored, pending);
            if diff.is_empty() {
                site_outcome.unchanged += 1;
                continue;
            }
            site_outcome.written += 1;
            written_sites.insert(key.clone());
            site_upserts.push(UpsertRecord::keyed(fields::NORMALIZED_URL, key.as_str(), diff));
        }
        site_outcome.missing = flag_missing(
            Table::Sites,
            self.source_id,
            &self.stored_sites,
            &self.pending_sites,
        );
        self.store
            .add_update_records(Table::Sites.id(), site_upserts)
            .await?;

        // The store assigns identifiers on insert without echoing them, so
        // the table is re-read to learn them before references are written.
        let mut site_ids: BTreeMap<String, RowId> = BTreeMap::new();
        for row in self.store.list_records(Table::Sites.id()).await? {
            if let Some(key) = row.fields.get(fields::NORMALIZED_URL).and_then(Value::as_str) {
                site_ids.insert(key.to_owned(), row.id);
            }
        }
        translate_linked_sites(&mut self.pending_repos, &self.stored_repos, &site_ids)?;
        translate_linked_sites(&mut self.pending_authors, &self.stored_authors, &site_ids)?;

        let (mut repo_outcome, repo_upserts) =
            diff_table(fields::NORMALIZED_URL, &self.stored_repos, &self.pending_repos);
        repo_outcome.missing = flag_missing(
            Table::Repos,
            self.source_id,
            &self.stored_repos,
            &self.pending_repos,
        );
        self.store
            .add_update_records(Table::Repos.id(), repo_upserts)
            .await?;

        let (mut author_outcome, author_upserts) =
            diff_table(fields::DID, &self.stored_authors, &self.pending_authors);
        author_outcome.missing = flag_missing(
            Table::Authors,
            self.source_id,
            &self.stored_authors,
            &self.pending_authors,
        );
        self.store
            .add_update_records(Table::Authors.id(), author_upserts)
            .await?;

        if let Some(watermark) = self.new_watermark {
            self.store
                .add_update_records(
                    Table::Sources.id(),
                    vec![UpsertRecord::keyed(
                        fields::SOURCE_NAME,
                        self.options.source_name.as_str(),
                        FieldMap::from([(fields::LAST_UPDATE.to_owned(), Value::Int(watermark))]),
                    )],
                )
                .await?;
        }
        if let Some(resolver) = &self.resolver {
            if let Err(err) = resolver.save_cache() {
                warn!(%err, "resolver cache save failed");
            }
        }

        let site_rows = self.display_rows(&written_sites, &og_tags);
        info!(
            entries = self.entries_ingested,
            sites_written = site_outcome.written,
            repos_written = repo_outcome.written,
            authors_written = author_outcome.written,
            "run complete"
        );
        Ok(RunSummary {
            run_id: self.run_id,
            source_name: self.options.source_name.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            entries_ingested: self.entries_ingested,
            sites: site_outcome,
            repos: repo_outcome,
            authors: author_outcome,
            watermark: self.new_watermark,
            site_rows,
        })
    }

    /// Upserts the pending Repo for a repository reference and links the
    /// site to it. When the site is the repository itself and that
    /// repository has a recorded homepage, the homepage becomes the
    /// effective site identity. One hop only; a second hop is an error.
    fn link_repo(
        &mut self,
        repo_raw: &str,
        site_key: NormalizedUrl,
    ) -> Result<(Option<String>, NormalizedUrl), IngestError> {
        let mut repo_key = normalize_url(repo_raw)?;
        if let Some(target) = self.redirects.get(&repo_key) {
            repo_key = target.clone();
        }

        let mut substituted = None;
        let mut effective = site_key;
        if effective == repo_key {
            if let Some((home_display, home_key)) = self.stored_homepage(&repo_key) {
                self.record_substitution(&repo_key, &home_key)?;
                info!(repo = %repo_key, home = %home_key, "repository entry mapped to its homepage");
                substituted = Some(home_display);
                effective = home_key;
            }
        }

        let site_text = effective.as_str().to_owned();
        if let Some(pending) = self.pending_repos.get_mut(&repo_key) {
            if let Some(Value::List(sites)) = pending.get_mut(fields::SITES) {
                if !sites.contains(&site_text) {
                    sites.push(site_text);
                }
            }
            return Ok((substituted, effective));
        }
        let mut pending = FieldMap::from([
            (fields::URL.to_owned(), Value::from(repo_raw)),
            (fields::SITES.to_owned(), Value::List(vec![site_text])),
            (
                fields::SOURCES.to_owned(),
                provenance(self.source_id, self.stored_repos.get(&repo_key)),
            ),
        ]);
        if let Some((forge, _)) = detect_forge(&repo_key) {
            pending.insert(fields::FORGE_TYPE.to_owned(), Value::from(forge.as_str()));
        }
        self.pending_repos.insert(repo_key, pending);
        Ok((substituted, effective))
    }

    /// The recorded homepage of a stored repo, as (display, key), when both
    /// spellings are present and the normalized one still parses.
    fn stored_homepage(&self, repo_key: &NormalizedUrl) -> Option<(String, NormalizedUrl)> {
        let stored = self.stored_repos.get(repo_key)?;
        let display = stored.fields.get(fields::HOMEPAGE).and_then(Value::as_str)?;
        let normal = stored
            .fields
            .get(fields::NORMALIZED_HOMEPAGE)
            .and_then(Value::as_str)?;
        match normalize_url(normal) {
            Ok(key) => Some((display.to_owned(), key)),
            Err(err) => {
                warn!(repo = %repo_key, %err, "stored homepage does not normalize, ignoring");
                None
            }
        }
    }

    /// Remembers a substitution, rejecting anything that would chain hops.
    /// A repository whose homepage is itself moves nothing and is never
    /// recorded. Repeating the identical pair is fine, as are distinct
    /// repositories sharing one homepage.
    fn record_substitution(
        &mut self,
        from: &NormalizedUrl,
        to: &NormalizedUrl,
    ) -> Result<(), IngestError> {
        if from == to || self.substitutions.get(from) == Some(to) {
            return Ok(());
        }
        let revisits = self.substitutions.contains_key(from)
            || self.substitutions.contains_key(to)
            || self.substitutions.values().any(|target| target == from);
        if revisits {
            return Err(IngestError::SubstitutionRevisit {
                from: from.as_str().to_owned(),
                to: to.as_str().to_owned(),
            });
        }
        self.substitutions.insert(from.clone(), to.clone());
        Ok(())
    }

    /// Resolves an author reference and links the site under the resolved
    /// identifier. Resolution failures are logged and never block ingestion.
    async fn link_author(&mut self, reference: &str, site_key: &NormalizedUrl) {
        let Some(resolver) = self.resolver.as_mut() else {
            debug!(reference, "author linking disabled, reference ignored");
            return;
        };
        let did = match resolver.resolve(reference).await {
            Ok(did) => did,
            Err(err) => {
                warn!(reference, site = %site_key, %err, "author reference did not resolve");
                return;
            }
        };
        let handle = resolver.handle_for(&did).map(str::to_owned);

        let site_text = site_key.as_str().to_owned();
        if let Some(pending) = self.pending_authors.get_mut(&did) {
            if let Some(Value::List(sites)) = pending.get_mut(fields::SITES) {
                if !sites.contains(&site_text) {
                    sites.push(site_text);
                }
            }
            return;
        }
        let mut pending = FieldMap::from([
            (fields::SITES.to_owned(), Value::List(vec![site_text])),
            (
                fields::SOURCES.to_owned(),
                provenance(self.source_id, self.stored_authors.get(&did)),
            ),
        ]);
        if let Some(handle) = handle {
            pending.insert(fields::HANDLE.to_owned(), Value::from(handle));
        }
        self.pending_authors.insert(did, pending);
    }

    fn prefixed(&self, field: &str) -> String {
        source_field(&self.options.source_name, field)
    }

    /// Name of this source's tag side table; also the Sites column that
    /// references it.
    fn tags_table(&self) -> String {
        self.prefixed(fields::TAGS)
    }

    fn translate_tags(&self, literals: &[String]) -> Vec<RowId> {
        let mut refs = Vec::with_capacity(literals.len());
        for tag in literals {
            match self.tags_key.get(tag) {
                Some(id) => refs.push(*id),
                None => warn!(%tag, "literal tag missing from the side table, dropped"),
            }
        }
        refs
    }

    /// Creates or reconciles the side table holding this source's tags,
    /// then learns the literal-to-identifier key by re-reading it.
    async fn make_tag_key(&mut self, tags: &TagSpec) -> Result<(), StoreError> {
        let table = self.tags_table();
        let (columns, records) = match tags {
            TagSpec::Plain(literals) => (
                vec![ColumnSpec::labeled(fields::TAG, fields::TAG)],
                literals
                    .iter()
                    .map(|tag| UpsertRecord::keyed(fields::TAG, tag.as_str(), FieldMap::new()))
                    .collect::<Vec<_>>(),
            ),
            TagSpec::WithFields(tagged) => {
                let mut ids = BTreeSet::from([fields::TAG.to_owned()]);
                for metadata in tagged.values() {
                    ids.extend(metadata.keys().cloned());
                }
                (
                    ids.iter().map(|id| ColumnSpec::labeled(id, id)).collect(),
                    tagged
                        .iter()
                        .map(|(tag, metadata)| {
                            UpsertRecord::keyed(fields::TAG, tag.as_str(), metadata.clone())
                        })
                        .collect(),
                )
            }
        };

        let existing = self.store.list_tables().await?;
        if existing.iter().any(|name| name == &table) {
            self.store.add_update_columns(&table, columns, false).await?;
        } else {
            info!(%table, "creating tag side table");
            self.store.add_table(&table, columns).await?;
        }
        self.store.add_update_records(&table, records).await?;

        self.tags_key.clear();
        for row in self.store.list_records(&table).await? {
            if let Some(tag) = row.fields.get(fields::TAG).and_then(Value::as_str) {
                self.tags_key.insert(tag.to_owned(), row.id);
            }
        }
        Ok(())
    }

    /// Swaps literal tags for side-table references on every pending site,
    /// returning the popped literals for the display rows.
    fn apply_tags_key(&mut self) -> BTreeMap<NormalizedUrl, Vec<String>> {
        let mut og_tags = BTreeMap::new();
        let column = self.tags_table();
        for (key, pending) in &mut self.pending_sites {
            let Some(Value::List(literals)) = pending.remove(OG_TAGS) else {
                continue;
            };
            let mut refs = Vec::with_capacity(literals.len());
            for tag in &literals {
                match self.tags_key.get(tag) {
                    Some(id) => refs.push(*id),
                    None => warn!(site = %key, %tag, "literal tag missing from the side table, dropped"),
                }
            }
            pending.insert(column.clone(), Value::Refs(refs));
            og_tags.insert(key.clone(), literals);
        }
        og_tags
    }

    /// Fetches page metadata for pending sites whose cached slot is stale,
    /// capped by the concurrency limit. Failures land in the slot as an
    /// error marker; `last_polled` is stamped either way so the gate moves.
    async fn enrich_sites(&mut self) {
        let Some(fetcher) = self.hooks.site_meta.clone() else {
            return;
        };
        let slot = fetcher.slot();
        let limit = Arc::new(Semaphore::new(self.config.enrich_concurrency.max(1)));
        let mut jobs: Vec<BoxFuture<'static, (NormalizedUrl, anyhow::Result<FieldMap>)>> =
            Vec::new();
        for (key, pending) in &self.pending_sites {
            let stored_meta = self
                .stored_sites
                .get(key)
                .and_then(|row| row.fields.get(fields::SITE_META));
            if !meta_slot_stale(stored_meta, slot, self.config.stale_days) {
                continue;
            }
            let url = pending
                .get(fields::URL)
                .and_then(Value::as_str)
                .unwrap_or(key.as_str())
                .to_owned();
            let key = key.clone();
            let fetcher = fetcher.clone();
            let limit = limit.clone();
            jobs.push(Box::pin(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                let outcome = fetcher.fetch(&url).await;
                (key, outcome)
            }));
        }
        for (key, outcome) in futures::future::join_all(jobs).await {
            let mut slot_fields = match outcome {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(site = %key, %err, "site metadata fetch failed");
                    FieldMap::from([(fields::ERROR.to_owned(), Value::from(err.to_string()))])
                }
            };
            slot_fields.insert(fields::LAST_POLLED.to_owned(), Value::Int(now_ts()));
            let mut meta = match self
                .stored_sites
                .get(&key)
                .and_then(|row| row.fields.get(fields::SITE_META))
            {
                Some(Value::Map(existing)) => existing.clone(),
                _ => FieldMap::new(),
            };
            meta.insert(slot.to_owned(), Value::Map(slot_fields));
            if let Some(pending) = self.pending_sites.get_mut(&key) {
                pending.insert(fields::SITE_META.to_owned(), Value::Map(meta));
            }
        }
    }

    /// Polls forge metadata for pending repos on recognized forges whose
    /// stored row is stale.
    async fn enrich_repos(&mut self) {
        let Some(fetcher) = self.hooks.repo_meta.clone() else {
            return;
        };
        let limit = Arc::new(Semaphore::new(self.config.enrich_concurrency.max(1)));
        let mut jobs: Vec<BoxFuture<'static, (NormalizedUrl, anyhow::Result<FieldMap>)>> =
            Vec::new();
        for key in self.pending_repos.keys() {
            let Some((forge, _)) = detect_forge(key) else {
                continue;
            };
            let last_polled = self
                .stored_repos
                .get(key)
                .and_then(|row| row.fields.get(fields::LAST_POLLED))
                .and_then(Value::as_f64)
                .map(|ts| ts as i64);
            if !is_stale(last_polled, self.config.stale_days) {
                continue;
            }
            let key = key.clone();
            let fetcher = fetcher.clone();
            let limit = limit.clone();
            jobs.push(Box::pin(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                let outcome = fetcher.fetch(&key, forge).await;
                (key, outcome)
            }));
        }
        for (key, outcome) in futures::future::join_all(jobs).await {
            let fetched = match outcome {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(repo = %key, %err, "repository metadata fetch failed");
                    FieldMap::from([(fields::ERROR.to_owned(), Value::from(err.to_string()))])
                }
            };
            if let Some(pending) = self.pending_repos.get_mut(&key) {
                pending.extend(fetched);
                pending.insert(fields::LAST_POLLED.to_owned(), Value::Int(now_ts()));
            }
        }
    }

    /// Polls profile fields for pending authors whose stored row is stale.
    async fn enrich_authors(&mut self) {
        let Some(fetcher) = self.hooks.author_profiles.clone() else {
            return;
        };
        let limit = Arc::new(Semaphore::new(self.config.enrich_concurrency.max(1)));
        let mut jobs: Vec<BoxFuture<'static, (Did, anyhow::Result<FieldMap>)>> = Vec::new();
        for did in self.pending_authors.keys() {
            let last_polled = self
                .stored_authors
                .get(did)
                .and_then(|row| row.fields.get(fields::LAST_POLLED))
                .and_then(Value::as_f64)
                .map(|ts| ts as i64);
            if !is_stale(last_polled, self.config.stale_days) {
                continue;
            }
            let did = did.clone();
            let fetcher = fetcher.clone();
            let limit = limit.clone();
            jobs.push(Box::pin(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                let outcome = fetcher.fetch(&did).await;
                (did, outcome)
            }));
        }
        for (did, outcome) in futures::future::join_all(jobs).await {
            let fetched = match outcome {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(author = %did, %err, "author profile fetch failed");
                    FieldMap::from([(fields::ERROR.to_owned(), Value::from(err.to_string()))])
                }
            };
            if let Some(pending) = self.pending_authors.get_mut(&did) {
                pending.extend(fetched);
                pending.insert(fields::LAST_POLLED.to_owned(), Value::Int(now_ts()));
            }
        }
    }

    /// Creates or relabels this source's declared Site columns before the
    /// first write. The tags column is a reference list displaying through
    /// the side table's `Tag` column.
    async fn ensure_site_columns(&self) -> Result<(), StoreError> {
        if self.options.fields.is_empty() {
            return Ok(());
        }
        let mut columns = Vec::new();
        for field in &self.options.fields {
            let id = self.prefixed(field);
            let label = format!("{} {field}", self.source_label);
            if field == fields::TAGS {
                if self.tags_key.is_empty() {
                    continue;
                }
                let visible = column_ref(self.store.as_ref(), &id, fields::TAG).await?;
                columns.push(ColumnSpec::ref_list(&id, &label, &id, visible));
            } else if field == fields::RATING {
                columns.push(ColumnSpec::numeric(&id, &label));
            } else {
                columns.push(ColumnSpec::labeled(&id, &label));
            }
        }
        if columns.is_empty() {
            return Ok(());
        }
        self.store
            .add_update_columns(Table::Sites.id(), columns, true)
            .await
    }

    /// Display rows for the written sites: effective URL, original tag
    /// literals and every declared non-hidden field.
    fn display_rows(
        &self,
        written: &BTreeSet<NormalizedUrl>,
        og_tags: &BTreeMap<NormalizedUrl, Vec<String>>,
    ) -> Vec<FieldMap> {
        let mut rows = Vec::with_capacity(written.len());
        for key in written {
            let Some(pending) = self.pending_sites.get(key) else {
                continue;
            };
            let mut row = FieldMap::new();
            if let Some(url) = pending.get(fields::URL) {
                row.insert(fields::URL.to_owned(), url.clone());
            }
            if let Some(literals) = og_tags.get(key) {
                row.insert(OG_TAGS.to_owned(), Value::List(literals.clone()));
            }
            for field in &self.options.fields {
                if field.starts_with('_') || field == fields::TAGS {
                    continue;
                }
                let column = self.prefixed(field);
                if let Some(value) = pending.get(&column) {
                    row.insert(column, value.clone());
                }
            }
            rows.push(row);
        }
        rows
    }
}

/// Indexes one stored row under its normalized key and folds its alternate
/// spellings into the redirect map. Rows without a usable key are skipped.
fn index_row(
    table: Table,
    row: Row,
    keyed: &mut BTreeMap<NormalizedUrl, Row>,
    redirects: &mut BTreeMap<NormalizedUrl, NormalizedUrl>,
) {
    let key = match row.fields.get(fields::NORMALIZED_URL).and_then(Value::as_str) {
        Some(text) => match normalize_url(text) {
            Ok(key) => key,
            Err(err) => {
                warn!(%table, row_id = row.id, %err, "stored key does not normalize, row skipped");
                return;
            }
        },
        None => {
            warn!(%table, row_id = row.id, "stored row has no normalized key, row skipped");
            return;
        }
    };
    if let Some(lines) = row.fields.get(fields::ALT_URLS).and_then(Value::as_str) {
        for line in lines.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let alt = match normalize_url(line) {
                Ok(alt) => alt,
                Err(err) => {
                    warn!(%table, row_id = row.id, line, %err, "alternate spelling does not normalize");
                    continue;
                }
            };
            if alt == key {
                continue;
            }
            if let Some(previous) = redirects.insert(alt.clone(), key.clone()) {
                if previous != key {
                    warn!(%alt, old = %previous, new = %key, "conflicting alternate spelling, last row wins");
                }
            }
        }
    }
    keyed.insert(key, row);
}

/// Stored provenance references plus the current source, deduplicated.
fn provenance(source_id: RowId, stored: Option<&Row>) -> Value {
    let mut refs = stored
        .and_then(|row| row.fields.get(fields::SOURCES))
        .and_then(Value::as_refs)
        .map(<[RowId]>::to_vec)
        .unwrap_or_default();
    if !refs.contains(&source_id) {
        refs.push(source_id);
    }
    Value::Refs(refs)
}

/// Whether the cached metadata slot is due for a re-fetch.
fn meta_slot_stale(stored_meta: Option<&Value>, slot: &str, stale_days: f64) -> bool {
    let last_polled = match stored_meta {
        Some(Value::Map(meta)) => match meta.get(slot) {
            Some(Value::Map(entry)) => entry
                .get(fields::LAST_POLLED)
                .and_then(Value::as_f64)
                .map(|ts| ts as i64),
            _ => None,
        },
        _ => None,
    };
    is_stale(last_polled, stale_days)
}

/// Swaps each pending record's linked-sites list from business-key form to
/// assigned-identifier form, merged after the identifiers the stored row
/// already carries.
fn translate_linked_sites<K: Ord>(
    pending: &mut BTreeMap<K, FieldMap>,
    stored: &BTreeMap<K, Row>,
    site_ids: &BTreeMap<String, RowId>,
) -> Result<(), RunError> {
    for (key, record) in pending.iter_mut() {
        let Some(Value::List(urls)) = record.get(fields::SITES) else {
            continue;
        };
        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            let id = site_ids
                .get(url)
                .ok_or_else(|| RunError::MissingSite(url.clone()))?;
            ids.push(*id);
        }
        let mut refs = stored
            .get(key)
            .and_then(|row| row.fields.get(fields::SITES))
            .and_then(Value::as_refs)
            .map(<[RowId]>::to_vec)
            .unwrap_or_default();
        union_into(&mut refs, ids);
        record.insert(fields::SITES.to_owned(), Value::Refs(refs));
    }
    Ok(())
}

/// Diffs every pending record against its snapshot, keeping only records
/// with something new to say.
fn diff_table<K: Ord + fmt::Display>(
    key_field: &str,
    stored: &BTreeMap<K, Row>,
    pending: &BTreeMap<K, FieldMap>,
) -> (TableOutcome, Vec<UpsertRecord>) {
    let empty = FieldMap::new();
    let mut outcome = TableOutcome::default();
    let mut upserts = Vec::new();
    for (key, record) in pending {
        let snapshot = stored.get(key).map(|row| &row.fields).unwrap_or(&empty);
        let diff = diff_fields(snapshot, record);
        if diff.is_empty() {
            outcome.unchanged += 1;
            continue;
        }
        outcome.written += 1;
        upserts.push(UpsertRecord::keyed(key_field, key.to_string(), diff));
    }
    (outcome, upserts)
}

/// Stored rows carrying this source in their provenance that produced no
/// pending record this run. Rows are flagged, never deleted; an empty run
/// flags nothing.
fn flag_missing<K: Ord + fmt::Display>(
    table: Table,
    source_id: RowId,
    stored: &BTreeMap<K, Row>,
    pending: &BTreeMap<K, FieldMap>,
) -> Vec<String> {
    if pending.is_empty() {
        return Vec::new();
    }
    let mut missing = Vec::new();
    for (key, row) in stored {
        let from_source = row
            .fields
            .get(fields::SOURCES)
            .and_then(Value::as_refs)
            .is_some_and(|refs| refs.contains(&source_id));
        if from_source && !pending.contains_key(key) {
            missing.push(key.to_string());
        }
    }
    if !missing.is_empty() {
        warn!(%table, keys = ?missing, "stored rows no longer present in this source");
    }
    missing
}
