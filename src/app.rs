use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ResolvedConfig, default_workers};
use crate::convert::{Artifact, convert, read_artifact};
use crate::coordinator::{Cancellation, FetchCoordinator, Ticket};
use crate::domain::{
    CanonicalKey, ConversionPlan, DataType, LocalFormat, VersionSpec, conversion_plan,
};
use crate::error::TaigaError;
use crate::index::{CacheEntry, LocalIndex, Representation};
use crate::reference::StructuredReference;
use crate::remote::{ByteFetcher, DatafileMetadata, MetadataResolver, expected_sha256};
use crate::resolve::{Notice, OfflineState, Resolution, Resolver};
use crate::store::{Store, remove_if_exists, sha256_file};

#[derive(Debug, Clone, Copy)]
pub struct AppSettings {
    /// Size of the worker pool used by [`App::fetch_version`].
    pub workers: usize,
    /// Re-hash cached files before serving them.
    pub verify_on_read: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            verify_on_read: true,
        }
    }
}

impl From<&ResolvedConfig> for AppSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            workers: config.workers,
            verify_on_read: config.verify_on_read,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Serve from the cache when Taiga cannot be reached.
    pub allow_offline: bool,
    /// Discard any cached copy and download again.
    pub force: bool,
}

/// Which local representation a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatRequest {
    /// Whatever Taiga delivers for the file's type.
    Stored,
    Format(LocalFormat),
    /// The representation [`App::get`] loads into memory.
    Artifact,
}

impl FormatRequest {
    pub fn target(self, key: &CanonicalKey, data_type: DataType) -> Result<LocalFormat, TaigaError> {
        let format = match self {
            FormatRequest::Stored => data_type.stored_format(),
            FormatRequest::Format(format) => format,
            FormatRequest::Artifact => data_type.artifact_format().ok_or_else(|| {
                unsupported(key, data_type, "an in-memory artifact")
            })?,
        };
        if conversion_plan(data_type, format) == ConversionPlan::Forbidden {
            return Err(unsupported(key, data_type, format.as_str()));
        }
        Ok(format)
    }
}

impl From<Option<LocalFormat>> for FormatRequest {
    fn from(value: Option<LocalFormat>) -> Self {
        value.map_or(FormatRequest::Stored, FormatRequest::Format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Derived,
    Downloaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedFile {
    pub key: CanonicalKey,
    pub data_type: DataType,
    pub format: LocalFormat,
    pub path: Utf8PathBuf,
    pub source: FetchSource,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionFetchResult {
    pub permaname: String,
    pub version: u32,
    pub offline: bool,
    pub notices: Vec<Notice>,
    pub files: Vec<VersionFileResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionFileResult {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<CachedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub key: CanonicalKey,
    pub data_type: DataType,
    pub original_sha256: Option<String>,
    pub representations: Vec<ListRepresentation>,
    pub links: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRepresentation {
    pub format: LocalFormat,
    pub path: Utf8PathBuf,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    /// The only automatic retry after a corrupt download; links are bypassed.
    Retry,
}

/// The cache context: owns the index for its lifetime and runs the
/// resolve, fetch, convert and verify pipeline.
pub struct App<R: MetadataResolver, F: ByteFetcher> {
    index: LocalIndex,
    coordinator: FetchCoordinator,
    remote: R,
    fetcher: F,
    settings: AppSettings,
    cancel: Cancellation,
}

impl<R: MetadataResolver, F: ByteFetcher> App<R, F> {
    pub fn open(store: Store, remote: R, fetcher: F, settings: AppSettings) -> Result<Self, TaigaError> {
        let index = LocalIndex::open(store)?;
        Ok(Self {
            index,
            coordinator: FetchCoordinator::new(),
            remote,
            fetcher,
            settings,
            cancel: Cancellation::new(),
        })
    }

    /// Flushes the index. Dropping the `App` without closing is safe but
    /// leaves the write-ahead log in place.
    pub fn close(self) -> Result<(), TaigaError> {
        self.index.checkpoint()
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    pub fn store(&self) -> &Store {
        self.index.store()
    }

    /// Loads the datafile into memory: numeric matrices as [`Artifact::Matrix`]
    /// and tables as [`Artifact::Table`]. Raw files are refused.
    pub fn get(
        &self,
        reference: &StructuredReference,
        options: FetchOptions,
    ) -> Result<Artifact, TaigaError> {
        let file = self.download_to_cache(reference, FormatRequest::Artifact, options)?;
        read_artifact(file.format, file.path.as_std_path())
    }

    pub fn download_to_cache(
        &self,
        reference: &StructuredReference,
        request: FormatRequest,
        options: FetchOptions,
    ) -> Result<CachedFile, TaigaError> {
        let offline = OfflineState::new();
        self.fetch_with_retry(reference, None, request, options, &offline)
    }

    pub fn get_canonical_id(
        &self,
        reference: &StructuredReference,
        options: FetchOptions,
    ) -> Result<CanonicalKey, TaigaError> {
        let offline = OfflineState::new();
        let resolution = self.resolver(&offline, options).resolve(reference, false)?;
        Ok(resolution.key)
    }

    /// Removes the cached entry the reference leads to. Learned links are kept.
    pub fn invalidate(
        &self,
        reference: &StructuredReference,
        options: FetchOptions,
    ) -> Result<CanonicalKey, TaigaError> {
        let offline = OfflineState::new();
        let resolver = self.resolver(&offline, options);
        let key = match resolver.resolve_local(reference)? {
            Some(key) => key,
            None => match reference.canonical_key() {
                Some(key) => key,
                None => resolver.resolve(reference, false)?.key,
            },
        };
        let _ticket = self.coordinator.acquire(&key);
        self.index.invalidate(&key)?;
        info!(key = %key, "invalidated");
        Ok(key)
    }

    pub fn allowed_formats(
        &self,
        reference: &StructuredReference,
        options: FetchOptions,
    ) -> Result<Vec<LocalFormat>, TaigaError> {
        let offline = OfflineState::new();
        let resolver = self.resolver(&offline, options);
        let resolution = resolver.resolve(reference, false)?;
        let data_type = match resolution.metadata {
            Some(metadata) => metadata.data_type,
            None => match self.index.lookup(&resolution.key)? {
                Some(entry) => entry.data_type,
                None => resolver.describe(&resolution.key)?.0.data_type,
            },
        };
        Ok(data_type.allowed_formats())
    }

    /// Fetches every file of a dataset version on a bounded worker pool.
    /// A failing file does not stop the others.
    pub fn fetch_version(
        &self,
        permaname: &str,
        version: VersionSpec,
        request: FormatRequest,
        options: FetchOptions,
    ) -> Result<VersionFetchResult, TaigaError> {
        let offline = OfflineState::new();
        let resolver = self.resolver(&offline, options);

        let (number, notices, jobs) = match resolver.dataset_version(permaname, version) {
            Ok((listing, notices)) => {
                let jobs: Vec<(String, Option<Resolution>)> = listing
                    .files
                    .iter()
                    .map(|file| {
                        let hint = Resolution {
                            key: file.real_key().clone(),
                            metadata: Some(file.clone()),
                            notices: notices.clone(),
                        };
                        (file.key.file_name().to_string(), Some(hint))
                    })
                    .collect();
                (listing.version, notices, jobs)
            }
            Err(err @ TaigaError::OfflineUnavailable(_)) => match version {
                VersionSpec::Number(number) => {
                    let prefix = format!("{permaname}.{number}/");
                    let jobs: Vec<(String, Option<Resolution>)> = self
                        .index
                        .references_with_prefix(&prefix)?
                        .into_iter()
                        .filter_map(|reference| {
                            reference.strip_prefix(&prefix).map(|name| (name.to_string(), None))
                        })
                        .collect();
                    if jobs.is_empty() {
                        return Err(err);
                    }
                    (number, Vec::new(), jobs)
                }
                VersionSpec::Latest => return Err(err),
            },
            Err(err) => return Err(err),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.max(1))
            .build()
            .map_err(|err| TaigaError::Filesystem(format!("failed to create worker pool: {err}")))?;

        info!(permaname, version = number, files = jobs.len(), "fetching dataset version");
        let files: Vec<VersionFileResult> = pool.install(|| {
            jobs.into_par_iter()
                .map(|(file_name, hint)| {
                    let reference = StructuredReference::parse(
                        None,
                        Some(permaname),
                        Some(VersionSpec::Number(number)),
                        Some(&file_name),
                    );
                    let result = reference.and_then(|reference| {
                        self.fetch_with_retry(&reference, hint, request, options, &offline)
                    });
                    match result {
                        Ok(cached) => VersionFileResult {
                            file_name,
                            cached: Some(cached),
                            error: None,
                        },
                        Err(err) => {
                            warn!(file = %file_name, error = %err, "datafile fetch failed");
                            VersionFileResult {
                                file_name,
                                cached: None,
                                error: Some(err.to_string()),
                            }
                        }
                    }
                })
                .collect()
        });

        Ok(VersionFetchResult {
            permaname: permaname.to_string(),
            version: number,
            offline: offline.is_offline(),
            notices,
            files,
        })
    }

    pub fn list(&self) -> Result<ListResult, TaigaError> {
        let entries = self
            .index
            .entries()?
            .into_iter()
            .map(|entry| {
                let links = self.index.links_to(&entry.key)?;
                Ok(ListEntry {
                    representations: entry
                        .representations
                        .iter()
                        .map(|(format, representation)| ListRepresentation {
                            format: *format,
                            path: representation.path.clone(),
                            sha256: representation.sha256.clone(),
                            size: representation.size,
                        })
                        .collect(),
                    key: entry.key,
                    data_type: entry.data_type,
                    original_sha256: entry.original_sha256,
                    links,
                    updated_at: entry.updated_at,
                })
            })
            .collect::<Result<Vec<_>, TaigaError>>()?;
        Ok(ListResult { entries })
    }

    fn resolver<'a>(&'a self, offline: &'a OfflineState, options: FetchOptions) -> Resolver<'a, R> {
        Resolver::new(&self.index, &self.remote, offline, options.allow_offline)
    }

    fn fetch_with_retry(
        &self,
        reference: &StructuredReference,
        mut hint: Option<Resolution>,
        request: FormatRequest,
        options: FetchOptions,
        offline: &OfflineState,
    ) -> Result<CachedFile, TaigaError> {
        let resolver = self.resolver(offline, options);
        let mut attempt = Attempt::First;
        loop {
            let bypass_links = options.force || attempt == Attempt::Retry;
            let result = match hint.take() {
                Some(resolution) => Ok(resolution),
                None => resolver.resolve(reference, bypass_links),
            }
            .and_then(|resolution| self.fetch_resolved(&resolver, resolution, request, options));

            match (result, attempt) {
                (Err(err @ TaigaError::CorruptDownload { .. }), Attempt::First) => {
                    warn!(reference = %reference, error = %err, "download was corrupt, retrying once");
                    attempt = Attempt::Retry;
                }
                (result, _) => return result,
            }
        }
    }

    fn fetch_resolved(
        &self,
        resolver: &Resolver<'_, R>,
        resolution: Resolution,
        request: FormatRequest,
        options: FetchOptions,
    ) -> Result<CachedFile, TaigaError> {
        let Resolution {
            mut key,
            mut metadata,
            mut notices,
        } = resolution;

        loop {
            let existing = self.index.lookup(&key)?;
            if !options.force
                && let Some(entry) = &existing
            {
                let format = request.target(&key, entry.data_type)?;
                // Without the ticket a bad file is only skipped, never removed.
                if let Some(representation) = entry.representation(format)
                    && self.is_intact(representation)
                {
                    debug!(key = %key, format = %format, "cache hit");
                    return Ok(cached_file(entry, format, representation, FetchSource::Cache, &notices));
                }
            }

            if existing.is_none() && metadata.is_none() {
                let (described, described_notices) = resolver.describe(&key)?;
                merge_notices(&mut notices, described_notices);
                let hop = described.real_key() != &key;
                if hop {
                    // One level of indirection; the next pass has metadata
                    // and cannot hop again.
                    info!(key = %key, real = %described.real_key(), "link target is now an alias");
                    key = described.real_key().clone();
                }
                metadata = Some(described);
                if hop {
                    continue;
                }
            }

            let data_type = match (&existing, &metadata) {
                (Some(entry), _) => entry.data_type,
                (None, Some(metadata)) => metadata.data_type,
                (None, None) => return Err(TaigaError::NotFound(key.to_string())),
            };
            let format = request.target(&key, data_type)?;
            return self.fetch_locked(resolver, &key, metadata, format, options, notices);
        }
    }

    /// The ticketed part of the pipeline: re-read, verify, derive or download.
    fn fetch_locked(
        &self,
        resolver: &Resolver<'_, R>,
        key: &CanonicalKey,
        metadata: Option<DatafileMetadata>,
        format: LocalFormat,
        options: FetchOptions,
        mut notices: Vec<Notice>,
    ) -> Result<CachedFile, TaigaError> {
        self.cancel.check(key)?;
        let requested_at = Utc::now();
        let ticket = self.coordinator.acquire(key);
        if options.force {
            self.discard_for_force(&ticket, requested_at)?;
        }

        if let Some(entry) = self.index.lookup(key)?
            && let Some(entry) = self.verified(entry, format)?
        {
            if let Some(representation) = entry.representation(format) {
                return Ok(cached_file(&entry, format, representation, FetchSource::Cache, &notices));
            }
            let representation = self.derive(&ticket, &entry, format)?;
            return Ok(cached_file(&entry, format, &representation, FetchSource::Derived, &notices));
        }

        let metadata = match metadata {
            Some(metadata) => metadata,
            None => {
                let (described, described_notices) = resolver.describe(key)?;
                merge_notices(&mut notices, described_notices);
                if described.real_key() != key {
                    return Err(TaigaError::UnexpectedResponse(format!(
                        "{key} became an alias of {} during the fetch",
                        described.real_key()
                    )));
                }
                described
            }
        };
        let entry = self.download(&ticket, &metadata, format)?;
        let representation = entry.representation(format).ok_or_else(|| {
            TaigaError::Index(format!("{key} committed without {format}"))
        })?;
        Ok(cached_file(&entry, format, representation, FetchSource::Downloaded, &notices))
    }

    /// A forced fetch only keeps an entry that the holder it waited on
    /// started writing after the force was requested.
    fn discard_for_force(&self, ticket: &Ticket<'_>, requested_at: DateTime<Utc>) -> Result<(), TaigaError> {
        let key = ticket.key();
        if ticket.waited()
            && let Some(entry) = self.index.lookup(key)?
            && written_since(&entry.created_at, requested_at)
        {
            debug!(key = %key, "forced fetch satisfied by the download it waited for");
            return Ok(());
        }
        self.index.invalidate(key)
    }

    /// Drops whatever part of `entry` no longer matches its recorded hash.
    /// Returns `None` when the stored representation itself is bad.
    fn verified(&self, mut entry: CacheEntry, format: LocalFormat) -> Result<Option<CacheEntry>, TaigaError> {
        let stored_intact = entry
            .stored()
            .is_some_and(|representation| self.is_intact(representation));
        if !stored_intact {
            warn!(key = %entry.key, "cached file is missing or corrupt; discarding entry");
            self.index.invalidate(&entry.key)?;
            return Ok(None);
        }
        if format != entry.data_type.stored_format()
            && let Some(representation) = entry.representation(format)
            && !self.is_intact(representation)
        {
            warn!(key = %entry.key, format = %format, "derived file is corrupt; rebuilding");
            self.index.remove_representation(&entry.key, format)?;
            entry.representations.remove(&format);
        }
        Ok(Some(entry))
    }

    fn is_intact(&self, representation: &Representation) -> bool {
        if !self.settings.verify_on_read {
            return representation.path.as_std_path().is_file();
        }
        match sha256_file(&representation.path) {
            Ok(actual) => actual == representation.sha256,
            Err(_) => false,
        }
    }

    fn derive(
        &self,
        ticket: &Ticket<'_>,
        entry: &CacheEntry,
        format: LocalFormat,
    ) -> Result<Representation, TaigaError> {
        let key = ticket.key();
        self.cancel.check(key)?;
        let stored = entry
            .stored()
            .ok_or_else(|| TaigaError::Index(format!("{key} has no stored representation")))?;
        let mut temp = self.store().temp_file("convert")?;
        convert(
            entry.data_type.stored_format(),
            stored.path.as_std_path(),
            format,
            temp.as_file_mut(),
        )?;
        let dest = self.store().datafile_path(key, format);
        self.store().persist_durable(temp, &dest)?;
        match self.index.add_representation(key, format) {
            Ok(representation) => {
                info!(key = %key, format = %format, "derived representation");
                Ok(representation)
            }
            Err(err) => {
                remove_if_exists(&dest)?;
                Err(err)
            }
        }
    }

    fn download(
        &self,
        ticket: &Ticket<'_>,
        metadata: &DatafileMetadata,
        format: LocalFormat,
    ) -> Result<CacheEntry, TaigaError> {
        let key = ticket.key();
        let stored_format = metadata.data_type.stored_format();
        let token =
            self.index
                .begin_write(ticket, metadata.data_type, metadata.original_sha256.as_deref())?;
        info!(key = %key, format = %format, "downloading");

        match self.stage(key, metadata, format) {
            Ok(expected) => {
                let mut formats = vec![stored_format];
                if format != stored_format {
                    formats.push(format);
                }
                self.index.commit(token, expected.as_deref(), &formats)
            }
            Err(err) => {
                if let Err(abort_err) = self.index.abort(token) {
                    warn!(key = %key, error = %abort_err, "failed to clean up aborted download");
                }
                Err(err)
            }
        }
    }

    /// Downloads and converts into the artifact paths. Returns the hash the
    /// stored representation must have.
    fn stage(
        &self,
        key: &CanonicalKey,
        metadata: &DatafileMetadata,
        format: LocalFormat,
    ) -> Result<Option<String>, TaigaError> {
        let store = self.store();
        let stored_format = metadata.data_type.stored_format();

        self.cancel.check(key)?;
        let temp = store.temp_file("download")?;
        let info = self
            .fetcher
            .download(key, metadata.data_type, temp.path(), &self.cancel)?;
        self.cancel.check(key)?;

        let expected = expected_sha256(metadata, &info);
        let stored_path = store.datafile_path(key, stored_format);
        store.persist_durable(temp, &stored_path)?;
        if format == stored_format {
            return Ok(expected);
        }

        // Refuse to convert bytes that will not pass commit.
        if let Some(expected) = &expected {
            let actual = sha256_file(&stored_path)?;
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(TaigaError::CorruptDownload {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        let mut derived = store.temp_file("convert")?;
        convert(stored_format, stored_path.as_std_path(), format, derived.as_file_mut())?;
        self.cancel.check(key)?;
        store.persist_durable(derived, &store.datafile_path(key, format))?;
        Ok(expected)
    }
}

fn cached_file(
    entry: &CacheEntry,
    format: LocalFormat,
    representation: &Representation,
    source: FetchSource,
    notices: &[Notice],
) -> CachedFile {
    CachedFile {
        key: entry.key.clone(),
        data_type: entry.data_type,
        format,
        path: representation.path.clone(),
        source,
        notices: notices.to_vec(),
    }
}

fn written_since(created_at: &str, instant: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(created_at)
        .is_ok_and(|created| created.with_timezone(&Utc) >= instant)
}

fn merge_notices(notices: &mut Vec<Notice>, more: Vec<Notice>) {
    for notice in more {
        if !notices.contains(&notice) {
            notices.push(notice);
        }
    }
}

fn unsupported(key: &CanonicalKey, data_type: DataType, requested: &str) -> TaigaError {
    TaigaError::UnsupportedConversion {
        key: key.to_string(),
        data_type: data_type.to_string(),
        requested: requested.to_string(),
    }
}
