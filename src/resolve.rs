use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{CanonicalKey, PERMANAME, VersionSpec, VersionState};
use crate::error::TaigaError;
use crate::index::LocalIndex;
use crate::reference::StructuredReference;
use crate::remote::{DatafileMetadata, DatasetVersionMetadata, MetadataResolver};

/// Remote-state information that does not stop a request from succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Deprecated {
        dataset_version: String,
        reason: Option<String>,
    },
}

/// Remembers, for one top-level operation, that the remote was unreachable.
#[derive(Debug, Default)]
pub struct OfflineState(AtomicBool);

impl OfflineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_offline(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// Key of the real file the reference denotes.
    pub key: CanonicalKey,
    /// Remote metadata, present only when the remote was consulted.
    pub metadata: Option<DatafileMetadata>,
    pub notices: Vec<Notice>,
}

/// Turns references into canonical keys, preferring learned links over the
/// network.
pub struct Resolver<'a, R: MetadataResolver> {
    index: &'a LocalIndex,
    remote: &'a R,
    offline: &'a OfflineState,
    allow_offline: bool,
}

impl<'a, R: MetadataResolver> Resolver<'a, R> {
    pub fn new(
        index: &'a LocalIndex,
        remote: &'a R,
        offline: &'a OfflineState,
        allow_offline: bool,
    ) -> Self {
        Self {
            index,
            remote,
            offline,
            allow_offline,
        }
    }

    /// Resolves `reference`. With `bypass_links` the link table is not
    /// consulted and the remote is asked directly.
    pub fn resolve(
        &self,
        reference: &StructuredReference,
        bypass_links: bool,
    ) -> Result<Resolution, TaigaError> {
        if !bypass_links && let Some(key) = self.resolve_local(reference)? {
            debug!(reference = %reference, key = %key, "resolved from links");
            return Ok(Resolution {
                key,
                metadata: None,
                notices: Vec::new(),
            });
        }

        let (metadata, notices) = self.remote_call(reference, || self.resolve_remote(reference))?;
        let key = metadata.real_key().clone();
        info!(reference = %reference, key = %key, "resolved from Taiga");
        Ok(Resolution {
            key,
            metadata: Some(metadata),
            notices,
        })
    }

    /// Follows learned links from `reference`, if any.
    pub fn resolve_local(
        &self,
        reference: &StructuredReference,
    ) -> Result<Option<CanonicalKey>, TaigaError> {
        for link in reference.link_keys() {
            if let Some(target) = self.index.lookup_virtual(&link)? {
                return self.follow_links(&link, target).map(Some);
            }
        }
        Ok(None)
    }

    /// Remote metadata of the real file `key`, with the notices its version
    /// state raises.
    pub fn describe(
        &self,
        key: &CanonicalKey,
    ) -> Result<(DatafileMetadata, Vec<Notice>), TaigaError> {
        let reference = StructuredReference::from_key(key);
        self.remote_call(&reference, || self.resolve_remote(&reference))
    }

    /// Listing of a dataset version; links for all of its files are learned.
    pub fn dataset_version(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<(DatasetVersionMetadata, Vec<Notice>), TaigaError> {
        let label = StructuredReference {
            opaque_id: None,
            dataset_name: Some(permaname.to_string()),
            dataset_version: Some(version),
            file_name: None,
        };
        self.remote_call(&label, || {
            let listing = self.remote.dataset_version(permaname, version)?;
            let notices = self.check_state(
                &listing.permaname,
                listing.version,
                listing.state,
                listing.reason_state.as_deref(),
            )?;
            self.learn_listing(&listing)?;
            Ok((listing, notices))
        })
    }

    fn follow_links(&self, start: &str, first: CanonicalKey) -> Result<CanonicalKey, TaigaError> {
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut chain = vec![start.to_string()];
        let mut current = first;
        loop {
            let label = current.to_string();
            if chain.last() == Some(&label) {
                return Ok(current);
            }
            chain.push(label.clone());
            if !visited.insert(label.clone()) {
                return Err(TaigaError::ResolutionCycle(chain.join(" -> ")));
            }
            match self.index.lookup_virtual(&label)? {
                Some(next) => current = next,
                // A target without its own link is taken as real.
                None => return Ok(current),
            }
        }
    }

    fn remote_call<T>(
        &self,
        reference: &StructuredReference,
        call: impl FnOnce() -> Result<T, TaigaError>,
    ) -> Result<T, TaigaError> {
        if self.offline.is_offline() {
            return Err(self.offline_error(reference, None));
        }
        match call() {
            Err(err) if err.is_connectivity() => {
                warn!(reference = %reference, error = %err, "Taiga is unreachable");
                self.offline.mark_offline();
                Err(self.offline_error(reference, Some(err)))
            }
            other => other,
        }
    }

    fn offline_error(&self, reference: &StructuredReference, cause: Option<TaigaError>) -> TaigaError {
        if self.allow_offline {
            return TaigaError::OfflineUnavailable(reference.to_string());
        }
        cause.unwrap_or_else(|| {
            TaigaError::Connectivity(format!("Taiga was unreachable while resolving {reference}"))
        })
    }

    fn resolve_remote(
        &self,
        reference: &StructuredReference,
    ) -> Result<(DatafileMetadata, Vec<Notice>), TaigaError> {
        if let Some(id) = &reference.opaque_id {
            return match self.remote.resolve(reference) {
                Ok(metadata) => {
                    let notices = self.accept(&metadata)?;
                    self.index.put_virtual_link(id, metadata.real_key())?;
                    Ok((metadata, notices))
                }
                Err(TaigaError::NotFound(_)) if PERMANAME.is_match(id) => {
                    debug!(id = %id, "not a dataset version id; trying as a permaname");
                    self.resolve_listing(id, VersionSpec::Latest, None)
                }
                Err(err) => Err(err),
            };
        }

        let name = reference
            .dataset_name
            .as_deref()
            .ok_or_else(|| TaigaError::InvalidReference(reference.to_string()))?;
        let version = reference.dataset_version.unwrap_or(VersionSpec::Latest);
        match (version, &reference.file_name) {
            (VersionSpec::Number(_), Some(_)) => {
                let metadata = self.remote.resolve(reference)?;
                let notices = self.accept(&metadata)?;
                Ok((metadata, notices))
            }
            (version, file) => self.resolve_listing(name, version, file.as_deref()),
        }
    }

    fn resolve_listing(
        &self,
        permaname: &str,
        version: VersionSpec,
        file: Option<&str>,
    ) -> Result<(DatafileMetadata, Vec<Notice>), TaigaError> {
        let listing = self.remote.dataset_version(permaname, version)?;
        let notices = self.check_state(
            &listing.permaname,
            listing.version,
            listing.state,
            listing.reason_state.as_deref(),
        )?;
        self.learn_listing(&listing)?;

        let metadata = match file {
            Some(name) => listing.file(name).cloned().ok_or_else(|| {
                TaigaError::NotFound(format!(
                    "{}.{}/{name} (available: {})",
                    listing.permaname,
                    listing.version,
                    listing.file_names().join(", ")
                ))
            })?,
            None => match listing.files.as_slice() {
                [only] => only.clone(),
                [] => {
                    return Err(TaigaError::NotFound(format!(
                        "{}.{} has no datafiles",
                        listing.permaname, listing.version
                    )));
                }
                _ => {
                    return Err(TaigaError::InvalidReference(format!(
                        "{}.{} has several datafiles, pick one of: {}",
                        listing.permaname,
                        listing.version,
                        listing.file_names().join(", ")
                    )));
                }
            },
        };
        Ok((metadata, notices))
    }

    /// Checks the state of a single resolved file and learns its links.
    fn accept(&self, metadata: &DatafileMetadata) -> Result<Vec<Notice>, TaigaError> {
        let notices = self.check_state(
            metadata.key.permaname(),
            metadata.key.version(),
            metadata.state,
            metadata.reason_state.as_deref(),
        )?;
        self.learn(metadata)?;
        Ok(notices)
    }

    fn check_state(
        &self,
        permaname: &str,
        version: u32,
        state: VersionState,
        reason: Option<&str>,
    ) -> Result<Vec<Notice>, TaigaError> {
        match state {
            VersionState::Approved => Ok(Vec::new()),
            VersionState::Deprecated => {
                warn!(
                    dataset_version = %format!("{permaname}.{version}"),
                    reason = reason.unwrap_or(""),
                    "dataset version is deprecated"
                );
                Ok(vec![Notice::Deprecated {
                    dataset_version: format!("{permaname}.{version}"),
                    reason: reason.map(str::to_string),
                }])
            }
            VersionState::Deleted => {
                let purged = self.index.invalidate_version(permaname, version)?;
                warn!(permaname, version, purged, "dataset version was deleted");
                Err(TaigaError::DeletedVersion {
                    permaname: permaname.to_string(),
                    version,
                })
            }
        }
    }

    fn learn_listing(&self, listing: &DatasetVersionMetadata) -> Result<(), TaigaError> {
        for file in &listing.files {
            self.learn(file)?;
        }
        if let [only] = listing.files.as_slice() {
            self.index.put_virtual_link(
                &format!("{}.{}", listing.permaname, listing.version),
                only.real_key(),
            )?;
        }
        Ok(())
    }

    /// Links the file's own key to the real key and gives the real key a
    /// self link, unless the real key is already known to lead elsewhere.
    fn learn(&self, metadata: &DatafileMetadata) -> Result<(), TaigaError> {
        let real = metadata.real_key();
        let real_label = real.to_string();
        if metadata.is_virtual() {
            self.index.put_virtual_link(&metadata.key.to_string(), real)?;
            match self.index.lookup_virtual(&real_label)? {
                Some(target) if &target != real => {
                    // Taiga reports one level of indirection; keep the
                    // deeper chain we already know about.
                    self.follow_links(&real_label, target)?;
                }
                Some(_) => {}
                None => self.index.put_virtual_link(&real_label, real)?,
            }
        } else {
            self.index.put_virtual_link(&real_label, real)?;
        }
        Ok(())
    }
}
