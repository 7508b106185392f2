use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::coordinator::Cancellation;
use crate::domain::{CanonicalKey, DataType, VersionSpec, VersionState};
use crate::error::TaigaError;
use crate::reference::StructuredReference;

/// Authoritative description of one datafile as reported by Taiga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatafileMetadata {
    pub key: CanonicalKey,
    pub data_type: DataType,
    pub state: VersionState,
    pub reason_state: Option<String>,
    pub original_sha256: Option<String>,
    /// Set when the datafile is virtual: the real file it aliases.
    pub underlying: Option<CanonicalKey>,
}

impl DatafileMetadata {
    pub fn is_virtual(&self) -> bool {
        self.underlying.is_some()
    }

    /// The key the bytes are stored under.
    pub fn real_key(&self) -> &CanonicalKey {
        self.underlying.as_ref().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetVersionMetadata {
    pub permaname: String,
    pub version: u32,
    pub state: VersionState,
    pub reason_state: Option<String>,
    pub files: Vec<DatafileMetadata>,
}

impl DatasetVersionMetadata {
    pub fn file(&self, name: &str) -> Option<&DatafileMetadata> {
        self.files.iter().find(|file| file.key.file_name() == name)
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|file| file.key.file_name()).collect()
    }
}

/// What the fetcher wrote to the destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    /// Hash declared by the remote for the delivered bytes, if any.
    pub declared_sha256: Option<String>,
    /// The delivered bytes were produced by the remote conversion service
    /// rather than being the originally uploaded bytes.
    pub server_converted: bool,
    pub bytes: u64,
}

pub trait MetadataResolver: Send + Sync {
    /// Metadata of the datafile `reference` names. The reference must carry a
    /// file name or be an opaque datafile id.
    fn resolve(&self, reference: &StructuredReference) -> Result<DatafileMetadata, TaigaError>;

    fn dataset_version(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<DatasetVersionMetadata, TaigaError>;
}

pub trait ByteFetcher: Send + Sync {
    /// Writes the stored representation of `key` to `destination`.
    fn download(
        &self,
        key: &CanonicalKey,
        data_type: DataType,
        destination: &Path,
        cancel: &Cancellation,
    ) -> Result<DownloadInfo, TaigaError>;
}

impl<T: MetadataResolver + ?Sized> MetadataResolver for Arc<T> {
    fn resolve(&self, reference: &StructuredReference) -> Result<DatafileMetadata, TaigaError> {
        (**self).resolve(reference)
    }

    fn dataset_version(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<DatasetVersionMetadata, TaigaError> {
        (**self).dataset_version(permaname, version)
    }
}

impl<T: ByteFetcher + ?Sized> ByteFetcher for Arc<T> {
    fn download(
        &self,
        key: &CanonicalKey,
        data_type: DataType,
        destination: &Path,
        cancel: &Cancellation,
    ) -> Result<DownloadInfo, TaigaError> {
        (**self).download(key, data_type, destination, cancel)
    }
}

/// The highest version number that is not deleted.
pub fn latest_version<I>(versions: I) -> Option<u32>
where
    I: IntoIterator<Item = (u32, VersionState)>,
{
    versions
        .into_iter()
        .filter(|(_, state)| *state != VersionState::Deleted)
        .map(|(number, _)| number)
        .max()
}

/// Hash the stored bytes must have: the conversion service's own hash for
/// server-converted bytes, else the hash of the originally uploaded bytes.
pub fn expected_sha256(metadata: &DatafileMetadata, info: &DownloadInfo) -> Option<String> {
    let declared = info
        .declared_sha256
        .as_deref()
        .map(str::to_ascii_lowercase);
    if info.server_converted {
        return declared;
    }
    metadata
        .original_sha256
        .as_deref()
        .map(str::to_ascii_lowercase)
        .or(declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(original: Option<&str>) -> DatafileMetadata {
        DatafileMetadata {
            key: "ds-a.1/f".parse().unwrap(),
            data_type: DataType::Raw,
            state: VersionState::Approved,
            reason_state: None,
            original_sha256: original.map(str::to_string),
            underlying: None,
        }
    }

    #[test]
    fn expected_hash_prefers_conversion_hash_for_converted_bytes() {
        let info = DownloadInfo {
            declared_sha256: Some("BEEF".to_string()),
            server_converted: true,
            bytes: 4,
        };
        assert_eq!(
            expected_sha256(&metadata(Some("abcd")), &info).as_deref(),
            Some("beef")
        );
    }

    #[test]
    fn expected_hash_uses_original_for_raw_bytes() {
        let info = DownloadInfo {
            declared_sha256: Some("beef".to_string()),
            server_converted: false,
            bytes: 4,
        };
        assert_eq!(
            expected_sha256(&metadata(Some("abcd")), &info).as_deref(),
            Some("abcd")
        );
        assert_eq!(
            expected_sha256(&metadata(None), &info).as_deref(),
            Some("beef")
        );
    }

    #[test]
    fn latest_skips_deleted_versions() {
        let versions = [
            (1, VersionState::Approved),
            (2, VersionState::Deprecated),
            (3, VersionState::Deleted),
        ];
        assert_eq!(latest_version(versions), Some(2));
        assert_eq!(latest_version([(1, VersionState::Deleted)]), None);
    }

    #[test]
    fn real_key_of_virtual_file() {
        let mut meta = metadata(None);
        assert_eq!(meta.real_key().to_string(), "ds-a.1/f");
        meta.underlying = Some("ds-orig.2/data".parse().unwrap());
        assert!(meta.is_virtual());
        assert_eq!(meta.real_key().to_string(), "ds-orig.2/data");
    }
}
