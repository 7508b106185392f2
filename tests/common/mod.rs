#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};

use taiga_cache::app::{App, AppSettings};
use taiga_cache::coordinator::Cancellation;
use taiga_cache::domain::{CanonicalKey, DataType, VersionSpec, VersionState};
use taiga_cache::error::TaigaError;
use taiga_cache::reference::StructuredReference;
use taiga_cache::remote::{
    ByteFetcher, DatafileMetadata, DatasetVersionMetadata, DownloadInfo, MetadataResolver,
    latest_version,
};
use taiga_cache::store::Store;

pub const MATRIX_CSV: &str = ",a,b\nr1,1,2\nr2,3,4\n";
pub const TABLE_CSV: &str = "name,count\nx,1\ny,2\n";

pub type TestApp = App<Arc<MockRemote>, Arc<MockRemote>>;

#[derive(Debug, Clone)]
struct MockFile {
    key: CanonicalKey,
    data_type: DataType,
    body: Vec<u8>,
    underlying: Option<CanonicalKey>,
}

/// In-memory Taiga that counts every call made against it.
#[derive(Default)]
pub struct MockRemote {
    files: Mutex<Vec<MockFile>>,
    states: Mutex<HashMap<(String, u32), (VersionState, Option<String>)>>,
    opaque: Mutex<HashMap<String, (String, u32)>>,
    unreachable: AtomicBool,
    corrupt_next: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    resolve_calls: AtomicUsize,
    listing_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_file(&self, key: &str, data_type: DataType, body: &str) {
        self.files.lock().unwrap().push(MockFile {
            key: key.parse().unwrap(),
            data_type,
            body: body.as_bytes().to_vec(),
            underlying: None,
        });
    }

    /// `key` becomes a virtual file pointing at the existing file `target`.
    pub fn add_virtual(&self, key: &str, target: &str) {
        let target: CanonicalKey = target.parse().unwrap();
        let data_type = self.find(&target).unwrap().data_type;
        self.files.lock().unwrap().push(MockFile {
            key: key.parse().unwrap(),
            data_type,
            body: Vec::new(),
            underlying: Some(target),
        });
    }

    /// Repoints an existing virtual file.
    pub fn retarget(&self, key: &str, target: &str) {
        let key: CanonicalKey = key.parse().unwrap();
        let target: CanonicalKey = target.parse().unwrap();
        let mut files = self.files.lock().unwrap();
        let file = files.iter_mut().find(|file| file.key == key).unwrap();
        file.underlying = Some(target);
    }

    pub fn set_state(&self, permaname: &str, version: u32, state: VersionState, reason: Option<&str>) {
        self.states.lock().unwrap().insert(
            (permaname.to_string(), version),
            (state, reason.map(str::to_string)),
        );
    }

    pub fn add_opaque(&self, id: &str, permaname: &str, version: u32) {
        self.opaque
            .lock()
            .unwrap()
            .insert(id.to_string(), (permaname.to_string(), version));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` downloads deliver truncated bytes.
    pub fn corrupt_next(&self, count: usize) {
        self.corrupt_next.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    /// Metadata calls of either kind.
    pub fn metadata_calls(&self) -> usize {
        self.resolve_calls() + self.listing_calls()
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn find(&self, key: &CanonicalKey) -> Option<MockFile> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|file| &file.key == key)
            .cloned()
    }

    fn state(&self, permaname: &str, version: u32) -> (VersionState, Option<String>) {
        self.states
            .lock()
            .unwrap()
            .get(&(permaname.to_string(), version))
            .cloned()
            .unwrap_or((VersionState::Approved, None))
    }

    fn metadata(&self, file: &MockFile) -> DatafileMetadata {
        let (state, reason_state) = self.state(file.key.permaname(), file.key.version());
        let body = match &file.underlying {
            Some(target) => self.find(target).map(|target| target.body).unwrap_or_default(),
            None => file.body.clone(),
        };
        DatafileMetadata {
            key: file.key.clone(),
            data_type: file.data_type,
            state,
            reason_state,
            original_sha256: Some(sha256(&body)),
            underlying: file.underlying.clone(),
        }
    }

    fn check_reachable(&self) -> Result<(), TaigaError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TaigaError::Connectivity("connection refused".to_string()));
        }
        Ok(())
    }
}

impl MetadataResolver for MockRemote {
    fn resolve(&self, reference: &StructuredReference) -> Result<DatafileMetadata, TaigaError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let key = match &reference.opaque_id {
            Some(id) => {
                let (permaname, version) = self
                    .opaque
                    .lock()
                    .unwrap()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| TaigaError::NotFound(id.clone()))?;
                let listing = self.dataset_version_inner(&permaname, VersionSpec::Number(version))?;
                match &reference.file_name {
                    Some(name) => CanonicalKey::new(permaname.as_str(), version, name.as_str())?,
                    None => match listing.files.as_slice() {
                        [only] => only.key.clone(),
                        _ => return Err(TaigaError::NotFound(id.clone())),
                    },
                }
            }
            None => reference
                .canonical_key()
                .ok_or_else(|| TaigaError::NotFound(reference.to_string()))?,
        };
        let file = self
            .find(&key)
            .ok_or_else(|| TaigaError::NotFound(key.to_string()))?;
        Ok(self.metadata(&file))
    }

    fn dataset_version(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<DatasetVersionMetadata, TaigaError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.dataset_version_inner(permaname, version)
    }
}

impl MockRemote {
    fn dataset_version_inner(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<DatasetVersionMetadata, TaigaError> {
        let files: Vec<MockFile> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|file| file.key.permaname() == permaname)
            .cloned()
            .collect();
        let number = match version {
            VersionSpec::Number(number) => number,
            VersionSpec::Latest => latest_version(
                files
                    .iter()
                    .map(|file| (file.key.version(), self.state(permaname, file.key.version()).0)),
            )
            .ok_or_else(|| TaigaError::NotFound(permaname.to_string()))?,
        };
        let files: Vec<DatafileMetadata> = files
            .iter()
            .filter(|file| file.key.version() == number)
            .map(|file| self.metadata(file))
            .collect();
        if files.is_empty() {
            return Err(TaigaError::NotFound(format!("{permaname}.{number}")));
        }
        let (state, reason_state) = self.state(permaname, number);
        Ok(DatasetVersionMetadata {
            permaname: permaname.to_string(),
            version: number,
            state,
            reason_state,
            files,
        })
    }
}

impl ByteFetcher for MockRemote {
    fn download(
        &self,
        key: &CanonicalKey,
        data_type: DataType,
        destination: &Path,
        cancel: &Cancellation,
    ) -> Result<DownloadInfo, TaigaError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if let Some(delay) = *self.delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        cancel.check(key)?;

        let mut file = self
            .find(key)
            .ok_or_else(|| TaigaError::NotFound(key.to_string()))?;
        if let Some(target) = &file.underlying {
            file = self
                .find(target)
                .ok_or_else(|| TaigaError::NotFound(target.to_string()))?;
        }
        let declared = sha256(&file.body);
        let mut body = file.body;
        let corrupt = self
            .corrupt_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if corrupt {
            body.truncate(body.len() / 2);
        }
        fs::write(destination, &body).map_err(|err| TaigaError::Filesystem(err.to_string()))?;

        let server_converted = data_type != DataType::Raw;
        Ok(DownloadInfo {
            declared_sha256: server_converted.then_some(declared),
            server_converted,
            bytes: body.len() as u64,
        })
    }
}

pub fn sha256(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub fn cache_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

pub fn open_app(dir: &tempfile::TempDir, remote: &Arc<MockRemote>) -> TestApp {
    open_app_with(dir, remote, AppSettings::default())
}

pub fn open_app_with(
    dir: &tempfile::TempDir,
    remote: &Arc<MockRemote>,
    settings: AppSettings,
) -> TestApp {
    App::open(
        Store::new_with_root(cache_root(dir)),
        remote.clone(),
        remote.clone(),
        settings,
    )
    .unwrap()
}

pub fn reference(raw: &str) -> StructuredReference {
    raw.parse().unwrap()
}
