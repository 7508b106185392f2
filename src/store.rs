use std::fs::{self, File};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use sha2::{Digest, Sha256};
use tempfile::{Builder, NamedTempFile};

use crate::domain::{CanonicalKey, LocalFormat};
use crate::error::TaigaError;

/// On-disk layout of a cache root. Artifact paths are a pure function of
/// (canonical key, format) so they can be found without the index.
#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, TaigaError> {
        Ok(Self::new_with_root(default_cache_root()?))
    }

    pub fn new_with_root(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn index_path(&self) -> Utf8PathBuf {
        self.cache_root.join("index.sqlite")
    }

    pub fn tmp_dir(&self) -> Utf8PathBuf {
        self.cache_root.join("tmp")
    }

    pub fn files_root(&self) -> Utf8PathBuf {
        self.cache_root.join("files")
    }

    pub fn datafile_dir(&self, key: &CanonicalKey) -> Utf8PathBuf {
        self.files_root()
            .join(key.permaname())
            .join(key.version().to_string())
    }

    pub fn datafile_path(&self, key: &CanonicalKey, format: LocalFormat) -> Utf8PathBuf {
        self.datafile_dir(key).join(format!(
            "{}.{}",
            escape_file_name(key.file_name()),
            format.suffix()
        ))
    }

    pub fn ensure_layout(&self) -> Result<(), TaigaError> {
        for dir in [self.cache_root.clone(), self.files_root(), self.tmp_dir()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// A scratch file inside `tmp/`, on the same filesystem as the artifacts.
    pub fn temp_file(&self, label: &str) -> Result<NamedTempFile, TaigaError> {
        fs::create_dir_all(self.tmp_dir().as_std_path())
            .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(&format!("{label}-"))
            .suffix(".part")
            .tempfile_in(self.tmp_dir().as_std_path())
            .map_err(|err| TaigaError::Filesystem(err.to_string()))
    }

    /// Flushes `temp`, renames it to `dest` and flushes the directory entry.
    pub fn persist_durable(&self, temp: NamedTempFile, dest: &Utf8Path) -> Result<(), TaigaError> {
        let parent = dest
            .parent()
            .ok_or_else(|| TaigaError::Filesystem(format!("invalid artifact path: {dest}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        sync_dir(parent)
    }

    pub fn remove_artifact(&self, key: &CanonicalKey, format: LocalFormat) -> Result<(), TaigaError> {
        remove_if_exists(&self.datafile_path(key, format))
    }

    /// Removes every backing file of `key`, whether the index knows it or not.
    pub fn remove_datafile_artifacts(&self, key: &CanonicalKey) -> Result<(), TaigaError> {
        for format in LocalFormat::ALL {
            self.remove_artifact(key, format)?;
        }
        let dir = self.datafile_dir(key);
        // Only succeeds once the version directory is empty.
        let _ = fs::remove_dir(dir.as_std_path());
        Ok(())
    }

    /// Deletes leftovers of downloads that never reached the index.
    pub fn sweep_temp(&self) -> Result<usize, TaigaError> {
        let tmp = self.tmp_dir();
        if !tmp.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries =
            fs::read_dir(tmp.as_std_path()).map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| TaigaError::Filesystem(err.to_string()))?
                .path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|err| TaigaError::Filesystem(err.to_string()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

pub fn default_cache_root() -> Result<Utf8PathBuf, TaigaError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".taiga").join("cache")).ok()
        })
        .ok_or_else(|| TaigaError::Filesystem("unable to resolve cache directory".to_string()))
}

/// Keeps `[A-Za-z0-9._-]`, writes every other byte as `%XX`.
pub fn escape_file_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

pub fn sha256_file(path: &Utf8Path) -> Result<String, TaigaError> {
    let mut file =
        File::open(path.as_std_path()).map_err(|err| TaigaError::Filesystem(err.to_string()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| TaigaError::Filesystem(err.to_string()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn remove_if_exists(path: &Utf8Path) -> Result<(), TaigaError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TaigaError::Filesystem(err.to_string())),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Utf8Path) -> Result<(), TaigaError> {
    File::open(dir.as_std_path())
        .and_then(|handle| handle.sync_all())
        .map_err(|err| TaigaError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Utf8Path) -> Result<(), TaigaError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, Store::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let (_dir, store) = temp_store();
        let key: CanonicalKey = "ds-orig-x1.2/data".parse().unwrap();
        let path = store.datafile_path(&key, LocalFormat::ParquetTable);
        assert!(path.ends_with("files/ds-orig-x1/2/data.table.parquet"));
        assert!(store.index_path().ends_with("index.sqlite"));
    }

    #[test]
    fn escapes_file_names() {
        assert_eq!(escape_file_name("data"), "data");
        assert_eq!(escape_file_name("a b/c.csv"), "a%20b%2Fc.csv");
        assert_eq!(escape_file_name("é"), "%C3%A9");
    }

    #[test]
    fn persist_and_hash() {
        let (_dir, store) = temp_store();
        store.ensure_layout().unwrap();
        let key: CanonicalKey = "ds-a.1/raw".parse().unwrap();
        let mut temp = store.temp_file("test").unwrap();
        temp.write_all(b"abc").unwrap();
        let dest = store.datafile_path(&key, LocalFormat::Raw);
        store.persist_durable(temp, &dest).unwrap();

        assert_eq!(
            sha256_file(&dest).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        store.remove_datafile_artifacts(&key).unwrap();
        assert!(!dest.as_std_path().exists());
    }

    #[test]
    fn sweep_removes_partial_downloads() {
        let (_dir, store) = temp_store();
        store.ensure_layout().unwrap();
        let temp = store.temp_file("partial").unwrap();
        // Simulate a process that died before cleanup ran.
        let (_file, path) = temp.keep().unwrap();
        assert!(path.exists());
        assert_eq!(store.sweep_temp().unwrap(), 1);
        assert!(!path.exists());
    }
}
