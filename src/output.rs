use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CachedFile, ListResult, VersionFetchResult};
use crate::domain::{CanonicalKey, LocalFormat};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_cached(file: &CachedFile) -> io::Result<()> {
        Self::print_json(file)
    }

    pub fn print_canonical_id(key: &CanonicalKey) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ "canonical_id": key }))
    }

    pub fn print_formats(key: &str, formats: &[LocalFormat]) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ "reference": key, "formats": formats }))
    }

    pub fn print_invalidated(key: &CanonicalKey) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ "invalidated": key }))
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_version(result: &VersionFetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
