use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TaigaError;

pub(crate) static DATAFILE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9-]+)\.([0-9]+)/(.+)$").expect("datafile id pattern is valid")
});

pub(crate) static DATASET_VERSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9-]+)\.([0-9]+)$").expect("dataset version id pattern is valid")
});

pub(crate) static PERMANAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("permaname pattern is valid"));

/// Semantic kind of a datafile. Decides which local representations are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    NumericMatrix,
    HeterogeneousTable,
    Raw,
}

impl DataType {
    /// Maps the `datafile_format` reported by Taiga.
    pub fn from_taiga_format(value: &str) -> Result<Self, TaigaError> {
        match value.trim() {
            "HDF5" | "hdf5" | "NumericMatrixCSV" => Ok(DataType::NumericMatrix),
            "Columnar" | "columnar" | "TableCSV" => Ok(DataType::HeterogeneousTable),
            "Raw" | "raw" => Ok(DataType::Raw),
            other => Err(TaigaError::UnexpectedResponse(format!(
                "unknown datafile format: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::NumericMatrix => "numeric_matrix",
            DataType::HeterogeneousTable => "heterogeneous_table",
            DataType::Raw => "raw",
        }
    }

    /// The representation the remote delivers; its hash anchors integrity.
    pub fn stored_format(self) -> LocalFormat {
        match self {
            DataType::NumericMatrix => LocalFormat::CsvMatrix,
            DataType::HeterogeneousTable => LocalFormat::CsvTable,
            DataType::Raw => LocalFormat::Raw,
        }
    }

    /// The representation `get` loads into memory, if any.
    pub fn artifact_format(self) -> Option<LocalFormat> {
        match self {
            DataType::NumericMatrix => Some(LocalFormat::FeatherMatrix),
            DataType::HeterogeneousTable => Some(LocalFormat::ParquetTable),
            DataType::Raw => None,
        }
    }

    pub fn allowed_formats(self) -> Vec<LocalFormat> {
        LocalFormat::ALL
            .iter()
            .copied()
            .filter(|format| conversion_plan(self, *format) != ConversionPlan::Forbidden)
            .collect()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "numeric_matrix" => Ok(DataType::NumericMatrix),
            "heterogeneous_table" => Ok(DataType::HeterogeneousTable),
            "raw" => Ok(DataType::Raw),
            other => Err(TaigaError::Index(format!("unknown data type: {other}"))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum LocalFormat {
    CsvMatrix,
    FeatherMatrix,
    CsvTable,
    ParquetTable,
    FeatherTable,
    Raw,
}

impl LocalFormat {
    pub const ALL: [LocalFormat; 6] = [
        LocalFormat::CsvMatrix,
        LocalFormat::FeatherMatrix,
        LocalFormat::CsvTable,
        LocalFormat::ParquetTable,
        LocalFormat::FeatherTable,
        LocalFormat::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocalFormat::CsvMatrix => "csv_matrix",
            LocalFormat::FeatherMatrix => "feather_matrix",
            LocalFormat::CsvTable => "csv_table",
            LocalFormat::ParquetTable => "parquet_table",
            LocalFormat::FeatherTable => "feather_table",
            LocalFormat::Raw => "raw",
        }
    }

    /// File name suffix of the backing file.
    pub fn suffix(&self) -> &'static str {
        match self {
            LocalFormat::CsvMatrix => "matrix.csv",
            LocalFormat::FeatherMatrix => "matrix.ftr",
            LocalFormat::CsvTable => "table.csv",
            LocalFormat::ParquetTable => "table.parquet",
            LocalFormat::FeatherTable => "table.ftr",
            LocalFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for LocalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LocalFormat {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        LocalFormat::ALL
            .iter()
            .copied()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| TaigaError::InvalidReference(format!("unknown local format: {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPlan {
    /// The format is what the remote delivers.
    Stored,
    /// The format is built locally from the stored representation.
    Derived,
    Forbidden,
}

pub fn conversion_plan(data_type: DataType, format: LocalFormat) -> ConversionPlan {
    use ConversionPlan::{Derived, Forbidden, Stored};
    use LocalFormat::{CsvMatrix, CsvTable, FeatherMatrix, FeatherTable, ParquetTable, Raw};

    match (data_type, format) {
        (DataType::NumericMatrix, CsvMatrix) => Stored,
        (DataType::NumericMatrix, FeatherMatrix) => Derived,
        (DataType::NumericMatrix, CsvTable | ParquetTable | FeatherTable | Raw) => Forbidden,
        (DataType::HeterogeneousTable, CsvTable) => Stored,
        (DataType::HeterogeneousTable, ParquetTable | FeatherTable) => Derived,
        (DataType::HeterogeneousTable, CsvMatrix | FeatherMatrix | Raw) => Forbidden,
        (DataType::Raw, Raw) => Stored,
        (DataType::Raw, CsvMatrix | FeatherMatrix | CsvTable | ParquetTable | FeatherTable) => {
            Forbidden
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    Number(u32),
    Latest,
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Number(number) => write!(f, "{number}"),
            VersionSpec::Latest => write!(f, "latest"),
        }
    }
}

impl FromStr for VersionSpec {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(VersionSpec::Latest);
        }
        trimmed
            .parse::<u32>()
            .map(VersionSpec::Number)
            .map_err(|_| TaigaError::InvalidReference(format!("invalid dataset version: {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Approved,
    Deprecated,
    Deleted,
}

impl FromStr for VersionState {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(VersionState::Approved),
            "deprecated" => Ok(VersionState::Deprecated),
            "deleted" => Ok(VersionState::Deleted),
            other => Err(TaigaError::UnexpectedResponse(format!(
                "unknown dataset version state: {other}"
            ))),
        }
    }
}

/// Identity of a real, non-virtual datafile: `permaname.version/file`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CanonicalKey {
    permaname: String,
    version: u32,
    file_name: String,
}

impl CanonicalKey {
    pub fn new(
        permaname: impl Into<String>,
        version: u32,
        file_name: impl Into<String>,
    ) -> Result<Self, TaigaError> {
        let permaname = permaname.into();
        let file_name = file_name.into();
        if !PERMANAME.is_match(&permaname) {
            return Err(TaigaError::InvalidReference(format!(
                "invalid dataset permaname: {permaname}"
            )));
        }
        if file_name.is_empty() {
            return Err(TaigaError::InvalidReference(format!(
                "missing datafile name for {permaname}.{version}"
            )));
        }
        Ok(Self {
            permaname,
            version,
            file_name,
        })
    }

    pub fn permaname(&self) -> &str {
        &self.permaname
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// `permaname.version`, the id of the dataset version holding this file.
    pub fn dataset_version_id(&self) -> String {
        format!("{}.{}", self.permaname, self.version)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.permaname, self.version, self.file_name)
    }
}

impl FromStr for CanonicalKey {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let caps = DATAFILE_ID.captures(trimmed).ok_or_else(|| {
            TaigaError::InvalidReference(format!(
                "{value} is not of the form permaname.version/file"
            ))
        })?;
        let version = caps[2]
            .parse::<u32>()
            .map_err(|_| TaigaError::InvalidReference(format!("invalid dataset version: {value}")))?;
        Self::new(&caps[1], version, &caps[3])
    }
}

impl From<CanonicalKey> for String {
    fn from(value: CanonicalKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for CanonicalKey {
    type Error = TaigaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_canonical_key() {
        let key: CanonicalKey = "ds-orig-x1.2/data".parse().unwrap();
        assert_eq!(key.permaname(), "ds-orig-x1");
        assert_eq!(key.version(), 2);
        assert_eq!(key.file_name(), "data");
        assert_eq!(key.to_string(), "ds-orig-x1.2/data");
        assert_eq!(key.dataset_version_id(), "ds-orig-x1.2");
    }

    #[test]
    fn canonical_key_keeps_slashes_in_file_name() {
        let key: CanonicalKey = "ds-abc.3/dir/table.csv".parse().unwrap();
        assert_eq!(key.file_name(), "dir/table.csv");
    }

    #[test]
    fn parse_canonical_key_invalid() {
        let err = "ds-abc/data".parse::<CanonicalKey>().unwrap_err();
        assert_matches!(err, TaigaError::InvalidReference(_));
    }

    #[test]
    fn conversion_legality() {
        assert_eq!(
            conversion_plan(DataType::NumericMatrix, LocalFormat::CsvMatrix),
            ConversionPlan::Stored
        );
        assert_eq!(
            conversion_plan(DataType::HeterogeneousTable, LocalFormat::FeatherTable),
            ConversionPlan::Derived
        );
        assert_eq!(
            conversion_plan(DataType::Raw, LocalFormat::ParquetTable),
            ConversionPlan::Forbidden
        );
        assert_eq!(DataType::Raw.allowed_formats(), vec![LocalFormat::Raw]);
        assert_eq!(
            DataType::HeterogeneousTable.allowed_formats(),
            vec![
                LocalFormat::CsvTable,
                LocalFormat::ParquetTable,
                LocalFormat::FeatherTable
            ]
        );
    }

    #[test]
    fn parse_local_format_accepts_dashes() {
        assert_eq!(
            "parquet-table".parse::<LocalFormat>().unwrap(),
            LocalFormat::ParquetTable
        );
    }

    #[test]
    fn map_taiga_formats() {
        assert_eq!(
            DataType::from_taiga_format("HDF5").unwrap(),
            DataType::NumericMatrix
        );
        assert_eq!(
            DataType::from_taiga_format("Columnar").unwrap(),
            DataType::HeterogeneousTable
        );
        assert_matches!(
            DataType::from_taiga_format("Unknown"),
            Err(TaigaError::UnexpectedResponse(_))
        );
    }
}
