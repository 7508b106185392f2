use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::domain::{CanonicalKey, DATAFILE_ID, DATASET_VERSION_ID, PERMANAME, VersionSpec};
use crate::error::TaigaError;

/// Parsed form of a user supplied datafile identifier.
///
/// Either `opaque_id` or `dataset_name` is set. When `dataset_name` is set,
/// `dataset_version` is set too (`Latest` when the caller gave none).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuredReference {
    pub opaque_id: Option<String>,
    pub dataset_name: Option<String>,
    pub dataset_version: Option<VersionSpec>,
    pub file_name: Option<String>,
}

impl StructuredReference {
    pub fn parse(
        raw_id: Option<&str>,
        name: Option<&str>,
        version: Option<VersionSpec>,
        file: Option<&str>,
    ) -> Result<Self, TaigaError> {
        let raw_id = raw_id.map(str::trim).filter(|value| !value.is_empty());
        let name = name.map(str::trim).filter(|value| !value.is_empty());
        let file = file.filter(|value| !value.is_empty());

        if let Some(id) = raw_id {
            return Self::parse_id(id, name, version, file);
        }

        let Some(name) = name else {
            if version.is_some() {
                return Err(TaigaError::InvalidReference(
                    "a dataset version was given without a dataset name".to_string(),
                ));
            }
            return Err(TaigaError::InvalidReference(
                "either an id or a dataset name is required".to_string(),
            ));
        };
        if !PERMANAME.is_match(name) {
            return Err(TaigaError::InvalidReference(format!(
                "invalid dataset permaname: {name}"
            )));
        }
        Ok(Self {
            opaque_id: None,
            dataset_name: Some(name.to_string()),
            dataset_version: Some(version.unwrap_or(VersionSpec::Latest)),
            file_name: file.map(str::to_string),
        })
    }

    fn parse_id(
        id: &str,
        name: Option<&str>,
        version: Option<VersionSpec>,
        file: Option<&str>,
    ) -> Result<Self, TaigaError> {
        if let Some(caps) = DATAFILE_ID.captures(id) {
            if name.is_some() || version.is_some() || file.is_some() {
                warn!(id, "id names a datafile; ignoring name, version and file arguments");
            }
            return Ok(Self {
                opaque_id: None,
                dataset_name: Some(caps[1].to_string()),
                dataset_version: Some(VersionSpec::Number(parse_version(id, &caps[2])?)),
                file_name: Some(caps[3].to_string()),
            });
        }

        if let Some(caps) = DATASET_VERSION_ID.captures(id) {
            if name.is_some() || version.is_some() {
                warn!(id, "id names a dataset version; ignoring name and version arguments");
            }
            return Ok(Self {
                opaque_id: None,
                dataset_name: Some(caps[1].to_string()),
                dataset_version: Some(VersionSpec::Number(parse_version(id, &caps[2])?)),
                file_name: file.map(str::to_string),
            });
        }

        if !id.contains(['.', '/']) {
            if name.is_some() || version.is_some() || file.is_some() {
                warn!(id, "opaque id given; ignoring name, version and file arguments");
            }
            return Ok(Self {
                opaque_id: Some(id.to_string()),
                dataset_name: None,
                dataset_version: None,
                file_name: None,
            });
        }

        Err(TaigaError::InvalidReference(format!(
            "{id} is neither permaname.version/file, permaname.version nor an opaque id"
        )))
    }

    pub fn from_key(key: &CanonicalKey) -> Self {
        Self {
            opaque_id: None,
            dataset_name: Some(key.permaname().to_string()),
            dataset_version: Some(VersionSpec::Number(key.version())),
            file_name: Some(key.file_name().to_string()),
        }
    }

    /// The fully qualified datafile this reference names, if it names one.
    /// The result may still be a virtual file.
    pub fn canonical_key(&self) -> Option<CanonicalKey> {
        match (&self.dataset_name, self.dataset_version, &self.file_name) {
            (Some(name), Some(VersionSpec::Number(version)), Some(file)) => {
                CanonicalKey::new(name.as_str(), version, file.as_str()).ok()
            }
            _ => None,
        }
    }

    pub fn is_latest(&self) -> bool {
        self.dataset_version == Some(VersionSpec::Latest)
    }

    /// Keys under which this reference may appear in the link table.
    /// A reference to "latest" moves with the remote and is never linked.
    pub fn link_keys(&self) -> Vec<String> {
        if let Some(id) = &self.opaque_id {
            return vec![id.clone()];
        }
        match (&self.dataset_name, self.dataset_version, &self.file_name) {
            (Some(name), Some(VersionSpec::Number(version)), Some(file)) => {
                vec![format!("{name}.{version}/{file}")]
            }
            (Some(name), Some(VersionSpec::Number(version)), None) => {
                vec![format!("{name}.{version}")]
            }
            _ => Vec::new(),
        }
    }

    pub fn with_file(&self, file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            ..self.clone()
        }
    }
}

fn parse_version(id: &str, digits: &str) -> Result<u32, TaigaError> {
    digits
        .parse::<u32>()
        .map_err(|_| TaigaError::InvalidReference(format!("version out of range in {id}")))
}

impl fmt::Display for StructuredReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.opaque_id {
            return write!(f, "{id}");
        }
        let name = self.dataset_name.as_deref().unwrap_or("?");
        match self.dataset_version {
            Some(VersionSpec::Number(version)) => write!(f, "{name}.{version}")?,
            _ => write!(f, "{name}@latest")?,
        }
        if let Some(file) = &self.file_name {
            write!(f, "/{file}")?;
        }
        Ok(())
    }
}

impl FromStr for StructuredReference {
    type Err = TaigaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(Some(value), None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_full_datafile_id() {
        let reference: StructuredReference = "ds-abc123.4/table1".parse().unwrap();
        assert_eq!(reference.dataset_name.as_deref(), Some("ds-abc123"));
        assert_eq!(reference.dataset_version, Some(VersionSpec::Number(4)));
        assert_eq!(reference.file_name.as_deref(), Some("table1"));
        assert_eq!(reference.link_keys(), vec!["ds-abc123.4/table1".to_string()]);
    }

    #[test]
    fn full_id_overrides_other_arguments() {
        let reference = StructuredReference::parse(
            Some("ds-abc123.4/table1"),
            Some("other"),
            Some(VersionSpec::Number(9)),
            Some("other-file"),
        )
        .unwrap();
        assert_eq!(reference.to_string(), "ds-abc123.4/table1");
    }

    #[test]
    fn dataset_version_id_takes_file_argument() {
        let reference =
            StructuredReference::parse(Some("ds-abc123.4"), None, None, Some("table1")).unwrap();
        assert_eq!(reference.file_name.as_deref(), Some("table1"));

        let reference = StructuredReference::parse(Some("ds-abc123.4"), None, None, None).unwrap();
        assert_eq!(reference.file_name, None);
        assert_eq!(reference.link_keys(), vec!["ds-abc123.4".to_string()]);
    }

    #[test]
    fn opaque_id() {
        let reference: StructuredReference = "7f3e9a0b12".parse().unwrap();
        assert_eq!(reference.opaque_id.as_deref(), Some("7f3e9a0b12"));
        assert_eq!(reference.dataset_name, None);
        assert_eq!(reference.canonical_key(), None);
    }

    #[test]
    fn name_without_version_is_latest() {
        let reference =
            StructuredReference::parse(None, Some("ds-abc123"), None, Some("table1")).unwrap();
        assert!(reference.is_latest());
        assert!(reference.link_keys().is_empty());
        assert_eq!(reference.to_string(), "ds-abc123@latest/table1");
    }

    #[test]
    fn version_without_name_is_rejected() {
        let err =
            StructuredReference::parse(None, None, Some(VersionSpec::Number(2)), None).unwrap_err();
        assert_matches!(err, TaigaError::InvalidReference(_));
    }

    #[test]
    fn nothing_to_resolve_is_rejected() {
        let err = StructuredReference::parse(Some("  "), None, None, Some("f")).unwrap_err();
        assert_matches!(err, TaigaError::InvalidReference(_));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for raw in ["ds-abc/file", "DS.1/file", "ds.x/file", "a.b.c"] {
            let err = raw.parse::<StructuredReference>().unwrap_err();
            assert_matches!(err, TaigaError::InvalidReference(_), "{raw}");
        }
    }

    #[test]
    fn invalid_permaname_is_rejected() {
        let err = StructuredReference::parse(None, Some("Has Space"), None, None).unwrap_err();
        assert_matches!(err, TaigaError::InvalidReference(_));
    }
}
