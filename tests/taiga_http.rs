use assert_matches::assert_matches;

use taiga_cache::domain::{DataType, VersionState};
use taiga_cache::error::TaigaError;
use taiga_cache::taiga_http::{DatafilePayload, DatasetVersionPayload};

const DATASET_VERSION: &str = r#"{
    "dataset": {
        "permanames": ["old-name-1a2b", "expression-7f3e"],
        "versions": [
            {"name": "1", "state": "approved"},
            {"name": "2", "state": "deprecated"}
        ]
    },
    "datasetVersion": {
        "name": "2",
        "state": "deprecated",
        "reason_state": "wrong normalisation",
        "datafiles": [
            {"name": "counts", "type": "HDF5", "original_file_sha256": "ABCDEF"},
            {"name": "samples", "type": "Columnar", "underlying_file_id": "meta-9c1d.3/samples"},
            {"name": "readme", "type": "Raw"}
        ]
    }
}"#;

#[test]
fn dataset_version_payload_maps_files() {
    let payload: DatasetVersionPayload = serde_json::from_str(DATASET_VERSION).unwrap();
    let listing = payload.into_metadata("old-name-1a2b").unwrap();

    assert_eq!(listing.permaname, "old-name-1a2b");
    assert_eq!(listing.version, 2);
    assert_eq!(listing.state, VersionState::Deprecated);
    assert_eq!(listing.reason_state.as_deref(), Some("wrong normalisation"));
    assert_eq!(listing.file_names(), vec!["counts", "samples", "readme"]);

    let counts = listing.file("counts").unwrap();
    assert_eq!(counts.data_type, DataType::NumericMatrix);
    assert_eq!(counts.key.to_string(), "old-name-1a2b.2/counts");
    assert!(!counts.is_virtual());

    let samples = listing.file("samples").unwrap();
    assert!(samples.is_virtual());
    assert_eq!(samples.real_key().to_string(), "meta-9c1d.3/samples");
    assert_eq!(listing.file("readme").unwrap().data_type, DataType::Raw);
}

#[test]
fn unknown_requested_name_uses_current_permaname() {
    let payload: DatasetVersionPayload = serde_json::from_str(DATASET_VERSION).unwrap();
    let listing = payload.into_metadata("f00dcafe").unwrap();
    assert_eq!(listing.permaname, "expression-7f3e");
}

#[test]
fn unknown_datafile_format_is_rejected() {
    let payload: DatafilePayload = serde_json::from_str(
        r#"{
            "dataset_permaname": "ds-a",
            "dataset_version": 1,
            "datafile_name": "x",
            "state": "approved",
            "datafile_format": "Spreadsheet"
        }"#,
    )
    .unwrap();
    assert_matches!(payload.into_metadata(), Err(TaigaError::UnexpectedResponse(_)));
}
