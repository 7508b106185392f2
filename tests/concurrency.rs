mod common;

use std::thread;
use std::time::Duration;

use taiga_cache::app::{FetchOptions, FetchSource, FormatRequest};
use taiga_cache::domain::DataType;

use common::{MATRIX_CSV, MockRemote, TABLE_CSV, open_app, reference};

#[test]
fn concurrent_requests_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.add_file("ds-a.1/data", DataType::HeterogeneousTable, TABLE_CSV);
    remote.set_delay(Duration::from_millis(100));
    let app = open_app(&dir, &remote);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    app.download_to_cache(
                        &reference("ds-a.1/data"),
                        FormatRequest::Stored,
                        FetchOptions::default(),
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(remote.download_calls(), 1);
    let downloaded = results
        .iter()
        .filter(|file| file.source == FetchSource::Downloaded)
        .count();
    assert_eq!(downloaded, 1);
    assert!(results.iter().all(|file| file.path == results[0].path));
}

#[test]
fn concurrent_format_requests_download_once() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.add_file("ds-m.1/expr", DataType::NumericMatrix, MATRIX_CSV);
    remote.set_delay(Duration::from_millis(50));
    let app = open_app(&dir, &remote);

    thread::scope(|scope| {
        let stored = scope.spawn(|| {
            app.download_to_cache(
                &reference("ds-m.1/expr"),
                FormatRequest::Stored,
                FetchOptions::default(),
            )
        });
        let artifact = scope.spawn(|| app.get(&reference("ds-m.1/expr"), FetchOptions::default()));
        stored.join().unwrap().unwrap();
        artifact.join().unwrap().unwrap();
    });

    assert_eq!(remote.download_calls(), 1);
}

#[test]
fn distinct_files_download_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    for name in ["a", "b", "c", "d"] {
        remote.add_file(&format!("ds-p.1/{name}"), DataType::Raw, name);
    }
    let app = open_app(&dir, &remote);

    thread::scope(|scope| {
        for name in ["a", "b", "c", "d"] {
            let app = &app;
            scope.spawn(move || {
                app.download_to_cache(
                    &reference(&format!("ds-p.1/{name}")),
                    FormatRequest::Stored,
                    FetchOptions::default(),
                )
                .unwrap();
            });
        }
    });

    assert_eq!(remote.download_calls(), 4);
    assert_eq!(app.list().unwrap().entries.len(), 4);
}

#[test]
fn force_waiting_on_older_download_fetches_again() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.add_file("ds-a.1/data", DataType::Raw, "payload");
    remote.set_delay(Duration::from_millis(100));
    let app = open_app(&dir, &remote);
    let force = FetchOptions {
        force: true,
        ..FetchOptions::default()
    };

    let (plain, forced) = thread::scope(|scope| {
        let plain = scope.spawn(|| {
            app.download_to_cache(&reference("ds-a.1/data"), FormatRequest::Stored, FetchOptions::default())
        });
        // The plain fetch holds the key once its download has started.
        while remote.download_calls() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let forced = app.download_to_cache(&reference("ds-a.1/data"), FormatRequest::Stored, force);
        (plain.join().unwrap().unwrap(), forced.unwrap())
    });

    assert_eq!(plain.source, FetchSource::Downloaded);
    assert_eq!(forced.source, FetchSource::Downloaded);
    assert_eq!(remote.download_calls(), 2);
}
