//! End-to-end torture runs against the bundled `CaskStore`.
//!
//! These tests drive the whole harness (coordinator, workers, merger)
//! through the public `cask_torture` surface only, then reopen the store
//! directory from disk and check its final contents.
//!
//! ## Coverage areas
//! - **Single pass**: bootstrap, one steady pass, drain
//! - **Timed runs**: worker respawn, merges under load
//! - **Writer restarts**: exclusive writer lock released and reacquired
//! - **Early stop**: `StopHandle` ends an open-ended run
//! - **Durability**: final pass fully readable after the run

use std::path::Path;
use std::thread;
use std::time::Duration;

use cask_torture::record::{decode_key, encode_key};
use cask_torture::{
    CaskStore, FoldCheck, Harness, OpenMode, Record, Report, Store, StoreHandle, StoreOptions,
    TestConfig, WriterMode, run, verify_fold_keys,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

const NUM_KEYS: u32 = 500;

/// 4 KiB data files and eager merge rules so every pass rotates several
/// files and leaves the previous pass's files fully dead.
fn small_file_config(dir: &Path) -> TestConfig {
    TestConfig {
        num_keys: NUM_KEYS,
        path: dir.join("cask"),
        store: StoreOptions {
            max_file_size: 4096,
            open_timeout: Duration::from_secs(2),
            frag_merge_trigger: 50,
            dead_bytes_merge_trigger: 64 * 1024,
            frag_threshold: 25,
            dead_bytes_threshold: 16 * 1024,
            small_file_threshold: 512,
            ..StoreOptions::default()
        },
        readers: 2,
        folders: 1,
        key_folders: 1,
        mergers: 1,
        merge_check_interval: 50,
        status_interval: Duration::from_millis(100),
        writer_stop_timeout: Duration::from_secs(30),
        ..TestConfig::default()
    }
}

fn assert_clean(report: &Report) {
    assert!(report.passed(), "{report:?}");
    assert_eq!(report.counters.anomalies, 0, "{report:?}");
    assert_eq!(report.counters.pending_merges, 0);
    assert_eq!(report.counters.live_readers, 0);
    assert_eq!(report.counters.live_folders, 0);
    assert_eq!(report.counters.live_key_folders, 0);
}

/// Reopens the store from disk and checks that every key holds exactly the
/// final sequence and that a key fold is complete.
fn assert_store_at(path: &Path, seq: u64) {
    let store = CaskStore::new();
    let handle = store
        .open(path, &StoreOptions::default(), OpenMode::ReadOnly)
        .unwrap();

    for key in 1..=NUM_KEYS {
        let value = handle
            .get(&encode_key(key))
            .unwrap()
            .unwrap_or_else(|| panic!("key {key} missing"));
        assert_eq!(Record::from_value(&value).unwrap(), Record::new(key, seq));
    }

    let mut keys = handle
        .fold_keys(
            |raw, mut acc: Vec<u32>| {
                acc.push(decode_key(raw).unwrap());
                acc
            },
            Vec::new(),
        )
        .unwrap();
    keys.sort_unstable();
    assert_eq!(verify_fold_keys(&keys, NUM_KEYS), FoldCheck::Complete);
    handle.close().unwrap();
}

// ================================================================================================
// Runs
// ================================================================================================

/// # Scenario
/// No duration: initial population, one more pass, one round of each
/// reading role.
///
/// # Expected behavior
/// The run passes with no anomalies and the store holds sequence 2 for
/// every key.
#[test]
fn single_pass_against_cask_store() {
    let dir = TempDir::new().unwrap();
    let config = small_file_config(dir.path());
    let path = config.path.clone();

    let report = run(CaskStore::new(), config).unwrap();
    assert_clean(&report);
    assert_eq!(report.counters.current_seq, 2);
    assert_eq!(
        (
            report.counters.reads,
            report.counters.folds,
            report.counters.key_folds
        ),
        (2, 1, 1)
    );
    assert_store_at(&path, 2);
}

/// # Scenario
/// Half a second of steady state with merges checked every 50 keys.
///
/// # Expected behavior
/// Many passes complete, the merger runs, no reader ever sees a value
/// older than its baseline, and the final pass is intact on disk.
#[test]
fn timed_run_with_merges_under_load() {
    let dir = TempDir::new().unwrap();
    let config = TestConfig {
        duration: Some(Duration::from_millis(500)),
        ..small_file_config(dir.path())
    };
    let path = config.path.clone();

    let report = run(CaskStore::new(), config).unwrap();
    assert_clean(&report);
    assert!(report.counters.current_seq > 2, "{report:?}");
    assert!(report.counters.merges > 0, "{report:?}");
    assert_store_at(&path, report.counters.current_seq);
}

#[test]
fn restart_writer_each_pass() {
    let dir = TempDir::new().unwrap();
    let config = TestConfig {
        writer_mode: WriterMode::RestartEachPass,
        duration: Some(Duration::from_millis(300)),
        ..small_file_config(dir.path())
    };
    let path = config.path.clone();

    let report = run(CaskStore::new(), config).unwrap();
    assert_clean(&report);
    assert_store_at(&path, report.counters.current_seq);
}

#[test]
fn run_without_merger() {
    let dir = TempDir::new().unwrap();
    let config = TestConfig {
        mergers: 0,
        duration: Some(Duration::from_millis(200)),
        ..small_file_config(dir.path())
    };
    let path = config.path.clone();

    let report = run(CaskStore::new(), config).unwrap();
    assert_clean(&report);
    assert_eq!(report.counters.merges, 0);
    assert_store_at(&path, report.counters.current_seq);
}

#[test]
fn stop_handle_ends_open_ended_run() {
    let dir = TempDir::new().unwrap();
    let config = TestConfig {
        duration: Some(Duration::from_secs(3600)),
        ..small_file_config(dir.path())
    };
    let path = config.path.clone();

    let harness = Harness::new(CaskStore::new(), config).unwrap();
    let stop = harness.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stop.stop();
    });

    let report = harness.run().unwrap();
    stopper.join().unwrap();
    assert_clean(&report);
    assert_store_at(&path, report.counters.current_seq);
}

/// # Scenario
/// A previous run left data behind at the same path.
///
/// # Expected behavior
/// The directory is destroyed first, so the new run starts from
/// sequence 1 and the old values never surface.
#[test]
fn rerun_at_same_path_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let timed = TestConfig {
        duration: Some(Duration::from_millis(200)),
        ..small_file_config(dir.path())
    };
    let first = run(CaskStore::new(), timed).unwrap();
    assert!(first.counters.current_seq > 2);

    let config = small_file_config(dir.path());
    let path = config.path.clone();
    let second = run(CaskStore::new(), config).unwrap();
    assert_clean(&second);
    assert_store_at(&path, 2);
}
