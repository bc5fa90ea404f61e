use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::record::{Record, encode_key};
use crate::store::{CaskHandle, CaskStore, OpenMode, Store, StoreHandle, StoreOptions};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small files and eager merge rules so a few hundred writes produce
/// several files and a merge recommendation.
pub fn small_file_options() -> StoreOptions {
    init_tracing();
    StoreOptions {
        max_file_size: 1024,
        open_timeout: Duration::from_millis(200),
        frag_merge_trigger: 50,
        dead_bytes_merge_trigger: 64 * 1024,
        frag_threshold: 25,
        dead_bytes_threshold: 16 * 1024,
        small_file_threshold: 256,
        ..StoreOptions::default()
    }
}

pub fn open_writer(store: &CaskStore, path: &Path, options: &StoreOptions) -> CaskHandle {
    store
        .open(path, options, OpenMode::ReadWrite)
        .expect("open writer")
}

pub fn open_reader(store: &CaskStore, path: &Path, options: &StoreOptions) -> CaskHandle {
    store
        .open(path, options, OpenMode::ReadOnly)
        .expect("open reader")
}

/// Writes `Record { key, seq }` for every key in `1..=num_keys`.
pub fn write_pass(handle: &mut CaskHandle, num_keys: u32, seq: u64) {
    for key in 1..=num_keys {
        let value = Record::new(key, seq).to_value().unwrap();
        handle.put(&encode_key(key), &value).expect("put");
    }
}

/// Reads every key and returns the sequence numbers found.
pub fn read_all(handle: &CaskHandle, num_keys: u32) -> Vec<u64> {
    (1..=num_keys)
        .map(|key| {
            let value = handle
                .get(&encode_key(key))
                .expect("get")
                .unwrap_or_else(|| panic!("key {key} missing"));
            let record = Record::from_value(&value).expect("decode");
            assert_eq!(record.key, key);
            record.seq
        })
        .collect()
}
