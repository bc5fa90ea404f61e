//! # cask-torture
//!
//! A concurrency torture test for log-structured key-value stores. One
//! writer repeatedly rewrites a fixed key space with an increasing sequence
//! number while readers, folders, key-folders and a merger hammer the same
//! store directory. Every value read is checked against the sequence that
//! was fully written when the reading worker started; every fold is checked
//! to visit each key exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cask_torture::{CaskStore, TestConfig, run};
//!
//! let config = TestConfig {
//!     path: "/tmp/cask-torture".into(),
//!     num_keys: 10_000,
//!     readers: 4,
//!     duration: Some(Duration::from_secs(60)),
//!     ..TestConfig::default()
//! };
//!
//! let report = run(CaskStore::new(), config).unwrap();
//! println!("{report:?}");
//! ```
//!
//! ## Features
//!
//! - **Baseline checks**: a read may observe a newer value, never an older one.
//! - **Fold verification**: gaps, duplicates and foreign keys are reported.
//! - **Merge under load**: compaction runs concurrently with every reader.
//! - **Writer restarts**: optionally reopen the writer after every pass.
//! - **Bundled store**: [`CaskStore`], an append-only engine with a shared
//!   key directory; any engine implementing [`Store`] can be tested instead.

pub mod config;
pub mod encoding;
pub mod harness;
pub mod record;
pub mod store;
pub mod verify;

pub use config::{ConfigError, TestConfig, WriterMode};
pub use harness::{Counters, Harness, HarnessError, Outcome, Report, StopHandle, run};
pub use record::Record;
pub use store::{
    CaskHandle, CaskStore, FileSet, OpenMode, Store, StoreError, StoreHandle, StoreOptions,
};
pub use verify::{FoldCheck, StaleRead, check_sequence, verify_fold_keys};
