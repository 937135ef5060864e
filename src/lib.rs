// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, persistent, ordered key-value store based on a
//! log-structured merge tree.
//!
//! Writes land in a write-ahead log and an in-memory table, then
//! migrate into immutable sorted table files organized into levels,
//! which a background task keeps compacting. Reads see a consistent
//! view at a sequence number; snapshots pin such a view for as long
//! as they live.
//!
//! Keys and values are opaque byte strings, ordered bytewise. Keys
//! are limited to 65536 bytes, values are limited to 2^32 bytes.
//!
//! # Example usage
//!
//! ```
//! use lsm_kv::{Config, ReadOptions, WriteOptions};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder).open()?;
//!
//! let write_opts = WriteOptions::default();
//! db.put("my_key", "my_value", &write_opts)?;
//!
//! let read_opts = ReadOptions::default();
//! let item = db.get("my_key", &read_opts)?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! // Reads through a snapshot are stable
//! let snapshot = db.snapshot();
//!
//! db.delete("my_key", &write_opts)?;
//! assert_eq!(None, db.get("my_key", &read_opts)?);
//!
//! let mut stable_opts = ReadOptions::default();
//! stable_opts.snapshot = Some(snapshot);
//! assert_eq!(Some("my_value".as_bytes().into()), db.get("my_key", &stable_opts)?);
//!
//! // Iterators see keys in order
//! for item in db.iter(&read_opts)? {
//!   let (key, value) = item?;
//!   // ...
//! }
//! #
//! # Ok::<(), lsm_kv::Error>(())
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

mod batch;

#[doc(hidden)]
pub mod cache;

mod checksum;

#[doc(hidden)]
pub mod coding;

mod comparator;
mod compaction;
mod compression;
mod config;
mod db;
mod error;

#[doc(hidden)]
pub mod file;

mod filter;
mod info_log;

#[doc(hidden)]
pub mod key;

#[doc(hidden)]
pub mod memtable;

#[doc(hidden)]
pub mod merge;

mod slice;
mod snapshot;
mod stop_signal;

#[doc(hidden)]
pub mod table;

#[doc(hidden)]
pub mod table_cache;

mod value;

#[doc(hidden)]
pub mod version;

#[doc(hidden)]
pub mod wal;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use {
    key::InternalKey,
    merge::{BoxedIterator, MergeIterator},
    value::InternalValue,
    version::{FileId, FileMetaData, VersionEdit},
};

pub use {
    batch::WriteBatch,
    cache::Cache,
    coding::{DecodeError, EncodeError},
    comparator::{BytewiseComparator, Comparator},
    compression::CompressionType,
    config::{Config, ReadOptions, WriteOptions},
    db::{destroy_db, Db, DbIterator},
    error::{Error, Result},
    filter::{BloomPolicy, FilterPolicy},
    slice::Slice,
    snapshot::Snapshot,
    value::{SeqNo, ValueType},
};

/// User defined key
pub type UserKey = Slice;

/// User defined data (byte array)
pub type UserValue = Slice;
