//! # cinnabar-store: Crash-Safe Single-File Record Store
//!
//! A persistent mapping from opaque byte-string keys to opaque byte-string
//! values, resident in one regular file and survivable under arbitrary
//! process or power failure at any point during any write — with no
//! separate log. Keys live in memory while the store is open; values stay
//! on disk and are read on demand.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────┬────────────────────┐
//! │ header (13B) │ index region         │ gap     │ data region        │
//! │ key limit,   │ fixed-size slots:    │ (index  │ value frames:      │
//! │ num_records, │ [key|crc][envelope]  │ growth) │ [len|payload|crc]  │
//! │ data start   │                      │         │ padded to capacity │
//! └──────────────┴──────────────────────┴─────────┴────────────────────┘
//! 0              13                     ▲         ▲                    EOF
//!                                       └─ grows ─┴─ data_start_ptr
//! ```
//!
//! Crash safety comes from write ordering alone: every operation ends in a
//! single commit write (the `num_records` field for inserts and deletes, the
//! envelope slot for updates), and recovery rebuilds the in-memory index
//! from the visible slots, tolerating the residue of whatever operation was
//! in flight. See the [`store`] module docs for the full protocol.
//!
//! # Example
//!
//! ```no_run
//! use cinnabar_store::{RecordStore, StoreConfig};
//!
//! # fn main() -> Result<(), cinnabar_store::StoreError> {
//! let mut store = RecordStore::create("app.db".as_ref(), StoreConfig::default())?;
//! store.insert(b"greeting", b"hello")?;
//! assert_eq!(&store.read(b"greeting")?[..], b"hello");
//! store.close()?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod error;
mod index;
mod store;

pub use config::{DEFAULT_MAX_KEY_LENGTH, StoreConfig};
pub use error::StoreError;
pub use store::{RecordStore, StoreStats};

// Re-exported so callers can supply their own backing file implementation.
pub use cinnabar_io::{IoError, StorageFile, SyncFile};
