//! # cinnabar-io: Byte-File Abstraction for Cinnabar
//!
//! This crate provides a trait-based abstraction over a single seekable
//! byte file, enabling the storage layer to run over different backends:
//!
//! - [`SyncFile`] (default): standard `std::fs` operations
//! - Test doubles: in-memory or fault-injecting implementations of
//!   [`StorageFile`], used by the store's crash-recovery tests
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │      cinnabar-store       │
//! │  (uses StorageFile trait) │
//! └─────────────┬─────────────┘
//!               │
//! ┌─────────────┴─────────────┐
//! │        cinnabar-io        │
//! │  ┌──────────┐ ┌─────────┐ │
//! │  │ SyncFile │ │  mocks  │ │
//! │  └──────────┘ └─────────┘ │
//! └───────────────────────────┘
//! ```
//!
//! The trait promises nothing beyond what a POSIX file gives: a torn write
//! may leave arbitrary bytes in the affected range, and durability requires
//! an explicit [`StorageFile::fsync`].

mod error;
mod file;
mod sync_file;

pub use error::IoError;
pub use file::StorageFile;
pub use sync_file::SyncFile;
