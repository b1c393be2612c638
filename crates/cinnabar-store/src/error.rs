//! Error types for the record store.

use cinnabar_io::IoError;

/// Errors returned by store operations.
///
/// Validation errors (`DuplicateKey`, `NotFound`, `KeyTooLong`, `EmptyKey`,
/// `ValueTooLarge`) abort an operation before any file mutation. Integrity
/// and I/O errors observed mid-operation move the store to the broken state;
/// the only sound remedy is to close and reopen, which re-derives the
/// in-memory indices from disk.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Insert with a key that is already present.
    #[error("key already exists")]
    DuplicateKey,

    /// Read, update, or delete on a missing key.
    #[error("key not found")]
    NotFound,

    /// Key exceeds the per-file key length limit.
    #[error("key of {length} bytes exceeds the limit of {max}")]
    KeyTooLong { length: usize, max: usize },

    /// Keys must contain at least one byte.
    #[error("empty key")]
    EmptyKey,

    /// Framed value would not fit a 32-bit length field.
    #[error("value of {length} bytes exceeds the frame size limit")]
    ValueTooLarge { length: usize },

    /// Failure from the I/O backend; a partial write may have happened.
    #[error("I/O failure: {source}")]
    Io {
        #[from]
        source: IoError,
    },

    /// An envelope failed its CRC check on decode.
    #[error("corrupt record envelope in index slot {slot}")]
    CorruptHeader { slot: u32 },

    /// A key slot failed its CRC or length check on decode.
    #[error("corrupt key in index slot {slot}")]
    CorruptKey { slot: u32 },

    /// A value frame declared a length outside its envelope capacity.
    #[error("corrupt value frame at offset {offset}")]
    CorruptValue { offset: u64 },

    /// Payload bytes do not match the stored value CRC.
    #[error("value CRC mismatch at offset {offset}")]
    CrcMismatch { offset: u64 },

    /// The file violates a structural invariant.
    #[error("corrupt file: {detail}")]
    CorruptFile { detail: String },

    /// The file was created with a different key length limit.
    #[error("max key length mismatch: expected {expected}, file has {actual}")]
    MaxKeyLengthMismatch { expected: u8, actual: u8 },

    /// Configuration rejected before touching the file.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: &'static str },

    /// Operation on a closed or broken store.
    #[error("store is {state}")]
    IllegalState { state: &'static str },
}

impl StoreError {
    /// True when the error leaves the in-memory indices suspect.
    ///
    /// A fatal error moves the store to the broken state; validation errors
    /// never do.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::CorruptHeader { .. }
                | Self::CorruptKey { .. }
                | Self::CorruptValue { .. }
                | Self::CrcMismatch { .. }
                | Self::CorruptFile { .. }
        )
    }
}
