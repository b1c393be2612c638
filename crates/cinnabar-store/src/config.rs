//! Store configuration.
//!
//! All knobs arrive through [`StoreConfig`]; the store never consults the
//! environment itself.

use serde::{Deserialize, Serialize};

/// Default per-file key length limit.
pub const DEFAULT_MAX_KEY_LENGTH: u8 = 64;

/// Format and behavior options for a record store.
///
/// `max_key_length` and `initial_size` only matter at [`create`] time; the
/// key length limit is frozen into the file header. `value_crc_enabled` is a
/// caller contract rather than a header bit: every writer and reader of one
/// file must agree on it, and the two modes are wire-compatible as long as
/// they do.
///
/// [`create`]: crate::RecordStore::create
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-file key length limit, 6..=252, frozen at create.
    ///
    /// Keys may use at most `max_key_length - 5` bytes; the remainder of a
    /// key slot holds the length byte and the key CRC. Values below 6 leave
    /// no room for any key and are rejected.
    pub max_key_length: u8,

    /// Requested file size at create.
    ///
    /// Pre-extends the data region start, reserving room for index growth
    /// so early inserts never need to relocate data records.
    pub initial_size: u64,

    /// Frame every value with a CRC-32 trailer.
    pub value_crc_enabled: bool,

    /// Round value frame capacities up to one index slot.
    ///
    /// Keeps index expansion cheap: a relocated record always frees at
    /// least one slot's worth of space in front of the data region.
    pub pad_data_to_index_entry: bool,

    /// Permit shrinking a value inside its frame even without value CRCs.
    ///
    /// Without a value CRC a torn write to the length field is undetectable,
    /// so shrink-in-place is refused unless the application asserts it has
    /// its own integrity check by setting this.
    pub allow_in_place_shrink: bool,

    /// When set, `open` rejects files whose frozen key length limit differs.
    ///
    /// The limit determines the slot size; opening a file with the wrong
    /// expectation would misread every slot boundary.
    pub expected_max_key_length: Option<u8>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            initial_size: 0,
            value_crc_enabled: true,
            pad_data_to_index_entry: true,
            allow_in_place_shrink: false,
            expected_max_key_length: None,
        }
    }
}

impl StoreConfig {
    /// True when an existing value may be shrunk inside its frame.
    pub(crate) fn in_place_shrink_allowed(&self) -> bool {
        self.value_crc_enabled || self.allow_in_place_shrink
    }
}
