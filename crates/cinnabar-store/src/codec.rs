//! On-disk framing and CRC codec.
//!
//! Everything the store persists is encoded here: the fixed file header,
//! the fixed-size index slots (key area + envelope), and the value frames
//! in the data region. All integers are big-endian; every checksum is
//! CRC-32/IEEE (polynomial 0xEDB88320, reflected).
//!
//! # File Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Offset          │  Size        │  Description                    │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  0               │  1           │  max_key_length (u8, 6..=252)   │
//! │  1               │  4           │  num_records (i32)              │
//! │  5               │  8           │  data_start_ptr (i64)           │
//! │  13              │  N × slot    │  index slots                    │
//! │  data_start_ptr  │  …file end   │  value frames                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One index slot is `max_key_length + 24` bytes:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  key area (max_key_length + 4 bytes)  │  envelope (20 bytes)      │
//! │  [L:u8][key:L][crc32(key):u32][pad…]  │  [data_pointer:i64]       │
//! │                                       │  [data_capacity:i32]      │
//! │                                       │  [data_count:i32]         │
//! │                                       │  [crc32(first 16):u32]    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A value frame occupies `data_capacity` bytes starting at `data_pointer`;
//! its live prefix is `[len:i32][payload:len][crc32(payload):u32]`, the CRC
//! trailer present only when the store runs with value CRCs. The remainder
//! of the frame is free space with undefined contents.

use bytes::Bytes;

use crate::StoreError;

/// Fixed file header length in bytes.
pub const FILE_HEADER_LEN: u64 = 13;

/// Envelope length in bytes: pointer(8) + capacity(4) + count(4) + crc(4).
pub const ENVELOPE_LEN: usize = 20;

/// Key area overhead: length byte + key CRC.
pub const KEY_OVERHEAD: usize = 5;

/// Value frame length-field width.
pub const LEN_FIELD: u32 = 4;

/// Value frame CRC trailer width, when enabled.
pub const VALUE_CRC_LEN: u32 = 4;

/// Smallest permitted `max_key_length`: the key area must fit the length
/// byte, at least one key byte, and the 4-byte key CRC.
pub const MIN_MAX_KEY_LENGTH: u8 = KEY_OVERHEAD as u8 + 1;

/// Largest permitted `max_key_length`.
pub const MAX_MAX_KEY_LENGTH: u8 = 252;

/// Width of one key area for a given key length limit.
pub(crate) fn key_area_len(max_key_length: u8) -> usize {
    max_key_length as usize + 4
}

/// Width of one index slot for a given key length limit.
pub(crate) fn slot_len(max_key_length: u8) -> u64 {
    max_key_length as u64 + 24
}

/// Largest key the store accepts under a given key length limit.
pub(crate) fn usable_key_len(max_key_length: u8) -> usize {
    debug_assert!(max_key_length >= MIN_MAX_KEY_LENGTH);
    max_key_length as usize - KEY_OVERHEAD
}

// ============================================================================
// File header
// ============================================================================

/// Decoded fixed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub max_key_length: u8,
    pub num_records: u32,
    pub data_start_ptr: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN as usize] {
        let mut buf = [0u8; FILE_HEADER_LEN as usize];
        buf[0] = self.max_key_length;
        buf[1..5].copy_from_slice(&(self.num_records as i32).to_be_bytes());
        buf[5..13].copy_from_slice(&(self.data_start_ptr as i64).to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FILE_HEADER_LEN as usize]) -> Result<Self, StoreError> {
        let max_key_length = buf[0];
        if !(MIN_MAX_KEY_LENGTH..=MAX_MAX_KEY_LENGTH).contains(&max_key_length) {
            return Err(StoreError::CorruptFile {
                detail: format!(
                    "max_key_length {max_key_length} outside \
                     {MIN_MAX_KEY_LENGTH}..={MAX_MAX_KEY_LENGTH}"
                ),
            });
        }

        let num_records = i32::from_be_bytes(buf[1..5].try_into().expect("4-byte slice"));
        if num_records < 0 {
            return Err(StoreError::CorruptFile {
                detail: format!("negative num_records {num_records}"),
            });
        }

        let data_start_ptr = i64::from_be_bytes(buf[5..13].try_into().expect("8-byte slice"));
        if data_start_ptr < FILE_HEADER_LEN as i64 {
            return Err(StoreError::CorruptFile {
                detail: format!("data_start_ptr {data_start_ptr} precedes the file header"),
            });
        }

        Ok(Self {
            max_key_length,
            num_records: num_records as u32,
            data_start_ptr: data_start_ptr as u64,
        })
    }
}

// ============================================================================
// Key slots
// ============================================================================

/// Encodes a key into its slot area: `[L][key][crc32(key)]`.
///
/// Trailing bytes of the area are not emitted; they keep whatever the file
/// held before.
pub(crate) fn encode_key_slot(key: &[u8]) -> Vec<u8> {
    debug_assert!(!key.is_empty() && key.len() <= u8::MAX as usize);

    let mut buf = Vec::with_capacity(1 + key.len() + 4);
    buf.push(key.len() as u8);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&crc32fast::hash(key).to_be_bytes());
    buf
}

/// Decodes a key slot area.
///
/// # Errors
///
/// Returns [`StoreError::CorruptKey`] when the length byte is zero or past
/// the usable limit, or when the key CRC does not match.
pub(crate) fn decode_key_slot(
    area: &[u8],
    max_key_length: u8,
    slot: u32,
) -> Result<Bytes, StoreError> {
    debug_assert_eq!(area.len(), key_area_len(max_key_length));

    let len = area[0] as usize;
    if len == 0 || len > usable_key_len(max_key_length) {
        return Err(StoreError::CorruptKey { slot });
    }

    let key = &area[1..1 + len];
    let stored_crc = u32::from_be_bytes(
        area[1 + len..1 + len + 4]
            .try_into()
            .expect("4-byte slice after bounds check"),
    );
    if stored_crc != crc32fast::hash(key) {
        return Err(StoreError::CorruptKey { slot });
    }

    Ok(Bytes::copy_from_slice(key))
}

// ============================================================================
// Envelopes
// ============================================================================

/// The 20-byte record header describing one value frame.
///
/// `index_position` is an in-memory affordance only; it is never persisted
/// and is reassigned whenever a swap-delete moves the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Envelope {
    /// Absolute offset of the value frame.
    pub data_pointer: u64,
    /// Bytes reserved for the frame.
    pub data_capacity: u32,
    /// Bytes of live payload inside the frame.
    pub data_count: u32,
    /// Slot this envelope currently occupies.
    pub index_position: u32,
}

impl Envelope {
    pub fn encode(&self) -> [u8; ENVELOPE_LEN] {
        let mut buf = [0u8; ENVELOPE_LEN];
        buf[0..8].copy_from_slice(&(self.data_pointer as i64).to_be_bytes());
        buf[8..12].copy_from_slice(&(self.data_capacity as i32).to_be_bytes());
        buf[12..16].copy_from_slice(&(self.data_count as i32).to_be_bytes());
        let crc = crc32fast::hash(&buf[0..16]);
        buf[16..20].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes an envelope, verifying its CRC.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptHeader`] on CRC mismatch or negative
    /// fields.
    pub fn decode(buf: &[u8], index_position: u32) -> Result<Self, StoreError> {
        debug_assert_eq!(buf.len(), ENVELOPE_LEN);

        let stored_crc = u32::from_be_bytes(buf[16..20].try_into().expect("4-byte slice"));
        if stored_crc != crc32fast::hash(&buf[0..16]) {
            return Err(StoreError::CorruptHeader {
                slot: index_position,
            });
        }

        let data_pointer = i64::from_be_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let data_capacity = i32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let data_count = i32::from_be_bytes(buf[12..16].try_into().expect("4-byte slice"));
        if data_pointer < 0 || data_capacity < 0 || data_count < 0 {
            return Err(StoreError::CorruptHeader {
                slot: index_position,
            });
        }

        Ok(Self {
            data_pointer: data_pointer as u64,
            data_capacity: data_capacity as u32,
            data_count: data_count as u32,
            index_position,
        })
    }

    /// Bytes of the frame holding live data: length field, payload, CRC.
    pub fn live_len(&self, value_crc: bool) -> u32 {
        LEN_FIELD + self.data_count + if value_crc { VALUE_CRC_LEN } else { 0 }
    }

    /// Reusable bytes at the tail of the frame.
    pub fn free_space(&self, value_crc: bool) -> u32 {
        self.data_capacity - self.live_len(value_crc)
    }

    /// One past the last byte of the frame.
    pub fn end(&self) -> u64 {
        self.data_pointer + u64::from(self.data_capacity)
    }
}

// ============================================================================
// Value frames
// ============================================================================

/// Live bytes a value of `value_len` needs inside its frame.
pub(crate) fn framed_len(value_len: usize, value_crc: bool) -> u64 {
    u64::from(LEN_FIELD) + value_len as u64 + if value_crc { u64::from(VALUE_CRC_LEN) } else { 0 }
}

/// Encodes the live prefix of a value frame.
pub(crate) fn encode_value_frame(payload: &[u8], value_crc: bool) -> Vec<u8> {
    debug_assert!(framed_len(payload.len(), value_crc) <= i32::MAX as u64);

    let mut buf = Vec::with_capacity(framed_len(payload.len(), value_crc) as usize);
    buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    if value_crc {
        buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    }
    buf
}
