//! The record store engine: allocation, index management, operations, and
//! recovery over one backing file.
//!
//! # Crash Safety Model
//!
//! The store survives arbitrary process or power failure between any two
//! file mutations without a separate log. Every operation is an ordered
//! sequence of single writes, and each sequence ends in one commit write:
//!
//! - insert: value frame → key slot → envelope slot → `num_records` bump
//!   (commit). Before the bump, the new slot lies beyond the visible index
//!   and recovery ignores it.
//! - delete: the last slot is copied over the victim's slot, then
//!   `num_records` is decremented (commit). A crash in between leaves the
//!   moved key present in two slots; recovery resolves the duplicate and the
//!   next mutation completes the interrupted delete.
//! - update in place: the value frame is rewritten between two envelope
//!   writes; the frame's own length field and CRC bound the payload at every
//!   intermediate point.
//! - update with relocation: the new frame is written before the envelope
//!   swings over to it (commit), and only then is the old frame's space
//!   reclaimed.
//!
//! Writes are durable only after [`RecordStore::sync`] or
//! [`RecordStore::close`]; crash safety concerns ordering, not durability.
//!
//! # Space Management
//!
//! The fixed-size index region grows into a reserved gap in front of the
//! data region. The allocator fills that gap from the top, reuses the free
//! tails of existing frames smallest-fit-first, and extends the file as a
//! last resort. When the gap is exhausted the index manager relocates the
//! front-most data records to the end of the file. Deleted frames are
//! reclaimed by truncation (tail), by merging into the preceding frame, or
//! by advancing the data region start.
//!
//! # State Machine
//!
//! ```text
//! NEW ──create/open ok──▶ OPEN ──close──▶ CLOSED
//!                          │
//!                          └──I/O or integrity error──▶ BROKEN
//! ```
//!
//! A broken store refuses every operation; its in-memory index may no longer
//! match the file. Closing and reopening re-derives the index from disk.

use std::path::Path;

use bytes::Bytes;
use cinnabar_io::{StorageFile, SyncFile};

use crate::codec::{
    self, Envelope, FILE_HEADER_LEN, FileHeader, MAX_MAX_KEY_LENGTH, MIN_MAX_KEY_LENGTH,
};
use crate::index::MemIndex;
use crate::{StoreConfig, StoreError};

/// Byte offset of the `num_records` header field.
const NUM_RECORDS_OFFSET: u64 = 1;

/// Byte offset of the `data_start_ptr` header field.
const DATA_START_PTR_OFFSET: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Open,
    Closed,
    Broken,
}

impl StoreState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Broken => "broken",
        }
    }
}

/// Space accounting snapshot for one open store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of records.
    pub records: usize,
    /// Backing file length in bytes.
    pub file_length: u64,
    /// First offset of the data region.
    pub data_start_ptr: u64,
    /// Unused bytes between the index region and the data region.
    pub prefix_gap_bytes: u64,
    /// Reusable bytes inside existing value frames.
    pub interior_free_bytes: u64,
}

/// A crash-safe, single-file key–value record store.
///
/// Keys are opaque byte strings up to `max_key_length - 5` bytes and live in
/// memory while the store is open; values are opaque byte strings read from
/// disk on demand. All operations take `&mut self`, which serializes callers
/// exactly like the one logical lock the format assumes.
#[derive(Debug)]
pub struct RecordStore {
    file: Box<dyn StorageFile>,
    config: StoreConfig,
    /// Key length limit frozen in the file header.
    max_key_length: u8,
    /// Width of one index slot, derived from `max_key_length`.
    slot_size: u64,
    /// Mirror of the `num_records` header field.
    num_records: u32,
    /// Mirror of the `data_start_ptr` header field.
    data_start_ptr: u64,
    /// Cached file length; updated on every resize.
    file_len: u64,
    index: MemIndex,
    state: StoreState,
    /// Set when recovery found swap-delete residue to complete.
    needs_heal: bool,
}

impl RecordStore {
    // ========================================================================
    // Construction and recovery
    // ========================================================================

    /// Creates a new store file at `path`. Fails if the file exists.
    pub fn create(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        Self::validate_config(&config)?;
        let file = SyncFile::create(path)?;
        Self::create_with_file(Box::new(file), config)
    }

    /// Opens an existing store file at `path`.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let file = SyncFile::open(path)?;
        Self::open_with_file(Box::new(file), config)
    }

    /// Creates a new store over an arbitrary backing file.
    ///
    /// The file must be empty. `config.initial_size` pre-extends the data
    /// region start so the index can grow without relocating data records.
    pub fn create_with_file(
        mut file: Box<dyn StorageFile>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        Self::validate_config(&config)?;

        let data_start_ptr = config.initial_size.max(FILE_HEADER_LEN);
        let header = FileHeader {
            max_key_length: config.max_key_length,
            num_records: 0,
            data_start_ptr,
        };

        file.set_len(data_start_ptr)?;
        file.seek(0)?;
        file.write_all(&header.encode())?;
        file.fsync()?;

        tracing::info!(
            max_key_length = config.max_key_length,
            initial_size = config.initial_size,
            value_crc = config.value_crc_enabled,
            "created record store"
        );

        let value_crc = config.value_crc_enabled;
        let slot_size = codec::slot_len(config.max_key_length);
        Ok(Self {
            file,
            max_key_length: config.max_key_length,
            slot_size,
            num_records: 0,
            data_start_ptr,
            file_len: data_start_ptr,
            index: MemIndex::new(value_crc),
            state: StoreState::Open,
            needs_heal: false,
            config,
        })
    }

    /// Opens a store over an arbitrary backing file, rebuilding the
    /// in-memory index from disk.
    ///
    /// Recovery only reads. It tolerates the residue of interrupted
    /// operations — value frames no envelope references, and the duplicate
    /// slot left by a swap-delete that crashed before its commit — and
    /// rejects anything else that violates the format's invariants.
    pub fn open_with_file(
        mut file: Box<dyn StorageFile>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let file_len = file.len()?;
        if file_len < FILE_HEADER_LEN {
            return Err(StoreError::CorruptFile {
                detail: format!("file of {file_len} bytes is shorter than the header"),
            });
        }

        let mut header_buf = [0u8; FILE_HEADER_LEN as usize];
        file.seek(0)?;
        file.read_exact(&mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;

        if let Some(expected) = config.expected_max_key_length {
            if expected != header.max_key_length {
                return Err(StoreError::MaxKeyLengthMismatch {
                    expected,
                    actual: header.max_key_length,
                });
            }
        }

        let slot_size = codec::slot_len(header.max_key_length);
        let end_index = FILE_HEADER_LEN + u64::from(header.num_records) * slot_size;
        if header.data_start_ptr < end_index {
            return Err(StoreError::CorruptFile {
                detail: format!(
                    "data_start_ptr {} overlaps the index region ending at {end_index}",
                    header.data_start_ptr
                ),
            });
        }
        if header.data_start_ptr > file_len {
            return Err(StoreError::CorruptFile {
                detail: format!(
                    "data_start_ptr {} beyond file length {file_len}",
                    header.data_start_ptr
                ),
            });
        }

        let mut slots_buf = vec![0u8; (end_index - FILE_HEADER_LEN) as usize];
        if !slots_buf.is_empty() {
            file.read_exact(&mut slots_buf)?;
        }

        let key_area = codec::key_area_len(header.max_key_length);
        let mut index = MemIndex::new(config.value_crc_enabled);
        let mut residues = 0u32;

        for slot in 0..header.num_records {
            let base = (u64::from(slot) * slot_size) as usize;
            let key = codec::decode_key_slot(
                &slots_buf[base..base + key_area],
                header.max_key_length,
                slot,
            )?;
            let env = Envelope::decode(
                &slots_buf[base + key_area..base + slot_size as usize],
                slot,
            )?;

            if env.data_pointer < header.data_start_ptr {
                return Err(StoreError::CorruptFile {
                    detail: format!(
                        "slot {slot}: frame at {} precedes data_start_ptr {}",
                        env.data_pointer, header.data_start_ptr
                    ),
                });
            }
            if env.end() > file_len {
                return Err(StoreError::CorruptFile {
                    detail: format!(
                        "slot {slot}: frame ends at {} beyond file length {file_len}",
                        env.end()
                    ),
                });
            }
            if env.live_len(config.value_crc_enabled) > env.data_capacity {
                return Err(StoreError::CorruptFile {
                    detail: format!(
                        "slot {slot}: live bytes {} exceed capacity {}",
                        env.live_len(config.value_crc_enabled),
                        env.data_capacity
                    ),
                });
            }

            if let Some(twin) = index.insert_recovered(key, env) {
                residues += 1;
                tracing::warn!(
                    slot,
                    twin,
                    "duplicate key from an interrupted delete; keeping the later slot"
                );
            }
        }

        // A single interrupted swap-delete is the only legal source of
        // duplicates, and its surviving copy sits in the last slot.
        if residues > 1 {
            return Err(StoreError::CorruptFile {
                detail: format!("{residues} duplicate keys in the index"),
            });
        }
        if index.len() as u32 + residues != header.num_records {
            return Err(StoreError::CorruptFile {
                detail: format!(
                    "{} distinct keys and {residues} duplicates do not cover {} slots",
                    index.len(),
                    header.num_records
                ),
            });
        }
        for id in index.residues() {
            if index.env(id).index_position != header.num_records - 1 {
                return Err(StoreError::CorruptFile {
                    detail: "duplicate key whose later copy is not the last slot".to_string(),
                });
            }
        }

        // Frames must not overlap.
        let mut prev_end: Option<(u64, u64)> = None;
        for (offset, id) in index.offsets() {
            if let Some((prev_offset, end)) = prev_end {
                if end > offset {
                    return Err(StoreError::CorruptFile {
                        detail: format!(
                            "frame at {prev_offset} overlaps the frame at {offset}"
                        ),
                    });
                }
            }
            prev_end = Some((offset, index.env(id).end()));
        }

        debug_assert_eq!(index.slots_len(), header.num_records as usize);
        debug_assert_eq!(index.offset_count(), index.len());

        let needs_heal = residues > 0;
        tracing::info!(
            records = index.len(),
            file_length = file_len,
            data_start_ptr = header.data_start_ptr,
            "opened record store"
        );

        Ok(Self {
            file,
            max_key_length: header.max_key_length,
            slot_size,
            num_records: header.num_records,
            data_start_ptr: header.data_start_ptr,
            file_len,
            index,
            state: StoreState::Open,
            needs_heal,
            config,
        })
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`] if the key is present,
    /// [`StoreError::KeyTooLong`]/[`StoreError::EmptyKey`] for out-of-range
    /// keys, [`StoreError::ValueTooLarge`] for values whose frame would
    /// exceed the 32-bit length field.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.insert_inner(key, value);
        self.seal(result)
    }

    /// Replaces the value of an existing record.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.update_inner(key, value);
        self.seal(result)
    }

    /// Inserts the record or replaces its value if the key is present.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.index.id_of(key).is_some() {
            let result = self.update_inner(key, value);
            self.seal(result)
        } else {
            let result = self.insert_inner(key, value);
            self.seal(result)
        }
    }

    /// Reads the value of a record.
    pub fn read(&mut self, key: &[u8]) -> Result<Bytes, StoreError> {
        self.ensure_open()?;
        let result = self.read_inner(key);
        self.seal(result)
    }

    /// Deletes a record.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.delete_inner(key);
        self.seal(result)
    }

    /// True if the key is present.
    pub fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.index.id_of(key).is_some())
    }

    /// Number of records.
    pub fn size(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.index.len())
    }

    /// True if the store holds no records.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.index.is_empty())
    }

    /// Snapshot of all keys, decoupled from later mutations.
    pub fn keys(&self) -> Result<Vec<Bytes>, StoreError> {
        self.ensure_open()?;
        Ok(self.index.keys_snapshot())
    }

    /// Flushes all written bytes to stable storage.
    ///
    /// The engine never syncs on its own during operations; callers that
    /// need durability of a specific state call this at that boundary.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.file.fsync().map_err(StoreError::from);
        self.seal(result)
    }

    /// Closes the store, syncing first when it is still healthy.
    ///
    /// Idempotent, and permitted on a broken store — close-and-reopen is the
    /// documented remedy for one.
    pub fn close(&mut self) -> Result<(), StoreError> {
        match self.state {
            StoreState::Closed => Ok(()),
            StoreState::Broken => {
                let _ = self.file.close();
                self.state = StoreState::Closed;
                Ok(())
            }
            StoreState::Open => {
                if let Err(e) = self.file.fsync() {
                    self.state = StoreState::Broken;
                    return Err(e.into());
                }
                if let Err(e) = self.file.close() {
                    self.state = StoreState::Broken;
                    return Err(e.into());
                }
                self.state = StoreState::Closed;
                tracing::info!(records = self.index.len(), "closed record store");
                Ok(())
            }
        }
    }

    /// Space accounting snapshot.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_open()?;
        Ok(StoreStats {
            records: self.index.len(),
            file_length: self.file_len,
            data_start_ptr: self.data_start_ptr,
            prefix_gap_bytes: self.data_start_ptr - self.end_of_index(),
            interior_free_bytes: self.index.total_free(),
        })
    }

    /// Key length limit frozen into this file.
    pub fn max_key_length(&self) -> u8 {
        self.max_key_length
    }

    /// Largest key this file accepts.
    pub fn usable_key_length(&self) -> usize {
        codec::usable_key_len(self.max_key_length)
    }

    /// Current backing file length.
    pub fn file_length(&self) -> u64 {
        self.file_len
    }

    /// First offset of the data region.
    pub fn data_start_ptr(&self) -> u64 {
        self.data_start_ptr
    }

    // ========================================================================
    // Operation bodies
    // ========================================================================

    fn insert_inner(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.validate_key(key)?;
        self.validate_value(value)?;
        if self.index.id_of(key).is_some() {
            return Err(StoreError::DuplicateKey);
        }

        self.heal_residue()?;
        self.ensure_index_space(self.num_records + 1)?;
        let (data_pointer, data_capacity) = self.allocate(value.len())?;

        let position = self.num_records;
        let env = Envelope {
            data_pointer,
            data_capacity,
            data_count: value.len() as u32,
            index_position: position,
        };

        self.write_value_frame(data_pointer, value)?;
        self.write_key_slot(position, key)?;
        self.write_envelope_slot(position, &env)?;
        self.write_num_records_field(self.num_records + 1)?;

        self.index.insert_new(Bytes::copy_from_slice(key), env);
        self.num_records += 1;
        debug_assert_eq!(self.index.len(), self.num_records as usize);
        Ok(())
    }

    fn update_inner(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.validate_value(value)?;
        if self.index.id_of(key).is_none() {
            return Err(StoreError::NotFound);
        }

        self.heal_residue()?;
        let id = self.index.id_of(key).expect("key checked above");
        let old = self.index.env(id);
        let new_live = codec::framed_len(value.len(), self.config.value_crc_enabled);
        let capacity = u64::from(old.data_capacity);

        if new_live == capacity
            || (new_live < capacity && self.config.in_place_shrink_allowed())
        {
            // In place. The envelope is re-stamped before the frame write so
            // its CRC is known-good on disk, then rewritten with the new
            // count as the commit.
            self.write_envelope_slot(old.index_position, &old)?;
            self.write_value_frame(old.data_pointer, value)?;
            let mut env = old;
            env.data_count = value.len() as u32;
            self.write_envelope_slot(env.index_position, &env)?;
            self.index.set_env(id, env);
            return Ok(());
        }

        if old.end() == self.file_len {
            return self.update_tail_resize(id, value, new_live);
        }

        // Grow, or a shrink that may not happen in place: relocate into a
        // fresh frame, swing the envelope over, then reclaim the old frame.
        let (data_pointer, data_capacity) = self.allocate(value.len())?;
        self.write_value_frame(data_pointer, value)?;

        // Re-read: the allocator may have carved the new frame out of this
        // very record's free tail.
        let old = self.index.env(id);
        let env = Envelope {
            data_pointer,
            data_capacity,
            data_count: value.len() as u32,
            index_position: old.index_position,
        };
        self.write_envelope_slot(env.index_position, &env)?;
        self.index.set_env(id, env);

        self.reclaim_frame(old.data_pointer, old.data_capacity, false)
    }

    /// Resizes the frame at the end of the file to exactly the new payload.
    ///
    /// The ordering differs by direction so every crash point leaves a
    /// readable record. Growing extends the file and enlarges the envelope
    /// before the frame write; until the frame lands, its old length field
    /// still bounds the old payload. Shrinking writes the frame first (the
    /// new length field fits the old capacity), commits via the envelope,
    /// and truncates last, so the envelope never claims bytes past the end
    /// of the file.
    fn update_tail_resize(
        &mut self,
        id: crate::index::EnvId,
        value: &[u8],
        new_live: u64,
    ) -> Result<(), StoreError> {
        let old = self.index.env(id);
        let new_end = old.data_pointer + new_live;
        let mut env = old;
        env.data_capacity = new_live as u32;
        env.data_count = value.len() as u32;

        if new_live > u64::from(old.data_capacity) {
            self.set_file_len(new_end)?;
            self.write_envelope_slot(env.index_position, &env)?;
            self.write_value_frame(old.data_pointer, value)?;
        } else {
            self.write_value_frame(old.data_pointer, value)?;
            self.write_envelope_slot(env.index_position, &env)?;
            self.set_file_len(new_end)?;
        }
        self.index.set_env(id, env);
        Ok(())
    }

    fn read_inner(&mut self, key: &[u8]) -> Result<Bytes, StoreError> {
        let id = self.index.id_of(key).ok_or(StoreError::NotFound)?;
        let env = self.index.env(id);
        let payload = self.read_frame_payload(&env)?;
        Ok(Bytes::from(payload))
    }

    fn delete_inner(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if self.index.id_of(key).is_none() {
            return Err(StoreError::NotFound);
        }

        self.heal_residue()?;
        let id = self.index.id_of(key).expect("key checked above");
        let env = self.index.env(id);
        self.swap_delete(id)?;
        self.reclaim_frame(env.data_pointer, env.data_capacity, true)
    }

    // ========================================================================
    // Allocator
    // ========================================================================

    /// Reserved gap kept between the index region and the data region when
    /// allocating from the prefix gap: one slot for the pending insert, one
    /// for future growth.
    fn allocation_reserve(&self) -> u64 {
        2 * self.slot_size
    }

    /// Chooses where a new frame of `value_len` payload bytes goes.
    ///
    /// Branch order: the unused band in front of the data region, the
    /// smallest fitting free tail of an existing frame, then file extension.
    /// Filling the band with records that physically sit at its top keeps
    /// index growth cheap and most inserts to a handful of writes.
    fn allocate(&mut self, value_len: usize) -> Result<(u64, u32), StoreError> {
        let live = codec::framed_len(value_len, self.config.value_crc_enabled);
        let padded = if self.config.pad_data_to_index_entry {
            live.max(self.slot_size)
        } else {
            live
        };

        // 1. Prefix gap.
        let band = self.data_start_ptr as i64
            - self.end_of_index() as i64
            - self.allocation_reserve() as i64;
        if padded as i64 <= band {
            let data_pointer = self.data_start_ptr - padded;
            self.data_start_ptr = data_pointer;
            self.write_data_start_ptr_field()?;
            return Ok((data_pointer, padded as u32));
        }

        // 2. Smallest free tail that fits.
        if padded <= u64::from(u32::MAX) {
            if let Some(donor) = self.index.smallest_fit(padded as u32) {
                let mut d = self.index.env(donor);
                let data_pointer = d.end() - padded;
                d.data_capacity -= padded as u32;
                self.write_envelope_slot(d.index_position, &d)?;
                self.index.set_env(donor, d);
                tracing::debug!(
                    donor = d.data_pointer,
                    carved = padded,
                    "reused interior free space"
                );
                return Ok((data_pointer, padded as u32));
            }
        }

        // 3. Extend the file.
        let data_pointer = self.file_len;
        self.set_file_len(data_pointer + padded)?;
        Ok((data_pointer, padded as u32))
    }

    /// Reclaims the space of a dead frame.
    ///
    /// A frame at the end of the file is cut off; otherwise its bytes are
    /// merged into the preceding frame's capacity, or — when it is the
    /// front-most record — handed back to the prefix gap by advancing
    /// `data_start_ptr`.
    fn reclaim_frame(
        &mut self,
        data_pointer: u64,
        data_capacity: u32,
        allow_truncate: bool,
    ) -> Result<(), StoreError> {
        let end = data_pointer + u64::from(data_capacity);

        if allow_truncate && end == self.file_len {
            self.set_file_len(data_pointer)?;
            return Ok(());
        }

        if let Some(prev) = self.index.floor_id(data_pointer - 1) {
            let mut p = self.index.env(prev);
            debug_assert!(p.end() <= data_pointer, "frames must not overlap");
            p.data_capacity += data_capacity;
            self.write_envelope_slot(p.index_position, &p)?;
            self.index.set_env(prev, p);
        } else {
            self.data_start_ptr += u64::from(data_capacity);
            self.write_data_start_ptr_field()?;
        }
        Ok(())
    }

    // ========================================================================
    // Index region management
    // ========================================================================

    fn end_of_index(&self) -> u64 {
        FILE_HEADER_LEN + u64::from(self.num_records) * self.slot_size
    }

    /// Makes room for `required` index slots before the data region.
    ///
    /// On an empty store this just moves `data_start_ptr` (extending the
    /// file when needed). Otherwise the front-most data records are
    /// relocated to the end of the file until the index fits.
    fn ensure_index_space(&mut self, required: u32) -> Result<(), StoreError> {
        let end_index = FILE_HEADER_LEN + u64::from(required) * self.slot_size;

        if self.index.is_empty() {
            if end_index > self.file_len {
                self.set_file_len(end_index)?;
            }
            if end_index > self.data_start_ptr {
                self.data_start_ptr = end_index;
                self.write_data_start_ptr_field()?;
            }
            return Ok(());
        }

        while end_index > self.data_start_ptr {
            self.relocate_front_record()?;
        }
        Ok(())
    }

    /// Moves the record at the front of the data region to the end of the
    /// file, freeing its space for the index to grow into.
    fn relocate_front_record(&mut self) -> Result<(), StoreError> {
        let id = self
            .index
            .ceiling_id(self.data_start_ptr)
            .expect("non-empty store has a front record");
        let env = self.index.env(id);
        let payload = self.read_frame_payload(&env)?;

        let live = codec::framed_len(payload.len(), self.config.value_crc_enabled);
        let padded = if self.config.pad_data_to_index_entry {
            live.max(self.slot_size)
        } else {
            live
        };

        let new_pointer = self.file_len;
        self.set_file_len(new_pointer + padded)?;
        self.write_value_frame(new_pointer, &payload)?;

        let moved = Envelope {
            data_pointer: new_pointer,
            data_capacity: padded as u32,
            data_count: payload.len() as u32,
            index_position: env.index_position,
        };
        self.write_envelope_slot(moved.index_position, &moved)?;
        self.index.set_env(id, moved);

        let next = self
            .index
            .first_offset()
            .expect("store still has records");
        debug_assert!(next > self.data_start_ptr);
        self.data_start_ptr = next;
        self.write_data_start_ptr_field()?;

        tracing::debug!(
            from = env.data_pointer,
            to = new_pointer,
            data_start_ptr = self.data_start_ptr,
            "relocated front record for index growth"
        );
        Ok(())
    }

    /// Removes a record's index slot by overwriting it with the last slot
    /// and decrementing `num_records` — the decrement is the commit.
    fn swap_delete(&mut self, id: crate::index::EnvId) -> Result<(), StoreError> {
        let victim_position = self.index.env(id).index_position;
        let last_position = self.num_records - 1;

        let moved = if victim_position != last_position {
            let moved_id = self.index.slot_id(last_position);
            let moved_key = self.index.key(moved_id).clone();
            let mut moved_env = self.index.env(moved_id);
            moved_env.index_position = victim_position;

            self.write_key_slot(victim_position, &moved_key)?;
            self.write_envelope_slot(victim_position, &moved_env)?;
            Some(moved_id)
        } else {
            None
        };

        self.write_num_records_field(self.num_records - 1)?;

        self.index.remove(id);
        if let Some(moved_id) = moved {
            self.index.set_position(moved_id, victim_position);
        }
        self.index.pop_slot();
        self.num_records -= 1;
        debug_assert_eq!(self.index.len(), self.num_records as usize);
        Ok(())
    }

    /// Completes a swap-delete a previous session crashed in the middle of.
    ///
    /// Recovery keeps the moved key's later slot authoritative but leaves
    /// its earlier (twin) slot on disk. Before this store mutates anything
    /// else, the twin slot is rewritten from the authoritative entry and the
    /// pending `num_records` decrement is applied, which retires the last
    /// slot. Runs at most once per open; recovery itself never writes.
    fn heal_residue(&mut self) -> Result<(), StoreError> {
        if !self.needs_heal {
            return Ok(());
        }

        for id in self.index.residues() {
            let env = self.index.env(id);
            let twin = self.index.twin_slot(id).expect("residue entry has a twin");
            debug_assert_eq!(
                env.index_position,
                self.num_records - 1,
                "residue pairs with the last slot"
            );

            let mut healed = env;
            healed.index_position = twin;
            // The twin slot already holds this key's bytes; only the
            // envelope may be stale.
            self.write_envelope_slot(twin, &healed)?;
            self.write_num_records_field(self.num_records - 1)?;

            self.index.set_position(id, twin);
            self.index.clear_twin(id);
            self.index.pop_slot();
            self.num_records -= 1;

            tracing::info!(
                slot = twin,
                "completed delete interrupted by an earlier crash"
            );
        }

        self.needs_heal = false;
        debug_assert_eq!(self.index.len(), self.num_records as usize);
        Ok(())
    }

    // ========================================================================
    // Framing helpers
    // ========================================================================

    fn read_frame_payload(&mut self, env: &Envelope) -> Result<Vec<u8>, StoreError> {
        let mut len_buf = [0u8; 4];
        self.read_at(env.data_pointer, &mut len_buf)?;
        let len = i32::from_be_bytes(len_buf);
        if len < 0 {
            return Err(StoreError::CorruptValue {
                offset: env.data_pointer,
            });
        }

        let len = len as usize;
        if codec::framed_len(len, self.config.value_crc_enabled) > u64::from(env.data_capacity) {
            return Err(StoreError::CorruptValue {
                offset: env.data_pointer,
            });
        }

        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;

        if self.config.value_crc_enabled {
            let mut crc_buf = [0u8; 4];
            self.file.read_exact(&mut crc_buf)?;
            if u32::from_be_bytes(crc_buf) != crc32fast::hash(&payload) {
                return Err(StoreError::CrcMismatch {
                    offset: env.data_pointer,
                });
            }
        }
        Ok(payload)
    }

    fn write_value_frame(&mut self, data_pointer: u64, payload: &[u8]) -> Result<(), StoreError> {
        let frame = codec::encode_value_frame(payload, self.config.value_crc_enabled);
        self.write_at(data_pointer, &frame)
    }

    fn slot_offset(&self, position: u32) -> u64 {
        FILE_HEADER_LEN + u64::from(position) * self.slot_size
    }

    fn write_key_slot(&mut self, position: u32, key: &[u8]) -> Result<(), StoreError> {
        let encoded = codec::encode_key_slot(key);
        self.write_at(self.slot_offset(position), &encoded)
    }

    fn write_envelope_slot(&mut self, position: u32, env: &Envelope) -> Result<(), StoreError> {
        let offset =
            self.slot_offset(position) + codec::key_area_len(self.max_key_length) as u64;
        self.write_at(offset, &env.encode())
    }

    fn write_num_records_field(&mut self, num_records: u32) -> Result<(), StoreError> {
        self.write_at(NUM_RECORDS_OFFSET, &(num_records as i32).to_be_bytes())
    }

    fn write_data_start_ptr_field(&mut self) -> Result<(), StoreError> {
        self.write_at(
            DATA_START_PTR_OFFSET,
            &(self.data_start_ptr as i64).to_be_bytes(),
        )
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), StoreError> {
        self.file.seek(pos)?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        self.file.seek(pos)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn set_file_len(&mut self, new_len: u64) -> Result<(), StoreError> {
        self.file.set_len(new_len)?;
        self.file_len = new_len;
        Ok(())
    }

    // ========================================================================
    // Validation and state
    // ========================================================================

    fn validate_config(config: &StoreConfig) -> Result<(), StoreError> {
        // Below 6 the key area cannot hold the length byte, a single key
        // byte, and the key CRC.
        if !(MIN_MAX_KEY_LENGTH..=MAX_MAX_KEY_LENGTH).contains(&config.max_key_length) {
            return Err(StoreError::InvalidConfig {
                detail: "max_key_length must be in 6..=252",
            });
        }
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let max = codec::usable_key_len(self.max_key_length);
        if key.len() > max {
            return Err(StoreError::KeyTooLong {
                length: key.len(),
                max,
            });
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> Result<(), StoreError> {
        if codec::framed_len(value.len(), self.config.value_crc_enabled) > i32::MAX as u64 {
            return Err(StoreError::ValueTooLarge {
                length: value.len(),
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.state {
            StoreState::Open => Ok(()),
            state => Err(StoreError::IllegalState {
                state: state.as_str(),
            }),
        }
    }

    /// Passes a result through, demoting the store to broken on any error
    /// that leaves the in-memory index suspect.
    fn seal<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state = StoreState::Broken;
                tracing::error!(error = %e, "operation failed; store is now broken");
            }
        }
        result
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if self.state == StoreState::Open {
            if let Err(e) = self.file.fsync() {
                tracing::error!(error = %e, "failed to sync record store during drop");
            }
        }
    }
}
