//! In-memory record index.
//!
//! While a store is open, the authoritative view of its records lives here
//! as three projections over a single owned entry per record:
//!
//! - `by_key`: key → entry (keys unique)
//! - `by_offset`: frame offset → entry, ordered for floor/ceiling lookups
//! - `by_free`: `(free_space, offset)` pairs ascending, holding only frames
//!   with spare tail bytes, so the allocator can take the smallest fit first
//!
//! Entries are owned by an arena and addressed through stable [`EnvId`]
//! handles; every projection stores the handle, and mutations go through
//! [`MemIndex::set_env`] so the free-space view is re-seated whenever a
//! capacity or count changes. A `slots` table maps index slot positions back
//! to entries, which keeps swap-delete O(1) without re-reading the file.
//!
//! # Invariants
//!
//! - `by_key`, `by_offset`, and the arena agree on membership
//! - `by_free` holds exactly the entries with `free_space > 0`
//! - `slots[p]` is the entry whose envelope claims `index_position == p`
//!   (two slots may map to one entry only while swap-delete residue from a
//!   crashed session awaits healing)

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;

use crate::codec::Envelope;

/// Stable handle to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EnvId(usize);

/// One record: its key, its envelope, and any residue bookkeeping.
#[derive(Debug)]
pub(crate) struct IndexEntry {
    pub key: Bytes,
    pub env: Envelope,
    /// Second slot still holding this key on disk, left by a swap-delete
    /// that crashed before its commit.
    pub twin_slot: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct MemIndex {
    arena: Vec<Option<IndexEntry>>,
    free_ids: Vec<usize>,
    by_key: HashMap<Bytes, EnvId>,
    by_offset: BTreeMap<u64, EnvId>,
    by_free: BTreeSet<(u32, u64)>,
    slots: Vec<EnvId>,
    value_crc: bool,
}

impl MemIndex {
    pub fn new(value_crc: bool) -> Self {
        Self {
            arena: Vec::new(),
            free_ids: Vec::new(),
            by_key: HashMap::new(),
            by_offset: BTreeMap::new(),
            by_free: BTreeSet::new(),
            slots: Vec::new(),
            value_crc,
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn id_of(&self, key: &[u8]) -> Option<EnvId> {
        self.by_key.get(key).copied()
    }

    pub fn env(&self, id: EnvId) -> Envelope {
        self.entry(id).env
    }

    pub fn key(&self, id: EnvId) -> &Bytes {
        &self.entry(id).key
    }

    pub fn twin_slot(&self, id: EnvId) -> Option<u32> {
        self.entry(id).twin_slot
    }

    fn entry(&self, id: EnvId) -> &IndexEntry {
        self.arena[id.0].as_ref().expect("live entry behind EnvId")
    }

    fn entry_mut(&mut self, id: EnvId) -> &mut IndexEntry {
        self.arena[id.0].as_mut().expect("live entry behind EnvId")
    }

    fn alloc(&mut self, entry: IndexEntry) -> EnvId {
        match self.free_ids.pop() {
            Some(idx) => {
                self.arena[idx] = Some(entry);
                EnvId(idx)
            }
            None => {
                self.arena.push(Some(entry));
                EnvId(self.arena.len() - 1)
            }
        }
    }

    fn free_key(&self, env: &Envelope) -> Option<(u32, u64)> {
        let free = env.free_space(self.value_crc);
        (free > 0).then_some((free, env.data_pointer))
    }

    /// Inserts a brand-new record at the next slot position.
    pub fn insert_new(&mut self, key: Bytes, env: Envelope) -> EnvId {
        debug_assert_eq!(env.index_position as usize, self.slots.len());
        debug_assert!(!self.by_key.contains_key(&key), "duplicate key insert");
        debug_assert!(
            !self.by_offset.contains_key(&env.data_pointer),
            "duplicate frame offset"
        );

        let free = self.free_key(&env);
        let id = self.alloc(IndexEntry {
            key: key.clone(),
            env,
            twin_slot: None,
        });
        self.by_key.insert(key, id);
        self.by_offset.insert(env.data_pointer, id);
        if let Some(entry) = free {
            self.by_free.insert(entry);
        }
        self.slots.push(id);
        id
    }

    /// Inserts a slot decoded during recovery, tolerating the duplicate-key
    /// residue of an interrupted swap-delete.
    ///
    /// On a duplicate the later slot wins: the earlier envelope is evicted
    /// from the offset and free-space views, and the earlier slot position is
    /// recorded as the survivor's twin. Returns that twin position.
    pub fn insert_recovered(&mut self, key: Bytes, env: Envelope) -> Option<u32> {
        debug_assert_eq!(env.index_position as usize, self.slots.len());

        if let Some(&id) = self.by_key.get(&key) {
            let earlier = self.entry(id).env;
            self.by_offset.remove(&earlier.data_pointer);
            if let Some(entry) = self.free_key(&earlier) {
                self.by_free.remove(&entry);
            }

            let twin = earlier.index_position;
            let free = self.free_key(&env);
            let entry = self.entry_mut(id);
            entry.env = env;
            entry.twin_slot = Some(twin);

            self.by_offset.insert(env.data_pointer, id);
            if let Some(entry) = free {
                self.by_free.insert(entry);
            }
            self.slots.push(id);
            Some(twin)
        } else {
            self.insert_new(key, env);
            None
        }
    }

    /// Removes a record from every view except the slot table, which the
    /// caller fixes up as part of the swap.
    pub fn remove(&mut self, id: EnvId) -> IndexEntry {
        let entry = self.arena[id.0].take().expect("live entry behind EnvId");
        self.free_ids.push(id.0);
        self.by_key.remove(&entry.key);
        self.by_offset.remove(&entry.env.data_pointer);
        if let Some(free) = self.free_key(&entry.env) {
            self.by_free.remove(&free);
        }
        entry
    }

    /// Replaces an entry's envelope, re-seating the offset and free views.
    pub fn set_env(&mut self, id: EnvId, env: Envelope) {
        let old = self.entry(id).env;
        debug_assert_eq!(old.index_position, env.index_position);

        if let Some(free) = self.free_key(&old) {
            self.by_free.remove(&free);
        }
        if old.data_pointer != env.data_pointer {
            self.by_offset.remove(&old.data_pointer);
            self.by_offset.insert(env.data_pointer, id);
        }
        if let Some(free) = self.free_key(&env) {
            self.by_free.insert(free);
        }
        self.entry_mut(id).env = env;
    }

    /// Moves an entry to a different slot position.
    pub fn set_position(&mut self, id: EnvId, position: u32) {
        self.entry_mut(id).env.index_position = position;
        self.slots[position as usize] = id;
    }

    pub fn clear_twin(&mut self, id: EnvId) {
        self.entry_mut(id).twin_slot = None;
    }

    pub fn slot_id(&self, position: u32) -> EnvId {
        self.slots[position as usize]
    }

    pub fn pop_slot(&mut self) {
        self.slots.pop();
    }

    pub fn slots_len(&self) -> usize {
        self.slots.len()
    }

    /// Entry owning the largest frame offset at or below `offset`.
    pub fn floor_id(&self, offset: u64) -> Option<EnvId> {
        self.by_offset.range(..=offset).next_back().map(|(_, &id)| id)
    }

    /// Entry owning the smallest frame offset at or above `offset`.
    pub fn ceiling_id(&self, offset: u64) -> Option<EnvId> {
        self.by_offset.range(offset..).next().map(|(_, &id)| id)
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.by_offset.keys().next().copied()
    }

    /// Smallest free tail that still fits `required` bytes (first-fit over
    /// the ascending free-space order).
    pub fn smallest_fit(&self, required: u32) -> Option<EnvId> {
        let &(_, offset) = self.by_free.range((required, 0)..).next()?;
        self.by_offset.get(&offset).copied()
    }

    /// Entries with an unhealed twin slot.
    pub fn residues(&self) -> Vec<EnvId> {
        self.by_key
            .values()
            .copied()
            .filter(|&id| self.entry(id).twin_slot.is_some())
            .collect()
    }

    pub fn keys_snapshot(&self) -> Vec<Bytes> {
        self.by_key.keys().cloned().collect()
    }

    /// Frame offsets ascending, for invariant checks and stats.
    pub fn offsets(&self) -> impl Iterator<Item = (u64, EnvId)> + '_ {
        self.by_offset.iter().map(|(&off, &id)| (off, id))
    }

    /// Sum of reusable tail bytes across all frames.
    pub fn total_free(&self) -> u64 {
        self.by_free.iter().map(|&(free, _)| u64::from(free)).sum()
    }

    pub fn offset_count(&self) -> usize {
        self.by_offset.len()
    }
}
