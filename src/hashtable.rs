//! Versioned ordered hash table: deduplicates sampled node ids and assigns
//! dense local ids in first-appearance order, concurrently from the kernel
//! worker pool.
//!
//! Each bucket carries three version-tagged words so a logical [`reset`] is
//! one counter bump instead of a table sweep:
//!
//! - `state`  packs `(version, global)`: a slot is live for the current
//!   batch only if its version half matches the table version, so stale
//!   globals from earlier batches are unreadable by construction.
//! - `index`  packs `(version, min_input_index)`: claim races resolve to the
//!   earliest input position, which is what makes local assignment
//!   deterministic under any thread schedule.
//! - `local`  packs `(version, local_id)`: published last, read by
//!   [`lookup`] during edge mapping.
//!
//! Locals always form the contiguous range `[0, num_items)` and the
//! `mapping` array inverts them back to globals.
//!
//! [`reset`]: OrderedHashTable::reset
//! [`lookup`]: OrderedHashTable::lookup

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rayon::prelude::*;

use crate::common::IdType;
use crate::error::{Error, Result};

const VERSION_SHIFT: u32 = 32;
const LOW_MASK: u64 = 0xffff_ffff;

#[inline]
const fn pack(version: u32, value: u32) -> u64 {
    ((version as u64) << VERSION_SHIFT) | value as u64
}

#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> VERSION_SHIFT) as u32, (word & LOW_MASK) as u32)
}

#[inline]
fn bucket_hash(id: IdType) -> usize {
    // Fibonacci multiplicative hash; the table size is a power of two.
    (id.wrapping_mul(0x9e37_79b1)) as usize
}

pub struct OrderedHashTable {
    state: Vec<AtomicU64>,
    index: Vec<AtomicU64>,
    local: Vec<AtomicU64>,
    /// `mapping[local] -> global`, in first-appearance order.
    mapping: Vec<AtomicU32>,
    next_local: AtomicU32,
    version: AtomicU32,
    mask: usize,
}

impl OrderedHashTable {
    /// Size the table for `num_items_hint` distinct ids (typically
    /// `predict_num_nodes(batch_size, fanout)`). The bucket array is
    /// over-provisioned 2x and rounded to a power of two to keep probe
    /// chains short.
    pub fn new(num_items_hint: usize) -> OrderedHashTable {
        let slots = (num_items_hint * 2).next_power_of_two().max(64);
        let mut state = Vec::with_capacity(slots);
        let mut index = Vec::with_capacity(slots);
        let mut local = Vec::with_capacity(slots);
        let mut mapping = Vec::with_capacity(slots);
        for _ in 0..slots {
            state.push(AtomicU64::new(0));
            index.push(AtomicU64::new(0));
            local.push(AtomicU64::new(0));
            mapping.push(AtomicU32::new(0));
        }
        OrderedHashTable {
            state,
            index,
            local,
            mapping,
            next_local: AtomicU32::new(0),
            version: AtomicU32::new(1),
            mask: slots - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mapping.len()
    }

    /// Distinct ids currently held.
    pub fn num_items(&self) -> usize {
        self.next_local.load(Ordering::Acquire) as usize
    }

    /// Logical O(1) clear: bump the version so every bucket reads as empty.
    pub fn reset(&self) {
        let new_version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        if new_version == u32::MAX {
            // Version space exhausted; fall back to a physical sweep once
            // every ~4B resets. All three tag words must clear, or stale
            // tags from the previous cycle could match small new versions.
            for w in self.state.iter().chain(&self.index).chain(&self.local) {
                w.store(0, Ordering::Relaxed);
            }
            self.version.store(1, Ordering::Release);
        }
        self.next_local.store(0, Ordering::Release);
    }

    /// Find or claim the bucket for `id`. Returns the bucket position; the
    /// winner of the claim CAS has transitioned the slot from empty to the
    /// current version.
    fn claim(&self, id: IdType, cur: u32) -> Result<usize> {
        let mut pos = bucket_hash(id) & self.mask;
        for _ in 0..=self.mask {
            let observed = self.state[pos].load(Ordering::Acquire);
            let (version, global) = unpack(observed);
            if version == cur {
                if global == id {
                    return Ok(pos);
                }
                pos = (pos + 1) & self.mask;
                continue;
            }
            // Empty slot (stale version). Race to claim it.
            match self.state[pos].compare_exchange(
                observed,
                pack(cur, id),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(pos),
                Err(_) => continue, // lost the race; re-examine this slot
            }
        }
        Err(Error::resource(format!(
            "hash table overflow: probed all {} buckets for id {id}",
            self.capacity()
        )))
    }

    /// Record input position `i` as a candidate first appearance for the id
    /// held at `pos`.
    fn note_index(&self, pos: usize, i: u32, cur: u32) {
        let word = &self.index[pos];
        let mut observed = word.load(Ordering::Acquire);
        loop {
            let (version, min_index) = unpack(observed);
            if version == cur && min_index <= i {
                return;
            }
            let desired = pack(cur, i);
            match word.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Insert ids that are already known to be distinct, assigning local ids
    /// equal to their position in `ids` (offset by the current item count).
    pub fn fill_with_unique(&self, ids: &[IdType]) -> Result<()> {
        debug_assert!(
            {
                let mut seen = std::collections::HashSet::new();
                ids.iter().all(|id| seen.insert(*id))
            },
            "fill_with_unique called with duplicate ids"
        );
        let cur = self.version.load(Ordering::Acquire);
        let base = self.next_local.load(Ordering::Acquire);
        if base as usize + ids.len() > self.capacity() {
            return Err(Error::resource(format!(
                "hash table overflow: {} items into capacity {}",
                base as usize + ids.len(),
                self.capacity()
            )));
        }
        ids.par_iter().enumerate().try_for_each(|(i, &id)| -> Result<()> {
            let pos = self.claim(id, cur)?;
            let local = base + i as u32;
            self.mapping[local as usize].store(id, Ordering::Relaxed);
            self.local[pos].store(pack(cur, local), Ordering::Release);
            Ok(())
        })?;
        self.next_local.store(base + ids.len() as u32, Ordering::Release);
        Ok(())
    }

    /// Deduplicate `ids` into the table. New ids get the next locals in
    /// first-appearance order. Returns the full ordered frontier (every
    /// distinct global inserted so far, by local id) and its length.
    pub fn fill_with_duplicates(&self, ids: &[IdType]) -> Result<(Vec<IdType>, usize)> {
        let cur = self.version.load(Ordering::Acquire);

        // Phase 1: claim buckets and resolve first-appearance positions.
        let slots: Vec<usize> = ids
            .par_iter()
            .enumerate()
            .map(|(i, &id)| {
                let pos = self.claim(id, cur)?;
                self.note_index(pos, i as u32, cur);
                Ok(pos)
            })
            .collect::<Result<_>>()?;

        // Phase 2: one winner per distinct new id — the input position the
        // min-index race settled on. Ids inserted by an earlier fill keep
        // their published local and produce no winner here.
        let winners: Vec<bool> = slots
            .par_iter()
            .enumerate()
            .map(|(i, &pos)| {
                let (lv, _) = unpack(self.local[pos].load(Ordering::Acquire));
                lv != cur && unpack(self.index[pos].load(Ordering::Acquire)) == (cur, i as u32)
            })
            .collect();

        // Phase 3: rank winners by input order.
        let base = self.next_local.load(Ordering::Acquire);
        let mut ranks = vec![0u32; ids.len()];
        let mut num_new = 0u32;
        for (i, &w) in winners.iter().enumerate() {
            ranks[i] = num_new;
            num_new += w as u32;
        }
        let total = base + num_new;
        if total as usize > self.capacity() {
            return Err(Error::resource(format!(
                "hash table overflow: {} items into capacity {}",
                total,
                self.capacity()
            )));
        }

        // Phase 4: winners publish locals and extend the ordered mapping.
        ids.par_iter().enumerate().for_each(|(i, &id)| {
            if winners[i] {
                let pos = slots[i];
                let local = base + ranks[i];
                self.mapping[local as usize].store(id, Ordering::Relaxed);
                self.local[pos].store(pack(cur, local), Ordering::Release);
            }
        });
        self.next_local.store(total, Ordering::Release);

        Ok((self.ordered_frontier(), total as usize))
    }

    /// Snapshot of `mapping[0, num_items)`: all distinct globals in local-id
    /// order.
    pub fn ordered_frontier(&self) -> Vec<IdType> {
        let n = self.num_items();
        (0..n).map(|l| self.mapping[l].load(Ordering::Relaxed)).collect()
    }

    /// Local id of `id`, failing if the id was never inserted this version.
    pub fn lookup(&self, id: IdType) -> Result<IdType> {
        let cur = self.version.load(Ordering::Acquire);
        let mut pos = bucket_hash(id) & self.mask;
        for _ in 0..=self.mask {
            let (version, global) = unpack(self.state[pos].load(Ordering::Acquire));
            if version != cur {
                break; // empty slot terminates the probe chain
            }
            if global == id {
                let (lv, local) = unpack(self.local[pos].load(Ordering::Acquire));
                if lv != cur {
                    return Err(Error::invariant(format!(
                        "id {id} claimed but its local id was never published"
                    )));
                }
                return Ok(local);
            }
            pos = (pos + 1) & self.mask;
        }
        Err(Error::invariant(format!("map_edges: id {id} is not in the hash table")))
    }

    /// Rewrite edge endpoints into local ids. Every endpoint must already be
    /// in the table; a miss is fatal.
    pub fn map_edges(&self, src: &[IdType], dst: &[IdType]) -> Result<(Vec<IdType>, Vec<IdType>)> {
        debug_assert_eq!(src.len(), dst.len());
        let new_src: Vec<IdType> =
            src.par_iter().map(|&id| self.lookup(id)).collect::<Result<_>>()?;
        let new_dst: Vec<IdType> =
            dst.par_iter().map(|&id| self.lookup(id)).collect::<Result<_>>()?;
        Ok((new_src, new_dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_with_unique_assigns_sequential_locals() {
        let table = OrderedHashTable::new(16);
        table.fill_with_unique(&[40, 10, 30]).unwrap();
        assert_eq!(table.num_items(), 3);
        assert_eq!(table.lookup(40).unwrap(), 0);
        assert_eq!(table.lookup(10).unwrap(), 1);
        assert_eq!(table.lookup(30).unwrap(), 2);
        assert_eq!(table.ordered_frontier(), vec![40, 10, 30]);
    }

    #[test]
    fn fill_with_duplicates_orders_by_first_appearance() {
        let table = OrderedHashTable::new(16);
        table.fill_with_unique(&[7]).unwrap();
        let (frontier, n) = table.fill_with_duplicates(&[5, 7, 9, 5, 11, 9]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(frontier, vec![7, 5, 9, 11]);
        assert_eq!(table.lookup(5).unwrap(), 1);
        assert_eq!(table.lookup(11).unwrap(), 3);
    }

    #[test]
    fn locals_are_contiguous_and_mapping_inverts() {
        let table = OrderedHashTable::new(512);
        let ids: Vec<IdType> = (0..400).map(|i| (i * 37) % 200).collect();
        let (frontier, n) = table.fill_with_duplicates(&ids).unwrap();
        assert_eq!(n, 200);
        let mut seen = vec![false; n];
        for &g in &frontier {
            let l = table.lookup(g).unwrap() as usize;
            assert!(!seen[l], "local {l} assigned twice");
            seen[l] = true;
            assert_eq!(frontier[l], g);
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn map_edges_rejects_unknown_ids() {
        let table = OrderedHashTable::new(16);
        table.fill_with_unique(&[1, 2]).unwrap();
        let err = table.map_edges(&[1], &[99]).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn reset_behaves_like_a_fresh_table() {
        let table = OrderedHashTable::new(32);
        for round in 0..5u32 {
            table.reset();
            assert_eq!(table.num_items(), 0);
            // Interleave unique and duplicate fills with ids that collide
            // across rounds.
            table.fill_with_unique(&[round, round + 100]).unwrap();
            let (frontier, n) = table.fill_with_duplicates(&[round, 7, 7, round + 100]).unwrap();
            assert_eq!(n, 3);
            assert_eq!(frontier, vec![round, round + 100, 7]);
            assert_eq!(table.lookup(7).unwrap(), 2);
            assert!(table.lookup(round.wrapping_sub(1) % 50 + 200).is_err());
        }
    }

    #[test]
    fn overflow_is_a_resource_error() {
        let table = OrderedHashTable::new(16);
        // Capacity is rounded up to 64 slots; 100 distinct ids cannot fit.
        let ids: Vec<IdType> = (0..100).collect();
        let err = table.fill_with_duplicates(&ids).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn concurrent_duplicates_settle_deterministically() {
        // Many duplicates of few ids: whatever the schedule, locals must
        // follow first appearance in the input.
        let ids: Vec<IdType> = (0..10_000).map(|i| [3, 1, 4, 1, 5, 9, 2, 6][i % 8]).collect();
        for _ in 0..8 {
            let table = OrderedHashTable::new(64);
            let (frontier, n) = table.fill_with_duplicates(&ids).unwrap();
            assert_eq!(n, 7);
            assert_eq!(frontier, vec![3, 1, 4, 5, 9, 2, 6]);
        }
    }
}
