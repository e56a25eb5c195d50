// Copyright (c) 2016 Amanieu d'Antras
// SPDX-License-Identifier: MIT

//! The open-addressed, group-probed table engine. This module knows nothing
//! about keys, values, hashing, or equality: callers drive every lookup and
//! insert with a hash and a closure, and choose the slot representation via
//! [`crate::policy::SlotStrategy`].

mod bitmask;

cfg_if::cfg_if! {
    if #[cfg(any(
        target_feature = "sse2",
        target_arch = "x86_64",
        target_arch = "x86",
    ))] {
        mod sse2;
        use sse2 as imp;
    } else {
        mod generic;
        use generic as imp;
    }
}

use crate::error::{RawTableError, Result};
use crate::hint::{likely, unlikely};
use crate::policy::{Allocator, Global, SlotStrategy};
use bitmask::BitMask;
use imp::Group;

use core::alloc::Layout;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::mem;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};

/// A slot that has never been written, or that has been vacated without a
/// tombstone (cleared by a rehash or never touched at all).
const EMPTY: u8 = 0b1000_0000;

/// A slot that used to hold an element, vacated by `erase`, that stands in
/// the way of a probe sequence until the next rehash clears it.
const DELETED: u8 = 0b1111_1110;

/// The one-byte marker that terminates the control array. Lives at index
/// `capacity` and is never written anywhere else; it is neither `Empty` nor
/// `Full` for the purposes of probing, but is < 0 so it participates in
/// vectorized "is special" tests the same way `Empty`/`Deleted` do, except
/// where callers specifically need to distinguish it (`is_full`).
const SENTINEL: u8 = 0b1111_1111;

/// Checks whether a control byte represents a full slot (top bit clear).
#[inline]
fn is_full(ctrl: u8) -> bool {
    ctrl & 0x80 == 0
}

/// Checks whether a control byte represents a special slot (`Empty`,
/// `Deleted`, or `Sentinel` -- top bit set).
#[inline]
fn is_special(ctrl: u8) -> bool {
    ctrl & 0x80 != 0
}

/// Checks whether a special control byte is `Empty`. Caller must already
/// know the byte `is_special`.
#[inline]
fn special_is_empty(ctrl: u8) -> bool {
    debug_assert!(is_special(ctrl));
    ctrl == EMPTY
}

/// Splits a hash into its `H1` component (which group to start probing
/// at), mixing in entropy from this table's own control-array address so
/// that two tables holding the same keys don't walk identical probe
/// sequences -- a cheap defense against hash-flooding when the caller's
/// hasher is weak or keyed predictably.
#[inline]
fn h1(hash: u64, ctrl: *const u8) -> usize {
    ((hash >> 7) ^ (ctrl as u64 >> 12)) as usize
}

/// Splits a hash into its `H2` component (the 7-bit tag stored in the
/// control byte of a full slot): the low 7 bits, disjoint from the bits
/// `h1` reads, so the two never correlate regardless of pointer entropy.
#[inline]
fn h2(hash: u64) -> u8 {
    (hash & 0x7f) as u8
}

/// Only enabled in debug builds: randomizes whether `find_insert_slot`
/// returns the first or last matching slot in a group, so that insertion
/// order bugs which depend on a fixed probe direction surface under test
/// without affecting the release-mode probe sequence at all.
#[cfg(debug_assertions)]
fn should_insert_backwards(hash: u64, ctrl: *const u8) -> bool {
    // A fixed-but-arbitrary per-process salt, distinct across runs.
    static SEED: AtomicUsize = AtomicUsize::new(0);
    let mut seed = SEED.load(Ordering::Relaxed);
    if seed == 0 {
        seed = ctrl as usize | 1;
        SEED.store(seed, Ordering::Relaxed);
    }
    (h1(hash, ctrl) ^ seed) % 13 > 6
}

/// Converts a bucket mask (allocated buckets minus one, minus the
/// sentinel's slot) into the number of elements that can be inserted
/// before the table must grow again.
#[inline]
fn bucket_mask_to_capacity(bucket_mask: usize) -> usize {
    if Group::WIDTH == 8 && bucket_mask == 7 {
        // On the scalar (8-wide group) backend, a 7-bucket table can only
        // ever hold 6 live elements: one slot must stay empty so a lookup
        // that scans the table's single group is guaranteed to terminate,
        // and the sentinel already occupies the 8th.
        6
    } else if bucket_mask < 8 {
        // For tables with less than 8 buckets, every slot is usable.
        bucket_mask
    } else {
        // For larger tables we reserve one in every 8 slots as growth
        // headroom, so that the control-byte backends (which read a whole
        // group at a time) never have to worry about a full table.
        ((bucket_mask + 1) / 8) * 7
    }
}

/// The number of buckets (always a power of two) needed to hold `capacity`
/// elements without exceeding the max load factor, or `None` on overflow.
fn capacity_to_buckets(capacity: usize) -> Option<usize> {
    debug_assert_ne!(capacity, 0);

    // For small tables we require at least 1 empty bucket so that lookups
    // are guaranteed to terminate if an element doesn't exist in the
    // table.
    if capacity < 8 {
        // (1, 2) -> 4, (3, 4) -> 8, (5, 6, 7) -> 8
        return Some(if capacity < 4 { 4 } else { 8 });
    }

    // Otherwise require 1/8 buckets to be empty (87.5% load factor).
    //
    // Be careful when modifying this, calculate_layout relies on the
    // overflow check here.
    let adjusted_capacity = capacity.checked_mul(8)? / 7;

    // Any overflows will have been caught by the checked_mul. Panics if
    // the type is smaller than 128, but that can't happen as any
    // overflows should be caught by the checked_mul.
    Some(adjusted_capacity.next_power_of_two())
}

/// Returns the layout of the allocation backing a table of `buckets`
/// slots of type `T`, and the byte offset at which the control array
/// begins within that allocation.
///
/// Like the real Abseil/hashbrown layout, the control array is placed
/// *after* the slot array in the single allocation; `RawTable` keeps only
/// a pointer into the control array and reaches backwards into the slot
/// array via signed offsets, so the table never has to carry two pointers.
fn calculate_layout<T>(buckets: usize) -> Option<(Layout, usize)> {
    debug_assert!(buckets.is_power_of_two());

    let data_layout = Layout::array::<T>(buckets).ok()?;
    let ctrl_layout = Layout::array::<u8>(buckets.checked_add(Group::WIDTH)?).ok()?;
    let (layout, ctrl_offset) = data_layout.extend(ctrl_layout).ok()?;
    Some((layout, ctrl_offset))
}

/// A reference to a slot in the table, computed as an offset backwards
/// from the control pointer. Returned by `find`/`insert`, consumed by
/// `erase`.
pub struct Bucket<T> {
    ptr: *mut T,
}

impl<T> Clone for Bucket<T> {
    #[inline]
    fn clone(&self) -> Self {
        Bucket { ptr: self.ptr }
    }
}

impl<T> Bucket<T> {
    #[inline]
    unsafe fn from_base_index(base: NonNull<T>, index: usize) -> Self {
        let ptr = if mem::size_of::<T>() == 0 {
            (index + 1) as *mut T
        } else {
            base.as_ptr().sub(index)
        };
        Bucket { ptr }
    }

    #[inline]
    unsafe fn to_base_index(&self, base: NonNull<T>) -> usize {
        if mem::size_of::<T>() == 0 {
            self.ptr as usize - 1
        } else {
            base.as_ptr().offset_from(self.ptr) as usize
        }
    }

    /// The raw pointer to this bucket's slot. Valid to dereference only
    /// while the owning table outlives it and the slot remains `Full`.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    unsafe fn next_n(&self, offset: usize) -> Self {
        let ptr = if mem::size_of::<T>() == 0 {
            (self.ptr as usize + offset) as *mut T
        } else {
            self.ptr.sub(offset)
        };
        Bucket { ptr }
    }
}

/// A probe sequence over the groups of a table, advancing by successive
/// triangular numbers so that, combined with a power-of-two bucket count,
/// every group is visited exactly once before the sequence repeats.
struct ProbeSeq {
    pos: usize,
    stride: usize,
}

impl ProbeSeq {
    #[inline]
    fn move_next(&mut self, bucket_mask: usize) {
        // We should have found an empty bucket by now and ended the
        // probe.
        debug_assert!(
            self.stride <= bucket_mask,
            "Went past end of probe sequence"
        );

        self.stride += Group::WIDTH;
        self.pos += self.stride;
        self.pos &= bucket_mask;
    }
}

/// An open-addressed hash table engine. Keys, values, hashing, and equality
/// are supplied by the caller at each call site; `RawTable` owns only the
/// control-byte/slot layout, probing, and resizing.
pub struct RawTable<S: SlotStrategy, A: Allocator = Global> {
    // Mask to get an index from a hash value. This also doubles as the
    // number of *usable* slots minus one: the allocation itself holds
    // `bucket_mask + 1` slots, the last of which is reserved for the
    // sentinel control byte.
    bucket_mask: usize,

    // [Padding], T1, T2, ..., Tlast, C1, C2, ...
    //                                ^ points here
    ctrl: NonNull<u8>,

    // Number of elements that can be inserted before we need to grow the
    // table again.
    growth_left: usize,

    // Number of elements in the table, not counting tombstones.
    items: usize,

    alloc: A,
    marker: PhantomData<S>,
}

impl<S: SlotStrategy> RawTable<S, Global> {
    /// Creates an empty table, allocation-free until the first insert.
    #[inline]
    pub fn new() -> Self {
        Self::new_in(Global)
    }

    /// Creates an empty table with at least `capacity` usable slots
    /// reserved up front. Panics if the layout would overflow.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::try_with_capacity(capacity).unwrap_or_else(|_| capacity_overflow())
    }

    /// Fallible counterpart to [`RawTable::with_capacity`].
    #[inline]
    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        Self::try_with_capacity_in(capacity, Global)
    }
}

impl<S: SlotStrategy, A: Allocator + Clone> RawTable<S, A> {
    /// Creates an empty table backed by `alloc`.
    #[inline]
    pub fn new_in(alloc: A) -> Self {
        Self {
            bucket_mask: 0,
            ctrl: unsafe { NonNull::new_unchecked(Group::static_empty() as *const _ as *mut u8) },
            growth_left: 0,
            items: 0,
            alloc,
            marker: PhantomData,
        }
    }

    /// Fallible counterpart to a capacity-and-allocator constructor.
    pub fn try_with_capacity_in(capacity: usize, alloc: A) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::new_in(alloc));
        }
        unsafe {
            let buckets = capacity_to_buckets(capacity).ok_or(RawTableError::CapacityOverflow)?;
            let result = Self::new_uninitialized(alloc, buckets)?;
            result.ctrl(0).write_bytes(EMPTY, result.num_ctrl_bytes());
            result.set_ctrl(result.bucket_mask, SENTINEL);
            Ok(result)
        }
    }

    /// Allocates a table with `buckets` slots (a power of two) and sets up
    /// the control array in its raw, uninitialized state. Caller must
    /// initialize the control bytes before the table is used.
    unsafe fn new_uninitialized(alloc: A, buckets: usize) -> Result<Self> {
        debug_assert!(buckets.is_power_of_two());

        let (layout, ctrl_offset) =
            calculate_layout::<S>(buckets).ok_or(RawTableError::CapacityOverflow)?;
        let ptr = alloc.alloc(layout);
        let ctrl = NonNull::new_unchecked(ptr.as_ptr().add(ctrl_offset));

        Ok(Self {
            ctrl,
            bucket_mask: buckets - 1,
            items: 0,
            growth_left: bucket_mask_to_capacity(buckets - 1),
            alloc,
            marker: PhantomData,
        })
    }

    #[inline]
    fn num_ctrl_bytes(&self) -> usize {
        self.bucket_mask + 1 + Group::WIDTH
    }

    #[inline]
    fn is_empty_singleton(&self) -> bool {
        self.bucket_mask == 0
    }

    #[inline]
    unsafe fn ctrl(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.num_ctrl_bytes());
        self.ctrl.as_ptr().add(index)
    }

    #[inline]
    unsafe fn data_end(&self) -> NonNull<S> {
        NonNull::new_unchecked(self.ctrl.as_ptr() as *mut S)
    }

    #[inline]
    unsafe fn bucket(&self, index: usize) -> Bucket<S> {
        debug_assert_ne!(self.bucket_mask, 0);
        debug_assert!(index < self.buckets());
        Bucket::from_base_index(self.data_end(), index)
    }

    #[inline]
    unsafe fn bucket_index(&self, bucket: &Bucket<S>) -> usize {
        bucket.to_base_index(self.data_end())
    }

    /// Total number of allocated buckets, including the one reserved for
    /// the sentinel; always a power of two, or 0 for the empty singleton.
    #[inline]
    fn buckets(&self) -> usize {
        self.bucket_mask + 1
    }

    #[inline]
    fn probe_seq(&self, hash: u64) -> ProbeSeq {
        ProbeSeq {
            pos: h1(hash, self.ctrl.as_ptr()) & self.bucket_mask,
            stride: 0,
        }
    }

    /// Number of elements currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.items
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Number of elements the table can hold before the next growth,
    /// i.e. `items + growth_left`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.items + self.growth_left
    }

    #[inline]
    pub fn load_factor(&self) -> f64 {
        if self.bucket_mask == 0 {
            0.0
        } else {
            self.items as f64 / self.buckets() as f64
        }
    }

    /// Erases every element, without shrinking the allocation.
    pub fn clear(&mut self) {
        if self.is_empty_singleton() {
            return;
        }
        unsafe {
            if mem::needs_drop::<S>() {
                for item in self.iter() {
                    S::drop_slot(item.as_ptr());
                }
            }
            self.ctrl(0).write_bytes(EMPTY, self.num_ctrl_bytes());
            self.set_ctrl(self.bucket_mask, SENTINEL);
        }
        self.growth_left = bucket_mask_to_capacity(self.bucket_mask);
        self.items = 0;
    }

    /// Searches for an element, starting at the group given by the
    /// previous call's hint; used by callers that re-probe after a
    /// resize invalidated a cached position.
    #[inline]
    pub fn find_hinted(&self, hash: u64, mut eq: impl FnMut(&S::Value) -> bool) -> Option<Bucket<S>> {
        self.find(hash, &mut eq)
    }

    /// Looks up an element by hash, using `eq` to disambiguate H2
    /// collisions from a true match.
    #[inline]
    pub fn find(&self, hash: u64, mut eq: impl FnMut(&S::Value) -> bool) -> Option<Bucket<S>> {
        unsafe {
            let h2_hash = h2(hash);
            let mut probe_seq = self.probe_seq(hash);
            loop {
                let group = Group::load(self.ctrl(probe_seq.pos));
                for bit in group.match_byte(h2_hash) {
                    let index = (probe_seq.pos + bit) & self.bucket_mask;
                    let bucket = self.bucket(index);
                    let value = &*S::get(bucket.as_ptr());
                    if likely(eq(value)) {
                        return Some(bucket);
                    }
                }
                if likely(group.match_empty().any_bit_set()) {
                    return None;
                }
                probe_seq.move_next(self.bucket_mask);
            }
        }
    }

    #[inline]
    pub fn contains(&self, hash: u64, eq: impl FnMut(&S::Value) -> bool) -> bool {
        self.find(hash, eq).is_some()
    }

    /// Finds the first non-full slot along `hash`'s probe sequence,
    /// without checking whether an equal element already exists; callers
    /// that need "insert if absent" must call `find` first.
    fn find_insert_slot(&self, hash: u64) -> usize {
        let mut probe_seq = self.probe_seq(hash);
        loop {
            unsafe {
                let group = Group::load(self.ctrl(probe_seq.pos));
                if let Some(bit) = self.pick_insert_bit(group, hash) {
                    let result = (probe_seq.pos + bit) & self.bucket_mask;

                    // In tables smaller than the group width, the
                    // control bytes past `bucket_mask` mirror the first
                    // ones so a single group load always covers the
                    // whole table; a match found in that mirrored tail
                    // can point at a slot that's actually full. The load
                    // factor guarantees a second scan from the start
                    // finds a real empty-or-deleted slot before it
                    // wraps back around.
                    if unlikely(is_full(*self.ctrl(result))) {
                        debug_assert!(self.bucket_mask < Group::WIDTH);
                        debug_assert_ne!(probe_seq.pos, 0);
                        return Group::load_aligned(self.ctrl(0))
                            .match_empty_or_deleted()
                            .lowest_set_bit()
                            .unwrap();
                    }

                    return result;
                }
            }
            probe_seq.move_next(self.bucket_mask);
        }
    }

    #[inline]
    fn pick_insert_bit(&self, group: Group, hash: u64) -> Option<usize> {
        let candidates = group.match_empty_or_deleted();
        #[cfg(debug_assertions)]
        {
            if self.bucket_mask >= Group::WIDTH && should_insert_backwards(hash, self.ctrl.as_ptr())
            {
                return candidates.highest_set_bit();
            }
        }
        let _ = hash;
        candidates.lowest_set_bit()
    }

    /// Inserts `value` for a new, not-previously-present key; `hash` must
    /// be the hash the caller will use to find this element again.
    /// `hasher` is only ever invoked if the table needs to grow first.
    pub fn insert(
        &mut self,
        hash: u64,
        value: S::Value,
        hasher: impl Fn(&S::Value) -> u64,
    ) -> Bucket<S> {
        unsafe {
            let mut index = self.find_insert_slot(hash);

            // We can avoid growing the table once we have reached our
            // load factor if we are replacing a tombstone. This works
            // since the number of EMPTY slots does not change in this
            // case.
            let old_ctrl = *self.ctrl(index);
            if unlikely(self.growth_left == 0 && special_is_empty(old_ctrl)) {
                self.reserve(1, hasher);
                index = self.find_insert_slot(hash);
            }

            let old_ctrl = *self.ctrl(index);
            self.record_item_insert_at(index, old_ctrl, hash);

            let bucket = self.bucket(index);
            S::write(bucket.as_ptr(), value);
            bucket
        }
    }

    unsafe fn record_item_insert_at(&mut self, index: usize, old_ctrl: u8, hash: u64) {
        self.growth_left -= special_is_empty(old_ctrl) as usize;
        self.set_ctrl(index, h2(hash));
        self.items += 1;
    }

    /// Writes a control byte at `index`, mirroring it into the wraparound
    /// tail for the first `Group::WIDTH - 1` indices so a single group
    /// load can always see a full group's worth of bytes.
    unsafe fn set_ctrl(&self, index: usize, ctrl: u8) {
        // This is the same as `index.wrapping_sub(Group::WIDTH) %
        // self.buckets() + Group::WIDTH`, but a bit faster.
        let index2 = ((index.wrapping_sub(Group::WIDTH)) & self.bucket_mask) + Group::WIDTH;

        *self.ctrl(index) = ctrl;
        *self.ctrl(index2) = ctrl;
    }

    /// Removes the element at `bucket`, leaving a tombstone or an empty
    /// slot behind depending on whether the element's group has ever been
    /// completely full.
    pub unsafe fn erase(&mut self, bucket: Bucket<S>) {
        let index = self.bucket_index(&bucket);
        self.erase_at(index);
    }

    unsafe fn erase_at(&mut self, index: usize) {
        debug_assert!(is_full(*self.ctrl(index)));
        let index_before = index.wrapping_sub(Group::WIDTH) & self.bucket_mask;
        let empty_before = Group::load(self.ctrl(index_before)).match_empty();
        let empty_after = Group::load(self.ctrl(index)).match_empty();

        // If we are inside a continuous block of Group::WIDTH full or
        // deleted cells then a probe window may have seen a full block
        // when trying to insert. We therefore need to keep that block
        // non-empty so that lookups will continue searching to the
        // next probe window.
        //
        // Note that in this context `leading_zeros` and `trailing_zeros`
        // refer to the bytes at the end and beginning of the control
        // byte sequence, not the bit representation.
        let ctrl = if empty_before.leading_zeros() + empty_after.trailing_zeros() >= Group::WIDTH {
            DELETED
        } else {
            self.growth_left += 1;
            EMPTY
        };
        self.set_ctrl(index, ctrl);
        S::drop_slot(self.bucket(index).as_ptr());
        self.items -= 1;
    }

    /// Ensures at least `additional` more elements can be inserted
    /// without growing again, rehashing in place when there is enough
    /// spare capacity once tombstones are reclaimed, or growing to a
    /// larger allocation otherwise.
    pub fn reserve(&mut self, additional: usize, hasher: impl Fn(&S::Value) -> u64) {
        if additional > self.growth_left {
            self.reserve_rehash(additional, hasher)
                .unwrap_or_else(|_| capacity_overflow());
        }
    }

    /// Fallible counterpart to [`RawTable::reserve`].
    pub fn try_reserve(
        &mut self,
        additional: usize,
        hasher: impl Fn(&S::Value) -> u64,
    ) -> Result<()> {
        if additional > self.growth_left {
            self.reserve_rehash(additional, hasher)
        } else {
            Ok(())
        }
    }

    #[cold]
    #[inline(never)]
    fn reserve_rehash(
        &mut self,
        additional: usize,
        hasher: impl Fn(&S::Value) -> u64,
    ) -> Result<()> {
        let new_items = self
            .items
            .checked_add(additional)
            .ok_or(RawTableError::CapacityOverflow)?;

        // If the table is >= 50% empty after reclaiming tombstones, we
        // can just rehash in place to free up any tombstones rather
        // than growing the table.
        if new_items <= bucket_mask_to_capacity(self.bucket_mask) / 2 {
            self.rehash_in_place(&hasher);
            Ok(())
        } else {
            let full_capacity = bucket_mask_to_capacity(
                capacity_to_buckets(new_items).ok_or(RawTableError::CapacityOverflow)? - 1,
            );
            self.resize(usize::max(new_items, full_capacity), &hasher)
        }
    }

    /// Rehashes every element in place, clearing tombstones without
    /// changing the allocation's size. Used when there's enough spare
    /// capacity once deleted slots are reclaimed.
    fn rehash_in_place(&mut self, hasher: &impl Fn(&S::Value) -> u64) {
        unsafe {
            // Bulk-convert all full control bytes to DELETED, and all
            // DELETED control bytes to EMPTY. This effectively frees up
            // all bucket_mask slots that are currently tombstones.
            for i in (0..self.buckets()).step_by(Group::WIDTH) {
                let group = Group::load_aligned(self.ctrl(i));
                let group = group.convert_special_to_empty_and_full_to_deleted();
                group.store_aligned(self.ctrl(i));
            }

            // The bulk conversion above just turned the sentinel byte at
            // `bucket_mask` into EMPTY too (it's a "special" byte like
            // any other). Put it back before the trailing bytes are
            // derived from this range.
            *self.ctrl(self.bucket_mask) = SENTINEL;

            // Fix up the trailing control bytes. See the comments in
            // set_ctrl for the explanation of this.
            if self.buckets() < Group::WIDTH {
                self.ctrl(0)
                    .copy_to(self.ctrl(Group::WIDTH), self.buckets());
            } else {
                self.ctrl(0)
                    .copy_to(self.ctrl(self.buckets()), Group::WIDTH);
            }

            // If the hash table is not empty, we need to data-shuffle
            // to remove tombstones.
            if self.items != 0 {
                self.drop_deletes_without_resize(hasher);
            }

            self.growth_left = bucket_mask_to_capacity(self.bucket_mask) - self.items;
        }
    }

    /// With every control byte already converted to DELETED-or-EMPTY by
    /// `rehash_in_place`, walks the table and moves each still-DELETED
    /// element back to the slot its hash now probes to, using a single
    /// scratch slot as swap space. Does not touch the allocation.
    unsafe fn drop_deletes_without_resize(&mut self, hasher: &impl Fn(&S::Value) -> u64) {
        let mut guard_scratch: ManuallyDrop<S> = ManuallyDrop::new(mem::zeroed());
        let scratch: *mut S = &mut *guard_scratch as *mut S;

        for i in 0..self.buckets() {
            if *self.ctrl(i) != DELETED {
                continue;
            }

            'probe_loop: loop {
                let i_bucket = self.bucket(i);
                let value_ref = &*S::get(i_bucket.as_ptr());
                let hash = hasher(value_ref);
                let new_i = self.find_insert_slot(hash);

                // Probing works by scanning through all of the control
                // bytes in groups, which may not be aligned to the
                // group size. If both the new and old position fall
                // within the same unaligned group, then there is no
                // benefit in moving it and we can just continue to the
                // next entry in the table.
                if likely(self.is_in_same_group(i, new_i, hash)) {
                    self.set_ctrl(i, h2(hash));
                    break 'probe_loop;
                }

                let new_i_bucket = self.bucket(new_i);
                let new_ctrl = *self.ctrl(new_i);
                if special_is_empty(new_ctrl) {
                    // Perform a "normal" insert, moving the element
                    // directly to its target slot.
                    self.set_ctrl(new_i, h2(hash));
                    S::transfer(new_i_bucket.as_ptr(), i_bucket.as_ptr());
                    self.set_ctrl(i, EMPTY);
                    break 'probe_loop;
                } else {
                    // The slot we want to move to is occupied by
                    // another DELETED element. Swap the two elements via
                    // a scratch slot and then continue processing the
                    // element that we just swapped out, which is now at
                    // index i.
                    debug_assert_eq!(new_ctrl, DELETED);
                    self.set_ctrl(new_i, h2(hash));
                    S::transfer(scratch, i_bucket.as_ptr());
                    S::transfer(i_bucket.as_ptr(), new_i_bucket.as_ptr());
                    S::transfer(new_i_bucket.as_ptr(), scratch);
                    // Continue looping, processing the now-relocated
                    // element at `i`.
                }
            }
        }

        self.growth_left = bucket_mask_to_capacity(self.bucket_mask) - self.items;
    }

    #[inline]
    unsafe fn is_in_same_group(&self, i: usize, new_i: usize, hash: u64) -> bool {
        let probe_seq_pos = self.probe_seq(hash).pos;
        let probe_index =
            |pos: usize| (pos.wrapping_sub(probe_seq_pos) & self.bucket_mask) / Group::WIDTH;
        probe_index(i) == probe_index(new_i)
    }

    /// Grows (or creates) the allocation so that it can hold
    /// `new_capacity` elements, then moves every existing element into
    /// the new allocation before freeing the old one.
    fn resize(&mut self, new_capacity: usize, hasher: &impl Fn(&S::Value) -> u64) -> Result<()> {
        unsafe {
            let mut new_table = self.prepare_resize(new_capacity)?;

            // TODO: this is a bit inefficient. We could do this in one
            // pass if we had a `drain` method.
            for item in self.iter() {
                let value = &*S::get(item.as_ptr());
                let hash = hasher(value);

                // We can use a simpler version of insert() here since:
                // - there are no DELETED entries.
                // - we know there is enough space in the table.
                // - all elements are unique.
                let (index, _) = new_table.prepare_insert_slot(hash);
                S::transfer(new_table.bucket(index).as_ptr(), item.as_ptr());
            }

            // We successfully copied all elements without panicking. Now
            // replace self with the new table. The old table will have
            // its memory freed but the items will not be dropped (they
            // have been moved into the new table).
            mem::swap(self, &mut new_table);
            Ok(())
        }
    }

    /// Allocates a replacement table sized for `new_capacity` with its
    /// control bytes initialized, but no elements copied over yet; used
    /// by both `resize` and future bulk-rebuild callers.
    unsafe fn prepare_resize(&self, new_capacity: usize) -> Result<Self> {
        debug_assert!(self.items <= new_capacity);
        let buckets = capacity_to_buckets(new_capacity).ok_or(RawTableError::CapacityOverflow)?;
        let mut new_table = Self::new_uninitialized(self.alloc.clone(), buckets)?;
        new_table
            .ctrl(0)
            .write_bytes(EMPTY, new_table.num_ctrl_bytes());
        new_table.set_ctrl(new_table.bucket_mask, SENTINEL);
        new_table.growth_left -= self.items;
        new_table.items = self.items;
        Ok(new_table)
    }

    #[inline]
    unsafe fn prepare_insert_slot(&mut self, hash: u64) -> (usize, u8) {
        let index = self.find_insert_slot(hash);
        let old_ctrl = *self.ctrl(index);
        self.set_ctrl(index, h2(hash));
        (index, old_ctrl)
    }

    /// Rehashes the table so that it holds `capacity` usable slots after
    /// tombstones are cleared, going through a full resize; `capacity`
    /// must be at least as large as the current element count.
    pub fn rehash(&mut self, capacity: usize, hasher: impl Fn(&S::Value) -> u64) {
        debug_assert!(capacity >= self.items);
        self.resize(capacity, &hasher)
            .unwrap_or_else(|_| capacity_overflow());
    }

}

impl<S: SlotStrategy, A: Allocator> RawTable<S, A> {
    /// Returns an iterator over every full slot in the table, in
    /// control-array order. Iteration order is otherwise unspecified and
    /// mutating the table during iteration is unsound.
    #[inline]
    pub unsafe fn iter(&self) -> RawIter<S> {
        let data = Bucket::from_base_index(self.data_end(), 0);
        RawIter {
            iter: RawIterRange::new(self.ctrl.as_ptr(), data, self.buckets()),
            items: self.items,
        }
    }
}

impl<S: SlotStrategy, A: Allocator + Clone> RawTable<S, A> {
    /// Creates a new table with the same elements as `self`, cloning each
    /// value via `clone_value`.
    pub unsafe fn duplicate(&self, mut clone_value: impl FnMut(&S::Value) -> S::Value) -> Self {
        if self.is_empty_singleton() {
            return Self::new_in(self.alloc.clone());
        }

        let mut new_table = ManuallyDrop::new(
            Self::new_uninitialized(self.alloc.clone(), self.buckets())
                .unwrap_or_else(|_| capacity_overflow()),
        );

        new_table
            .ctrl(0)
            .copy_from_nonoverlapping(self.ctrl(0), new_table.num_ctrl_bytes());

        for item in self.iter() {
            let index = self.bucket_index(&item);
            let value = clone_value(&*S::get(item.as_ptr()));
            S::write(new_table.bucket(index).as_ptr(), value);
        }

        new_table.items = self.items;
        new_table.growth_left = self.growth_left;
        ManuallyDrop::into_inner(new_table)
    }
}

impl<S: SlotStrategy, A: Allocator> Drop for RawTable<S, A> {
    fn drop(&mut self) {
        if self.is_empty_singleton() {
            return;
        }
        unsafe {
            if mem::needs_drop::<S>() {
                for item in self.iter() {
                    S::drop_slot(item.as_ptr());
                }
            }
            let (layout, ctrl_offset) =
                calculate_layout::<S>(self.buckets()).unwrap_or_else(|| capacity_overflow());
            let ptr = NonNull::new_unchecked(self.ctrl.as_ptr().sub(ctrl_offset));
            self.alloc.free(ptr, layout);
        }
    }
}

// `ctrl: NonNull<u8>` makes the table `!Send` by default. It owns its
// slots exclusively (no shared references escape `RawTable`'s API), so
// moving it across threads is sound whenever the payload is; but nothing
// about group probing is safe to run concurrently from two threads, so we
// deliberately do not add a `Sync` impl.
unsafe impl<S: SlotStrategy + Send, A: Allocator + Send> Send for RawTable<S, A> {}

impl<S: SlotStrategy> Default for RawTable<S, Global> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a contiguous run of the control array, used both as the
/// whole-table iterator and (once split) as the two halves of a rayon-style
/// parallel iterator; this crate only exposes the sequential form.
pub(crate) struct RawIterRange<S> {
    current_group: BitMask,
    data: Bucket<S>,
    next_ctrl: *const u8,
    end: *const u8,
}

impl<S> RawIterRange<S> {
    #[inline]
    unsafe fn new(ctrl: *const u8, data: Bucket<S>, len: usize) -> Self {
        debug_assert_ne!(len, 0);
        let end = ctrl.add(len);
        let current_group = Group::load_aligned(ctrl).match_full();
        let next_ctrl = ctrl.add(Group::WIDTH);
        Self {
            current_group,
            data,
            next_ctrl,
            end,
        }
    }
}

impl<S> Clone for RawIterRange<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            current_group: self.current_group,
            data: self.data.clone(),
            next_ctrl: self.next_ctrl,
            end: self.end,
        }
    }
}

impl<S> Iterator for RawIterRange<S> {
    type Item = Bucket<S>;

    #[inline]
    fn next(&mut self) -> Option<Bucket<S>> {
        unsafe {
            loop {
                if let Some(index) = self.current_group.lowest_set_bit() {
                    self.current_group = self.current_group.remove_lowest_bit();
                    return Some(self.data.next_n(index));
                }

                if self.next_ctrl >= self.end {
                    return None;
                }

                self.current_group = Group::load_aligned(self.next_ctrl).match_full();
                self.data = self.data.next_n(Group::WIDTH);
                self.next_ctrl = self.next_ctrl.add(Group::WIDTH);
            }
        }
    }
}

impl<S> FusedIterator for RawIterRange<S> {}

/// Iterator over every full slot in a table.
pub struct RawIter<S> {
    pub(crate) iter: RawIterRange<S>,
    items: usize,
}

impl<S> Clone for RawIter<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            iter: self.iter.clone(),
            items: self.items,
        }
    }
}

impl<S> Iterator for RawIter<S> {
    type Item = Bucket<S>;

    #[inline]
    fn next(&mut self) -> Option<Bucket<S>> {
        if let Some(bucket) = self.iter.next() {
            self.items -= 1;
            Some(bucket)
        } else {
            debug_assert_eq!(self.items, 0);
            None
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items, Some(self.items))
    }
}

impl<S> ExactSizeIterator for RawIter<S> {}
impl<S> FusedIterator for RawIter<S> {}

#[inline]
#[cold]
fn capacity_overflow() -> ! {
    panic!("capacity overflow")
}
