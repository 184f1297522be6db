// src/wheel.rs
//
// Hierarchical timing wheel: 6 levels of 64 slots, level-k slots spanning
// 64^k ticks. Entries live in an index-linked arena; slot lists and the
// pending list are doubly linked through arena keys, so insert, removal and
// cascading are O(1) amortized.
use crate::task::TaskRef;

const BITS_PER_LEVEL: usize = 6;
pub(crate) const WHEEL_LEVELS: usize = 6;
pub(crate) const SLOTS_PER_LEVEL: usize = 1 << BITS_PER_LEVEL;
const SLOT_MASK: u64 = (SLOTS_PER_LEVEL - 1) as u64;

/// Largest representable timeout, in ticks.
pub(crate) const MAX_TIMEOUT: u64 = (1 << (BITS_PER_LEVEL * WHEEL_LEVELS)) - 1;

// The deadline field doubles as a tri-state tag: a real future instant, or
// one of these sentinels once the entry has expired.
const DEADLINE_PENDING: u64 = u64::MAX - 1;
const DEADLINE_FIRED: u64 = u64::MAX;

/// Arena key naming one timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryKey(usize);

struct TimerEntry {
    prev: Option<EntryKey>,
    next: Option<EntryKey>,
    task: TaskRef,
    deadline: u64,
    // Level and slot where the entry is currently linked, if any. Removal
    // cannot recompute this from the deadline: `elapsed` may have advanced
    // since insertion without the entry having cascaded yet.
    linked_at: Option<(usize, usize)>,
}

pub(crate) struct TimeWheel {
    elapsed: u64,
    slots: [[Option<EntryKey>; SLOTS_PER_LEVEL]; WHEEL_LEVELS],
    occupied: [u64; WHEEL_LEVELS],
    pending_head: Option<EntryKey>,
    entries: Vec<Option<TimerEntry>>,
    free: Vec<usize>,
}

#[inline]
fn slot_resolution(level: usize) -> u64 {
    1 << (BITS_PER_LEVEL * level)
}

#[inline]
fn level_resolution(slot_res: u64) -> u64 {
    SLOTS_PER_LEVEL as u64 * slot_res
}

#[inline]
fn slot_for(level: usize, instant: u64) -> usize {
    ((instant >> (BITS_PER_LEVEL * level)) & SLOT_MASK) as usize
}

/// Coarsest level whose slot resolution still distinguishes `timeout`.
fn level_for(timeout: u64) -> usize {
    let masked = (timeout | SLOT_MASK).min(MAX_TIMEOUT - 1);
    let significant = 63 - masked.leading_zeros() as usize;
    significant / BITS_PER_LEVEL
}

/// Next occupied slot at or after the slot containing `now`, scanning the
/// level circularly.
fn next_occupied_slot(level: usize, now: u64, bitmap: u64) -> Option<usize> {
    if bitmap == 0 {
        return None;
    }

    let now_slot = slot_for(level, now);
    let rotated = bitmap.rotate_right(now_slot as u32);
    let trailing = rotated.trailing_zeros() as usize;
    Some((now_slot + trailing) & SLOT_MASK as usize)
}

impl TimeWheel {
    pub(crate) fn new() -> Self {
        Self {
            elapsed: 0,
            slots: [[None; SLOTS_PER_LEVEL]; WHEEL_LEVELS],
            occupied: [0; WHEEL_LEVELS],
            pending_head: None,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    // ---------------- entry arena ----------------

    /// Allocates an entry holding a reference on `task`. The entry is not
    /// linked anywhere until `insert_timeout`.
    pub(crate) fn create_entry(&mut self, task: TaskRef, deadline: u64) -> EntryKey {
        let entry = TimerEntry {
            prev: None,
            next: None,
            task,
            deadline,
            linked_at: None,
        };

        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                EntryKey(idx)
            }
            None => {
                self.entries.push(Some(entry));
                EntryKey(self.entries.len() - 1)
            }
        }
    }

    fn release(&mut self, key: EntryKey) {
        let entry = self.entries[key.0].take();
        assert!(entry.is_some(), "released a dead timer entry");
        self.free.push(key.0);
        // Dropping the entry releases its task reference.
    }

    #[inline]
    fn entry(&self, key: EntryKey) -> &TimerEntry {
        self.entries[key.0].as_ref().expect("stale timer entry key")
    }

    #[inline]
    fn entry_mut(&mut self, key: EntryKey) -> &mut TimerEntry {
        self.entries[key.0].as_mut().expect("stale timer entry key")
    }

    #[inline]
    pub(crate) fn entry_fired(&self, key: EntryKey) -> bool {
        self.entry(key).deadline == DEADLINE_FIRED
    }

    // ---------------- linked-list plumbing ----------------

    fn push_front(&mut self, head: Option<EntryKey>, key: EntryKey) -> Option<EntryKey> {
        self.entry_mut(key).prev = None;
        self.entry_mut(key).next = head;
        if let Some(old) = head {
            self.entry_mut(old).prev = Some(key);
        }
        Some(key)
    }

    fn pop_front(&mut self, head: Option<EntryKey>) -> (Option<EntryKey>, Option<EntryKey>) {
        let Some(key) = head else {
            return (None, None);
        };

        let next = self.entry(key).next;
        if let Some(n) = next {
            self.entry_mut(n).prev = None;
        }
        self.entry_mut(key).next = None;
        (next, Some(key))
    }

    fn unlink(&mut self, head: Option<EntryKey>, key: EntryKey) -> Option<EntryKey> {
        let (prev, next) = {
            let entry = self.entry(key);
            (entry.prev, entry.next)
        };

        if let Some(p) = prev {
            self.entry_mut(p).next = next;
        }
        if let Some(n) = next {
            self.entry_mut(n).prev = prev;
        }
        self.entry_mut(key).prev = None;
        self.entry_mut(key).next = None;

        if head == Some(key) { next } else { head }
    }

    // ---------------- wheel operations ----------------

    /// Links the entry into the coarsest level whose resolution covers its
    /// remaining delay. A deadline that has already elapsed is marked fired
    /// on the spot; the caller observes it on its next poll.
    pub(crate) fn insert_timeout(&mut self, key: EntryKey) {
        let deadline = self.entry(key).deadline;
        if self.elapsed >= deadline {
            self.entry_mut(key).deadline = DEADLINE_FIRED;
            return;
        }

        let timeout = deadline - self.elapsed;
        let level = level_for(timeout);
        let slot = slot_for(level, deadline);

        self.slots[level][slot] = self.push_front(self.slots[level][slot], key);
        self.occupied[level] |= 1 << slot;
        self.entry_mut(key).linked_at = Some((level, slot));
    }

    /// Unlinks the entry from its slot (or from the pending list if it has
    /// expired but not yet been delivered) and frees it, dropping its task
    /// reference.
    pub(crate) fn remove_timeout(&mut self, key: EntryKey) {
        if self.entry(key).deadline == DEADLINE_PENDING {
            self.pending_head = self.unlink(self.pending_head, key);
        } else if let Some((level, slot)) = self.entry(key).linked_at {
            self.slots[level][slot] = self.unlink(self.slots[level][slot], key);
            if self.slots[level][slot].is_none() {
                self.occupied[level] &= !(1 << slot);
            }
        }
        self.release(key);
    }

    /// Slot-aligned instant of the nearest occupied slot, or `None` when the
    /// wheel holds no timers. The scheduler uses this as the upper bound on
    /// how long it may block.
    pub(crate) fn next_expiration(&self) -> Option<u64> {
        for level in 0..WHEEL_LEVELS {
            if let Some(slot) = next_occupied_slot(level, self.elapsed, self.occupied[level]) {
                let slot_res = slot_resolution(level);
                let level_res = level_resolution(slot_res);
                let level_start = self.elapsed & !(level_res - 1);
                return Some(level_start + slot as u64 * slot_res);
            }
        }
        None
    }

    /// Advances the wheel to `now`: every slot between the last elapsed
    /// position and `now` is drained, moving truly-elapsed entries to the
    /// pending list and cascading the rest into finer levels.
    pub(crate) fn process_at(&mut self, now: u64) {
        for level in 0..WHEEL_LEVELS {
            let slot_res = slot_resolution(level);
            let level_res = level_resolution(slot_res);
            let level_start = self.elapsed & !(level_res - 1);

            let base_slot = slot_for(level, self.elapsed);
            let mut rotated = self.occupied[level].rotate_right(base_slot as u32);
            let mut offset = 0usize;
            while rotated != 0 {
                let trailing = rotated.trailing_zeros() as usize;
                offset += trailing;

                let slot = (base_slot + offset) & SLOT_MASK as usize;
                let slot_start = level_start + slot as u64 * slot_res;
                if slot_start > now {
                    break;
                }

                self.elapsed = slot_start;
                self.process_slot(level, slot, now);

                rotated = if trailing >= 63 { 0 } else { rotated >> (trailing + 1) };
                offset += 1;
            }
        }
        self.elapsed = now;
    }

    fn process_slot(&mut self, level: usize, slot: usize, now: u64) {
        loop {
            let (head, popped) = self.pop_front(self.slots[level][slot]);
            self.slots[level][slot] = head;
            let Some(key) = popped else {
                break;
            };
            self.entry_mut(key).linked_at = None;

            if now >= self.entry(key).deadline {
                self.entry_mut(key).deadline = DEADLINE_PENDING;
                self.pending_head = self.push_front(self.pending_head, key);
            } else {
                // Relocated by a coarse slot expiring, not yet due: cascade
                // into a finer level relative to the new elapsed position.
                self.insert_timeout(key);
            }
        }
        self.occupied[level] &= !(1 << slot);
    }

    /// Drains one entry from the pending list, marking it fired and handing
    /// its task to the caller for waking. The entry itself stays allocated
    /// until its owner removes it.
    pub(crate) fn next_pending_task(&mut self) -> Option<TaskRef> {
        let (head, popped) = self.pop_front(self.pending_head);
        self.pending_head = head;
        let key = popped?;

        self.entry_mut(key).deadline = DEADLINE_FIRED;
        Some(self.entry(key).task.clone())
    }

    #[cfg(test)]
    pub(crate) fn live_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn elapsed(&self) -> u64 {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{FnFrame, Poll},
        runtime::Cx,
        task::{Task, TaskRef},
    };
    use proptest::prelude::*;

    fn task(id: u64) -> TaskRef {
        Task::new(id, FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(())))
    }

    fn drain_pending(wheel: &mut TimeWheel) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(task) = wheel.next_pending_task() {
            ids.push(task.id());
        }
        ids
    }

    #[test]
    fn level_for_boundaries() {
        assert_eq!(level_for(1), 0);
        assert_eq!(level_for(63), 0);
        assert_eq!(level_for(64), 1);
        assert_eq!(level_for(4095), 1);
        assert_eq!(level_for(4096), 2);
        assert_eq!(level_for(262143), 2);
        assert_eq!(level_for(u64::MAX), WHEEL_LEVELS - 1);
    }

    #[test]
    fn slot_for_boundaries() {
        assert_eq!(slot_for(0, 0), 0);
        assert_eq!(slot_for(0, 63), 63);
        assert_eq!(slot_for(1, 64), 1);
        assert_eq!(slot_for(1, 4095), 63);
    }

    #[test]
    fn resolutions() {
        assert_eq!(slot_resolution(0), 1);
        assert_eq!(slot_resolution(1), 64);
        assert_eq!(slot_resolution(2), 4096);
        assert_eq!(level_resolution(1), 64);
        assert_eq!(level_resolution(64), 4096);
        assert_eq!(level_resolution(4096), 262144);
    }

    #[test]
    fn next_occupied_slot_scans_circularly() {
        let bitmap = (1u64 << 5) | (1 << 10) | (1 << 20);
        assert_eq!(next_occupied_slot(0, 0, bitmap), Some(5));
        assert_eq!(next_occupied_slot(0, 6, bitmap), Some(10));
        assert_eq!(next_occupied_slot(0, 21, bitmap), Some(5));
        assert_eq!(next_occupied_slot(0, 0, 0), None);
    }

    #[test]
    fn insert_then_expiration_is_slot_aligned() {
        let mut wheel = TimeWheel::new();
        let key = wheel.create_entry(task(1), 500);
        wheel.insert_timeout(key);

        assert_eq!(wheel.next_expiration(), Some(448));

        wheel.remove_timeout(key);
        assert_eq!(wheel.live_entries(), 0);
    }

    #[test]
    fn insert_already_elapsed_fires_immediately() {
        let mut wheel = TimeWheel::new();
        wheel.process_at(1000);
        assert_eq!(wheel.elapsed(), 1000);

        let key = wheel.create_entry(task(1), 500);
        wheel.insert_timeout(key);

        assert!(wheel.entry_fired(key));
        assert_eq!(wheel.next_expiration(), None);

        wheel.remove_timeout(key);
    }

    #[test]
    fn process_at_fires_only_elapsed_deadlines() {
        let mut wheel = TimeWheel::new();
        let k1 = wheel.create_entry(task(1), 100);
        let k2 = wheel.create_entry(task(2), 200);
        wheel.insert_timeout(k1);
        wheel.insert_timeout(k2);

        wheel.process_at(150);
        assert_eq!(drain_pending(&mut wheel), vec![1]);
        assert!(wheel.entry_fired(k1));
        assert!(!wheel.entry_fired(k2));

        wheel.process_at(250);
        assert_eq!(drain_pending(&mut wheel), vec![2]);
        assert!(wheel.entry_fired(k2));

        wheel.remove_timeout(k1);
        wheel.remove_timeout(k2);
        assert_eq!(wheel.live_entries(), 0);
    }

    #[test]
    fn coarse_entry_cascades_to_finer_level() {
        let mut wheel = TimeWheel::new();
        let key = wheel.create_entry(task(1), 5000);
        wheel.insert_timeout(key);

        assert_eq!(wheel.next_expiration(), Some(4096));
        wheel.process_at(4096);
        assert!(drain_pending(&mut wheel).is_empty());

        assert_eq!(wheel.next_expiration(), Some(4992));
        wheel.process_at(5000);
        assert_eq!(drain_pending(&mut wheel), vec![1]);

        wheel.remove_timeout(key);
    }

    #[test]
    fn same_coarse_slot_fires_separately_after_cascade() {
        let mut wheel = TimeWheel::new();
        let k1 = wheel.create_entry(task(1), 4100);
        let k2 = wheel.create_entry(task(2), 4500);
        wheel.insert_timeout(k1);
        wheel.insert_timeout(k2);

        assert_eq!(wheel.next_expiration(), Some(4096));
        wheel.process_at(4096);
        assert!(drain_pending(&mut wheel).is_empty());

        assert_eq!(wheel.next_expiration(), Some(4100));
        wheel.process_at(4100);
        assert_eq!(drain_pending(&mut wheel), vec![1]);

        assert_eq!(wheel.next_expiration(), Some(4480));
        wheel.process_at(4500);
        assert_eq!(drain_pending(&mut wheel), vec![2]);

        wheel.remove_timeout(k1);
        wheel.remove_timeout(k2);
    }

    #[test]
    fn remove_before_firing_clears_slot() {
        let mut wheel = TimeWheel::new();
        let key = wheel.create_entry(task(1), 500);
        wheel.insert_timeout(key);
        wheel.remove_timeout(key);

        assert_eq!(wheel.next_expiration(), None);
        wheel.process_at(1000);
        assert!(drain_pending(&mut wheel).is_empty());
        assert_eq!(wheel.live_entries(), 0);
    }

    #[test]
    fn remove_survives_elapsed_advancing_past_insert_position() {
        let mut wheel = TimeWheel::new();
        // Level 1 at insert time; elapsed then moves close enough that the
        // remaining delay would look like level 0.
        let key = wheel.create_entry(task(1), 100);
        wheel.insert_timeout(key);
        wheel.process_at(50);

        wheel.remove_timeout(key);
        assert_eq!(wheel.next_expiration(), None);
        assert_eq!(wheel.live_entries(), 0);
    }

    #[test]
    fn remove_from_pending_list() {
        let mut wheel = TimeWheel::new();
        let k1 = wheel.create_entry(task(1), 100);
        let k2 = wheel.create_entry(task(2), 100);
        wheel.insert_timeout(k1);
        wheel.insert_timeout(k2);

        wheel.process_at(100);
        wheel.remove_timeout(k1);
        assert_eq!(drain_pending(&mut wheel), vec![2]);

        wheel.remove_timeout(k2);
        assert_eq!(wheel.live_entries(), 0);
    }

    proptest! {
        // Deadlines fire exactly once each, in nondecreasing order, when the
        // wheel is driven through successive expiration points.
        #[test]
        fn firing_order_matches_sorted_deadlines(
            deadlines in prop::collection::vec(1u64..60_000, 1..64)
        ) {
            let mut wheel = TimeWheel::new();
            let mut keys = Vec::new();
            for (id, &deadline) in deadlines.iter().enumerate() {
                let key = wheel.create_entry(task(id as u64), deadline);
                wheel.insert_timeout(key);
                keys.push(key);
            }

            let mut fired = Vec::new();
            let mut now = 0u64;
            while let Some(expiration) = wheel.next_expiration() {
                now = now.max(expiration);
                wheel.process_at(now);
                while let Some(task) = wheel.next_pending_task() {
                    fired.push(deadlines[task.id() as usize]);
                }
            }
            let mut sorted = fired.clone();
            sorted.sort_unstable();
            prop_assert_eq!(&fired, &sorted);
            prop_assert_eq!(fired.len(), deadlines.len());

            for key in keys {
                wheel.remove_timeout(key);
            }
            prop_assert_eq!(wheel.live_entries(), 0);
        }
    }
}
