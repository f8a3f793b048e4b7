//! Snapshot / MVCC coordinator (C6).
//!
//! Mirrors the connection-tracking discipline of the teacher's
//! `DatabaseManager`/`Database` pair (`RwLock` guarding the mutable engine,
//! `AtomicUsize` counters tracking who is still using what) but applies it
//! to *versions* rather than connections: each open read transaction holds
//! a slot in a small ring recording which committed version it pinned, and
//! the oldest version with a nonzero refcount is the floor the arena may
//! reclaim past (§4.6).
//!
//! There is exactly one writer at a time, serialized by `writer_mutex`,
//! matching the B+-tree's copy-on-write discipline: a writer never
//! mutates a node a reader might still be walking, it allocates a new one
//! and swaps the top ref in after every reader who could see the old tree
//! has gone.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::arena::{Arena, HeaderBlock, Ref, TransactionFreeList};
use crate::commitlog::CommitLog;
use crate::error::{EngineError, Result};

const READER_RING_SIZE: usize = 64;

struct ReaderSlot {
    version: AtomicU64,
    refcount: AtomicUsize,
}

/// A pinned read-only view of the database as of the version it was
/// opened at. Dropping it always releases the pin (so a forgotten call
/// never leaks a reader slot), but that plain `Drop` path only decrements
/// the refcount the way §5 says reader release "cannot block the writer
/// longer than updating a counter". Callers that want §4.6 step 5's
/// reclaim-on-drain behaviour call [`ReadTransaction::end_read`]
/// explicitly before dropping.
pub struct ReadTransaction<'a> {
    coordinator: &'a SnapshotCoordinator,
    slot: usize,
    released: Cell<bool>,
    pub version: u64,
    pub top_ref: Ref,
}

impl<'a> ReadTransaction<'a> {
    /// Releases the pin and, if this was the last reader still holding
    /// the oldest pinned version, advances the reclaim floor on both the
    /// allocator and the commit log (§4.6 step 5).
    pub fn end_read(self, arena: &mut Arena, log: &mut CommitLog) -> Result<()> {
        self.released.set(true);
        self.coordinator.end_read(self.slot, arena, log)
    }
}

impl<'a> Drop for ReadTransaction<'a> {
    fn drop(&mut self) {
        if !self.released.get() {
            self.coordinator.release_slot_only(self.slot);
        }
    }
}

/// An in-progress write transaction. Holding one blocks every other
/// writer (not readers) until `commit` or `rollback` consumes it; the
/// held `MutexGuard` is what enforces that at the type level.
pub struct WriteTransaction<'a> {
    _guard: std::sync::MutexGuard<'a, ()>,
    pub base_version: u64,
    pub top_ref: Ref,
    pub free_list: TransactionFreeList,
}

pub struct SnapshotCoordinator {
    readers: Vec<ReaderSlot>,
    writer_mutex: Mutex<()>,
    current_version: AtomicU64,
    current_top_ref: AtomicU64,
    selector: AtomicUsize,
}

impl SnapshotCoordinator {
    /// Bootstraps the coordinator from a freshly decoded header block.
    pub fn from_header(header: &HeaderBlock) -> Self {
        SnapshotCoordinator {
            readers: (0..READER_RING_SIZE)
                .map(|_| ReaderSlot { version: AtomicU64::new(0), refcount: AtomicUsize::new(0) })
                .collect(),
            writer_mutex: Mutex::new(()),
            current_version: AtomicU64::new(header.next_version.saturating_sub(1)),
            current_top_ref: AtomicU64::new(header.top_ref_slots[header.active_slot()]),
            selector: AtomicUsize::new(header.active_slot()),
        }
    }

    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::SeqCst)
    }

    /// Pins the current committed version and hands back a reader handle
    /// good until it's dropped.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>> {
        let version = self.current_version.load(Ordering::SeqCst);
        let top_ref = self.current_top_ref.load(Ordering::SeqCst);
        for (i, slot) in self.readers.iter().enumerate() {
            if slot.refcount.fetch_add(1, Ordering::SeqCst) == 0 {
                slot.version.store(version, Ordering::SeqCst);
                return Ok(ReadTransaction {
                    coordinator: self,
                    slot: i,
                    released: Cell::new(false),
                    version,
                    top_ref,
                });
            }
            slot.refcount.fetch_sub(1, Ordering::SeqCst);
        }
        Err(EngineError::LogicError(
            "reader ring exhausted: too many concurrent snapshots open".into(),
        ))
    }

    /// Plain refcount release with no reclaim side effects; the fallback
    /// path `Drop` takes when a reader was abandoned without calling
    /// `end_read` explicitly.
    fn release_slot_only(&self, slot: usize) {
        self.readers[slot].refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// §4.6 step 5: decrement the refcount; if this slot held the oldest
    /// pinned version and no other slot shares it, the reclaim floor has
    /// advanced, so push it into the allocator and the commit log.
    fn end_read(&self, slot: usize, arena: &mut Arena, log: &mut CommitLog) -> Result<()> {
        let released_version = self.readers[slot].version.load(Ordering::SeqCst);
        let was_oldest = released_version == self.oldest_pinned_version();
        let remaining = self.readers[slot].refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        if was_oldest && remaining == 0 {
            let new_oldest = self.oldest_pinned_version();
            arena.reclaim_up_to(new_oldest);
            log.set_oldest_bound_version(new_oldest)?;
        }
        Ok(())
    }

    /// The oldest version any live reader still depends on; the arena may
    /// not reuse space freed at or after this version.
    pub fn oldest_pinned_version(&self) -> u64 {
        self.readers
            .iter()
            .filter(|s| s.refcount.load(Ordering::SeqCst) > 0)
            .map(|s| s.version.load(Ordering::SeqCst))
            .min()
            .unwrap_or_else(|| self.current_version.load(Ordering::SeqCst))
    }

    /// Blocks until any other writer has committed or rolled back, then
    /// starts a new write transaction based on the current committed
    /// version.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        let guard = self
            .writer_mutex
            .lock()
            .map_err(|_| EngineError::LogicError("writer mutex poisoned".into()))?;
        Ok(WriteTransaction {
            _guard: guard,
            base_version: self.current_version.load(Ordering::SeqCst),
            top_ref: self.current_top_ref.load(Ordering::SeqCst),
            free_list: TransactionFreeList::default(),
        })
    }

    /// Publishes a write transaction's new top ref as the current version
    /// and flips the header's active slot — the linearisation point. The
    /// reclaim floor itself only moves in `end_read` (§4.6 step 5): a
    /// commit never frees space a reader might still need, it only makes
    /// the new version visible. The transaction's guard drops at the end
    /// of this call, releasing the writer mutex for the next writer.
    pub fn commit(&self, arena: &mut Arena, tx: WriteTransaction<'_>, new_top_ref: Ref) -> Result<u64> {
        let new_version = tx.base_version + 1;
        arena.commit_free_list(tx.free_list, new_version);
        self.current_top_ref.store(new_top_ref, Ordering::SeqCst);
        self.current_version.store(new_version, Ordering::SeqCst);
        let new_selector = 1 - self.selector.load(Ordering::SeqCst);
        self.selector.store(new_selector, Ordering::SeqCst);
        Ok(new_version)
    }

    /// Discards a write transaction's free list without publishing
    /// anything; the allocations it made become leaked space until the
    /// next compaction, same tradeoff the arena makes for any aborted
    /// transaction. The guard drops at the end of this call.
    pub fn rollback(&self, tx: WriteTransaction<'_>) {
        drop(tx.free_list);
    }

    pub fn header_snapshot(&self) -> HeaderBlock {
        let selector = self.selector.load(Ordering::SeqCst) != 0;
        let top = self.current_top_ref.load(Ordering::SeqCst);
        let mut slots = [top, top];
        slots[1 - selector as usize] = top;
        HeaderBlock {
            top_ref_slots: slots,
            selector,
            next_version: self.current_version.load(Ordering::SeqCst) + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrowthPolicy;
    use tempfile::tempdir;

    fn test_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        (dir, Arena::create(&path, GrowthPolicy::conservative()).unwrap())
    }

    #[test]
    fn read_transactions_pin_the_version_they_started_with() {
        let header = HeaderBlock { top_ref_slots: [0, 0], selector: false, next_version: 1 };
        let coord = SnapshotCoordinator::from_header(&header);
        let r1 = coord.begin_read().unwrap();
        assert_eq!(r1.version, 0);
        assert_eq!(coord.oldest_pinned_version(), 0);
        drop(r1);
    }

    #[test]
    fn commit_advances_version_but_does_not_reclaim_on_its_own() {
        let (_d, mut arena) = test_arena();
        let header = HeaderBlock { top_ref_slots: [0, 0], selector: false, next_version: 1 };
        let coord = SnapshotCoordinator::from_header(&header);
        let reader = coord.begin_read().unwrap();
        let wtx = coord.begin_write().unwrap();
        let v = coord.commit(&mut arena, wtx, 128).unwrap();
        assert_eq!(v, 1);
        assert_eq!(coord.oldest_pinned_version(), 0, "old reader still pins v0");
        drop(reader);
        assert_eq!(coord.current_version(), 1);
    }

    #[test]
    fn end_read_reclaims_once_the_oldest_readers_refcount_reaches_zero() {
        let log_dir = tempdir().unwrap();
        let mut log = crate::commitlog::CommitLog::open(log_dir.path()).unwrap();
        let (_d, mut arena) = test_arena();
        let header = HeaderBlock { top_ref_slots: [0, 0], selector: false, next_version: 1 };
        let coord = SnapshotCoordinator::from_header(&header);

        let reader = coord.begin_read().unwrap();
        let r1 = arena.alloc(64).unwrap();
        let mut tx = TransactionFreeList::default();
        Arena::free(&mut tx, r1, 64);
        arena.commit_free_list(tx, 1);

        reader.end_read(&mut arena, &mut log).unwrap();
        assert_eq!(coord.oldest_pinned_version(), 1, "no readers left; floor tracks the current version");

        let before = arena.len();
        let r2 = arena.alloc(64).unwrap();
        assert_eq!(r2, r1, "space freed at v1 is reusable once the floor reached v1");
        let _ = before;
    }

    #[test]
    fn plain_drop_releases_the_slot_without_reclaiming() {
        let (_d, mut arena) = test_arena();
        let header = HeaderBlock { top_ref_slots: [0, 0], selector: false, next_version: 1 };
        let coord = SnapshotCoordinator::from_header(&header);
        let r1 = arena.alloc(64).unwrap();
        let mut tx = TransactionFreeList::default();
        Arena::free(&mut tx, r1, 64);
        arena.commit_free_list(tx, 1);

        let reader = coord.begin_read().unwrap();
        drop(reader);
        assert_eq!(coord.oldest_pinned_version(), 0, "refcount-only release never advances the floor");
        let r2 = arena.alloc(64).unwrap();
        assert_ne!(r2, r1, "block tagged v1 must still be unreclaimed after a plain drop");
    }
}
