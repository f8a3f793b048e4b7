//! Three-file circular commit log (C7).
//!
//! Layout matches the sibling-directory scheme of §4.7/§6: a fixed-size
//! `log_access` header holding an interprocess mutex and two redundant
//! preambles behind a selector bit, plus the appendable `log_a`/`log_b`
//! data files. The header mutex is a real `flock()` advisory lock taken on
//! the header file's descriptor — the same primitive the original reaches
//! for in `util::File::lock` over BSD/Linux `flock()` — so the critical
//! section below is safe across processes sharing one directory, not just
//! across threads within one.
//!
//! Append protocol: lock the header; grow the active file if the entry
//! still fits under the growth cap, otherwise — if the inactive file's
//! whole range is already behind the last seen version — rotate onto it
//! instead of growing further; write `{size, payload, pad}` and
//! `msync`/`fsync` (unless disabled for testing); publish the updated
//! preamble into the header slot the selector does not yet point at and
//! flip onto it in one write; unlock. A crash at any point before that
//! final write leaves the previously-selected slot, which this call never
//! touched, authoritative, so recovery always has one valid copy.
//!
//! One deliberate deviation from a literal reading of the recycling rule:
//! rather than collapsing the retired file's version range to `end` (which
//! would make the other file's still-live entries unaddressable), rotation
//! here keeps the newly-inactive file's own starting version intact and
//! only resets the file that was actually empty. See `DESIGN.md` for the
//! reasoning.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::config::GrowthPolicy;
use crate::error::{EngineError, Result};

const PREAMBLE_SIZE: u64 = 56;
const SELECTOR_SLOT_SIZE: u64 = 8;
const HEADER_SIZE: u64 = SELECTOR_SLOT_SIZE + 2 * PREAMBLE_SIZE;
const ENTRY_ALIGN: u64 = 8;

fn align_up(n: u64) -> u64 {
    (n + ENTRY_ALIGN - 1) / ENTRY_ALIGN * ENTRY_ALIGN
}

/// `log_a` is index 0, `log_b` is index 1; `active_is_a` selects between
/// them. Kept as a free function since it never needs `&self` — it is
/// purely a projection of a `Preamble`'s own flag.
fn data_index(is_a: bool) -> usize {
    if is_a {
        0
    } else {
        1
    }
}

/// One redundant copy of the log's invariants. `active_is_a` names which
/// data file new entries land in; `first_version_a`/`first_version_b` are
/// each file's own oldest live version; `end` is one past the newest
/// version anywhere in the log; `offset_a`/`offset_b` are each file's own
/// next-write position; `last_seen` is the oldest version any reader still
/// needs, pushed in from
/// [`crate::snapshot::SnapshotCoordinator::end_read`].
#[derive(Clone, Copy, Default)]
struct Preamble {
    active_is_a: bool,
    first_version_a: u64,
    first_version_b: u64,
    end: u64,
    offset_a: u64,
    offset_b: u64,
    last_seen: u64,
}

impl Preamble {
    fn encode(&self) -> [u8; PREAMBLE_SIZE as usize] {
        let mut out = [0u8; PREAMBLE_SIZE as usize];
        out[0..8].copy_from_slice(&(self.active_is_a as u64).to_le_bytes());
        out[8..16].copy_from_slice(&self.first_version_a.to_le_bytes());
        out[16..24].copy_from_slice(&self.first_version_b.to_le_bytes());
        out[24..32].copy_from_slice(&self.end.to_le_bytes());
        out[32..40].copy_from_slice(&self.offset_a.to_le_bytes());
        out[40..48].copy_from_slice(&self.offset_b.to_le_bytes());
        out[48..56].copy_from_slice(&self.last_seen.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        Preamble {
            active_is_a: u64::from_le_bytes(bytes[0..8].try_into().unwrap()) != 0,
            first_version_a: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            first_version_b: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            end: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            offset_a: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            offset_b: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            last_seen: u64::from_le_bytes(bytes[48..56].try_into().unwrap()),
        }
    }

    fn first_version(&self, is_a: bool) -> u64 {
        if is_a {
            self.first_version_a
        } else {
            self.first_version_b
        }
    }

    fn set_first_version(&mut self, is_a: bool, value: u64) {
        if is_a {
            self.first_version_a = value;
        } else {
            self.first_version_b = value;
        }
    }

    fn offset(&self, is_a: bool) -> u64 {
        if is_a {
            self.offset_a
        } else {
            self.offset_b
        }
    }

    fn set_offset(&mut self, is_a: bool, value: u64) {
        if is_a {
            self.offset_a = value;
        } else {
            self.offset_b = value;
        }
    }
}

/// `log_access`: the fixed-size header file carrying the interprocess
/// mutex and the selector-guarded pair of preambles.
struct HeaderFile {
    file: File,
    selector_is_a: bool,
    preambles: [Preamble; 2],
}

impl HeaderFile {
    fn open_or_create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            let header = HeaderFile { file, selector_is_a: true, preambles: [Preamble::default(); 2] };
            header.write_all_to_disk()?;
            return Ok(header);
        }
        let mut bytes = vec![0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let selector_is_a = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) != 0;
        let a_start = SELECTOR_SLOT_SIZE as usize;
        let b_start = a_start + PREAMBLE_SIZE as usize;
        let a = Preamble::decode(&bytes[a_start..b_start]);
        let b = Preamble::decode(&bytes[b_start..HEADER_SIZE as usize]);
        Ok(HeaderFile { file, selector_is_a, preambles: [a, b] })
    }

    fn write_all_to_disk(&self) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        out.extend_from_slice(&(self.selector_is_a as u64).to_le_bytes());
        out.extend_from_slice(&self.preambles[0].encode());
        out.extend_from_slice(&self.preambles[1].encode());
        (&self.file).seek(SeekFrom::Start(0))?;
        (&self.file).write_all(&out)?;
        Ok(())
    }

    /// Blocking interprocess critical section over BSD/Linux `flock()`,
    /// matching the original's `util::File::lock(true, false)`.
    fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(EngineError::LogicError(format!(
                "commit log header lock failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn unlock(&self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    fn selected(&self) -> usize {
        self.selector_is_a as usize
    }

    fn active(&self) -> &Preamble {
        &self.preambles[self.selected()]
    }

    /// Writes `next` into the header slot the selector does *not* yet
    /// point at, then flips the selector onto it — the commit point. Both
    /// happen in one `write_all_to_disk` call, so the slot the selector
    /// still points at on disk is never touched until this succeeds.
    fn commit_preamble(&mut self, next: Preamble) -> Result<()> {
        let other = 1 - self.selected();
        self.preambles[other] = next;
        self.selector_is_a = other == 0;
        self.write_all_to_disk()
    }
}

struct Changeset {
    version: u64,
    payload: Vec<u8>,
}

/// One of `log_a`/`log_b`: an appendable file holding only entry bytes,
/// now that the preamble lives in the shared header.
struct DataFile {
    file: File,
    path: PathBuf,
    capacity: u64,
    entries: Vec<Changeset>,
}

impl DataFile {
    fn open_or_create(path: &Path, initial_size: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let capacity = len.max(initial_size);
        if len < capacity {
            file.set_len(capacity)?;
        }
        Ok(DataFile { file, path: path.to_path_buf(), capacity, entries: Vec::new() })
    }

    /// Replays `[0, write_offset)` to rebuild the in-memory entry index
    /// after reopen, tagging entries with ascending versions starting at
    /// `first_version`.
    fn recover(&mut self, first_version: u64, write_offset: u64) -> Result<()> {
        self.entries.clear();
        let mut offset = 0u64;
        let mut version = first_version;
        while offset < write_offset {
            self.file.seek(SeekFrom::Start(offset))?;
            let mut size_buf = [0u8; 8];
            if self.file.read_exact(&mut size_buf).is_err() {
                break;
            }
            let size = u64::from_le_bytes(size_buf);
            let mut payload = vec![0u8; size as usize];
            if self.file.read_exact(&mut payload).is_err() {
                break; // torn write at the tail; recovery stops here.
            }
            self.entries.push(Changeset { version, payload });
            version += 1;
            offset += align_up(8 + size);
        }
        Ok(())
    }

    fn grow_to_fit(&mut self, write_offset: u64, needed: u64) -> Result<()> {
        if write_offset + needed <= self.capacity {
            return Ok(());
        }
        let mut new_capacity = self.capacity.max(1);
        while write_offset + needed > new_capacity {
            new_capacity *= 2;
        }
        self.file.set_len(new_capacity)?;
        self.capacity = new_capacity;
        Ok(())
    }

    fn append_at(&mut self, offset: u64, version: u64, payload: &[u8], sync: bool) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&(payload.len() as u64).to_le_bytes())?;
        self.file.write_all(payload)?;
        let entry_len = align_up(8 + payload.len() as u64);
        let pad = entry_len - (8 + payload.len() as u64);
        if pad > 0 {
            self.file.write_all(&vec![0u8; pad as usize])?;
        }
        if sync {
            self.file.sync_data()?;
        }
        self.entries.push(Changeset { version, payload: payload.to_vec() });
        Ok(())
    }

    fn reset(&mut self) {
        self.entries.clear();
    }
}

/// The three-file commit log: [`HeaderFile`] plus the `log_a`/`log_b`
/// [`DataFile`]s it rotates between.
pub struct CommitLog {
    header: HeaderFile,
    data: [DataFile; 2],
    growth_cap: u64,
    disable_sync_to_disk: bool,
}

impl CommitLog {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_policy(dir, &GrowthPolicy::conservative(), false)
    }

    pub fn open_with_policy(dir: &Path, growth: &GrowthPolicy, disable_sync_to_disk: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let header = HeaderFile::open_or_create(&dir.join("log_access"))?;
        let initial = growth.log_initial_size as u64;
        let mut a = DataFile::open_or_create(&dir.join("log_a"), initial)?;
        let mut b = DataFile::open_or_create(&dir.join("log_b"), initial)?;
        let p = *header.active();
        a.recover(p.first_version_a, p.offset_a)?;
        b.recover(p.first_version_b, p.offset_b)?;
        Ok(CommitLog { header, data: [a, b], growth_cap: growth.growth_cap as u64, disable_sync_to_disk })
    }

    /// Appends a new changeset: lock, grow or rotate the active file as
    /// needed, write the entry, publish the updated preamble and flip the
    /// selector as one disk write, unlock.
    pub fn append(&mut self, version: u64, payload: &[u8]) -> Result<()> {
        self.header.lock()?;
        let result = self.append_locked(version, payload);
        self.header.unlock();
        result
    }

    fn append_locked(&mut self, version: u64, payload: &[u8]) -> Result<()> {
        let mut next = *self.header.active();
        let entry_len = align_up(8 + payload.len() as u64);
        let mut write_offset = next.offset(next.active_is_a);

        if write_offset + entry_len > self.growth_cap {
            let inactive_first = next.first_version(!next.active_is_a);
            let active_first = next.first_version(next.active_is_a);
            let inactive_is_retired = self.data[data_index(!next.active_is_a)].entries.is_empty()
                || (next.last_seen >= active_first && inactive_first < active_first);
            if inactive_is_retired {
                self.data[data_index(!next.active_is_a)].reset();
                next.set_offset(!next.active_is_a, 0);
                next.set_first_version(!next.active_is_a, version);
                next.active_is_a = !next.active_is_a;
                write_offset = 0;
                tracing::debug!(version, "commit log rotated to the other file");
            }
            // Otherwise the inactive file still has live entries: fall
            // through and grow the active file past its nominal cap
            // rather than lose data.
        }

        let active_idx = data_index(next.active_is_a);
        if self.data[active_idx].entries.is_empty() {
            next.set_first_version(next.active_is_a, version);
        }

        self.data[active_idx].grow_to_fit(write_offset, entry_len)?;
        self.data[active_idx].append_at(write_offset, version, payload, !self.disable_sync_to_disk)?;
        next.set_offset(next.active_is_a, write_offset + entry_len);
        next.end = version + 1;
        self.header.commit_preamble(next)
    }

    /// Copies every changeset with `from <= version < to` into `out`, in
    /// version order, reading across both files as needed.
    pub fn get_changesets(&self, from: u64, to: u64, out: &mut Vec<(u64, Vec<u8>)>) -> Result<()> {
        let end = self.header.active().end.min(to);
        let mut all: Vec<&Changeset> = self.data[0]
            .entries
            .iter()
            .chain(self.data[1].entries.iter())
            .filter(|c| c.version >= from && c.version < end)
            .collect();
        all.sort_by_key(|c| c.version);
        for c in all {
            out.push((c.version, c.payload.clone()));
        }
        Ok(())
    }

    /// §4.6 step 5: records the oldest version any reader still needs, so
    /// the next append that would otherwise grow past the cap can rotate
    /// onto the other file instead once that file's range falls behind it.
    pub fn set_oldest_bound_version(&mut self, version: u64) -> Result<()> {
        self.header.lock()?;
        let mut next = *self.header.active();
        next.last_seen = next.last_seen.max(version);
        let result = self.header.commit_preamble(next);
        self.header.unlock();
        result
    }

    /// Same operation as [`CommitLog::set_oldest_bound_version`]; kept as
    /// a distinct name for callers that think of this step as "recycle"
    /// rather than "advance the floor".
    pub fn recycle(&mut self, floor: u64) -> Result<()> {
        self.set_oldest_bound_version(floor)
    }

    /// Path of data file `which` (0 = `log_a`, 1 = `log_b`), independent of
    /// which one is currently active.
    pub fn path_of(&self, which: usize) -> &Path {
        &self.data[which].path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_growth(log_initial_size: usize, growth_cap: usize) -> GrowthPolicy {
        GrowthPolicy { initial_size: 1 << 16, growth_cap, log_initial_size }
    }

    #[test]
    fn append_and_read_back_in_version_order() {
        let dir = tempdir().unwrap();
        let mut log = CommitLog::open(dir.path()).unwrap();
        for v in 0..5u64 {
            log.append(v, format!("change-{v}").as_bytes()).unwrap();
        }
        let mut out = Vec::new();
        log.get_changesets(1, 4, &mut out).unwrap();
        let versions: Vec<u64> = out.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn the_active_file_grows_past_its_initial_size_while_under_the_cap() {
        let dir = tempdir().unwrap();
        let growth = small_growth(256, 1 << 20);
        let mut log = CommitLog::open_with_policy(dir.path(), &growth, true).unwrap();
        let payload = vec![0xABu8; 64];
        for v in 0..8u64 {
            log.append(v, &payload).unwrap();
        }
        let grown_len = std::fs::metadata(log.path_of(0)).unwrap().len();
        assert!(grown_len > 256, "active file should have grown past its initial size");
    }

    #[test]
    fn recovery_after_reopen_sees_every_committed_entry() {
        let dir = tempdir().unwrap();
        {
            let mut log = CommitLog::open(dir.path()).unwrap();
            for v in 0..3u64 {
                log.append(v, format!("v{v}").as_bytes()).unwrap();
            }
        }
        let log = CommitLog::open(dir.path()).unwrap();
        let mut out = Vec::new();
        log.get_changesets(0, 3, &mut out).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn rotates_to_the_other_file_once_the_cap_is_hit_and_it_is_retired() {
        let dir = tempdir().unwrap();
        let growth = small_growth(128, 160);
        let mut log = CommitLog::open_with_policy(dir.path(), &growth, true).unwrap();
        let payload = vec![0u8; 32];
        // Four entries of 40 bytes each exceed the 160-byte cap on the
        // fifth; the inactive file starts out empty, so it is always
        // eligible to take over immediately.
        for v in 0..5u64 {
            log.append(v, &payload).unwrap();
        }
        assert!(!log.header.active().active_is_a, "the fifth entry should have rotated onto log_b");
        let mut out = Vec::new();
        log.get_changesets(0, 5, &mut out).unwrap();
        assert_eq!(out.len(), 5, "entries from both files must remain readable after rotation");
    }

    #[test]
    fn set_oldest_bound_version_is_recorded_without_disturbing_an_already_safe_log() {
        let dir = tempdir().unwrap();
        let mut log = CommitLog::open(dir.path()).unwrap();
        log.append(0, b"payload").unwrap();
        log.set_oldest_bound_version(0).unwrap();
        assert_eq!(log.header.active().last_seen, 0);
    }

    #[test]
    fn header_file_round_trips_through_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = CommitLog::open(dir.path()).unwrap();
            log.append(0, b"hello").unwrap();
        }
        let header = HeaderFile::open_or_create(&dir.path().join("log_access")).unwrap();
        assert_eq!(header.active().end, 1);
    }
}
