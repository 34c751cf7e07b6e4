//! The engine façade: `open`/`close` lifecycle, header validation, policy
//! dispatch, and the cursor-driven traversal.

use crate::blocks::{self, SlotLocation};
use crate::error::{Error, Result};
use crate::format::{
    read_u32, write_u32, DKV_ENTRY_SIZE, HSIZE_DKV, HSIZE_KV, L, MAGIC_BLK, MAGIC_DKV, MAGIC_H, MAGIC_KV,
};
pub use crate::freelist::AllocPolicy;
use crate::freelist::{DkvCache, Extent};
pub use crate::hash::HashIndex;
use crate::payload;
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// How a database is opened, mirroring the four mode strings `r` (read-only,
/// must exist), `w` (write-only for callers, created or truncated), `r+`
/// (read-write, created if absent), `w+` (read-write, created or truncated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    R,
    W,
    RPlus,
    WPlus,
}

impl OpenMode {
    fn creates(self) -> bool {
        matches!(self, OpenMode::W | OpenMode::WPlus | OpenMode::RPlus)
    }

    fn truncates(self) -> bool {
        matches!(self, OpenMode::W | OpenMode::WPlus)
    }

    fn is_write_only(self) -> bool {
        matches!(self, OpenMode::W)
    }

    fn is_read_only(self) -> bool {
        matches!(self, OpenMode::R)
    }
}

struct Paths {
    h: PathBuf,
    kv: PathBuf,
    blk: PathBuf,
    dkv: PathBuf,
}

impl Paths {
    fn for_base(base: &Path) -> Self {
        Paths {
            h: append_ext(base, "h"),
            kv: append_ext(base, "kv"),
            blk: append_ext(base, "blk"),
            dkv: append_ext(base, "dkv"),
        }
    }
}

fn append_ext(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn open_one(path: &Path, mode: OpenMode) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !mode.is_read_only() {
        options.write(true).create(mode.creates()).truncate(mode.truncates());
    }
    Ok(options.open(path)?)
}

/// An open database handle. Created by [`open`], mutated by [`Kv::put`]
/// and [`Kv::delete`], traversed by [`Kv::start`]/[`Kv::next`], and
/// flushed either explicitly via [`Kv::close`] or on drop.
pub struct Kv {
    h: File,
    kv: File,
    blk: File,
    dkv: File,
    base_path: PathBuf,
    hash_index: HashIndex,
    alloc: AllocPolicy,
    nb_blocks: u32,
    cache: DkvCache,
    end_kv: u32,
    write_only: bool,
    read_only: bool,
    cursor: u32,
    closed: bool,
}

/// Opens (creating if necessary, per `mode`) the four files sharing
/// `base`'s name and `.h`/`.kv`/`.blk`/`.dkv` suffixes.
///
/// `hidx` only takes effect when the database is being created; reopening
/// an existing database reads its hash index back from the `.h` header
/// and ignores this argument's functional selection (though an invalid
/// `hidx` is still rejected up front).
pub fn open<P: AsRef<Path>>(base: P, mode: OpenMode, hidx: u32, alloc: AllocPolicy) -> Result<Kv> {
    let base = base.as_ref().to_path_buf();
    let paths = Paths::for_base(&base);

    let mut h = open_one(&paths.h, mode)?;
    let mut kv = match open_one(&paths.kv, mode) {
        Ok(f) => f,
        Err(e) => {
            drop(h);
            return Err(e);
        }
    };
    let mut blk = match open_one(&paths.blk, mode) {
        Ok(f) => f,
        Err(e) => {
            drop(h);
            drop(kv);
            return Err(e);
        }
    };
    let mut dkv = match open_one(&paths.dkv, mode) {
        Ok(f) => f,
        Err(e) => {
            drop(h);
            drop(kv);
            drop(blk);
            return Err(e);
        }
    };

    if !mode.is_read_only() {
        if let Err(e) = kv.try_lock_exclusive() {
            return Err(Error::Io(e));
        }
    }

    let fresh = kv.metadata()?.len() == 0;

    let (hash_index, nb_blocks, cache, end_kv) = if fresh {
        if mode.is_read_only() {
            return Err(Error::Corrupt("database files are missing or empty".into()));
        }
        let hash_index = HashIndex::from_raw(hidx)?;
        write_u32(&mut h, 0, MAGIC_H)?;
        write_u32(&mut h, L as u32, hidx)?;
        write_u32(&mut kv, 0, MAGIC_KV)?;
        write_u32(&mut blk, 0, MAGIC_BLK)?;
        write_u32(&mut blk, L as u32, 0)?;
        write_u32(&mut dkv, 0, MAGIC_DKV)?;
        write_u32(&mut dkv, L as u32, 0)?;
        write_u32(&mut dkv, 2 * L as u32, HSIZE_KV)?;
        log::info!("created new database at {}", base.display());
        (hash_index, 0u32, DkvCache::new(), HSIZE_KV)
    } else {
        if read_u32(&mut h, 0)? != MAGIC_H {
            return Err(Error::Corrupt("bad .h magic".into()));
        }
        if read_u32(&mut kv, 0)? != MAGIC_KV {
            return Err(Error::Corrupt("bad .kv magic".into()));
        }
        if read_u32(&mut blk, 0)? != MAGIC_BLK {
            return Err(Error::Corrupt("bad .blk magic".into()));
        }
        if read_u32(&mut dkv, 0)? != MAGIC_DKV {
            return Err(Error::Corrupt("bad .dkv magic".into()));
        }

        let persisted_hidx = read_u32(&mut h, L as u32)?;
        let hash_index = HashIndex::from_raw(persisted_hidx)?;
        let nb_blocks = read_u32(&mut blk, L as u32)?;
        let nb_dkv_entries = read_u32(&mut dkv, L as u32)?;
        let end_kv = read_u32(&mut dkv, 2 * L as u32)?;

        let mut entries = Vec::with_capacity(nb_dkv_entries as usize);
        for i in 0..nb_dkv_entries {
            let rec_off = HSIZE_DKV + i * DKV_ENTRY_SIZE;
            let mem_usage = read_u32(&mut dkv, rec_off)?;
            let offset = read_u32(&mut dkv, rec_off + L as u32)?;
            entries.push(Extent { mem_usage, offset });
        }
        log::info!(
            "opened existing database at {} ({} blocks, {} extents)",
            base.display(),
            nb_blocks,
            nb_dkv_entries
        );
        (hash_index, nb_blocks, DkvCache::from_entries(entries), end_kv)
    };

    Ok(Kv {
        h,
        kv,
        blk,
        dkv,
        base_path: base,
        hash_index,
        alloc,
        nb_blocks,
        cache,
        end_kv,
        write_only: mode.is_write_only(),
        read_only: mode.is_read_only(),
        cursor: 0,
        closed: false,
    })
}

impl Kv {
    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        write_u32(&mut self.blk, L as u32, self.nb_blocks)?;
        write_u32(&mut self.dkv, L as u32, self.cache.len() as u32)?;
        write_u32(&mut self.dkv, 2 * L as u32, self.end_kv)?;
        for (i, e) in self.cache.as_slice().iter().enumerate() {
            let rec_off = HSIZE_DKV + i as u32 * DKV_ENTRY_SIZE;
            write_u32(&mut self.dkv, rec_off, e.mem_usage)?;
            write_u32(&mut self.dkv, rec_off + L as u32, e.offset)?;
        }
        let exact_len = HSIZE_DKV as u64 + self.cache.len() as u64 * DKV_ENTRY_SIZE as u64;
        self.dkv.set_len(exact_len)?;
        log::debug!(
            "flushed database at {} ({} blocks, {} extents)",
            self.base_path.display(),
            self.nb_blocks,
            self.cache.len()
        );
        Ok(())
    }

    /// Flushes metadata and extent directory, then releases the handle.
    /// A read-only handle has nothing to flush.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.closed = true;
        result
    }

    /// Inserts or replaces the value for `key`.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let hash = self.hash_index.hash(key);
        let head = blocks::read_head(&mut self.h, hash)?;

        if head == 0 {
            let offset = payload::store_kv(&mut self.kv, &mut self.cache, &mut self.end_kv, self.alloc, key, val)?;
            blocks::insert_first_entry(&mut self.blk, &mut self.h, &mut self.nb_blocks, hash, offset)?;
            return Ok(());
        }

        match blocks::scan_chain(&mut self.blk, &mut self.kv, head, key)? {
            SlotLocation::Match { block_offset, slot_index, payload_offset } => {
                blocks::write_slot(&mut self.blk, block_offset, slot_index, 0)?;
                payload::release_record(&mut self.kv, &mut self.cache, &mut self.end_kv, payload_offset)?;
                let new_offset =
                    payload::store_kv(&mut self.kv, &mut self.cache, &mut self.end_kv, self.alloc, key, val)?;
                blocks::write_slot(&mut self.blk, block_offset, slot_index, new_offset)?;
            }
            SlotLocation::Free { block_offset, slot_index } => {
                let new_offset =
                    payload::store_kv(&mut self.kv, &mut self.cache, &mut self.end_kv, self.alloc, key, val)?;
                blocks::fill_free_slot(&mut self.blk, block_offset, slot_index, new_offset)?;
            }
            SlotLocation::AppendNewSlot { block_offset, slot_index, new_count } => {
                let new_offset =
                    payload::store_kv(&mut self.kv, &mut self.cache, &mut self.end_kv, self.alloc, key, val)?;
                blocks::append_slot(&mut self.blk, block_offset, slot_index, new_count, new_offset)?;
            }
            SlotLocation::ExtendChain { last_block_offset } => {
                let new_offset =
                    payload::store_kv(&mut self.kv, &mut self.cache, &mut self.end_kv, self.alloc, key, val)?;
                blocks::extend_chain(&mut self.blk, &mut self.nb_blocks, last_block_offset, new_offset)?;
            }
        }
        Ok(())
    }

    /// Looks up `key`, returning its value (engine-allocated) or `None`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_into(key, None)
    }

    /// Like [`Kv::get`], but bounds the read to at most `capacity` bytes
    /// of the stored value when `capacity` is `Some`.
    pub fn get_into(&mut self, key: &[u8], capacity: Option<usize>) -> Result<Option<Vec<u8>>> {
        if self.write_only {
            return Err(Error::PermissionDenied("get on a write-only handle".into()));
        }
        let hash = self.hash_index.hash(key);
        let head = blocks::read_head(&mut self.h, hash)?;
        if head == 0 {
            return Ok(None);
        }
        match blocks::scan_chain(&mut self.blk, &mut self.kv, head, key)? {
            SlotLocation::Match { payload_offset, .. } => {
                Ok(Some(payload::read_record_value(&mut self.kv, payload_offset, capacity)?))
            }
            _ => Ok(None),
        }
    }

    /// Removes `key`. Fails with [`Error::NotFound`] if it is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let hash = self.hash_index.hash(key);
        let head = blocks::read_head(&mut self.h, hash)?;
        if head == 0 {
            return Err(Error::NotFound);
        }
        match blocks::scan_chain(&mut self.blk, &mut self.kv, head, key)? {
            SlotLocation::Match { block_offset, slot_index, payload_offset } => {
                payload::release_record(&mut self.kv, &mut self.cache, &mut self.end_kv, payload_offset)?;
                blocks::write_slot(&mut self.blk, block_offset, slot_index, 0)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Resets the traversal cursor to the beginning of `dkv_cache`.
    pub fn start(&mut self) {
        self.cursor = 0;
    }

    /// Yields the next live `(key, value)` pair in `dkv_cache` order, or
    /// `None` once exhausted. A cursor is invalidated semantically by an
    /// intervening `put`/`delete`: it may then skip or revisit entries, but
    /// never panics or reads out of bounds.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.write_only {
            return Err(Error::PermissionDenied("next on a write-only handle".into()));
        }
        while (self.cursor as usize) < self.cache.len() {
            let idx = self.cursor as usize;
            let extent = self.cache.get(idx);
            self.cursor += 1;
            if !extent.is_used() {
                continue;
            }
            let key = payload::read_record_key(&mut self.kv, extent.offset)?;
            let val = payload::read_record_value(&mut self.kv, extent.offset, None)?;
            return Ok(Some((key, val)));
        }
        Ok(None)
    }
}

impl Drop for Kv {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.flush() {
            log::error!("failed to flush database at {}: {}", self.base_path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn temp_base() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db");
        (dir, base)
    }

    #[test]
    fn s1_basic_put_get_delete() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::WPlus, 0, AllocPolicy::FirstFit).unwrap();
        db.put(b"My key1", b"My val1").unwrap();
        assert_eq!(db.get(b"My key1").unwrap(), Some(b"My val1".to_vec()));
        db.delete(b"My key1").unwrap();
        assert_eq!(db.get(b"My key1").unwrap(), None);
        assert!(matches!(db.delete(b"My key1").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn s2_write_only_handle_rejects_reads() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::W, 0, AllocPolicy::FirstFit).unwrap();
        db.put(b"k", b"v").unwrap();
        assert!(matches!(db.get(b"k").unwrap_err(), Error::PermissionDenied(_)));
        db.start();
        assert!(matches!(db.next().unwrap_err(), Error::PermissionDenied(_)));
    }

    #[test]
    fn s3_exact_size_reuse_keeps_offset_and_end_kv() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        db.put(b"a", b"AAAAAAA").unwrap();
        let end_before = db.end_kv;
        db.put(b"a", b"BBBBBBB").unwrap();
        assert_eq!(db.end_kv, end_before);
        assert_eq!(db.get(b"a").unwrap(), Some(b"BBBBBBB".to_vec()));
    }

    #[test]
    fn s4_deleting_two_adjacent_keys_coalesces_into_one_free_extent() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        let v = vec![7u8; 64];
        db.put(b"k1", &v).unwrap();
        db.put(b"k2", &v).unwrap();
        db.put(b"k3", &v).unwrap();
        db.delete(b"k2").unwrap();
        db.delete(b"k1").unwrap();

        let free_count = db.cache.as_slice().iter().filter(|e| !e.is_used()).count();
        assert_eq!(free_count, 1);
        assert_eq!(db.get(b"k3").unwrap(), Some(v));
    }

    #[test]
    fn s5_tail_delete_truncates_payload_file() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        db.put(b"k1", &vec![1u8; 10]).unwrap();
        db.put(b"k2", &vec![2u8; 20]).unwrap();
        let expected_len = db.kv.metadata().unwrap().len() - u64::from(payload::record_size(2, 20));
        db.delete(b"k2").unwrap();
        assert_eq!(db.kv.metadata().unwrap().len(), expected_len);
        assert_eq!(db.end_kv, expected_len as u32);
    }

    /// Picks a value length so that the resulting record occupies exactly
    /// `target_size` bytes as an extent.
    fn val_len_for_record_size(key_len: usize, target_size: u32) -> usize {
        target_size as usize - key_len - 2 * L
    }

    #[test_case(AllocPolicy::FirstFit, 200; "first fit picks the first sufficient extent")]
    #[test_case(AllocPolicy::BestFit, 80; "best fit picks the smallest sufficient extent")]
    #[test_case(AllocPolicy::WorstFit, 200; "worst fit picks the largest sufficient extent")]
    fn s6_policy_divergence_over_equal_sized_candidate_extents(policy: AllocPolicy, expected_extent_size: u32) {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, policy).unwrap();

        // Build three records whose extents are exactly 200, 80 and 150
        // bytes, each separated by a small live record so that deleting
        // a/b/c leaves three disjoint FREE extents in that cache order
        // (adjacent FREE extents would otherwise coalesce into one).
        let val_a = vec![0u8; val_len_for_record_size(1, 200)];
        let val_b = vec![0u8; val_len_for_record_size(1, 80)];
        let val_c = vec![0u8; val_len_for_record_size(1, 150)];
        db.put(b"sep0", b"x").unwrap();
        db.put(b"a", &val_a).unwrap();
        db.put(b"sep1", b"x").unwrap();
        db.put(b"b", &val_b).unwrap();
        db.put(b"sep2", b"x").unwrap();
        db.put(b"c", &val_c).unwrap();
        db.delete(b"a").unwrap();
        db.delete(b"b").unwrap();
        db.delete(b"c").unwrap();

        let target_offset = db
            .cache
            .as_slice()
            .iter()
            .find(|e| !e.is_used() && e.size() == expected_extent_size)
            .map(|e| e.offset)
            .expect("expected a free extent of the target size");

        // Request exactly 70 bytes, matching scenario S6's request size.
        let landing_val = vec![9u8; val_len_for_record_size(b"landing".len(), 70)];
        db.put(b"landing", &landing_val).unwrap();
        assert_eq!(db.get(b"landing").unwrap(), Some(landing_val));

        let reused = db.cache.as_slice().iter().any(|e| e.is_used() && e.offset == target_offset);
        assert!(reused, "expected the {policy:?} policy to reuse the extent at {target_offset}");
    }

    #[test]
    fn persists_across_close_and_reopen() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::WPlus, 2, AllocPolicy::BestFit).unwrap();
        db.put(b"x", b"1").unwrap();
        db.put(b"y", b"2").unwrap();
        db.close().unwrap();

        let mut reopened = open(&base, OpenMode::RPlus, 0, AllocPolicy::BestFit).unwrap();
        assert_eq!(reopened.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.get(b"y").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn cursor_visits_every_live_entry_exactly_once() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        let inserted: Vec<(&[u8], &[u8])> = vec![(b"a", b"1"), (b"b", b"2"), (b"c", b"3")];
        for (k, v) in &inserted {
            db.put(k, v).unwrap();
        }
        db.start();
        let mut seen = Vec::new();
        while let Some(pair) = db.next().unwrap() {
            seen.push(pair);
        }
        assert_eq!(seen.len(), inserted.len());
        for (k, v) in &inserted {
            assert!(seen.iter().any(|(sk, sv)| sk == k && sv == v));
        }
    }

    #[test]
    fn binary_safe_keys_and_values_round_trip() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        let key = vec![0u8, 1, 2, 0, 255];
        let val = vec![0u8; 32];
        db.put(&key, &val).unwrap();
        assert_eq!(db.get(&key).unwrap(), Some(val));
    }

    #[test]
    fn empty_value_is_stored_and_returned_as_empty() {
        let (_dir, base) = temp_base();
        let mut db = open(&base, OpenMode::RPlus, 0, AllocPolicy::FirstFit).unwrap();
        db.put(b"k", b"").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn hidx_0_and_1_open_compatible_databases() {
        let (_dir, base) = temp_base();
        let mut db0 = open(&base, OpenMode::WPlus, 0, AllocPolicy::FirstFit).unwrap();
        db0.put(b"k", b"v").unwrap();
        db0.close().unwrap();

        let mut reopened_as_1 = open(&base, OpenMode::RPlus, 1, AllocPolicy::FirstFit).unwrap();
        assert_eq!(reopened_as_1.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn invalid_hidx_is_rejected_at_creation() {
        let (_dir, base) = temp_base();
        let err = open(&base, OpenMode::WPlus, 9, AllocPolicy::FirstFit).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn read_only_open_of_missing_database_fails() {
        let (_dir, base) = temp_base();
        assert!(open(&base, OpenMode::R, 0, AllocPolicy::FirstFit).is_err());
    }
}
