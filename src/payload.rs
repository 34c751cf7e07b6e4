//! The payload store (`.kv`): composing, writing, and reading
//! `(key_len,key,val_len,val)` records, and the allocator-backed
//! store/delete orchestration.

use crate::datum::fill_datum;
use crate::error::Result;
use crate::format::{read_u32, safe_write_at, L};
use crate::freelist::{self, AllocPolicy, DkvCache};
use std::fs::File;

/// Size in bytes a `(key,val)` pair occupies once composed as a record.
pub fn record_size(key_len: usize, val_len: usize) -> u32 {
    (key_len + val_len + 2 * L) as u32
}

fn compose_record(key: &[u8], val: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + val.len() + 2 * L);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(val.len() as u32).to_le_bytes());
    buf.extend_from_slice(val);
    buf
}

/// Writes a composed `(key,val)` record to `.kv` at `offset`.
pub fn write_record(kv: &mut File, offset: u32, key: &[u8], val: &[u8]) -> Result<()> {
    safe_write_at(kv, offset, &compose_record(key, val))
}

/// True if the record at `offset` has exactly `key` as its key, without
/// reading the value.
pub fn key_matches(kv: &mut File, offset: u32, key: &[u8]) -> Result<bool> {
    let key_len = read_u32(kv, offset)?;
    if key_len as usize != key.len() {
        return Ok(false);
    }
    let stored = fill_datum(kv, offset + L as u32, key_len, None)?;
    Ok(stored == key)
}

/// Reads the key of the record at `offset`.
pub fn read_record_key(kv: &mut File, offset: u32) -> Result<Vec<u8>> {
    let key_len = read_u32(kv, offset)?;
    fill_datum(kv, offset + L as u32, key_len, None)
}

/// Reads the value of the record at `offset`, through the datum-filling
/// contract's dual channel (`capacity = None` for "engine allocates",
/// `Some(cap)` for "caller bounds how much is read").
pub fn read_record_value(kv: &mut File, offset: u32, capacity: Option<usize>) -> Result<Vec<u8>> {
    let key_len = read_u32(kv, offset)?;
    let val_len_offset = offset + L as u32 + key_len;
    let val_len = read_u32(kv, val_len_offset)?;
    fill_datum(kv, val_len_offset + L as u32, val_len, capacity)
}

/// Stores `(key,val)` as a new record: selects a target extent, writes the
/// record bytes, then reflects the allocation in `dkv_cache` — in that
/// order, so a crash between the write and the directory update leaves an
/// extent still marked FREE rather than introducing a phantom live key.
/// Returns the record's offset.
pub fn store_kv(
    kv: &mut File,
    cache: &mut DkvCache,
    end_kv: &mut u32,
    alloc: AllocPolicy,
    key: &[u8],
    val: &[u8],
) -> Result<u32> {
    let size = record_size(key.len(), val.len());
    let plan = freelist::plan(cache, *end_kv, alloc, size)?;
    let offset = plan.offset();
    write_record(kv, offset, key, val)?;
    freelist::commit(cache, end_kv, plan, size)?;
    Ok(offset)
}

/// Releases the record at `offset`, coalescing its extent with adjacent
/// FREE neighbours and truncating `.kv` if it was the trailing extent.
pub fn release_record(kv: &mut File, cache: &mut DkvCache, end_kv: &mut u32, offset: u32) -> Result<()> {
    freelist::release(cache, kv, end_kv, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC_KV;
    use std::io::Write as _;

    fn scratch_kv() -> File {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.kv");
        let mut f = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        f.write_all(&MAGIC_KV.to_le_bytes()).unwrap();
        std::mem::forget(dir);
        f
    }

    #[test]
    fn write_then_read_round_trips_key_and_value() {
        let mut kv = scratch_kv();
        write_record(&mut kv, 4, b"hello", b"world").unwrap();
        assert_eq!(read_record_key(&mut kv, 4).unwrap(), b"hello");
        assert_eq!(read_record_value(&mut kv, 4, None).unwrap(), b"world");
    }

    #[test]
    fn key_matches_rejects_different_length_and_different_bytes() {
        let mut kv = scratch_kv();
        write_record(&mut kv, 4, b"abc", b"v").unwrap();
        assert!(key_matches(&mut kv, 4, b"abc").unwrap());
        assert!(!key_matches(&mut kv, 4, b"ab").unwrap());
        assert!(!key_matches(&mut kv, 4, b"xyz").unwrap());
    }

    #[test]
    fn store_kv_appends_when_cache_is_empty() {
        let mut kv = scratch_kv();
        let mut cache = DkvCache::new();
        let mut end_kv = 4;
        let offset = store_kv(&mut kv, &mut cache, &mut end_kv, AllocPolicy::FirstFit, b"k", b"v").unwrap();
        assert_eq!(offset, 4);
        assert_eq!(end_kv, 4 + record_size(1, 1));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(0).is_used());
    }

    #[test]
    fn store_kv_then_release_then_reuse_same_size_keeps_offset() {
        let mut kv = scratch_kv();
        let mut cache = DkvCache::new();
        let mut end_kv = 4;
        let offset_a = store_kv(&mut kv, &mut cache, &mut end_kv, AllocPolicy::FirstFit, b"a", b"AAAAAAA").unwrap();
        release_record(&mut kv, &mut cache, &mut end_kv, offset_a).unwrap();
        assert_eq!(end_kv, 4, "sole trailing extent must be truncated away");
        let offset_b = store_kv(&mut kv, &mut cache, &mut end_kv, AllocPolicy::FirstFit, b"a", b"BBBBBBB").unwrap();
        assert_eq!(offset_b, offset_a);
    }

    #[test]
    fn empty_value_round_trips() {
        let mut kv = scratch_kv();
        let mut cache = DkvCache::new();
        let mut end_kv = 4;
        let offset = store_kv(&mut kv, &mut cache, &mut end_kv, AllocPolicy::FirstFit, b"k", b"").unwrap();
        assert_eq!(read_record_value(&mut kv, offset, None).unwrap(), Vec::<u8>::new());
    }
}
