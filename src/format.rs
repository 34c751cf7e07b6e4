//! On-disk layout constants and the paged I/O primitives used to read and
//! write fixed-width little-endian integers at 32-bit offsets.
//!
//! All integers on disk are unsigned 32 bits, little-endian. The concrete
//! width `L` is 4 bytes throughout.

use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Width, in bytes, of every on-disk integer (`len_t` in the original source).
pub const L: usize = 4;

/// Magic numbers identifying each of the four files.
pub const MAGIC_H: u32 = 0x6861_7368;
pub const MAGIC_KV: u32 = 0x6b76_6462;
pub const MAGIC_BLK: u32 = 0x626c_6b76;
pub const MAGIC_DKV: u32 = 0x646b_766b;

/// `.h`  : magic + hash function index.
pub const HSIZE_H: u32 = (2 * L) as u32;
/// `.kv` : magic only.
pub const HSIZE_KV: u32 = L as u32;
/// `.blk`: magic + number of allocated blocks.
pub const HSIZE_BLK: u32 = (2 * L) as u32;
/// `.dkv`: magic + entry count + end-of-kv offset.
pub const HSIZE_DKV: u32 = (3 * L) as u32;

/// Number of slots in the `.h` table (`P`, a prime).
pub const HASH_SLOTS: u32 = 999_983;

/// Size in bytes of a block in `.blk`.
pub const SIZE_BLK: u32 = 4096;
/// Size in bytes of a block's header (count or full-flag|next-block).
pub const SIZE_BLK_HEAD: u32 = L as u32;
/// Maximum number of occupied-offset slots per block (`N`).
pub const MAX_BLK_ENTRIES: u32 = (SIZE_BLK - SIZE_BLK_HEAD) / L as u32;
/// Upper bound on the number of allocatable blocks before `.blk` would
/// overflow a 32-bit address space.
pub const MAX_BLOCKS: u32 = (u32::MAX - HSIZE_BLK) / SIZE_BLK;

/// Minimum allocation/deallocation unit for `dkv_cache`, in bytes.
pub const CACHE_PAGE: u32 = 4096;
/// On-disk size of one `.dkv` entry: `(mem_usage:L, offset:L)`.
pub const DKV_ENTRY_SIZE: u32 = (2 * L) as u32;
/// dkv_cache entries per cache page.
pub const DKV_ENTRIES_PER_PAGE: u32 = CACHE_PAGE / DKV_ENTRY_SIZE;

/// High bit of a block header or a `.dkv` `mem_usage` field.
pub const FLAG_USED: u32 = 1 << 31;

/// Read up to `buf.len()` bytes at `offset`, returning the number of bytes
/// actually transferred. A return of 0 at or past end-of-file is not an
/// error — the hash directory and block chains rely on sparse, lazily
/// grown files where an unwritten region reads back as "empty": a fresh
/// `.h` slot that was never written reads back as offset 0, an empty bucket.
pub fn read_at(f: &mut File, offset: u32, buf: &mut [u8]) -> Result<usize> {
    f.seek(SeekFrom::Start(offset as u64))?;
    Ok(f.read(buf)?)
}

/// Like [`read_at`], but requires the full buffer to be filled; a short
/// read (other than a clean zero-byte EOF, which callers must check for
/// themselves via [`read_at`]) is an I/O error.
pub fn safe_read_at(f: &mut File, offset: u32, buf: &mut [u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset as u64))?;
    f.read_exact(buf)?;
    Ok(())
}

/// Write `buf` at `offset`. Writing past the current end of file extends it
/// with a zero-filled hole, exactly as the underlying `pwrite`/`lseek`+`write`
/// pair the original source relies on for the sparse `.h` table.
pub fn safe_write_at(f: &mut File, offset: u32, buf: &[u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset as u64))?;
    f.write_all(buf)?;
    Ok(())
}

/// Read a single little-endian `u32` at `offset`. Returns `Ok(None)` if
/// nothing at all could be read (a sparse, never-written slot); an error if
/// a partial (but non-zero) read occurred, since that indicates corruption.
pub fn read_u32_opt(f: &mut File, offset: u32) -> Result<Option<u32>> {
    let mut buf = [0u8; L];
    let n = read_at(f, offset, &mut buf)?;
    match n {
        0 => Ok(None),
        L => Ok(Some(u32::from_le_bytes(buf))),
        _ => Err(crate::error::Error::Corrupt(format!(
            "short read of {n} bytes at offset {offset}, expected 0 or {L}"
        ))),
    }
}

/// Read a single little-endian `u32` at `offset`, requiring the full width
/// to be present (used once a file's header is known to exist).
pub fn read_u32(f: &mut File, offset: u32) -> Result<u32> {
    let mut buf = [0u8; L];
    safe_read_at(f, offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a single little-endian `u32` at `offset`.
pub fn write_u32(f: &mut File, offset: u32, value: u32) -> Result<()> {
    safe_write_at(f, offset, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_matches_spec() {
        assert_eq!(MAX_BLK_ENTRIES, 1023);
        assert_eq!(HSIZE_H, 8);
        assert_eq!(HSIZE_KV, 4);
        assert_eq!(HSIZE_BLK, 8);
        assert_eq!(HSIZE_DKV, 12);
        assert_eq!(HASH_SLOTS, 999_983);
        assert_eq!(DKV_ENTRIES_PER_PAGE, 512);
    }

    #[test]
    fn read_at_past_eof_is_zero_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.write_all(&[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        let n = read_at(&mut f, 1000, &mut buf).unwrap();
        assert_eq!(n, 0);
        assert_eq!(read_u32_opt(&mut f, 1000).unwrap(), None);
        assert_eq!(read_u32_opt(&mut f, 0).unwrap(), Some(u32::from_le_bytes([1, 2, 3, 4])));
    }

    #[test]
    fn write_past_eof_extends_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        write_u32(&mut f, 100, 42).unwrap();
        assert_eq!(read_u32(&mut f, 100).unwrap(), 42);
        assert_eq!(read_u32(&mut f, 0).unwrap(), 0);
    }
}
