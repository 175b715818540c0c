//! Directory scanning, 8.3/long-name matching, and entry creation/removal.
//!
//! A directory is addressed the same way a file's data is: a cluster chain of 32-byte slots.
//! `global_offset` below means "bytes from the start of that chain", not a disk-absolute byte
//! address — exactly the coordinate a [`crate::file::File`] handle stores for its own Short
//! entry.

use fat32_device::BlockDevice;
use fat32_err::{Error, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::layout::{
    short_name_checksum, LongDirEntry, ShortDirEntry, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_LONG_NAME,
    DIR_ENTRY_SIZE, FREE_ENTRY, LAST_LONG_ENTRY, REST_FREE_ENTRY,
};
use crate::time::FileTime;
use crate::FileSystem;

/// A located directory entry: its decoded Short entry, the byte offset (from the start of the
/// parent's cluster chain) at which that Short entry lives, and the length of the name that
/// resolved it.
#[derive(Debug, Clone, Copy)]
pub struct FoundEntry {
    pub short: ShortDirEntry,
    pub offset: u32,
    pub name_len: usize,
}

fn name_to_units(name: &str) -> Vec<u16> {
    name.chars().map(|c| c as u16).collect()
}

/// Renders `name` into an 8.3 `DIR_Name` field: uppercased, split at the last `.`, base
/// truncated to 8 bytes and extension to 3, both space-padded. Invalid-for-8.3 characters are
/// replaced with `_`. Used both to synthesize a Short entry's name at creation time and to
/// match a bare 8.3 name against an on-disk entry that carries no Long entries of its own.
fn short_name_bytes(name: &str) -> [u8; 11] {
    let upper = name.to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (upper.as_str(), ""),
    };

    let sanitize = |s: &str| -> Vec<u8> {
        s.bytes()
            .map(|b| if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'~') { b } else { b'_' })
            .collect()
    };

    let base = sanitize(base);
    let ext = sanitize(ext);

    let mut out = [b' '; 11];
    for (i, &b) in base.iter().take(8).enumerate() {
        out[i] = b;
    }
    for (i, &b) in ext.iter().take(3).enumerate() {
        out[8 + i] = b;
    }
    out
}

fn dot_entry_name(parent_dotdot: bool) -> [u8; 11] {
    if parent_dotdot {
        *b"..         "
    } else {
        *b".          "
    }
}

/// One 13-UCS2-code-unit window of `name`, zero/0xFFFF-padded per §4.4 when the window runs
/// past the end of the name.
fn long_chunk(units: &[u16], n: usize) -> [u16; 13] {
    let mut chunk = [0xFFFFu16; 13];
    let start = n * 13;
    for i in 0..13 {
        let idx = start + i;
        if idx < units.len() {
            chunk[i] = units[idx];
        } else if idx == units.len() {
            chunk[i] = 0x0000;
        } else {
            chunk[i] = 0xFFFF;
        }
    }
    chunk
}

fn long_chunk_matches(entry: &LongDirEntry, units: &[u16], n: usize) -> bool {
    let expected = long_chunk(units, n);
    entry.chars().eq(expected.iter().copied())
}

fn new_short_entry(name: [u8; 11], attr: u8, time: &FileTime) -> ShortDirEntry {
    let date = U16::new(time.pack_date());
    let time_word = U16::new(time.pack_time());
    ShortDirEntry {
        name,
        attr,
        nt_res: 0,
        crt_time_tenth: 0,
        crt_time: time_word,
        crt_date: date,
        lst_acc_date: date,
        fst_clus_hi: U16::new(0),
        wrt_time: time_word,
        wrt_date: date,
        fst_clus_lo: U16::new(0),
        file_size: U32::new(0),
    }
}

impl<D: BlockDevice> FileSystem<D> {
    /// Reads the 32-byte slot at `global_offset` into `buf`. `Ok(false)` means the chain ended
    /// before reaching that offset.
    pub(crate) fn dir_read_slot(&mut self, head: u32, global_offset: u32, buf: &mut [u8]) -> Result<bool> {
        let bytes_per_cluster = self.bytes_per_cluster();
        let steps = global_offset / bytes_per_cluster;
        let Some(cluster) = self.walk_chain(head, steps)? else {
            return Ok(false);
        };
        let intra = global_offset % bytes_per_cluster;
        let sector = self.sector_of(cluster)? + intra / fat32_device::SECTOR_SIZE as u32;
        let sector_offset = (intra % fat32_device::SECTOR_SIZE as u32) as u16;
        let read = self.cache.read(buf, sector, sector_offset, DIR_ENTRY_SIZE as u16)?;
        Ok(read as usize == DIR_ENTRY_SIZE)
    }

    /// Writes `buf` to the 32-byte slot at `global_offset`, extending the chain with freshly
    /// zeroed clusters if `global_offset` lies past what is currently allocated.
    pub(crate) fn dir_write_slot(&mut self, head: u32, global_offset: u32, buf: &[u8]) -> Result<()> {
        let bytes_per_cluster = self.bytes_per_cluster();
        let steps = global_offset / bytes_per_cluster;
        let cluster = self.walk_chain_extending(head, steps)?;
        let intra = global_offset % bytes_per_cluster;
        let sector = self.sector_of(cluster)? + intra / fat32_device::SECTOR_SIZE as u32;
        let sector_offset = (intra % fat32_device::SECTOR_SIZE as u32) as u16;
        let written = self.cache.write(buf, sector, sector_offset, DIR_ENTRY_SIZE as u16)?;
        if written as usize != DIR_ENTRY_SIZE {
            return Err(Error::WriteFail);
        }
        Ok(())
    }

    fn read_short(&mut self, head: u32, offset: u32) -> Result<Option<ShortDirEntry>> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        if !self.dir_read_slot(head, offset, &mut buf)? {
            return Ok(None);
        }
        Ok(Some(ShortDirEntry::read_from_bytes(&buf).map_err(|_| Error::Fail)?))
    }

    fn read_long(&mut self, head: u32, offset: u32) -> Result<Option<LongDirEntry>> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        if !self.dir_read_slot(head, offset, &mut buf)? {
            return Ok(None);
        }
        Ok(Some(LongDirEntry::read_from_bytes(&buf).map_err(|_| Error::Fail)?))
    }

    /// Scans `dir` (identified by its first cluster) for `name`, per the §4.4 name-match
    /// contract. Returns `Error::NotFound` if the scan reaches a terminating slot without a
    /// match.
    pub(crate) fn dir_search(&mut self, dir_first_cluster: u32, name: &str) -> Result<FoundEntry> {
        let units = name_to_units(name);
        let total_entries = units.len().div_ceil(13).max(1);
        let initial_exp = total_entries as u8;
        let short_target = short_name_bytes(name);
        let is_dot = name == ".";
        let is_dotdot = name == "..";

        let mut offset = 0u32;
        let mut exp = initial_exp;

        loop {
            let mut buf = [0u8; DIR_ENTRY_SIZE];
            if !self.dir_read_slot(dir_first_cluster, offset, &mut buf)? {
                return Err(Error::NotFound);
            }

            if buf[0] == REST_FREE_ENTRY {
                return Err(Error::NotFound);
            }
            if buf[0] == FREE_ENTRY {
                exp = initial_exp;
                offset += DIR_ENTRY_SIZE as u32;
                continue;
            }

            let attr = buf[11];
            if attr == ATTR_LONG_NAME {
                let long = LongDirEntry::read_from_bytes(&buf).map_err(|_| Error::Fail)?;
                let at_top = exp == initial_exp;
                let ord_matches = if at_top {
                    long.ord == (exp | LAST_LONG_ENTRY)
                } else {
                    long.ord == exp
                };
                let n = (total_entries as u8 - exp) as usize;
                if ord_matches && long_chunk_matches(&long, &units, n) {
                    exp -= 1;
                    if exp == 0 {
                        let short_offset = offset + DIR_ENTRY_SIZE as u32;
                        let Some(short) = self.read_short(dir_first_cluster, short_offset)? else {
                            return Err(Error::NotFound);
                        };
                        return Ok(FoundEntry {
                            short,
                            offset: short_offset,
                            name_len: name.len(),
                        });
                    }
                } else {
                    exp = initial_exp;
                }
            } else {
                if exp == initial_exp {
                    let short = ShortDirEntry::read_from_bytes(&buf).map_err(|_| Error::Fail)?;
                    let name_matches = if is_dot {
                        short.name == dot_entry_name(false)
                    } else if is_dotdot {
                        short.name == dot_entry_name(true)
                    } else {
                        short.name == short_target
                    };
                    if name_matches {
                        return Ok(FoundEntry {
                            short,
                            offset,
                            name_len: name.len(),
                        });
                    }
                }
                exp = initial_exp;
            }

            offset += DIR_ENTRY_SIZE as u32;
        }
    }

    /// Writes `short` (with its `name` field overwritten to `name`'s 8.3 rendering) to the
    /// first free run of slots in `dir`, preceded by `name`'s Long-entry chain. Used both by
    /// [`Self::dir_create_entry`] (a fresh, zeroed Short entry) and by rename (an existing
    /// Short entry whose size/cluster/timestamps must survive the move).
    pub(crate) fn write_long_and_short(
        &mut self,
        dir_first_cluster: u32,
        name: &str,
        mut short: ShortDirEntry,
    ) -> Result<FoundEntry> {
        let units = name_to_units(name);
        let total_entries = units.len().div_ceil(13).max(1);

        // Find the first terminating (0x00) slot.
        let mut offset = 0u32;
        loop {
            let mut buf = [0u8; DIR_ENTRY_SIZE];
            let resident = self.dir_read_slot(dir_first_cluster, offset, &mut buf)?;
            if !resident {
                // Chain exhausted without a terminator; extend it and re-read.
                self.dir_write_slot(dir_first_cluster, offset, &[0u8; DIR_ENTRY_SIZE])?;
                break;
            }
            if buf[0] == REST_FREE_ENTRY {
                break;
            }
            offset += DIR_ENTRY_SIZE as u32;
        }

        let short_target = short_name_bytes(name);
        let checksum = short_name_checksum(&short_target);

        for n in 0..total_entries {
            let ord_from_top = total_entries - n;
            let mut ord = ord_from_top as u8;
            if n == 0 {
                ord |= LAST_LONG_ENTRY;
            }
            let chunk = long_chunk(&units, n);
            let entry = LongDirEntry::new(ord, &chunk, checksum);
            self.dir_write_slot(dir_first_cluster, offset + (n as u32) * DIR_ENTRY_SIZE as u32, entry.as_bytes())?;
        }

        short.name = short_target;
        let short_offset = offset + (total_entries as u32) * DIR_ENTRY_SIZE as u32;
        self.dir_write_slot(dir_first_cluster, short_offset, short.as_bytes())?;

        Ok(FoundEntry {
            short,
            offset: short_offset,
            name_len: name.len(),
        })
    }

    /// Creates `name` in `dir`, writing its Long-entry run followed by a fresh Short entry, per
    /// §4.4. If `ATTR_DIRECTORY` is set, also allocates the new directory's first cluster and
    /// writes its synthetic `.`/`..` entries.
    pub(crate) fn dir_create_entry(
        &mut self,
        dir_first_cluster: u32,
        name: &str,
        flags: u8,
        time: Option<FileTime>,
    ) -> Result<FoundEntry> {
        let time = time.unwrap_or_else(FileTime::epoch);
        time.validate()?;

        let blank = new_short_entry([b' '; 11], flags, &time);
        let mut found = self.write_long_and_short(dir_first_cluster, name, blank)?;

        if flags & ATTR_DIRECTORY != 0 {
            let new_cluster = self.allocate(0)?.ok_or(Error::MemoryTableFail)?;
            self.zero_cluster(new_cluster)?;
            found.short.set_first_cluster(new_cluster);
            self.dir_write_slot(dir_first_cluster, found.offset, found.short.as_bytes())?;

            let mut dot = new_short_entry(dot_entry_name(false), flags | ATTR_HIDDEN, &time);
            dot.set_first_cluster(new_cluster);
            let mut dotdot = new_short_entry(dot_entry_name(true), flags | ATTR_HIDDEN, &time);
            dotdot.set_first_cluster(dir_first_cluster);

            self.dir_write_slot(new_cluster, 0, dot.as_bytes())?;
            self.dir_write_slot(new_cluster, DIR_ENTRY_SIZE as u32, dotdot.as_bytes())?;
        }

        Ok(found)
    }

    /// Marks the Short entry at `entry_offset` free and walks backward freeing its Long-entry
    /// run, without touching any cluster chain the entry names. Used by rename, which moves an
    /// entry's slots without releasing its data.
    pub(crate) fn free_entry_slots(&mut self, dir_first_cluster: u32, entry_offset: u32) -> Result<ShortDirEntry> {
        let Some(short) = self.read_short(dir_first_cluster, entry_offset)? else {
            return Err(Error::NotExist);
        };
        if short.is_free() {
            return Err(Error::NotExist);
        }

        let mut marked = short;
        marked.name[0] = FREE_ENTRY;
        self.dir_write_slot(dir_first_cluster, entry_offset, marked.as_bytes())?;

        let mut offset = entry_offset;
        while offset >= DIR_ENTRY_SIZE as u32 {
            offset -= DIR_ENTRY_SIZE as u32;
            let Some(long) = self.read_long(dir_first_cluster, offset)? else {
                break;
            };
            if long.attr != ATTR_LONG_NAME {
                break;
            }
            let mut freed = long;
            freed.ord = FREE_ENTRY;
            self.dir_write_slot(dir_first_cluster, offset, freed.as_bytes())?;
        }

        Ok(short)
    }

    /// Removes the entry at `entry_offset` entirely: frees its slots via
    /// [`Self::free_entry_slots`] and, if it names a non-empty cluster chain, frees that too.
    pub(crate) fn dir_remove_entry(&mut self, dir_first_cluster: u32, entry_offset: u32) -> Result<()> {
        let short = self.free_entry_slots(dir_first_cluster, entry_offset)?;
        let first_cluster = short.first_cluster();
        if first_cluster != 0 {
            self.free_chain(first_cluster)?;
        }
        Ok(())
    }
}
