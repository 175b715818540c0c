//! File handles: open/create/read/write/remove/change-attributes/close.
//!
//! A [`File`] is a detached copy of a Short directory entry plus enough context (its parent's
//! first cluster and its own byte offset within that directory) to write itself back. It is not
//! a live view into the cache — mutations are only visible on disk once the operation that made
//! them re-emits the Short entry, the way [`Self::close`] and [`Self::change_attributes`] do.

use fat32_device::BlockDevice;
use fat32_err::{Error, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::layout::{ShortDirEntry, ATTR_DIRECTORY, FAT_EOC, MAX_FILE_SIZE};
use crate::time::FileTime;
use crate::FileSystem;

/// Sentinel `dir_offset` for the synthetic root handle, which has no Short entry of its own to
/// flush back.
const ROOT_OFFSET: u32 = u32::MAX;

/// An open file or directory. See the module docs for its relationship to on-disk state.
#[derive(Debug, Clone, Copy)]
pub struct File {
    short: ShortDirEntry,
    name_len: usize,
    parent_first_cluster: u32,
    dir_offset: u32,
}

impl File {
    pub fn name_len(&self) -> usize {
        self.name_len
    }

    pub fn attributes(&self) -> u8 {
        self.short.attr
    }

    pub fn size(&self) -> u32 {
        self.short.file_size.get()
    }

    pub fn is_directory(&self) -> bool {
        self.short.attr & ATTR_DIRECTORY != 0
    }

    fn first_cluster(&self) -> u32 {
        self.short.first_cluster()
    }

    fn is_root(&self) -> bool {
        self.dir_offset == ROOT_OFFSET
    }
}

impl<D: BlockDevice> FileSystem<D> {
    /// The volume's root directory. Constructed fresh on every call; cheap, and never flushed
    /// back to disk since it has no parent-stored Short entry.
    pub fn root(&self) -> File {
        let mut short = blank_short_entry(ATTR_DIRECTORY);
        short.set_first_cluster(self.boot_sector.bpb_root_clus.get());
        File {
            short,
            name_len: 0,
            parent_first_cluster: 0,
            dir_offset: ROOT_OFFSET,
        }
    }

    /// Resolves `name` within `dir` to a handle. `dir` must be a directory.
    pub fn open(&mut self, dir: &File, name: &str) -> Result<File> {
        if !dir.is_directory() {
            return Err(Error::InvalidParameter);
        }
        let found = self.dir_search(dir.first_cluster(), name)?;
        Ok(File {
            short: found.short,
            name_len: found.name_len,
            parent_first_cluster: dir.first_cluster(),
            dir_offset: found.offset,
        })
    }

    /// Creates `name` in `dir` with the given attribute flags, stamped with `time` (or the
    /// epoch if absent). `dir` must be a directory.
    pub fn create(&mut self, dir: &File, name: &str, flags: u8, time: Option<FileTime>) -> Result<File> {
        if !dir.is_directory() {
            return Err(Error::InvalidParameter);
        }
        let found = self.dir_create_entry(dir.first_cluster(), name, flags, time)?;
        Ok(File {
            short: found.short,
            name_len: found.name_len,
            parent_first_cluster: dir.first_cluster(),
            dir_offset: found.offset,
        })
    }

    /// Removes `file` from its parent directory, freeing its cluster chain if it has one.
    /// Removing an already-removed entry returns `Error::NotExist`.
    pub fn remove(&mut self, file: &File) -> Result<()> {
        if file.is_root() {
            return Err(Error::InvalidParameter);
        }
        self.dir_remove_entry(file.parent_first_cluster, file.dir_offset)
    }

    /// Reads up to `buf.len()` bytes starting at `offset` into `file`'s data, stopping at the
    /// lesser of `buf.len()` and the file's recorded size. Returns the number of bytes copied.
    pub fn read(&mut self, file: &File, buf: &mut [u8], offset: u32) -> Result<usize> {
        let size = file.short.file_size.get();
        if offset > size {
            return Ok(0);
        }
        let head = file.first_cluster();
        if head == 0 {
            return Ok(0);
        }

        let bytes_per_cluster = self.bytes_per_cluster();
        let mut cluster = match self.walk_chain(head, offset / bytes_per_cluster)? {
            Some(cluster) => cluster,
            None => return Ok(0),
        };
        let mut cluster_off = offset % bytes_per_cluster;
        let mut absolute = offset;
        let mut copied = 0usize;

        while copied < buf.len() && absolute < size {
            let remaining_in_cluster = bytes_per_cluster - cluster_off;
            let remaining_in_file = size - absolute;
            let chunk = (buf.len() - copied)
                .min(remaining_in_cluster as usize)
                .min(remaining_in_file as usize);

            let n = self.read_cluster(cluster, cluster_off, &mut buf[copied..copied + chunk])?;
            copied += n;
            absolute += n as u32;
            cluster_off += n as u32;
            if n < chunk {
                break;
            }

            if cluster_off == bytes_per_cluster {
                cluster_off = 0;
                let next = self.fat_entry(cluster)?;
                if next >= FAT_EOC {
                    break;
                }
                cluster = next;
            }
        }

        Ok(copied)
    }

    /// Writes `buf` at `offset`, extending the cluster chain as needed and never creating
    /// sparse holes (writing past the current size requires `offset <= size`). Updates the
    /// handle's in-memory size if the write extends it; the caller must still `close` (or
    /// `change_attributes`) to persist the new size.
    pub fn write(&mut self, file: &mut File, buf: &[u8], offset: u32) -> Result<usize> {
        let size = file.short.file_size.get();
        if offset > size {
            return Ok(0);
        }

        let bytes_per_cluster = self.bytes_per_cluster();
        let mut head = file.first_cluster();
        if head == 0 {
            head = self.allocate(0)?.ok_or(Error::MemoryTableFail)?;
            self.zero_cluster(head)?;
            file.short.set_first_cluster(head);
        }

        let max_len = (MAX_FILE_SIZE - offset) as usize;
        let to_write = buf.len().min(max_len);

        let mut cluster = self.walk_chain_extending(head, offset / bytes_per_cluster)?;
        let mut cluster_off = offset % bytes_per_cluster;
        let mut absolute = offset;
        let mut written = 0usize;

        while written < to_write {
            let remaining_in_cluster = bytes_per_cluster - cluster_off;
            let chunk = (to_write - written).min(remaining_in_cluster as usize);

            let n = self.write_cluster(cluster, cluster_off, &buf[written..written + chunk])?;
            written += n;
            absolute += n as u32;
            cluster_off += n as u32;
            if n < chunk {
                break;
            }

            if cluster_off == bytes_per_cluster && written < to_write {
                cluster_off = 0;
                let next = self.fat_entry(cluster)?;
                cluster = if next >= FAT_EOC {
                    match self.allocate(cluster)? {
                        Some(new_cluster) => {
                            self.zero_cluster(new_cluster)?;
                            new_cluster
                        }
                        None => break,
                    }
                } else {
                    next
                };
            }
        }

        if absolute > size {
            file.short.file_size = U32::new(absolute);
        }

        Ok(written)
    }

    /// Changes `file`'s attributes, timestamp, and/or name, then re-emits its Short entry (and
    /// Long-entry checksums, via a full rewrite) to disk. A rename that collides with an
    /// existing name returns `Error::InvalidParameter`; toggling `ATTR_DIRECTORY` does too.
    pub fn change_attributes(
        &mut self,
        file: &mut File,
        flags: u8,
        time: Option<FileTime>,
        name: Option<&str>,
    ) -> Result<()> {
        if file.is_root() {
            return Err(Error::InvalidParameter);
        }
        if (flags & ATTR_DIRECTORY) != (file.short.attr & ATTR_DIRECTORY) {
            return Err(Error::InvalidParameter);
        }

        file.short.attr = flags;
        if let Some(time) = time {
            time.validate()?;
            file.short.wrt_date = U16::new(time.pack_date());
            file.short.wrt_time = U16::new(time.pack_time());
            file.short.lst_acc_date = U16::new(time.pack_date());
        }

        if let Some(new_name) = name {
            if let Ok(existing) = self.dir_search(file.parent_first_cluster, new_name) {
                if existing.offset != file.dir_offset {
                    return Err(Error::InvalidParameter);
                }
            }
            self.free_entry_slots(file.parent_first_cluster, file.dir_offset)?;
            let found = self.write_long_and_short(file.parent_first_cluster, new_name, file.short)?;
            file.short = found.short;
            file.name_len = found.name_len;
            file.dir_offset = found.offset;
        } else {
            self.write_short_at(file.parent_first_cluster, file.dir_offset, file.short)?;
        }

        Ok(())
    }

    /// Flushes `file`'s Short entry back to its stored directory offset. Does not flush the
    /// sector cache itself; call [`Self::eject`] for that. Takes the handle by value so a
    /// caller cannot accidentally keep using a closed handle.
    pub fn close(&mut self, file: File) -> Result<()> {
        if file.is_root() {
            return Ok(());
        }
        self.write_short_at(file.parent_first_cluster, file.dir_offset, file.short)
    }

    /// Copies `buf` in from cluster `cluster` starting at `cluster_offset`, looping across
    /// as many of the cluster's sectors as `buf` spans. Returns early (with fewer bytes than
    /// `buf.len()`) only on a short read from the cache itself.
    fn read_cluster(&mut self, cluster: u32, cluster_offset: u32, buf: &mut [u8]) -> Result<usize> {
        let sector_size = fat32_device::SECTOR_SIZE as u32;
        let first_sector = self.sector_of(cluster)? + cluster_offset / sector_size;
        let mut sector_offset = (cluster_offset % sector_size) as u16;
        let mut sector = first_sector;
        let mut copied = 0usize;

        while copied < buf.len() {
            let remaining_in_sector = sector_size - sector_offset as u32;
            let chunk = (buf.len() - copied).min(remaining_in_sector as usize);
            let n = self
                .cache
                .read(&mut buf[copied..copied + chunk], sector, sector_offset, chunk as u16)?;
            copied += n as usize;
            if (n as usize) < chunk {
                break;
            }
            sector += 1;
            sector_offset = 0;
        }

        Ok(copied)
    }

    /// Copies `buf` out to cluster `cluster` starting at `cluster_offset`, looping across as
    /// many of the cluster's sectors as `buf` spans. Returns early (with fewer bytes than
    /// `buf.len()`) only on a short write from the cache itself.
    fn write_cluster(&mut self, cluster: u32, cluster_offset: u32, buf: &[u8]) -> Result<usize> {
        let sector_size = fat32_device::SECTOR_SIZE as u32;
        let first_sector = self.sector_of(cluster)? + cluster_offset / sector_size;
        let mut sector_offset = (cluster_offset % sector_size) as u16;
        let mut sector = first_sector;
        let mut written = 0usize;

        while written < buf.len() {
            let remaining_in_sector = sector_size - sector_offset as u32;
            let chunk = (buf.len() - written).min(remaining_in_sector as usize);
            let n = self
                .cache
                .write(&buf[written..written + chunk], sector, sector_offset, chunk as u16)?;
            written += n as usize;
            if (n as usize) < chunk {
                break;
            }
            sector += 1;
            sector_offset = 0;
        }

        Ok(written)
    }

    fn write_short_at(&mut self, dir_first_cluster: u32, offset: u32, short: ShortDirEntry) -> Result<()> {
        self.dir_write_slot(dir_first_cluster, offset, short.as_bytes())
    }
}

fn blank_short_entry(attr: u8) -> ShortDirEntry {
    ShortDirEntry {
        name: [b' '; 11],
        attr,
        nt_res: 0,
        crt_time_tenth: 0,
        crt_time: U16::new(0),
        crt_date: U16::new(0),
        lst_acc_date: U16::new(0),
        fst_clus_hi: U16::new(0),
        wrt_time: U16::new(0),
        wrt_date: U16::new(0),
        fst_clus_lo: U16::new(0),
        file_size: U32::new(0),
    }
}
