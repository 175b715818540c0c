// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FAT32 file system core: mount/format a partition, walk FAT chains, scan and mutate
//! directories, and read/write file data — all against a [`BlockDevice`] through a
//! [`fat32_cache::Cache`]. There is no process-wide global state: a [`FileSystem`] is an
//! owned handle returned by [`FileSystem::mount`], and "double mount" is simply calling it
//! twice on the same device rather than a flag the core has to check.

mod dir;
mod fat_table;
mod file;
mod layout;
mod time;

pub use fat32_err::{Error, Result};
pub use file::File;
pub use time::FileTime;

use fat32_cache::Cache;
use fat32_device::{BlockDevice, SECTOR_SIZE};
use log::{debug, warn};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use layout::{
    BootSector, FsInfo, Mbr, MbrPartition, FAT_EOC, MBR_FAT32_CHS, MBR_FAT32_LBA, MBR_SIGNATURE,
};

const MBR_LEN: usize = core::mem::size_of::<Mbr>();
const FS_INFO_LEN: usize = core::mem::size_of::<FsInfo>();

/// A mounted FAT32 volume on top of a [`BlockDevice`] `D`. Every operation in this crate is a
/// method on this handle; there is nothing to call before [`Self::mount`] returns one.
pub struct FileSystem<D: BlockDevice> {
    cache: Cache<D>,
    boot_sector: BootSector,
    /// Sector at which the mounted partition (and its boot sector) starts.
    starting_lba: u32,
    fs_info_sector: u32,
    max_cluster: u32,
    free_count: u32,
    next_free: u32,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Mounts `partition_index` of `device`, backing the sector cache with `cache_total_bytes`
    /// worth of frames. If `reformat` is set, the partition is formatted as a fresh FAT32
    /// volume first (its prior contents, and its OSType, are ignored); otherwise the partition
    /// must already carry a FAT32 OSType or this fails with `IncorrectFormat`.
    pub fn mount(mut device: D, cache_total_bytes: usize, partition_index: u8, reformat: bool) -> Result<Self> {
        device.init()?;
        let mut cache = Cache::init(device, cache_total_bytes)?;

        let mut mbr_buf = [0u8; SECTOR_SIZE as usize];
        cache.read(&mut mbr_buf, 0, 0, SECTOR_SIZE)?;
        let mut mbr = Mbr::read_from_bytes(&mbr_buf[..MBR_LEN]).map_err(|_| Error::InvalidDevice)?;
        if mbr.signature.get() != MBR_SIGNATURE {
            warn!("MBR signature mismatch");
            return Err(Error::InvalidDevice);
        }

        let mut partition = *mbr
            .partitions
            .get(partition_index as usize)
            .ok_or(Error::IncorrectFormat)?;
        if partition.is_empty() {
            return Err(Error::IncorrectFormat);
        }
        if !reformat && partition.os_type != MBR_FAT32_CHS && partition.os_type != MBR_FAT32_LBA {
            return Err(Error::IncorrectFormat);
        }

        if reformat {
            partition.os_type = MBR_FAT32_LBA;
            mbr.partitions[partition_index as usize] = partition;
            let mbr_bytes = mbr.as_bytes();
            let written = cache.write(mbr_bytes, 0, 0, mbr_bytes.len() as u16)?;
            if written as usize != mbr_bytes.len() {
                return Err(Error::WriteFail);
            }
        }

        let starting_lba = partition.starting_lba.get();
        cache.pin(starting_lba)?;

        let boot_sector = if reformat {
            build_boot_sector(&partition)
        } else {
            let mut buf = [0u8; SECTOR_SIZE as usize];
            cache.read(&mut buf, starting_lba, 0, SECTOR_SIZE)?;
            BootSector::read_from_bytes(&buf).map_err(|_| Error::InvalidDevice)?
        };

        let fs_info_sector = starting_lba + boot_sector.bpb_fs_info.get() as u32;
        let max_cluster = compute_max_cluster(&boot_sector);

        let mut fs = Self {
            cache,
            boot_sector,
            starting_lba,
            fs_info_sector,
            max_cluster,
            free_count: 0,
            next_free: 2,
        };

        if reformat {
            fs.format_volume()?;
        } else {
            fs.load_fs_info()?;
        }

        debug!("mounted partition {partition_index} at LBA {starting_lba}, {max_cluster} clusters");
        Ok(fs)
    }

    /// Flushes the FSInfo hints and the sector cache, then finalizes the underlying device.
    pub fn eject(mut self) -> Result<()> {
        self.save_fs_info()?;
        self.cache.flush()?;
        self.cache.eject()
    }

    fn format_volume(&mut self) -> Result<()> {
        let starting_lba = self.starting_lba;
        let bytes = self.boot_sector.as_bytes();
        let written = self.cache.write(bytes, starting_lba, 0, bytes.len() as u16)?;
        if written as usize != bytes.len() {
            return Err(Error::WriteFail);
        }

        let fat_first = self.fat_region_first_sector();
        let fat_size = self.boot_sector.bpb_fat_sz32.get();
        let num_fats = self.boot_sector.bpb_num_fats as u32;
        let zeros = [0u8; SECTOR_SIZE as usize];
        for fat in 0..num_fats {
            for sector in 0..fat_size {
                self.cache
                    .write(&zeros, fat_first + fat * fat_size + sector, 0, SECTOR_SIZE)?;
            }
        }

        let media = self.boot_sector.bpb_media as u32;
        self.fat_update_raw(0, 0x0FFF_FF00 | media)?;
        self.fat_update_raw(1, FAT_EOC)?;
        self.fat_update(2, FAT_EOC)?;
        self.zero_cluster(2)?;

        self.free_count = self.max_cluster.saturating_sub(2);
        self.next_free = 3;

        self.save_fs_info()
    }

    fn load_fs_info(&mut self) -> Result<()> {
        let fs_info_sector = self.fs_info_sector;
        let mut buf = [0u8; FS_INFO_LEN];
        self.cache.read(&mut buf, fs_info_sector, 0, buf.len() as u16)?;
        let info = FsInfo::read_from_bytes(&buf).map_err(|_| Error::Fail)?;
        self.free_count = info.free_count.get();
        self.next_free = info.next_free.get();
        Ok(())
    }

    fn save_fs_info(&mut self) -> Result<()> {
        let fs_info_sector = self.fs_info_sector;
        let info = FsInfo::formatted(self.free_count, self.next_free);
        let bytes = info.as_bytes();
        let written = self.cache.write(bytes, fs_info_sector, 0, bytes.len() as u16)?;
        if written as usize != bytes.len() {
            return Err(Error::WriteFail);
        }
        Ok(())
    }
}

fn compute_max_cluster(boot_sector: &BootSector) -> u32 {
    let reserved = boot_sector.bpb_rsvd_sec_cnt.get() as u32;
    let num_fats = boot_sector.bpb_num_fats as u32;
    let fat_size = boot_sector.bpb_fat_sz32.get();
    let total_sectors = boot_sector.bpb_tot_sec32.get();
    (total_sectors - num_fats * fat_size - reserved) / boot_sector.bpb_sec_per_clus as u32
}

/// Builds a fresh FAT32 Boot Sector for `partition`, per the field layout in §6. Grounded in
/// the original driver's `FSMount` reformat branch (its size-threshold choices for
/// sectors/cluster, sectors/track, and heads), adapted from FAT16's single-reserved-sector
/// layout to FAT32's FSInfo sector and backup boot sector.
fn build_boot_sector(partition: &MbrPartition) -> BootSector {
    let total_sectors = partition.size_in_lba.get();
    let size_mb = (total_sectors as u64 * SECTOR_SIZE as u64) / (1024 * 1024);

    let mut sec_per_clus: u32 = if size_mb < 9 {
        16
    } else if size_mb < 1025 {
        32
    } else {
        64
    };
    if sec_per_clus * SECTOR_SIZE as u32 > 0x8000 {
        sec_per_clus = 0x8000 / SECTOR_SIZE as u32;
    }

    let sec_per_trk: u32 = if size_mb < 3 {
        16
    } else if size_mb < 65 {
        32
    } else {
        64
    };
    let num_heads: u32 = if size_mb < 129 { 128 } else { 255 };

    let reserved_sec_cnt: u32 = 32;
    // Same entries-per-sector divisor the original uses for its FAT size estimate, which
    // already assumes a 4-byte entry and so carries over unchanged to FAT32.
    let fat_sz32 = 1 + (total_sectors / sec_per_clus) / (SECTOR_SIZE as u32 / 4);

    BootSector {
        bs_jmp_boot: [0xEB, 0x00, 0x90],
        bs_oem_name: *b"MSWIN4.1",
        bpb_bytes_per_sec: U16::new(SECTOR_SIZE),
        bpb_sec_per_clus: sec_per_clus as u8,
        bpb_rsvd_sec_cnt: U16::new(reserved_sec_cnt as u16),
        bpb_num_fats: 2,
        bpb_root_ent_cnt: U16::new(0),
        bpb_tot_sec16: U16::new(0),
        bpb_media: 0xF8,
        bpb_fat_sz16: U16::new(0),
        bpb_sec_per_trk: U16::new(sec_per_trk as u16),
        bpb_num_heads: U16::new(num_heads as u16),
        bpb_hidd_sec: U32::new(partition.starting_lba.get()),
        bpb_tot_sec32: U32::new(total_sectors),
        bpb_fat_sz32: U32::new(fat_sz32),
        bpb_ext_flags: U16::new(0),
        bpb_fs_ver: U16::new(0),
        bpb_root_clus: U32::new(2),
        bpb_fs_info: U16::new(1),
        bpb_bk_boot_sec: U16::new(6),
        bpb_reserved: [0; 12],
        bs_drv_num: 0x80,
        bs_reserved1: 0,
        bs_boot_sig: 0x29,
        bs_vol_id: U32::new(0x1234_5678),
        bs_vol_lab: *b"FAT32 PART ",
        bs_fil_sys_type: *b"FAT32   ",
        filler: [0; 420],
        signature_word: [0x55, 0xAA],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryDevice {
        sectors: Vec<[u8; SECTOR_SIZE as usize]>,
    }

    impl MemoryDevice {
        fn new(sector_count: usize) -> Self {
            Self {
                sectors: vec![[0u8; SECTOR_SIZE as usize]; sector_count],
            }
        }

        fn with_partition(sector_count: usize, os_type: u8) -> Self {
            let mut device = Self::new(sector_count);
            device.sectors[0] = build_mbr_sector(1, sector_count as u32 - 1, os_type);
            device
        }
    }

    impl BlockDevice for MemoryDevice {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn eject(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_block(&self, buf: &mut [u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
            let sector = &self.sectors[sector as usize];
            let offset = offset as usize;
            let len = len as usize;
            buf[..len].copy_from_slice(&sector[offset..offset + len]);
            Ok(len as u16)
        }

        fn write_block(&self, _buf: &[u8], sector: u32, _offset: u16, _len: u16) -> Result<u16> {
            if sector as usize >= self.sectors.len() {
                return Err(Error::WriteFail);
            }
            Ok(0)
        }
    }

    // write_block above is read-only on purpose for the signature-rejection test; formatting
    // tests need real writes plus the ability to remount the same backing storage, so they
    // get their own `Rc`-shared device below.
    #[derive(Clone)]
    struct WritableMemoryDevice {
        sectors: std::rc::Rc<std::cell::RefCell<Vec<[u8; SECTOR_SIZE as usize]>>>,
    }

    impl WritableMemoryDevice {
        fn new(sector_count: usize) -> Self {
            Self {
                sectors: std::rc::Rc::new(std::cell::RefCell::new(vec![[0u8; SECTOR_SIZE as usize]; sector_count])),
            }
        }

        fn seed_mbr(&self, starting_lba: u32, size_in_lba: u32, os_type: u8) {
            self.sectors.borrow_mut()[0] = build_mbr_sector(starting_lba, size_in_lba, os_type);
        }
    }

    fn zero_partition() -> MbrPartition {
        MbrPartition {
            boot_indicator: 0,
            chs_start: [0; 3],
            os_type: 0,
            chs_end: [0; 3],
            starting_lba: U32::new(0),
            size_in_lba: U32::new(0),
        }
    }

    fn build_mbr_sector(starting_lba: u32, size_in_lba: u32, os_type: u8) -> [u8; SECTOR_SIZE as usize] {
        let partition = MbrPartition {
            boot_indicator: 0,
            chs_start: [0; 3],
            os_type,
            chs_end: [0; 3],
            starting_lba: U32::new(starting_lba),
            size_in_lba: U32::new(size_in_lba),
        };
        let mbr = Mbr {
            boot_code: [0; 424],
            disk_signature: U32::new(0),
            reserved: U16::new(0),
            partitions: [partition, zero_partition(), zero_partition(), zero_partition()],
            signature: U16::new(MBR_SIGNATURE),
        };
        let mut sector = [0u8; SECTOR_SIZE as usize];
        sector[..MBR_LEN].copy_from_slice(mbr.as_bytes());
        sector
    }

    impl BlockDevice for WritableMemoryDevice {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn eject(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_block(&self, buf: &mut [u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
            let sectors = self.sectors.borrow();
            let sector = &sectors[sector as usize];
            let offset = offset as usize;
            let len = len as usize;
            buf[..len].copy_from_slice(&sector[offset..offset + len]);
            Ok(len as u16)
        }

        fn write_block(&self, buf: &[u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
            let mut sectors = self.sectors.borrow_mut();
            let sector = &mut sectors[sector as usize];
            let offset = offset as usize;
            let len = len as usize;
            sector[offset..offset + len].copy_from_slice(&buf[..len]);
            Ok(len as u16)
        }
    }

    #[test]
    fn mount_rejects_bad_mbr_signature() {
        let device = MemoryDevice::new(64);
        let result = FileSystem::mount(device, SECTOR_SIZE as usize * 8, 0, false);
        assert_eq!(result.err(), Some(Error::InvalidDevice));
    }

    #[test]
    fn mount_rejects_non_fat32_partition_without_reformat() {
        let device = MemoryDevice::with_partition(2048, 0x07);
        let result = FileSystem::mount(device, SECTOR_SIZE as usize * 8, 0, false);
        assert_eq!(result.err(), Some(Error::IncorrectFormat));
    }

    #[test]
    fn reformat_then_remount_recovers_fs_info_and_root() {
        let sector_count = 20_000u32;
        let device = WritableMemoryDevice::new(sector_count as usize);
        device.seed_mbr(1, sector_count - 1, 0);

        let remount_handle = device.clone();
        let fs = FileSystem::mount(device, SECTOR_SIZE as usize * 16, 0, true).unwrap();
        assert!(fs.max_cluster > 2);
        let formatted_free_count = fs.free_count;
        assert_eq!(formatted_free_count, fs.max_cluster - 2);
        let root = fs.root();
        assert!(root.is_directory());
        fs.eject().unwrap();

        let fs = FileSystem::mount(remount_handle, SECTOR_SIZE as usize * 16, 0, false).unwrap();
        assert_eq!(fs.free_count, formatted_free_count);
        assert_eq!(fs.next_free, 3);
    }
}
