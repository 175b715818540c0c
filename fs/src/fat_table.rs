//! FAT chain arithmetic: reading/updating entries across every FAT copy, cluster-to-sector
//! translation, and allocation/freeing of cluster chains.

use fat32_device::BlockDevice;
use fat32_err::{Error, Result};

use crate::layout::{FAT_DEFECTIVE, FAT_EOC, FAT_FREE, FAT_MASK};
use crate::FileSystem;

impl<D: BlockDevice> FileSystem<D> {
    /// Reads FAT entry `cluster` from the first FAT copy, masked to 28 bits.
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> Result<u32> {
        if !(2..=self.max_cluster).contains(&cluster) {
            return Err(Error::InvalidParameter);
        }
        let (sector, offset) = self.fat_entry_location(cluster, 0);
        let mut buf = [0u8; 4];
        self.cache.read(&mut buf, sector, offset, 4)?;
        Ok(u32::from_le_bytes(buf) & FAT_MASK)
    }

    /// Writes `value` into every FAT copy for `cluster`, preserving each entry's reserved top
    /// 4 bits as observed on the first FAT copy.
    pub(crate) fn fat_update(&mut self, cluster: u32, value: u32) -> Result<()> {
        if !(2..=self.max_cluster).contains(&cluster) {
            return Err(Error::InvalidParameter);
        }

        let (first_sector, offset) = self.fat_entry_location(cluster, 0);
        let mut existing = [0u8; 4];
        self.cache.read(&mut existing, first_sector, offset, 4)?;
        let reserved_bits = u32::from_le_bytes(existing) & !FAT_MASK;
        let entry = (value & FAT_MASK) | reserved_bits;
        let bytes = entry.to_le_bytes();

        for fat_index in 0..self.boot_sector.bpb_num_fats as u32 {
            let (sector, offset) = self.fat_entry_location(cluster, fat_index);
            let written = self.cache.write(&bytes, sector, offset, 4)?;
            if written != 4 {
                return Err(Error::WriteFail);
            }
        }
        Ok(())
    }

    /// Writes `value` verbatim (no masking, no reserved-bit preservation) into every FAT
    /// copy's entry `index`. Used only to seed the reserved FAT[0]/FAT[1] entries during
    /// formatting, which sit outside the `2..=max_cluster` range `fat_update` validates.
    pub(crate) fn fat_update_raw(&mut self, index: u32, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        for fat_index in 0..self.boot_sector.bpb_num_fats as u32 {
            let (sector, offset) = self.fat_entry_location(index, fat_index);
            let written = self.cache.write(&bytes, sector, offset, 4)?;
            if written != 4 {
                return Err(Error::WriteFail);
            }
        }
        Ok(())
    }

    fn fat_entry_location(&self, cluster: u32, fat_index: u32) -> (u32, u16) {
        let byte_index = cluster as u64 * 4;
        let sector_in_fat = (byte_index / SECTOR_SIZE_U64) as u32;
        let offset = (byte_index % SECTOR_SIZE_U64) as u16;
        let fat_start = self.fat_region_first_sector() + fat_index * self.boot_sector.bpb_fat_sz32.get();
        (fat_start + sector_in_fat, offset)
    }

    /// First sector of the FAT region (immediately after the reserved sectors).
    pub(crate) fn fat_region_first_sector(&self) -> u32 {
        self.starting_lba + self.boot_sector.bpb_rsvd_sec_cnt.get() as u32
    }

    /// First sector of the data region (cluster 2's home), immediately after all FAT copies.
    pub(crate) fn data_region_first_sector(&self) -> u32 {
        self.fat_region_first_sector()
            + self.boot_sector.bpb_num_fats as u32 * self.boot_sector.bpb_fat_sz32.get()
    }

    /// First sector belonging to `cluster`. Deliberately includes the data-region base, unlike
    /// the flagged source bug this core does not reproduce.
    pub(crate) fn sector_of(&self, cluster: u32) -> Result<u32> {
        if !(2..=self.max_cluster).contains(&cluster) {
            return Err(Error::InvalidParameter);
        }
        Ok(self.data_region_first_sector() + (cluster - 2) * self.boot_sector.bpb_sec_per_clus as u32)
    }

    pub(crate) fn bytes_per_cluster(&self) -> u32 {
        fat32_device::SECTOR_SIZE as u32 * self.boot_sector.bpb_sec_per_clus as u32
    }

    /// Allocates a free cluster, optionally linking it after `from`. Returns `Ok(None)` when
    /// `from` is non-zero but not at EOC, or the volume has no free clusters left; these are not
    /// device errors.
    pub(crate) fn allocate(&mut self, from: u32) -> Result<Option<u32>> {
        if from != 0 {
            let entry = self.fat_entry(from)?;
            if entry < FAT_EOC {
                return Ok(None);
            }
        }
        if self.free_count == 0 {
            return Ok(None);
        }

        let allocated = self.next_free;
        if from != 0 {
            self.fat_update(from, allocated)?;
        }
        self.fat_update(allocated, FAT_EOC)?;
        self.free_count -= 1;

        let mut candidate = allocated + 1;
        loop {
            if candidate > self.max_cluster {
                candidate = 2;
            }
            if candidate == allocated {
                // Wrapped all the way around; free_count said there was room, so this
                // shouldn't happen, but avoid spinning forever on inconsistent metadata.
                break;
            }
            if self.fat_entry(candidate)? == FAT_FREE {
                break;
            }
            candidate += 1;
        }
        self.next_free = candidate;

        Ok(Some(allocated))
    }

    /// Frees every cluster in the chain starting at `head`, incrementing the free-cluster
    /// count as it goes.
    pub(crate) fn free_chain(&mut self, head: u32) -> Result<()> {
        let mut cluster = head;
        loop {
            let next = self.fat_entry(cluster)?;
            self.fat_update(cluster, FAT_FREE)?;
            self.free_count += 1;
            if next >= FAT_EOC || next == FAT_DEFECTIVE || next == FAT_FREE {
                break;
            }
            cluster = next;
        }
        Ok(())
    }

    /// Walks `steps` next-cluster links from `head`. Returns `Ok(None)` if the chain ends (hits
    /// EOC/free/defective) before `steps` is exhausted.
    pub(crate) fn walk_chain(&mut self, head: u32, steps: u32) -> Result<Option<u32>> {
        let mut cluster = head;
        for _ in 0..steps {
            let entry = self.fat_entry(cluster)?;
            if entry >= FAT_EOC || entry == FAT_DEFECTIVE || entry == FAT_FREE {
                return Ok(None);
            }
            cluster = entry;
        }
        Ok(Some(cluster))
    }

    /// Like [`Self::walk_chain`], but allocates and zeroes new clusters instead of stopping at
    /// chain end. Used by directory growth when writing past the last allocated slot.
    pub(crate) fn walk_chain_extending(&mut self, head: u32, steps: u32) -> Result<u32> {
        let mut cluster = head;
        for _ in 0..steps {
            let entry = self.fat_entry(cluster)?;
            cluster = if entry >= FAT_EOC || entry == FAT_DEFECTIVE || entry == FAT_FREE {
                let new_cluster = self.allocate(cluster)?.ok_or(Error::MemoryTableFail)?;
                self.zero_cluster(new_cluster)?;
                new_cluster
            } else {
                entry
            };
        }
        Ok(cluster)
    }

    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<()> {
        let zeros = [0u8; fat32_device::SECTOR_SIZE as usize];
        let first_sector = self.sector_of(cluster)?;
        for sector in 0..self.boot_sector.bpb_sec_per_clus as u32 {
            self.cache
                .write(&zeros, first_sector + sector, 0, fat32_device::SECTOR_SIZE)?;
        }
        Ok(())
    }
}

const SECTOR_SIZE_U64: u64 = fat32_device::SECTOR_SIZE as u64;
