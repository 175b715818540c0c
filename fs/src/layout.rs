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

//! Bit-exact on-disk structures: Master Boot Record, FAT32 Boot Sector, FSInfo, and the two
//! directory entry shapes. Every struct here is `#[repr(C)]` and zerocopy-derived, the same
//! way the teacher's `fs/fat` models `BootSector`/`DirEntry`.

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const MBR_SIGNATURE: u16 = 0x55AA;
pub const MBR_FAT32_CHS: u8 = 0x0B;
pub const MBR_FAT32_LBA: u8 = 0x0C;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

pub const FREE_ENTRY: u8 = 0xE5;
pub const REST_FREE_ENTRY: u8 = 0x00;
pub const LAST_LONG_ENTRY: u8 = 0x40;

pub const FAT_FREE: u32 = 0x0000_0000;
pub const FAT_DEFECTIVE: u32 = 0x0FFF_FFF7;
pub const FAT_EOC: u32 = 0x0FFF_FFF8;
pub const FAT_MASK: u32 = 0x0FFF_FFFF;

pub const FSI_LEAD_SIG: u32 = 0x4161_5252;
pub const FSI_STR_SIG: u32 = 0x6141_7272;
pub const FSI_TRAIL_SIG: u32 = 0xAA55_0000;

pub const MAX_FILE_SIZE: u32 = 0xFFFF_FFFF;

/// A single entry in the Master Boot Record's partition table.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MbrPartition {
    pub boot_indicator: u8,
    pub chs_start: [u8; 3],
    pub os_type: u8,
    pub chs_end: [u8; 3],
    pub starting_lba: U32,
    pub size_in_lba: U32,
}

impl MbrPartition {
    pub fn is_empty(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}

/// Master Boot Record at LBA 0. The named fields total 496 of the sector's 512 bytes; the
/// remaining bytes are not part of any field this core reads or writes.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Mbr {
    pub boot_code: [u8; 424],
    pub disk_signature: U32,
    pub reserved: U16,
    pub partitions: [MbrPartition; 4],
    pub signature: U16,
}

/// FAT32 Boot Sector / BIOS Parameter Block, resident at the partition's first sector.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSector {
    pub bs_jmp_boot: [u8; 3],
    pub bs_oem_name: [u8; 8],
    pub bpb_bytes_per_sec: U16,
    pub bpb_sec_per_clus: u8,
    pub bpb_rsvd_sec_cnt: U16,
    pub bpb_num_fats: u8,
    pub bpb_root_ent_cnt: U16,
    pub bpb_tot_sec16: U16,
    pub bpb_media: u8,
    pub bpb_fat_sz16: U16,
    pub bpb_sec_per_trk: U16,
    pub bpb_num_heads: U16,
    pub bpb_hidd_sec: U32,
    pub bpb_tot_sec32: U32,
    pub bpb_fat_sz32: U32,
    pub bpb_ext_flags: U16,
    pub bpb_fs_ver: U16,
    pub bpb_root_clus: U32,
    pub bpb_fs_info: U16,
    pub bpb_bk_boot_sec: U16,
    pub bpb_reserved: [u8; 12],
    pub bs_drv_num: u8,
    pub bs_reserved1: u8,
    pub bs_boot_sig: u8,
    pub bs_vol_id: U32,
    pub bs_vol_lab: [u8; 11],
    pub bs_fil_sys_type: [u8; 8],
    pub filler: [u8; 420],
    pub signature_word: [u8; 2],
}

/// FSInfo sector, usually immediately after the Boot Sector, tracking the free-cluster count
/// and the next-free allocation hint across mounts.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsInfo {
    pub lead_signature: U32,
    pub reserved1: [u8; 480],
    pub struct_signature: U32,
    pub free_count: U32,
    pub next_free: U32,
    pub reserved2: [u8; 12],
    pub trail_signature: U32,
}

impl FsInfo {
    pub fn formatted(free_count: u32, next_free: u32) -> Self {
        Self {
            lead_signature: U32::new(FSI_LEAD_SIG),
            reserved1: [0; 480],
            struct_signature: U32::new(FSI_STR_SIG),
            free_count: U32::new(free_count),
            next_free: U32::new(next_free),
            reserved2: [0; 12],
            trail_signature: U32::new(FSI_TRAIL_SIG),
        }
    }
}

/// 8.3 short directory entry. Tagged alternative: `attr == 0x0F` means this slot is really a
/// [`LongDirEntry`]; a first name byte of `0x00` means "no further entries in this directory".
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ShortDirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_res: u8,
    pub crt_time_tenth: u8,
    pub crt_time: U16,
    pub crt_date: U16,
    pub lst_acc_date: U16,
    pub fst_clus_hi: U16,
    pub wrt_time: U16,
    pub wrt_date: U16,
    pub fst_clus_lo: U16,
    pub file_size: U32,
}

impl ShortDirEntry {
    pub fn first_cluster(&self) -> u32 {
        (self.fst_clus_hi.get() as u32) << 16 | (self.fst_clus_lo.get() as u32)
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi = U16::new((cluster >> 16) as u16);
        self.fst_clus_lo = U16::new(cluster as u16);
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == FREE_ENTRY
    }

    pub fn is_end_of_directory(&self) -> bool {
        self.name[0] == REST_FREE_ENTRY
    }

    pub fn is_long_name(&self) -> bool {
        self.attr == ATTR_LONG_NAME
    }
}

/// One 13-UCS2-character fragment of a long file name, chained in descending order ahead of
/// the [`ShortDirEntry`] it names.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LongDirEntry {
    pub ord: u8,
    pub name1: [U16; 5],
    pub attr: u8,
    pub entry_type: u8,
    pub checksum: u8,
    pub name2: [U16; 6],
    pub fst_clus_lo: U16,
    pub name3: [U16; 2],
}

impl LongDirEntry {
    pub fn chars(&self) -> impl Iterator<Item = u16> + '_ {
        self.name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter())
            .map(|c| c.get())
    }

    /// Builds a Long entry carrying `ord` (with `LAST_LONG_ENTRY` folded in by the caller when
    /// appropriate) and the 13 code units of `chunk`.
    pub fn new(ord: u8, chunk: &[u16; 13], checksum: u8) -> Self {
        Self {
            ord,
            name1: [
                U16::new(chunk[0]),
                U16::new(chunk[1]),
                U16::new(chunk[2]),
                U16::new(chunk[3]),
                U16::new(chunk[4]),
            ],
            attr: ATTR_LONG_NAME,
            entry_type: 0,
            checksum,
            name2: [
                U16::new(chunk[5]),
                U16::new(chunk[6]),
                U16::new(chunk[7]),
                U16::new(chunk[8]),
                U16::new(chunk[9]),
                U16::new(chunk[10]),
            ],
            fst_clus_lo: U16::new(0),
            name3: [U16::new(chunk[11]), U16::new(chunk[12])],
        }
    }
}

pub const DIR_ENTRY_SIZE: usize = core::mem::size_of::<ShortDirEntry>();

/// Rotate-right-8-then-add checksum of an 11-byte short name, replicated into every long
/// entry in that name's chain.
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in name.iter() {
        sum = sum.rotate_right(1).wrapping_add(byte);
    }
    sum
}
