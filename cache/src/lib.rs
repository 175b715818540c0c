//! Fixed-size, set-unassociated cache of 512-byte sector frames sitting between the FAT file
//! system and a [`BlockDevice`]. Implements clock (second-chance) replacement, pinning of
//! "permanent" frames such as the volume's boot sector, and byte-granular read/write into
//! whichever frame currently holds a sector.
//!
//! Grounded in the original driver's `MemoryTable.c`, reworked from a pair of process-wide
//! arrays with a packed 64-bit status word per sector into an owned `Cache<D>` whose frames
//! carry their flags as plain `bool` fields.

use fat32_device::{BlockDevice, Error, Result, SECTOR_SIZE};
use log::{debug, warn};

struct Frame {
    sector: u32,
    allocated: bool,
    dirty: bool,
    clock_ref: bool,
    pinned: bool,
    data: [u8; SECTOR_SIZE as usize],
}

impl Frame {
    fn unallocated() -> Self {
        Self {
            sector: 0,
            allocated: false,
            dirty: false,
            clock_ref: true,
            pinned: false,
            data: [0; SECTOR_SIZE as usize],
        }
    }
}

/// Owns every frame's storage and the clock hand. Created at mount, destroyed at eject.
pub struct Cache<D: BlockDevice> {
    device: D,
    frames: Box<[Frame]>,
    hand: usize,
}

impl<D: BlockDevice> Cache<D> {
    /// Partitions `total_bytes` into `SECTOR_SIZE`-sized frames, all unallocated.
    pub fn init(device: D, total_bytes: usize) -> Result<Self> {
        if total_bytes < SECTOR_SIZE as usize {
            warn!("cache of {total_bytes} bytes cannot hold a single sector");
            return Err(Error::MemoryTableFail);
        }

        let frame_count = total_bytes / SECTOR_SIZE as usize;
        let frames = (0..frame_count).map(|_| Frame::unallocated()).collect();
        debug!("cache initialized with {frame_count} frames");

        Ok(Self {
            device,
            frames,
            hand: 0,
        })
    }

    /// Number of frames the cache holds.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Writes back every dirty frame, in frame order. Fails on the first device error.
    pub fn flush(&mut self) -> Result<()> {
        for frame in self.frames.iter_mut() {
            if frame.allocated && frame.dirty {
                write_back(&mut self.device, frame)?;
            }
        }
        Ok(())
    }

    /// Ensures `sector` is resident and pinned, and marks it dirty (the caller is expected to
    /// mutate it through [`Cache::read`]/[`Cache::write`] afterwards). Pinned frames are never
    /// chosen as eviction victims until [`Cache::unpin`] is called.
    pub fn pin(&mut self, sector: u32) -> Result<()> {
        let index = self.load(sector)?;
        self.frames[index].pinned = true;
        self.frames[index].dirty = true;
        Ok(())
    }

    /// Clears the pinned flag for `sector` if it is resident; a no-op otherwise.
    pub fn unpin(&mut self, sector: u32) {
        if let Some(frame) = self
            .frames
            .iter_mut()
            .find(|frame| frame.allocated && frame.sector == sector)
        {
            frame.pinned = false;
        }
    }

    /// Copies up to `len` bytes from `sector` starting at `offset` into `buf`. Clamped to the
    /// sector boundary; returns the number of bytes actually copied.
    pub fn read(&mut self, buf: &mut [u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
        if offset >= SECTOR_SIZE {
            return Ok(0);
        }
        let len = len.min(SECTOR_SIZE - offset);
        let index = self.load(sector)?;
        let offset = offset as usize;
        let len = len as usize;
        buf[..len].copy_from_slice(&self.frames[index].data[offset..offset + len]);
        Ok(len as u16)
    }

    /// Copies up to `len` bytes from `buf` into `sector` starting at `offset`, marking the
    /// frame dirty. Clamped to the sector boundary; returns the number of bytes actually
    /// copied.
    pub fn write(&mut self, buf: &[u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
        if offset >= SECTOR_SIZE {
            return Ok(0);
        }
        let len = len.min(SECTOR_SIZE - offset);
        let index = self.load(sector)?;
        let offset = offset as usize;
        let len = len as usize;
        self.frames[index].data[offset..offset + len].copy_from_slice(&buf[..len]);
        self.frames[index].dirty = true;
        Ok(len as u16)
    }

    /// Finalizes hardware use. The cache must already be flushed; this only forwards to the
    /// underlying device.
    pub fn eject(&mut self) -> Result<()> {
        self.device.eject()
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Returns the resident frame index for `sector`, loading (and possibly evicting) one if
    /// necessary via clock replacement.
    fn load(&mut self, sector: u32) -> Result<usize> {
        if let Some(index) = self
            .frames
            .iter()
            .position(|frame| frame.allocated && frame.sector == sector)
        {
            self.frames[index].clock_ref = false;
            return Ok(index);
        }

        let frame_count = self.frames.len();
        for _ in 0..2 * frame_count {
            let index = self.hand;
            self.hand = (self.hand + 1) % frame_count;

            let frame = &mut self.frames[index];
            if frame.pinned {
                continue;
            }
            if frame.clock_ref {
                frame.clock_ref = false;
                continue;
            }

            if frame.allocated && frame.dirty {
                write_back(&mut self.device, frame)?;
            }

            let read = self
                .device
                .read_block(&mut frame.data, sector, 0, SECTOR_SIZE)
                .map_err(|_| Error::MemoryTableFail)?;
            if read != SECTOR_SIZE {
                return Err(Error::ReadFail);
            }

            frame.sector = sector;
            frame.allocated = true;
            frame.dirty = false;
            frame.clock_ref = true;
            self.hand = index;
            return Ok(index);
        }

        warn!("cache exhausted: every frame is pinned");
        Err(Error::MemoryTableFail)
    }
}

fn write_back<D: BlockDevice>(device: &mut D, frame: &mut Frame) -> Result<()> {
    let written = device
        .write_block(&frame.data, frame.sector, 0, SECTOR_SIZE)
        .map_err(|_| Error::MemoryTableFail)?;
    if written != SECTOR_SIZE {
        return Err(Error::MemoryTableFail);
    }
    frame.dirty = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct MemoryDevice {
        sectors: RefCell<Vec<[u8; SECTOR_SIZE as usize]>>,
    }

    impl MemoryDevice {
        fn new(sector_count: usize) -> Self {
            Self {
                sectors: RefCell::new(vec![[0u8; SECTOR_SIZE as usize]; sector_count]),
            }
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
    fn read_after_write_and_flush_round_trips() {
        let mut cache = Cache::init(MemoryDevice::new(4), SECTOR_SIZE as usize * 2).unwrap();
        cache.write(&[0xAB; 10], 1, 5, 10).unwrap();
        cache.flush().unwrap();

        let mut out = [0u8; 10];
        cache.read(&mut out, 1, 5, 10).unwrap();
        assert_eq!(out, [0xAB; 10]);
    }

    #[test]
    fn every_frame_is_evicted_under_sequential_pressure_and_pinned_frames_survive() {
        let frame_count = 4;
        let mut cache =
            Cache::init(MemoryDevice::new(16), SECTOR_SIZE as usize * frame_count).unwrap();

        cache.pin(0).unwrap();

        // The first frame_count - 1 sectors fill every unpinned frame once; loading
        // frame_count - 1 more distinct sectors afterward can only succeed if each of those
        // frames is evicted at least once rather than one frame being reused forever.
        for sector in 1..(2 * frame_count as u32 - 1) {
            let mut buf = [0u8; 1];
            cache.read(&mut buf, sector, 0, 1).unwrap();
        }

        assert!(cache
            .frames
            .iter()
            .any(|frame| frame.allocated && frame.sector == 0 && frame.pinned));

        for original_sector in 1..frame_count as u32 {
            assert!(
                !cache
                    .frames
                    .iter()
                    .any(|frame| frame.allocated && frame.sector == original_sector),
                "sector {original_sector} was never evicted from its original frame"
            );
        }
    }

    #[test]
    fn cache_exhaustion_via_pinning_then_recovery() {
        let frame_count = 3;
        let mut cache =
            Cache::init(MemoryDevice::new(8), SECTOR_SIZE as usize * frame_count).unwrap();

        for sector in 0..frame_count as u32 {
            cache.pin(sector).unwrap();
        }

        let mut buf = [0u8; 1];
        assert_eq!(
            cache.read(&mut buf, frame_count as u32, 0, 1),
            Err(Error::MemoryTableFail)
        );

        cache.unpin(0);
        assert!(cache.read(&mut buf, frame_count as u32, 0, 1).is_ok());
    }

    #[test]
    fn offset_past_sector_end_reads_zero_bytes() {
        let mut cache = Cache::init(MemoryDevice::new(2), SECTOR_SIZE as usize).unwrap();
        let mut buf = [0u8; 4];
        let copied = cache.read(&mut buf, 0, SECTOR_SIZE, 4).unwrap();
        assert_eq!(copied, 0);
    }
}
