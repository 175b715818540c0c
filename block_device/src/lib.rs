//! Capability consumed by [`fat32_cache`](https://docs.rs/fat32_cache) to move bytes to and
//! from physical storage. Everything above this trait — the sector cache, the FAT file
//! system — talks only to a `BlockDevice`; hardware specifics (SPI timing, chip-select,
//! retries) live entirely on the implementor's side.

pub use fat32_err::{Error, Result};

/// Bytes per sector. Fixed by the hardware this core targets; every offset/len passed to
/// [`BlockDevice::read_block`]/[`BlockDevice::write_block`] is relative to a single sector
/// and must stay within it.
pub const SECTOR_SIZE: u16 = 512;

/// A synchronous, fallible, sector-addressed storage device.
///
/// Implementors must never read or write past the sector boundary named by `sector`: a
/// `read_block`/`write_block` call with `offset + len > SECTOR_SIZE` is a logic error in the
/// caller (the cache never issues one), but implementations should clamp rather than panic
/// if it does happen.
pub trait BlockDevice {
    /// Prepares the underlying hardware for use. Called once, before any sector I/O.
    fn init(&mut self) -> Result<()>;

    /// Finalizes hardware use. Called once, after the cache has flushed all dirty sectors.
    fn eject(&mut self) -> Result<()>;

    /// Reads up to `len` bytes starting at `offset` within `sector` into `buf`. Returns the
    /// number of bytes actually read.
    fn read_block(&self, buf: &mut [u8], sector: u32, offset: u16, len: u16) -> Result<u16>;

    /// Writes up to `len` bytes from `buf` starting at `offset` within `sector`. Returns the
    /// number of bytes actually written.
    fn write_block(&self, buf: &[u8], sector: u32, offset: u16, len: u16) -> Result<u16>;
}
