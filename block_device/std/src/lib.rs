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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fat32_device::{BlockDevice, Error, Result, SECTOR_SIZE};
use log::error;

/// A [`BlockDevice`] backed by a regular file, standing in for the SPI/SD hardware this core
/// otherwise targets. Used by host tooling and by the crate's own integration tests, never by
/// the normative core itself.
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    /// Opens (without creating) the image file at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                error!("failed to open block device image: {err}");
                Error::HardwareFail
            })?;
        Ok(Self { file })
    }

    /// Creates a new image file of exactly `len_bytes`, zero-filled, at `path`.
    pub fn create(path: impl AsRef<Path>, len_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| {
                error!("failed to create block device image: {err}");
                Error::HardwareFail
            })?;
        file.set_len(len_bytes).map_err(|err| {
            error!("failed to size block device image: {err}");
            Error::HardwareFail
        })?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileBlockDevice {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn eject(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|err| {
            error!("failed to sync block device image: {err}");
            Error::HardwareFail
        })
    }

    fn read_block(&self, buf: &mut [u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
        let len = clamp(offset, len);
        let absolute = sector as u64 * SECTOR_SIZE as u64 + offset as u64;
        self.file
            .read_exact_at(&mut buf[..len as usize], absolute)
            .map_err(|err| {
                error!("block device read at sector {sector} failed: {err}");
                Error::ReadFail
            })?;
        Ok(len)
    }

    fn write_block(&self, buf: &[u8], sector: u32, offset: u16, len: u16) -> Result<u16> {
        let len = clamp(offset, len);
        let absolute = sector as u64 * SECTOR_SIZE as u64 + offset as u64;
        self.file
            .write_all_at(&buf[..len as usize], absolute)
            .map_err(|err| {
                error!("block device write at sector {sector} failed: {err}");
                Error::WriteFail
            })?;
        Ok(len)
    }
}

fn clamp(offset: u16, len: u16) -> u16 {
    if offset >= SECTOR_SIZE {
        0
    } else {
        len.min(SECTOR_SIZE - offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let path = std::env::temp_dir().join(format!("fat32_device_std_test_{}", std::process::id()));
        let mut device = FileBlockDevice::create(&path, SECTOR_SIZE as u64 * 4).unwrap();
        device.init().unwrap();

        let payload = [0xAAu8; 16];
        let written = device.write_block(&payload, 2, 100, 16).unwrap();
        assert_eq!(written, 16);

        let mut out = [0u8; 16];
        let read = device.read_block(&mut out, 2, 100, 16).unwrap();
        assert_eq!(read, 16);
        assert_eq!(out, payload);

        device.eject().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn clamps_at_sector_boundary() {
        let path = std::env::temp_dir().join(format!("fat32_device_std_test_clamp_{}", std::process::id()));
        let device = FileBlockDevice::create(&path, SECTOR_SIZE as u64).unwrap();

        let payload = [0x11u8; 32];
        let written = device
            .write_block(&payload, 0, SECTOR_SIZE - 8, 32)
            .unwrap();
        assert_eq!(written, 8);

        std::fs::remove_file(&path).unwrap();
    }
}
