/*
    zeST host
    https://github.com/dbalsom/zest-host

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    floppy.rs

    Floppy drive emulation, software part. Feeds 16-byte slices of the
    current MFM track to the fabric on positional interrupts and commits
    written-back slices with the pipeline latency the fabric exhibits.
*/

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use crate::{
    devwindow::{DeviceWindow, FloppyStatus},
    floppy_img::{FloppyImage, TRACK_BYTES},
};

/// The rotation is divided into this many 16-byte positional units.
const ROTATION_UNITS: u32 = 391;

/// The fabric reports positions one slice ahead of the slice it is writing,
/// so host write-back lands two read slices behind the current address. If
/// the HDL pipeline depth changes, this depth must track it.
const SLICE_FIFO_DEPTH: usize = 3;

pub const DEFAULT_SKEW: usize = 3;
pub const DEFAULT_INTERLEAVE: usize = 1;

/// Coordinates of one track slice previously handed to the fabric. Kept by
/// value so a drive change between the read and the deferred commit simply
/// drops the write instead of touching a replaced image.
#[derive(Copy, Clone, Debug)]
struct SliceRef {
    drive: usize,
    track: usize,
    side: usize,
    pos: usize,
    len: usize,
}

pub struct FloppyDrives {
    images: [Option<FloppyImage>; 2],
    names: [Option<PathBuf>; 2],
    write_protect: [bool; 2],
    fifo: [Option<SliceRef>; SLICE_FIFO_DEPTH],
    prev_addr: u32,
}

impl FloppyDrives {
    pub fn new(write_protect: [bool; 2]) -> FloppyDrives {
        FloppyDrives {
            images: [None, None],
            names: [None, None],
            write_protect,
            fifo: [None; SLICE_FIFO_DEPTH],
            prev_addr: 2000,
        }
    }

    /// Change or eject the floppy disk in a drive. Passing `None` ejects.
    /// The previous image is flushed before it is dropped. The caller holds
    /// the drive mutex, which serializes this against the interrupt handler.
    pub fn change_floppy(&mut self, path: Option<&Path>, drive: usize) {
        if self.names[drive].as_deref() == path {
            // same file, nothing to do
            return;
        }
        if let Some(img) = self.images[drive].take() {
            drop(img);
            self.names[drive] = None;
        }
        // slices staged from the old disk must not land on the new one
        for slot in self.fifo.iter_mut() {
            if slot.map(|s| s.drive) == Some(drive) {
                *slot = None;
            }
        }
        if let Some(path) = path {
            match FloppyImage::open(path, self.write_protect[drive], DEFAULT_SKEW, DEFAULT_INTERLEAVE) {
                Ok(img) => {
                    log::info!("drive {}: inserted `{}`", drive, path.display());
                    self.images[drive] = Some(img);
                    self.names[drive] = Some(path.to_path_buf());
                }
                Err(e) => {
                    log::error!("error opening floppy image file `{}`: {}", path.display(), e);
                }
            }
        }
    }

    pub fn image_name(&self, drive: usize) -> Option<&Path> {
        self.names[drive].as_deref()
    }

    /// Flush pending write-back on both drives.
    pub fn sync(&mut self) {
        for img in self.images.iter_mut().flatten() {
            if let Err(e) = img.sync() {
                log::error!("floppy sync failed: {}", e);
            }
        }
    }

    /// Service one positional floppy interrupt. Runs on the interrupt
    /// thread with the drive mutex held for the duration of the event.
    pub fn on_event(&mut self, win: &DeviceWindow, status: FloppyStatus) {
        let addr = status.addr() as u32;
        if addr == self.prev_addr {
            // repeated event for the same position
            return;
        }
        let expected = if self.prev_addr == ROTATION_UNITS - 1 { 0 } else { self.prev_addr + 1 };
        if self.prev_addr < ROTATION_UNITS && addr != expected {
            log::warn!("missed floppy addr, expected={} got={}", expected, addr);
        }
        self.prev_addr = addr;

        if !status.read() {
            return;
        }

        let drive = status.drive() as usize;
        let track = (status.track() >> 1) as usize;
        let side = (status.track() & 1) as usize;

        self.fifo[2] = self.fifo[1];
        self.fifo[1] = self.fifo[0];

        let mut pos = addr as usize * 16 + 16;
        if pos >= TRACK_BYTES {
            pos = 0;
        }
        // the final unit of the rotation is the 10-byte remainder
        let len = if pos < TRACK_BYTES - 10 { 16 } else { 10 };

        self.fifo[0] = match &self.images[drive] {
            Some(img) => {
                let trk = img.track(track, side);
                win.write_floppy_slice(&trk[pos..pos + len]);
                Some(SliceRef { drive, track, side, pos, len })
            }
            // no disk in the drive: leave the staging area alone
            None => None,
        };

        if status.write() {
            // the fabric wrote the slice it reported two reads ago
            if let Some(s) = self.fifo[2] {
                let data = win.read_floppy_slice(s.len);
                if let Some(img) = &mut self.images[s.drive] {
                    if !img.read_only() {
                        let trk = img.track_mut(s.track, s.side);
                        trk[s.pos..s.pos + s.len].copy_from_slice(&data[..s.len]);
                        img.mark_dirty();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floppy_img::SECTOR_BYTES;
    use std::{fs::File, io::Write};
    use tempfile::TempDir;

    fn status_word(read: bool, write: bool, addr: u32, track: u8, side: u8, drive: u8) -> FloppyStatus {
        let word: u32 = (read as u32) << 31
            | (write as u32) << 30
            | (addr & 0x1FF) << 21
            | ((track as u32) << 1 | side as u32) << 13
            | (drive as u32) << 12
            | 1;
        FloppyStatus::from(word)
    }

    fn write_st_image(dir: &TempDir, ntracks: usize) -> PathBuf {
        let path = dir.path().join("disk.st");
        let mut f = File::create(&path).unwrap();
        let mut boot = [0u8; SECTOR_BYTES];
        boot[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        boot[0x13..0x15].copy_from_slice(&((ntracks * 9) as u16).to_le_bytes());
        boot[0x18..0x1A].copy_from_slice(&9u16.to_le_bytes());
        boot[0x1A..0x1C].copy_from_slice(&1u16.to_le_bytes());
        f.write_all(&boot).unwrap();
        let sector = [0x33u8; SECTOR_BYTES];
        for _ in 1..ntracks * 9 {
            f.write_all(&sector).unwrap();
        }
        path
    }

    #[test]
    fn read_slices_track_into_staging() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 2);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 0, 1, 0, 0));
        let img = drives.images[0].as_ref().unwrap();
        let expect = &img.track(1, 0)[16..32];
        assert_eq!(&win.read_floppy_slice(16)[..], expect);
    }

    #[test]
    fn last_rotation_unit_is_ten_bytes() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 1);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 389, 0, 0, 0));
        let s = drives.fifo[0].unwrap();
        assert_eq!(s.pos, 6240);
        assert_eq!(s.len, 10);

        // address 390 wraps to the start of the track
        drives.on_event(&win, status_word(true, false, 390, 0, 0, 0));
        let s = drives.fifo[0].unwrap();
        assert_eq!(s.pos, 0);
        assert_eq!(s.len, 16);
    }

    #[test]
    fn write_commits_two_slices_late() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 1);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 10, 0, 0, 0));
        drives.on_event(&win, status_word(true, false, 11, 0, 0, 0));

        // the fabric now presents data it wrote for the slice read at
        // address 10 (track offset 176)
        let patch = [0xA5u8; 16];
        win.write_floppy_slice(&patch);
        drives.on_event(&win, status_word(true, true, 12, 0, 0, 0));

        let img = drives.images[0].as_ref().unwrap();
        assert_eq!(&img.track(0, 0)[176..192], &patch);
        // the slice for address 12 itself is untouched
        assert_ne!(&img.track(0, 0)[208..224], &patch);
    }

    #[test]
    fn write_protected_drive_drops_writes() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 1);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([true, false]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 10, 0, 0, 0));
        drives.on_event(&win, status_word(true, false, 11, 0, 0, 0));
        let before = drives.images[0].as_ref().unwrap().track(0, 0).to_vec();
        win.write_floppy_slice(&[0xA5u8; 16]);
        drives.on_event(&win, status_word(true, true, 12, 0, 0, 0));
        assert_eq!(drives.images[0].as_ref().unwrap().track(0, 0), &before[..]);
    }

    #[test]
    fn eject_between_read_and_commit_drops_write() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 1);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 10, 0, 0, 0));
        drives.on_event(&win, status_word(true, false, 11, 0, 0, 0));
        drives.change_floppy(None, 0);

        // the write event after the eject must not commit anywhere
        win.write_floppy_slice(&[0xA5u8; 16]);
        drives.on_event(&win, status_word(true, true, 12, 0, 0, 0));
        assert!(drives.images[0].is_none());
    }

    #[test]
    fn empty_drive_reads_leave_staging_untouched() {
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        let marker = [0x5Au8; 16];
        win.write_floppy_slice(&marker);
        drives.on_event(&win, status_word(true, false, 5, 0, 0, 0));
        assert_eq!(&win.read_floppy_slice(16)[..], &marker);
        assert!(drives.fifo[0].is_none());
    }

    #[test]
    fn repeated_address_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, 1);
        let win = DeviceWindow::memory_backed();
        let mut drives = FloppyDrives::new([false; 2]);
        drives.change_floppy(Some(&path), 0);

        drives.on_event(&win, status_word(true, false, 7, 0, 0, 0));
        let first = drives.fifo[0];
        drives.on_event(&win, status_word(true, false, 7, 0, 0, 0));
        // no FIFO shift on the repeat
        assert!(drives.fifo[1].is_none());
        assert_eq!(drives.fifo[0].map(|s| s.pos), first.map(|s| s.pos));
    }
}
