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

    devwindow.rs

    The memory-mapped register window into the FPGA fabric, plus the UIO
    interrupt channel that rides alongside it.

    Register map (32-bit words unless noted):
      word 0        status: {floppy_intr:1, hdd_drq:1, midi_intr:1} in the low
                    bits, a packed floppy position descriptor in bits 12..31
      word 1        control: run/reset line and machine setup hints (write)
      words 8..11   16-byte floppy track slice staging area
      word 12       MIDI ACIA: data:8, rx_full @ 0x100, tx_full @ 0x200
      0x4000        ACSI register: reads are received bytes (bit 8 = A1),
                    writes post a status or start a DMA burst
      0x4800        two 512-byte ACSI DMA buffers, used ping-pong
*/

#![allow(dead_code)]

use std::{
    fs::File,
    os::fd::{AsRawFd, RawFd},
    path::Path,
};

use modular_bitfield::{bitfield, prelude::*};
use thiserror::Error;

/// Size of the mapped register region.
pub const WINDOW_LEN: usize = 0x5000;

pub const STATUS_FLOPPY_INTR: u32 = 0x01;
pub const STATUS_HDD_DRQ: u32 = 0x02;
pub const STATUS_MIDI_INTR: u32 = 0x04;
/// Bits 3..11 of the status word are reserved and read as zero.
pub const STATUS_RESERVED_MASK: u32 = 0xFF8;

const FLOPPY_STAGING_WORD: usize = 8;
const MIDI_ACIA_WORD: usize = 12;
const ACSI_REG_OFFSET: usize = 0x4000;
const ACSI_BUF_OFFSET: usize = 0x4800;

pub const MIDI_RX_FULL: u32 = 0x100;
pub const MIDI_TX_FULL: u32 = 0x200;

/// The packed floppy position descriptor carried in status word bits 12..31.
#[bitfield(bits = 32)]
#[derive(Copy, Clone, Debug)]
pub struct FloppyStatus {
    pub floppy_intr: bool,
    pub hdd_drq: bool,
    pub midi_intr: bool,
    #[skip]
    reserved: B9,
    pub drive: B1,
    pub track: B8,
    pub addr: B9,
    pub write: bool,
    pub read: bool,
}

impl From<u32> for FloppyStatus {
    fn from(word: u32) -> Self {
        FloppyStatus::from_bytes(word.to_le_bytes())
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unavailable: {what}: {source}")]
    Unavailable { what: &'static str, source: std::io::Error },
}

/// Result of one wait on the interrupt channel.
#[derive(Debug, PartialEq, Eq)]
pub enum IrqWait {
    Timeout,
    Event,
    Gone,
}

/// A scoped mapping of the FPGA register window together with the UIO
/// interrupt descriptor. All accesses are volatile; the window is shared
/// between threads, each of which owns disjoint registers (see the
/// concurrency notes in the subsystem modules).
pub struct DeviceWindow {
    base: *mut u8,
    uio: Option<File>,
    // backing storage for the memory-backed test window
    _owned: Option<Box<[u8]>>,
}

// The raw pointer is to a MAP_SHARED device region (or owned test memory)
// that lives as long as the window itself.
unsafe impl Send for DeviceWindow {}
unsafe impl Sync for DeviceWindow {}

impl DeviceWindow {
    /// Map the device region and open its interrupt channel.
    pub fn acquire(uio_path: &Path) -> Result<DeviceWindow, DeviceError> {
        let uio = File::options()
            .read(true)
            .write(true)
            .open(uio_path)
            .map_err(|source| DeviceError::Unavailable { what: "open uio device", source })?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                WINDOW_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                uio.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DeviceError::Unavailable {
                what: "mmap register window",
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(DeviceWindow { base: base as *mut u8, uio: Some(uio), _owned: None })
    }

    /// A window over plain process memory, for unit tests.
    pub fn memory_backed() -> DeviceWindow {
        let mut owned = vec![0u8; WINDOW_LEN].into_boxed_slice();
        let base = owned.as_mut_ptr();
        DeviceWindow { base, uio: None, _owned: Some(owned) }
    }

    fn uio_fd(&self) -> Option<RawFd> {
        self.uio.as_ref().map(|f| f.as_raw_fd())
    }

    /// Block for up to `budget_ms` waiting for the next interrupt. On an
    /// event the pending count is consumed from the descriptor.
    pub fn wait_interrupt(&self, budget_ms: i32) -> IrqWait {
        let Some(fd) = self.uio_fd() else {
            return IrqWait::Timeout;
        };
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let status = unsafe { libc::poll(&mut pfd, 1, budget_ms) };
        if status == -1 {
            log::error!("UIO poll: {}", std::io::Error::last_os_error());
            return IrqWait::Gone;
        }
        if status == 0 {
            return IrqWait::Timeout;
        }
        let mut count = [0u8; 4];
        let n = unsafe { libc::read(fd, count.as_mut_ptr() as *mut libc::c_void, 4) };
        if n != 4 {
            log::error!("UIO interrupt read returned {}", n);
            return IrqWait::Gone;
        }
        IrqWait::Event
    }

    /// Re-enable interrupt delivery. The UIO channel is edge-masked: until
    /// this confirmation write no further event is produced.
    pub fn rearm(&self) -> bool {
        let Some(fd) = self.uio_fd() else {
            return true;
        };
        let unmask: u32 = 1;
        let n = unsafe { libc::write(fd, (&unmask as *const u32) as *const libc::c_void, 4) };
        if n != 4 {
            log::error!("UIO unmask: {}", std::io::Error::last_os_error());
            return false;
        }
        true
    }

    #[inline]
    fn word_ptr(&self, word: usize) -> *mut u32 {
        debug_assert!(word * 4 + 4 <= WINDOW_LEN);
        unsafe { self.base.add(word * 4) as *mut u32 }
    }

    #[inline]
    pub fn read_word(&self, word: usize) -> u32 {
        unsafe { self.word_ptr(word).read_volatile() }
    }

    #[inline]
    pub fn write_word(&self, word: usize, value: u32) {
        unsafe { self.word_ptr(word).write_volatile(value) }
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= WINDOW_LEN);
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe { self.base.add(offset + i).read_volatile() };
        }
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= WINDOW_LEN);
        for (i, &b) in data.iter().enumerate() {
            unsafe { self.base.add(offset + i).write_volatile(b) };
        }
    }

    /// Read the interrupt status word.
    #[inline]
    pub fn status(&self) -> u32 {
        self.read_word(0)
    }

    /// Copy a track slice into the floppy staging area (at most 16 bytes).
    pub fn write_floppy_slice(&self, data: &[u8]) {
        self.write_bytes(FLOPPY_STAGING_WORD * 4, data);
    }

    /// Read back the floppy staging area, which the fabric overwrites with
    /// data to commit on a write pass.
    pub fn read_floppy_slice(&self, len: usize) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.read_bytes(FLOPPY_STAGING_WORD * 4, &mut out[..len]);
        out
    }

    #[inline]
    pub fn midi_read(&self) -> u32 {
        self.read_word(MIDI_ACIA_WORD)
    }

    #[inline]
    pub fn midi_write(&self, value: u32) {
        self.write_word(MIDI_ACIA_WORD, value)
    }

    #[inline]
    pub fn acsi_read(&self) -> u32 {
        self.read_word(ACSI_REG_OFFSET / 4)
    }

    #[inline]
    pub fn acsi_write(&self, value: u32) {
        self.write_word(ACSI_REG_OFFSET / 4, value)
    }

    /// Read from one of the two 512-byte ACSI DMA buffers.
    pub fn iobuf_read(&self, buf_id: usize, out: &mut [u8]) {
        debug_assert!(buf_id < 2 && out.len() <= 512);
        self.read_bytes(ACSI_BUF_OFFSET + buf_id * 512, out);
    }

    /// Fill one of the two 512-byte ACSI DMA buffers.
    pub fn iobuf_write(&self, buf_id: usize, data: &[u8]) {
        debug_assert!(buf_id < 2 && data.len() <= 512);
        self.write_bytes(ACSI_BUF_OFFSET + buf_id * 512, data);
    }

    /// Apply the machine setup hints to the control word with the run bit
    /// set. The memory-top and turbo hints belong to the fabric; the host
    /// only forwards them from the configuration.
    pub fn apply_setup(&self, mem_size: u8, turbo: bool) {
        let word = 1 | (turbo as u32) << 1 | (mem_size as u32) << 4;
        self.write_word(1, word);
    }

    /// Pulse the reset line, leaving the setup hints applied.
    pub fn cold_reset(&self, mem_size: u8, turbo: bool) {
        let word = (turbo as u32) << 1 | (mem_size as u32) << 4;
        self.write_word(1, word);
        std::thread::sleep(std::time::Duration::from_millis(10));
        self.write_word(1, word | 1);
    }
}

impl Drop for DeviceWindow {
    fn drop(&mut self) {
        if self._owned.is_none() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, WINDOW_LEN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floppy_status_unpacks() {
        // read, addr=0x123, track=0x45, drive=1, floppy interrupt pending
        let word: u32 = (1 << 31) | (0x123 << 21) | (0x45 << 13) | (1 << 12) | 1;
        let st = FloppyStatus::from(word);
        assert!(st.read());
        assert!(!st.write());
        assert_eq!(st.addr(), 0x123);
        assert_eq!(st.track(), 0x45);
        assert_eq!(st.drive(), 1);
        assert!(st.floppy_intr());
        assert!(!st.hdd_drq());
    }

    #[test]
    fn staging_and_iobuf_round_trip() {
        let win = DeviceWindow::memory_backed();
        let slice: Vec<u8> = (0u8..16).collect();
        win.write_floppy_slice(&slice);
        assert_eq!(&win.read_floppy_slice(16)[..], &slice[..]);

        let sector: Vec<u8> = (0..512u32).map(|i| (i * 3) as u8).collect();
        win.iobuf_write(1, &sector);
        let mut back = vec![0u8; 512];
        win.iobuf_read(1, &mut back);
        assert_eq!(back, sector);
        // buffer 0 untouched
        win.iobuf_read(0, &mut back);
        assert!(back.iter().all(|&b| b == 0));
    }
}
