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

    acsi.rs

    ACSI bus target engine and hard disk emulation, software part. Commands
    arrive one byte at a time over the ACSI register; data moves through two
    512-byte buffers in ping-pong bursts of up to 32 16-byte blocks. The
    GEMDOS pseudo-target tunnels its RPC envelopes (opcode 0x11) through the
    same machinery.
*/

#![allow(dead_code)]

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    config::Config,
    devwindow::DeviceWindow,
    gdboot,
    gemdos::{StubEvent, StubLink, OP_ACTION, OP_GEMDOS, OP_RESULT},
};

/* ACSI status codes */
pub const STATUS_OK: u32 = 0x00;
pub const STATUS_ERROR: u32 = 0x02;

// sense format: 0xAAQQSS  AA: additional sense  QQ: qualifier  SS: sense key
pub const ERROR_OK: u32 = 0x000000;
pub const ERROR_NOSECTOR: u32 = 0x010004; /* No index or sector */
pub const ERROR_WRITEERR: u32 = 0x030002; /* Write fault */
pub const ERROR_OPCODE: u32 = 0x200005; /* Opcode not supported */
pub const ERROR_INVADDR: u32 = 0x21000D; /* Invalid block address */
pub const ERROR_INVARG: u32 = 0x240005; /* Invalid argument */
pub const ERROR_INVLUN: u32 = 0x250005; /* Invalid LUN */

pub const SECTOR_SIZE: usize = 512;

/// One DMA burst moves at most this many 16-byte blocks.
const BURST_MAX_BLOCKS: usize = 32;

const INQUIRY_DISK: [u8; 48] =
    *b"\x00\x00\x01\x00\x1f\x00\x00\x00zeST    EmulatedHarddisk0100\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
const INQUIRY_GEMDOS: [u8; 48] =
    *b"\x0a\x00\x01\x00\x1f\x00\x00\x00zeST    GEMDOS_Drive    0100\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";

/// Command length from the leading opcode byte.
fn command_size(head: u8) -> usize {
    if head >= 0xA0 {
        12
    }
    else if head >= 0x80 {
        16
    }
    else if head >= 0x20 {
        10
    }
    else {
        6
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DmaMode {
    #[default]
    Idle,
    Read,
    Write,
}

/// Where a completed guest-to-host transfer is delivered.
pub enum HostSink {
    StubCommand { opcode: u16 },
    StubResult,
}

struct TxBuffer {
    data: Vec<u8>,
    pos: usize,
}

struct RxBuffer {
    data: Vec<u8>,
    expected: usize,
    sink: HostSink,
}

#[derive(Default)]
struct DmaState {
    mode: DmaMode,
    buf_id: usize,
    rem_blocks: usize,
    // host-buffer source for GEMDOS replies; disk reads refill from the file
    tx: Option<TxBuffer>,
    // host-buffer sink for GEMDOS transfers; disk writes drain to the file
    rx: Option<RxBuffer>,
}

/// The double-buffer DMA engine. Shared between the interrupt thread, which
/// continues running transfers, and the GEMDOS dispatcher thread, which
/// starts transfers of its own while the stub polls for actions.
pub struct DmaEngine {
    state: Mutex<DmaState>,
}

impl DmaEngine {
    pub fn new() -> DmaEngine {
        DmaEngine { state: Mutex::new(DmaState::default()) }
    }

    pub fn mode(&self) -> DmaMode {
        self.state.lock().unwrap().mode
    }

    /// Begin a host-to-guest transfer (ACSI DMA read) sourced from a host
    /// buffer. Posts the first burst immediately.
    pub fn start_reply(&self, win: &DeviceWindow, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.mode = DmaMode::Read;
        st.buf_id = 0;
        st.rem_blocks = (data.len() + 15) / 16;
        st.rx = None;
        win.iobuf_write(0, &data[..data.len().min(SECTOR_SIZE)]);
        st.tx = Some(TxBuffer { data: data.to_vec(), pos: SECTOR_SIZE });
        Self::advance_read(&mut st, win, |_| {});
    }

    /// Begin a guest-to-host transfer (ACSI DMA write) collected into a host
    /// buffer and delivered to `sink` on completion.
    pub fn start_collect(&self, win: &DeviceWindow, nbytes: usize, sink: HostSink) {
        let mut st = self.state.lock().unwrap();
        st.mode = DmaMode::Write;
        st.buf_id = 0;
        st.rem_blocks = (nbytes + 15) / 16;
        st.tx = None;
        st.rx = Some(RxBuffer { data: Vec::with_capacity(st.rem_blocks * 16), expected: nbytes, sink });
        let nbs = st.rem_blocks.min(BURST_MAX_BLOCKS);
        win.acsi_write(0x200 | ((nbs - 1) as u32) << 3 | st.buf_id as u32);
    }

    /// Begin a guest-to-host transfer drained to the current target's
    /// backing file by the interrupt thread.
    fn start_disk_write(&self, win: &DeviceWindow, nbytes: usize) {
        let mut st = self.state.lock().unwrap();
        st.mode = DmaMode::Write;
        st.buf_id = 0;
        st.rem_blocks = (nbytes + 15) / 16;
        st.tx = None;
        st.rx = None;
        let nbs = st.rem_blocks.min(BURST_MAX_BLOCKS);
        win.acsi_write(0x200 | ((nbs - 1) as u32) << 3 | st.buf_id as u32);
    }

    fn begin_read(&self, blocks: usize) {
        let mut st = self.state.lock().unwrap();
        st.mode = DmaMode::Read;
        st.buf_id = 0;
        st.rem_blocks = blocks;
        st.tx = None;
        st.rx = None;
    }

    /// Post the next read burst and preload the alternate buffer. `refill`
    /// supplies the next sector when the source is a backing file.
    fn advance_read(st: &mut DmaState, win: &DeviceWindow, mut refill: impl FnMut(usize)) {
        if st.rem_blocks == 0 {
            // finish command
            win.acsi_write(STATUS_OK);
            st.mode = DmaMode::Idle;
            st.tx = None;
            return;
        }
        let nbs = st.rem_blocks.min(BURST_MAX_BLOCKS);
        win.acsi_write(0x100 | ((nbs - 1) as u32) << 3 | st.buf_id as u32);
        st.rem_blocks -= nbs;
        if st.rem_blocks > 0 {
            st.buf_id ^= 1;
            if let Some(tx) = &mut st.tx {
                let start = tx.pos.min(tx.data.len());
                let end = (tx.pos + SECTOR_SIZE).min(tx.data.len());
                win.iobuf_write(st.buf_id, &tx.data[start..end]);
                tx.pos += SECTOR_SIZE;
            }
            else {
                refill(st.buf_id);
            }
        }
    }
}

pub struct AcsiDisk {
    file: File,
    sectors: u32,
    lba: u32,
    sense: u32,
    report_lba: bool,
}

/// One of the eight bus targets. The GEMDOS pseudo-target is not a slot
/// variant of its own: it claims the first empty slot when a GEMDOS root is
/// configured.
enum AcsiSlot {
    Empty,
    Disk(AcsiDisk),
}

pub struct AcsiBus {
    slots: [AcsiSlot; 8],
    gemdos_enabled: bool,
    gemdos_id: Option<usize>,
    gemdos_sense: u32,

    dev_id: usize,
    cmd: [u8; 10],
    cmd_size: usize,
    cmd_rd_idx: usize,
    cmd_ext: bool,

    dma: Arc<DmaEngine>,
    link: Arc<StubLink>,
}

impl AcsiBus {
    pub fn new(config: &Config, dma: Arc<DmaEngine>, link: Arc<StubLink>) -> AcsiBus {
        let mut bus = AcsiBus {
            slots: std::array::from_fn(|_| AcsiSlot::Empty),
            gemdos_enabled: config.hdd.gemdos.is_some(),
            gemdos_id: None,
            gemdos_sense: ERROR_OK,
            dev_id: 0,
            cmd: [0; 10],
            cmd_size: 0,
            cmd_rd_idx: 0,
            cmd_ext: false,
            dma,
            link,
        };
        for id in 0..8 {
            if let Some(path) = config.hdd.acsi(id) {
                bus.open_image(id, path);
            }
        }
        bus.update_gemdos_id();
        bus
    }

    fn open_image(&mut self, id: usize, path: &Path) {
        match File::options().read(true).write(true).open(path) {
            Ok(mut file) => {
                let size = file.seek(SeekFrom::End(0)).unwrap_or(0);
                let _ = file.seek(SeekFrom::Start(0));
                self.slots[id] = AcsiSlot::Disk(AcsiDisk {
                    file,
                    sectors: (size / SECTOR_SIZE as u64) as u32,
                    lba: 0,
                    sense: ERROR_OK,
                    report_lba: false,
                });
                log::info!("ACSI {}: `{}`, {} sectors", id, path.display(), size / 512);
            }
            Err(e) => {
                log::error!("could not open HDD image file `{}`: {}", path.display(), e);
            }
        }
    }

    /// The GEMDOS drive answers on the first target ID with no disk image.
    fn update_gemdos_id(&mut self) {
        self.gemdos_id = if self.gemdos_enabled {
            self.slots.iter().position(|s| matches!(s, AcsiSlot::Empty))
        }
        else {
            None
        };
    }

    pub fn gemdos_id(&self) -> Option<usize> {
        self.gemdos_id
    }

    fn disk_mut(&mut self) -> Option<&mut AcsiDisk> {
        match &mut self.slots[self.dev_id] {
            AcsiSlot::Disk(d) => Some(d),
            AcsiSlot::Empty => None,
        }
    }

    fn set_error(&mut self, win: &DeviceWindow, err: u32, report_lba: bool) {
        if Some(self.dev_id) == self.gemdos_id {
            self.gemdos_sense = err;
        }
        else if let Some(d) = self.disk_mut() {
            d.sense = err;
            d.report_lba = report_lba;
        }
        win.acsi_write(STATUS_ERROR);
    }

    /// Service one hdd-DRQ interrupt: either a DMA continuation or the next
    /// command byte.
    pub fn on_interrupt(&mut self, win: &DeviceWindow) {
        match self.dma.mode() {
            DmaMode::Read => {
                self.continue_read(win);
                return;
            }
            DmaMode::Write => {
                self.continue_write(win);
                return;
            }
            DmaMode::Idle => {}
        }

        let reg = win.acsi_read();
        let d = (reg & 0xFF) as u8;
        let a1 = (reg >> 8) & 1;

        if self.cmd_rd_idx == 0 && !self.cmd_ext && a1 == 1 {
            // bus-idle byte between commands
            return;
        }
        if (self.cmd_rd_idx > 0 || self.cmd_ext) && a1 == 0 {
            log::warn!("ACSI error: cmd byte #{}, A1=0", self.cmd_rd_idx);
            self.cmd_rd_idx = 0;
            self.cmd_ext = false;
            win.acsi_write(STATUS_ERROR);
            return;
        }

        if self.cmd_rd_idx == 0 {
            let mut cmd = d;
            if !self.cmd_ext {
                self.dev_id = (d >> 5) as usize;
                // a target with no medium does not answer (except the GEMDOS
                // pseudo-target when one is configured)
                if matches!(self.slots[self.dev_id], AcsiSlot::Empty) && Some(self.dev_id) != self.gemdos_id {
                    return;
                }
                cmd = d & 0x1F;
                if cmd == 0x1F {
                    // ICD command extension: true opcode follows
                    self.cmd_ext = true;
                    win.acsi_write(STATUS_OK);
                    return;
                }
            }
            let allowed = if Some(self.dev_id) == self.gemdos_id {
                matches!(cmd, 0x00 | 0x03 | 0x08 | 0x11 | 0x12)
            }
            else {
                matches!(cmd, 0x00 | 0x03 | 0x08 | 0x0A | 0x12 | 0x1A | 0x25)
            };
            if !allowed {
                self.set_error(win, ERROR_OPCODE, false);
                return;
            }
            self.cmd_size = command_size(cmd);
            self.cmd[0] = cmd;
            self.cmd_rd_idx = 1;
        }
        else {
            self.cmd[self.cmd_rd_idx] = d;
            self.cmd_rd_idx += 1;
        }

        if self.cmd_rd_idx == self.cmd_size {
            self.cmd_rd_idx = 0;
            self.cmd_ext = false;
            if Some(self.dev_id) == self.gemdos_id {
                self.gemdos_cmd(win);
                return;
            }
            match self.cmd[0] {
                0x00 => win.acsi_write(STATUS_OK), // test unit ready
                0x03 => self.command_request_sense(win),
                0x08 => self.command_read(win),
                0x0A => self.command_write(win),
                0x12 => self.command_inquiry(win),
                0x1A => self.command_mode_sense(win),
                0x25 => self.command_read_capacity(win),
                _ => win.acsi_write(STATUS_OK),
            }
            return;
        }

        // acknowledge the intermediate command byte
        win.acsi_write(STATUS_OK);
    }

    fn continue_read(&mut self, win: &DeviceWindow) {
        let dma = self.dma.clone();
        let mut st = dma.state.lock().unwrap();
        if st.rem_blocks > 0 {
            if let AcsiSlot::Disk(d) = &mut self.slots[self.dev_id] {
                d.lba += 1;
            }
        }
        let slots = &mut self.slots;
        let dev_id = self.dev_id;
        DmaEngine::advance_read(&mut st, win, |buf_id| {
            if let AcsiSlot::Disk(d) = &mut slots[dev_id] {
                let mut buf = [0u8; SECTOR_SIZE];
                if let Err(e) = d.file.read(&mut buf).map(|_| ()) {
                    log::error!("HDD read failed: {}", e);
                }
                win.iobuf_write(buf_id, &buf);
            }
        });
    }

    fn continue_write(&mut self, win: &DeviceWindow) {
        let dma = self.dma.clone();
        let mut guard = dma.state.lock().unwrap();
        let st = &mut *guard;
        let nbs = st.rem_blocks.min(BURST_MAX_BLOCKS);
        st.rem_blocks -= nbs;
        if st.rem_blocks > 0 {
            // hand the guest the other buffer while we drain this one
            let next = st.rem_blocks.min(BURST_MAX_BLOCKS);
            win.acsi_write(0x200 | ((next - 1) as u32) << 3 | (1 - st.buf_id) as u32);
        }
        let buf_id = st.buf_id;
        let finished = st.rem_blocks == 0;

        if st.rx.is_some() {
            let mut chunk = vec![0u8; nbs * 16];
            win.iobuf_read(buf_id, &mut chunk);
            let rx = st.rx.as_mut().unwrap();
            rx.data.extend_from_slice(&chunk);
            st.buf_id ^= 1;
            if finished {
                st.mode = DmaMode::Idle;
                let mut rx = st.rx.take().unwrap();
                drop(guard);
                rx.data.truncate(rx.expected);
                // the dispatcher posts the final bus status itself
                match rx.sink {
                    HostSink::StubCommand { opcode } => {
                        self.link.post(StubEvent::Command { opcode, args: rx.data });
                    }
                    HostSink::StubResult => {
                        self.link.post(StubEvent::Result(rx.data));
                    }
                }
            }
            return;
        }

        if let AcsiSlot::Disk(d) = &mut self.slots[self.dev_id] {
            d.lba += 1;
            let mut buf = [0u8; SECTOR_SIZE];
            win.iobuf_read(buf_id, &mut buf);
            if let Err(e) = d.file.write_all(&buf) {
                log::error!("HDD write failed: {}", e);
            }
        }
        if finished {
            // finish command
            win.acsi_write(STATUS_OK);
            st.mode = DmaMode::Idle;
        }
        st.buf_id ^= 1;
    }

    fn command_request_sense(&mut self, win: &DeviceWindow) {
        let alloc = self.cmd[4] as usize;
        let Some(d) = self.disk_mut() else {
            win.acsi_write(STATUS_OK);
            return;
        };
        let lba = d.report_lba.then_some(d.lba);
        let data = build_sense(d.sense, lba, alloc);
        d.sense = ERROR_OK;
        d.report_lba = false;
        self.dma.start_reply(win, &data);
    }

    fn command_read(&mut self, win: &DeviceWindow) {
        let lba = ((self.cmd[1] & 0x1F) as u32) << 16 | (self.cmd[2] as u32) << 8 | self.cmd[3] as u32;
        let count = self.cmd[4] as u32;
        let Some(d) = self.disk_mut() else {
            win.acsi_write(STATUS_OK);
            return;
        };
        d.lba = lba;
        if lba >= d.sectors || lba + count > d.sectors {
            d.lba = d.sectors;
            self.set_error(win, ERROR_INVADDR, true);
            return;
        }
        if let Err(e) = d.file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64)) {
            log::error!("HDD seek failed: {}", e);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        if let Err(e) = d.file.read(&mut buf).map(|_| ()) {
            log::error!("HDD read failed: {}", e);
        }
        win.iobuf_write(0, &buf);
        self.dma.begin_read(count as usize * BURST_MAX_BLOCKS);
        self.continue_read(win);
    }

    fn command_write(&mut self, win: &DeviceWindow) {
        let lba = ((self.cmd[1] & 0x1F) as u32) << 16 | (self.cmd[2] as u32) << 8 | self.cmd[3] as u32;
        let count = self.cmd[4] as u32;
        let Some(d) = self.disk_mut() else {
            win.acsi_write(STATUS_OK);
            return;
        };
        if lba >= d.sectors || lba + count > d.sectors {
            d.lba = d.sectors;
            self.set_error(win, ERROR_INVADDR, true);
            return;
        }
        d.lba = lba;
        if let Err(e) = d.file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64)) {
            log::error!("HDD seek failed: {}", e);
        }
        self.dma.start_disk_write(win, count as usize * SECTOR_SIZE);
    }

    fn command_inquiry(&mut self, win: &DeviceWindow) {
        let alloc = ((self.cmd[3] as usize) << 8 | self.cmd[4] as usize).min(48);
        let data = if Some(self.dev_id) == self.gemdos_id { &INQUIRY_GEMDOS } else { &INQUIRY_DISK };
        self.dma.start_reply(win, &data[..alloc]);
    }

    fn command_mode_sense(&mut self, win: &DeviceWindow) {
        let page = self.cmd[2];
        let Some(d) = self.disk_mut() else {
            win.acsi_write(STATUS_OK);
            return;
        };
        let blocks = d.sectors;
        match page {
            0x00 => {
                self.dma.start_reply(win, &mode_sense_0(blocks));
            }
            0x04 => {
                self.dma.start_reply(win, &mode_sense_4(blocks));
            }
            0x3F => {
                let mut data = [0u8; 44];
                data[0] = 43;
                data[4..28].copy_from_slice(&mode_sense_4(blocks));
                data[28..44].copy_from_slice(&mode_sense_0(blocks));
                self.dma.start_reply(win, &data);
            }
            _ => {
                self.set_error(win, ERROR_INVARG, false);
            }
        }
    }

    fn command_read_capacity(&mut self, win: &DeviceWindow) {
        let Some(d) = self.disk_mut() else {
            win.acsi_write(STATUS_OK);
            return;
        };
        let lba = d.sectors - 1;
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&lba.to_be_bytes());
        data[6] = 2; // block size = 512 bytes
        self.dma.start_reply(win, &data);
    }

    /// A complete command addressed to the GEMDOS pseudo-target.
    fn gemdos_cmd(&mut self, win: &DeviceWindow) {
        match self.cmd[0] {
            0x00 => win.acsi_write(STATUS_OK),
            0x03 => {
                let alloc = self.cmd[4] as usize;
                let data = build_sense(self.gemdos_sense, None, alloc);
                self.gemdos_sense = ERROR_OK;
                self.dma.start_reply(win, &data);
            }
            0x08 => {
                // the guest boots off the embedded driver image
                let lba = ((self.cmd[1] & 0x1F) as u32) << 16 | (self.cmd[2] as u32) << 8 | self.cmd[3] as u32;
                let count = self.cmd[4] as u32;
                if lba + count > gdboot::GDBOOT_SECTORS {
                    self.gemdos_sense = ERROR_INVADDR;
                    win.acsi_write(STATUS_ERROR);
                }
                else {
                    let start = lba as usize * SECTOR_SIZE;
                    let end = start + count as usize * SECTOR_SIZE;
                    self.dma.start_reply(win, &gdboot::GDBOOT[start..end]);
                }
            }
            0x11 => self.gemdos_envelope(win),
            0x12 => self.command_inquiry(win),
            _ => win.acsi_write(STATUS_OK),
        }
    }

    /// An RPC envelope from the guest-side stub.
    fn gemdos_envelope(&mut self, win: &DeviceWindow) {
        match self.cmd[1] {
            OP_GEMDOS => {
                let opcode = u16::from_be_bytes([self.cmd[2], self.cmd[3]]);
                match opcode {
                    // calls without a data block
                    0x19 | 0x4F => {
                        self.link.post(StubEvent::Command { opcode, args: Vec::new() });
                    }
                    // calls that snapshot 16 bytes of the guest stack
                    0x0E | 0x1A | 0x36 | 0x39 | 0x3A | 0x3B | 0x3C | 0x3D | 0x3E | 0x3F | 0x40
                    | 0x41 | 0x42 | 0x43 | 0x47 | 0x4B | 0x4E | 0x56 | 0x57 | 0xFFFF => {
                        self.dma.start_collect(win, 16, HostSink::StubCommand { opcode });
                    }
                    _ => {
                        let name = match opcode {
                            0x20 => " Super",
                            0x31 => " Ptermres",
                            0x48 => " Malloc",
                            0x49 => " Mfree",
                            0x4A => " Mshrink",
                            _ => "",
                        };
                        log::debug!("ignored GEMDOS opcode {:#06x}{}", opcode, name);
                        win.acsi_write(STATUS_OK);
                    }
                }
            }
            OP_ACTION => {
                // the stub polls for the next action to perform
                self.link.post(StubEvent::ActionPoll);
            }
            OP_RESULT => {
                let count = u16::from_be_bytes([self.cmd[2], self.cmd[3]]) as usize;
                if count == 0 {
                    self.gemdos_sense = ERROR_INVARG;
                    win.acsi_write(STATUS_ERROR);
                }
                else {
                    self.dma.start_collect(win, count, HostSink::StubResult);
                }
            }
            _ => {
                self.gemdos_sense = ERROR_INVARG;
                win.acsi_write(STATUS_ERROR);
            }
        }
    }
}

/// Build a REQUEST SENSE reply: the packed 4-byte form for allocation
/// lengths up to 4, the 18-byte extended form otherwise.
fn build_sense(sense: u32, lba: Option<u32>, alloc: usize) -> Vec<u8> {
    let length = alloc.max(4).min(255);
    let mut data = vec![0u8; length.max(14)];
    if length <= 4 {
        data[0] = (sense >> 16) as u8; // additional sense code
        if let Some(lba) = lba {
            data[0] |= 0x80;
            data[1] = (lba >> 16) as u8;
            data[2] = (lba >> 8) as u8;
            data[3] = lba as u8;
        }
    }
    else {
        data[0] = 0x70;
        if let Some(lba) = lba {
            data[0] |= 0x80;
            data[3..7].copy_from_slice(&lba.to_be_bytes());
        }
        data[2] = (sense & 0x0F) as u8; // sense key
        data[7] = 10; // additional sense length
        data[12] = (sense >> 16) as u8; // additional sense code
        data[13] = (sense >> 8) as u8; // qualifier
    }
    data.truncate(length);
    data
}

// Mode page 0 (disk and sector size)
fn mode_sense_0(blocks: u32) -> [u8; 16] {
    let blocks = blocks.min(0xFF_FFFF);
    let mut out = [0u8; 16];
    out[1] = 14; // remaining bytes
    out[3] = 8;
    out[5] = (blocks >> 16) as u8;
    out[6] = (blocks >> 8) as u8;
    out[7] = blocks as u8;
    out[10] = 2; // sector size middle byte
    out
}

// Mode page 4 (rigid drive geometry)
fn mode_sense_4(blocks: u32) -> [u8; 24] {
    let mut heads = 1u32;
    let mut cylinders = blocks;
    for h in (1..=255u32).rev() {
        cylinders = blocks / h;
        if cylinders > 0xFF_FFFF || blocks % h == 0 {
            heads = h;
            break;
        }
    }
    let mut out = [0u8; 24];
    out[0] = 4; // page code
    out[1] = 22; // page length
    out[2] = (cylinders >> 16) as u8;
    out[3] = (cylinders >> 8) as u8;
    out[4] = cylinders as u8;
    out[5] = heads as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn sector_fill(lba: u32) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (lba as usize * 13 + i) as u8;
        }
        buf
    }

    fn make_disk(dir: &TempDir, sectors: u32) -> std::path::PathBuf {
        let path = dir.path().join("hd.img");
        let mut f = File::create(&path).unwrap();
        for lba in 0..sectors {
            f.write_all(&sector_fill(lba)).unwrap();
        }
        path
    }

    fn make_bus(dir: &TempDir, sectors: u32) -> (AcsiBus, DeviceWindow, Arc<DmaEngine>, Arc<StubLink>) {
        let path = make_disk(dir, sectors);
        let mut config = Config::default();
        config.hdd.acsi0 = Some(path);
        let dma = Arc::new(DmaEngine::new());
        let link = Arc::new(StubLink::new());
        let bus = AcsiBus::new(&config, dma.clone(), link.clone());
        (bus, DeviceWindow::memory_backed(), dma, link)
    }

    // Shift command bytes in the way the fabric presents them: the first
    // byte of a command has A1 low, every subsequent byte has A1 high.
    fn send_command(bus: &mut AcsiBus, win: &DeviceWindow, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let sideband = if i == 0 { 0 } else { 0x100 };
            win.acsi_write(b as u32 | sideband);
            bus.on_interrupt(win);
        }
    }

    fn read_iobuf(win: &DeviceWindow, buf_id: usize) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        win.iobuf_read(buf_id, &mut buf);
        buf
    }

    #[test]
    fn ten_sector_read_ping_pongs() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, dma, _) = make_bus(&dir, 64);

        send_command(&mut bus, &win, &[0x08, 0, 0, 0, 10, 0]);

        // ten bursts on alternating buffers, data preloaded one ahead
        for k in 0..10u32 {
            let posted = win.acsi_read();
            assert_eq!(posted, 0x100 | 31 << 3 | (k & 1), "burst {}", k);
            assert_eq!(read_iobuf(&win, (k & 1) as usize), sector_fill(k), "payload {}", k);
            bus.on_interrupt(&win);
        }
        // the eleventh DMA-complete interrupt ends the command
        assert_eq!(win.acsi_read(), STATUS_OK);
        assert_eq!(dma.mode(), DmaMode::Idle);
    }

    #[test]
    fn out_of_range_read_reports_invaddr_with_clamped_lba() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 16);

        // lba beyond the end
        send_command(&mut bus, &win, &[0x08, 0, 0, 20, 1, 0]);
        assert_eq!(win.acsi_read(), STATUS_ERROR);

        // request the extended sense form
        send_command(&mut bus, &win, &[0x03, 0, 0, 0, 18, 0]);
        assert_eq!(win.acsi_read(), 0x100 | 1 << 3 | 0);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 0xF0); // extended format, address valid
        assert_eq!(data[2], 0x0D); // sense key
        assert_eq!(&data[3..7], &16u32.to_be_bytes()); // clamped to sector count
        assert_eq!(data[12], 0x21); // additional sense code
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);

        // sense is consumed by the request
        send_command(&mut bus, &win, &[0x03, 0, 0, 0, 18, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 0x70);
        assert_eq!(data[2], 0x00);
    }

    #[test]
    fn straddling_read_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, dma, _) = make_bus(&dir, 16);
        send_command(&mut bus, &win, &[0x08, 0, 0, 14, 4, 0]);
        assert_eq!(win.acsi_read(), STATUS_ERROR);
        assert_eq!(dma.mode(), DmaMode::Idle);
    }

    #[test]
    fn two_sector_write_lands_in_file() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, dma, _) = make_bus(&dir, 16);
        let path = dir.path().join("hd.img");

        send_command(&mut bus, &win, &[0x0A, 0, 0, 0, 2, 0]);
        assert_eq!(win.acsi_read(), 0x200 | 31 << 3 | 0);

        let first = [0x11u8; SECTOR_SIZE];
        win.iobuf_write(0, &first);
        bus.on_interrupt(&win);
        // second burst posted for the other buffer while we drained this one
        assert_eq!(win.acsi_read(), 0x200 | 31 << 3 | 1);

        let second = [0x22u8; SECTOR_SIZE];
        win.iobuf_write(1, &second);
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);
        assert_eq!(dma.mode(), DmaMode::Idle);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[0..512], &first);
        assert_eq!(&contents[512..1024], &second);
        assert_eq!(contents[1024], sector_fill(2)[0]);
    }

    #[test]
    fn unsupported_opcode_sets_sense() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 16);
        // MODE SELECT is not implemented
        win.acsi_write(0x15);
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_ERROR);

        send_command(&mut bus, &win, &[0x03, 0, 0, 0, 18, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[2], 0x05);
        assert_eq!(data[12], 0x20);
    }

    #[test]
    fn inquiry_identifies_disk() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 16);
        send_command(&mut bus, &win, &[0x12, 0, 0, 0, 48, 0]);
        assert_eq!(win.acsi_read(), 0x100 | 2 << 3 | 0);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 0x00);
        assert_eq!(&data[8..16], b"zeST    ");
        assert_eq!(&data[16..32], b"EmulatedHarddisk");
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 100);
        send_command(&mut bus, &win, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(&data[0..4], &99u32.to_be_bytes());
        assert_eq!(&data[4..8], &[0, 0, 2, 0]);
    }

    #[test]
    fn mode_sense_pages() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 64);

        send_command(&mut bus, &win, &[0x1A, 0, 0x00, 0, 16, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[3], 8);
        assert_eq!(data[7], 64);
        assert_eq!(data[10], 2);
        bus.on_interrupt(&win);

        send_command(&mut bus, &win, &[0x1A, 0, 0x04, 0, 24, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 4);
        assert_eq!(data[1], 22);
        // 64 blocks: largest head count dividing it is 64/... heads=255..; 64 % h == 0 first at h=64
        assert_eq!(data[5], 64);
        assert_eq!(data[4], 1);
        bus.on_interrupt(&win);

        send_command(&mut bus, &win, &[0x1A, 0, 0x3F, 0, 44, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 43);
        assert_eq!(data[4], 4); // page 4 follows the header
        assert_eq!(data[28 + 10], 2); // page 0 tail

        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);
    }

    #[test]
    fn empty_slot_ignores_commands() {
        let dir = TempDir::new().unwrap();
        let (mut bus, win, _, _) = make_bus(&dir, 16);
        // target 3 has no image and no GEMDOS root is configured
        win.acsi_write((3 << 5) | 0x00);
        bus.on_interrupt(&win);
        // no reply was posted
        assert_eq!(win.acsi_read(), (3 << 5) | 0x00);
    }

    #[test]
    fn gemdos_lun_serves_boot_sectors() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.hdd.gemdos = Some(dir.path().to_path_buf());
        let dma = Arc::new(DmaEngine::new());
        let link = Arc::new(StubLink::new());
        let mut bus = AcsiBus::new(&config, dma.clone(), link);
        let win = DeviceWindow::memory_backed();
        assert_eq!(bus.gemdos_id(), Some(0));

        send_command(&mut bus, &win, &[0x08, 0, 0, 0, 1, 0]);
        assert_eq!(win.acsi_read(), 0x100 | 31 << 3 | 0);
        assert_eq!(&read_iobuf(&win, 0)[..], &gdboot::GDBOOT[..512]);
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);

        send_command(&mut bus, &win, &[0x08, 0, 0, 1, 3, 0]);
        assert_eq!(&read_iobuf(&win, 0)[..], &gdboot::GDBOOT[512..1024]);
        bus.on_interrupt(&win);
        assert_eq!(&read_iobuf(&win, 1)[..], &gdboot::GDBOOT[1024..1536]);
        bus.on_interrupt(&win);
        bus.on_interrupt(&win);
        assert_eq!(win.acsi_read(), STATUS_OK);

        // reads past the embedded image fail
        send_command(&mut bus, &win, &[0x08, 0, 0, 2, 3, 0]);
        assert_eq!(win.acsi_read(), STATUS_ERROR);
    }

    #[test]
    fn gemdos_inquiry_identifies_pseudo_target() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.hdd.gemdos = Some(dir.path().to_path_buf());
        let dma = Arc::new(DmaEngine::new());
        let link = Arc::new(StubLink::new());
        let mut bus = AcsiBus::new(&config, dma, link);
        let win = DeviceWindow::memory_backed();

        send_command(&mut bus, &win, &[0x12, 0, 0, 0, 48, 0]);
        let data = read_iobuf(&win, 0);
        assert_eq!(data[0], 0x0A);
        assert_eq!(&data[8..16], b"zeST    ");
        assert_eq!(&data[16..32], b"GEMDOS_Drive    ");
    }

    #[test]
    fn stub_envelope_without_data_posts_command() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.hdd.gemdos = Some(dir.path().to_path_buf());
        let dma = Arc::new(DmaEngine::new());
        let link = Arc::new(StubLink::new());
        let mut bus = AcsiBus::new(&config, dma, link.clone());
        let win = DeviceWindow::memory_backed();

        // Dgetdrv carries no data block
        send_command(&mut bus, &win, &[0x11, OP_GEMDOS, 0x00, 0x19, b'z', b'S']);
        match link.wait(std::time::Duration::from_millis(10)) {
            Some(StubEvent::Command { opcode: 0x19, args }) => assert!(args.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn stub_envelope_with_data_collects_stack_bytes() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.hdd.gemdos = Some(dir.path().to_path_buf());
        let dma = Arc::new(DmaEngine::new());
        let link = Arc::new(StubLink::new());
        let mut bus = AcsiBus::new(&config, dma, link.clone());
        let win = DeviceWindow::memory_backed();

        // Fopen snapshots 16 bytes of guest stack
        send_command(&mut bus, &win, &[0x11, OP_GEMDOS, 0x00, 0x3D, b'z', b'S']);
        assert_eq!(win.acsi_read(), 0x200); // one block, buffer 0

        let stack: Vec<u8> = (0u8..16).collect();
        win.iobuf_write(0, &stack);
        bus.on_interrupt(&win);
        match link.wait(std::time::Duration::from_millis(10)) {
            Some(StubEvent::Command { opcode: 0x3D, args }) => assert_eq!(args, stack),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
