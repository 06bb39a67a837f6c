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

    gemdos.rs

    The GEMDOS drive dispatcher.

    General protocol: on any GEMDOS trap the guest-side stub sends a special
    command (opcode 0x11) with OP_GEMDOS, the GEMDOS opcode and a snapshot
    of the guest stack. If the host answers STATUS_OK the stub falls back to
    the ROM. If the host answers STATUS_ERROR the stub enters action mode:
    it polls with OP_ACTION envelopes, the host replies with an action block
    (read memory, write memory, nested GEMDOS call, stack patch...), the
    stub performs it and returns data with OP_RESULT where applicable. The
    loop ends when the host sends FALLBACK or RETURN.

    The dispatcher runs on its own thread and rendezvouses with the
    interrupt thread through a mutex/condvar mailbox with bounded waits.
*/

#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    os::fd::AsRawFd,
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    acsi::{DmaEngine, STATUS_ERROR, STATUS_OK},
    config::Config,
    devwindow::DeviceWindow,
    dospath::{self, PathLookup},
    prg::PrgFile,
};

/* operation codes in ACSI special commands */
pub const OP_GEMDOS: u8 = 1; /* new GEMDOS call */
pub const OP_ACTION: u8 = 2; /* get next action to perform */
pub const OP_RESULT: u8 = 3; /* send result */

/* action codes from host to stub */
const ACTION_FALLBACK: u16 = 0; /* fall back to the TOS code */
const ACTION_RETURN: u16 = 1; /* return from GEMDOS */
const ACTION_RDMEM: u16 = 2; /* read guest memory */
const ACTION_WRMEM: u16 = 3; /* write guest memory */
const ACTION_WRMEM0: u16 = 4; /* write guest memory then return 0 */
const ACTION_GEMDOS: u16 = 5; /* nested GEMDOS call in the guest */
const ACTION_MODSTACK: u16 = 6; /* patch the call frame and fall back */

/* GEMDOS error codes */
const EFILNF: i32 = -33;
const EPTHNF: i32 = -34;
const EACCDN: i32 = -36;
const EIHNDL: i32 = -37;
const ENSAME: i32 = -48;
const ENMFIL: i32 = -49;
const EINTRN: i32 = -65;
const EPLFMT: i32 = -66;

/* GEMDOS file attribute flags */
const FA_READONLY: u16 = 0x01;
const FA_HIDDEN: u16 = 0x02;
const FA_SYSTEM: u16 = 0x04;
const FA_VOLUME: u16 = 0x08;
const FA_DIR: u16 = 0x10;
const FA_ARCHIVE: u16 = 0x20;

/// DMA buffer size of the stub, in sectors.
pub const DMABUFSZ: usize = 5;

/// Payload bytes per WRMEM action (the 8-byte action header rides along).
const MEM_BLKSZ: usize = 512 * DMABUFSZ - 8;

/// File handles handed to the guest sit above the ROM's own handle range.
const HANDLE_BASE: u16 = 0x7A00;

const DTA_SIZE: usize = 44;
const DTA_TAG: &[u8; 4] = b"zeST";

/// How long each rendezvous with the stub may take before the call is
/// abandoned.
const STUB_TIMEOUT: Duration = Duration::from_millis(500);

const SEARCH_TABLE_MAX: usize = 64;

#[derive(Debug, Error)]
enum StubError {
    #[error("stub rendezvous timed out")]
    Timeout,
    #[error("unexpected stub event")]
    Protocol,
}

/// An event handed to the dispatcher by the interrupt thread.
#[derive(Debug)]
pub enum StubEvent {
    /// A new GEMDOS call, with the 16-byte stack snapshot when the opcode
    /// carries one.
    Command { opcode: u16, args: Vec<u8> },
    /// The stub polled for the next action.
    ActionPoll,
    /// Result data returned by the stub.
    Result(Vec<u8>),
}

/// Single-slot mailbox between the interrupt thread and the dispatcher.
pub struct StubLink {
    slot: Mutex<Option<StubEvent>>,
    cv: Condvar,
}

impl StubLink {
    pub fn new() -> StubLink {
        StubLink { slot: Mutex::new(None), cv: Condvar::new() }
    }

    pub fn post(&self, ev: StubEvent) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            log::debug!("stub event replaced before it was consumed");
        }
        *slot = Some(ev);
        self.cv.notify_one();
    }

    pub fn wait(&self, timeout: Duration) -> Option<StubEvent> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(ev) = slot.take() {
                return Some(ev);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn bei32(b: &[u8]) -> i32 {
    be32(b) as i32
}

struct SearchContext {
    dir: std::fs::ReadDir,
    path: PathBuf,
    pattern: String,
    attr: u16,
    // "." and ".." pseudo-entries still to serve, in pop() order
    dots: Vec<&'static str>,
}

pub struct GemdosDispatcher {
    win: Arc<DeviceWindow>,
    dma: Arc<DmaEngine>,
    link: Arc<StubLink>,
    shutdown: Arc<AtomicBool>,

    root: PathBuf,
    tz_hours: i32,

    gemdos_drv: u32,
    current_drv: u32,
    current_path: PathBuf,

    dta: [u8; DTA_SIZE],
    dta_addr: u32,

    files: HashMap<i32, File>,
    searches: Vec<Option<SearchContext>>,
    search_evict: usize,
}

impl GemdosDispatcher {
    pub fn new(
        win: Arc<DeviceWindow>,
        dma: Arc<DmaEngine>,
        link: Arc<StubLink>,
        shutdown: Arc<AtomicBool>,
        config: &Config,
    ) -> GemdosDispatcher {
        let root = config.hdd.gemdos.clone().unwrap_or_default();
        GemdosDispatcher {
            win,
            dma,
            link,
            shutdown,
            current_path: root.clone(),
            root,
            tz_hours: config.main.timezone,
            gemdos_drv: 2,
            current_drv: 0,
            dta: [0; DTA_SIZE],
            dta_addr: 0,
            files: HashMap::new(),
            searches: Vec::new(),
            search_evict: 0,
        }
    }

    /// Dispatcher thread body.
    pub fn run(mut self) {
        log::info!("GEMDOS drive rooted at `{}`", self.root.display());
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.link.wait(Duration::from_millis(200)) {
                Some(StubEvent::Command { opcode, args }) => {
                    if let Err(e) = self.dispatch(opcode, &args) {
                        log::error!("GEMDOS call {:#06x} abandoned: {}", opcode, e);
                    }
                }
                Some(ev) => {
                    log::debug!("stray stub event outside a call: {:?}", ev);
                }
                None => {}
            }
        }
        log::info!("GEMDOS dispatcher stopped");
    }

    fn dispatch(&mut self, opcode: u16, buf: &[u8]) -> Result<(), StubError> {
        if opcode != 0x19 && opcode != 0x4F && buf.len() < 16 {
            log::warn!("short stack snapshot for GEMDOS call {:#06x}", opcode);
            self.no_action();
            return Ok(());
        }
        match opcode {
            0x0E => {
                // Dsetdrv: remember the drive, let the ROM do the work
                self.current_drv = be16(&buf[2..]) as u32;
                log::trace!("Dsetdrv({})", self.current_drv);
                self.no_action();
                Ok(())
            }
            0x19 => {
                log::trace!("Dgetdrv()");
                self.no_action();
                Ok(())
            }
            0x1A => self.fsetdta(be32(&buf[2..])),
            0x36 => self.dfree(be32(&buf[2..]), be16(&buf[6..])),
            0x39 => self.dcreate(be32(&buf[2..])),
            0x3A => self.ddelete(be32(&buf[2..])),
            0x3B => self.dsetpath(be32(&buf[2..])),
            0x3C => self.fcreate(be32(&buf[2..]), be16(&buf[6..])),
            0x3D => self.fopen(be32(&buf[2..]), be16(&buf[6..])),
            0x3E => self.fclose(be16(&buf[2..])),
            0x3F => self.fread(be16(&buf[2..]), be32(&buf[4..]), be32(&buf[8..])),
            0x40 => self.fwrite(be16(&buf[2..]), be32(&buf[4..]), be32(&buf[8..])),
            0x41 => self.fdelete(be32(&buf[2..])),
            0x42 => self.fseek(bei32(&buf[2..]), be16(&buf[6..]), be16(&buf[8..])),
            0x43 => self.fattrib(be32(&buf[2..]), be16(&buf[6..]), be16(&buf[8..])),
            0x47 => self.dgetpath(be32(&buf[2..]), be16(&buf[6..])),
            0x4B => {
                self.pexec(be16(&buf[2..]), be32(&buf[4..]), be32(&buf[8..]), be32(&buf[12..]))
            }
            0x4E => self.fsfirst(be32(&buf[2..]), be16(&buf[6..])),
            0x4F => self.fsnext(),
            0x56 => self.frename(be32(&buf[4..]), be32(&buf[8..])),
            0x57 => self.fdatime(be32(&buf[2..]), be16(&buf[6..]), be16(&buf[8..])),
            0xFFFF => self.drive_init(be32(&buf[0..]), be32(&buf[4..])),
            _ => {
                log::debug!("unhandled GEMDOS opcode {:#06x}", opcode);
                self.no_action();
                Ok(())
            }
        }
    }

    /* ---- rendezvous helpers ---------------------------------------- */

    // terminate the ACSI command, signaling no action is required
    fn no_action(&self) {
        self.win.acsi_write(STATUS_OK);
    }

    // terminate the ACSI command, signaling the stub must enter action mode
    fn action_required(&self) {
        self.win.acsi_write(STATUS_ERROR);
    }

    fn wait_action_poll(&self) -> Result<(), StubError> {
        match self.link.wait(STUB_TIMEOUT) {
            Some(StubEvent::ActionPoll) => Ok(()),
            Some(ev) => {
                log::warn!("expected action poll, got {:?}", ev);
                Err(StubError::Protocol)
            }
            None => Err(StubError::Timeout),
        }
    }

    fn wait_result(&self) -> Result<Vec<u8>, StubError> {
        match self.link.wait(STUB_TIMEOUT) {
            Some(StubEvent::Result(data)) => Ok(data),
            Some(ev) => {
                log::warn!("expected result data, got {:?}", ev);
                Err(StubError::Protocol)
            }
            None => Err(StubError::Timeout),
        }
    }

    // answer a pending OP_ACTION poll with an action block
    fn send_action(&self, block: &[u8]) {
        let mut padded = block.to_vec();
        padded.resize(block.len().max(16).next_multiple_of(16), 0);
        self.dma.start_reply(&self.win, &padded);
    }

    /// Fetch bytes from guest memory. A length of zero reads a
    /// NUL-terminated string.
    fn read_memory(&self, addr: u32, nbytes: u16) -> Result<Vec<u8>, StubError> {
        self.wait_action_poll()?;
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&ACTION_RDMEM.to_be_bytes());
        block[2..6].copy_from_slice(&addr.to_be_bytes());
        block[6..8].copy_from_slice(&nbytes.to_be_bytes());
        self.send_action(&block);

        let data = self.wait_result()?;
        self.no_action();
        Ok(data)
    }

    fn read_string(&self, addr: u32) -> Result<String, StubError> {
        let data = self.read_memory(addr, 0)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    fn read_long(&self, addr: u32) -> Result<u32, StubError> {
        let data = self.read_memory(addr, 4)?;
        if data.len() < 4 {
            return Err(StubError::Protocol);
        }
        Ok(be32(&data))
    }

    fn write_memory_generic(&self, buf: &[u8], addr: u32, ret0: bool) -> Result<(), StubError> {
        self.wait_action_poll()?;
        let mut block = vec![0u8; 8 + buf.len()];
        let code = if ret0 { ACTION_WRMEM0 } else { ACTION_WRMEM };
        block[0..2].copy_from_slice(&code.to_be_bytes());
        block[2..6].copy_from_slice(&addr.to_be_bytes());
        block[6..8].copy_from_slice(&(buf.len() as u16).to_be_bytes());
        block[8..].copy_from_slice(buf);
        self.send_action(&block);
        Ok(())
    }

    fn write_memory(&self, buf: &[u8], addr: u32) -> Result<(), StubError> {
        self.write_memory_generic(buf, addr, false)
    }

    /// Write guest memory and terminate the action loop returning zero.
    fn write_memory0(&self, buf: &[u8], addr: u32) -> Result<(), StubError> {
        self.write_memory_generic(buf, addr, true)
    }

    fn write_long(&self, addr: u32, val: u32) -> Result<(), StubError> {
        self.write_memory(&val.to_be_bytes(), addr)
    }

    // finish the action loop, resuming the ROM implementation
    fn fallback(&self) -> Result<(), StubError> {
        self.wait_action_poll()?;
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&ACTION_FALLBACK.to_be_bytes());
        self.send_action(&block);
        Ok(())
    }

    // finish the action loop, terminating the GEMDOS call with a value
    fn ret(&self, val: i32) -> Result<(), StubError> {
        self.wait_action_poll()?;
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&ACTION_RETURN.to_be_bytes());
        block[2..6].copy_from_slice(&val.to_be_bytes());
        self.send_action(&block);
        Ok(())
    }

    /// Have the stub perform a nested Pexec(5) to create a basepage;
    /// returns the guest's result.
    fn inner_pexec5(&self, cmdline: u32, env: u32) -> Result<i32, StubError> {
        self.wait_action_poll()?;
        let mut block = [0u8; 32];
        block[0..2].copy_from_slice(&ACTION_GEMDOS.to_be_bytes());
        block[2..4].copy_from_slice(&0x4Bu16.to_be_bytes());
        block[4..6].copy_from_slice(&5u16.to_be_bytes());
        // name is unused in mode 5
        block[10..14].copy_from_slice(&cmdline.to_be_bytes());
        block[14..18].copy_from_slice(&env.to_be_bytes());
        self.send_action(&block);

        let data = self.wait_result()?;
        if data.len() < 4 {
            return Err(StubError::Protocol);
        }
        self.no_action();
        Ok(bei32(&data))
    }

    /// Rewrite the stub's saved call frame into Pexec(`mode`, 0, `arg`, 0)
    /// and fall back, letting the ROM complete the rewritten call.
    fn modstack_pexec(&self, mode: u16, arg: u32) -> Result<(), StubError> {
        self.wait_action_poll()?;
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&ACTION_MODSTACK.to_be_bytes());
        block[2..4].copy_from_slice(&mode.to_be_bytes());
        block[4..8].copy_from_slice(&arg.to_be_bytes());
        self.send_action(&block);
        Ok(())
    }

    fn lookup(&self, src: &str) -> PathLookup {
        dospath::path_lookup(
            &self.root,
            &self.current_path,
            self.current_drv == self.gemdos_drv,
            self.gemdos_drv,
            src,
        )
    }

    /* ---- GEMDOS calls ----------------------------------------------- */

    fn fsetdta(&mut self, addr: u32) -> Result<(), StubError> {
        if addr == self.dta_addr {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let data = self.read_memory(addr, DTA_SIZE as u16)?;
        let n = data.len().min(DTA_SIZE);
        self.dta[..n].copy_from_slice(&data[..n]);
        self.dta_addr = addr;
        log::trace!("Fsetdta({:#x})", addr);
        self.fallback()
    }

    fn dfree(&mut self, diskinfo_addr: u32, drive: u16) -> Result<(), StubError> {
        log::trace!("Dfree({:#x},{})", diskinfo_addr, drive);
        let ours = if drive == 0 {
            self.current_drv == self.gemdos_drv
        }
        else {
            drive as u32 - 1 == self.gemdos_drv
        };
        if !ours {
            self.no_action();
            return Ok(());
        }
        self.action_required();

        let cpath = std::ffi::CString::new(self.root.as_os_str().as_bytes()).unwrap();
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) } != 0 {
            return self.ret(EINTRN);
        }
        // limit free space to a positive signed 32-bit byte count
        let max = 0x7FFF_FFFF / vfs.f_bsize as u64;
        let free = (vfs.f_bfree as u64).min(max);
        let mut diskinfo = [0u8; 16];
        diskinfo[0..4].copy_from_slice(&(free as u32).to_be_bytes());
        diskinfo[4..8].copy_from_slice(&(vfs.f_blocks as u32).to_be_bytes());
        diskinfo[8..12].copy_from_slice(&512u32.to_be_bytes());
        diskinfo[12..16].copy_from_slice(&((vfs.f_bsize as u32) / 512).to_be_bytes());
        self.write_memory(&diskinfo, diskinfo_addr)?;
        self.ret(0)
    }

    fn dcreate(&mut self, pname: u32) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Dcreate(\"{}\")", name);
        match self.lookup(&name) {
            PathLookup::NotOurDrive => self.fallback(),
            PathLookup::Invalid => self.ret(EPTHNF),
            PathLookup::Directory(_) | PathLookup::File(_) => self.ret(EACCDN),
            PathLookup::Missing(p) => match std::fs::create_dir(&p) {
                Ok(()) => self.ret(0),
                Err(_) => self.ret(EACCDN),
            },
        }
    }

    fn ddelete(&mut self, pname: u32) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Ddelete(\"{}\")", name);
        match self.lookup(&name) {
            PathLookup::NotOurDrive => self.fallback(),
            PathLookup::Directory(p) => match std::fs::remove_dir(&p) {
                Ok(()) => self.ret(0),
                Err(_) => self.ret(EACCDN),
            },
            _ => self.ret(EPTHNF),
        }
    }

    fn dsetpath(&mut self, ppath: u32) -> Result<(), StubError> {
        self.action_required();
        let path = self.read_string(ppath)?;
        log::trace!("Dsetpath(\"{}\")", path);
        if self.current_drv == self.gemdos_drv {
            if let PathLookup::Directory(p) = self.lookup(&path) {
                self.current_path = p;
            }
        }
        // the ROM tracks the directory as well
        self.fallback()
    }

    fn dgetpath(&mut self, buf_addr: u32, drive: u16) -> Result<(), StubError> {
        log::trace!("Dgetpath({:#x},{})", buf_addr, drive);
        let ours = if drive == 0 {
            self.current_drv == self.gemdos_drv
        }
        else {
            drive as u32 - 1 == self.gemdos_drv
        };
        if !ours {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let mut dos = dospath::host_to_dos(&self.root, &self.current_path).into_bytes();
        dos.push(0);
        self.write_memory(&dos, buf_addr)?;
        self.ret(0)
    }

    fn fcreate(&mut self, pname: u32, attr: u16) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Fcreate(\"{}\",{:#x})", name, attr);
        let target = match self.lookup(&name) {
            PathLookup::NotOurDrive => return self.fallback(),
            PathLookup::Invalid => return self.ret(EPTHNF),
            PathLookup::Directory(_) => return self.ret(EACCDN),
            PathLookup::File(p) | PathLookup::Missing(p) => p,
        };
        match File::options().write(true).create(true).truncate(true).open(&target) {
            Ok(file) => {
                let handle = HANDLE_BASE as i32 + file.as_raw_fd();
                self.files.insert(file.as_raw_fd(), file);
                self.ret(handle)
            }
            Err(_) => self.ret(EACCDN),
        }
    }

    fn fopen(&mut self, pname: u32, mode: u16) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Fopen(\"{}\",{})", name, mode);
        let target = match self.lookup(&name) {
            PathLookup::NotOurDrive => return self.fallback(),
            PathLookup::Invalid => return self.ret(EPTHNF),
            PathLookup::Directory(_) | PathLookup::Missing(_) => return self.ret(EFILNF),
            PathLookup::File(p) => p,
        };
        if mode & 7 > 2 {
            return self.ret(EACCDN);
        }
        let mut options = File::options();
        match mode & 7 {
            0 => options.read(true),
            1 => options.write(true),
            _ => options.read(true).write(true),
        };
        match options.open(&target) {
            Ok(file) => {
                let handle = HANDLE_BASE as i32 + file.as_raw_fd();
                self.files.insert(file.as_raw_fd(), file);
                self.ret(handle)
            }
            Err(_) => self.ret(EFILNF),
        }
    }

    fn fclose(&mut self, handle: u16) -> Result<(), StubError> {
        log::trace!("Fclose({})", handle);
        if handle < HANDLE_BASE {
            // the ROM keeps its own handles
            self.no_action();
            return Ok(());
        }
        self.action_required();
        match self.files.remove(&((handle - HANDLE_BASE) as i32)) {
            Some(file) => {
                drop(file);
                self.ret(0)
            }
            None => self.ret(EIHNDL),
        }
    }

    fn fread(&mut self, handle: u16, mut length: u32, mut addr: u32) -> Result<(), StubError> {
        log::trace!("Fread({},{},{:#x})", handle, length, addr);
        if handle < HANDLE_BASE {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let fd = (handle - HANDLE_BASE) as i32;
        if !self.files.contains_key(&fd) {
            return self.ret(EIHNDL);
        }
        let mut nread: i32 = 0;
        let mut chunk = vec![0u8; MEM_BLKSZ];
        while length > 0 {
            let n = (length as usize).min(MEM_BLKSZ);
            let rdb = match self.files.get_mut(&fd).unwrap().read(&mut chunk[..n]) {
                Ok(0) => break, // end of file
                Ok(rdb) => rdb,
                Err(_) => return self.ret(EINTRN),
            };
            self.write_memory(&chunk[..rdb], addr)?;
            nread += rdb as i32;
            addr += rdb as u32;
            length -= rdb as u32;
        }
        self.ret(nread)
    }

    fn fwrite(&mut self, handle: u16, mut length: u32, mut addr: u32) -> Result<(), StubError> {
        log::trace!("Fwrite({},{},{:#x})", handle, length, addr);
        if handle < HANDLE_BASE {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let fd = (handle - HANDLE_BASE) as i32;
        if !self.files.contains_key(&fd) {
            return self.ret(EIHNDL);
        }
        let mut written: i32 = 0;
        while length > 0 {
            let n = (length as usize).min(MEM_BLKSZ);
            let data = self.read_memory(addr, n as u16)?;
            let data = &data[..n.min(data.len())];
            if self.files.get_mut(&fd).unwrap().write_all(data).is_err() {
                return self.ret(EINTRN);
            }
            written += data.len() as i32;
            addr += n as u32;
            length -= n as u32;
        }
        self.ret(written)
    }

    fn fseek(&mut self, offset: i32, handle: u16, mode: u16) -> Result<(), StubError> {
        log::trace!("Fseek({},{},{})", offset, handle, mode);
        if handle < HANDLE_BASE {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let fd = (handle - HANDLE_BASE) as i32;
        let Some(file) = self.files.get_mut(&fd) else {
            return self.ret(EIHNDL);
        };
        let pos = match mode {
            0 => SeekFrom::Start(offset.max(0) as u64),
            1 => SeekFrom::Current(offset as i64),
            2 => SeekFrom::End(offset as i64),
            _ => return self.ret(EACCDN),
        };
        match file.seek(pos) {
            Ok(off) => self.ret(off as i32),
            Err(_) => self.ret(EINTRN),
        }
    }

    fn fdelete(&mut self, pname: u32) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Fdelete(\"{}\")", name);
        match self.lookup(&name) {
            PathLookup::NotOurDrive => self.fallback(),
            PathLookup::File(p) => match std::fs::remove_file(&p) {
                Ok(()) => self.ret(0),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => self.ret(EACCDN),
                Err(_) => self.ret(EFILNF),
            },
            _ => self.ret(EFILNF),
        }
    }

    fn frename(&mut self, poldname: u32, pnewname: u32) -> Result<(), StubError> {
        self.action_required();
        let oldname = self.read_string(poldname)?;
        let newname = self.read_string(pnewname)?;
        log::trace!("Frename(\"{}\",\"{}\")", oldname, newname);
        let from = match self.lookup(&oldname) {
            PathLookup::NotOurDrive => return self.fallback(),
            PathLookup::File(p) | PathLookup::Directory(p) => p,
            _ => return self.ret(EFILNF),
        };
        let to = match self.lookup(&newname) {
            PathLookup::NotOurDrive => return self.ret(ENSAME),
            PathLookup::Missing(p) => p,
            PathLookup::Invalid => return self.ret(EPTHNF),
            _ => return self.ret(EACCDN),
        };
        match std::fs::rename(&from, &to) {
            Ok(()) => self.ret(0),
            Err(_) => self.ret(EACCDN),
        }
    }

    fn fattrib(&mut self, pname: u32, wflag: u16, attrib: u16) -> Result<(), StubError> {
        self.action_required();
        let name = self.read_string(pname)?;
        log::trace!("Fattrib(\"{}\",{},{})", name, wflag, attrib);
        match self.lookup(&name) {
            PathLookup::NotOurDrive => self.fallback(),
            PathLookup::File(p) => {
                if wflag == 1 {
                    let md = match std::fs::metadata(&p) {
                        Ok(md) => md,
                        Err(_) => return self.ret(EFILNF),
                    };
                    let mut perms = md.permissions();
                    perms.set_readonly(attrib & FA_READONLY != 0);
                    if std::fs::set_permissions(&p, perms).is_err() {
                        return self.ret(EACCDN);
                    }
                }
                match std::fs::metadata(&p) {
                    Ok(md) => {
                        let mut out = 0;
                        if md.permissions().readonly() {
                            out |= FA_READONLY as i32;
                        }
                        self.ret(out)
                    }
                    Err(_) => self.ret(EFILNF),
                }
            }
            PathLookup::Directory(_) => self.ret(FA_DIR as i32),
            _ => self.ret(EFILNF),
        }
    }

    fn fdatime(&mut self, ptr: u32, handle: u16, wflag: u16) -> Result<(), StubError> {
        log::trace!("Fdatime({:#x},{},{})", ptr, handle, wflag);
        if handle < HANDLE_BASE {
            self.no_action();
            return Ok(());
        }
        self.action_required();
        let fd = (handle - HANDLE_BASE) as i32;
        let Some(file) = self.files.get(&fd) else {
            return self.ret(EIHNDL);
        };
        if wflag == 0 {
            let mtime = file
                .metadata()
                .ok()
                .and_then(|md| md.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let (time, date) = dospath::unix_to_dos_datetime(mtime, self.tz_hours);
            let mut out = [0u8; 4];
            out[0..2].copy_from_slice(&time.to_be_bytes());
            out[2..4].copy_from_slice(&date.to_be_bytes());
            self.write_memory(&out, ptr)?;
            self.ret(0)
        }
        else {
            let data = self.read_memory(ptr, 4)?;
            if data.len() < 4 {
                return Err(StubError::Protocol);
            }
            let time = be16(&data[0..]);
            let date = be16(&data[2..]);
            let mtime = dospath::dos_to_unix_datetime(time, date, self.tz_hours);
            let times = [
                libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
                libc::timespec { tv_sec: mtime as libc::time_t, tv_nsec: 0 },
            ];
            let rv = unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) };
            if rv != 0 {
                return self.ret(EACCDN);
            }
            self.ret(0)
        }
    }

    /* ---- Fsfirst / Fsnext ------------------------------------------- */

    fn insert_search(&mut self, ctx: SearchContext) -> usize {
        if let Some(i) = self.searches.iter().position(Option::is_none) {
            self.searches[i] = Some(ctx);
            return i;
        }
        if self.searches.len() < SEARCH_TABLE_MAX {
            self.searches.push(Some(ctx));
            return self.searches.len() - 1;
        }
        // table full: recycle round-robin; abandoned searches are the
        // common cause
        let i = self.search_evict % self.searches.len();
        self.search_evict = self.search_evict.wrapping_add(1);
        self.searches[i] = Some(ctx);
        i
    }

    fn fsfirst(&mut self, pname: u32, attr: u16) -> Result<(), StubError> {
        self.action_required();
        let full = self.read_string(pname)?;
        log::trace!("Fsfirst(\"{}\",{})", full, attr);

        // separate the pattern from the directory part
        let (path, pattern) = match full.rfind('\\') {
            Some(i) => (&full[..i], &full[i + 1..]),
            None => ("", full.as_str()),
        };

        let dir = match self.lookup(path) {
            PathLookup::NotOurDrive => return self.fallback(),
            PathLookup::Directory(p) => p,
            _ => return self.ret(EFILNF),
        };
        let rd = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(_) => return self.ret(EFILNF),
        };
        // ReadDir never yields the dot directories, but the guest's file
        // selectors navigate with them. ".." stays inside the virtual drive.
        let mut dots: Vec<&'static str> = Vec::new();
        if attr & FA_DIR != 0 {
            if dir != self.root {
                dots.push("..");
            }
            dots.push(".");
        }
        let ctx = SearchContext { dir: rd, path: dir, pattern: pattern.to_string(), attr, dots };
        let idx = self.insert_search(ctx) as u32;

        // frame the search slot index with the magic tags so Fsnext can
        // recover and validate it
        self.dta[0..4].copy_from_slice(DTA_TAG);
        self.dta[4..8].copy_from_slice(&idx.to_be_bytes());
        self.dta[8..12].fill(0);
        self.dta[12..16].copy_from_slice(DTA_TAG);
        let head: [u8; 16] = self.dta[0..16].try_into().unwrap();
        self.write_memory(&head, self.dta_addr)?;

        self.next_file(true)
    }

    fn fsnext(&mut self) -> Result<(), StubError> {
        log::trace!("Fsnext()");
        self.action_required();
        self.next_file(false)
    }

    fn next_file(&mut self, first: bool) -> Result<(), StubError> {
        if &self.dta[0..4] != DTA_TAG || &self.dta[12..16] != DTA_TAG {
            return self.fallback();
        }
        let idx = be32(&self.dta[4..8]) as usize;
        if self.searches.get(idx).map(|s| s.is_none()).unwrap_or(true) {
            return self.fallback();
        }

        loop {
            let ctx = self.searches[idx].as_mut().unwrap();

            // the dot pseudo-entries precede the real listing; a raw
            // directory read would have produced them
            if let Some(name) = ctx.dots.pop() {
                if !dospath::match_dos_pattern(&ctx.pattern, name) {
                    continue;
                }
                let md = match std::fs::metadata(ctx.path.join(name)) {
                    Ok(md) => md,
                    Err(_) => continue,
                };
                return self.emit_dta_entry(name, &md, true);
            }

            let entry = match ctx.dir.next() {
                None => {
                    // end of directory: tear the search down
                    self.searches[idx] = None;
                    self.dta[0..16].fill(0);
                    let head: [u8; 16] = self.dta[0..16].try_into().unwrap();
                    self.write_memory(&head, self.dta_addr)?;
                    return self.ret(if first { EFILNF } else { ENMFIL });
                }
                Some(Err(_)) => continue,
                Some(Ok(e)) => e,
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if !dospath::match_dos_pattern(&ctx.pattern, &name) {
                continue;
            }
            let ftype = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let matched = if ftype.is_dir() { ctx.attr & FA_DIR != 0 } else { ftype.is_file() };
            if !matched || !dospath::is_8_3(&name) {
                continue;
            }

            let md = match entry.metadata() {
                Ok(md) => md,
                Err(_) => continue,
            };
            return self.emit_dta_entry(&name, &md, ftype.is_dir());
        }
    }

    /// Fill the cached DTA with one directory entry and ship it to the
    /// guest, ending the call with a zero return.
    fn emit_dta_entry(&mut self, name: &str, md: &std::fs::Metadata, is_dir: bool) -> Result<(), StubError> {
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let (time, date) = dospath::unix_to_dos_datetime(mtime, self.tz_hours);

        self.dta[21] = if is_dir { FA_DIR as u8 } else { 0 };
        self.dta[22..24].copy_from_slice(&time.to_be_bytes());
        self.dta[24..26].copy_from_slice(&date.to_be_bytes());
        self.dta[26..30].copy_from_slice(&(md.len() as u32).to_be_bytes());
        self.dta[30..44].fill(0);
        let upper = name.to_uppercase();
        let n = upper.len().min(13);
        self.dta[30..30 + n].copy_from_slice(&upper.as_bytes()[..n]);

        // ship attrib/time/date/size/name and have the call return 0
        let tail: Vec<u8> = self.dta[20..44].to_vec();
        self.write_memory0(&tail, self.dta_addr + 20)
    }

    /* ---- Pexec ------------------------------------------------------ */

    fn pexec(&mut self, mode: u16, pname: u32, pcmdline: u32, penv: u32) -> Result<(), StubError> {
        log::trace!("Pexec({},{:#x},{:#x},{:#x})", mode, pname, pcmdline, penv);
        self.action_required();
        match mode {
            0 | 3 => self.pexec_load(mode, pname, pcmdline, penv),
            4 | 6 => {
                // a new process starts running: its DTA is reset to
                // basepage+0x80
                self.dta_addr = pcmdline + 0x80;
                self.dta[0..16].fill(0);
                self.fallback()
            }
            _ => self.fallback(),
        }
    }

    fn pexec_load(&mut self, mode: u16, pname: u32, pcmdline: u32, penv: u32) -> Result<(), StubError> {
        let name = self.read_string(pname)?;
        log::trace!("Pexec load \"{}\"", name);
        let host = match self.lookup(&name) {
            PathLookup::NotOurDrive => return self.fallback(),
            PathLookup::Invalid => return self.ret(EPTHNF),
            PathLookup::File(p) => p,
            _ => return self.ret(EFILNF),
        };
        let prg = match PrgFile::load(&host) {
            Ok(prg) => prg,
            Err(crate::prg::PrgError::Io(_)) => return self.ret(EFILNF),
            Err(_) => return self.ret(EPLFMT),
        };

        // have the guest allocate the TPA and build the base page
        let bp = self.inner_pexec5(pcmdline, penv)?;
        if bp < 0 {
            return self.ret(bp);
        }
        let base = bp as u32;
        let text = base + 0x100;

        // fetch the fresh basepage and fill in the segment fields
        let mut page = self.read_memory(base, 256)?;
        if page.len() < 256 {
            return Err(StubError::Protocol);
        }
        page.truncate(256);
        page[8..12].copy_from_slice(&text.to_be_bytes());
        page[12..16].copy_from_slice(&prg.tsize.to_be_bytes());
        page[16..20].copy_from_slice(&(text + prg.tsize).to_be_bytes());
        page[20..24].copy_from_slice(&prg.dsize.to_be_bytes());
        page[24..28].copy_from_slice(&(text + prg.tsize + prg.dsize).to_be_bytes());
        page[28..32].copy_from_slice(&prg.bsize.to_be_bytes());

        // stream basepage, relocated image and cleared BSS contiguously
        let mut stream = page;
        stream.extend_from_slice(&prg.relocated(text));
        stream.resize(256 + prg.image_len() + prg.bsize as usize, 0);
        let mut addr = base;
        for chunk in stream.chunks(MEM_BLKSZ) {
            self.write_memory(chunk, addr)?;
            addr += chunk.len() as u32;
        }

        if mode == 0 {
            // turn the original call into Pexec(4) on the new basepage; the
            // ROM then launches the child
            self.modstack_pexec(4, base)
        }
        else {
            self.ret(bp)
        }
    }

    /* ---- driver bootstrap ------------------------------------------- */

    fn drive_init(&mut self, begin: u32, resblk: u32) -> Result<(), StubError> {
        self.action_required();
        let drvbits = self.read_long(0x4C2)?;
        log::info!("driver init, begin:{:#x} resblk:{:#x} drvbits:{:#x}", begin, resblk, drvbits);
        let mut drv = 2;
        while drvbits & (1 << drv) != 0 {
            drv += 1;
        }
        self.gemdos_drv = drv;
        self.write_long(0x4C2, drvbits | 1 << drv)?;
        println!("GEMDOS drive installed as drive {}:", (b'A' + drv as u8) as char);
        self.fallback()
    }
}
