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

    irq.rs

    The interrupt thread: waits on the UIO descriptor, latches the status
    word once per event and dispatches the floppy, ACSI and MIDI handlers
    in that order.
*/

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::{
    acsi::AcsiBus,
    devwindow::{DeviceWindow, FloppyStatus, IrqWait, STATUS_RESERVED_MASK},
    floppy::FloppyDrives,
    midi::MidiBridge,
};

/// Poll budget so shutdown is observed promptly.
const POLL_BUDGET_MS: i32 = 5;

pub struct IrqService {
    pub win: Arc<DeviceWindow>,
    pub drives: Arc<Mutex<FloppyDrives>>,
    pub bus: AcsiBus,
    pub midi: Arc<MidiBridge>,
    pub shutdown: Arc<AtomicBool>,
}

impl IrqService {
    /// Interrupt thread body.
    pub fn run(mut self) {
        set_realtime_priority();

        if !self.win.rearm() {
            return;
        }
        loop {
            match self.win.wait_interrupt(POLL_BUDGET_MS) {
                IrqWait::Timeout => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                IrqWait::Gone => break,
                IrqWait::Event => {}
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !self.win.rearm() {
                break;
            }

            // one coherent snapshot per event; bits raised during handler
            // execution arrive with the next event
            let status = self.win.status();
            if status & STATUS_RESERVED_MASK != 0 {
                log::warn!("status read error: {:#010x}", status);
                continue;
            }
            let status = FloppyStatus::from(status);
            if status.floppy_intr() {
                self.drives.lock().unwrap().on_event(&self.win, status);
            }
            if status.hdd_drq() {
                self.bus.on_interrupt(&self.win);
            }
            if status.midi_intr() {
                self.midi.on_interrupt(&self.win);
            }
        }

        // flush pending floppy write-back before the images close
        self.drives.lock().unwrap().sync();
        log::info!("interrupt thread stopped");
    }
}

/// The interrupt thread preempts everything else on the host.
fn set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 1 };
    let rv = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rv != 0 {
        log::warn!("SCHED_FIFO unavailable: {}", std::io::Error::from_raw_os_error(rv));
    }
}
