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

    midi.rs

    MIDI I/O management: bridges ALSA raw MIDI character devices and the
    ACIA register in the device window, in both directions.
*/

#![allow(dead_code)]

use std::{
    fs::File,
    io::{Read, Write},
    os::fd::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::devwindow::{DeviceWindow, MIDI_RX_FULL, MIDI_TX_FULL};

const SND_DEV_DIR: &str = "/dev/snd";

struct MidiPorts {
    input: Option<File>,
    output: Option<File>,
}

fn open_port(leaf: Option<&str>) -> Option<File> {
    let leaf = leaf?;
    let path: PathBuf = [SND_DEV_DIR, leaf].iter().collect();
    match File::options().read(true).write(true).open(&path) {
        Ok(f) => Some(f),
        Err(e) => {
            log::error!("could not open MIDI device `{}`: {}", path.display(), e);
            None
        }
    }
}

pub struct MidiBridge {
    ports: Mutex<MidiPorts>,
}

impl MidiBridge {
    pub fn new(midi_in: Option<&str>, midi_out: Option<&str>) -> MidiBridge {
        MidiBridge {
            ports: Mutex::new(MidiPorts { input: open_port(midi_in), output: open_port(midi_out) }),
        }
    }

    /// Replace the port bindings. Cooperates with the poll loop, which
    /// re-reads the descriptor on every iteration.
    pub fn update_ports(&self, midi_in: Option<&str>, midi_out: Option<&str>) {
        let mut ports = self.ports.lock().unwrap();
        ports.input = open_port(midi_in);
        ports.output = open_port(midi_out);
    }

    /// Called from the interrupt thread when the ACIA flag is raised: if a
    /// character is pending in the transmit register, forward it out.
    pub fn on_interrupt(&self, win: &DeviceWindow) {
        let st = win.midi_read();
        if st & MIDI_TX_FULL != 0 {
            let v = (st & 0xFF) as u8;
            if let Some(out) = &mut self.ports.lock().unwrap().output {
                let _ = out.write_all(&[v]);
            }
        }
    }

    /// Push one character toward the ACIA receive register, draining any
    /// transmit bytes that show up while the register is busy.
    fn send(&self, win: &DeviceWindow, c: u8) {
        loop {
            let st = win.midi_read();
            if st & MIDI_TX_FULL != 0 {
                let v = (st & 0xFF) as u8;
                if let Some(out) = &mut self.ports.lock().unwrap().output {
                    let _ = out.write_all(&[v]);
                }
            }
            if st & MIDI_RX_FULL == 0 {
                break;
            }
        }
        win.midi_write(c as u32);
    }

    /// MIDI thread body: poll the input device and shovel received bytes
    /// into the ACIA one at a time.
    pub fn run(self: Arc<Self>, win: Arc<DeviceWindow>, shutdown: Arc<AtomicBool>) {
        let mut buf = [0u8; 1024];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let fd = match self.ports.lock().unwrap().input.as_ref() {
                Some(f) => f.as_raw_fd(),
                None => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    continue;
                }
            };
            let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
            let status = unsafe { libc::poll(&mut pfd, 1, 5) };
            if status == -1 {
                log::error!("MIDI interface: {}", std::io::Error::last_os_error());
                break;
            }
            if status == 0 {
                continue;
            }
            let n = {
                let mut ports = self.ports.lock().unwrap();
                match ports.input.as_mut() {
                    Some(f) => f.read(&mut buf).unwrap_or(0),
                    None => 0,
                }
            };
            for &b in &buf[..n] {
                self.send(&win, b);
            }
        }
        log::info!("MIDI thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_forwards_pending_transmit_byte() {
        let win = DeviceWindow::memory_backed();
        let bridge = MidiBridge::new(None, None);
        // transmit register full with 0x42: no output port, must not panic
        win.midi_write(MIDI_TX_FULL | 0x42);
        bridge.on_interrupt(&win);
    }

    #[test]
    fn send_places_byte_in_register() {
        let win = DeviceWindow::memory_backed();
        let bridge = MidiBridge::new(None, None);
        bridge.send(&win, 0x90);
        assert_eq!(win.midi_read() & 0xFF, 0x90);
    }
}
