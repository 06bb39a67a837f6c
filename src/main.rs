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

    main.rs

    Program lifecycle: configuration, device window acquisition, thread
    spawn and ordered shutdown.
*/

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::Context;

mod acsi;
mod config;
mod devwindow;
mod dospath;
mod floppy;
mod floppy_img;
mod gdboot;
mod gemdos;
mod irq;
mod jukebox;
mod midi;
mod prg;

use acsi::{AcsiBus, DmaEngine};
use config::Config;
use devwindow::DeviceWindow;
use floppy::FloppyDrives;
use gemdos::{GemdosDispatcher, StubLink};
use irq::IrqService;
use jukebox::Jukebox;
use midi::MidiBridge;

// Signal handlers cannot capture state; this is the one process-wide flag.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = config::cmd_args().run();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("can't load `{}`: {}; using defaults", args.config.display(), e);
            Config::default()
        }
    };
    let config = Arc::new(config);

    // the register window is the only resource whose absence is fatal
    let win = Arc::new(
        DeviceWindow::acquire(&args.uio)
            .with_context(|| format!("acquiring device window at {}", args.uio.display()))?,
    );
    win.apply_setup(config.main.mem_size.code(), config.main.turbo);

    let shutdown = Arc::new(AtomicBool::new(false));

    let drives = Arc::new(Mutex::new(FloppyDrives::new([
        config.floppy.floppy_a_write_protect,
        config.floppy.floppy_b_write_protect,
    ])));
    {
        let mut drives = drives.lock().unwrap();
        if config.floppy.floppy_a_enable {
            drives.change_floppy(config.floppy.floppy_a.as_deref(), 0);
        }
        if config.floppy.floppy_b_enable {
            drives.change_floppy(config.floppy.floppy_b.as_deref(), 1);
        }
    }

    let dma = Arc::new(DmaEngine::new());
    let link = Arc::new(StubLink::new());
    let bus = AcsiBus::new(&config, dma.clone(), link.clone());
    let midi = Arc::new(MidiBridge::new(config.midi.midi_in.as_deref(), config.midi.midi_out.as_deref()));

    let t_gemdos = config.hdd.gemdos.as_ref().map(|_| {
        let dispatcher =
            GemdosDispatcher::new(win.clone(), dma.clone(), link.clone(), shutdown.clone(), &config);
        std::thread::Builder::new()
            .name("gemdos".into())
            .spawn(move || dispatcher.run())
            .expect("spawn gemdos thread")
    });

    let t_midi = {
        let midi = midi.clone();
        let win = win.clone();
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("midi".into())
            .spawn(move || midi.run(win, shutdown))
            .expect("spawn midi thread")
    };

    let t_irq = {
        let service = IrqService {
            win: win.clone(),
            drives: drives.clone(),
            bus,
            midi: midi.clone(),
            shutdown: shutdown.clone(),
        };
        std::thread::Builder::new()
            .name("irq".into())
            .spawn(move || service.run())
            .expect("spawn interrupt thread")
    };

    let t_jukebox = (config.jukebox.enabled && config.jukebox.path.is_some()).then(|| {
        let jukebox = Jukebox {
            win: win.clone(),
            drives: drives.clone(),
            config: config.clone(),
            shutdown: shutdown.clone(),
        };
        std::thread::Builder::new()
            .name("jukebox".into())
            .spawn(move || jukebox.run())
            .expect("spawn jukebox thread")
    });

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    log::info!("zeST host running");
    while !SIGNALLED.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    log::info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);

    if let Some(t) = t_gemdos {
        let _ = t.join();
    }
    let _ = t_midi.join();
    let _ = t_irq.join();
    if let Some(t) = t_jukebox {
        let _ = t.join();
    }

    Ok(())
}
