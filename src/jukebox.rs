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

    jukebox.rs

    Background floppy rotation: every timeout period, pick an image from
    the jukebox directory, insert it in drive A and cold-reset the machine.
*/

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::{
    config::{Config, JukeboxMode},
    devwindow::DeviceWindow,
    floppy::FloppyDrives,
};

/// Accept the floppy image formats the codec understands.
pub fn is_floppy_image(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    ext.eq_ignore_ascii_case("st") || ext.eq_ignore_ascii_case("msa") || ext.eq_ignore_ascii_case("mfm")
}

/// All floppy images in the jukebox directory, in name order.
fn scan_images(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_floppy_image(p))
            .collect(),
        Err(e) => {
            log::error!("error reading jukebox directory `{}`: {}", dir.display(), e);
            Vec::new()
        }
    };
    entries.sort();
    entries
}

pub struct Jukebox {
    pub win: Arc<DeviceWindow>,
    pub drives: Arc<Mutex<FloppyDrives>>,
    pub config: Arc<Config>,
    pub shutdown: Arc<AtomicBool>,
}

impl Jukebox {
    /// Jukebox thread body. Only spawned when the jukebox is enabled and a
    /// directory is configured.
    pub fn run(self) {
        let Some(dir) = self.config.jukebox.path.clone() else {
            return;
        };
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        let mut rng = Pcg32::seed_from_u64(seed);
        let period = Duration::from_secs(self.config.jukebox.timeout.max(1));
        let mut ordered_idx = 0usize;
        // boot the first image right away
        let mut deadline = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
            if Instant::now() < deadline {
                continue;
            }
            let images = scan_images(&dir);
            if images.is_empty() {
                deadline = Instant::now() + Duration::from_secs(1);
                continue;
            }
            let pick = match self.config.jukebox.mode {
                JukeboxMode::Random => rng.gen_range(0..images.len()),
                JukeboxMode::Ordered => {
                    ordered_idx = (ordered_idx + 1) % images.len();
                    ordered_idx
                }
            };
            let image = &images[pick];
            log::info!("booting `{}`", image.display());
            self.drives.lock().unwrap().change_floppy(Some(image), 0);
            self.win.cold_reset(self.config.main.mem_size.code(), self.config.main.turbo);
            deadline = Instant::now() + period;
        }
        log::info!("jukebox thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn filter_accepts_floppy_extensions() {
        assert!(is_floppy_image(Path::new("/x/game.st")));
        assert!(is_floppy_image(Path::new("/x/game.MSA")));
        assert!(is_floppy_image(Path::new("/x/dump.Mfm")));
        assert!(!is_floppy_image(Path::new("/x/hd.img")));
        assert!(!is_floppy_image(Path::new("/x/noext")));
    }

    #[test]
    fn scan_returns_sorted_images_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.msa"), b"").unwrap();
        std::fs::write(dir.path().join("a.st"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub.st")).unwrap();

        let images = scan_images(dir.path());
        let names: Vec<_> =
            images.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["a.st", "b.msa"]);
    }
}
