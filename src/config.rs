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

    config.rs

    Configuration file and command line parsing. The parsed configuration is
    an immutable snapshot; hot paths only ever read it.
*/

use std::path::PathBuf;

use bpaf::Bpaf;
use serde_derive::{Deserialize, Serialize};

const fn _default_true() -> bool {
    true
}

fn _default_jukebox_timeout() -> u64 {
    90
}

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
pub struct CmdArgs {
    /// Configuration file
    #[bpaf(short('c'), long("config"), argument("FILE"), fallback(PathBuf::from("zest.toml")))]
    pub config: PathBuf,

    /// UIO device exposing the FPGA register window
    #[bpaf(long("uio"), argument("DEV"), fallback(PathBuf::from("/dev/uio0")))]
    pub uio: PathBuf,
}

/// FPGA memory-top hint. The fabric maps the guest RAM; the host only
/// forwards the selection.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum MemSize {
    #[serde(rename = "256K")]
    Mem256K,
    #[serde(rename = "512K")]
    Mem512K,
    #[default]
    #[serde(rename = "1M")]
    Mem1M,
    #[serde(rename = "2M")]
    Mem2M,
    #[serde(rename = "2.5M")]
    Mem2_5M,
    #[serde(rename = "4M")]
    Mem4M,
    #[serde(rename = "8M")]
    Mem8M,
    #[serde(rename = "14M")]
    Mem14M,
}

impl MemSize {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MainSection {
    #[serde(default)]
    pub mem_size: MemSize,
    #[serde(default)]
    pub turbo: bool,
    /// Hour offset applied to DOS time conversion, -12..=12.
    #[serde(default)]
    pub timezone: i32,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct FloppySection {
    pub floppy_a: Option<PathBuf>,
    #[serde(default = "_default_true")]
    pub floppy_a_enable: bool,
    #[serde(default)]
    pub floppy_a_write_protect: bool,
    pub floppy_b: Option<PathBuf>,
    #[serde(default)]
    pub floppy_b_enable: bool,
    #[serde(default)]
    pub floppy_b_write_protect: bool,
}

impl Default for FloppySection {
    fn default() -> Self {
        FloppySection {
            floppy_a: None,
            floppy_a_enable: true,
            floppy_a_write_protect: false,
            floppy_b: None,
            floppy_b_enable: false,
            floppy_b_write_protect: false,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HddSection {
    pub acsi0: Option<PathBuf>,
    pub acsi1: Option<PathBuf>,
    pub acsi2: Option<PathBuf>,
    pub acsi3: Option<PathBuf>,
    pub acsi4: Option<PathBuf>,
    pub acsi5: Option<PathBuf>,
    pub acsi6: Option<PathBuf>,
    pub acsi7: Option<PathBuf>,
    /// Host directory exposed through the GEMDOS drive.
    pub gemdos: Option<PathBuf>,
}

impl HddSection {
    pub fn acsi(&self, id: usize) -> Option<&PathBuf> {
        match id {
            0 => self.acsi0.as_ref(),
            1 => self.acsi1.as_ref(),
            2 => self.acsi2.as_ref(),
            3 => self.acsi3.as_ref(),
            4 => self.acsi4.as_ref(),
            5 => self.acsi5.as_ref(),
            6 => self.acsi6.as_ref(),
            7 => self.acsi7.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MidiSection {
    /// Character device leaf names under /dev/snd.
    #[serde(rename = "in")]
    pub midi_in: Option<String>,
    #[serde(rename = "out")]
    pub midi_out: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JukeboxMode {
    #[default]
    Random,
    Ordered,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct JukeboxSection {
    #[serde(default)]
    pub enabled: bool,
    pub path: Option<PathBuf>,
    /// Seconds between image rotations.
    #[serde(default = "_default_jukebox_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub mode: JukeboxMode,
}

impl Default for JukeboxSection {
    fn default() -> Self {
        JukeboxSection {
            enabled: false,
            path: None,
            timeout: _default_jukebox_timeout(),
            mode: JukeboxMode::Random,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub main: MainSection,
    #[serde(default)]
    pub floppy: FloppySection,
    #[serde(default)]
    pub hdd: HddSection,
    #[serde(default)]
    pub midi: MidiSection,
    #[serde(default)]
    pub jukebox: JukeboxSection,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        if !(-12..=12).contains(&config.main.timezone) {
            log::warn!("timezone {} out of range, clamping", config.main.timezone);
            config.main.timezone = config.main.timezone.clamp(-12, 12);
        }
        if config.jukebox.timeout < 1 {
            log::warn!("invalid jukebox timeout, using default");
            config.jukebox.timeout = _default_jukebox_timeout();
        }
        Ok(config)
    }

    /// Serialize the snapshot back to TOML, the form `save` persists.
    #[allow(dead_code)]
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Persist the snapshot, as the settings menu does after edits. The
    /// core loop never writes the configuration.
    #[allow(dead_code)]
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let text = r#"
            [main]
            mem_size = "4M"
            turbo = true
            timezone = 2

            [floppy]
            floppy_a = "/sdcard/games/disk.st"
            floppy_a_write_protect = true
            floppy_b_enable = true

            [hdd]
            acsi0 = "/sdcard/h.img"
            gemdos = "/sdcard/c"

            [midi]
            in = "midiC1D0"
            out = "midiC1D0"

            [jukebox]
            enabled = true
            path = "/sdcard/games"
            timeout = 120
            mode = "ordered"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.main.mem_size, MemSize::Mem4M);
        assert_eq!(cfg.main.mem_size.code(), 5);
        assert!(cfg.main.turbo);
        assert_eq!(cfg.main.timezone, 2);
        assert_eq!(cfg.floppy.floppy_a.as_deref(), Some(std::path::Path::new("/sdcard/games/disk.st")));
        assert!(cfg.floppy.floppy_a_enable);
        assert!(cfg.floppy.floppy_a_write_protect);
        assert!(cfg.floppy.floppy_b_enable);
        assert_eq!(cfg.hdd.acsi(0).unwrap().to_str(), Some("/sdcard/h.img"));
        assert!(cfg.hdd.acsi(1).is_none());
        assert_eq!(cfg.midi.midi_in.as_deref(), Some("midiC1D0"));
        assert_eq!(cfg.jukebox.timeout, 120);
        assert_eq!(cfg.jukebox.mode, JukeboxMode::Ordered);
    }

    #[test]
    fn config_round_trips_through_save() {
        let text = r#"
            [main]
            mem_size = "2.5M"
            turbo = true
            timezone = -3

            [floppy]
            floppy_a = "/sdcard/games/disk.msa"
            floppy_b_enable = true
            floppy_b_write_protect = true

            [hdd]
            acsi0 = "/sdcard/h.img"
            acsi3 = "/sdcard/i.img"
            gemdos = "/sdcard/c"

            [midi]
            in = "midiC0D0"

            [jukebox]
            enabled = true
            path = "/sdcard/games"
            timeout = 45
        "#;
        let cfg: Config = toml::from_str(text).unwrap();

        // the serialized form parses back to an identical snapshot
        let out = cfg.to_toml_string().unwrap();
        let back: Config = toml::from_str(&out).unwrap();
        assert_eq!(back, cfg);

        // and so does a full save/load cycle
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("zest.toml");
        cfg.save(&path).unwrap();
        let back = Config::load(&path).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn empty_config_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.main.mem_size, MemSize::Mem1M);
        assert!(!cfg.main.turbo);
        assert!(cfg.floppy.floppy_a_enable);
        assert!(!cfg.floppy.floppy_b_enable);
        assert!(cfg.hdd.gemdos.is_none());
        assert_eq!(cfg.jukebox.timeout, 90);
    }
}
