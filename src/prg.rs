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

    prg.rs

    GEMDOS executable (PRG) parsing and relocation for the Pexec loader.
*/

#![allow(dead_code)]

use std::path::Path;

use thiserror::Error;

const PRG_MAGIC: u16 = 0x601A;
const HEADER_LEN: usize = 28;

#[derive(Debug, Error)]
pub enum PrgError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a GEMDOS executable")]
    BadMagic,
    #[error("executable is truncated")]
    Truncated,
    #[error("relocation offset out of range")]
    BadReloc,
}

/// A parsed GEMDOS executable: the text+data image plus the fixup offsets
/// from its relocation table.
pub struct PrgFile {
    pub tsize: u32,
    pub dsize: u32,
    pub bsize: u32,
    pub flags: u32,
    image: Vec<u8>,
    relocs: Vec<u32>,
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

impl PrgFile {
    pub fn load(path: &Path) -> Result<PrgFile, PrgError> {
        let raw = std::fs::read(path)?;
        if raw.len() < HEADER_LEN {
            return Err(PrgError::Truncated);
        }
        if be16(&raw[0..]) != PRG_MAGIC {
            return Err(PrgError::BadMagic);
        }
        let tsize = be32(&raw[2..]);
        let dsize = be32(&raw[6..]);
        let bsize = be32(&raw[10..]);
        let ssize = be32(&raw[14..]);
        let flags = be32(&raw[22..]);
        let absflag = be16(&raw[26..]);

        let image_len = (tsize + dsize) as usize;
        let image_start = HEADER_LEN;
        if raw.len() < image_start + image_len {
            return Err(PrgError::Truncated);
        }
        let image = raw[image_start..image_start + image_len].to_vec();

        let mut relocs = Vec::new();
        if absflag == 0 {
            // the relocation table follows the symbol table
            let mut pos = image_start + image_len + ssize as usize;
            if pos + 4 <= raw.len() {
                let first = be32(&raw[pos..]);
                pos += 4;
                if first != 0 {
                    let mut off = first;
                    if off as usize + 4 > image_len {
                        return Err(PrgError::BadReloc);
                    }
                    relocs.push(off);
                    loop {
                        let Some(&b) = raw.get(pos) else {
                            return Err(PrgError::Truncated);
                        };
                        pos += 1;
                        match b {
                            0 => break,
                            // 1 only advances the offset, with no fixup
                            1 => off += 254,
                            n => {
                                off += n as u32;
                                if off as usize + 4 > image_len {
                                    return Err(PrgError::BadReloc);
                                }
                                relocs.push(off);
                            }
                        }
                    }
                }
            }
        }

        Ok(PrgFile { tsize, dsize, bsize, flags, image, relocs })
    }

    pub fn image_len(&self) -> usize {
        self.image.len()
    }

    /// Return the text+data image relocated to run at `base`.
    pub fn relocated(&self, base: u32) -> Vec<u8> {
        let mut out = self.image.clone();
        for &off in &self.relocs {
            let off = off as usize;
            let v = be32(&out[off..]).wrapping_add(base);
            out[off..off + 4].copy_from_slice(&v.to_be_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn build_prg(
        dir: &TempDir,
        text: &[u8],
        data: &[u8],
        bsize: u32,
        relocs: &[u8],
    ) -> std::path::PathBuf {
        let path = dir.path().join("test.prg");
        let mut f = std::fs::File::create(&path).unwrap();
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&PRG_MAGIC.to_be_bytes());
        header[2..6].copy_from_slice(&(text.len() as u32).to_be_bytes());
        header[6..10].copy_from_slice(&(data.len() as u32).to_be_bytes());
        header[10..14].copy_from_slice(&bsize.to_be_bytes());
        f.write_all(&header).unwrap();
        f.write_all(text).unwrap();
        f.write_all(data).unwrap();
        f.write_all(relocs).unwrap();
        path
    }

    #[test]
    fn parses_sizes() {
        let dir = TempDir::new().unwrap();
        let path = build_prg(&dir, &[0u8; 64], &[0u8; 32], 128, &0u32.to_be_bytes());
        let prg = PrgFile::load(&path).unwrap();
        assert_eq!(prg.tsize, 64);
        assert_eq!(prg.dsize, 32);
        assert_eq!(prg.bsize, 128);
        assert_eq!(prg.image_len(), 96);
    }

    #[test]
    fn relocates_fixup_chain() {
        let dir = TempDir::new().unwrap();
        let mut text = vec![0u8; 300];
        text[4..8].copy_from_slice(&0x100u32.to_be_bytes());
        text[260..264].copy_from_slice(&0x200u32.to_be_bytes());
        // first fixup at 4, then advance 254 (no fixup) and 2 more
        let mut table = Vec::new();
        table.extend_from_slice(&4u32.to_be_bytes());
        table.extend_from_slice(&[1, 2, 0]);
        let path = build_prg(&dir, &text, &[], 0, &table);

        let prg = PrgFile::load(&path).unwrap();
        let out = prg.relocated(0x2_0000);
        assert_eq!(be32(&out[4..]), 0x2_0100);
        assert_eq!(be32(&out[260..]), 0x2_0200);
        // unrelocated words are untouched
        assert_eq!(be32(&out[8..]), 0);
    }

    #[test]
    fn zero_first_offset_means_no_relocation() {
        let dir = TempDir::new().unwrap();
        let path = build_prg(&dir, &[0xAAu8; 16], &[], 0, &0u32.to_be_bytes());
        let prg = PrgFile::load(&path).unwrap();
        assert_eq!(prg.relocated(0x4000), vec![0xAAu8; 16]);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not.prg");
        std::fs::write(&path, [0u8; 64]).unwrap();
        assert!(matches!(PrgFile::load(&path), Err(PrgError::BadMagic)));
    }

    #[test]
    fn rejects_out_of_range_fixup() {
        let dir = TempDir::new().unwrap();
        let mut table = Vec::new();
        table.extend_from_slice(&200u32.to_be_bytes());
        table.push(0);
        let path = build_prg(&dir, &[0u8; 16], &[], 0, &table);
        assert!(matches!(PrgFile::load(&path), Err(PrgError::BadReloc)));
    }
}
