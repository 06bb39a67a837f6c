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

    floppy_img.rs

    Floppy disk image codec. Loads raw MFM dumps as-is and synthesizes MFM
    track data from ST and MSA sector images; writes changes back in the
    original file format on sync.
*/

#![allow(dead_code)]

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

/// One MFM-encoded track is always exactly this many bytes.
pub const TRACK_BYTES: usize = 6250;
pub const MAX_TRACKS: usize = 86;
pub const SECTOR_BYTES: usize = 512;

/// Six-byte run that precedes both address marks: three sync zeros and
/// three 0xA1 clock-violation bytes.
const AM_HEAD: [u8; 6] = [0, 0, 0, 0xA1, 0xA1, 0xA1];

const MSA_MAGIC: u16 = 0x0E0F;
const MSA_RLE_ESCAPE: u8 = 0xE5;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("i/o error on image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not determine the floppy image file format")]
    UnknownFormat,
    #[error("not a valid MSA file")]
    BadMagic,
    #[error("partial MSA image starting at track {0} is not supported")]
    PartialMsa(u16),
    #[error("unsupported geometry: {tracks} tracks, {sides} sides, {sectors} sectors")]
    BadGeometry { tracks: usize, sides: usize, sectors: usize },
    #[error("RLE data on track {track} side {side} overruns the track")]
    RleOverrun { track: usize, side: usize },
    #[error("synthesized track {track} side {side} is {len} bytes long")]
    BadTrackLength { track: usize, side: usize, len: usize },
    #[error("sector {sector} not found on track {track} side {side}")]
    SectorNotFound { track: usize, side: usize, sector: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Mfm,
    St,
    Msa,
}

impl ImageFormat {
    fn from_path(path: &Path) -> Option<ImageFormat> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("mfm") {
            Some(ImageFormat::Mfm)
        }
        else if ext.eq_ignore_ascii_case("st") {
            Some(ImageFormat::St)
        }
        else if ext.eq_ignore_ascii_case("msa") {
            Some(ImageFormat::Msa)
        }
        else {
            None
        }
    }
}

// CRC-16/CCITT, polynomial 0x1021. The initial value 0xCDB4 is the CRC of
// the three 0xA1 sync bytes, which are not part of the checked spans.
const fn crc16_table() -> [u16; 256] {
    let mut tab = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut w = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            w = (w << 1) ^ if w & 0x8000 != 0 { 0x1021 } else { 0 };
            j += 1;
        }
        tab[i] = w;
        i += 1;
    }
    tab
}

const CRC16_TAB: [u16; 256] = crc16_table();

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xCDB4;
    for &b in data {
        crc = CRC16_TAB[((crc >> 8) ^ b as u16) as usize] ^ (crc << 8);
    }
    crc
}

fn read_u16_le(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn read_u16_be(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Find the next address-mark lead-in at or after `pos`.
fn find_am(track: &[u8], mut pos: usize) -> Option<usize> {
    while pos + AM_HEAD.len() <= track.len() {
        if track[pos..pos + AM_HEAD.len()] == AM_HEAD {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Locate the 512-byte payload of `sector` on an MFM track. Returns the
/// payload offset within the track slice.
pub fn find_sector(track: &[u8], t: u8, side: u8, sector: u8) -> Option<usize> {
    let mut pos = 0;
    loop {
        let id = find_am(track, pos)?;
        if track.len() < id + 10 || track[id + 6] != 0xFE || track[id + 7] != t || track[id + 8] != side {
            log::debug!("wrong ID address mark at offset {}", id);
            return None;
        }
        let hit = track[id + 9] == sector;

        let dam = find_am(track, id + 11)?;
        if track.len() < dam + 7 + SECTOR_BYTES || track[dam + 6] != 0xFB {
            log::debug!("wrong data address mark at offset {}", dam);
            return None;
        }
        if hit {
            return Some(dam + 7);
        }
        // skip over the data field to the next ID mark
        pos = dam + 521;
    }
}

/// The standard gap layout for a given per-track sector count.
fn gap_layout(nsectors: usize) -> (usize, usize, usize, usize) {
    match nsectors {
        11 => (10, 3, 1, 14),
        10 => (60, 12, 40, 50),
        _ => (60, 12, 40, 664),
    }
}

pub struct FloppyImage {
    file: File,
    path: PathBuf,
    format: ImageFormat,
    rdonly: bool,
    nsides: usize,
    ntracks: usize,
    nsectors: usize,
    dirty: bool,
    buf: Vec<u8>,
}

impl FloppyImage {
    /// Open an image file, detecting the format from the file extension.
    /// ST and MSA images are expanded to MFM track data in memory using the
    /// given skew and interleave for the physical sector layout.
    pub fn open(path: &Path, rdonly: bool, skew: usize, interleave: usize) -> Result<FloppyImage, ImageError> {
        let format = ImageFormat::from_path(path).ok_or(ImageError::UnknownFormat)?;

        let file = File::options().read(true).write(!rdonly).open(path)?;

        let mut img = FloppyImage {
            file,
            path: path.to_path_buf(),
            format,
            rdonly,
            nsides: 0,
            ntracks: 0,
            nsectors: 0,
            dirty: false,
            buf: vec![0u8; TRACK_BYTES * 2 * MAX_TRACKS],
        };

        match format {
            ImageFormat::Mfm => img.load_mfm()?,
            ImageFormat::St | ImageFormat::Msa => img.load_st_msa(skew, interleave)?,
        }
        Ok(img)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
    pub fn read_only(&self) -> bool {
        self.rdonly
    }
    pub fn nsides(&self) -> usize {
        self.nsides
    }
    pub fn ntracks(&self) -> usize {
        self.ntracks
    }
    pub fn nsectors(&self) -> usize {
        self.nsectors
    }

    /// Borrow the MFM data of one track.
    pub fn track(&self, track: usize, side: usize) -> &[u8] {
        let off = (track * self.nsides.max(1) + side) * TRACK_BYTES;
        &self.buf[off..off + TRACK_BYTES]
    }

    /// Borrow one track mutably. Writing to a track beyond the current
    /// geometry (the guest formatting extra tracks) grows the image.
    pub fn track_mut(&mut self, track: usize, side: usize) -> &mut [u8] {
        if track >= self.ntracks {
            self.ntracks = track + 1;
        }
        if side >= self.nsides {
            self.nsides = side + 1;
        }
        let off = (track * self.nsides + side) * TRACK_BYTES;
        &mut self.buf[off..off + TRACK_BYTES]
    }

    /// Locate one sector's payload. Sector numbers are 1-based on disk.
    pub fn read_sector(&self, track: usize, side: usize, sector: usize) -> Option<&[u8]> {
        let trk = self.track(track, side);
        let off = find_sector(trk, track as u8, side as u8, sector as u8)?;
        Some(&trk[off..off + SECTOR_BYTES])
    }

    /// Latch the write-back flag. A read-only image never becomes dirty.
    pub fn mark_dirty(&mut self) {
        if !self.rdonly {
            self.dirty = true;
        }
    }

    /// Write any pending changes back to the underlying file in its
    /// original format.
    pub fn sync(&mut self) -> Result<(), ImageError> {
        if !self.dirty {
            return Ok(());
        }
        match self.format {
            ImageFormat::Mfm => self.save_mfm()?,
            ImageFormat::St => self.save_st()?,
            ImageFormat::Msa => self.save_msa()?,
        }
        self.dirty = false;
        Ok(())
    }

    fn load_mfm(&mut self) -> Result<(), ImageError> {
        let mut size = 0;
        loop {
            let n = self.file.read(&mut self.buf[size..])?;
            if n == 0 {
                break;
            }
            size += n;
        }
        if size == 0 {
            log::warn!("empty MFM image `{}`", self.path.display());
            return Ok(());
        }
        // Try to recover the geometry from the BPB in the boot sector.
        let mut found = false;
        if let Some(off) = find_sector(&self.buf[..TRACK_BYTES.min(size)], 0, 0, 1) {
            let bpb = &self.buf[off..off + SECTOR_BYTES];
            let sectors = read_u16_le(&bpb[0x18..]) as usize;
            let sides = read_u16_le(&bpb[0x1A..]) as usize;
            if (9..=11).contains(&sectors) && (1..=2).contains(&sides) {
                self.nsectors = sectors;
                self.nsides = sides;
                self.ntracks = read_u16_le(&bpb[0x13..]) as usize / (sectors * sides);
                found = true;
            }
        }
        if !found {
            // No usable boot sector. Guess from the file size.
            if size > TRACK_BYTES * 100 {
                self.nsides = 2;
                self.ntracks = size / (TRACK_BYTES * 2);
            }
            else {
                self.nsides = 1;
                self.ntracks = size / TRACK_BYTES;
            }
        }
        Ok(())
    }

    fn save_mfm(&mut self) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.buf[..TRACK_BYTES * self.nsides * self.ntracks])?;
        Ok(())
    }

    /// Try geometries 1..86 tracks x 9..11 sectors x 1..2 sides looking for
    /// one that exactly accounts for the file size.
    fn guess_geometry(&mut self, image_size: usize) -> bool {
        if image_size % SECTOR_BYTES != 0 {
            return false;
        }
        for tracks in (1..=MAX_TRACKS).rev() {
            for sectors in (9..=11).rev() {
                for sides in [2, 1] {
                    if image_size == tracks * sectors * sides * SECTOR_BYTES {
                        self.ntracks = tracks;
                        self.nsectors = sectors;
                        self.nsides = sides;
                        log::info!("geometry guessed: {} tracks, {} sides, {} sectors", tracks, sides, sectors);
                        return true;
                    }
                }
            }
        }
        log::error!("failed to guess disk geometry for `{}`", self.path.display());
        false
    }

    fn load_st_msa(&mut self, skew: usize, interleave: usize) -> Result<(), ImageError> {
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;

        // Per-track sector payloads in logical order, produced below either
        // by slicing the ST file or by unpacking MSA track records.
        let mut data_pos;

        match self.format {
            ImageFormat::St => {
                if raw.len() < 32 {
                    return Err(ImageError::BadGeometry { tracks: 0, sides: 0, sectors: 0 });
                }
                self.nsectors = read_u16_le(&raw[0x18..]) as usize;
                self.nsides = read_u16_le(&raw[0x1A..]) as usize;
                let total = read_u16_le(&raw[0x13..]) as usize;
                let bps = read_u16_le(&raw[0x0B..]) as usize;
                if self.nsectors * self.nsides != 0 {
                    self.ntracks = total / (self.nsectors * self.nsides);
                }
                log::info!("tracks:{} sides:{} sectors:{}", self.ntracks, self.nsides, self.nsectors);

                let plausible = bps == SECTOR_BYTES
                    && (9..=11).contains(&self.nsectors)
                    && (1..=2).contains(&self.nsides)
                    && (1..=MAX_TRACKS).contains(&self.ntracks);
                if !plausible {
                    log::warn!("inconsistent BPB (sector size {}), guessing geometry", bps);
                    if !self.guess_geometry(raw.len()) {
                        return Err(ImageError::BadGeometry {
                            tracks: self.ntracks,
                            sides: self.nsides,
                            sectors: self.nsectors,
                        });
                    }
                }
                data_pos = 0;
            }
            ImageFormat::Msa => {
                if raw.len() < 10 || read_u16_be(&raw[0..]) != MSA_MAGIC {
                    return Err(ImageError::BadMagic);
                }
                self.nsectors = read_u16_be(&raw[2..]) as usize;
                self.nsides = read_u16_be(&raw[4..]) as usize + 1;
                let start_track = read_u16_be(&raw[6..]);
                if start_track != 0 {
                    return Err(ImageError::PartialMsa(start_track));
                }
                self.ntracks = read_u16_be(&raw[8..]) as usize + 1;
                log::info!("tracks:{} sides:{} sectors:{}", self.ntracks, self.nsides, self.nsectors);

                if !(9..=11).contains(&self.nsectors)
                    || !(1..=2).contains(&self.nsides)
                    || self.ntracks > MAX_TRACKS
                {
                    return Err(ImageError::BadGeometry {
                        tracks: self.ntracks,
                        sides: self.nsides,
                        sectors: self.nsectors,
                    });
                }
                data_pos = 10;
            }
            ImageFormat::Mfm => unreachable!(),
        }

        let (gap1, gap2, gap4, gap5) = gap_layout(self.nsectors);
        let track_payload = self.nsectors * SECTOR_BYTES;

        let mut interleave = if interleave == 0 { 1 } else { interleave };
        if interleave == 1 && self.nsectors == 11 {
            // interleave 1 on 11-sector tracks degenerates; use 2
            interleave = 2;
        }

        let nsectors = self.nsectors;
        let mut sec_shift: i32 = 1;

        for track in 0..self.ntracks {
            // compute the physical slot order for this track from skew and
            // interleave
            let mut order = vec![0u8; nsectors];
            let mut written: u32 = 0;
            let mut sec_no = sec_shift as usize % nsectors;
            for i in 0..nsectors {
                order[sec_no] = i as u8;
                written |= 1 << sec_no;
                sec_no += interleave;
                if sec_no >= nsectors {
                    sec_no -= nsectors;
                }
                if i + 1 < nsectors {
                    while written & (1 << sec_no) != 0 {
                        sec_no = if sec_no + 1 < nsectors { sec_no + 1 } else { 0 };
                    }
                }
            }
            sec_shift -= nsectors as i32 - skew as i32;
            if sec_shift < 0 {
                sec_shift += nsectors as i32;
            }

            for side in 0..self.nsides {
                let mut payload = vec![0u8; track_payload];
                match self.format {
                    ImageFormat::St => {
                        let end = (data_pos + track_payload).min(raw.len());
                        if end > data_pos {
                            payload[..end - data_pos].copy_from_slice(&raw[data_pos..end]);
                        }
                        if end - data_pos < track_payload {
                            log::warn!("short read on track {} side {}", track, side);
                        }
                        data_pos += track_payload;
                    }
                    ImageFormat::Msa => {
                        if raw.len() < data_pos + 2 {
                            return Err(ImageError::RleOverrun { track, side });
                        }
                        let datalen = read_u16_be(&raw[data_pos..]) as usize;
                        data_pos += 2;
                        if raw.len() < data_pos + datalen {
                            return Err(ImageError::RleOverrun { track, side });
                        }
                        let rec = &raw[data_pos..data_pos + datalen];
                        data_pos += datalen;
                        if datalen == track_payload {
                            // uncompressed track
                            payload.copy_from_slice(rec);
                        }
                        else {
                            msa_unpack(rec, &mut payload).map_err(|_| ImageError::RleOverrun { track, side })?;
                        }
                    }
                    ImageFormat::Mfm => unreachable!(),
                }

                let trk = self.track_mut(track, side);
                let len = build_track(trk, track as u8, side as u8, &order, &payload, (gap1, gap2, gap4, gap5));
                if len != TRACK_BYTES {
                    return Err(ImageError::BadTrackLength { track, side, len });
                }
            }
        }
        Ok(())
    }

    fn save_st(&mut self) -> Result<(), ImageError> {
        // Re-read the geometry from the boot sector in case the disk has
        // been reformatted by the guest.
        let (ntracks, nsides, nsectors) = self.bpb_geometry()?;

        self.file.seek(SeekFrom::Start(0))?;
        for track in 0..ntracks {
            for side in 0..nsides {
                for sector in 0..nsectors {
                    let trk = self.track(track, side);
                    let off = find_sector(trk, track as u8, side as u8, sector as u8 + 1)
                        .ok_or(ImageError::SectorNotFound { track, side, sector: sector + 1 })?;
                    let payload = trk[off..off + SECTOR_BYTES].to_vec();
                    self.file.write_all(&payload)?;
                }
            }
        }
        self.file.set_len((ntracks * nsides * nsectors * SECTOR_BYTES) as u64)?;
        Ok(())
    }

    fn save_msa(&mut self) -> Result<(), ImageError> {
        let (ntracks, nsides, nsectors) = self.bpb_geometry()?;

        self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 10];
        header[0..2].copy_from_slice(&MSA_MAGIC.to_be_bytes());
        header[2..4].copy_from_slice(&(nsectors as u16).to_be_bytes());
        header[4..6].copy_from_slice(&(nsides as u16 - 1).to_be_bytes());
        header[8..10].copy_from_slice(&(ntracks as u16 - 1).to_be_bytes());
        self.file.write_all(&header)?;
        let mut length = 10u64;

        for track in 0..ntracks {
            for side in 0..nsides {
                // collect the sectors in logical order
                let mut trbuf = vec![0u8; nsectors * SECTOR_BYTES];
                let trk = self.track(track, side);
                for sector in 0..nsectors {
                    let off = find_sector(trk, track as u8, side as u8, sector as u8 + 1)
                        .ok_or(ImageError::SectorNotFound { track, side, sector: sector + 1 })?;
                    trbuf[sector * SECTOR_BYTES..(sector + 1) * SECTOR_BYTES]
                        .copy_from_slice(&trk[off..off + SECTOR_BYTES]);
                }
                match msa_pack(&trbuf) {
                    Some(packed) => {
                        self.file.write_all(&(packed.len() as u16).to_be_bytes())?;
                        self.file.write_all(&packed)?;
                        length += 2 + packed.len() as u64;
                    }
                    None => {
                        // compression failed, write the track uncompressed
                        self.file.write_all(&(trbuf.len() as u16).to_be_bytes())?;
                        self.file.write_all(&trbuf)?;
                        length += 2 + trbuf.len() as u64;
                    }
                }
            }
        }
        self.file.set_len(length)?;
        Ok(())
    }

    fn bpb_geometry(&self) -> Result<(usize, usize, usize), ImageError> {
        let trk = self.track(0, 0);
        let off =
            find_sector(trk, 0, 0, 1).ok_or(ImageError::SectorNotFound { track: 0, side: 0, sector: 1 })?;
        let bpb = &trk[off..off + SECTOR_BYTES];
        let nsectors = read_u16_le(&bpb[0x18..]) as usize;
        let nsides = read_u16_le(&bpb[0x1A..]) as usize;
        if nsectors == 0 || nsides == 0 {
            return Err(ImageError::BadGeometry { tracks: 0, sides: nsides, sectors: nsectors });
        }
        let ntracks = read_u16_le(&bpb[0x13..]) as usize / (nsectors * nsides);
        Ok((ntracks, nsides, nsectors))
    }
}

impl Drop for FloppyImage {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            log::error!("failed to sync floppy image `{}`: {}", self.path.display(), e);
        }
    }
}

/// Synthesize one MFM track from sector payloads. `order` maps physical
/// slots to logical sector indices. Returns the number of bytes emitted.
fn build_track(
    trk: &mut [u8],
    track: u8,
    side: u8,
    order: &[u8],
    payload: &[u8],
    (gap1, gap2, gap4, gap5): (usize, usize, usize, usize),
) -> usize {
    fn fill(trk: &mut [u8], p: &mut usize, b: u8, n: usize) {
        trk[*p..*p + n].fill(b);
        *p += n;
    }

    let mut p = 0;
    fill(trk, &mut p, 0x4E, gap1);
    for slot in 0..order.len() {
        let sec_no = order[slot] as usize;
        fill(trk, &mut p, 0x00, gap2);
        fill(trk, &mut p, 0xA1, 3);
        let id_start = p;
        trk[p] = 0xFE;
        trk[p + 1] = track;
        trk[p + 2] = side;
        trk[p + 3] = sec_no as u8 + 1;
        trk[p + 4] = 2;
        p += 5;
        let crc = crc16(&trk[id_start..id_start + 5]);
        trk[p..p + 2].copy_from_slice(&crc.to_be_bytes());
        p += 2;
        fill(trk, &mut p, 0x4E, 22);
        fill(trk, &mut p, 0x00, 12);
        fill(trk, &mut p, 0xA1, 3);
        let dam_start = p;
        trk[p] = 0xFB;
        p += 1;
        trk[p..p + SECTOR_BYTES].copy_from_slice(&payload[sec_no * SECTOR_BYTES..(sec_no + 1) * SECTOR_BYTES]);
        p += SECTOR_BYTES;
        let crc = crc16(&trk[dam_start..dam_start + 1 + SECTOR_BYTES]);
        trk[p..p + 2].copy_from_slice(&crc.to_be_bytes());
        p += 2;
        fill(trk, &mut p, 0x4E, gap4);
    }
    fill(trk, &mut p, 0x4E, gap5);
    p
}

/// Expand an MSA RLE track record. Fails if the record does not decode to
/// exactly the destination length.
fn msa_unpack(src: &[u8], dest: &mut [u8]) -> Result<(), ()> {
    let mut s = 0;
    let mut d = 0;
    while d < dest.len() {
        if s >= src.len() {
            return Err(());
        }
        let b = src[s];
        s += 1;
        if b == MSA_RLE_ESCAPE {
            if s + 3 > src.len() {
                return Err(());
            }
            let v = src[s];
            let run = read_u16_be(&src[s + 1..]) as usize;
            s += 3;
            if d + run > dest.len() {
                return Err(());
            }
            dest[d..d + run].fill(v);
            d += run;
        }
        else {
            dest[d] = b;
            d += 1;
        }
    }
    Ok(())
}

/// Try to pack a track in MSA RLE format. Returns `None` when packing would
/// not make the track smaller than the raw representation.
fn msa_pack(src: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut p = 0;
    while p < src.len() {
        let v = src[p];
        let mut n = 1;
        while p + n < src.len() && src[p + n] == v {
            n += 1;
        }
        if (n > 4 || v == MSA_RLE_ESCAPE) && out.len() + 4 < src.len() {
            out.push(MSA_RLE_ESCAPE);
            out.push(v);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        else if out.len() + n < src.len() {
            out.resize(out.len() + n, v);
        }
        else {
            return None;
        }
        p += n;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    // A recognizable, per-sector payload pattern.
    fn sector_fill(track: usize, side: usize, sector: usize) -> [u8; SECTOR_BYTES] {
        let mut buf = [0u8; SECTOR_BYTES];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (track * 31 + side * 17 + sector * 7 + i) as u8;
        }
        buf
    }

    fn make_boot_sector(ntracks: usize, nsides: usize, nsectors: usize) -> [u8; SECTOR_BYTES] {
        let mut bpb = [0u8; SECTOR_BYTES];
        bpb[0x0B..0x0D].copy_from_slice(&(SECTOR_BYTES as u16).to_le_bytes());
        bpb[0x13..0x15].copy_from_slice(&((ntracks * nsides * nsectors) as u16).to_le_bytes());
        bpb[0x18..0x1A].copy_from_slice(&(nsectors as u16).to_le_bytes());
        bpb[0x1A..0x1C].copy_from_slice(&(nsides as u16).to_le_bytes());
        bpb
    }

    fn write_st_image(dir: &TempDir, name: &str, ntracks: usize, nsides: usize, nsectors: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for track in 0..ntracks {
            for side in 0..nsides {
                for sector in 0..nsectors {
                    if track == 0 && side == 0 && sector == 0 {
                        f.write_all(&make_boot_sector(ntracks, nsides, nsectors)).unwrap();
                    }
                    else {
                        f.write_all(&sector_fill(track, side, sector)).unwrap();
                    }
                }
            }
        }
        path
    }

    fn expected_sector(ntracks: usize, nsides: usize, nsectors: usize, t: usize, s: usize, k: usize) -> [u8; SECTOR_BYTES] {
        if t == 0 && s == 0 && k == 0 {
            make_boot_sector(ntracks, nsides, nsectors)
        }
        else {
            sector_fill(t, s, k)
        }
    }

    #[test]
    fn st_image_sectors_decode() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, "test.st", 5, 1, 9);
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();
        assert_eq!(img.ntracks(), 5);
        assert_eq!(img.nsides(), 1);
        assert_eq!(img.nsectors(), 9);

        for t in 0..5 {
            for k in 0..9 {
                let payload = img.read_sector(t, 0, k + 1).expect("sector not found");
                assert_eq!(payload, expected_sector(5, 1, 9, t, 0, k));
            }
        }
    }

    #[test]
    fn sector_lookup_bounds() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, "test.st", 2, 2, 10);
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();
        for t in 0..2 {
            for s in 0..2 {
                assert!(img.read_sector(t, s, 0).is_none());
                for k in 1..=10 {
                    assert!(img.read_sector(t, s, k).is_some());
                }
                assert!(img.read_sector(t, s, 11).is_none());
            }
        }
    }

    #[test]
    fn track_crcs_conform() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, "test.st", 3, 2, 11);
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();

        for t in 0..3 {
            for s in 0..2 {
                let trk = img.track(t, s);
                let mut pos = 0;
                let mut id_count = 0;
                while let Some(am) = find_am(trk, pos) {
                    let body = am + 6;
                    match trk[body] {
                        0xFE => {
                            let crc = crc16(&trk[body..body + 5]);
                            assert_eq!(crc.to_be_bytes(), [trk[body + 5], trk[body + 6]]);
                            id_count += 1;
                            pos = body + 7;
                        }
                        0xFB => {
                            let crc = crc16(&trk[body..body + 513]);
                            assert_eq!(crc.to_be_bytes(), [trk[body + 513], trk[body + 514]]);
                            pos = body + 515;
                        }
                        _ => panic!("unexpected address mark byte {:02X}", trk[body]),
                    }
                }
                assert_eq!(id_count, 11);
            }
        }
    }

    #[test]
    fn st_round_trip_is_fixed_point() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, "test.st", 4, 2, 9);
        {
            let mut img = FloppyImage::open(&path, false, 3, 1).unwrap();
            img.mark_dirty();
            img.sync().unwrap();
        }
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();
        for t in 0..4 {
            for s in 0..2 {
                for k in 0..9 {
                    let payload = img.read_sector(t, s, k + 1).expect("sector not found");
                    assert_eq!(payload, expected_sector(4, 2, 9, t, s, k), "t{} s{} k{}", t, s, k);
                }
            }
        }
    }

    fn write_msa_image(dir: &TempDir, name: &str, ntracks: usize, nsides: usize, nsectors: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        let mut header = [0u8; 10];
        header[0..2].copy_from_slice(&MSA_MAGIC.to_be_bytes());
        header[2..4].copy_from_slice(&(nsectors as u16).to_be_bytes());
        header[4..6].copy_from_slice(&(nsides as u16 - 1).to_be_bytes());
        header[8..10].copy_from_slice(&(ntracks as u16 - 1).to_be_bytes());
        f.write_all(&header).unwrap();
        for track in 0..ntracks {
            for side in 0..nsides {
                let mut trbuf = Vec::new();
                for sector in 0..nsectors {
                    if track == 0 && side == 0 && sector == 0 {
                        trbuf.extend_from_slice(&make_boot_sector(ntracks, nsides, nsectors));
                    }
                    else {
                        trbuf.extend_from_slice(&sector_fill(track, side, sector));
                    }
                }
                match msa_pack(&trbuf) {
                    Some(packed) => {
                        f.write_all(&(packed.len() as u16).to_be_bytes()).unwrap();
                        f.write_all(&packed).unwrap();
                    }
                    None => {
                        f.write_all(&(trbuf.len() as u16).to_be_bytes()).unwrap();
                        f.write_all(&trbuf).unwrap();
                    }
                }
            }
        }
        path
    }

    #[test]
    fn msa_round_trip_is_fixed_point() {
        let dir = TempDir::new().unwrap();
        let path = write_msa_image(&dir, "test.msa", 3, 2, 10);
        {
            let mut img = FloppyImage::open(&path, false, 3, 1).unwrap();
            img.mark_dirty();
            img.sync().unwrap();
        }
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();
        assert_eq!(img.ntracks(), 3);
        assert_eq!(img.nsides(), 2);
        for t in 0..3 {
            for s in 0..2 {
                for k in 0..10 {
                    let payload = img.read_sector(t, s, k + 1).expect("sector not found");
                    assert_eq!(payload, expected_sector(3, 2, 10, t, s, k), "t{} s{} k{}", t, s, k);
                }
            }
        }
    }

    #[test]
    fn msa_rle_idempotence() {
        // compressible: long runs
        let mut buf = vec![0u8; 4608];
        buf[1000..1400].fill(0x55);
        let packed = msa_pack(&buf).expect("run-heavy data should pack");
        assert!(packed.len() < buf.len());
        let mut out = vec![0xAAu8; buf.len()];
        msa_unpack(&packed, &mut out).unwrap();
        assert_eq!(out, buf);

        // escape byte must always be escaped even as a single occurrence
        let mut buf = vec![0u8; 512];
        buf[17] = MSA_RLE_ESCAPE;
        let packed = msa_pack(&buf).expect("should pack");
        let mut out = vec![0u8; buf.len()];
        msa_unpack(&packed, &mut out).unwrap();
        assert_eq!(out, buf);

        // incompressible: no run of 5, must refuse rather than grow
        let buf: Vec<u8> = (0..4608u32).map(|i| (i % 251) as u8).collect();
        assert!(msa_pack(&buf).is_none());
    }

    #[test]
    fn msa_unpack_bounds_overrun() {
        // a run longer than the destination must fail, not overwrite
        let rec = [MSA_RLE_ESCAPE, 0x42, 0x10, 0x00];
        let mut out = vec![0u8; 8];
        assert!(msa_unpack(&rec, &mut out).is_err());
    }

    #[test]
    fn bad_msa_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.msa");
        std::fs::write(&path, [0u8; 64]).unwrap();
        match FloppyImage::open(&path, true, 3, 1) {
            Err(ImageError::BadMagic) => {}
            other => panic!("expected BadMagic, got {:?}", other.err()),
        }
    }

    #[test]
    fn partial_msa_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.msa");
        let mut header = [0u8; 10];
        header[0..2].copy_from_slice(&MSA_MAGIC.to_be_bytes());
        header[2..4].copy_from_slice(&9u16.to_be_bytes());
        header[6..8].copy_from_slice(&5u16.to_be_bytes());
        header[8..10].copy_from_slice(&79u16.to_be_bytes());
        std::fs::write(&path, header).unwrap();
        match FloppyImage::open(&path, true, 3, 1) {
            Err(ImageError::PartialMsa(5)) => {}
            other => panic!("expected PartialMsa, got {:?}", other.err()),
        }
    }

    #[test]
    fn st_geometry_guess_without_bpb() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blank.st");
        // 80 tracks x 2 sides x 9 sectors, but an all-zero boot sector
        let size = 80 * 2 * 9 * SECTOR_BYTES;
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let img = FloppyImage::open(&path, true, 3, 1).unwrap();
        assert_eq!(img.ntracks(), 80);
        assert_eq!(img.nsides(), 2);
        assert_eq!(img.nsectors(), 9);
    }

    #[test]
    fn read_only_image_never_dirties() {
        let dir = TempDir::new().unwrap();
        let path = write_st_image(&dir, "prot.st", 2, 1, 9);
        let before = std::fs::read(&path).unwrap();
        {
            let mut img = FloppyImage::open(&path, true, 3, 1).unwrap();
            img.mark_dirty();
            img.sync().unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn mfm_load_save_verbatim() {
        let dir = TempDir::new().unwrap();
        let st_path = write_st_image(&dir, "src.st", 2, 1, 9);
        let img = FloppyImage::open(&st_path, true, 3, 1).unwrap();

        // write the synthesized MFM data out as a raw .mfm image
        let mfm_path = dir.path().join("copy.mfm");
        let mut raw = Vec::new();
        for t in 0..2 {
            raw.extend_from_slice(img.track(t, 0));
        }
        std::fs::write(&mfm_path, &raw).unwrap();

        let mfm = FloppyImage::open(&mfm_path, true, 3, 1).unwrap();
        assert_eq!(mfm.ntracks(), 2);
        assert_eq!(mfm.nsides(), 1);
        for t in 0..2 {
            assert_eq!(mfm.track(t, 0), img.track(t, 0));
        }
    }
}
