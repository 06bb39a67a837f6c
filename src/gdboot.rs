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

    gdboot.rs

    The embedded m68k boot loader for the GEMDOS drive. When the guest has
    no other bootable ACSI device it reads these four sectors off the GEMDOS
    LUN; the loader installs the stub resident via Ptermres, after which the
    stub announces itself with the driver-init call.
*/

pub const GDBOOT: &[u8] = include_bytes!("../assets/gdboot.img");

/// The loader occupies the first four sectors of the virtual drive.
pub const GDBOOT_SECTORS: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_is_four_sectors() {
        assert_eq!(GDBOOT.len(), GDBOOT_SECTORS as usize * 512);
    }

    #[test]
    fn boot_sector_checksums_bootable() {
        // TOS only executes a boot sector whose big-endian word sum is 0x1234
        let sum = GDBOOT[..512]
            .chunks_exact(2)
            .fold(0u16, |acc, w| acc.wrapping_add(u16::from_be_bytes([w[0], w[1]])));
        assert_eq!(sum, 0x1234);
    }
}
