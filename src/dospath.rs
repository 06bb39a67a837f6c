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

    dospath.rs

    GEMDOS path and name handling: case-insensitive resolution of DOS paths
    onto the host filesystem, DOS wildcard matching, 8.3 name shape checks
    and DOS time/date conversion.
*/

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Result of resolving a DOS path against the host filesystem.
#[derive(Debug)]
pub enum PathLookup {
    /// The path names a drive the dispatcher does not manage.
    NotOurDrive,
    /// Some intermediate component does not resolve.
    Invalid,
    /// The path resolves to an existing directory.
    Directory(PathBuf),
    /// The path resolves to an existing file.
    File(PathBuf),
    /// Every parent resolves but the leaf does not exist; the carried path
    /// is the parent joined with the leaf as given (used by create calls).
    Missing(PathBuf),
}

/// Look for `fname` in `dir`, first verbatim, then case-insensitively.
fn filename_lookup(dir: &Path, fname: &str) -> Option<OsString> {
    if dir.join(fname).symlink_metadata().is_ok() {
        return Some(OsString::from(fname));
    }
    let rd = std::fs::read_dir(dir).ok()?;
    for entry in rd.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().eq_ignore_ascii_case(fname) {
            return Some(name);
        }
    }
    None
}

/// Resolve a DOS path (`\SOME\DIR` absolute, `SOME\SUBDIR` relative, with an
/// optional `X:` drive prefix) to a host path, matching each component
/// case-insensitively against the directories on disk.
///
/// `gemdos_drv` is the drive number the dispatcher manages; `on_drive` says
/// whether the guest's current drive is that drive.
pub fn path_lookup(
    root: &Path,
    current_path: &Path,
    on_drive: bool,
    gemdos_drv: u32,
    src: &str,
) -> PathLookup {
    let mut src = src;
    let bytes = src.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' {
        let letter = (bytes[0] as char).to_ascii_uppercase() as u32;
        if letter.wrapping_sub('A' as u32) == gemdos_drv {
            src = &src[2..];
        }
        else {
            return PathLookup::NotOurDrive;
        }
    }
    else if !on_drive {
        return PathLookup::NotOurDrive;
    }

    let mut path;
    if let Some(stripped) = src.strip_prefix('\\') {
        // absolute path
        src = stripped;
        path = root.to_path_buf();
    }
    else {
        // relative to the guest's current directory
        path = current_path.to_path_buf();
    }

    let components: Vec<&str> = src.split('\\').filter(|c| !c.is_empty()).collect();
    for (i, comp) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        match filename_lookup(&path, comp) {
            Some(real) => {
                path.push(real);
                if !last {
                    match std::fs::metadata(&path) {
                        Ok(m) if m.is_dir() => {}
                        _ => return PathLookup::Invalid,
                    }
                }
            }
            None if last => {
                return PathLookup::Missing(path.join(comp));
            }
            None => {
                return PathLookup::Invalid;
            }
        }
    }

    match std::fs::metadata(&path) {
        Err(_) => PathLookup::Missing(path),
        Ok(m) if m.is_dir() => PathLookup::Directory(path),
        Ok(_) => PathLookup::File(path),
    }
}

/// Express a resolved host directory as a DOS path relative to the GEMDOS
/// root, for Dgetpath.
pub fn host_to_dos(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut out = String::new();
    for comp in rel.components() {
        out.push('\\');
        out.push_str(&comp.as_os_str().to_string_lossy().to_uppercase());
    }
    out
}

/// Check whether a file name matches a DOS search pattern. The semantics
/// are frozen by the test vectors below; in particular a bare `*` crosses
/// dots and `*.*` matches every name.
pub fn match_dos_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*.*" {
        return true;
    }
    fn rec(mut p: &[u8], mut s: &[u8]) -> bool {
        while let Some(&pc) = p.first() {
            if pc == b'*' {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                while !s.is_empty() {
                    if rec(p, s) {
                        return true;
                    }
                    s = &s[1..];
                }
                return false;
            }
            else if pc == b'?' {
                if s.is_empty() {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
            }
            else {
                match s.first() {
                    Some(&sc) if pc.eq_ignore_ascii_case(&sc) => {
                        p = &p[1..];
                        s = &s[1..];
                    }
                    _ => return false,
                }
            }
        }
        s.is_empty()
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

/// Check that a name fits the 8.3 shape the DTA can carry: at most one dot,
/// at most 8 characters before it and 3 after.
pub fn is_8_3(name: &str) -> bool {
    let len = name.len();
    match name.find('.') {
        Some(dot) if name != ".." => {
            let tail = &name[dot + 1..];
            !tail.contains('.') && dot <= 8 && len - dot <= 4
        }
        _ => len <= 8,
    }
}

// Days-to-date conversion on the proleptic Gregorian calendar.
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Convert a unix mtime to packed DOS (time, date), applying the configured
/// timezone offset in hours.
pub fn unix_to_dos_datetime(mtime: i64, tz_hours: i32) -> (u16, u16) {
    let t = mtime + tz_hours as i64 * 3600;
    let days = t.div_euclid(86400);
    let secs = t.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    let time = ((secs / 3600) << 11 | (secs % 3600 / 60) << 5 | (secs % 60) / 2) as u16;
    let date = ((y - 1980) << 9 | m << 5 | d) as u16;
    (time, date)
}

/// The inverse conversion, for Fdatime writes.
pub fn dos_to_unix_datetime(time: u16, date: u16, tz_hours: i32) -> i64 {
    let year = 1980 + (date >> 9) as i64;
    let month = (date >> 5 & 0x0F) as i64;
    let day = (date & 0x1F) as i64;
    let secs =
        (time >> 11) as i64 * 3600 + (time >> 5 & 0x3F) as i64 * 60 + (time & 0x1F) as i64 * 2;
    days_from_civil(year, month, day) * 86400 + secs - tz_hours as i64 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pattern_vectors() {
        // the matcher's quirks are part of the protocol; these vectors pin
        // its behavior
        assert!(match_dos_pattern("*.*", "GAME.PRG"));
        assert!(match_dos_pattern("*.*", "NODOTS"));
        assert!(match_dos_pattern("*.PRG", "GAME.PRG"));
        assert!(match_dos_pattern("*.PRG", "game.prg"));
        assert!(!match_dos_pattern("*.PRG", "GAME.PRGX"));
        assert!(!match_dos_pattern("*.PRG", "GAME.TOS"));
        assert!(match_dos_pattern("A*", "A"));
        assert!(match_dos_pattern("*A", "A"));
        assert!(!match_dos_pattern("*A", ""));
        // a bare star crosses the dot
        assert!(match_dos_pattern("*", "FILE.TXT"));
        assert!(match_dos_pattern("F?LE.*", "FILE.TXT"));
        assert!(!match_dos_pattern("?", ""));
        assert!(!match_dos_pattern("?A", "A"));
        assert!(match_dos_pattern("??", "AB"));
        assert!(match_dos_pattern("A*B*C", "AXXBYYC"));
        assert!(!match_dos_pattern("A*B*C", "AXXBYY"));
    }

    #[test]
    fn eight_dot_three_shapes() {
        assert!(is_8_3("GAME.PRG"));
        assert!(is_8_3("AUTOEXEC.BAT"));
        assert!(is_8_3("README"));
        assert!(is_8_3(".."));
        assert!(is_8_3("."));
        assert!(!is_8_3("LONGFILENAME"));
        assert!(!is_8_3("TOO.LONG.EXT"));
        assert!(!is_8_3("VERYLONGX.TXT"));
        assert!(!is_8_3("FILE.LONG"));
        assert!(is_8_3("A.B"));
    }

    #[test]
    fn dos_dates() {
        // 1980-01-01T00:00:00Z is the DOS epoch
        let (time, date) = unix_to_dos_datetime(315532800, 0);
        assert_eq!(date, 1 << 5 | 1);
        assert_eq!(time, 0);

        // one second before the next midnight
        let (time, date) = unix_to_dos_datetime(315532800 + 86399, 0);
        assert_eq!(date, 1 << 5 | 1);
        assert_eq!(time, 23 << 11 | 59 << 5 | 29);

        // the timezone offset shifts the calendar day
        let (_, date) = unix_to_dos_datetime(315532800 - 1800, 1);
        assert_eq!(date, 1 << 5 | 1);

        // round trip at two-second resolution
        let t = 1_000_000_000 & !1;
        let (time, date) = unix_to_dos_datetime(t, 3);
        assert_eq!(dos_to_unix_datetime(time, date, 3), t);
    }

    #[test]
    fn lookup_resolves_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("Games")).unwrap();
        std::fs::write(root.join("Games").join("Story.prg"), b"x").unwrap();

        match path_lookup(root, root, true, 2, "\\GAMES\\STORY.PRG") {
            PathLookup::File(p) => assert_eq!(p, root.join("Games").join("Story.prg")),
            other => panic!("unexpected: {:?}", other),
        }
        match path_lookup(root, root, true, 2, "\\GAMES") {
            PathLookup::Directory(p) => assert_eq!(p, root.join("Games")),
            other => panic!("unexpected: {:?}", other),
        }
        match path_lookup(root, root, true, 2, "\\GAMES\\NEW.SAV") {
            PathLookup::Missing(p) => assert_eq!(p, root.join("Games").join("NEW.SAV")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            path_lookup(root, root, true, 2, "\\NOWHERE\\STORY.PRG"),
            PathLookup::Invalid
        ));
    }

    #[test]
    fn lookup_honors_drive_prefix() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        // drive C: (2) is managed
        assert!(matches!(path_lookup(root, root, true, 2, "C:\\"), PathLookup::Directory(_)));
        assert!(matches!(path_lookup(root, root, true, 2, "c:\\"), PathLookup::Directory(_)));
        assert!(matches!(path_lookup(root, root, true, 2, "A:\\FILE"), PathLookup::NotOurDrive));
        // current drive is elsewhere and no prefix given
        assert!(matches!(path_lookup(root, root, false, 2, "\\FILE"), PathLookup::NotOurDrive));
    }

    #[test]
    fn relative_lookup_uses_current_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("work").join("sub")).unwrap();
        std::fs::write(root.join("work").join("sub").join("a.txt"), b"x").unwrap();

        let cwd = root.join("work");
        match path_lookup(root, &cwd, true, 2, "SUB\\A.TXT") {
            PathLookup::File(p) => assert_eq!(p, cwd.join("sub").join("a.txt")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn host_to_dos_round_trip() {
        let root = Path::new("/sdcard/c");
        assert_eq!(host_to_dos(root, Path::new("/sdcard/c/games/sub")), "\\GAMES\\SUB");
        assert_eq!(host_to_dos(root, Path::new("/sdcard/c")), "");
    }
}
