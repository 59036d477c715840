use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{FatError, Result};

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First name byte of a released slot.
pub const SLOT_DELETED: u8 = 0xE5;
/// First name byte of the slot that ends the directory.
pub const SLOT_END: u8 = 0x00;

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// A file or directory record within a FAT directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub start_cluster: u32,
    /// Always 0 for directories.
    pub size: u32,
    pub mtime: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl DirEntry {
    pub fn new_directory(name: impl Into<String>, start_cluster: u32, mtime: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            start_cluster,
            size: 0,
            mtime,
        }
    }

    pub fn new_file(
        name: impl Into<String>,
        start_cluster: u32,
        size: u32,
        mtime: NaiveDateTime,
    ) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            start_cluster,
            size,
            mtime,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// On-disk 32-byte record.
    pub fn encode(&self) -> Result<[u8; DIR_ENTRY_SIZE]> {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0..11].copy_from_slice(&short_name_bytes(&self.name)?);
        raw[11] = match self.kind {
            EntryKind::Directory => ATTR_DIRECTORY,
            EntryKind::File => ATTR_ARCHIVE,
        };
        set_cluster(&mut raw, self.start_cluster);
        set_mtime(&mut raw, self.mtime);
        LittleEndian::write_u32(&mut raw[28..32], self.size);
        Ok(raw)
    }

    /// Decode a short-name record. The caller filters out free, long-name
    /// and volume-label slots.
    pub fn decode(raw: &[u8]) -> Self {
        let kind = if raw[11] & ATTR_DIRECTORY != 0 {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let mut name_bytes = [0u8; 11];
        name_bytes.copy_from_slice(&raw[0..11]);
        // 0x05 stands in for a leading 0xE5 byte
        if name_bytes[0] == 0x05 {
            name_bytes[0] = 0xE5;
        }
        let date = LittleEndian::read_u16(&raw[24..26]);
        let time = LittleEndian::read_u16(&raw[22..24]);
        Self {
            name: build_short_name(&name_bytes[0..8], &name_bytes[8..11]),
            kind,
            start_cluster: cluster_of(raw),
            size: match kind {
                EntryKind::Directory => 0,
                EntryKind::File => LittleEndian::read_u32(&raw[28..32]),
            },
            mtime: decode_fat_datetime(date, time),
        }
    }
}

/// Starting cluster stored in a raw record.
pub fn cluster_of(raw: &[u8]) -> u32 {
    let hi = LittleEndian::read_u16(&raw[20..22]) as u32;
    let lo = LittleEndian::read_u16(&raw[26..28]) as u32;
    (hi << 16) | lo
}

pub fn set_cluster(raw: &mut [u8], cluster: u32) {
    LittleEndian::write_u16(&mut raw[20..22], (cluster >> 16) as u16);
    LittleEndian::write_u16(&mut raw[26..28], cluster as u16);
}

pub fn set_mtime(raw: &mut [u8], mtime: NaiveDateTime) {
    let (date, time) = encode_fat_datetime(mtime);
    LittleEndian::write_u16(&mut raw[22..24], time);
    LittleEndian::write_u16(&mut raw[24..26], date);
}

/// Convert a user-supplied name to the padded 11-byte 8.3 form.
///
/// Lowercase ASCII is folded to uppercase; names that do not fit 8.3 or use
/// characters outside the short-name set are rejected.
pub fn short_name_bytes(name: &str) -> Result<[u8; 11]> {
    match name {
        "." => return Ok(DOT_NAME),
        ".." => return Ok(DOTDOT_NAME),
        _ => {}
    }
    let invalid = || FatError::InvalidArgs(format!("not a valid 8.3 name: {name:?}"));

    let (base, ext) = match name.rfind('.') {
        Some(pos) => (&name[..pos], &name[pos + 1..]),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(invalid());
    }
    if name.ends_with('.') {
        return Err(invalid());
    }

    let mut out = [b' '; 11];
    for (slot, part) in [(0usize, base), (8usize, ext)] {
        for (i, ch) in part.bytes().enumerate() {
            if !is_short_name_char(ch) {
                return Err(invalid());
            }
            out[slot + i] = ch.to_ascii_uppercase();
        }
    }
    Ok(out)
}

fn is_short_name_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&ch)
}

/// Build a display name from the 8-byte name and 3-byte extension fields.
///
/// FAT short names use OEM codepage encoding (typically CP437). Bytes 0x80-0xFF
/// are decoded using the CP437 table rather than assuming UTF-8.
pub fn build_short_name(name: &[u8], ext: &[u8]) -> String {
    let name_str = decode_oem_string(name);
    let name_trimmed = name_str.trim_end();
    let ext_str = decode_oem_string(ext);
    let ext_trimmed = ext_str.trim_end();

    if ext_trimmed.is_empty() {
        name_trimmed.to_string()
    } else {
        format!("{name_trimmed}.{ext_trimmed}")
    }
}

fn decode_oem_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| cp437_to_char(b)).collect()
}

fn cp437_to_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

/// CP437 to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    // 0xD0-0xDF
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    // 0xE0-0xEF
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    // 0xF0-0xFF
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];

/// Earliest representable FAT timestamp.
pub fn fat_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Decode a FAT date/time pair. Zero or out-of-range fields give the FAT
/// epoch.
pub fn decode_fat_datetime(date: u16, time: u16) -> NaiveDateTime {
    if date == 0 {
        return fat_epoch();
    }
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = ((time & 0x1F) * 2) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .unwrap_or_else(fat_epoch)
}

/// Encode to a FAT (date, time) pair, clamped to 1980..=2107 at 2 s
/// resolution.
pub fn encode_fat_datetime(dt: NaiveDateTime) -> (u16, u16) {
    if dt.year() < 1980 {
        return (0x0021, 0);
    }
    if dt.year() > 2107 {
        return ((127 << 9) | (12 << 5) | 31, (23 << 11) | (59 << 5) | 29);
    }
    let date = (((dt.year() - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() / 2) as u16;
    (date, time)
}
