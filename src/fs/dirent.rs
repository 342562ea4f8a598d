//! Encoding and decoding of 32-byte FAT32 directory records.
//!
//! A long name is stored as a run of fragments, highest sequence number
//! first, followed by the short record it belongs to. Each fragment holds 13
//! UTF-16 code units and a checksum of the short record's 11-byte name.

use std::fmt;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use super::context::RecordBytes;
use super::geometry::DIR_ENTRY_SIZE;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First byte of a deleted record.
pub const DELETED_MARK: u8 = 0xE5;
/// Sequence flag on the fragment with the highest sequence number.
pub const LAST_FRAGMENT: u8 = 0x40;
/// UTF-16 code units carried by one fragment.
pub const CHARS_PER_FRAGMENT: usize = 13;
/// Longest long name, in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 255;

// LFN entry layout (13 UTF-16LE characters per entry):
//   Bytes 1-10:  characters 1-5
//   Bytes 14-25: characters 6-11
//   Bytes 26-27: first cluster low (always 0, NOT character data)
//   Bytes 28-31: characters 12-13
const LFN_CHAR_OFFSETS: [usize; CHARS_PER_FRAGMENT] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// One directory slot, classified by its first byte and attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Never-used slot (first byte 0x00).
    Free,
    /// Slot whose first byte is 0xE5.
    Deleted,
    LongName(LfnFragment),
    Short(ShortRecord),
    VolumeLabel,
}

impl RawRecord {
    pub fn decode(rec: &RecordBytes) -> Self {
        match rec[0] {
            0x00 => return RawRecord::Free,
            DELETED_MARK => return RawRecord::Deleted,
            _ => {}
        }
        let attr = rec[11];
        if attr & 0x3F == ATTR_LONG_NAME {
            RawRecord::LongName(LfnFragment::decode(rec))
        } else if attr & ATTR_VOLUME_ID != 0 {
            RawRecord::VolumeLabel
        } else {
            RawRecord::Short(ShortRecord::decode(rec))
        }
    }
}

// ---------------------------------------------------------------------------
// Long-name fragments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LfnFragment {
    /// Sequence number without the last-fragment flag (1-based).
    pub sequence: u8,
    pub is_last: bool,
    pub checksum: u8,
    /// All 13 code units, including terminator and 0xFFFF filler.
    pub units: [u16; CHARS_PER_FRAGMENT],
}

impl LfnFragment {
    pub fn decode(rec: &RecordBytes) -> Self {
        let mut units = [0u16; CHARS_PER_FRAGMENT];
        for (unit, &off) in units.iter_mut().zip(LFN_CHAR_OFFSETS.iter()) {
            *unit = u16::from_le_bytes([rec[off], rec[off + 1]]);
        }
        Self {
            sequence: rec[0] & 0x3F,
            is_last: rec[0] & LAST_FRAGMENT != 0,
            checksum: rec[13],
            units,
        }
    }

    pub fn encode(&self) -> RecordBytes {
        let mut rec = [0u8; DIR_ENTRY_SIZE];
        rec[0] = self.sequence | if self.is_last { LAST_FRAGMENT } else { 0 };
        for (&unit, &off) in self.units.iter().zip(LFN_CHAR_OFFSETS.iter()) {
            rec[off..off + 2].copy_from_slice(&unit.to_le_bytes());
        }
        rec[11] = ATTR_LONG_NAME;
        rec[12] = 0;
        rec[13] = self.checksum;
        // bytes 26-27 (cluster) stay zero
        rec
    }

    /// The name characters this fragment carries, without padding.
    pub fn text(&self) -> &[u16] {
        let len = self
            .units
            .iter()
            .position(|&c| c == 0x0000 || c == 0xFFFF)
            .unwrap_or(CHARS_PER_FRAGMENT);
        &self.units[..len]
    }
}

/// Checksum of an 11-byte short name, stored in every fragment of the long
/// name that belongs to it.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name.iter().fold(0u8, |sum, &b| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b)
    })
}

/// Length of `name` in UTF-16 code units.
pub fn utf16_len(name: &str) -> usize {
    name.encode_utf16().count()
}

/// Number of fragments needed to store `name`.
pub fn fragment_count(name: &str) -> usize {
    utf16_len(name).div_ceil(CHARS_PER_FRAGMENT)
}

/// Split `name` into fragments, in ascending sequence order.
///
/// The last fragment gets a single 0x0000 terminator when it is not full;
/// the remaining units are 0xFFFF.
pub fn build_fragments(name: &str, checksum: u8) -> Vec<LfnFragment> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let count = units.len().div_ceil(CHARS_PER_FRAGMENT);
    (0..count)
        .map(|i| {
            let start = i * CHARS_PER_FRAGMENT;
            let end = units.len().min(start + CHARS_PER_FRAGMENT);
            let chunk = &units[start..end];
            let mut padded = [0xFFFFu16; CHARS_PER_FRAGMENT];
            padded[..chunk.len()].copy_from_slice(chunk);
            if chunk.len() < CHARS_PER_FRAGMENT {
                padded[chunk.len()] = 0x0000;
            }
            LfnFragment {
                sequence: (i + 1) as u8,
                is_last: i + 1 == count,
                checksum,
                units: padded,
            }
        })
        .collect()
}

/// Fragment records for `name` in on-disk order (highest sequence first).
pub fn encode_long_name(name: &str, checksum: u8) -> Vec<RecordBytes> {
    build_fragments(name, checksum)
        .iter()
        .rev()
        .map(LfnFragment::encode)
        .collect()
}

/// Rewrite the checksum byte of a fragment record in place.
pub fn set_fragment_checksum(rec: &mut RecordBytes, checksum: u8) {
    rec[13] = checksum;
}

/// Accumulates fragments while scanning a directory and yields the long
/// name once its short record arrives.
#[derive(Debug, Default)]
pub struct LongNameBuffer {
    units: Vec<u16>,
    checksum: Option<u8>,
}

impl LongNameBuffer {
    /// Prepend a fragment's characters.
    pub fn push(&mut self, fragment: &LfnFragment) {
        let mut units = fragment.text().to_vec();
        units.extend_from_slice(&self.units);
        self.units = units;
        self.checksum = Some(fragment.checksum);
    }

    pub fn clear(&mut self) {
        self.units.clear();
        self.checksum = None;
    }

    /// Take the accumulated name and its checksum, leaving the buffer empty.
    pub fn take(&mut self) -> Option<(String, u8)> {
        let checksum = self.checksum.take()?;
        let name = String::from_utf16_lossy(&self.units);
        self.units.clear();
        Some((name, checksum))
    }
}

// ---------------------------------------------------------------------------
// Short records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ShortRecord {
    pub name: [u8; 11],
    pub attr: u8,
    /// Byte 12 (case flags on NT); carried through unchanged.
    pub nt_flags: u8,
    pub created: FatTimestamp,
    pub accessed_date: u16,
    pub modified: FatTimestamp,
    pub first_cluster: u32,
    pub size: u32,
}

impl ShortRecord {
    pub fn decode(rec: &RecordBytes) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([rec[off], rec[off + 1]]);
        let mut name = [0u8; 11];
        name.copy_from_slice(&rec[0..11]);
        let cluster_hi = u16_at(20) as u32;
        let cluster_lo = u16_at(26) as u32;
        Self {
            name,
            attr: rec[11],
            nt_flags: rec[12],
            created: FatTimestamp {
                date: u16_at(16),
                time: u16_at(14),
                tenths: rec[13],
            },
            accessed_date: u16_at(18),
            modified: FatTimestamp {
                date: u16_at(24),
                time: u16_at(22),
                tenths: 0,
            },
            first_cluster: (cluster_hi << 16) | cluster_lo,
            size: u32::from_le_bytes([rec[28], rec[29], rec[30], rec[31]]),
        }
    }

    pub fn encode(&self) -> RecordBytes {
        let mut rec = [0u8; DIR_ENTRY_SIZE];
        rec[0..11].copy_from_slice(&self.name);
        rec[11] = self.attr;
        rec[12] = self.nt_flags;
        rec[13] = self.created.tenths;
        rec[14..16].copy_from_slice(&self.created.time.to_le_bytes());
        rec[16..18].copy_from_slice(&self.created.date.to_le_bytes());
        rec[18..20].copy_from_slice(&self.accessed_date.to_le_bytes());
        rec[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        rec[22..24].copy_from_slice(&self.modified.time.to_le_bytes());
        rec[24..26].copy_from_slice(&self.modified.date.to_le_bytes());
        rec[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        rec[28..32].copy_from_slice(&self.size.to_le_bytes());
        rec
    }

    /// A fresh record stamped with `now` for both timestamps.
    pub fn new(name: [u8; 11], attr: u8, first_cluster: u32, now: FatTimestamp) -> Self {
        Self {
            name,
            attr,
            nt_flags: 0,
            created: now,
            accessed_date: now.date,
            modified: FatTimestamp { tenths: 0, ..now },
            first_cluster,
            size: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_dot(&self) -> bool {
        self.name == DOT_NAME
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == DOTDOT_NAME
    }

    /// Set the modified date and time (and the access date).
    pub fn touch(&mut self, now: FatTimestamp) {
        self.modified = FatTimestamp { tenths: 0, ..now };
        self.accessed_date = now.date;
    }

    /// The 8.3 name as displayed (`NAME.EXT`).
    pub fn display_name(&self) -> String {
        let mut name = self.name;
        // 0x05 stands for a leading 0xE5 character
        if name[0] == 0x05 {
            name[0] = DELETED_MARK;
        }
        build_short_name(&name[0..8], &name[8..11])
    }

    /// The numeric suffix after `~` in the base name (0 when absent).
    pub fn order(&self) -> u32 {
        parse_order(&self.name)
    }
}

/// Largest order whose `~<order>` alias fits in the 8-byte base name.
pub const MAX_ORDER: u32 = 9_999_999;

/// Short name used for an entry with the given order: `~<order>` padded
/// with spaces. Callers keep `order` at or below [`MAX_ORDER`].
pub fn alias_short_name(order: u32) -> [u8; 11] {
    let mut name = [b' '; 11];
    let text = format!("~{order}");
    for (dst, src) in name.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    name
}

/// Read the number following `~` in the base part of a short name.
pub fn parse_order(short_name: &[u8; 11]) -> u32 {
    let base = &short_name[0..8];
    let Some(tilde) = base.iter().position(|&b| b == b'~') else {
        return 0;
    };
    base[tilde + 1..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, &b| acc.saturating_mul(10).saturating_add((b - b'0') as u32))
}

/// Build a DOS 8.3 short filename from the name and extension bytes.
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

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Packed FAT date and time.
///
/// Date: `(year - 1980) << 9 | month << 5 | day`.
/// Time: `hour << 11 | minute << 5 | second / 2`.
/// `tenths` holds the 10 ms units (0-199) only creation times carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FatTimestamp {
    pub date: u16,
    pub time: u16,
    pub tenths: u8,
}

impl FatTimestamp {
    /// The current local time.
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107) as u16;
        let date = ((year - 1980) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time = ((dt.hour() as u16) << 11)
            | ((dt.minute() as u16) << 5)
            | (dt.second() as u16 / 2);
        let millis = (dt.nanosecond() / 1_000_000).min(999);
        let tenths = ((dt.second() % 2) * 100 + millis / 10) as u8;
        Self { date, time, tenths }
    }

    pub fn is_unset(&self) -> bool {
        self.date == 0
    }

    pub fn year(&self) -> u16 {
        ((self.date >> 9) & 0x7F) + 1980
    }

    pub fn month(&self) -> u8 {
        ((self.date >> 5) & 0x0F) as u8
    }

    pub fn day(&self) -> u8 {
        (self.date & 0x1F) as u8
    }

    pub fn hour(&self) -> u8 {
        ((self.time >> 11) & 0x1F) as u8
    }

    pub fn minute(&self) -> u8 {
        ((self.time >> 5) & 0x3F) as u8
    }

    pub fn second(&self) -> u8 {
        ((self.time & 0x1F) * 2) as u8
    }

    /// The timestamp as a calendar value, if the packed fields are valid.
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year() as i32, self.month() as u32, self.day() as u32)?
            .and_hms_opt(
                self.hour() as u32,
                self.minute() as u32,
                self.second() as u32,
            )
    }
}

impl fmt::Display for FatTimestamp {
    /// "YYYY-MM-DD HH:MM:SS", or nothing for an unset date.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return Ok(());
        }
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_records(records: &[RecordBytes]) -> Option<(String, u8)> {
        let mut buf = LongNameBuffer::default();
        for rec in records {
            match RawRecord::decode(rec) {
                RawRecord::LongName(frag) => buf.push(&frag),
                other => panic!("unexpected record {other:?}"),
            }
        }
        buf.take()
    }

    #[test]
    fn test_build_short_name() {
        assert_eq!(build_short_name(b"KERNEL  ", b"SYS"), "KERNEL.SYS");
        assert_eq!(build_short_name(b"README  ", b"TXT"), "README.TXT");
        assert_eq!(build_short_name(b"BOOTMGR ", b"   "), "BOOTMGR");
        assert_eq!(build_short_name(b"~12     ", b"   "), "~12");
    }

    #[test]
    fn test_build_short_name_cp437() {
        // CP437 byte 0xAB = ½, 0xAC = ¼
        assert_eq!(build_short_name(b"3\xABFLOP~1", b"LNK"), "3½FLOP~1.LNK");
        // CP437 byte 0x81 = ü
        assert_eq!(build_short_name(b"GR\x81\x81E   ", b"TXT"), "GRüüE.TXT");
    }

    #[test]
    fn test_checksum_known_value() {
        // Reference value for "README  TXT"
        let mut sum = 0u8;
        for &b in b"README  TXT" {
            sum = (if sum & 1 != 0 { 0x80u8 } else { 0 })
                .wrapping_add(sum >> 1)
                .wrapping_add(b);
        }
        assert_eq!(lfn_checksum(b"README  TXT"), sum);
        assert_ne!(lfn_checksum(b"~1         "), lfn_checksum(b"~2         "));
    }

    #[test]
    fn test_long_name_round_trip_single_fragment() {
        let records = encode_long_name("notes.txt", 0x42);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], 1 | LAST_FRAGMENT);
        assert_eq!(records[0][11], ATTR_LONG_NAME);
        assert_eq!(records[0][26..28], [0, 0]);
        assert_eq!(
            decode_records(&records),
            Some(("notes.txt".to_string(), 0x42))
        );
    }

    #[test]
    fn test_long_name_round_trip_multi_fragment() {
        let name = "a rather long directory name.backup";
        let records = encode_long_name(name, 7);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], 3 | LAST_FRAGMENT);
        assert_eq!(records[1][0], 2);
        assert_eq!(records[2][0], 1);
        assert!(records.iter().all(|r| r[13] == 7));
        assert_eq!(decode_records(&records).unwrap().0, name);
    }

    #[test]
    fn test_exact_multiple_of_13_has_no_terminator() {
        let name = "abcdefghijklmnopqrstuvwxyz"; // 26 units
        let frags = build_fragments(name, 0);
        assert_eq!(frags.len(), 2);
        assert!(frags[1].units.iter().all(|&u| u != 0 && u != 0xFFFF));
        let records = encode_long_name(name, 0);
        assert_eq!(decode_records(&records).unwrap().0, name);
    }

    #[test]
    fn test_padding_after_terminator() {
        let frags = build_fragments("abc", 0);
        assert_eq!(frags[0].units[3], 0x0000);
        assert!(frags[0].units[4..].iter().all(|&u| u == 0xFFFF));
    }

    #[test]
    fn test_non_ascii_name_round_trip() {
        let name = "résumé-日本語";
        let records = encode_long_name(name, 1);
        assert_eq!(decode_records(&records).unwrap().0, name);
    }

    #[test]
    fn test_decode_classification() {
        let mut rec = [0u8; DIR_ENTRY_SIZE];
        assert_eq!(RawRecord::decode(&rec), RawRecord::Free);
        rec[0] = DELETED_MARK;
        assert_eq!(RawRecord::decode(&rec), RawRecord::Deleted);
        rec[0] = b'V';
        rec[11] = ATTR_VOLUME_ID;
        assert_eq!(RawRecord::decode(&rec), RawRecord::VolumeLabel);
        rec[11] = ATTR_ARCHIVE;
        assert!(matches!(RawRecord::decode(&rec), RawRecord::Short(_)));
    }

    #[test]
    fn test_short_record_round_trip() {
        let now = FatTimestamp {
            date: 29 | (1 << 5) | (46 << 9),
            time: (30 << 5) | (14 << 11),
            tenths: 150,
        };
        let mut short = ShortRecord::new(alias_short_name(3), ATTR_DIRECTORY, 0x0012_0034, now);
        short.size = 99;
        let rec = short.encode();
        assert_eq!(rec[20..22], [0x12, 0x00]);
        assert_eq!(rec[26..28], [0x34, 0x00]);
        let back = ShortRecord::decode(&rec);
        assert_eq!(back, short);
        assert!(back.is_directory());
        assert_eq!(back.order(), 3);
        assert_eq!(back.display_name(), "~3");
    }

    #[test]
    fn test_parse_order() {
        assert_eq!(parse_order(&alias_short_name(1)), 1);
        assert_eq!(parse_order(&alias_short_name(4711)), 4711);
        assert_eq!(parse_order(b"PROGRA~2   "), 2);
        assert_eq!(parse_order(b"README  TXT"), 0);
    }

    #[test]
    fn test_timestamp_packing() {
        let dt = NaiveDate::from_ymd_opt(2026, 1, 29)
            .unwrap()
            .and_hms_milli_opt(14, 30, 7, 250)
            .unwrap();
        let ts = FatTimestamp::from_datetime(dt);
        assert_eq!(ts.date, 29 | (1 << 5) | (46 << 9));
        assert_eq!(ts.time, 3 | (30 << 5) | (14 << 11));
        assert_eq!(ts.tenths, 125);
        assert_eq!((ts.year(), ts.month(), ts.day()), (2026, 1, 29));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (14, 30, 6));
        assert_eq!(ts.to_string(), "2026-01-29 14:30:06");
    }

    #[test]
    fn test_unset_timestamp_formats_empty() {
        assert_eq!(FatTimestamp::default().to_string(), "");
        assert!(FatTimestamp::default().to_datetime().is_none());
    }
}
