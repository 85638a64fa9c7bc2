//! Windows-1251 transcoding for text sent to and read from the register.
//!
//! `0xC0..=0xFF` is the contiguous Cyrillic block А..я; the upper half
//! below it is looked up in a table. Characters with no mapping encode as `?`.

/// Unicode for bytes `0x80..=0xBF`. `0x98` is unassigned.
const HIGH_HALF: [char; 64] = [
    '\u{0402}', '\u{0403}', '\u{201A}', '\u{0453}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{20AC}', '\u{2030}', '\u{0409}', '\u{2039}', '\u{040A}', '\u{040C}', '\u{040B}', '\u{040F}',
    '\u{0452}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{FFFD}', '\u{2122}', '\u{0459}', '\u{203A}', '\u{045A}', '\u{045C}', '\u{045B}', '\u{045F}',
    '\u{00A0}', '\u{040E}', '\u{045E}', '\u{0408}', '\u{00A4}', '\u{0490}', '\u{00A6}', '\u{00A7}',
    '\u{0401}', '\u{00A9}', '\u{0404}', '\u{00AB}', '\u{00AC}', '\u{00AD}', '\u{00AE}', '\u{0407}',
    '\u{00B0}', '\u{00B1}', '\u{0406}', '\u{0456}', '\u{0491}', '\u{00B5}', '\u{00B6}', '\u{00B7}',
    '\u{0451}', '\u{2116}', '\u{0454}', '\u{00BB}', '\u{0458}', '\u{0405}', '\u{0455}', '\u{0457}',
];

/// Encode `text` as Windows-1251.
pub fn encode_cp1251(text: &str) -> Vec<u8> {
    text.chars().map(cp1251_byte).collect()
}

fn cp1251_byte(ch: char) -> u8 {
    let code = ch as u32;
    if code < 0x80 {
        return code as u8;
    }
    // А..я
    if (0x0410..=0x044F).contains(&code) {
        return (code - 0x0410 + 0xC0) as u8;
    }
    HIGH_HALF
        .iter()
        .position(|&c| c == ch && c != '\u{FFFD}')
        .map(|i| 0x80 + i as u8)
        .unwrap_or(b'?')
}

/// Decode Windows-1251 bytes. Trailing NUL padding is dropped.
pub fn decode_cp1251(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    bytes[..end]
        .iter()
        .map(|&b| match b {
            0x00..=0x7F => b as char,
            0x80..=0xBF => HIGH_HALF[(b - 0x80) as usize],
            _ => char::from_u32(0x0410 + (b - 0xC0) as u32).unwrap_or('\u{FFFD}'),
        })
        .collect()
}

/// Encode and cut to at most `max` bytes.
pub fn encode_truncated(text: &str, max: usize) -> Vec<u8> {
    let mut bytes = encode_cp1251(text);
    bytes.truncate(max);
    bytes
}
