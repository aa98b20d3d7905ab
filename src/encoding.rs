//! Text decoding for project READMEs written in unknown encodings.
//!
//! Decoders are tried in a fixed order; the first whose output carries at
//! most [`MAX_REPLACEMENTS`] replacement characters wins.

pub const MAX_REPLACEMENTS: usize = 3;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Windows1252,
    Latin1,
}

pub const DECODE_ORDER: [TextEncoding; 4] = [
    TextEncoding::Utf8,
    TextEncoding::Utf8Bom,
    TextEncoding::Windows1252,
    TextEncoding::Latin1,
];

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf8Bom => "utf-8-sig",
            TextEncoding::Windows1252 => "windows-1252",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }

    /// Decode with replacement. `None` when the decoder does not apply
    /// (BOM present for plain UTF-8, absent for UTF-8-with-BOM).
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => {
                if bytes.starts_with(UTF8_BOM) {
                    None
                } else {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
            }
            TextEncoding::Utf8Bom => bytes
                .strip_prefix(UTF8_BOM)
                .map(|rest| String::from_utf8_lossy(rest).into_owned()),
            TextEncoding::Windows1252 => Some(bytes.iter().map(|&b| windows_1252_char(b)).collect()),
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// First acceptable decoding in [`DECODE_ORDER`], or `None` if every decoder
/// produced too many replacement characters.
pub fn decode_text(bytes: &[u8]) -> Option<(String, TextEncoding)> {
    DECODE_ORDER.iter().find_map(|&encoding| {
        let text = encoding.decode(bytes)?;
        let replaced = text.chars().filter(|&c| c == REPLACEMENT).count();
        if replaced <= MAX_REPLACEMENTS {
            Some((text, encoding))
        } else {
            tracing::trace!(encoding = encoding.name(), replaced, "decoder rejected");
            None
        }
    })
}

/// Windows-1252: Latin-1 with printable characters in 0x80..=0x9F.
fn windows_1252_char(byte: u8) -> char {
    const HIGH: [char; 32] = [
        '\u{20AC}', REPLACEMENT, '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}',
        '\u{2021}', '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', REPLACEMENT,
        '\u{017D}', REPLACEMENT, REPLACEMENT, '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}',
        '\u{2022}', '\u{2013}', '\u{2014}', '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
        '\u{0153}', REPLACEMENT, '\u{017E}', '\u{0178}',
    ];
    match byte {
        0x80..=0x9F => HIGH[(byte - 0x80) as usize],
        _ => byte as char,
    }
}
