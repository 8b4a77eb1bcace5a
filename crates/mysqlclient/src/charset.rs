//! Character sets and collations.
//!
//! The server reports text columns and the connection character set by
//! collation id. Each MySQL character set maps to an `encoding_rs` encoding
//! used to decode cells and encode literals, plus the multibyte layout the
//! escaper must respect.

use std::borrow::Cow;

use encoding_rs::Encoding;
use mysqlclient_core::ConversionError;

/// Collation id of the `binary` pseudo character set.
pub const BINARY_COLLATION: u16 = 63;

/// Collation ids the handshake uses for common character sets.
pub mod collations {
    pub const BIG5_CHINESE_CI: u8 = 1;
    pub const KOI8R_GENERAL_CI: u8 = 7;
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const LATIN2_GENERAL_CI: u8 = 9;
    pub const ASCII_GENERAL_CI: u8 = 11;
    pub const UJIS_JAPANESE_CI: u8 = 12;
    pub const SJIS_JAPANESE_CI: u8 = 13;
    pub const HEBREW_GENERAL_CI: u8 = 16;
    pub const TIS620_THAI_CI: u8 = 18;
    pub const EUCKR_KOREAN_CI: u8 = 19;
    pub const KOI8U_GENERAL_CI: u8 = 22;
    pub const GB2312_CHINESE_CI: u8 = 24;
    pub const GREEK_GENERAL_CI: u8 = 25;
    pub const CP1250_GENERAL_CI: u8 = 26;
    pub const GBK_CHINESE_CI: u8 = 28;
    pub const UTF8MB3_GENERAL_CI: u8 = 33;
    pub const CP866_GENERAL_CI: u8 = 36;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const CP1251_GENERAL_CI: u8 = 51;
    pub const CP1256_GENERAL_CI: u8 = 57;
    pub const CP1257_GENERAL_CI: u8 = 59;
    pub const BINARY: u8 = 63;
    pub const CP932_JAPANESE_CI: u8 = 95;
    pub const EUCJPMS_JAPANESE_CI: u8 = 97;
    pub const GB18030_CHINESE_CI: u8 = 248;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;
}

/// Character set name of a collation id.
pub fn charset_for_collation(id: u16) -> Option<&'static str> {
    let name = match id {
        1 | 84 => "big5",
        3 | 69 => "dec8",
        4 | 80 => "cp850",
        6 | 72 => "hp8",
        7 | 74 => "koi8r",
        5 | 8 | 15 | 31 | 47..=49 | 94 => "latin1",
        2 | 9 | 21 | 27 | 77 => "latin2",
        10 | 82 => "swe7",
        11 | 65 => "ascii",
        12 | 91 => "ujis",
        13 | 88 => "sjis",
        16 | 71 => "hebrew",
        18 | 89 => "tis620",
        19 | 85 => "euckr",
        22 | 75 => "koi8u",
        24 | 86 => "gb2312",
        25 | 70 => "greek",
        26 | 34 | 44 | 66 | 99 => "cp1250",
        28 | 87 => "gbk",
        30 | 78 => "latin5",
        32 | 64 => "armscii8",
        33 | 76 | 83 | 192..=215 | 223 => "utf8mb3",
        35 | 90 | 128..=151 | 159 => "ucs2",
        36 | 68 => "cp866",
        37 | 73 => "keybcs2",
        38 | 43 => "macce",
        39 | 53 => "macroman",
        40 | 81 => "cp852",
        20 | 41 | 42 | 79 => "latin7",
        14 | 23 | 50..=52 => "cp1251",
        54 | 55 | 101..=124 | 327 => "utf16",
        56 | 62 => "utf16le",
        57 | 67 => "cp1256",
        29 | 58 | 59 => "cp1257",
        60 | 61 | 160..=183 => "utf32",
        63 => "binary",
        92 | 93 => "geostd8",
        95 | 96 => "cp932",
        97 | 98 => "eucjpms",
        45 | 46 | 224..=247 | 255..=323 => "utf8mb4",
        248..=250 => "gb18030",
        _ => return None,
    };
    Some(name)
}

/// Default collation id of a character set, for the handshake.
pub fn collation_for_charset(name: &str) -> Option<u8> {
    use collations::*;
    let id = match name {
        "utf8mb4" => UTF8MB4_GENERAL_CI,
        "utf8" | "utf8mb3" => UTF8MB3_GENERAL_CI,
        "latin1" => LATIN1_SWEDISH_CI,
        "latin2" => LATIN2_GENERAL_CI,
        "ascii" => ASCII_GENERAL_CI,
        "binary" => BINARY,
        "big5" => BIG5_CHINESE_CI,
        "gbk" => GBK_CHINESE_CI,
        "gb2312" => GB2312_CHINESE_CI,
        "gb18030" => GB18030_CHINESE_CI,
        "sjis" => SJIS_JAPANESE_CI,
        "cp932" => CP932_JAPANESE_CI,
        "ujis" => UJIS_JAPANESE_CI,
        "eucjpms" => EUCJPMS_JAPANESE_CI,
        "euckr" => EUCKR_KOREAN_CI,
        "koi8r" => KOI8R_GENERAL_CI,
        "koi8u" => KOI8U_GENERAL_CI,
        "greek" => GREEK_GENERAL_CI,
        "hebrew" => HEBREW_GENERAL_CI,
        "tis620" => TIS620_THAI_CI,
        "cp866" => CP866_GENERAL_CI,
        "cp1250" => CP1250_GENERAL_CI,
        "cp1251" => CP1251_GENERAL_CI,
        "cp1256" => CP1256_GENERAL_CI,
        "cp1257" => CP1257_GENERAL_CI,
        _ => return None,
    };
    Some(id)
}

/// Output encoding for a MySQL character set name.
///
/// `latin1` is decoded as windows-1252, which is what MySQL's latin1
/// actually stores. Names without a known encoding fall back to UTF-8.
pub fn encoding_for_charset(name: &str) -> &'static Encoding {
    let encoding = match name {
        "utf8" | "utf8mb3" | "utf8mb4" => Some(encoding_rs::UTF_8),
        "latin1" => Some(encoding_rs::WINDOWS_1252),
        "koi8r" => Some(encoding_rs::KOI8_R),
        "koi8u" => Some(encoding_rs::KOI8_U),
        "cp932" | "sjis" => Some(encoding_rs::SHIFT_JIS),
        "ujis" | "eucjpms" => Some(encoding_rs::EUC_JP),
        "euckr" => Some(encoding_rs::EUC_KR),
        "tis620" => Some(encoding_rs::WINDOWS_874),
        "macroman" => Some(encoding_rs::MACINTOSH),
        "utf16" => Some(encoding_rs::UTF_16BE),
        "utf16le" => Some(encoding_rs::UTF_16LE),
        other => Encoding::for_label(other.as_bytes()),
    };
    encoding.unwrap_or_else(|| {
        tracing::warn!(charset = name, "no encoding for character set, using utf-8");
        encoding_rs::UTF_8
    })
}

/// How a multibyte character set lays out its characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiByte {
    /// UTF-8 with at most this many bytes per character
    Utf8(usize),
    Gbk,
    Big5,
    Sjis,
    Ujis,
    Gb2312,
    Gb18030,
}

impl MultiByte {
    fn for_charset(name: &str) -> Option<Self> {
        match name {
            "utf8" | "utf8mb3" => Some(MultiByte::Utf8(3)),
            "utf8mb4" => Some(MultiByte::Utf8(4)),
            "gbk" => Some(MultiByte::Gbk),
            "big5" => Some(MultiByte::Big5),
            "sjis" | "cp932" => Some(MultiByte::Sjis),
            "ujis" | "eucjpms" => Some(MultiByte::Ujis),
            "gb2312" => Some(MultiByte::Gb2312),
            "gb18030" => Some(MultiByte::Gb18030),
            _ => None,
        }
    }

    /// Length of the character `lead` announces, 1 for single-byte.
    fn lead_len(self, lead: u8) -> usize {
        match self {
            MultiByte::Utf8(max) => match lead {
                0xC2..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF4 if max == 4 => 4,
                _ => 1,
            },
            MultiByte::Gbk | MultiByte::Gb18030 => usize::from((0x81..=0xFE).contains(&lead)) + 1,
            MultiByte::Big5 => usize::from((0xA1..=0xF9).contains(&lead)) + 1,
            MultiByte::Sjis => usize::from(matches!(lead, 0x81..=0x9F | 0xE0..=0xFC)) + 1,
            MultiByte::Ujis => match lead {
                0x8F => 3,
                0x8E | 0xA1..=0xFE => 2,
                _ => 1,
            },
            MultiByte::Gb2312 => usize::from((0xA1..=0xF7).contains(&lead)) + 1,
        }
    }

    fn max_len(self) -> usize {
        match self {
            MultiByte::Utf8(max) => max,
            MultiByte::Ujis => 3,
            MultiByte::Gb18030 => 4,
            MultiByte::Gbk | MultiByte::Big5 | MultiByte::Sjis | MultiByte::Gb2312 => 2,
        }
    }

    /// Length of the valid multibyte character at the start of `s`, or 0.
    fn char_len(self, s: &[u8]) -> usize {
        let Some(&lead) = s.first() else {
            return 0;
        };
        let in_range = |i: usize, lo: u8, hi: u8| s.get(i).is_some_and(|b| (lo..=hi).contains(b));
        let double = self.lead_len(lead) == 2;
        match self {
            MultiByte::Utf8(_) => {
                let len = self.lead_len(lead);
                if len > 1 && s.len() >= len && std::str::from_utf8(&s[..len]).is_ok() {
                    len
                } else {
                    0
                }
            }
            MultiByte::Gb18030
                if double
                    && in_range(1, 0x30, 0x39)
                    && in_range(2, 0x81, 0xFE)
                    && in_range(3, 0x30, 0x39) =>
            {
                4
            }
            MultiByte::Gbk | MultiByte::Gb18030
                if double && (in_range(1, 0x40, 0x7E) || in_range(1, 0x80, 0xFE)) =>
            {
                2
            }
            MultiByte::Big5 if double && (in_range(1, 0x40, 0x7E) || in_range(1, 0xA1, 0xFE)) => 2,
            MultiByte::Sjis if double && (in_range(1, 0x40, 0x7E) || in_range(1, 0x80, 0xFC)) => 2,
            MultiByte::Gb2312 if double && in_range(1, 0xA1, 0xFE) => 2,
            MultiByte::Ujis => match lead {
                0x8E if in_range(1, 0xA1, 0xDF) => 2,
                0x8F if in_range(1, 0xA1, 0xFE) && in_range(2, 0xA1, 0xFE) => 3,
                0xA1..=0xFE if in_range(1, 0xA1, 0xFE) => 2,
                _ => 0,
            },
            _ => 0,
        }
    }
}

/// A connection or column character set with its output encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    name: String,
    encoding: &'static Encoding,
    multibyte: Option<MultiByte>,
}

impl Charset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            encoding: encoding_for_charset(name),
            multibyte: MultiByte::for_charset(name),
        }
    }

    /// Character set of a collation id; unknown ids are treated as utf8mb4.
    pub fn from_collation(id: u16) -> Self {
        Self::new(charset_for_collation(id).unwrap_or("utf8mb4"))
    }

    pub fn utf8mb4() -> Self {
        Self::new("utf8mb4")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn is_multibyte(&self) -> bool {
        self.multibyte.is_some()
    }

    /// Widest character in bytes.
    pub fn max_char_len(&self) -> usize {
        self.multibyte.map_or(1, MultiByte::max_len)
    }

    /// Decode cell bytes, rejecting malformed input.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, ConversionError> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .ok_or_else(|| {
                ConversionError::new(format!("invalid {} byte sequence", self.encoding.name()))
            })
    }

    /// Decode bytes, replacing malformed sequences.
    pub fn decode_lossy<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        self.encoding.decode_without_bom_handling(bytes).0
    }

    /// Encode text for the wire, rejecting unmappable characters.
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>, ConversionError> {
        let (bytes, _, had_errors) = self.encoding.encode(text);
        if had_errors {
            return Err(ConversionError::new(format!(
                "text cannot be encoded as {}",
                self.encoding.name()
            )));
        }
        Ok(bytes)
    }

    /// Length of a valid multibyte character at the start of `s`, or 0.
    pub(crate) fn mb_char_len(&self, s: &[u8]) -> usize {
        self.multibyte.map_or(0, |mb| mb.char_len(s))
    }

    /// Length the lead byte claims, 1 for single-byte sets.
    pub(crate) fn mb_lead_len(&self, lead: u8) -> usize {
        self.multibyte.map_or(1, |mb| mb.lead_len(lead))
    }
}
