//! Per-column converters.
//!
//! A [`ConverterMap`] maps a wire type id either to one [`Converter`] or to
//! a prioritized list of `(flag mask, converter)` pairs. Result sets resolve
//! the map once per column when they are created, and the row decoder then
//! applies the resolved converter to every cell of that column.
//!
//! Three converters have fast paths in the decoder: [`Converter::Text`]
//! decodes with the connection encoding, [`Converter::Bytes`] keeps the raw
//! bytes and [`Converter::Int`] parses base-10 text. Anything else is a
//! [`Convert`] implementation supplied by the caller or by
//! [`ConverterMap::standard`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mysqlclient_core::{ConversionError, Value};

use crate::charset::Charset;
use crate::types::{ColumnDef, FieldType, column_flags};

/// Raw cell handed to a general converter.
///
/// Decimal and temporal columns arrive as text, everything else as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellInput<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> CellInput<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            CellInput::Text(s) => s.as_bytes(),
            CellInput::Bytes(b) => b,
        }
    }

    /// The cell as UTF-8 text.
    pub fn to_str(&self) -> Result<&'a str, ConversionError> {
        match *self {
            CellInput::Text(s) => Ok(s),
            CellInput::Bytes(b) => std::str::from_utf8(b)
                .map_err(|e| ConversionError::new("invalid utf-8").with_source(e)),
        }
    }
}

/// A conversion from a raw cell to a [`Value`].
pub trait Convert: Send + Sync {
    fn convert(&self, input: CellInput<'_>, column: &ColumnDef) -> Result<Value, ConversionError>;
}

impl<F> Convert for F
where
    F: Fn(CellInput<'_>, &ColumnDef) -> Result<Value, ConversionError> + Send + Sync,
{
    fn convert(&self, input: CellInput<'_>, column: &ColumnDef) -> Result<Value, ConversionError> {
        self(input, column)
    }
}

/// What to do with the cells of one column.
#[derive(Clone)]
pub enum Converter {
    /// Decode with the connection encoding
    Text,
    /// Keep the raw bytes
    Bytes,
    /// Parse a base-10 integer
    Int,
    /// Call a general converter
    Custom(Arc<dyn Convert>),
}

impl Converter {
    pub fn custom(convert: impl Convert + 'static) -> Self {
        Converter::Custom(Arc::new(convert))
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Converter::Text => f.write_str("Text"),
            Converter::Bytes => f.write_str("Bytes"),
            Converter::Int => f.write_str("Int"),
            Converter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Flag condition of a flag-dependent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMask {
    /// Matches when any of these flag bits is set
    Bits(u16),
    /// Always matches
    Any,
}

impl FlagMask {
    pub const fn matches(self, flags: u16) -> bool {
        match self {
            FlagMask::Bits(mask) => mask & flags != 0,
            FlagMask::Any => true,
        }
    }
}

/// Entry of a [`ConverterMap`].
#[derive(Debug, Clone)]
pub enum ConverterEntry {
    Fixed(Converter),
    /// First pair whose mask matches the column flags wins
    ByFlags(Vec<(FlagMask, Converter)>),
}

impl From<Converter> for ConverterEntry {
    fn from(converter: Converter) -> Self {
        ConverterEntry::Fixed(converter)
    }
}

impl From<Vec<(FlagMask, Converter)>> for ConverterEntry {
    fn from(pairs: Vec<(FlagMask, Converter)>) -> Self {
        ConverterEntry::ByFlags(pairs)
    }
}

/// Mapping from wire type id to converter.
#[derive(Debug, Clone)]
pub struct ConverterMap {
    entries: HashMap<u8, ConverterEntry>,
}

impl Default for ConverterMap {
    fn default() -> Self {
        Self::standard()
    }
}

impl ConverterMap {
    /// A map with no entries: every column yields raw bytes.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The default conversions.
    pub fn standard() -> Self {
        let mut map = Self::empty();
        for ty in [
            FieldType::Tiny,
            FieldType::Short,
            FieldType::Long,
            FieldType::LongLong,
            FieldType::Int24,
            FieldType::Year,
        ] {
            map.insert(ty.id(), Converter::Int);
        }
        map.insert(FieldType::Float.id(), Converter::custom(to_float));
        map.insert(FieldType::Double.id(), Converter::custom(to_float));
        map.insert(FieldType::Decimal.id(), Converter::custom(to_decimal));
        map.insert(FieldType::NewDecimal.id(), Converter::custom(to_decimal));
        map.insert(FieldType::Date.id(), Converter::custom(to_date));
        map.insert(FieldType::DateTime.id(), Converter::custom(to_timestamp));
        map.insert(FieldType::Timestamp.id(), Converter::custom(to_timestamp));
        map.insert(FieldType::Time.id(), Converter::custom(to_time));
        map.insert(FieldType::Json.id(), Converter::custom(to_json));
        map.insert(FieldType::Bit.id(), Converter::Bytes);
        map.insert(FieldType::Geometry.id(), Converter::Bytes);
        for ty in [
            FieldType::String,
            FieldType::VarString,
            FieldType::VarChar,
            FieldType::Enum,
            FieldType::Set,
            FieldType::TinyBlob,
            FieldType::MediumBlob,
            FieldType::LongBlob,
            FieldType::Blob,
        ] {
            map.insert(
                ty.id(),
                vec![
                    (FlagMask::Bits(column_flags::BINARY), Converter::Bytes),
                    (FlagMask::Any, Converter::Text),
                ],
            );
        }
        map
    }

    pub fn insert(&mut self, type_id: u8, entry: impl Into<ConverterEntry>) -> &mut Self {
        self.entries.insert(type_id, entry.into());
        self
    }

    pub fn remove(&mut self, type_id: u8) -> Option<ConverterEntry> {
        self.entries.remove(&type_id)
    }

    pub fn get(&self, type_id: u8) -> Option<&ConverterEntry> {
        self.entries.get(&type_id)
    }

    /// Converter for a column, or `None` to keep raw bytes.
    pub fn resolve(&self, column: &ColumnDef) -> Option<Converter> {
        match self.entries.get(&column.type_id)? {
            ConverterEntry::Fixed(converter) => Some(converter.clone()),
            ConverterEntry::ByFlags(pairs) => {
                let flags = column.normalized_flags();
                pairs
                    .iter()
                    .find(|(mask, _)| mask.matches(flags))
                    .map(|(_, converter)| converter.clone())
            }
        }
    }
}

/// Decode one cell of `column`.
pub(crate) fn decode_cell(
    cell: Option<&[u8]>,
    converter: Option<&Converter>,
    column: &ColumnDef,
    charset: &Charset,
) -> Result<Value, ConversionError> {
    let Some(bytes) = cell else {
        return Ok(Value::Null);
    };
    match converter {
        None | Some(Converter::Bytes) => Ok(Value::Bytes(bytes.to_vec())),
        Some(Converter::Text) => charset
            .decode(bytes)
            .map(|text| Value::Text(text.into_owned())),
        Some(Converter::Int) => parse_int(bytes),
        Some(Converter::Custom(convert)) => {
            let textual = column
                .field_type()
                .is_some_and(FieldType::is_textual_for_converters);
            let input = if textual {
                CellInput::Text(
                    std::str::from_utf8(bytes)
                        .map_err(|e| ConversionError::new("invalid utf-8").with_source(e))?,
                )
            } else {
                CellInput::Bytes(bytes)
            };
            convert.convert(input, column)
        }
    }
}

fn parse_int(bytes: &[u8]) -> Result<Value, ConversionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ConversionError::new("invalid integer text").with_source(e))?;
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Value::Int(v));
    }
    text.parse::<u64>()
        .map(Value::UInt)
        .map_err(|e| ConversionError::new(format!("invalid integer '{text}'")).with_source(e))
}

fn to_float(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    text.trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|e| ConversionError::new(format!("invalid float '{text}'")).with_source(e))
}

fn to_decimal(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    let digits = text.strip_prefix('-').unwrap_or(text);
    let valid = !digits.is_empty()
        && digits.bytes().filter(|&b| b == b'.').count() <= 1
        && digits.bytes().all(|b| b.is_ascii_digit() || b == b'.');
    if valid {
        Ok(Value::Decimal(text.to_string()))
    } else {
        Err(ConversionError::new(format!("invalid decimal '{text}'")))
    }
}

fn to_date(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    Ok(temporal::parse_date(text)
        .and_then(|(y, m, d)| Value::date(y, m, d))
        .unwrap_or(Value::Null))
}

fn to_timestamp(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    Ok(temporal::parse_datetime(text).unwrap_or(Value::Null))
}

fn to_time(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    Ok(temporal::parse_time(text).map_or(Value::Null, Value::Time))
}

fn to_json(input: CellInput<'_>, _: &ColumnDef) -> Result<Value, ConversionError> {
    let text = input.to_str()?;
    Ok(serde_json::from_str(text).map_or_else(|_| Value::Text(text.to_string()), Value::Json))
}

/// Parsers for the text forms of DATE, DATETIME and TIME.
mod temporal {
    use mysqlclient_core::Value;

    fn number(s: &str) -> Option<u32> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    }

    /// Fractional seconds as microseconds, padding or truncating to 6 digits.
    fn micros(frac: &str) -> Option<u32> {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut digits: String = frac.chars().take(6).collect();
        while digits.len() < 6 {
            digits.push('0');
        }
        digits.parse().ok()
    }

    pub(super) fn parse_date(s: &str) -> Option<(i32, u32, u32)> {
        let mut parts = s.splitn(3, '-');
        let year = i32::try_from(number(parts.next()?)?).ok()?;
        let month = number(parts.next()?)?;
        let day = number(parts.next()?)?;
        Some((year, month, day))
    }

    /// `HH:MM:SS[.ffffff]` as (hours, minutes, seconds, micros).
    fn parse_clock(s: &str) -> Option<(u32, u32, u32, u32)> {
        let (hms, frac) = match s.split_once('.') {
            Some((hms, frac)) => (hms, micros(frac)?),
            None => (s, 0),
        };
        let mut parts = hms.splitn(3, ':');
        let hours = number(parts.next()?)?;
        let minutes = number(parts.next()?)?;
        let seconds = number(parts.next()?)?;
        Some((hours, minutes, seconds, frac))
    }

    pub(super) fn parse_datetime(s: &str) -> Option<Value> {
        let (date, clock) = match s.split_once([' ', 'T']) {
            Some((date, clock)) => (date, Some(clock)),
            None => (s, None),
        };
        let (year, month, day) = parse_date(date)?;
        let (h, mi, sec, us) = match clock {
            Some(clock) => parse_clock(clock)?,
            None => (0, 0, 0, 0),
        };
        Value::timestamp(year, month, day, h, mi, sec, us)
    }

    /// Signed `[-]H+:MM:SS[.ffffff]` as microseconds.
    pub(super) fn parse_time(s: &str) -> Option<i64> {
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (h, mi, sec, us) = parse_clock(body)?;
        if mi > 59 || sec > 59 {
            return None;
        }
        let total = ((i64::from(h) * 60 + i64::from(mi)) * 60 + i64::from(sec)) * 1_000_000
            + i64::from(us);
        Some(if negative { -total } else { total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::column_packet;

    fn column(type_id: u8, flags: u16, charsetnr: u16) -> ColumnDef {
        ColumnDef::parse(&column_packet("t", "c", type_id, flags, charsetnr)).unwrap()
    }

    fn decode(map: &ConverterMap, col: &ColumnDef, cell: Option<&[u8]>) -> Value {
        let conv = map.resolve(col);
        decode_cell(cell, conv.as_ref(), col, &Charset::utf8mb4()).unwrap()
    }

    #[test]
    fn test_null_cell_is_null() {
        let map = ConverterMap::standard();
        let col = column(FieldType::Long.id(), 0, 63);
        assert_eq!(decode(&map, &col, None), Value::Null);
    }

    #[test]
    fn test_absent_entry_yields_raw_bytes() {
        let map = ConverterMap::empty();
        let col = column(FieldType::Long.id(), 0, 63);
        assert_eq!(decode(&map, &col, Some(b"42")), Value::Bytes(b"42".to_vec()));
    }

    #[test]
    fn test_standard_integers() {
        let map = ConverterMap::standard();
        let col = column(FieldType::LongLong.id(), column_flags::UNSIGNED, 63);
        assert_eq!(decode(&map, &col, Some(b"-7")), Value::Int(-7));
        assert_eq!(
            decode(&map, &col, Some(b"18446744073709551615")),
            Value::UInt(u64::MAX)
        );
        let err = decode_cell(Some(b"4x"), Some(&Converter::Int), &col, &Charset::utf8mb4());
        assert!(err.is_err());
    }

    #[test]
    fn test_binary_flag_normalized_from_collation() {
        let map = ConverterMap::standard();
        // Server claims BINARY but the collation is utf8mb4
        let text_col = column(FieldType::Blob.id(), column_flags::BINARY, 45);
        assert_eq!(
            decode(&map, &text_col, Some(b"hello")),
            Value::Text("hello".to_string())
        );
        // No BINARY flag but binary collation
        let blob_col = column(FieldType::Blob.id(), 0, 63);
        assert_eq!(
            decode(&map, &blob_col, Some(b"\x00\xff")),
            Value::Bytes(vec![0, 0xff])
        );
    }

    #[test]
    fn test_flag_list_without_match_is_raw() {
        let mut map = ConverterMap::empty();
        map.insert(
            FieldType::VarString.id(),
            vec![(FlagMask::Bits(column_flags::ENUM), Converter::Text)],
        );
        let col = column(FieldType::VarString.id(), 0, 45);
        assert!(map.resolve(&col).is_none());
    }

    #[test]
    fn test_text_uses_connection_encoding() {
        let map = ConverterMap::standard();
        let col = column(FieldType::VarString.id(), 0, 8);
        let conv = map.resolve(&col);
        let latin1 = Charset::new("latin1");
        let value = decode_cell(Some(b"\x80"), conv.as_ref(), &col, &latin1).unwrap();
        assert_eq!(value, Value::Text("\u{20ac}".to_string()));
    }

    #[test]
    fn test_temporal_values() {
        let map = ConverterMap::standard();
        let date = column(FieldType::Date.id(), 0, 63);
        assert_eq!(
            decode(&map, &date, Some(b"2024-02-29")),
            Value::date(2024, 2, 29).unwrap()
        );
        assert_eq!(decode(&map, &date, Some(b"0000-00-00")), Value::Null);

        let dt = column(FieldType::DateTime.id(), 0, 63);
        assert_eq!(
            decode(&map, &dt, Some(b"2024-01-02 03:04:05.5")),
            Value::timestamp(2024, 1, 2, 3, 4, 5, 500_000).unwrap()
        );
        assert_eq!(decode(&map, &dt, Some(b"0000-00-00 00:00:00")), Value::Null);

        let time = column(FieldType::Time.id(), 0, 63);
        assert_eq!(
            decode(&map, &time, Some(b"-838:59:59")),
            Value::Time(-(838 * 3600 + 59 * 60 + 59) * 1_000_000)
        );
        assert_eq!(decode(&map, &time, Some(b"12:3x:00")), Value::Null);
    }

    #[test]
    fn test_decimal_float_and_json() {
        let map = ConverterMap::standard();
        let dec = column(FieldType::NewDecimal.id(), 0, 63);
        assert_eq!(
            decode(&map, &dec, Some(b"-12.50")),
            Value::Decimal("-12.50".to_string())
        );

        let dbl = column(FieldType::Double.id(), 0, 63);
        assert_eq!(decode(&map, &dbl, Some(b"1.5e3")), Value::Float(1500.0));

        let json = column(FieldType::Json.id(), 0, 63);
        assert_eq!(
            decode(&map, &json, Some(br#"{"a": [1, 2]}"#)),
            Value::Json(serde_json::json!({"a": [1, 2]}))
        );
    }

    #[test]
    fn test_custom_converter_receives_text_for_decimal() {
        let mut map = ConverterMap::empty();
        map.insert(
            FieldType::NewDecimal.id(),
            Converter::custom(|input: CellInput<'_>, _: &ColumnDef| {
                assert!(matches!(input, CellInput::Text(_)));
                Ok(Value::Text(format!("dec:{}", input.to_str()?)))
            }),
        );
        map.insert(
            FieldType::Blob.id(),
            Converter::custom(|input: CellInput<'_>, _: &ColumnDef| {
                assert!(matches!(input, CellInput::Bytes(_)));
                Ok(Value::Int(input.as_bytes().len() as i64))
            }),
        );
        let dec = column(FieldType::NewDecimal.id(), 0, 63);
        assert_eq!(
            decode(&map, &dec, Some(b"1.0")),
            Value::Text("dec:1.0".to_string())
        );
        let blob = column(FieldType::Blob.id(), 0, 63);
        assert_eq!(decode(&map, &blob, Some(b"abc")), Value::Int(3));
    }

    #[test]
    fn test_converter_error_propagates() {
        let mut map = ConverterMap::empty();
        map.insert(
            FieldType::Long.id(),
            Converter::custom(|_: CellInput<'_>, _: &ColumnDef| {
                Err(ConversionError::new("rejected"))
            }),
        );
        let col = column(FieldType::Long.id(), 0, 63);
        let conv = map.resolve(&col);
        assert!(decode_cell(Some(b"1"), conv.as_ref(), &col, &Charset::utf8mb4()).is_err());
    }
}
