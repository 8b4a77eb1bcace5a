//! Column metadata of text-protocol result sets.

#![allow(clippy::cast_possible_truncation)]

use mysqlclient_core::Result;

use crate::charset::BINARY_COLLATION;
use crate::protocol::{PacketReader, malformed};

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Look up a wire type id; ids this client does not know yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        };
        Some(ty)
    }

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Types whose text form a general converter receives as `&str`.
    pub const fn is_textual_for_converters(self) -> bool {
        matches!(
            self,
            FieldType::Decimal
                | FieldType::NewDecimal
                | FieldType::Timestamp
                | FieldType::DateTime
                | FieldType::Time
                | FieldType::Date
        )
    }

    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Blob
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition (ColumnDefinition41) of a result set.
///
/// Names are kept as raw bytes; they are decoded with the connection
/// encoding captured by the result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: Vec<u8>,
    pub schema: Vec<u8>,
    /// Table name or alias
    pub table: Vec<u8>,
    pub org_table: Vec<u8>,
    /// Column name or alias
    pub name: Vec<u8>,
    pub org_name: Vec<u8>,
    /// Collation id of the column
    pub charsetnr: u16,
    /// Declared display length
    pub length: u32,
    /// Raw wire type id
    pub type_id: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let mut field = |what: &str| {
            reader
                .read_lenenc_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| malformed(format!("column definition missing {what}")))
        };
        let catalog = field("catalog")?;
        let schema = field("schema")?;
        let table = field("table")?;
        let org_table = field("org_table")?;
        let name = field("name")?;
        let org_name = field("org_name")?;

        // Length of the fixed-size block, always 0x0c
        reader.read_lenenc_int();

        let truncated = || malformed("column definition truncated");
        let charsetnr = reader.read_u16_le().ok_or_else(truncated)?;
        let length = reader.read_u32_le().ok_or_else(truncated)?;
        let type_id = reader.read_u8().ok_or_else(truncated)?;
        let flags = reader.read_u16_le().ok_or_else(truncated)?;
        let decimals = reader.read_u8().ok_or_else(truncated)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charsetnr,
            length,
            type_id,
            flags,
            decimals,
        })
    }

    /// Known field type of the column, if any.
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u8(self.type_id)
    }

    /// Flags with BINARY derived from the column's collation.
    ///
    /// Servers may report BINARY for columns whose collation is not binary
    /// (and the reverse), so the collation id decides.
    pub fn normalized_flags(&self) -> u16 {
        if self.charsetnr == BINARY_COLLATION {
            self.flags | column_flags::BINARY
        } else {
            self.flags & !column_flags::BINARY
        }
    }

    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Does the column hold binary data (by collation)?
    pub const fn is_binary(&self) -> bool {
        self.charsetnr == BINARY_COLLATION
    }
}
