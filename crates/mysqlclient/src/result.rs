//! Result sets returned by [`Connection::store_result`] and
//! [`Connection::use_result`].
//!
//! Column metadata, converters and the connection character set are captured
//! when the result set is created. Stored results keep every row payload in
//! memory; streamed results read rows from the connection on demand.

#![allow(clippy::cast_possible_truncation)]

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use mysqlclient_core::{ColumnInfo, Error, Record, Result, Row, Value, codes};

use crate::charset::Charset;
use crate::connection::Connection;
use crate::convert::{Converter, ConverterMap, decode_cell};
use crate::protocol::{PacketReader, malformed};
use crate::types::ColumnDef;

/// Form in which [`ResultSet::fetch_rows`] returns records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchShape {
    /// Values in column order
    #[default]
    Tuple,
    /// Keyed by column name; a repeated name is keyed as `table.name`
    Dict,
    /// Keyed by `table.name` whenever the column has a table
    DictQualified,
}

/// One column in DB-API `description` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub name: String,
    pub type_code: u8,
    /// Longest value in a stored result, 0 for a streamed one
    pub display_size: u64,
    pub internal_size: u64,
    pub precision: u64,
    pub scale: u8,
    pub null_ok: bool,
}

/// Converter of every column, resolved once per result set.
pub(crate) fn resolve_converters(conv: &ConverterMap, columns: &[ColumnDef]) -> Vec<Option<Converter>> {
    columns.iter().map(|column| conv.resolve(column)).collect()
}

enum RowSource<'c> {
    Stored {
        rows: Vec<Vec<u8>>,
        position: usize,
    },
    Streaming {
        conn: &'c mut Connection,
        fetched: u64,
        done: bool,
    },
}

impl RowSource<'_> {
    /// Payload of the next row, `None` once the rows are exhausted.
    fn next_row(&mut self) -> Result<Option<Cow<'_, [u8]>>> {
        match self {
            RowSource::Stored { rows, position } => {
                let row = rows.get(*position).map(|r| Cow::Borrowed(r.as_slice()));
                if row.is_some() {
                    *position += 1;
                }
                Ok(row)
            }
            RowSource::Streaming {
                conn,
                fetched,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                match conn.read_row()? {
                    Some(row) => {
                        *fetched += 1;
                        Ok(Some(Cow::Owned(row)))
                    }
                    None => {
                        *done = true;
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Rows of one statement's result.
pub struct ResultSet<'c> {
    columns: Vec<ColumnDef>,
    converters: Vec<Option<Converter>>,
    charset: Charset,
    /// Longest cell per column; only known for stored results
    max_lengths: Vec<u64>,
    /// Another result of the same statement follows this one
    has_next: bool,
    source: RowSource<'c>,
}

impl std::fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.source {
            RowSource::Stored { .. } => "stored",
            RowSource::Streaming { .. } => "streaming",
        };
        f.debug_struct("ResultSet")
            .field("mode", &mode)
            .field("num_fields", &self.columns.len())
            .field("charset", &self.charset.name())
            .field("has_next", &self.has_next())
            .finish_non_exhaustive()
    }
}

impl ResultSet<'static> {
    pub(crate) fn stored(
        columns: Vec<ColumnDef>,
        converters: Vec<Option<Converter>>,
        charset: Charset,
        rows: Vec<Vec<u8>>,
        has_next: bool,
    ) -> Result<Self> {
        let mut max_lengths = vec![0u64; columns.len()];
        for row in &rows {
            for (max, cell) in max_lengths.iter_mut().zip(split_row(row, columns.len())?) {
                *max = (*max).max(cell.map_or(0, |c| c.len() as u64));
            }
        }
        Ok(Self {
            columns,
            converters,
            charset,
            max_lengths,
            has_next,
            source: RowSource::Stored { rows, position: 0 },
        })
    }
}

impl<'c> ResultSet<'c> {
    pub(crate) fn streaming(
        columns: Vec<ColumnDef>,
        converters: Vec<Option<Converter>>,
        charset: Charset,
        conn: &'c mut Connection,
    ) -> Self {
        let max_lengths = vec![0; columns.len()];
        let has_next = conn.more_results();
        Self {
            columns,
            converters,
            charset,
            max_lengths,
            has_next,
            source: RowSource::Streaming {
                conn,
                fetched: 0,
                done: false,
            },
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.source, RowSource::Streaming { .. })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Character set cells are decoded with.
    pub fn charset(&self) -> &Charset {
        &self.charset
    }

    /// Whether the statement has more results after this one.
    ///
    /// A streamed result learns this from the server's final row packet, so
    /// the answer is only settled once its rows are exhausted.
    pub fn has_next(&self) -> bool {
        match &self.source {
            RowSource::Streaming {
                conn, done: true, ..
            } => conn.more_results(),
            _ => self.has_next,
        }
    }

    pub fn num_fields(&self) -> usize {
        self.columns.len()
    }

    /// Rows in a stored result; for a streamed result, the rows fetched so
    /// far, which is the total only once it is exhausted.
    pub fn num_rows(&self) -> u64 {
        match &self.source {
            RowSource::Stored { rows, .. } => rows.len() as u64,
            RowSource::Streaming { fetched, .. } => *fetched,
        }
    }

    /// Per-column name, type, sizes, decimals and nullability.
    pub fn describe(&self) -> Vec<Description> {
        self.columns
            .iter()
            .zip(&self.max_lengths)
            .map(|(column, &max_length)| Description {
                name: self.charset.decode_lossy(&column.name).into_owned(),
                type_code: column.type_id,
                display_size: max_length,
                internal_size: u64::from(column.length),
                precision: u64::from(column.length),
                scale: column.decimals,
                null_ok: column.is_nullable(),
            })
            .collect()
    }

    /// Raw flag bitmask of every column.
    pub fn field_flags(&self) -> Vec<u16> {
        self.columns.iter().map(|c| c.flags).collect()
    }

    /// Fetch up to `max_rows` records; 0 fetches all remaining rows.
    ///
    /// An error while reading or decoding any row fails the whole call and
    /// drops the records decoded so far.
    pub fn fetch_rows(&mut self, max_rows: usize, shape: FetchShape) -> Result<Vec<Record>> {
        let limit = if max_rows == 0 { usize::MAX } else { max_rows };
        let mut records = Vec::new();
        let mut keys: Option<Arc<ColumnInfo>> = None;

        while records.len() < limit {
            let Some(payload) = self.source.next_row()? else {
                break;
            };
            let values = decode_row(&payload, &self.columns, &self.converters, &self.charset)?;
            let record = match shape {
                FetchShape::Tuple => Record::Tuple(values),
                FetchShape::Dict | FetchShape::DictQualified => {
                    let keys = keys.get_or_insert_with(|| {
                        record_keys(
                            &self.columns,
                            &self.charset,
                            shape == FetchShape::DictQualified,
                        )
                    });
                    Record::Keyed(Row::with_columns(Arc::clone(keys), values))
                }
            };
            records.push(record);
        }
        Ok(records)
    }

    /// Move to row `n` of a stored result.
    pub fn data_seek(&mut self, n: u64) -> Result<()> {
        match &mut self.source {
            RowSource::Stored { rows, position } => {
                *position = usize::try_from(n).map_or(rows.len(), |n| n.min(rows.len()));
                Ok(())
            }
            RowSource::Streaming { .. } => Err(Error::client(
                codes::CR_COMMANDS_OUT_OF_SYNC,
                "data_seek cannot be used with a streamed result",
            )),
        }
    }

    /// Position of the next row of a stored result.
    pub fn row_tell(&self) -> Option<u64> {
        match &self.source {
            RowSource::Stored { position, .. } => Some(*position as u64),
            RowSource::Streaming { .. } => None,
        }
    }

    /// Drop the remaining rows without decoding them.
    ///
    /// A streamed result reads them off the wire, leaving the connection
    /// ready for the next command.
    pub fn discard(&mut self) -> Result<()> {
        match &mut self.source {
            RowSource::Stored { rows, position } => {
                *position = rows.len();
                Ok(())
            }
            RowSource::Streaming {
                conn,
                fetched,
                done,
            } => {
                if *done {
                    return Ok(());
                }
                while conn.read_row()?.is_some() {
                    *fetched += 1;
                }
                *done = true;
                Ok(())
            }
        }
    }
}

/// Split a text-protocol row into its cells.
fn split_row(payload: &[u8], count: usize) -> Result<Vec<Option<&[u8]>>> {
    let mut reader = PacketReader::new(payload);
    (0..count)
        .map(|i| {
            reader
                .read_cell()
                .ok_or_else(|| malformed(format!("row ends before column {i}")))
        })
        .collect()
}

fn decode_row(
    payload: &[u8],
    columns: &[ColumnDef],
    converters: &[Option<Converter>],
    charset: &Charset,
) -> Result<Vec<Value>> {
    let cells = split_row(payload, columns.len())?;
    cells
        .into_iter()
        .zip(columns.iter().zip(converters))
        .map(|(cell, (column, converter))| {
            decode_cell(cell, converter.as_ref(), column, charset).map_err(|e| {
                Error::Conversion(
                    e.in_column(charset.decode_lossy(&column.name), column.type_id),
                )
            })
        })
        .collect()
}

/// Record keys for a keyed fetch.
fn record_keys(columns: &[ColumnDef], charset: &Charset, qualified: bool) -> Arc<ColumnInfo> {
    let mut emitted = HashSet::new();
    let names = columns
        .iter()
        .map(|column| {
            let name = charset.decode_lossy(&column.name).into_owned();
            let table = charset.decode_lossy(&column.table);
            // A taken key is qualified even when the table is empty (`.name`)
            let key = if (qualified && !table.is_empty()) || emitted.contains(&name) {
                format!("{table}.{name}")
            } else {
                name
            };
            emitted.insert(key.clone());
            key
        })
        .collect();
    Arc::new(ColumnInfo::new(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::column_flags::{BINARY, NOT_NULL};
    use crate::types::tests::column_packet;

    fn column(table: &str, name: &str, type_id: u8, flags: u16, charsetnr: u16) -> ColumnDef {
        ColumnDef::parse(&column_packet(table, name, type_id, flags, charsetnr)).unwrap()
    }

    fn row(cells: &[Option<&[u8]>]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            match cell {
                Some(bytes) => w.write_lenenc_bytes(bytes),
                None => w.write_u8(0xFB),
            }
        }
        w.into_bytes()
    }

    fn stored(columns: Vec<ColumnDef>, rows: Vec<Vec<u8>>, conv: &ConverterMap) -> ResultSet<'static> {
        let converters = resolve_converters(conv, &columns);
        ResultSet::stored(columns, converters, Charset::utf8mb4(), rows, false).unwrap()
    }

    fn users() -> ResultSet<'static> {
        let columns = vec![
            column("users", "id", 3, NOT_NULL, 63),
            column("users", "name", 253, 0, 255),
        ];
        let rows = vec![
            row(&[Some(b"1"), Some(b"alice")]),
            row(&[Some(b"2"), None]),
            row(&[Some(b"3"), Some(b"carol")]),
        ];
        stored(columns, rows, &ConverterMap::standard())
    }

    #[test]
    fn test_fetch_all_tuples() {
        let mut result = users();
        assert_eq!(result.num_rows(), 3);
        assert_eq!(result.num_fields(), 2);
        let records = result.fetch_rows(0, FetchShape::Tuple).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].as_tuple().unwrap(),
            &[Value::Int(1), Value::Text("alice".into())]
        );
        assert_eq!(records[1].get(1), Some(&Value::Null));
        assert!(result.fetch_rows(0, FetchShape::Tuple).unwrap().is_empty());
    }

    #[test]
    fn test_fetch_in_batches_and_seek() {
        let mut result = users();
        assert_eq!(result.fetch_rows(2, FetchShape::Tuple).unwrap().len(), 2);
        assert_eq!(result.row_tell(), Some(2));
        assert_eq!(result.fetch_rows(2, FetchShape::Tuple).unwrap().len(), 1);
        result.data_seek(1).unwrap();
        let records = result.fetch_rows(1, FetchShape::Tuple).unwrap();
        assert_eq!(records[0].get(0), Some(&Value::Int(2)));
        result.data_seek(100).unwrap();
        assert!(result.fetch_rows(0, FetchShape::Tuple).unwrap().is_empty());
    }

    #[test]
    fn test_dict_duplicate_names_use_table_prefix() {
        let columns = vec![
            column("users", "id", 3, 0, 63),
            column("orders", "id", 3, 0, 63),
        ];
        let rows = vec![row(&[Some(b"1"), Some(b"10")]), row(&[Some(b"2"), Some(b"20")])];
        let mut result = stored(columns, rows, &ConverterMap::standard());
        let records = result.fetch_rows(0, FetchShape::Dict).unwrap();
        let first = records[0].as_row().unwrap();
        assert_eq!(first.get_by_name("id"), Some(&Value::Int(1)));
        assert_eq!(first.get_by_name("orders.id"), Some(&Value::Int(10)));
        let second = records[1].as_row().unwrap();
        assert!(Arc::ptr_eq(&first.column_info(), &second.column_info()));
    }

    #[test]
    fn test_dict_qualified_always_prefixes() {
        let columns = vec![column("users", "id", 3, 0, 63), column("", "n", 8, 0, 63)];
        let rows = vec![row(&[Some(b"7"), Some(b"1")])];
        let mut result = stored(columns, rows, &ConverterMap::standard());
        let records = result.fetch_rows(0, FetchShape::DictQualified).unwrap();
        let keyed = records[0].as_row().unwrap();
        assert_eq!(keyed.get_by_name("users.id"), Some(&Value::Int(7)));
        assert_eq!(keyed.get_by_name("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_empty_converter_map_yields_bytes() {
        let columns = vec![column("t", "n", 3, 0, 63)];
        let mut result = stored(columns, vec![row(&[Some(b"42")])], &ConverterMap::empty());
        let records = result.fetch_rows(0, FetchShape::Tuple).unwrap();
        assert_eq!(records[0].get(0), Some(&Value::Bytes(b"42".to_vec())));
    }

    #[test]
    fn test_decode_error_discards_partial_output() {
        let columns = vec![column("t", "n", 3, 0, 63)];
        let rows = vec![row(&[Some(b"1")]), row(&[Some(b"x")])];
        let mut result = stored(columns, rows, &ConverterMap::standard());
        let err = result.fetch_rows(0, FetchShape::Tuple).unwrap_err();
        assert!(matches!(err, Error::Conversion(ref e) if e.column.as_deref() == Some("n")));
    }

    #[test]
    fn test_truncated_row_is_malformed() {
        let columns = vec![column("t", "a", 3, 0, 63), column("t", "b", 3, 0, 63)];
        let converters = resolve_converters(&ConverterMap::standard(), &columns);
        let err = ResultSet::stored(
            columns,
            converters,
            Charset::utf8mb4(),
            vec![row(&[Some(b"1")])],
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::CR_MALFORMED_PACKET);
    }

    #[test]
    fn test_describe_and_flags() {
        let result = users();
        let description = result.describe();
        assert_eq!(description[0].name, "id");
        assert_eq!(description[0].type_code, 3);
        assert_eq!(description[0].display_size, 1);
        assert_eq!(description[0].internal_size, 11);
        assert!(!description[0].null_ok);
        assert_eq!(description[1].display_size, 5);
        assert!(description[1].null_ok);
        assert_eq!(result.field_flags(), vec![NOT_NULL, 0]);
    }

    #[test]
    fn test_latin1_text_uses_cp1252() {
        let columns = vec![column("t", "s", 253, 0, 8)];
        let converters = resolve_converters(&ConverterMap::standard(), &columns);
        let mut result = ResultSet::stored(
            columns,
            converters,
            Charset::new("latin1"),
            vec![row(&[Some(b"\x80")])],
            false,
        )
        .unwrap();
        let records = result.fetch_rows(0, FetchShape::Tuple).unwrap();
        assert_eq!(records[0].get(0), Some(&Value::Text("\u{20ac}".into())));
    }

    #[test]
    fn test_binary_string_stays_bytes() {
        let columns = vec![column("t", "b", 254, BINARY, 63)];
        let mut result = stored(columns, vec![row(&[Some(b"\x00\xff")])], &ConverterMap::standard());
        let records = result.fetch_rows(0, FetchShape::Tuple).unwrap();
        assert_eq!(records[0].get(0), Some(&Value::Bytes(vec![0, 0xff])));
    }

    #[test]
    fn test_dict_repeated_name_without_table() {
        let columns = vec![column("", "x", 3, 0, 63), column("", "x", 3, 0, 63)];
        let mut result = stored(columns, vec![row(&[Some(b"1"), Some(b"2")])], &ConverterMap::standard());
        let records = result.fetch_rows(0, FetchShape::Dict).unwrap();
        let keyed = records[0].as_row().unwrap();
        assert_eq!(keyed.column_names().collect::<Vec<_>>(), ["x", ".x"]);
        assert_eq!(keyed.get_by_name("x"), Some(&Value::Int(1)));
        assert_eq!(keyed.get_by_name(".x"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_stored_result_reports_following_result() {
        let columns = vec![column("t", "n", 3, 0, 63)];
        let converters = resolve_converters(&ConverterMap::standard(), &columns);
        let result =
            ResultSet::stored(columns, converters, Charset::utf8mb4(), Vec::new(), true).unwrap();
        assert!(result.has_next());
        assert!(!users().has_next());
    }
}
