//! Core types for the mysqlclient crate.
//!
//! - `Error` and the fixed `ErrorCategory` taxonomy with `classify`
//! - `Value`, the decoded form of a result-set cell
//! - `Row` / `Record`, the shapes rows are fetched in

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ClientError, ConfigError, ConfigErrorKind, ConversionError, Error, ErrorCategory, Result,
    ServerError, classify, codes,
};
pub use row::{ColumnInfo, Record, Row};
pub use value::Value;
