//! Self-contained MySQL client.
//!
//! This crate speaks the MySQL client/server protocol directly over TCP,
//! Unix sockets or Windows named pipes. It provides:
//!
//! - Packet framing, the compressed protocol and optional TLS (`tls` feature)
//! - Pluggable authentication (native, caching_sha2, sha256, cleartext)
//! - Text-protocol queries, multi-statement results and LOCAL INFILE
//! - Stored and streamed result sets with per-type converters
//! - Charset-aware literal escaping
//!
//! # Example
//!
//! ```rust,ignore
//! use mysqlclient::{Connection, ConnectOptions, FetchShape};
//!
//! let options = ConnectOptions::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = Connection::connect(&options)?;
//! conn.query("SELECT id, name FROM users")?;
//! if let Some(mut result) = conn.store_result()? {
//!     for record in result.fetch_rows(0, FetchShape::Dict)? {
//!         println!("{record:?}");
//!     }
//! }
//! ```

pub mod auth;
pub mod charset;
mod compress;
pub mod config;
pub mod connection;
pub mod convert;
pub mod escape;
pub mod option_file;
pub mod protocol;
pub mod result;
mod tls;
mod transport;
pub mod types;

pub use config::{ConnectOptions, SslMode, SslOption, TlsConfig};
pub use connection::{CharsetInfo, Connection, ConnectionState, Warning};
pub use convert::{CellInput, Convert, Converter, ConverterEntry, ConverterMap, FlagMask};
pub use escape::{Literal, escape_bytes, quote_literal};
pub use mysqlclient_core::{
    ClientError, ColumnInfo, ConfigError, ConfigErrorKind, ConversionError, Error, ErrorCategory,
    Record, Result, Row, ServerError, Value, classify, codes,
};
pub use protocol::ServerOption;
pub use result::{Description, FetchShape, ResultSet};
pub use types::{ColumnDef, FieldType};
