//! Error types and the error-category taxonomy.
//!
//! Every failure carries a numeric code. The category a caller matches on is
//! derived from that code alone by [`classify`], never from message text.

use std::fmt;

/// Well-known client (`CR_*`) and server (`ER_*`) error codes.
pub mod codes {
    pub const CR_UNKNOWN_ERROR: u16 = 2000;
    pub const CR_SOCKET_CREATE_ERROR: u16 = 2001;
    pub const CR_CONNECTION_ERROR: u16 = 2002;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_UNKNOWN_HOST: u16 = 2005;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_VERSION_ERROR: u16 = 2007;
    pub const CR_SERVER_HANDSHAKE_ERR: u16 = 2012;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;
    pub const CR_NAMEDPIPEOPEN_ERROR: u16 = 2017;
    pub const CR_CANT_READ_CHARSET: u16 = 2019;
    pub const CR_NET_PACKET_TOO_LARGE: u16 = 2020;
    pub const CR_SSL_CONNECTION_ERROR: u16 = 2026;
    pub const CR_MALFORMED_PACKET: u16 = 2027;
    pub const CR_NOT_IMPLEMENTED: u16 = 2054;
    pub const CR_AUTH_PLUGIN_CANNOT_LOAD: u16 = 2059;
    pub const CR_AUTH_PLUGIN_ERR: u16 = 2061;
    pub const CR_LOAD_DATA_LOCAL_INFILE_REJECTED: u16 = 2068;

    pub const ER_DB_CREATE_EXISTS: u16 = 1007;
    pub const ER_BAD_NULL_ERROR: u16 = 1048;
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_WRONG_DB_NAME: u16 = 1102;
    pub const ER_WRONG_TABLE_NAME: u16 = 1103;
    pub const ER_FIELD_SPECIFIED_TWICE: u16 = 1110;
    pub const ER_INVALID_GROUP_FUNC_USE: u16 = 1111;
    pub const ER_UNSUPPORTED_EXTENSION: u16 = 1112;
    pub const ER_TABLE_MUST_HAVE_COLUMNS: u16 = 1113;
    pub const ER_UNKNOWN_CHARACTER_SET: u16 = 1115;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_SYNTAX_ERROR: u16 = 1149;
    pub const ER_DUP_UNIQUE: u16 = 1169;
    pub const ER_PRIMARY_CANT_HAVE_NULL: u16 = 1171;
    pub const ER_CANT_DO_THIS_DURING_AN_TRANSACTION: u16 = 1179;
    pub const ER_WARNING_NOT_COMPLETE_ROLLBACK: u16 = 1196;
    pub const ER_CANNOT_ADD_FOREIGN: u16 = 1215;
    pub const ER_NO_REFERENCED_ROW: u16 = 1216;
    pub const ER_ROW_IS_REFERENCED: u16 = 1217;
    pub const ER_NO_DEFAULT: u16 = 1230;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
    pub const ER_WARN_NULL_TO_NOTNULL: u16 = 1263;
    pub const ER_WARN_DATA_OUT_OF_RANGE: u16 = 1264;
    pub const WARN_DATA_TRUNCATED: u16 = 1265;
    pub const ER_UNKNOWN_STORAGE_ENGINE: u16 = 1286;
    pub const ER_FEATURE_DISABLED: u16 = 1289;
    pub const ER_NO_DEFAULT_FOR_FIELD: u16 = 1364;
    pub const ER_DATA_TOO_LONG: u16 = 1406;
    pub const ER_DATETIME_FUNCTION_OVERFLOW: u16 = 1441;
    pub const ER_ROW_IS_REFERENCED_2: u16 = 1451;
    pub const ER_NO_REFERENCED_ROW_2: u16 = 1452;
}

/// The fixed set of error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Error in the client interface itself rather than the database
    Interface,
    /// Misuse: bad SQL, unknown table, commands out of sync
    Programming,
    /// Problem with the processed data (truncation, out of range)
    Data,
    /// Relational integrity violated (duplicate key, foreign key)
    Integrity,
    /// Feature not supported by the server or client
    NotSupported,
    /// Internal database error (codes below 1000)
    Internal,
    /// Operational failure (lost connection, timeouts, anything else)
    Operational,
}

impl ErrorCategory {
    /// Conventional exception-style name of this category.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorCategory::Interface => "InterfaceError",
            ErrorCategory::Programming => "ProgrammingError",
            ErrorCategory::Data => "DataError",
            ErrorCategory::Integrity => "IntegrityError",
            ErrorCategory::NotSupported => "NotSupportedError",
            ErrorCategory::Internal => "InternalError",
            ErrorCategory::Operational => "OperationalError",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a numeric error code to its category.
pub const fn classify(code: u16) -> ErrorCategory {
    use codes::*;
    match code {
        0 => ErrorCategory::Interface,
        CR_COMMANDS_OUT_OF_SYNC
        | ER_DB_CREATE_EXISTS
        | ER_SYNTAX_ERROR
        | ER_PARSE_ERROR
        | ER_NO_SUCH_TABLE
        | ER_WRONG_DB_NAME
        | ER_WRONG_TABLE_NAME
        | ER_FIELD_SPECIFIED_TWICE
        | ER_INVALID_GROUP_FUNC_USE
        | ER_UNSUPPORTED_EXTENSION
        | ER_TABLE_MUST_HAVE_COLUMNS
        | ER_CANT_DO_THIS_DURING_AN_TRANSACTION => ErrorCategory::Programming,
        WARN_DATA_TRUNCATED
        | ER_WARN_NULL_TO_NOTNULL
        | ER_WARN_DATA_OUT_OF_RANGE
        | ER_NO_DEFAULT
        | ER_PRIMARY_CANT_HAVE_NULL
        | ER_DATA_TOO_LONG
        | ER_DATETIME_FUNCTION_OVERFLOW => ErrorCategory::Data,
        ER_DUP_ENTRY
        | ER_DUP_UNIQUE
        | ER_NO_REFERENCED_ROW
        | ER_NO_REFERENCED_ROW_2
        | ER_ROW_IS_REFERENCED
        | ER_ROW_IS_REFERENCED_2
        | ER_CANNOT_ADD_FOREIGN
        | ER_NO_DEFAULT_FOR_FIELD
        | ER_BAD_NULL_ERROR => ErrorCategory::Integrity,
        ER_WARNING_NOT_COMPLETE_ROLLBACK
        | ER_NOT_SUPPORTED_YET
        | ER_FEATURE_DISABLED
        | ER_UNKNOWN_STORAGE_ENGINE => ErrorCategory::NotSupported,
        c if c < 1000 => ErrorCategory::Internal,
        _ => ErrorCategory::Operational,
    }
}

/// The primary error type for all client operations.
#[derive(Debug)]
pub enum Error {
    /// Error reported by the server in an ERR packet
    Server(ServerError),
    /// Error raised on the client side (transport, framing, state)
    Client(ClientError),
    /// Invalid or unsupported connection options
    Config(ConfigError),
    /// A converter rejected a cell value
    Conversion(ConversionError),
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ClientError {
    pub code: u16,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Recognized option with a value the client cannot honor
    Unsupported,
    /// Malformed option value or unreadable option file
    Invalid,
}

#[derive(Debug)]
pub struct ConversionError {
    /// Column name, when known
    pub column: Option<String>,
    /// Wire type id of the column, when known
    pub type_id: Option<u8>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            column: None,
            type_id: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach the column the failing cell belonged to.
    pub fn in_column(mut self, column: impl Into<String>, type_id: u8) -> Self {
        self.column = Some(column.into());
        self.type_id = Some(type_id);
        self
    }
}

impl Error {
    /// Build a client-side error with the given `CR_*` code.
    pub fn client(code: u16, message: impl Into<String>) -> Self {
        Error::Client(ClientError::new(code, message))
    }

    /// The error for any operation attempted on a closed connection.
    pub fn closed() -> Self {
        Error::client(codes::CR_SERVER_GONE_ERROR, "MySQL server has gone away")
    }

    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Numeric code; 0 when none applies.
    pub fn code(&self) -> u16 {
        match self {
            Error::Server(e) => e.code,
            Error::Client(e) => e.code,
            Error::Config(_) | Error::Conversion(_) => 0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::Server(e) => &e.message,
            Error::Client(e) => &e.message,
            Error::Config(e) => &e.message,
            Error::Conversion(e) => &e.message,
        }
    }

    /// Category the caller should match on.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Server(e) => classify(e.code),
            Error::Client(e) => classify(e.code),
            Error::Config(e) => match e.kind {
                ConfigErrorKind::Unsupported => ErrorCategory::NotSupported,
                ConfigErrorKind::Invalid => ErrorCategory::Interface,
            },
            Error::Conversion(_) => ErrorCategory::Data,
        }
    }

    /// SQLSTATE sent by the server, if this error came from one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) if !e.sqlstate.is_empty() => Some(&e.sqlstate),
            _ => None,
        }
    }

    /// Did this error come from using a connection that is already closed?
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Client(e) if e.code == codes::CR_SERVER_GONE_ERROR)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Server(e) => write!(f, "{}: {}", self.category(), e),
            Error::Client(e) => write!(f, "{}: {}", self.category(), e),
            Error::Config(e) => write!(f, "{}: configuration error: {}", self.category(), e),
            Error::Conversion(e) => write!(f, "{}: {}", self.category(), e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Client(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Conversion(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Server(_) => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sqlstate.is_empty() {
            write!(f, "({}) {}", self.code, self.message)
        } else {
            write!(f, "({}, {}) {}", self.code, self.sqlstate, self.message)
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(col) => write!(f, "cannot convert column '{}': {}", col, self.message),
            None => write!(f, "cannot convert value: {}", self.message),
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::Client(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ConversionError> for Error {
    fn from(err: ConversionError) -> Self {
        Error::Conversion(err)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_listed_codes() {
        for code in [
            2014, 1007, 1149, 1064, 1146, 1102, 1103, 1110, 1111, 1112, 1113, 1179,
        ] {
            assert_eq!(classify(code), ErrorCategory::Programming, "code {code}");
        }
        for code in [1265, 1263, 1264, 1230, 1171, 1406, 1441] {
            assert_eq!(classify(code), ErrorCategory::Data, "code {code}");
        }
        for code in [1062, 1169, 1216, 1452, 1217, 1451, 1215, 1364, 1048] {
            assert_eq!(classify(code), ErrorCategory::Integrity, "code {code}");
        }
        for code in [1196, 1235, 1289, 1286] {
            assert_eq!(classify(code), ErrorCategory::NotSupported, "code {code}");
        }
    }

    #[test]
    fn test_classify_fallback_ranges() {
        assert_eq!(classify(0), ErrorCategory::Interface);
        assert_eq!(classify(1), ErrorCategory::Internal);
        assert_eq!(classify(999), ErrorCategory::Internal);
        assert_eq!(classify(1000), ErrorCategory::Operational);
        assert_eq!(classify(1045), ErrorCategory::Operational);
        assert_eq!(classify(2006), ErrorCategory::Operational);
        assert_eq!(classify(2013), ErrorCategory::Operational);
        assert_eq!(classify(u16::MAX), ErrorCategory::Operational);
    }

    #[test]
    fn test_error_accessors() {
        let err = Error::Server(ServerError {
            code: 1062,
            sqlstate: "23000".to_string(),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
        });
        assert_eq!(err.code(), 1062);
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert!(err.to_string().starts_with("IntegrityError: (1062, 23000)"));
    }

    #[test]
    fn test_closed_error() {
        let err = Error::closed();
        assert!(err.is_closed());
        assert_eq!(err.code(), codes::CR_SERVER_GONE_ERROR);
        assert_eq!(err.category(), ErrorCategory::Operational);
        assert_eq!(err.sqlstate(), None);
    }

    #[test]
    fn test_config_and_conversion_categories() {
        let err = Error::config(ConfigErrorKind::Unsupported, "Unknown ssl_mode specification");
        assert_eq!(err.category(), ErrorCategory::NotSupported);
        assert_eq!(err.code(), 0);

        let err = Error::config(ConfigErrorKind::Invalid, "bad port");
        assert_eq!(err.category(), ErrorCategory::Interface);

        let err: Error = ConversionError::new("invalid digit").in_column("id", 3).into();
        assert_eq!(err.category(), ErrorCategory::Data);
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_client_error_source() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = ClientError::new(codes::CR_SERVER_LOST, "Lost connection")
            .with_source(io)
            .into();
        assert!(err.source().is_some());
        assert_eq!(err.category(), ErrorCategory::Operational);
    }
}
