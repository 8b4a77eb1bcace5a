//! Blocking MySQL connection.
//!
//! A [`Connection`] owns one transport and runs one command at a time. Its
//! state machine enforces the protocol's ordering: each query is followed by
//! exactly one result read, and a result set is consumed before the next
//! command goes out.

// Packet sizes and counts on the wire fit in u32
#![allow(clippy::cast_possible_truncation)]

use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use mysqlclient_core::{ClientError, ConfigErrorKind, Error, Result, Value, codes};

use crate::auth::{AuthContext, AuthPlugin, AuthStep, plugin_for};
use crate::charset::{Charset, collation_for_charset};
use crate::config::ConnectOptions;
use crate::escape::{self, Literal};
use crate::option_file;
use crate::protocol::capabilities::{
    CLIENT_COMPRESS, CLIENT_DEPRECATE_EOF, CLIENT_MULTI_STATEMENTS, CLIENT_PROTOCOL_41,
    CLIENT_SSL, CLIENT_TRANSACTIONS,
};
use crate::protocol::handshake::{ChangeUser, PROTOCOL_VERSION, ssl_request};
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_NO_BACKSLASH_ESCAPES,
};
use crate::protocol::{
    AuthSwitchRequest, Command, Handshake, HandshakeResponse, OkPacket, PacketReader, PacketType,
    ServerOption, malformed, server_error,
};
use crate::result::{FetchShape, ResultSet, resolve_converters};
use crate::tls;
use crate::transport::{PacketStream, Socket};
use crate::types::ColumnDef;

/// Bytes of a local file sent per packet.
const LOCAL_INFILE_CHUNK: usize = 64 * 1024;

/// Upper bound on the column vector preallocated from a result header.
const MAX_COLUMNS_HINT: usize = 4096;

const SQLSTATE_NONE: &str = "00000";
const SQLSTATE_GENERAL: &str = "HY000";

/// Where a connection stands in the command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle; a new command may be sent
    Ready,
    /// A query was sent and its response has not been read
    AwaitingResponse,
    /// Column metadata read; rows not yet stored or streamed
    ResultPending,
    /// A streamed result still has rows on the wire
    RowsPending,
    /// Closed by the caller
    Closed,
}

/// What the server told us in its greeting.
#[derive(Debug, Clone)]
struct ServerInfo {
    version: String,
    connection_id: u32,
    capabilities: u32,
    auth_plugin: String,
    scramble: Vec<u8>,
}

#[derive(Debug, Clone)]
struct LastError {
    code: u16,
    message: String,
    sqlstate: String,
}

/// One row of `SHOW WARNINGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

/// Description of the connection character set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharsetInfo {
    pub name: String,
    pub collation: Option<String>,
    /// Name of the encoding text is decoded with
    pub encoding: &'static str,
    pub mbminlen: usize,
    pub mbmaxlen: usize,
}

/// A connection to a MySQL server.
pub struct Connection {
    /// `None` once closed or after the transport failed
    stream: Option<PacketStream>,
    state: ConnectionState,
    /// Options after option files were applied; used to reconnect
    options: ConnectOptions,
    server: ServerInfo,
    client_flags: u32,
    charset: Charset,
    status_flags: u16,
    affected_rows: u64,
    insert_id: u64,
    warning_count: u16,
    info: String,
    field_count: usize,
    /// Column metadata of a result that has not been stored or streamed
    columns: Vec<ColumnDef>,
    last_error: Option<LastError>,
    reconnect: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("thread_id", &self.server.connection_id)
            .field("host", &self.options.host_name())
            .field("port", &self.options.port)
            .field("database", &self.options.database)
            .field("charset", &self.charset.name())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection and authenticate.
    ///
    /// 1. Apply option files and pick the transport
    /// 2. Read the server greeting
    /// 3. Upgrade to TLS when the SSL mode asks for it
    /// 4. Send the handshake response and run the auth exchange
    /// 5. Switch on compression, then run the session setup statements
    #[tracing::instrument(
        level = "debug",
        skip(options),
        fields(host = %options.host_name(), port = options.port)
    )]
    pub fn connect(options: &ConnectOptions) -> Result<Self> {
        let options = option_file::resolve(options)?;
        let charset = Charset::new(options.charset_name());
        let collation_id =
            collation_for_charset(charset.name()).ok_or_else(|| unknown_charset(charset.name()))?;
        let max_packet_size = u32::try_from(options.max_allowed_packet).unwrap_or(u32::MAX);

        let socket = Socket::connect(&options)?;
        socket.set_timeouts(options.connect_timeout, options.connect_timeout);
        let mut stream = PacketStream::new(socket, options.max_allowed_packet);

        let greeting = stream.read_packet()?;
        if greeting.first() == Some(&0xFF) {
            return Err(server_error(&greeting));
        }
        let handshake = Handshake::parse(&greeting)?;
        if handshake.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::client(
                codes::CR_VERSION_ERROR,
                format!(
                    "Protocol mismatch; server version = {}, client version = {PROTOCOL_VERSION}",
                    handshake.server_version
                ),
            ));
        }
        tracing::debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin,
            "received server greeting"
        );

        let mut client_flags = options.capability_flags() & handshake.capabilities;
        let (ssl_mode, tls_config) = options.resolve_ssl();
        if tls::negotiate(ssl_mode, handshake.capabilities)? {
            client_flags |= CLIENT_SSL;
            stream.write_packet(&ssl_request(client_flags, max_packet_size, collation_id))?;
            stream = stream.upgrade_tls(&tls_config, options.host_name(), ssl_mode)?;
            tracing::debug!(mode = %ssl_mode, cipher = ?stream.cipher_name(), "TLS established");
        }

        let plugin_name = options
            .auth_plugin
            .clone()
            .unwrap_or_else(|| handshake.auth_plugin.clone());
        let plugin = plugin_for(&plugin_name)?;
        let password = options.password.as_deref().unwrap_or("");
        let key_path = options.server_public_key_path.as_deref();
        let auth_response = plugin.initial_response(&AuthContext {
            password,
            scramble: &handshake.auth_data,
            secure: stream.is_secure(),
            server_public_key_path: key_path,
        })?;

        let response = HandshakeResponse {
            capabilities: client_flags,
            max_packet_size,
            charset: collation_id,
            user: options.user.as_deref().unwrap_or(""),
            auth_response: &auth_response,
            database: options.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &options.attributes,
        };
        stream.write_packet(&response.encode())?;
        let ok = authenticate(
            &mut stream,
            plugin,
            handshake.auth_data.clone(),
            password,
            key_path,
        )?;
        tracing::debug!(user = ?options.user, "authenticated");

        if client_flags & CLIENT_COMPRESS != 0 {
            stream.enable_compression();
        }
        stream.set_timeouts(options.read_timeout, options.write_timeout);

        let mut conn = Self {
            stream: Some(stream),
            state: ConnectionState::Ready,
            server: ServerInfo {
                version: handshake.server_version,
                connection_id: handshake.connection_id,
                capabilities: handshake.capabilities,
                auth_plugin: plugin_name,
                scramble: handshake.auth_data,
            },
            client_flags,
            charset,
            status_flags: ok.status_flags,
            affected_rows: 0,
            insert_id: 0,
            warning_count: ok.warnings,
            info: String::new(),
            field_count: 0,
            columns: Vec::new(),
            last_error: None,
            reconnect: false,
            options,
        };
        conn.initialize()?;
        Ok(conn)
    }

    /// Session setup that runs once after authentication.
    fn initialize(&mut self) -> Result<()> {
        if let Some(sql) = self.options.init_command.clone() {
            self.query(&sql)?;
            self.discard_all_results()?;
        }
        if let Some(collation) = self.options.collation.clone() {
            let name = self.charset.name().to_string();
            self.set_names(&name, Some(&collation))?;
        }
        if let Some(mode) = self.options.sql_mode.clone() {
            let mut sql = b"SET SESSION sql_mode=".to_vec();
            sql.extend_from_slice(&self.quote_literal(mode.as_str())?);
            self.query(&sql)?;
        }
        if self.server.capabilities & CLIENT_TRANSACTIONS != 0 {
            if let Some(flag) = self.options.autocommit {
                self.autocommit(flag)?;
            }
        }
        Ok(())
    }

    // ==================== State ====================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `false` only after [`close`](Self::close).
    ///
    /// A connection whose transport failed stays open: later commands fail
    /// with 2006 until `ping(true)` reconnects. See
    /// [`is_connected`](Self::is_connected).
    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Whether the transport to the server is still usable.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream_mut(&mut self) -> Result<&mut PacketStream> {
        self.stream.as_mut().ok_or_else(Error::closed)
    }

    fn deprecate_eof(&self) -> bool {
        self.client_flags & CLIENT_DEPRECATE_EOF != 0
    }

    /// Remember the outcome of a public operation.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.record(e),
        }
        result
    }

    fn record(&mut self, err: &Error) {
        let sqlstate = match err {
            Error::Server(_) => err.sqlstate().unwrap_or(SQLSTATE_GENERAL),
            _ => SQLSTATE_GENERAL,
        };
        self.last_error = Some(LastError {
            code: err.code(),
            message: err.message().to_string(),
            sqlstate: sqlstate.to_string(),
        });
        if is_fatal(err) {
            self.abandon();
        }
    }

    /// Drop a transport that can no longer be trusted.
    fn abandon(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!("dropping broken connection");
            stream.shutdown();
        }
        self.columns.clear();
        self.status_flags &= !SERVER_MORE_RESULTS_EXISTS;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Ready;
        }
    }

    /// Check that a new command may be sent.
    fn begin_command(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Err(Error::closed()),
            ConnectionState::AwaitingResponse | ConnectionState::ResultPending => {
                return Err(out_of_sync());
            }
            ConnectionState::RowsPending => {
                tracing::warn!("draining unread rows of an abandoned streamed result");
                self.drain_rows()?;
            }
            ConnectionState::Ready => {}
        }
        if self.stream.is_none() {
            return Err(Error::closed());
        }
        if self.more_results() {
            return Err(out_of_sync());
        }
        Ok(())
    }

    // ==================== Queries ====================

    /// Run a statement and read the server's response header.
    #[tracing::instrument(level = "debug", skip(self, sql))]
    pub fn query(&mut self, sql: impl AsRef<[u8]>) -> Result<()> {
        let result = self
            .send_query_inner(sql.as_ref())
            .and_then(|()| self.read_query_result_inner());
        self.track(result)
    }

    /// Send a statement without waiting for the response.
    pub fn send_query(&mut self, sql: impl AsRef<[u8]>) -> Result<()> {
        let result = self.send_query_inner(sql.as_ref());
        self.track(result)
    }

    /// Read the response to the statement sent by [`send_query`](Self::send_query).
    pub fn read_query_result(&mut self) -> Result<()> {
        let result = self.read_query_result_inner();
        self.track(result)
    }

    fn send_query_inner(&mut self, sql: &[u8]) -> Result<()> {
        self.begin_command()?;
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(Command::Query as u8);
        payload.extend_from_slice(sql);
        self.stream_mut()?.write_command(&payload)?;
        self.state = ConnectionState::AwaitingResponse;
        Ok(())
    }

    fn read_query_result_inner(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Err(Error::closed()),
            ConnectionState::AwaitingResponse => {}
            _ => return Err(out_of_sync()),
        }
        self.state = ConnectionState::Ready;
        self.read_result_header()
    }

    /// Read an OK, ERR, LOCAL INFILE request or result set header.
    fn read_result_header(&mut self) -> Result<()> {
        self.columns.clear();
        self.field_count = 0;
        let packet = self.stream_mut()?.read_packet()?;
        let Some(&first) = packet.first() else {
            return Err(malformed("empty response packet"));
        };

        match PacketType::from_first_byte(first, packet.len()) {
            PacketType::Ok => self.apply_ok(&packet),
            PacketType::Error => {
                self.status_flags &= !SERVER_MORE_RESULTS_EXISTS;
                Err(server_error(&packet))
            }
            PacketType::LocalInfile => self.send_local_infile(&packet[1..]),
            PacketType::Eof | PacketType::Data => self.read_columns(&packet),
        }
    }

    fn apply_ok(&mut self, packet: &[u8]) -> Result<()> {
        let ok = parse_ok(packet)?;
        self.affected_rows = ok.affected_rows;
        self.insert_id = ok.last_insert_id;
        self.status_flags = ok.status_flags;
        self.warning_count = ok.warnings;
        self.info = ok.info;
        Ok(())
    }

    fn apply_eof(&mut self, packet: &[u8]) -> Result<()> {
        let mut reader = PacketReader::new(packet);
        let (status_flags, warnings) = if self.deprecate_eof() {
            let ok = reader
                .parse_ok_packet()
                .ok_or_else(|| malformed("truncated OK packet"))?;
            (ok.status_flags, ok.warnings)
        } else {
            let eof = reader
                .parse_eof_packet()
                .ok_or_else(|| malformed("truncated EOF packet"))?;
            (eof.status_flags, eof.warnings)
        };
        self.status_flags = status_flags;
        self.warning_count = warnings;
        Ok(())
    }

    fn read_columns(&mut self, header: &[u8]) -> Result<()> {
        let count = PacketReader::new(header)
            .read_lenenc_int()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| malformed("bad column count"))?;

        let stream = self.stream_mut()?;
        let mut columns = Vec::with_capacity(count.min(MAX_COLUMNS_HINT));
        for _ in 0..count {
            let packet = stream.read_packet()?;
            columns.push(ColumnDef::parse(&packet)?);
        }
        if !self.deprecate_eof() {
            let packet = self.stream_mut()?.read_packet()?;
            match PacketType::of_row_packet(&packet, false) {
                PacketType::Eof => self.apply_eof(&packet)?,
                PacketType::Error => return Err(server_error(&packet)),
                _ => return Err(malformed("expected EOF after column definitions")),
            }
        }

        tracing::trace!(columns = count, "read result set metadata");
        self.columns = columns;
        self.field_count = count;
        self.affected_rows = u64::MAX;
        self.state = ConnectionState::ResultPending;
        Ok(())
    }

    /// Answer a LOCAL INFILE request, then read the statement's outcome.
    fn send_local_infile(&mut self, filename: &[u8]) -> Result<()> {
        let name = String::from_utf8_lossy(filename).into_owned();
        let deferred = if self.options.local_infile {
            tracing::debug!(file = %name, "sending local file");
            self.stream_local_file(&name)?
        } else {
            Some(Error::client(
                codes::CR_LOAD_DATA_LOCAL_INFILE_REJECTED,
                "LOAD DATA LOCAL INFILE file request rejected due to restrictions on access.",
            ))
        };
        let stream = self.stream_mut()?;
        stream.write_packet(&[])?;

        let packet = stream.read_packet()?;
        match packet.first() {
            Some(0xFF) => Err(server_error(&packet)),
            Some(0x00) => {
                self.apply_ok(&packet)?;
                deferred.map_or(Ok(()), Err)
            }
            _ => Err(malformed("unexpected response to LOCAL INFILE data")),
        }
    }

    /// Send a file's contents. A local read failure is returned as the
    /// inner error once the server has been answered.
    fn stream_local_file(&mut self, name: &str) -> Result<Option<Error>> {
        let local_error = |e: std::io::Error| {
            Error::Client(
                ClientError::new(
                    codes::CR_UNKNOWN_ERROR,
                    format!("cannot read local file '{name}': {e}"),
                )
                .with_source(e),
            )
        };
        let mut file = match File::open(name) {
            Ok(file) => file,
            Err(e) => return Ok(Some(local_error(e))),
        };
        let stream = self.stream_mut()?;
        let mut buf = vec![0u8; LOCAL_INFILE_CHUNK];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => stream.write_packet(&buf[..n])?,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Ok(Some(local_error(e))),
            }
        }
    }

    // ==================== Results ====================

    /// Take the columns of a result that is waiting to be read.
    fn take_pending_columns(&mut self) -> Result<Option<Vec<ColumnDef>>> {
        match self.state {
            ConnectionState::Closed => Err(Error::closed()),
            ConnectionState::Ready => Ok(None),
            ConnectionState::ResultPending => Ok(Some(std::mem::take(&mut self.columns))),
            ConnectionState::AwaitingResponse | ConnectionState::RowsPending => Err(out_of_sync()),
        }
    }

    /// Read every row of the current result into memory.
    ///
    /// `None` when the last statement produced no result set.
    pub fn store_result(&mut self) -> Result<Option<ResultSet<'static>>> {
        let result = self.store_result_inner();
        self.track(result)
    }

    fn store_result_inner(&mut self) -> Result<Option<ResultSet<'static>>> {
        let Some(columns) = self.take_pending_columns()? else {
            return Ok(None);
        };
        self.state = ConnectionState::RowsPending;
        let mut rows = Vec::new();
        while let Some(row) = self.read_row_inner()? {
            rows.push(row);
        }
        self.affected_rows = rows.len() as u64;
        tracing::debug!(rows = rows.len(), "stored result set");

        let converters = resolve_converters(&self.options.conv, &columns);
        ResultSet::stored(
            columns,
            converters,
            self.charset.clone(),
            rows,
            self.more_results(),
        )
        .map(Some)
    }

    /// Stream the current result; rows are read from the server on demand.
    ///
    /// The returned result set borrows the connection until it is dropped.
    pub fn use_result(&mut self) -> Result<Option<ResultSet<'_>>> {
        match self.take_pending_columns() {
            Ok(None) => {
                self.last_error = None;
                Ok(None)
            }
            Ok(Some(columns)) => {
                self.last_error = None;
                self.state = ConnectionState::RowsPending;
                let converters = resolve_converters(&self.options.conv, &columns);
                let charset = self.charset.clone();
                Ok(Some(ResultSet::streaming(columns, converters, charset, self)))
            }
            Err(e) => {
                self.record(&e);
                Err(e)
            }
        }
    }

    /// Read and drop the rows of the current result.
    pub fn discard_result(&mut self) -> Result<()> {
        let result = match self.state {
            ConnectionState::Closed => Err(Error::closed()),
            ConnectionState::Ready => Ok(()),
            ConnectionState::AwaitingResponse => Err(out_of_sync()),
            ConnectionState::ResultPending | ConnectionState::RowsPending => {
                self.columns.clear();
                self.state = ConnectionState::RowsPending;
                self.drain_rows()
            }
        };
        self.track(result)
    }

    /// Move to the next result of a multi-statement query.
    ///
    /// Returns `false` when there are no more results.
    pub fn next_result(&mut self) -> Result<bool> {
        let result = self.next_result_inner();
        self.track(result)
    }

    fn next_result_inner(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::Closed => return Err(Error::closed()),
            ConnectionState::AwaitingResponse | ConnectionState::ResultPending => {
                return Err(out_of_sync());
            }
            ConnectionState::RowsPending => {
                tracing::warn!("draining unread rows of an abandoned streamed result");
                self.drain_rows()?;
            }
            ConnectionState::Ready => {}
        }
        if self.stream.is_none() {
            return Err(Error::closed());
        }
        if !self.more_results() {
            return Ok(false);
        }
        self.read_result_header()?;
        Ok(true)
    }

    fn discard_all_results(&mut self) -> Result<()> {
        loop {
            self.discard_result()?;
            if !self.next_result()? {
                return Ok(());
            }
        }
    }

    /// Next row payload of the result being read, `None` at its end.
    pub(crate) fn read_row(&mut self) -> Result<Option<Vec<u8>>> {
        let result = self.read_row_inner();
        self.track(result)
    }

    fn read_row_inner(&mut self) -> Result<Option<Vec<u8>>> {
        if self.state != ConnectionState::RowsPending {
            return Ok(None);
        }
        let deprecate_eof = self.deprecate_eof();
        let packet = self.stream_mut()?.read_packet()?;
        match PacketType::of_row_packet(&packet, deprecate_eof) {
            PacketType::Eof => {
                self.state = ConnectionState::Ready;
                self.apply_eof(&packet)?;
                Ok(None)
            }
            PacketType::Error => {
                self.state = ConnectionState::Ready;
                self.status_flags &= !SERVER_MORE_RESULTS_EXISTS;
                Err(server_error(&packet))
            }
            _ => Ok(Some(packet)),
        }
    }

    /// Skip the remaining rows of the result being read.
    fn drain_rows(&mut self) -> Result<()> {
        let mut skipped = 0u64;
        while self.read_row_inner()?.is_some() {
            skipped += 1;
        }
        tracing::trace!(skipped, "drained rows");
        Ok(())
    }

    // ==================== Commands ====================

    /// Send a command whose reply is a single OK or ERR packet.
    fn simple_command(&mut self, command: Command, arg: &[u8]) -> Result<()> {
        self.begin_command()?;
        let mut payload = Vec::with_capacity(arg.len() + 1);
        payload.push(command as u8);
        payload.extend_from_slice(arg);
        let stream = self.stream_mut()?;
        stream.write_command(&payload)?;
        let packet = stream.read_packet()?;
        match packet.first() {
            Some(0x00) => self.apply_ok(&packet),
            Some(0xFF) => Err(server_error(&packet)),
            _ => Err(malformed("expected OK packet")),
        }
    }

    /// Check that the server is alive.
    ///
    /// `reconnect` sets the auto-reconnect flag: with it set, a ping over a
    /// lost connection opens a new one with the same options once.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ping(&mut self, reconnect: bool) -> Result<()> {
        if reconnect != self.reconnect {
            tracing::warn!(reconnect, "auto-reconnect setting changed");
            self.reconnect = reconnect;
        }
        let result = self.simple_command(Command::Ping, &[]);
        let result = self.track(result);
        match result {
            Err(e) if self.reconnect && self.is_open() && self.stream.is_none() => {
                tracing::warn!(error = %e, "ping failed, reconnecting");
                let reconnected = self.reconnect_now();
                self.track(reconnected)?;
                let result = self.simple_command(Command::Ping, &[]);
                self.track(result)
            }
            other => other,
        }
    }

    fn reconnect_now(&mut self) -> Result<()> {
        let mut fresh = Connection::connect(&self.options)?;
        fresh.reconnect = self.reconnect;
        *self = fresh;
        Ok(())
    }

    /// Make `db` the default database.
    pub fn select_db(&mut self, db: &str) -> Result<()> {
        let result = self.simple_command(Command::InitDb, db.as_bytes());
        if result.is_ok() {
            self.options.database = Some(db.to_string());
        }
        self.track(result)
    }

    pub fn autocommit(&mut self, on: bool) -> Result<()> {
        self.query(if on {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        })
    }

    pub fn get_autocommit(&self) -> bool {
        self.status_flags & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn commit(&mut self) -> Result<()> {
        self.query("COMMIT")
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.query("ROLLBACK")
    }

    /// Re-authenticate as another user on the same connection.
    #[tracing::instrument(level = "debug", skip(self, password))]
    pub fn change_user(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        let result = self.change_user_inner(user, password, database);
        if result.is_ok() {
            self.options.user = Some(user.to_string());
            self.options.password = Some(password.to_string());
            self.options.database = database.map(str::to_string);
        }
        self.track(result)
    }

    fn change_user_inner(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        self.begin_command()?;
        let plugin_name = self
            .options
            .auth_plugin
            .as_deref()
            .unwrap_or(&self.server.auth_plugin);
        let plugin = plugin_for(plugin_name)?;
        let collation_id = collation_for_charset(self.charset.name())
            .ok_or_else(|| unknown_charset(self.charset.name()))?;
        let key_path = self.options.server_public_key_path.as_deref();

        let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
        let auth_response = plugin.initial_response(&AuthContext {
            password,
            scramble: &self.server.scramble,
            secure: stream.is_secure(),
            server_public_key_path: key_path,
        })?;
        let payload = ChangeUser {
            user,
            auth_response: &auth_response,
            database,
            charset: collation_id,
            auth_plugin: plugin.name(),
            attributes: &self.options.attributes,
        }
        .encode(self.client_flags);
        stream.write_command(&payload)?;

        let ok = authenticate(
            stream,
            plugin,
            self.server.scramble.clone(),
            password,
            key_path,
        )?;
        self.status_flags = ok.status_flags;
        self.warning_count = ok.warnings;
        Ok(())
    }

    /// Human-readable server status (uptime, threads, queries).
    pub fn stat(&mut self) -> Result<String> {
        let result = self.stat_inner();
        self.track(result)
    }

    fn stat_inner(&mut self) -> Result<String> {
        self.begin_command()?;
        let stream = self.stream_mut()?;
        stream.write_command(&[Command::Statistics as u8])?;
        let packet = stream.read_packet()?;
        if packet.first() == Some(&0xFF) {
            return Err(server_error(&packet));
        }
        Ok(String::from_utf8_lossy(&packet).into_owned())
    }

    /// Ask the server to kill thread `id`.
    pub fn kill(&mut self, id: u64) -> Result<()> {
        self.query(format!("KILL {id}"))
    }

    /// Toggle multi-statement support for this session.
    pub fn set_server_option(&mut self, option: ServerOption) -> Result<()> {
        let result = self.set_server_option_inner(option);
        self.track(result)
    }

    fn set_server_option_inner(&mut self, option: ServerOption) -> Result<()> {
        self.begin_command()?;
        let mut payload = vec![Command::SetOption as u8];
        payload.extend_from_slice(&(option as u16).to_le_bytes());
        let stream = self.stream_mut()?;
        stream.write_command(&payload)?;
        let packet = stream.read_packet()?;
        match packet.first() {
            Some(0xFF) => return Err(server_error(&packet)),
            Some(0xFE) => self.apply_eof(&packet)?,
            Some(0x00) => self.apply_ok(&packet)?,
            _ => return Err(malformed("unexpected response to COM_SET_OPTION")),
        }
        match option {
            ServerOption::MultiStatementsOn => self.client_flags |= CLIENT_MULTI_STATEMENTS,
            ServerOption::MultiStatementsOff => self.client_flags &= !CLIENT_MULTI_STATEMENTS,
        }
        Ok(())
    }

    /// Warnings raised by the last statement.
    pub fn show_warnings(&mut self) -> Result<Vec<Warning>> {
        self.query("SHOW WARNINGS")?;
        let Some(mut result) = self.store_result()? else {
            return Ok(Vec::new());
        };
        let records = result.fetch_rows(0, FetchShape::Tuple)?;
        Ok(records
            .iter()
            .map(|record| Warning {
                level: record.get(0).map(value_text).unwrap_or_default(),
                code: record
                    .get(1)
                    .and_then(|v| value_text(v).parse().ok())
                    .unwrap_or(0),
                message: record.get(2).map(value_text).unwrap_or_default(),
            })
            .collect())
    }

    // ==================== Character set ====================

    pub fn character_set_name(&self) -> &str {
        self.charset.name()
    }

    pub fn get_character_set_info(&self) -> CharsetInfo {
        CharsetInfo {
            name: self.charset.name().to_string(),
            collation: self.options.collation.clone(),
            encoding: self.charset.encoding().name(),
            mbminlen: 1,
            mbmaxlen: self.charset.max_char_len(),
        }
    }

    /// Switch the connection character set with `SET NAMES`.
    ///
    /// Text is decoded with the new set's encoding from then on.
    pub fn set_character_set(&mut self, name: &str, collation: Option<&str>) -> Result<()> {
        if collation.is_none() && name == self.charset.name() {
            return Ok(());
        }
        self.set_names(name, collation)
    }

    fn set_names(&mut self, name: &str, collation: Option<&str>) -> Result<()> {
        if collation_for_charset(name).is_none() {
            return self.track(Err(unknown_charset(name)));
        }
        let mut sql = format!("SET NAMES {name}");
        if let Some(collation) = collation {
            if !collation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return self.track(Err(Error::config(
                    ConfigErrorKind::Invalid,
                    format!("invalid collation name: {collation}"),
                )));
            }
            sql.push_str(" COLLATE ");
            sql.push_str(collation);
        }
        self.query(&sql)?;

        tracing::debug!(charset = name, ?collation, "connection character set changed");
        self.charset = Charset::new(name);
        self.options.charset = Some(name.to_string());
        if collation.is_some() {
            self.options.collation = collation.map(str::to_string);
        }
        Ok(())
    }

    // ==================== Escaping ====================

    /// Escape `bytes` for embedding in a quoted literal.
    ///
    /// Multibyte characters of the connection character set are kept
    /// intact, and quotes are doubled when the server has
    /// `NO_BACKSLASH_ESCAPES` on.
    pub fn escape_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        if self.stream.is_none() {
            return escape::escape_bytes(bytes);
        }
        escape::escape_with(
            bytes,
            Some(&self.charset),
            self.status_flags & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0,
        )
    }

    /// Escape and single-quote a value; text is encoded in the connection
    /// character set first.
    pub fn quote_literal<'a>(&self, value: impl Into<Literal<'a>>) -> Result<Vec<u8>> {
        let bytes: Cow<'_, [u8]> = match value.into() {
            Literal::Text(s) if self.stream.is_some() => self.charset.encode(s)?,
            Literal::Text(s) => Cow::Borrowed(s.as_bytes()),
            Literal::Bytes(b) => Cow::Borrowed(b),
        };
        Ok(escape::quote(&self.escape_bytes(&bytes)))
    }

    // ==================== Accessors ====================

    /// Rows changed by the last statement, or rows in the last stored result.
    ///
    /// `u64::MAX` while a result set has not been stored.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    /// Server-side id of this connection.
    pub fn thread_id(&self) -> u64 {
        u64::from(self.server.connection_id)
    }

    /// Code of the last failed operation, 0 when it succeeded.
    pub fn error_code(&self) -> u16 {
        self.last_error.as_ref().map_or(0, |e| e.code)
    }

    pub fn error_message(&self) -> &str {
        self.last_error.as_ref().map_or("", |e| e.message.as_str())
    }

    pub fn sqlstate(&self) -> &str {
        self.last_error
            .as_ref()
            .map_or(SQLSTATE_NONE, |e| e.sqlstate.as_str())
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    /// Server version string.
    pub fn server_info(&self) -> &str {
        &self.server.version
    }

    pub fn get_server_info(&self) -> &str {
        self.server_info()
    }

    pub fn get_proto_info(&self) -> u8 {
        PROTOCOL_VERSION
    }

    /// Transport description, e.g. `db.internal via TCP/IP`.
    pub fn get_host_info(&self) -> String {
        if self.options.unix_socket.is_some() {
            "Localhost via UNIX socket".to_string()
        } else if let Some(pipe) = &self.options.named_pipe {
            format!("{} via named pipe {pipe}", self.options.host_name())
        } else {
            format!("{} via TCP/IP", self.options.host_name())
        }
    }

    /// Info string of the last statement, e.g. `Records: 3  Duplicates: 0`.
    pub fn info(&self) -> Option<&str> {
        Some(self.info.as_str()).filter(|s| !s.is_empty())
    }

    /// Number of columns in the last result.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn server_capabilities(&self) -> u32 {
        self.server.capabilities
    }

    /// Capability flags negotiated with the server.
    pub fn client_flag(&self) -> u32 {
        self.client_flags
    }

    pub fn port(&self) -> u16 {
        self.options.port
    }

    /// Name of the TLS cipher in use, if the connection is encrypted.
    pub fn ssl_cipher(&self) -> Option<&'static str> {
        self.stream.as_ref().and_then(PacketStream::cipher_name)
    }

    pub fn is_compressed(&self) -> bool {
        self.stream.as_ref().is_some_and(PacketStream::is_compressed)
    }

    /// Close the connection. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.columns.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.write_command(&[Command::Quit as u8]) {
                tracing::debug!(error = %e, "COM_QUIT failed");
            }
            stream.shutdown();
        }
        tracing::debug!(thread_id = self.server.connection_id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the authentication exchange until the server accepts or rejects.
fn authenticate(
    stream: &mut PacketStream,
    mut plugin: Box<dyn AuthPlugin>,
    mut scramble: Vec<u8>,
    password: &str,
    key_path: Option<&Path>,
) -> Result<OkPacket> {
    let secure = stream.is_secure();
    loop {
        let packet = stream.read_packet()?;
        match packet.first() {
            Some(0x00) => return parse_ok(&packet),
            Some(0xFF) => return Err(server_error(&packet)),
            Some(0xFE) => {
                let switch = AuthSwitchRequest::parse(&packet)?;
                tracing::debug!(plugin = %switch.plugin, "server requested auth switch");
                plugin = plugin_for(&switch.plugin)?;
                scramble = switch.auth_data;
                let response = plugin.initial_response(&AuthContext {
                    password,
                    scramble: &scramble,
                    secure,
                    server_public_key_path: key_path,
                })?;
                stream.write_packet(&response)?;
            }
            Some(0x01) => {
                let ctx = AuthContext {
                    password,
                    scramble: &scramble,
                    secure,
                    server_public_key_path: key_path,
                };
                match plugin.continue_auth(&packet[1..], &ctx)? {
                    AuthStep::Respond(data) => stream.write_packet(&data)?,
                    AuthStep::Wait => {}
                }
            }
            _ => return Err(malformed("unexpected packet during authentication")),
        }
    }
}

fn parse_ok(packet: &[u8]) -> Result<OkPacket> {
    PacketReader::new(packet)
        .parse_ok_packet()
        .ok_or_else(|| malformed("truncated OK packet"))
}

fn out_of_sync() -> Error {
    Error::client(
        codes::CR_COMMANDS_OUT_OF_SYNC,
        "Commands out of sync; you can't run this command now",
    )
}

fn unknown_charset(name: &str) -> Error {
    Error::client(
        codes::CR_CANT_READ_CHARSET,
        format!("Can't initialize character set {name}"),
    )
}

/// Errors after which the byte stream can no longer be trusted.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::Client(e) if matches!(
            e.code,
            codes::CR_SERVER_LOST
                | codes::CR_SERVER_GONE_ERROR
                | codes::CR_MALFORMED_PACKET
                | codes::CR_NET_PACKET_TOO_LARGE
        )
    )
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Text(s) | Value::Decimal(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::protocol::handshake::tests::greeting;
    use crate::protocol::writer::frame_packets;
    use crate::types::tests::column_packet;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    /// Server side of a scripted exchange.
    struct Script {
        stream: TcpStream,
        seq: u8,
    }

    impl Script {
        fn read(&mut self) -> Vec<u8> {
            let mut header = [0u8; 4];
            std::io::Read::read_exact(&mut self.stream, &mut header).unwrap();
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.seq = header[3].wrapping_add(1);
            let mut payload = vec![0u8; len];
            std::io::Read::read_exact(&mut self.stream, &mut payload).unwrap();
            payload
        }

        fn send(&mut self, payload: &[u8]) {
            let (framed, next) = frame_packets(payload, self.seq);
            self.seq = next;
            self.stream.write_all(&framed).unwrap();
        }

        fn ok(&mut self, affected: u64, status: u16) {
            let mut w = PacketWriter::new();
            w.write_u8(0);
            w.write_lenenc_int(affected);
            w.write_lenenc_int(0);
            w.write_u16_le(status);
            w.write_u16_le(0);
            self.send(&w.into_bytes());
        }

        fn eof(&mut self, status: u16) {
            let mut w = PacketWriter::new();
            w.write_u8(0xFE);
            w.write_lenenc_int(0);
            w.write_lenenc_int(0);
            w.write_u16_le(status);
            w.write_u16_le(0);
            self.send(&w.into_bytes());
        }

        /// Greeting, handshake response and OK.
        fn login(&mut self) {
            self.send(&greeting("mysql_native_password", b"abcdefghijklmnopqrst"));
            let _response = self.read();
            self.ok(0, SERVER_STATUS_AUTOCOMMIT);
            // autocommit forced off after connect
            assert_eq!(self.read(), b"\x03SET autocommit=0");
            self.seq = 1;
            self.ok(0, 0);
        }
    }

    fn serve(script: impl FnOnce(&mut Script) + Send + 'static) -> (ConnectOptions, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut s = Script { stream, seq: 0 };
            s.login();
            script(&mut s);
        });
        let options = ConnectOptions::new()
            .host("127.0.0.1")
            .port(port)
            .user("app")
            .ssl_enabled(false);
        (options, handle)
    }

    #[test]
    fn test_connect_and_accessors() {
        let (options, handle) = serve(|s| {
            assert_eq!(s.read(), [Command::Quit as u8]);
        });
        let mut conn = Connection::connect(&options).unwrap();
        assert_eq!(conn.thread_id(), 42);
        assert_eq!(conn.server_info(), "8.0.36");
        assert_eq!(conn.character_set_name(), "utf8mb4");
        assert!(!conn.get_autocommit());
        assert_eq!(conn.error_code(), 0);
        assert_eq!(conn.sqlstate(), "00000");
        assert_eq!(conn.get_host_info(), "127.0.0.1 via TCP/IP");
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_connection_fails_without_io() {
        let (options, handle) = serve(|s| {
            let _quit = s.read();
        });
        let mut conn = Connection::connect(&options).unwrap();
        conn.close();
        let err = conn.query("SELECT 1").unwrap_err();
        assert_eq!(err.code(), codes::CR_SERVER_GONE_ERROR);
        assert_eq!(conn.error_code(), codes::CR_SERVER_GONE_ERROR);
        assert!(conn.ping(false).is_err());
        handle.join().unwrap();
    }

    #[test]
    fn test_update_has_no_result_set() {
        let (options, handle) = serve(|s| {
            assert_eq!(s.read(), b"\x03UPDATE t SET a = 1");
            s.ok(3, 0);
            let _quit = s.read();
        });
        let mut conn = Connection::connect(&options).unwrap();
        conn.query("UPDATE t SET a = 1").unwrap();
        assert_eq!(conn.affected_rows(), 3);
        assert_eq!(conn.field_count(), 0);
        assert!(conn.store_result().unwrap().is_none());
        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_second_query_before_reading_result_is_out_of_sync() {
        let (options, handle) = serve(|s| {
            let _query = s.read();
            s.send(&[1]);
            s.send(&column_packet("t", "a", 3, 0, 63));
            s.send(b"\x011");
            s.eof(0);
            let _quit = s.read();
        });
        let mut conn = Connection::connect(&options).unwrap();
        conn.query("SELECT a FROM t").unwrap();
        assert_eq!(conn.state(), ConnectionState::ResultPending);
        let err = conn.query("SELECT 2").unwrap_err();
        assert_eq!(err.code(), codes::CR_COMMANDS_OUT_OF_SYNC);
        conn.discard_result().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_server_error_is_recorded() {
        let (options, handle) = serve(|s| {
            let _query = s.read();
            let mut w = PacketWriter::new();
            w.write_u8(0xFF);
            w.write_u16_le(1146);
            w.write_bytes(b"#42S02Table 'test.nope' doesn't exist");
            s.send(&w.into_bytes());
            let _quit = s.read();
        });
        let mut conn = Connection::connect(&options).unwrap();
        let err = conn.query("SELECT * FROM nope").unwrap_err();
        assert_eq!(err.code(), 1146);
        assert_eq!(conn.error_code(), 1146);
        assert_eq!(conn.sqlstate(), "42S02");
        assert!(conn.error_message().contains("doesn't exist"));
        assert!(conn.is_open());
        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_local_infile_refused_when_disabled() {
        let (options, handle) = serve(|s| {
            let _query = s.read();
            s.send(b"\xFB/etc/passwd");
            assert!(s.read().is_empty());
            s.ok(0, 0);
            let _quit = s.read();
        });
        let mut conn = Connection::connect(&options).unwrap();
        let err = conn
            .query("LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t")
            .unwrap_err();
        assert_eq!(err.code(), codes::CR_LOAD_DATA_LOCAL_INFILE_REJECTED);
        assert_eq!(conn.state(), ConnectionState::Ready);
        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_escape_respects_connection_charset() {
        let (options, handle) = serve(|s| {
            let _quit = s.read();
        });
        let conn = Connection::connect(&options).unwrap();
        assert_eq!(conn.escape_bytes(b"it's"), b"it\\'s");
        assert_eq!(conn.quote_literal("a\nb").unwrap(), b"'a\\nb'");
        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_fatal_error_codes() {
        assert!(is_fatal(&Error::client(codes::CR_SERVER_LOST, "lost")));
        assert!(is_fatal(&Error::closed()));
        assert!(!is_fatal(&out_of_sync()));
        assert!(!is_fatal(&Error::client(1062, "dup")));
    }

    #[test]
    fn test_corrupt_column_count_drops_transport() {
        let (options, handle) = serve(|s| {
            let _query = s.read();
            s.send(&[0xFD, 0xFF, 0xFF, 0xFF]);
            s.send(b"\x01");
        });
        let mut conn = Connection::connect(&options).unwrap();
        assert!(conn.is_connected());
        let err = conn.query("SELECT *").unwrap_err();
        assert_eq!(err.code(), codes::CR_MALFORMED_PACKET);
        assert!(conn.is_open());
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(
            conn.query("SELECT 1").unwrap_err().code(),
            codes::CR_SERVER_GONE_ERROR
        );
        handle.join().unwrap();
    }
}
