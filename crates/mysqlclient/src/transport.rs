//! Sockets and packet I/O.
//!
//! [`PacketStream`] reads and writes whole protocol payloads: it joins and
//! splits 16MB packets, tracks the sequence id and routes the bytes through
//! TLS and the compressed protocol once those are enabled. I/O errors are
//! mapped to the client codes the rest of the crate reports.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use mysqlclient_core::{ClientError, ConfigErrorKind, Error, Result, codes};

use crate::compress::Compressor;
use crate::config::{ConnectOptions, SslMode, TlsConfig};
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, malformed};
use crate::protocol::writer::frame_packets;
use crate::tls::TlsStream;

/// An unencrypted connection to the server.
#[derive(Debug)]
pub(crate) enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    #[cfg(windows)]
    Pipe(std::fs::File),
}

impl Socket {
    /// Open the transport the options ask for: Unix socket, named pipe or TCP.
    pub(crate) fn connect(options: &ConnectOptions) -> Result<Self> {
        if let Some(path) = &options.unix_socket {
            return Self::connect_unix(path, options.connect_timeout);
        }
        if let Some(pipe) = &options.named_pipe {
            return Self::connect_pipe(options.host_name(), pipe);
        }
        Self::connect_tcp(options.host_name(), options.port, options.connect_timeout)
    }

    fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::Client(
                    ClientError::new(
                        codes::CR_UNKNOWN_HOST,
                        format!("Unknown MySQL server host '{host}' ({e})"),
                    )
                    .with_source(e),
                )
            })?
            .collect();

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in &addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::debug!(%addr, "TCP connection established");
                    return Ok(Socket::Tcp(stream));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                    last_err = e;
                }
            }
        }

        Err(Error::Client(
            ClientError::new(
                codes::CR_CONN_HOST_ERROR,
                format!("Can't connect to MySQL server on '{host}:{port}' ({last_err})"),
            )
            .with_source(last_err),
        ))
    }

    #[cfg(unix)]
    fn connect_unix(path: &std::path::Path, timeout: Option<Duration>) -> Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
            Error::Client(
                ClientError::new(
                    codes::CR_CONNECTION_ERROR,
                    format!(
                        "Can't connect to local MySQL server through socket '{}' ({e})",
                        path.display()
                    ),
                )
                .with_source(e),
            )
        })?;
        let socket = Socket::Unix(stream);
        socket.set_timeouts(timeout, timeout);
        Ok(socket)
    }

    #[cfg(not(unix))]
    fn connect_unix(path: &std::path::Path, _timeout: Option<Duration>) -> Result<Self> {
        Err(Error::config(
            ConfigErrorKind::Unsupported,
            format!(
                "Unix sockets are not available on this platform: {}",
                path.display()
            ),
        ))
    }

    #[cfg(windows)]
    fn connect_pipe(host: &str, pipe: &str) -> Result<Self> {
        let server = if host == "localhost" { "." } else { host };
        let path = format!(r"\\{server}\pipe\{pipe}");
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map(Socket::Pipe)
            .map_err(|e| {
                Error::Client(
                    ClientError::new(
                        codes::CR_NAMEDPIPEOPEN_ERROR,
                        format!("Can't open named pipe to host: {server}  pipe: {pipe} ({e})"),
                    )
                    .with_source(e),
                )
            })
    }

    #[cfg(not(windows))]
    fn connect_pipe(_host: &str, pipe: &str) -> Result<Self> {
        Err(Error::config(
            ConfigErrorKind::Unsupported,
            format!("named pipes are only available on Windows: {pipe}"),
        ))
    }

    /// Apply read and write timeouts; `None` blocks indefinitely.
    pub(crate) fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) {
        match self {
            Socket::Tcp(s) => {
                s.set_read_timeout(read).ok();
                s.set_write_timeout(write).ok();
            }
            #[cfg(unix)]
            Socket::Unix(s) => {
                s.set_read_timeout(read).ok();
                s.set_write_timeout(write).ok();
            }
            #[cfg(windows)]
            Socket::Pipe(_) => {}
        }
    }

    /// Is this a same-host transport that never leaves the machine?
    pub(crate) fn is_local(&self) -> bool {
        !matches!(self, Socket::Tcp(_))
    }

    fn shutdown(&self) {
        match self {
            Socket::Tcp(s) => {
                s.shutdown(Shutdown::Both).ok();
            }
            #[cfg(unix)]
            Socket::Unix(s) => {
                s.shutdown(Shutdown::Both).ok();
            }
            #[cfg(windows)]
            Socket::Pipe(_) => {}
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
            #[cfg(windows)]
            Socket::Pipe(f) => f.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.write(buf),
            #[cfg(windows)]
            Socket::Pipe(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Socket::Unix(s) => s.flush(),
            #[cfg(windows)]
            Socket::Pipe(f) => f.flush(),
        }
    }
}

#[derive(Debug)]
enum Stream {
    Plain(Socket),
    Tls(Box<TlsStream<Socket>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

fn read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::InvalidData {
        return malformed(e);
    }
    let detail = match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => "timed out".to_string(),
        _ => e.to_string(),
    };
    Error::Client(
        ClientError::new(
            codes::CR_SERVER_LOST,
            format!("Lost connection to MySQL server during query ({detail})"),
        )
        .with_source(e),
    )
}

fn write_error(e: io::Error) -> Error {
    Error::Client(
        ClientError::new(
            codes::CR_SERVER_GONE_ERROR,
            format!("MySQL server has gone away ({e})"),
        )
        .with_source(e),
    )
}

fn too_large() -> Error {
    Error::client(
        codes::CR_NET_PACKET_TOO_LARGE,
        "Got packet bigger than 'max_allowed_packet' bytes",
    )
}

/// Framed packet I/O over a socket.
#[derive(Debug)]
pub(crate) struct PacketStream {
    stream: Stream,
    local: bool,
    sequence_id: u8,
    compressor: Option<Compressor>,
    max_allowed_packet: usize,
}

impl PacketStream {
    pub(crate) fn new(socket: Socket, max_allowed_packet: usize) -> Self {
        Self {
            local: socket.is_local(),
            stream: Stream::Plain(socket),
            sequence_id: 0,
            compressor: None,
            max_allowed_packet,
        }
    }

    /// Encrypt the connection. The SSLRequest must already have been sent.
    pub(crate) fn upgrade_tls(self, tls: &TlsConfig, host: &str, mode: SslMode) -> Result<Self> {
        let Stream::Plain(socket) = self.stream else {
            return Err(Error::client(
                codes::CR_SSL_CONNECTION_ERROR,
                "connection is already encrypted",
            ));
        };
        let tls_stream = TlsStream::connect(socket, tls, host, mode)?;
        Ok(Self {
            stream: Stream::Tls(Box::new(tls_stream)),
            ..self
        })
    }

    /// Switch to the compressed protocol for all further packets.
    pub(crate) fn enable_compression(&mut self) {
        tracing::debug!("compressed protocol enabled");
        self.compressor = Some(Compressor::new());
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Is the channel safe for sending a cleartext password?
    pub(crate) fn is_secure(&self) -> bool {
        self.local || self.is_tls()
    }

    /// Name of the negotiated TLS cipher, if encrypted.
    pub(crate) fn cipher_name(&self) -> Option<&'static str> {
        match &self.stream {
            Stream::Tls(s) => s.cipher_name(),
            Stream::Plain(_) => None,
        }
    }

    fn socket(&self) -> &Socket {
        match &self.stream {
            Stream::Plain(socket) => socket,
            Stream::Tls(s) => s.get_ref(),
        }
    }

    pub(crate) fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) {
        self.socket().set_timeouts(read, write);
    }

    pub(crate) fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Start a new command: sequence ids restart at zero.
    pub(crate) fn reset_sequence(&mut self) {
        self.sequence_id = 0;
        if let Some(c) = &mut self.compressor {
            c.reset();
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match &mut self.compressor {
            Some(c) => c.read_exact(&mut self.stream, buf),
            None => self.stream.read_exact(buf),
        }
    }

    /// Read one logical payload, joining continuation packets.
    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.read_exact(&mut header).map_err(read_error)?;
            let header = PacketHeader::from_bytes(&header);
            let len = header.payload_length as usize;
            self.sequence_id = header.sequence_id.wrapping_add(1);
            tracing::trace!(len, seq = header.sequence_id, "read packet");

            if payload.len() + len > self.max_allowed_packet {
                return Err(too_large());
            }
            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..]).map_err(read_error)?;

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload, splitting it as needed.
    pub(crate) fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_allowed_packet {
            return Err(too_large());
        }
        let (framed, next) = frame_packets(payload, self.sequence_id);
        tracing::trace!(len = payload.len(), seq = self.sequence_id, "write packet");
        self.sequence_id = next;

        let result = match &mut self.compressor {
            Some(c) => c.write_all(&mut self.stream, &framed),
            None => self
                .stream
                .write_all(&framed)
                .and_then(|()| self.stream.flush()),
        };
        result.map_err(write_error)
    }

    /// Send a command payload as the first packet of a new exchange.
    pub(crate) fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(payload)
    }

    pub(crate) fn shutdown(&self) {
        self.socket().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (PacketStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = Socket::connect_tcp("127.0.0.1", port, None).unwrap();
        let (server, _) = listener.accept().unwrap();
        (PacketStream::new(client, 1 << 26), server)
    }

    #[test]
    fn test_write_then_read_packet() {
        let (mut stream, mut server) = pair();
        stream.write_command(&[0x0e]).unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 0, 0, 0, 0x0e]);

        server.write_all(&[3, 0, 0, 1, 0, 0, 0]).unwrap();
        assert_eq!(stream.read_packet().unwrap(), vec![0, 0, 0]);
        assert_eq!(stream.sequence_id(), 2);
    }

    #[test]
    fn test_read_after_close_is_server_lost() {
        let (mut stream, server) = pair();
        drop(server);
        let err = stream.read_packet().unwrap_err();
        assert_eq!(err.code(), codes::CR_SERVER_LOST);
    }

    #[test]
    fn test_packet_over_limit_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = Socket::connect_tcp("127.0.0.1", port, None).unwrap();
        let mut stream = PacketStream::new(client, 16);
        let err = stream.write_packet(&[0u8; 17]).unwrap_err();
        assert_eq!(err.code(), codes::CR_NET_PACKET_TOO_LARGE);
    }

    #[test]
    fn test_compressed_exchange() {
        let (mut stream, mut server) = pair();
        stream.enable_compression();
        stream.write_command(&[0x0e]).unwrap();

        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..7], &[5, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[7..], &[1, 0, 0, 0, 0x0e]);

        // Uncompressed body: one OK packet with sequence id 1
        server
            .write_all(&[11, 0, 0, 1, 0, 0, 0, 7, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0])
            .unwrap();
        let payload = stream.read_packet().unwrap();
        assert_eq!(payload, vec![0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_refused_connection_is_host_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Socket::connect_tcp("127.0.0.1", port, Some(Duration::from_secs(2)))
            .unwrap_err();
        assert_eq!(err.code(), codes::CR_CONN_HOST_ERROR);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_named_pipe_unsupported() {
        let options = ConnectOptions::new().named_pipe("MySQL");
        let err = Socket::connect(&options).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
