//! Connection-phase packets: the server greeting, the client's response,
//! the SSL upgrade request and authentication method switches.

#![allow(clippy::cast_possible_truncation)]

use mysqlclient_core::Result;

use crate::protocol::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_SECURE_CONNECTION, CLIENT_SSL,
};
use crate::protocol::{Command, PacketReader, PacketWriter, malformed};

/// Protocol version spoken by every supported server.
pub const PROTOCOL_VERSION: u8 = 10;

/// Plugin assumed when the server does not name one.
const DEFAULT_PLUGIN: &str = "mysql_native_password";

/// Initial handshake (HandshakeV10) sent by the server.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble (usually 20 bytes) used by the authentication plugins
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    /// Server default collation id
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl Handshake {
    /// Parse the server greeting.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| malformed("missing protocol version"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(malformed(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| malformed("missing connection id"))?;
        let scramble_1 = reader
            .read_bytes(8)
            .ok_or_else(|| malformed("missing auth data"))?;
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| malformed("missing capability flags"))?;

        // Pre-4.1 greetings end here
        let charset = reader.read_u8().unwrap_or(0);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = usize::from(reader.read_u8().unwrap_or(0));
        reader.skip(10);

        let mut auth_data = scramble_1.to_vec();
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(len2.min(reader.remaining()))
                .unwrap_or_default();
            auth_data.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string()
        } else {
            String::new()
        };
        let auth_plugin = if auth_plugin.is_empty() {
            DEFAULT_PLUGIN.to_string()
        } else {
            auth_plugin
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_data,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// HandshakeResponse41 sent after the greeting (or after the TLS upgrade).
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::new();
        write_login_header(&mut writer, caps, self.max_packet_size, self.charset);

        writer.write_null_string(self.user);

        if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_null_bytes(self.auth_response);
        }

        if caps & CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }

        if caps & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }

        if caps & CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }

        writer.into_bytes()
    }
}

/// The truncated login packet that asks the server to switch to TLS.
pub fn ssl_request(capabilities: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    write_login_header(
        &mut writer,
        capabilities | CLIENT_SSL,
        max_packet_size,
        charset,
    );
    writer.into_bytes()
}

fn write_login_header(writer: &mut PacketWriter, caps: u32, max_packet_size: u32, charset: u8) {
    writer.write_u32_le(caps);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
}

fn write_attributes(writer: &mut PacketWriter, attributes: &[(String, String)]) {
    let mut attrs = PacketWriter::new();
    for (key, value) in attributes {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(value);
    }
    writer.write_lenenc_bytes(attrs.as_bytes());
}

/// Request from the server to restart authentication with another plugin.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse the packet, including its 0xFE header byte.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0xFE) {
            return Err(malformed("not an auth switch request"));
        }
        if reader.is_empty() {
            // Old-style switch to mysql_old_password
            return Ok(Self {
                plugin: "mysql_old_password".to_string(),
                auth_data: Vec::new(),
            });
        }
        let plugin = reader.read_null_string();
        let rest = reader.read_rest();
        Ok(Self {
            plugin,
            auth_data: rest.strip_suffix(&[0]).unwrap_or(rest).to_vec(),
        })
    }
}

/// Payload of COM_CHANGE_USER.
#[derive(Debug, Clone)]
pub struct ChangeUser<'a> {
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub charset: u8,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl ChangeUser<'_> {
    pub fn encode(&self, capabilities: u32) -> Vec<u8> {
        let mut writer = PacketWriter::command(Command::ChangeUser, 64);
        writer.write_null_string(self.user);
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_null_bytes(self.auth_response);
        }
        writer.write_null_string(self.database.unwrap_or(""));
        writer.write_u16_le(u16::from(self.charset));
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if capabilities & CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}
