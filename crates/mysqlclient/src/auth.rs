//! Authentication plugins.
//!
//! The server names a plugin in its greeting (or later in an auth switch
//! request); the client answers with that plugin's initial response and
//! then feeds any AuthMoreData payloads back to it until the server sends
//! OK or ERR.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
//! ```
//!
//! The server answers 0x03 when the hash is cached (fast path) or 0x04 when
//! it needs the password itself. Over TLS or a Unix socket the password is
//! then sent in clear; otherwise it is XORed with the scramble and encrypted
//! with the server's RSA key (OAEP), which is read from
//! `server_public_key_path` or requested from the server.

use std::path::Path;

use mysqlclient_core::{Error, Result, codes};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of caching_sha2_password AuthMoreData packets.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// What the client knows when computing a response.
#[derive(Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    /// Scramble from the greeting or the last auth switch request
    pub scramble: &'a [u8],
    /// TLS or a local socket: cleartext passwords may be sent
    pub secure: bool,
    pub server_public_key_path: Option<&'a Path>,
}

impl std::fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("secure", &self.secure)
            .field("server_public_key_path", &self.server_public_key_path)
            .finish_non_exhaustive()
    }
}

/// Next move after an AuthMoreData payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this payload to the server
    Respond(Vec<u8>),
    /// Nothing to send; read the server's next packet
    Wait,
}

/// An authentication method the client can speak.
pub trait AuthPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Auth response for the handshake response or an auth switch.
    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// React to an AuthMoreData payload (without its 0x01 header).
    fn continue_auth(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep> {
        let _ = (data, ctx);
        Err(plugin_error(format!(
            "unexpected extra authentication data for '{}'",
            self.name()
        )))
    }
}

pub(crate) fn plugin_error(message: impl Into<String>) -> Error {
    Error::client(codes::CR_AUTH_PLUGIN_ERR, message)
}

/// Look up a built-in plugin by name.
pub fn plugin_for(name: &str) -> Result<Box<dyn AuthPlugin>> {
    match name {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(Box::new(NativePassword)),
        plugins::CACHING_SHA2_PASSWORD => Ok(Box::new(CachingSha2Password)),
        plugins::SHA256_PASSWORD => Ok(Box::new(Sha256Password)),
        plugins::MYSQL_CLEAR_PASSWORD => Ok(Box::new(ClearPassword)),
        _ => Err(Error::client(
            codes::CR_AUTH_PLUGIN_CANNOT_LOAD,
            format!("Authentication plugin '{name}' cannot be loaded"),
        )),
    }
}

fn seed20(scramble: &[u8]) -> &[u8] {
    &scramble[..scramble.len().min(20)]
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// `mysql_native_password` scramble; empty for an empty password.
pub fn mysql_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(seed20(scramble));
    hasher.update(stage2);
    xor(&stage1, &hasher.finalize())
}

/// `caching_sha2_password` fast-path scramble; empty for an empty password.
pub fn caching_sha2_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash = Sha256::digest(password.as_bytes());
    let hash_hash = Sha256::digest(hash);
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed20(scramble));
    xor(&hash, &hasher.finalize())
}

/// Password plus NUL, XORed with the scramble and RSA-OAEP encrypted.
pub fn encrypt_password(password: &str, scramble: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if scramble.is_empty() {
        return Err(plugin_error("empty scramble"));
    }
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= scramble[i % scramble.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| plugin_error(format!("server public key is not PEM text: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| plugin_error(format!("failed to parse server public key: {e}")))?;
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| plugin_error(format!("RSA encryption failed: {e}")))
}

fn cleartext(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

fn read_public_key(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        plugin_error(format!(
            "cannot read server public key '{}': {e}",
            path.display()
        ))
    })
}

fn looks_like_pem(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN")
}

#[derive(Debug)]
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(mysql_native_password(ctx.password, ctx.scramble))
    }
}

#[derive(Debug)]
pub struct CachingSha2Password;

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(caching_sha2_password(ctx.password, ctx.scramble))
    }

    fn continue_auth(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep> {
        if looks_like_pem(data) {
            return encrypt_password(ctx.password, ctx.scramble, data).map(AuthStep::Respond);
        }
        match data {
            [caching_sha2::FAST_AUTH_SUCCESS] => {
                tracing::debug!("caching_sha2_password fast auth succeeded");
                Ok(AuthStep::Wait)
            }
            [caching_sha2::PERFORM_FULL_AUTH] => {
                tracing::debug!(secure = ctx.secure, "caching_sha2_password full auth");
                if ctx.secure {
                    Ok(AuthStep::Respond(cleartext(ctx.password)))
                } else if let Some(path) = ctx.server_public_key_path {
                    let key = read_public_key(path)?;
                    encrypt_password(ctx.password, ctx.scramble, &key).map(AuthStep::Respond)
                } else {
                    Ok(AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                }
            }
            _ => Err(plugin_error(format!(
                "unexpected caching_sha2_password data ({} bytes)",
                data.len()
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Sha256Password;

impl Sha256Password {
    const REQUEST_PUBLIC_KEY: u8 = 0x01;
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        plugins::SHA256_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.password.is_empty() {
            return Ok(vec![0]);
        }
        if ctx.secure {
            return Ok(cleartext(ctx.password));
        }
        match ctx.server_public_key_path {
            Some(path) => encrypt_password(ctx.password, ctx.scramble, &read_public_key(path)?),
            None => Ok(vec![Self::REQUEST_PUBLIC_KEY]),
        }
    }

    fn continue_auth(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep> {
        if !looks_like_pem(data) {
            return Err(plugin_error("expected the server's public key"));
        }
        encrypt_password(ctx.password, ctx.scramble, data).map(AuthStep::Respond)
    }
}

#[derive(Debug)]
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.secure {
            return Err(plugin_error(
                "mysql_clear_password requires a TLS or local socket connection",
            ));
        }
        Ok(cleartext(ctx.password))
    }
}
