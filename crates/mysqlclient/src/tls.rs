//! TLS upgrade of a connection.
//!
//! The client sends an SSLRequest after reading the server greeting, runs
//! the TLS handshake on the same socket and then sends the real handshake
//! response encrypted. The SSL mode decides whether TLS is attempted and how
//! much of the server certificate is checked:
//!
//! - `DISABLED`: never
//! - `PREFERRED`: when the server offers it, no certificate checks
//! - `REQUIRED`: always, no certificate checks
//! - `VERIFY_CA`: always, chain checked against `ca`/`capath`
//! - `VERIFY_IDENTITY`: as `VERIFY_CA`, plus the host name
//!
//! TLS needs the `tls` feature. Without it `PREFERRED` stays plaintext and
//! the stricter modes fail.

use mysqlclient_core::{Error, Result, codes};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::capabilities;

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

fn tls_error(message: impl Into<String>) -> Error {
    Error::client(codes::CR_SSL_CONNECTION_ERROR, message)
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
pub(crate) fn negotiate(mode: SslMode, server_caps: u32) -> Result<bool> {
    let offered = server_caps & capabilities::CLIENT_SSL != 0;
    if !mode.should_try_ssl() {
        return Ok(false);
    }
    if !cfg!(feature = "tls") {
        return if mode.is_required() {
            Err(tls_error(format!(
                "SSL mode {mode} requires TLS support, which this build does not include"
            )))
        } else {
            Ok(false)
        };
    }
    match (offered, mode.is_required()) {
        (true, _) => Ok(true),
        (false, false) => Ok(false),
        (false, true) => Err(tls_error(
            "SSL connection error: SSL is required but the server doesn't support it",
        )),
    }
}

/// A stream encrypted with rustls.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("cipher", &self.cipher_name())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    pub fn connect(mut stream: S, tls: &TlsConfig, host: &str, mode: SslMode) -> Result<Self> {
        let config = build_client_config(tls, mode)?;
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| tls_error(format!("invalid server name '{host}': {e}")))?;
        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("SSL connection error: {e}")))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| tls_error(format!("SSL connection error: {e}")))?;
        }

        let tls_stream = TlsStream { conn, stream };
        tracing::debug!(
            version = ?tls_stream.conn.protocol_version(),
            cipher = tls_stream.cipher_name().unwrap_or("unknown"),
            "TLS established"
        );
        Ok(tls_stream)
    }

    /// Name of the negotiated cipher suite.
    pub fn cipher_name(&self) -> Option<&'static str> {
        self.conn
            .negotiated_cipher_suite()
            .and_then(|suite| suite.suite().as_str())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).read(buf)
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).flush()
    }
}

#[cfg(feature = "tls")]
fn build_client_config(tls: &TlsConfig, mode: SslMode) -> Result<rustls::ClientConfig> {
    use rustls::client::WebPkiServerVerifier;

    let provider = Arc::new(provider_with_cipher(tls.cipher.as_deref())?);
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

    let builder = match mode {
        SslMode::Disabled => return Err(tls_error("TLS requested with SSL mode DISABLED")),
        SslMode::Preferred | SslMode::Required => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::AcceptAny::new(provider))),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            let roots = Arc::new(root_store(tls)?);
            let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| tls_error(format!("failed to build certificate verifier: {e}")))?;
            if mode == SslMode::VerifyCa {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verify::SkipHostname(webpki)))
            } else {
                builder.with_webpki_verifier(webpki)
            }
        }
    };

    add_client_auth(builder, tls)
}

/// Crypto provider restricted to the suites named in `cipher`.
///
/// `cipher` is a `:`-separated list of rustls suite names such as
/// `TLS13_AES_256_GCM_SHA384`.
#[cfg(feature = "tls")]
fn provider_with_cipher(cipher: Option<&str>) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    let Some(cipher) = cipher else {
        return Ok(provider);
    };
    let wanted: Vec<String> = cipher
        .split(':')
        .map(|name| name.trim().to_ascii_uppercase())
        .filter(|name| !name.is_empty())
        .collect();
    provider.cipher_suites.retain(|suite| {
        suite
            .suite()
            .as_str()
            .is_some_and(|name| wanted.iter().any(|w| w == name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(tls_error(format!("no supported cipher suite in '{cipher}'")));
    }
    Ok(provider)
}

/// Trust anchors from `ca` and `capath`, or the webpki roots when neither is set.
#[cfg(feature = "tls")]
fn root_store(tls: &TlsConfig) -> Result<rustls::RootCertStore> {
    let mut store = rustls::RootCertStore::empty();
    if tls.ca.is_none() && tls.capath.is_none() {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(store);
    }

    let mut files = Vec::new();
    if let Some(ca) = &tls.ca {
        files.push(ca.clone());
    }
    if let Some(dir) = &tls.capath {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            tls_error(format!("failed to read CA directory '{}': {e}", dir.display()))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
    }

    for path in files {
        for cert in read_certs(&path)? {
            store
                .add(cert)
                .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
        }
    }
    if store.is_empty() {
        return Err(tls_error("no CA certificates found"));
    }
    Ok(store)
}

#[cfg(feature = "tls")]
fn read_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    let (Some(cert_path), Some(key_path)) = (&tls.cert, &tls.key) else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = read_certs(cert_path)?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            cert_path.display()
        )));
    }
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client certificate: {e}")))
}

#[cfg(feature = "tls")]
mod verify {
    use std::sync::Arc;

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};

    /// Accepts any server certificate; signatures are still checked.
    #[derive(Debug)]
    pub(super) struct AcceptAny {
        provider: Arc<CryptoProvider>,
    }

    impl AcceptAny {
        pub(super) fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, TlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Checks the chain but not the host name.
    #[derive(Debug)]
    pub(super) struct SkipHostname(pub(super) Arc<WebPkiServerVerifier>);

    impl ServerCertVerifier for SkipHostname {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, TlsError> {
            match self.0.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(TlsError::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                res => res,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            self.0.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            self.0.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_verify_schemes()
        }
    }
}

/// Placeholder when the `tls` feature is disabled.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    stream: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    /// Always fails: this build has no TLS support.
    #[allow(unused_variables)]
    pub fn connect(stream: S, tls: &TlsConfig, host: &str, mode: SslMode) -> Result<Self> {
        Err(tls_error(
            "TLS support requires the 'tls' feature of the mysqlclient crate",
        ))
    }

    pub fn cipher_name(&self) -> Option<&'static str> {
        None
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

#[cfg(not(feature = "tls"))]
impl<S> std::io::Read for TlsStream<S> {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

#[cfg(not(feature = "tls"))]
impl<S> std::io::Write for TlsStream<S> {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysqlclient_core::ErrorCategory;

    #[test]
    fn test_disabled_never_upgrades() {
        assert!(!negotiate(SslMode::Disabled, capabilities::CLIENT_SSL).unwrap());
        assert!(!negotiate(SslMode::Disabled, 0).unwrap());
    }

    #[test]
    fn test_preferred_without_server_support_stays_plain() {
        assert!(!negotiate(SslMode::Preferred, 0).unwrap());
    }

    #[test]
    fn test_required_modes_fail_without_server_support() {
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = negotiate(mode, 0).unwrap_err();
            assert_eq!(err.code(), codes::CR_SSL_CONNECTION_ERROR);
            assert_eq!(err.category(), ErrorCategory::Operational);
        }
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_server_support_upgrades() {
        for mode in [
            SslMode::Preferred,
            SslMode::Required,
            SslMode::VerifyCa,
            SslMode::VerifyIdentity,
        ] {
            assert!(negotiate(mode, capabilities::CLIENT_SSL).unwrap());
        }
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_without_feature_preferred_stays_plain() {
        assert!(!negotiate(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        let err = negotiate(SslMode::Required, capabilities::CLIENT_SSL).unwrap_err();
        assert_eq!(err.code(), codes::CR_SSL_CONNECTION_ERROR);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_unknown_cipher_rejected() {
        let err = provider_with_cipher(Some("NOT-A-CIPHER")).unwrap_err();
        assert_eq!(err.code(), codes::CR_SSL_CONNECTION_ERROR);
        assert!(provider_with_cipher(Some("TLS13_AES_128_GCM_SHA256")).is_ok());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_missing_ca_file_is_ssl_error() {
        let tls = TlsConfig::new().ca_cert("/nonexistent/ca.pem");
        let err = build_client_config(&tls, SslMode::VerifyCa).unwrap_err();
        assert_eq!(err.code(), codes::CR_SSL_CONNECTION_ERROR);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_unverified_config_builds() {
        assert!(build_client_config(&TlsConfig::new(), SslMode::Required).is_ok());
        assert!(build_client_config(&TlsConfig::new(), SslMode::VerifyIdentity).is_ok());
    }
}
