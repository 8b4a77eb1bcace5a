//! `my.cnf`-style option files.
//!
//! Only the `[client]` group and the group named by `read_default_group`
//! are read; values from the named group win over `[client]`. Options read
//! from the file only fill settings the caller left unset.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use mysqlclient_core::{ConfigError, ConfigErrorKind, Error, Result};
use regex::Regex;

use crate::config::{ConnectOptions, DEFAULT_PORT, SslMode, SslOption, TlsConfig};

const GROUP_PATTERN: &str = r"^\s*\[\s*([^\]]+?)\s*\]\s*$";
const OPTION_PATTERN: &str = r"^\s*([A-Za-z0-9_-]+)\s*(?:=\s*(.*?))?\s*$";

const DEFAULT_GROUP: &str = "client";

/// Parsed option file: group name to `(key, value)` pairs in file order.
#[derive(Debug, Default, Clone)]
pub struct OptionFile {
    groups: HashMap<String, Vec<(String, String)>>,
}

impl OptionFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(ConfigError {
                kind: ConfigErrorKind::Invalid,
                message: format!("cannot read option file '{}': {e}", path.display()),
                source: Some(Box::new(e)),
            })
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                Error::Config(ConfigError {
                    kind: ConfigErrorKind::Invalid,
                    message: format!("bad option file pattern: {e}"),
                    source: Some(Box::new(e)),
                })
            })
        };
        let group_re = compile(GROUP_PATTERN)?;
        let option_re = compile(OPTION_PATTERN)?;

        let mut file = Self::default();
        let mut current: Option<String> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            if let Some(caps) = group_re.captures(trimmed) {
                let name = caps[1].to_ascii_lowercase();
                file.groups.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            // Directives such as !include are not followed
            if trimmed.starts_with('!') {
                tracing::debug!(directive = trimmed, "ignoring option file directive");
                continue;
            }
            let (Some(group), Some(caps)) = (&current, option_re.captures(trimmed)) else {
                continue;
            };
            let key = caps[1].to_ascii_lowercase().replace('_', "-");
            let value = caps.get(2).map_or("", |m| m.as_str());
            file.groups
                .entry(group.clone())
                .or_default()
                .push((key, unquote(strip_comment(value))));
        }
        Ok(file)
    }

    /// Effective values of `[client]` overlaid with `group`.
    pub fn values(&self, group: Option<&str>) -> HashMap<&str, &str> {
        let mut values = HashMap::new();
        let groups = std::iter::once(DEFAULT_GROUP).chain(group.filter(|g| *g != DEFAULT_GROUP));
        for name in groups {
            if let Some(pairs) = self.groups.get(&name.to_ascii_lowercase()) {
                for (key, value) in pairs {
                    values.insert(key.as_str(), value.as_str());
                }
            }
        }
        values
    }

    /// Fill the unset settings of `options` from the selected groups.
    pub fn apply(&self, options: &mut ConnectOptions, group: Option<&str>) -> Result<()> {
        for (key, value) in self.values(group) {
            apply_option(options, key, value)?;
        }
        Ok(())
    }
}

fn strip_comment(value: &str) -> &str {
    if value.starts_with('"') || value.starts_with('\'') {
        return value;
    }
    value.find(" #").map_or(value, |i| value[..i].trim_end())
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn fill(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

fn flag(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no")
}

fn invalid(key: &str, value: &str) -> Error {
    Error::config(
        ConfigErrorKind::Invalid,
        format!("invalid value for option '{key}': '{value}'"),
    )
}

fn tls_material(options: &mut ConnectOptions) -> Option<&mut TlsConfig> {
    if options.ssl.is_none() {
        options.ssl = Some(SslOption::Params(TlsConfig::default()));
    }
    match &mut options.ssl {
        Some(SslOption::Params(tls)) => Some(tls),
        _ => None,
    }
}

fn apply_option(options: &mut ConnectOptions, key: &str, value: &str) -> Result<()> {
    match key {
        "host" => fill(&mut options.host, value),
        "user" => fill(&mut options.user, value),
        "password" => fill(&mut options.password, value),
        "database" => fill(&mut options.database, value),
        "default-character-set" => fill(&mut options.charset, value),
        "init-command" => fill(&mut options.init_command, value),
        "port" => {
            if options.port == DEFAULT_PORT {
                options.port = value.parse().map_err(|_| invalid(key, value))?;
            }
        }
        "socket" => {
            if options.unix_socket.is_none() {
                options.unix_socket = Some(value.into());
            }
        }
        "connect-timeout" => {
            if options.connect_timeout.is_none() {
                let secs: u64 = value.parse().map_err(|_| invalid(key, value))?;
                options.connect_timeout = Some(Duration::from_secs(secs));
            }
        }
        "compress" => options.compress |= flag(value),
        "local-infile" => options.local_infile |= flag(value),
        "ssl-mode" => {
            if options.ssl_mode.is_none() {
                options.ssl_mode = Some(SslMode::from_str(value)?);
            }
        }
        "ssl-ca" | "ssl-capath" | "ssl-cert" | "ssl-key" | "ssl-cipher" => {
            let Some(tls) = tls_material(options) else {
                return Ok(());
            };
            match key {
                "ssl-ca" => tls.ca = tls.ca.take().or_else(|| Some(value.into())),
                "ssl-capath" => tls.capath = tls.capath.take().or_else(|| Some(value.into())),
                "ssl-cert" => tls.cert = tls.cert.take().or_else(|| Some(value.into())),
                "ssl-key" => tls.key = tls.key.take().or_else(|| Some(value.into())),
                _ => fill(&mut tls.cipher, value),
            }
        }
        _ => tracing::debug!(key, "ignoring unknown option file key"),
    }
    Ok(())
}

/// Apply `read_default_file` / `read_default_group` to a copy of `options`.
pub(crate) fn resolve(options: &ConnectOptions) -> Result<ConnectOptions> {
    let mut resolved = options.clone();
    if let Some(path) = &options.read_default_file {
        let file = OptionFile::load(path)?;
        file.apply(&mut resolved, options.read_default_group.as_deref())?;
        tracing::debug!(path = %path.display(), "applied option file");
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"
# global comment
[client]
host = db.internal
user=app
password = "p#ss word"
port=3307
default_character_set = latin1

[mysql]
host = ignored

[reporting]
user = reporter
ssl-ca = /etc/ssl/ca.pem
ssl-mode = VERIFY_CA
compress
!includedir /etc/mysql/conf.d/
"#;

    #[test]
    fn test_parse_groups() {
        let file = OptionFile::parse(SAMPLE).unwrap();
        let values = file.values(None);
        assert_eq!(values["host"], "db.internal");
        assert_eq!(values["password"], "p#ss word");
        assert_eq!(values["default-character-set"], "latin1");
        assert!(!values.contains_key("ssl-ca"));
    }

    #[test]
    fn test_named_group_overrides_client() {
        let file = OptionFile::parse(SAMPLE).unwrap();
        let values = file.values(Some("reporting"));
        assert_eq!(values["user"], "reporter");
        assert_eq!(values["host"], "db.internal");
        assert_eq!(values["compress"], "");
    }

    #[test]
    fn test_apply_fills_only_unset() {
        let file = OptionFile::parse(SAMPLE).unwrap();
        let mut options = ConnectOptions::new().user("explicit");
        file.apply(&mut options, Some("reporting")).unwrap();
        assert_eq!(options.user.as_deref(), Some("explicit"));
        assert_eq!(options.host.as_deref(), Some("db.internal"));
        assert_eq!(options.port, 3307);
        assert_eq!(options.charset.as_deref(), Some("latin1"));
        assert!(options.compress);
        assert_eq!(options.ssl_mode, Some(SslMode::VerifyCa));
        let (mode, tls) = options.resolve_ssl();
        assert_eq!(mode, SslMode::VerifyCa);
        assert_eq!(tls.ca, Some(PathBuf::from("/etc/ssl/ca.pem")));
    }

    #[test]
    fn test_explicit_port_kept() {
        let file = OptionFile::parse(SAMPLE).unwrap();
        let mut options = ConnectOptions::new().port(4000);
        file.apply(&mut options, None).unwrap();
        assert_eq!(options.port, 4000);
    }

    #[test]
    fn test_bad_port_is_invalid() {
        let file = OptionFile::parse("[client]\nport = abc\n").unwrap();
        let err = file.apply(&mut ConnectOptions::new(), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError {
                kind: ConfigErrorKind::Invalid,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let options = ConnectOptions::new().read_default_file("/nonexistent/my.cnf");
        assert!(matches!(resolve(&options), Err(Error::Config(_))));
    }
}
