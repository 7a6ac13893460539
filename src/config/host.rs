// ABOUTME: Per-host connection settings as written in sshpipe.yml.
// ABOUTME: Parses "host", "user@host", "host:port", "user@host:port" and builds a SessionConfig.

use super::env_value::{EnvValue, resolve_optional};
use crate::error::{Error, Result};
use crate::ssh::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_TIMEOUT, HttpProxy, Protocol, SessionConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(default)]
    pub password: Option<EnvValue>,
    /// Inline PEM private key.
    #[serde(default)]
    pub key: Option<EnvValue>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<EnvValue>,
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub key_exchanges: Vec<String>,
    #[serde(default)]
    pub use_insecure_cipher: bool,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub request_pty: bool,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// Hop the target is reached through.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum ProxyConfig {
    /// SSH bastion, configured like any other host.
    Ssh(Box<HostConfig>),
    /// HTTP proxy URL, `http://[user:pass@]host[:port]`.
    Http(EnvValue),
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            user: None,
            protocol: Protocol::default(),
            timeout: default_timeout(),
            command_timeout: default_command_timeout(),
            password: None,
            key: None,
            key_path: None,
            passphrase: None,
            ciphers: Vec::new(),
            key_exchanges: Vec::new(),
            use_insecure_cipher: false,
            fingerprint: None,
            request_pty: false,
            proxy: None,
        }
    }
}

impl HostConfig {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("server address cannot be empty".to_string());
        }

        // Parse format: [user@]host[:port], host may be a bracketed IPv6 literal
        let (user_part, rest) = match s.rfind('@') {
            Some(at_pos) => (Some(&s[..at_pos]), &s[at_pos + 1..]),
            None => (None, s),
        };

        if user_part.is_some_and(str::is_empty) {
            return Err("user cannot be empty".to_string());
        }

        let (host, port_str) = if let Some(bracketed) = rest.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {}", rest))?;
            let after = &bracketed[end + 1..];
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => return Err(format!("unexpected characters after address: {}", after)),
            };
            (&bracketed[..end], port)
        } else if rest.matches(':').count() == 1 {
            let colon_pos = rest.rfind(':').unwrap_or(rest.len());
            (&rest[..colon_pos], Some(&rest[colon_pos + 1..]))
        } else {
            // Bare IPv6 literals carry no port.
            (rest, None)
        };

        let port = match port_str {
            Some(port_str) => port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {}", port_str))?,
            None => default_port(),
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }

        Ok(HostConfig {
            host: Some(host.to_string()),
            port,
            user: user_part.map(|s| s.to_string()),
            ..Default::default()
        })
    }

    /// Override host, port and (if given) user from a `[user@]host[:port]` string.
    pub fn with_server(mut self, server: &str) -> Result<Self> {
        let parsed = HostConfig::parse(server).map_err(Error::InvalidConfig)?;
        self.host = parsed.host;
        self.port = parsed.port;
        if parsed.user.is_some() {
            self.user = parsed.user;
        }
        Ok(self)
    }

    /// Resolve secrets and defaults into a session config, proxies included.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let host = self.host.clone().ok_or_else(|| {
            Error::InvalidConfig("no host configured; set `host` or pass --server".to_string())
        })?;
        let user = match &self.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").map_err(|_| {
                Error::InvalidConfig(format!("no user configured for {}", host))
            })?,
        };

        let mut config = SessionConfig::new(host, user)
            .port(self.port)
            .protocol(self.protocol)
            .timeout(self.timeout)
            .command_timeout(self.command_timeout)
            .ciphers(&self.ciphers)
            .key_exchanges(&self.key_exchanges)
            .use_insecure_cipher(self.use_insecure_cipher)
            .request_pty(self.request_pty);

        if let Some(password) = resolve_optional(self.password.as_ref())? {
            config = config.password(password);
        }
        if let Some(key) = resolve_optional(self.key.as_ref())? {
            config = config.key(key);
        }
        if let Some(path) = &self.key_path {
            config = config.key_path(expand_home(path));
        }
        if let Some(passphrase) = resolve_optional(self.passphrase.as_ref())? {
            config = config.passphrase(passphrase);
        }
        if let Some(fingerprint) = &self.fingerprint {
            config = config.fingerprint(fingerprint);
        }

        match &self.proxy {
            Some(ProxyConfig::Ssh(bastion)) => {
                config = config.jump(bastion.session_config()?);
            }
            Some(ProxyConfig::Http(url)) => {
                config = config.http_proxy(HttpProxy::parse(&url.resolve()?)?);
            }
            None => {}
        }

        Ok(config)
    }
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
