// ABOUTME: SSH-specific error types.
// ABOUTME: One variant per failing hop or stage so callers can tell them apart.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("failed to dial proxy {addr}: {reason}")]
    ProxyDial { addr: String, reason: String },

    #[error("proxy refused CONNECT: status code {0}")]
    ProxyStatus(u16),

    #[error("proxy CONNECT handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("invalid proxy URL: {0}")]
    InvalidProxyUrl(String),

    #[error("bastion connection failed: {0}")]
    Bastion(Box<Error>),

    #[error("bastion could not forward to {target}: {reason}")]
    Forward { target: String, reason: String },

    #[error("connection to {0} timed out after {1:?}")]
    ConnectTimeout(String, Duration),

    #[error("host key mismatch: expected fingerprint {expected}")]
    HostKeyMismatch { expected: String },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("session setup failed: {0}")]
    SessionSetup(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("process exited with status {0}")]
    ExitStatus(u32),

    #[error("process killed by signal {signal}: {message}")]
    ExitSignal { signal: String, message: String },

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`] for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level failure reaching the target or a proxy.
    Dial,
    /// The HTTP proxy rejected or garbled the CONNECT exchange.
    ProxyHandshake,
    /// Host key rejected, authentication rejected, or transport negotiation failed.
    Handshake,
    /// Opening the channel, pty, or remote command failed.
    SessionSetup,
    /// The connect or command deadline passed.
    Timeout,
    /// The remote process exited non-zero or was killed.
    RemoteExecution,
    /// Local read or remote write failed while copying a payload.
    Transfer,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Dial { .. } | Error::ProxyDial { .. } | Error::Io(_) => ErrorKind::Dial,
            Error::ProxyStatus(_) | Error::ProxyHandshake(_) | Error::InvalidProxyUrl(_) => {
                ErrorKind::ProxyHandshake
            }
            Error::Bastion(inner) => inner.kind(),
            Error::Forward { .. } => ErrorKind::Dial,
            Error::ConnectTimeout(..) | Error::CommandTimeout(_) => ErrorKind::Timeout,
            Error::HostKeyMismatch { .. }
            | Error::UnsupportedAlgorithm(_)
            | Error::AuthenticationFailed
            | Error::AgentUnavailable(_)
            | Error::KeyLoadFailed { .. }
            | Error::Key(_)
            | Error::Protocol(_) => ErrorKind::Handshake,
            Error::SessionSetup(_) => ErrorKind::SessionSetup,
            Error::ExitStatus(_) | Error::ExitSignal { .. } | Error::ChannelClosed => {
                ErrorKind::RemoteExecution
            }
            Error::Transfer(_) => ErrorKind::Transfer,
        }
    }

    /// True when this error is a timeout rather than a failure of the remote command.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

pub type Result<T> = std::result::Result<T, Error>;
