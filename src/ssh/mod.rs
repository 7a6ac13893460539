// ABOUTME: SSH client module: remote command streaming and SCP uploads.
// ABOUTME: Reaches hosts directly, through an HTTP CONNECT proxy, or through an SSH bastion.

mod algorithms;
mod auth;
mod client;
mod error;
mod exec;
mod scp;
mod tunnel;

pub use auth::{
    AgentSource, AuthMethod, CredentialSource, InlineKeySource, KeyFileSource, PasswordSource,
    resolve as resolve_auth, sources as auth_sources,
};
pub use client::{
    Client, Connection, DEFAULT_COMMAND_TIMEOUT, DEFAULT_TIMEOUT, Proxy, Session, SessionConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use exec::{ExecStream, Outcome, RunOutput};
pub use scp::DEFAULT_MODE;
pub use tunnel::{HttpProxy, Protocol, Transport, join_host_port};
