// ABOUTME: SSH connection and session management using russh.
// ABOUTME: Handles transport setup, host key policy, authentication, and session opening.

use super::algorithms;
use super::auth;
use super::error::{Error, Result};
use super::exec::{ExecStream, RunOutput};
use super::tunnel::{self, HttpProxy, Protocol};
use russh::client::{self, Config, Handle, Msg};
use russh::keys::ssh_key;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Default timeout for dialing and completing the handshake.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for remote command execution.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const PTY_TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 80;
const PTY_ROWS: u32 = 40;
const PTY_SPEED: u32 = 14400;

/// Intermediate hop the target is reached through.
#[derive(Debug, Clone)]
pub enum Proxy {
    /// SSH to a bastion, then a forwarded channel to the target.
    Jump(Box<SessionConfig>),
    /// HTTP CONNECT tunnel.
    Http(HttpProxy),
}

/// Configuration for establishing an SSH session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Address family used to reach the host. Proxies carry their own.
    pub protocol: Protocol,
    /// Timeout for dialing plus handshake.
    pub timeout: Duration,
    /// Timeout applied by `Client::run`/`Client::stream` when none is given.
    pub command_timeout: Duration,
    pub password: Option<String>,
    /// Private key material (OpenSSH or PEM text).
    pub key: Option<String>,
    /// Path to a private key file.
    pub key_path: Option<PathBuf>,
    /// Passphrase for `key` or `key_path`.
    pub passphrase: Option<String>,
    /// Cipher names overriding russh's defaults.
    pub ciphers: Vec<String>,
    /// Key-exchange names overriding russh's defaults.
    pub key_exchanges: Vec<String>,
    /// Also offer CBC ciphers and SHA-1 key exchanges.
    pub use_insecure_cipher: bool,
    /// SHA-256 host key fingerprint (`SHA256:...`). Any host key is accepted when unset.
    pub fingerprint: Option<String>,
    /// Request a pseudo-terminal before running commands.
    pub request_pty: bool,
    pub proxy: Option<Proxy>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |s: &Option<String>| s.as_ref().map(|_| "<redacted>");
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("protocol", &self.protocol)
            .field("timeout", &self.timeout)
            .field("command_timeout", &self.command_timeout)
            .field("password", &redact(&self.password))
            .field("key", &redact(&self.key))
            .field("key_path", &self.key_path)
            .field("passphrase", &redact(&self.passphrase))
            .field("ciphers", &self.ciphers)
            .field("key_exchanges", &self.key_exchanges)
            .field("use_insecure_cipher", &self.use_insecure_cipher)
            .field("fingerprint", &self.fingerprint)
            .field("request_pty", &self.request_pty)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            protocol: Protocol::Tcp,
            timeout: DEFAULT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
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

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn ciphers<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphers = ciphers.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_exchanges<I, S>(mut self, key_exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_exchanges = key_exchanges.into_iter().map(Into::into).collect();
        self
    }

    pub fn use_insecure_cipher(mut self, enabled: bool) -> Self {
        self.use_insecure_cipher = enabled;
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn request_pty(mut self, enabled: bool) -> Self {
        self.request_pty = enabled;
        self
    }

    pub fn jump(mut self, bastion: SessionConfig) -> Self {
        self.proxy = Some(Proxy::Jump(Box::new(bastion)));
        self
    }

    pub fn http_proxy(mut self, proxy: HttpProxy) -> Self {
        self.proxy = Some(Proxy::Http(proxy));
        self
    }

    pub fn addr(&self) -> String {
        tunnel::join_host_port(&self.host, self.port)
    }
}

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    addr: String,
    fingerprint: Option<String>,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let actual = server_public_key
            .fingerprint(ssh_key::HashAlg::Sha256)
            .to_string();

        match &self.fingerprint {
            None => {
                tracing::debug!("accepting host key {} for {} unchecked", actual, self.addr);
                Ok(true)
            }
            Some(expected) if *expected == actual => Ok(true),
            Some(expected) => {
                tracing::warn!(
                    "host key mismatch for {}: expected {}, got {}",
                    self.addr,
                    expected,
                    actual
                );
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection, plus the bastion connection carrying it, if any.
pub struct Connection {
    addr: String,
    handle: Handle<SshHandler>,
    bastion: Option<Box<Connection>>,
    request_pty: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("handle", &"<russh::Handle>")
            .field("bastion", &self.bastion)
            .finish()
    }
}

impl Connection {
    /// Dial (through the configured proxy, if any), handshake, and authenticate.
    pub async fn open(config: &SessionConfig) -> Result<Self> {
        let addr = config.addr();
        match tokio::time::timeout(config.timeout, Self::open_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout(addr, config.timeout)),
        }
    }

    async fn open_inner(config: &SessionConfig) -> Result<Self> {
        let methods = auth::resolve(&auth::sources(config)).await;
        let preferred = algorithms::preferred(
            &config.ciphers,
            &config.key_exchanges,
            config.use_insecure_cipher,
        )?;

        let (stream, bastion) = tunnel::establish(config).await?;

        let russh_config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            preferred,
            ..Default::default()
        };

        let handler = SshHandler {
            addr: config.addr(),
            fingerprint: config.fingerprint.clone(),
        };

        let handshake = client::connect_stream(Arc::new(russh_config), stream, handler).await;
        let mut handle = match handshake {
            Ok(handle) => handle,
            Err(e) => {
                close_bastion(bastion).await;
                return Err(match (e, &config.fingerprint) {
                    (russh::Error::UnknownKey, Some(expected)) => Error::HostKeyMismatch {
                        expected: expected.clone(),
                    },
                    (e, _) => Error::Protocol(e),
                });
            }
        };
        tracing::debug!("handshake with {} completed", config.addr());

        if let Err(e) = auth::authenticate(&mut handle, &config.user, methods).await {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            close_bastion(bastion).await;
            return Err(e);
        }
        tracing::debug!("authenticated to {} as {}", config.addr(), config.user);

        Ok(Self {
            addr: config.addr(),
            handle,
            bastion: bastion.map(Box::new),
            request_pty: config.request_pty,
        })
    }

    pub(crate) fn handle(&self) -> &Handle<SshHandler> {
        &self.handle
    }

    /// Open the single command session this connection will serve.
    pub async fn open_session(self) -> Result<Session> {
        let mut channel = match self.handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                self.close().await;
                return Err(Error::SessionSetup(format!("failed to open channel: {}", e)));
            }
        };

        if self.request_pty {
            if let Err(e) = request_pty(&mut channel).await {
                let _ = channel.close().await;
                self.close().await;
                return Err(e);
            }
        }

        Ok(Session {
            channel,
            connection: self,
        })
    }

    /// Disconnect from the target, then from the bastion. Errors are only logged.
    pub async fn close(self) {
        let mut next = Some(self);
        while let Some(Connection {
            addr,
            handle,
            bastion,
            ..
        }) = next
        {
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                tracing::debug!("disconnect from {} failed: {}", addr, e);
            }
            next = bastion.map(|b| *b);
        }
    }
}

async fn close_bastion(bastion: Option<Connection>) {
    if let Some(bastion) = bastion {
        bastion.close().await;
    }
}

async fn request_pty(channel: &mut Channel<Msg>) -> Result<()> {
    channel
        .request_pty(
            true,
            PTY_TERM,
            PTY_COLUMNS,
            PTY_ROWS,
            0,
            0,
            &[
                (Pty::ECHO, 0),
                (Pty::TTY_OP_ISPEED, PTY_SPEED),
                (Pty::TTY_OP_OSPEED, PTY_SPEED),
            ],
        )
        .await
        .map_err(|e| Error::SessionSetup(format!("failed to request pty: {}", e)))?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(Error::SessionSetup("pty request refused".to_string()));
            }
            Some(_) => {}
            None => return Err(Error::ChannelClosed),
        }
    }
}

/// An open, single-use session: one channel on a connection it owns.
///
/// Consumed by exactly one of [`Session::stream`], [`Session::run`], [`Session::upload`],
/// or [`Session::close`]; each closes the connection when finished.
pub struct Session {
    channel: Channel<Msg>,
    connection: Connection,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel.id())
            .field("connection", &self.connection)
            .finish()
    }
}

impl Session {
    /// Connect to the configured host and open a session.
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        Connection::open(config).await?.open_session().await
    }

    pub(crate) fn into_parts(self) -> (Channel<Msg>, Connection) {
        (self.channel, self.connection)
    }

    /// Start `command` and stream its output, giving up after `timeout`.
    pub async fn stream(self, command: &str, timeout: Duration) -> Result<ExecStream> {
        super::exec::start(self, command, timeout).await
    }

    /// Run `command` to completion (or timeout) and collect its output.
    pub async fn run(self, command: &str, timeout: Duration) -> Result<RunOutput> {
        Ok(self.stream(command, timeout).await?.collect().await)
    }

    /// Write `size` bytes from `source` to `target` on the remote host over SCP,
    /// giving up after `timeout`.
    pub async fn upload<R>(
        self,
        source: R,
        size: u64,
        target: &str,
        mode: u32,
        timeout: Duration,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        super::scp::upload(self, source, size, target, mode, timeout).await
    }

    /// Close the session without using it.
    pub async fn close(self) {
        let _ = self.channel.close().await;
        self.connection.close().await;
    }
}

/// Convenience front end: every call opens a fresh session from the same config.
#[derive(Debug, Clone)]
pub struct Client {
    config: SessionConfig,
}

impl Client {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session for manual use.
    pub async fn connect(&self) -> Result<Session> {
        Session::connect(&self.config).await
    }

    /// Stream a command's output with the configured command timeout.
    pub async fn stream(&self, command: &str) -> Result<ExecStream> {
        self.stream_with_timeout(command, self.config.command_timeout)
            .await
    }

    pub async fn stream_with_timeout(&self, command: &str, timeout: Duration) -> Result<ExecStream> {
        self.connect().await?.stream(command, timeout).await
    }

    /// Run a command with the configured command timeout.
    pub async fn run(&self, command: &str) -> Result<RunOutput> {
        self.run_with_timeout(command, self.config.command_timeout)
            .await
    }

    pub async fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<RunOutput> {
        self.connect().await?.run(command, timeout).await
    }

    /// Upload a local file to `target`, like `scp source host:target`.
    pub async fn scp(&self, source: impl AsRef<Path>, target: &str) -> Result<()> {
        let source = source.as_ref();
        let local_err = |e: std::io::Error| {
            Error::Transfer(format!("cannot read {}: {}", source.display(), e))
        };
        let file = tokio::fs::File::open(source).await.map_err(local_err)?;
        let metadata = file.metadata().await.map_err(local_err)?;
        if !metadata.is_file() {
            return Err(Error::Transfer(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        let size = metadata.len();
        self.write_file(file, size, target).await
    }

    /// Upload `size` bytes read from `reader` to `target` with mode 0644.
    pub async fn write_file<R>(&self, reader: R, size: u64, target: &str) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.connect()
            .await?
            .upload(
                reader,
                size,
                target,
                super::scp::DEFAULT_MODE,
                self.config.command_timeout,
            )
            .await
    }
}
