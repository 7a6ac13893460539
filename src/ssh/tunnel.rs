// ABOUTME: Raw transports the SSH handshake runs over.
// ABOUTME: Direct TCP, HTTP CONNECT through a proxy, or a direct-tcpip channel on a bastion.

use super::client::{Connection, Proxy, SessionConfig};
use super::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{AUTHORIZATION, HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream an SSH handshake can be layered on.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Address family used when dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Either family, in resolver order.
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Protocol {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Protocol::Tcp => true,
            Protocol::Tcp4 => addr.is_ipv4(),
            Protocol::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Tcp4 => write!(f, "tcp4"),
            Protocol::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// HTTP proxy reached with a CONNECT request.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Address family for dialing the proxy itself, independent of the target's.
    pub protocol: Protocol,
}

impl fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl HttpProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            protocol: Protocol::Tcp,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parse `http://[user[:pass]@]host[:port]`. The scheme may be omitted; port defaults to 80.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let rest = match url.split_once("://") {
            Some(("http", rest)) => rest,
            Some((scheme, _)) => {
                return Err(Error::InvalidProxyUrl(format!("unsupported scheme: {}", scheme)));
            }
            None => url,
        };
        let rest = rest.trim_end_matches('/');

        let (userinfo, hostport) = match rest.rfind('@') {
            Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
            None => (None, rest),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(Error::InvalidProxyUrl(format!("missing host in {}", url)));
        }

        let mut proxy = HttpProxy::new(host, port.unwrap_or(80));
        if let Some(userinfo) = userinfo {
            let (user, pass) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            proxy.username = Some(decode(user)?);
            proxy.password = Some(decode(pass)?);
        }
        Ok(proxy)
    }

    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    fn basic_auth(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        Some(format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass))))
    }
}

fn decode(part: &str) -> Result<String> {
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidProxyUrl(e.to_string()))
}

fn split_host_port(s: &str) -> Result<(&str, Option<u16>)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::InvalidProxyUrl(format!("invalid port: {}", p)))
    };

    if let Some(bracketed) = s.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::InvalidProxyUrl(format!("unterminated IPv6 literal: {}", s)))?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None => Ok((host, None)),
        };
    }

    match s.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((s, None)),
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Open a TCP connection to the first reachable address of the requested family.
pub(crate) async fn dial(host: &str, port: u16, protocol: Protocol) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        if !protocol.accepts(&addr) {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::debug!("connected to {} over {}", addr, protocol);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no {} address for {}", protocol, host),
        )
    }))
}

/// Ask an HTTP proxy to open a tunnel to `target_host:target_port`.
///
/// Only a 200 response yields a stream. Anything else is drained and reported by status code.
pub(crate) async fn http_connect(
    proxy: &HttpProxy,
    target_host: &str,
    target_port: u16,
) -> Result<TokioIo<hyper::upgrade::Upgraded>> {
    let stream = dial(&proxy.host, proxy.port, proxy.protocol)
        .await
        .map_err(|e| Error::ProxyDial {
            addr: proxy.addr(),
            reason: e.to_string(),
        })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::ProxyHandshake(e.to_string()))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("proxy connection error: {}", e);
        }
    });

    let authority = join_host_port(target_host, target_port);
    let mut req = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(HOST, authority.as_str());
    if let Some(credentials) = proxy.basic_auth() {
        req = req
            .header(AUTHORIZATION, credentials.as_str())
            .header(PROXY_AUTHORIZATION, credentials.as_str());
    }
    let req = req
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::ProxyHandshake(format!("failed to build request: {}", e)))?;

    tracing::debug!("CONNECT {} via {}", authority, proxy.addr());
    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            driver.abort();
            return Err(Error::ProxyHandshake(e.to_string()));
        }
    };

    let status = resp.status();
    if status != StatusCode::OK {
        let _ = resp.into_body().collect().await;
        driver.abort();
        return Err(Error::ProxyStatus(status.as_u16()));
    }

    let upgraded = hyper::upgrade::on(resp)
        .await
        .map_err(|e| Error::ProxyHandshake(e.to_string()))?;
    Ok(TokioIo::new(upgraded))
}

/// Transport to the target of `config`, plus the bastion connection that carries it, if any.
pub(crate) async fn establish(
    config: &SessionConfig,
) -> Result<(Box<dyn Transport>, Option<Connection>)> {
    match &config.proxy {
        None => {
            let stream = dial(&config.host, config.port, config.protocol)
                .await
                .map_err(|e| Error::Dial {
                    addr: config.addr(),
                    reason: e.to_string(),
                })?;
            Ok((Box::new(stream), None))
        }
        Some(Proxy::Http(proxy)) => {
            let stream = http_connect(proxy, &config.host, config.port).await?;
            Ok((Box::new(stream), None))
        }
        Some(Proxy::Jump(jump)) => {
            let bastion = Box::pin(Connection::open(jump))
                .await
                .map_err(|e| Error::Bastion(Box::new(e)))?;

            let channel = match bastion
                .handle()
                .channel_open_direct_tcpip(config.host.clone(), u32::from(config.port), "127.0.0.1", 0)
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    bastion.close().await;
                    return Err(Error::Forward {
                        target: config.addr(),
                        reason: e.to_string(),
                    });
                }
            };
            tracing::debug!("forwarding to {} through {}", config.addr(), jump.addr());

            Ok((Box::new(channel.into_stream()), Some(bastion)))
        }
    }
}
