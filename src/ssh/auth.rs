// ABOUTME: Authentication method resolution from session configuration.
// ABOUTME: Ordered credential sources; a source that fails to decode is logged and skipped.

use super::client::{SessionConfig, SshHandler};
use super::error::{Error, Result};
use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, load_secret_key, ssh_key};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;

/// Authentication method resolved from config.
pub enum AuthMethod {
    Password(String),
    Key(Arc<ssh_key::PrivateKey>),
    Agent(AgentClient<UnixStream>),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::Key(_) => "publickey",
            AuthMethod::Agent(_) => "agent",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A place credentials may come from.
///
/// `Ok(None)` means the source is not configured. `Err` means it is configured but unusable;
/// the resolver logs it and moves on.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn describe(&self) -> String;

    async fn produce(&self) -> Result<Option<AuthMethod>>;
}

pub struct PasswordSource(pub Option<String>);

#[async_trait]
impl CredentialSource for PasswordSource {
    fn describe(&self) -> String {
        "password".to_string()
    }

    async fn produce(&self) -> Result<Option<AuthMethod>> {
        Ok(self
            .0
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| AuthMethod::Password(p.clone())))
    }
}

pub struct KeyFileSource {
    pub path: Option<PathBuf>,
    pub passphrase: Option<String>,
}

#[async_trait]
impl CredentialSource for KeyFileSource {
    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("key file {}", path.display()),
            None => "key file".to_string(),
        }
    }

    async fn produce(&self) -> Result<Option<AuthMethod>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let key = load_secret_key(path, self.passphrase.as_deref()).map_err(|e| {
            Error::KeyLoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(AuthMethod::Key(Arc::new(key))))
    }
}

pub struct InlineKeySource {
    pub pem: Option<String>,
    pub passphrase: Option<String>,
}

#[async_trait]
impl CredentialSource for InlineKeySource {
    fn describe(&self) -> String {
        "inline key".to_string()
    }

    async fn produce(&self) -> Result<Option<AuthMethod>> {
        let Some(pem) = self.pem.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let key = decode_secret_key(pem, self.passphrase.as_deref())?;
        Ok(Some(AuthMethod::Key(Arc::new(key))))
    }
}

/// Agent listening on the socket advertised by `SSH_AUTH_SOCK`.
pub struct AgentSource;

#[async_trait]
impl CredentialSource for AgentSource {
    fn describe(&self) -> String {
        "ssh-agent".to_string()
    }

    async fn produce(&self) -> Result<Option<AuthMethod>> {
        if std::env::var_os("SSH_AUTH_SOCK").is_none() {
            return Ok(None);
        }
        let agent = AgentClient::connect_env()
            .await
            .map_err(|e| Error::AgentUnavailable(e.to_string()))?;
        Ok(Some(AuthMethod::Agent(agent)))
    }
}

/// Credential sources for a config, highest priority first.
pub fn sources(config: &SessionConfig) -> Vec<Box<dyn CredentialSource>> {
    vec![
        Box::new(PasswordSource(config.password.clone())),
        Box::new(KeyFileSource {
            path: config.key_path.clone(),
            passphrase: config.passphrase.clone(),
        }),
        Box::new(InlineKeySource {
            pem: config.key.clone(),
            passphrase: config.passphrase.clone(),
        }),
        Box::new(AgentSource),
    ]
}

/// Run every source in order, keeping whatever produced a method.
pub async fn resolve(sources: &[Box<dyn CredentialSource>]) -> Vec<AuthMethod> {
    let mut methods = Vec::new();
    for source in sources {
        match source.produce().await {
            Ok(Some(method)) => {
                tracing::debug!("using {} for authentication", source.describe());
                methods.push(method);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("skipping {}: {}", source.describe(), e),
        }
    }
    methods
}

/// Try each method in order until the server accepts one.
pub(crate) async fn authenticate(
    session: &mut Handle<SshHandler>,
    user: &str,
    methods: Vec<AuthMethod>,
) -> Result<()> {
    if methods.is_empty() {
        tracing::warn!("no credentials configured for {}", user);
    }

    for method in methods {
        let accepted = match method {
            AuthMethod::Password(password) => session
                .authenticate_password(user, password)
                .await
                .map_err(Error::Protocol)?
                .success(),
            AuthMethod::Key(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(Error::Protocol)?
                    .flatten();

                session
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await
                    .map_err(Error::Protocol)?
                    .success()
            }
            AuthMethod::Agent(mut agent) => {
                let keys = match agent.request_identities().await {
                    Ok(keys) => keys,
                    Err(e) => {
                        tracing::warn!("failed to list agent keys: {}", e);
                        continue;
                    }
                };

                let mut accepted = false;
                for key in &keys {
                    match session
                        .authenticate_publickey_with(user, key.clone(), None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => {
                            accepted = true;
                            break;
                        }
                        _ => continue,
                    }
                }
                accepted
            }
        };

        if accepted {
            return Ok(());
        }
    }

    Err(Error::AuthenticationFailed)
}
