use crate::ClientStream;
use crate::error::ProtocolError;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Payload key under which the password method records the user
pub const USERNAME_KEY: &str = "username";

/// AuthContext records which method authenticated a connection and
/// whatever that method learned about the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub method: u8,
    pub payload: HashMap<String, String>,
}

impl AuthContext {
    /// username returns the authenticated user, if the method had one
    pub fn username(&self) -> Option<&str> {
        self.payload.get(USERNAME_KEY).map(String::as_str)
    }
}

/// Authenticator is one SOCKS5 authentication method. Once selected it
/// owns the stream: it writes the method selection reply and runs its own
/// sub-negotiation
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// code is the METHOD byte this authenticator answers to
    fn code(&self) -> u8;

    async fn authenticate(
        &self,
        stream: &mut dyn ClientStream,
    ) -> Result<AuthContext, ProtocolError>;
}

/// CredentialStore validates a username/password pair
pub trait CredentialStore: Send + Sync {
    fn valid(&self, username: &str, password: &str) -> bool;
}

/// StaticCredentials is an in-memory username -> password map
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    /// single builds a store holding exactly one user
    pub fn single(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(HashMap::from([(username.into(), password.into())]))
    }
}

impl<U: Into<String>, P: Into<String>> FromIterator<(U, P)> for StaticCredentials {
    fn from_iter<I: IntoIterator<Item = (U, P)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        )
    }
}

impl CredentialStore for StaticCredentials {
    fn valid(&self, username: &str, password: &str) -> bool {
        self.0.get(username).is_some_and(|secret| secret == password)
    }
}

/// NoAuthAuthenticator accepts every client without a sub-negotiation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthAuthenticator;

#[async_trait]
impl Authenticator for NoAuthAuthenticator {
    fn code(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn ClientStream,
    ) -> Result<AuthContext, ProtocolError> {
        stream
            .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
            .await?;

        Ok(AuthContext {
            method: AuthMethod::NoAuth as u8,
            payload: HashMap::new(),
        })
    }
}

/// UserPassAuthenticator implements RFC 1929 against a CredentialStore
#[derive(Clone)]
pub struct UserPassAuthenticator {
    pub credentials: Arc<dyn CredentialStore>,
}

impl UserPassAuthenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for UserPassAuthenticator {
    fn code(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn ClientStream,
    ) -> Result<AuthContext, ProtocolError> {
        // Tell the client we picked username/password
        stream
            .write_all(&[Version::SOCKS5 as u8, AuthMethod::UserPass as u8])
            .await?;

        // Client Username/Password Request
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let ver = stream.read_u8().await?;
        if ver != USERPASS_VERSION {
            return Err(ProtocolError::UnsupportedAuthVersion(ver));
        }

        let username_len = stream.read_u8().await?;
        let mut username = vec![0u8; username_len as usize];
        stream.read_exact(&mut username).await?;

        let password_len = stream.read_u8().await?;
        let mut password = vec![0u8; password_len as usize];
        stream.read_exact(&mut password).await?;

        // Non UTF-8 credentials can never match the store
        let username = String::from_utf8(username).ok();
        let password = String::from_utf8(password).ok();

        let status = match (&username, &password) {
            (Some(u), Some(p)) if self.credentials.valid(u, p) => AuthStatus::Success,
            _ => AuthStatus::Failure,
        };

        // Username/Password Server response
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

        match (status, username) {
            (AuthStatus::Success, Some(username)) => Ok(AuthContext {
                method: AuthMethod::UserPass as u8,
                payload: HashMap::from([(USERNAME_KEY.to_string(), username)]),
            }),
            _ => Err(ProtocolError::AuthFailed),
        }
    }
}

/// negotiate reads the client's method list and runs the first offered
/// method that has a registered authenticator.
///
/// The version byte has already been consumed by the caller.
pub async fn negotiate(
    stream: &mut dyn ClientStream,
    methods: &HashMap<u8, Arc<dyn Authenticator>>,
) -> Result<AuthContext, ProtocolError> {
    // ClientHello format (VER already read)
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let n_methods = stream.read_u8().await?;
    let mut offered = vec![0u8; n_methods as usize];
    stream.read_exact(&mut offered).await?;

    debug!("client offered auth methods {:?}", offered);

    // Client preference order wins
    match offered.iter().find_map(|code| methods.get(code)) {
        Some(authenticator) => authenticator.authenticate(stream).await,
        None => {
            stream
                .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
                .await?;
            Err(ProtocolError::NoAcceptableAuth)
        }
    }
}
