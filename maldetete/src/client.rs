//! The connecting side.
//!
//! The client authenticates with a single private key, opens one
//! session channel with a terminal and a shell, and relays the local
//! terminal to it until the server closes the channel.
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::client::{self, Msg};
use russh::keys::{Algorithm, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use termion::raw::IntoRawMode;

use crate::config::DEFAULT_CLIENT_PORT;
use crate::identity::Identity;
use crate::{console, ClientConfig, Error};

/// Where to connect and as whom, written `user@host:port`.
///
/// The user defaults to the local user name and the port to 22. A port
/// that is not a number is ignored with a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(target: &str) -> Target {
        Target::parse_with_user(target, whoami::username)
    }

    /// Like [`Target::parse`], with `default_user` called when the target
    /// names no user.
    pub fn parse_with_user(target: &str, default_user: impl FnOnce() -> String) -> Target {
        let (user, destination) = match target.split_once('@') {
            Some((user, destination)) if !user.is_empty() => (user.to_string(), destination),
            Some((_, destination)) => (default_user(), destination),
            None => (default_user(), target),
        };
        let (host, port) = split_port(destination);
        let port = match port {
            None => DEFAULT_CLIENT_PORT,
            Some(port) => port.parse().unwrap_or_else(|_| {
                warn!("ignoring invalid port {:?}, using {}", port, DEFAULT_CLIENT_PORT);
                DEFAULT_CLIENT_PORT
            }),
        };
        Target {
            user,
            host: host.to_string(),
            port,
        }
    }
}

/// Split `host:port`, keeping bracketed IPv6 addresses whole.
fn split_port(destination: &str) -> (&str, Option<&str>) {
    if let Some(rest) = destination.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            return (host, after.strip_prefix(':'));
        }
    }
    match destination.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (destination, None),
    }
}

impl FromStr for Target {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target::parse(s))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// Accepts whatever host key the server presents.
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        info!(
            "server presents {} key {}",
            server_public_key.algorithm(),
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// An authenticated connection.
pub struct Connection {
    session: client::Handle<ClientHandler>,
}

impl Connection {
    /// Connect to `config.target` and authenticate with `config.identity`.
    /// A generated identity is an RSA key.
    pub async fn connect(config: &ClientConfig) -> Result<Self, Error> {
        let identity = Identity::load(&config.identity, Algorithm::Rsa { hash: None })?;
        let target = &config.target;
        info!("connecting to {} using {}", target, identity);

        let ssh_config = client::Config {
            inactivity_timeout: config.inactivity_timeout,
            ..Default::default()
        };
        let mut session = client::connect(
            Arc::new(ssh_config),
            (target.host.as_str(), target.port),
            ClientHandler,
        )
        .await?;

        let hash = session.best_supported_rsa_hash().await?.flatten();
        let auth = session
            .authenticate_publickey(
                target.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(identity.key), hash),
            )
            .await?;
        if !auth.success() {
            return Err(Error::AuthenticationFailed(target.user.clone()));
        }
        debug!("authenticated as {}", target.user);
        Ok(Connection { session })
    }

    /// Open a session channel with a terminal of `cols` x `rows` and start
    /// a shell on it.
    pub async fn open_shell(&self, term: &str, cols: u32, rows: u32) -> Result<Channel<Msg>, Error> {
        let mut channel = self.session.channel_open_session().await?;
        channel.request_pty(false, term, cols, rows, 0, 0, &[]).await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    pub async fn close(self) -> Result<(), Error> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// Connect, open a shell and relay the local terminal to it until the
/// server closes the channel.
pub async fn run(config: ClientConfig) -> Result<(), Error> {
    let connection = Connection::connect(&config).await?;
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".into());
    let (cols, rows) = termion::terminal_size().unwrap_or((80, 24));
    let channel = connection
        .open_shell(&term, u32::from(cols), u32::from(rows))
        .await?;

    let outcome = {
        let _raw = match std::io::stdout().into_raw_mode() {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!("not switching to raw mode: {}", e);
                None
            }
        };
        console::run(channel).await
    };
    debug!("relay finished: {:?}", outcome);
    connection.close().await?;
    outcome.map(|_| ())
}
