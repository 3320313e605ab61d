use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use maldetete_keys::FactorizationConfig;

use crate::client::Target;
use crate::shell::ShellCommand;

/// Port the server listens on when none is given.
pub const DEFAULT_PORT: u16 = 2222;

/// Port the client connects to when the target names none.
pub const DEFAULT_CLIENT_PORT: u16 = 22;

/// How long an accepted connection may take to open its first channel.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEFAULT_BANNER: &str = "You are now using Team Cryptos very dodgy SSH server.";

/// Where a private key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdentitySource {
    /// A fresh key is generated at startup and never written anywhere.
    #[default]
    Generate,
    /// A PEM or OpenSSH encoded private key file.
    File(PathBuf),
}

impl From<Option<PathBuf>> for IdentitySource {
    fn from(path: Option<PathBuf>) -> Self {
        path.map_or(IdentitySource::Generate, IdentitySource::File)
    }
}

/// Configuration of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: IpAddr,
    pub port: u16,
    /// The server's host key.
    pub identity: IdentitySource,
    /// Shown to clients before authentication. Purely cosmetic.
    pub banner: Option<&'static str>,
    /// Connections that open no channel within this delay are dropped.
    pub channel_open_timeout: Duration,
    /// Time after which an idle connection is closed.
    pub inactivity_timeout: Option<Duration>,
    /// Pending connections queued by the listening socket.
    pub backlog: u32,
    /// The program started for every shell request.
    pub shell: ShellCommand,
    /// Budget of the background key recovery.
    pub factorization: FactorizationConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            identity: IdentitySource::Generate,
            banner: Some(DEFAULT_BANNER),
            channel_open_timeout: CHANNEL_OPEN_TIMEOUT,
            inactivity_timeout: Some(Duration::from_secs(3600)),
            backlog: 5,
            shell: ShellCommand::default(),
            factorization: FactorizationConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }
}

/// Configuration of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: Target,
    /// The key offered to the server.
    pub identity: IdentitySource,
    pub inactivity_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(target: Target) -> Self {
        ClientConfig {
            target,
            identity: IdentitySource::Generate,
            inactivity_timeout: None,
        }
    }
}
