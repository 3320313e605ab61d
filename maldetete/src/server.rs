//! The accepting side.
//!
//! ```no_run
//! # async fn serve() -> Result<(), maldetete::Error> {
//! let config = maldetete::ServerConfig {
//!     port: 2200,
//!     ..Default::default()
//! };
//! maldetete::server::run(config).await
//! # }
//! ```
//!
//! Every connection gets its own task. A connection that has not opened
//! a session channel within [`ServerConfig::channel_open_timeout`] is
//! disconnected. Authentication is delegated to an [`AuthPolicy`], and
//! each shell request spawns a [`crate::shell::ShellProcess`] relayed
//! over the channel by [`crate::relay`].
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::keys::{Algorithm, HashAlg, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Pty};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;

use crate::auth::{AuthPolicy, AuthVerdict, HarvestingPolicy};
use crate::identity::Identity;
use crate::shell::{self, ShellCommand};
use crate::{Error, ServerConfig};

/// Listen and serve with the default policy until the listener fails.
pub async fn run(config: ServerConfig) -> Result<(), Error> {
    Acceptor::bind(config).await?.serve().await
}

/// A bound listening socket, ready to accept connections.
pub struct Acceptor<P: AuthPolicy = HarvestingPolicy> {
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    config: Arc<ServerConfig>,
    policy: Arc<P>,
}

impl Acceptor<HarvestingPolicy> {
    pub async fn bind(config: ServerConfig) -> Result<Self, Error> {
        config.factorization.validate()?;
        let policy = HarvestingPolicy::new(config.factorization.clone());
        Acceptor::with_policy(config, policy).await
    }
}

impl<P: AuthPolicy> Acceptor<P> {
    /// Load the host key and bind the listening socket. Both failures are
    /// fatal.
    pub async fn with_policy(config: ServerConfig, policy: P) -> Result<Self, Error> {
        let identity = Identity::load(&config.identity, Algorithm::Ed25519)?;
        let listener = listen(config.socket_addr(), config.backlog)?;
        info!(
            "Serving the server on port {} using {}",
            listener.local_addr()?.port(),
            identity
        );
        let ssh_config = russh::server::Config {
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            inactivity_timeout: config.inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![identity.key],
            ..Default::default()
        };
        Ok(Acceptor {
            listener,
            ssh_config: Arc::new(ssh_config),
            config: Arc::new(config),
            policy: Arc::new(policy),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task each.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            info!("Client connected from {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("{}: could not set TCP_NODELAY: {}", peer, e);
            }
            tokio::spawn(supervise(
                self.ssh_config.clone(),
                self.config.clone(),
                self.policy.clone(),
                stream,
                peer,
            ));
        }
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener, Error> {
    let bind = || -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    };
    bind().map_err(|source| Error::Bind { addr, source })
}

/// Run one connection, dropping it if no channel is opened in time.
async fn supervise<P: AuthPolicy>(
    ssh_config: Arc<russh::server::Config>,
    config: Arc<ServerConfig>,
    policy: Arc<P>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (opened_tx, opened_rx) = oneshot::channel();
    let handler = ConnectionHandler::new(
        peer,
        policy,
        config.shell.clone(),
        config.banner,
        opened_tx,
    );
    let session = match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!("{}: handshake failed: {}", peer, e);
            return;
        }
    };
    let handle = session.handle();
    tokio::pin!(session);

    tokio::select! {
        result = &mut session => {
            session_ended(peer, result);
            return;
        }
        opened = tokio::time::timeout(config.channel_open_timeout, opened_rx) => match opened {
            Ok(Ok(id)) => debug!("{}: channel {} opened", peer, id),
            Ok(Err(_)) => debug!("{}: handler gone before a channel was opened", peer),
            Err(_) => {
                info!(
                    "{}: no channel opened within {:?}, dropping the connection",
                    peer, config.channel_open_timeout
                );
                if let Err(e) = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "no channel opened".into(),
                        "en".into(),
                    )
                    .await
                {
                    debug!("{}: disconnect failed: {:?}", peer, e);
                }
                return;
            }
        },
    }
    session_ended(peer, session.await);
}

fn session_ended(peer: SocketAddr, result: Result<(), Error>) {
    match result {
        Ok(()) => info!("{}: connection closed", peer),
        Err(e) => warn!("{}: connection ended: {}", peer, e),
    }
}

/// Per connection state, driven by russh.
pub struct ConnectionHandler<P: AuthPolicy> {
    peer: SocketAddr,
    policy: Arc<P>,
    shell: ShellCommand,
    banner: Option<&'static str>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    opened: Option<oneshot::Sender<ChannelId>>,
    /// Keys already passed to the policy. A client first offers a key,
    /// then signs with it; the policy sees it once.
    seen: HashSet<String>,
}

impl<P: AuthPolicy> ConnectionHandler<P> {
    pub fn new(
        peer: SocketAddr,
        policy: Arc<P>,
        shell: ShellCommand,
        banner: Option<&'static str>,
        opened: oneshot::Sender<ChannelId>,
    ) -> Self {
        ConnectionHandler {
            peer,
            policy,
            shell,
            banner,
            channels: HashMap::new(),
            opened: Some(opened),
            seen: HashSet::new(),
        }
    }

    fn check_publickey(&mut self, user: &str, key: &PublicKey) -> Auth {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        if self.seen.contains(&fingerprint) {
            debug!("{}: {} presents {} again", self.peer, user, fingerprint);
            return Auth::Accept;
        }
        info!("{}: {} offers {} key {}", self.peer, user, key.algorithm(), fingerprint);
        let verdict = self.policy.check_publickey(user, key);
        if verdict == AuthVerdict::Granted {
            self.seen.insert(fingerprint);
        }
        reply(verdict)
    }
}

fn reply(verdict: AuthVerdict) -> Auth {
    match verdict {
        AuthVerdict::Granted => Auth::Accept,
        AuthVerdict::Denied => Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        },
        AuthVerdict::MethodUnsupported => Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        },
    }
}

impl<P: AuthPolicy> russh::server::Handler for ConnectionHandler<P> {
    type Error = Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.banner.map(String::from))
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(reply(self.policy.check_method(user, MethodKind::None)))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!("{}: {} tries a password", self.peer, user);
        Ok(reply(self.policy.check_method(user, MethodKind::Password)))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check_publickey(user, public_key))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check_publickey(user, public_key))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        debug!("{}: session channel {} opened", self.peer, id);
        self.channels.insert(id, channel);
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(id);
        }
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "{}: pty on {}: term={}, {}x{}",
            self.peer, channel, term, col_width, row_height
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(open) = self.channels.remove(&channel) else {
            warn!("{}: shell requested on unknown channel {}", self.peer, channel);
            session.channel_failure(channel)?;
            return Ok(());
        };
        match self.shell.spawn() {
            Ok(process) => {
                info!(
                    "{}: started {} (pid {:?}) on channel {}",
                    self.peer,
                    self.shell.program.display(),
                    process.id(),
                    channel
                );
                session.channel_success(channel)?;
                tokio::spawn(shell::bridge(open, process));
            }
            Err(e) => {
                warn!(
                    "{}: could not start {}: {}",
                    self.peer,
                    self.shell.program.display(),
                    e
                );
                session.channel_failure(channel)?;
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("{}: channel {} closed", self.peer, channel);
        self.channels.remove(&channel);
        Ok(())
    }
}
