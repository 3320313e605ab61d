#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! An SSH server that lets everybody in.
//!
//! Every public key offered during authentication is accepted. RSA keys
//! are handed, in the background, to the key recovery engine of
//! [`maldetete_keys`], which tries to factor their modulus and logs the
//! private numbers when it succeeds. Authenticated peers get an
//! interactive shell relayed over the session channel.
//!
//! The crate also contains the matching client, which authenticates with
//! a public key and relays the local terminal.
//!
//! * [The server: `maldetete::server`](server)
//! * [The client: `maldetete::client`](client)
//! * [The byte pump shared by both: `maldetete::relay`](relay)

use std::path::PathBuf;

use thiserror::Error;

pub mod auth;
pub mod client;
pub mod config;
pub mod console;
pub mod identity;
pub mod relay;
pub mod server;
pub mod shell;

pub use config::{ClientConfig, IdentitySource, ServerConfig};

#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be set up.
    #[error("Could not listen on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The identity key file could not be read or decoded.
    #[error("Could not load the private key from {}: {source}", path.display())]
    LoadIdentity {
        path: PathBuf,
        source: russh::keys::Error,
    },

    #[error("Could not generate a private key: {0}")]
    GenerateIdentity(#[from] russh::keys::ssh_key::Error),

    /// The server refused every key we offered.
    #[error("Authentication as {0} was rejected")]
    AuthenticationFailed(String),

    #[error("Invalid factorization settings: {0}")]
    Factorization(#[from] maldetete_keys::Error),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
