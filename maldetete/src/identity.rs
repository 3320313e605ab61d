//! Loading and generating the private keys the server and client present.
use std::fmt;

use log::debug;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};

use crate::{Error, IdentitySource};

/// A private key and where it came from.
pub struct Identity {
    pub key: PrivateKey,
    pub source: IdentitySource,
}

impl Identity {
    /// Read the key named by `source`, or generate one of `algorithm`.
    pub fn load(source: &IdentitySource, algorithm: Algorithm) -> Result<Identity, Error> {
        let key = match source {
            IdentitySource::Generate => {
                debug!("generating a {} key", algorithm);
                PrivateKey::random(&mut OsRng, algorithm)?
            }
            IdentitySource::File(path) => {
                debug!("loading private key from {}", path.display());
                russh::keys::load_secret_key(path, None).map_err(|source| {
                    Error::LoadIdentity {
                        path: path.clone(),
                        source,
                    }
                })?
            }
        };
        Ok(Identity {
            key,
            source: source.clone(),
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            IdentitySource::Generate => {
                write!(f, "a {} key that was newly generated", self.key.algorithm())
            }
            IdentitySource::File(ref path) => write!(
                f,
                "a {} key from the file path: {}",
                self.key.algorithm(),
                path.display()
            ),
        }
    }
}
