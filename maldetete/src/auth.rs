//! Authentication decisions.
//!
//! The server consults an [`AuthPolicy`] for every authentication
//! attempt. The only policy shipped is [`HarvestingPolicy`], which grants
//! every public key and hands RSA keys to the key recovery engine without
//! waiting for it.
use std::sync::Arc;

use log::{debug, info, warn};
use maldetete_keys::{FactorizationConfig, PublicKeyParameters, Recoverer, RecoverySink};
use num_bigint::BigUint;
use russh::keys::ssh_key::public::KeyData;
use russh::keys::PublicKey;
use russh::MethodKind;

/// The answer to one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Granted,
    Denied,
    /// The method is not one this policy handles. The client is told to
    /// try public keys instead.
    MethodUnsupported,
}

pub trait AuthPolicy: Send + Sync + 'static {
    /// Decide on a public key offered by `user`. This must return
    /// promptly: it runs on the connection's task.
    fn check_publickey(&self, user: &str, key: &PublicKey) -> AuthVerdict;

    /// Decide on any other method.
    #[allow(unused_variables)]
    fn check_method(&self, user: &str, method: MethodKind) -> AuthVerdict {
        AuthVerdict::MethodUnsupported
    }
}

/// Grants every public key. RSA keys are factored in the background.
#[derive(Debug, Clone)]
pub struct HarvestingPolicy {
    recoverer: Arc<Recoverer>,
}

impl HarvestingPolicy {
    pub fn new(config: FactorizationConfig) -> Self {
        HarvestingPolicy {
            recoverer: Arc::new(Recoverer::new(config)),
        }
    }

    /// Also send every recovery report to `sink`.
    pub fn with_sink(self, sink: Arc<dyn RecoverySink>) -> Self {
        let recoverer = (*self.recoverer).clone().with_sink(sink);
        HarvestingPolicy {
            recoverer: Arc::new(recoverer),
        }
    }

    /// Start recovering `params` off the calling task. Inside a Tokio
    /// runtime the blocking pool is used, otherwise a plain thread.
    pub fn schedule_recovery(&self, params: PublicKeyParameters) {
        let recoverer = self.recoverer.clone();
        let job = move || {
            recoverer.recover(&params);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(job);
            }
            Err(_) => {
                if let Err(e) = std::thread::Builder::new()
                    .name("key-recovery".into())
                    .spawn(job)
                {
                    warn!("could not start key recovery: {}", e);
                }
            }
        }
    }
}

impl AuthPolicy for HarvestingPolicy {
    fn check_publickey(&self, user: &str, key: &PublicKey) -> AuthVerdict {
        match rsa_parameters(key) {
            Some(params) => {
                info!("{} offered an RSA key with {} bit modulus", user, params.modulus.bits());
                self.schedule_recovery(params);
            }
            None => debug!("{} offered a {} key, not factoring it", user, key.algorithm()),
        }
        AuthVerdict::Granted
    }
}

/// The numbers of `key` if it is an RSA key.
pub fn rsa_parameters(key: &PublicKey) -> Option<PublicKeyParameters> {
    let KeyData::Rsa(rsa) = key.key_data() else {
        return None;
    };
    let number = |mpint: &russh::keys::ssh_key::Mpint| {
        BigUint::from_bytes_be(mpint.as_positive_bytes().unwrap_or_default())
    };
    Some(PublicKeyParameters::new(number(&rsa.n), number(&rsa.e)))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use std::time::Duration;

    use maldetete_keys::{RecoveryOutcome, RecoveryReport};
    use russh::keys::ssh_key::public::RsaPublicKey;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Mpint;
    use russh::keys::{Algorithm, PrivateKey};
    use tokio::sync::mpsc;

    use super::*;

    struct ChannelSink(mpsc::UnboundedSender<RecoveryReport>);

    impl RecoverySink for ChannelSink {
        fn report(&self, report: &RecoveryReport) {
            let _ = self.0.send(report.clone());
        }
    }

    fn rsa_key(n: &[u8], e: &[u8]) -> PublicKey {
        let rsa = RsaPublicKey {
            e: Mpint::from_positive_bytes(e).unwrap(),
            n: Mpint::from_positive_bytes(n).unwrap(),
        };
        PublicKey::from(KeyData::Rsa(rsa))
    }

    fn policy() -> (HarvestingPolicy, mpsc::UnboundedReceiver<RecoveryReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy =
            HarvestingPolicy::new(FactorizationConfig::default()).with_sink(Arc::new(ChannelSink(tx)));
        (policy, rx)
    }

    #[test]
    fn extracts_rsa_numbers() {
        let params = rsa_parameters(&rsa_key(&[35], &[5])).unwrap();
        assert_eq!(params.modulus, BigUint::from(35u32));
        assert_eq!(params.exponent, BigUint::from(5u32));

        let ed25519 = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        assert_eq!(rsa_parameters(ed25519.public_key()), None);
    }

    #[tokio::test]
    async fn grants_and_recovers_in_the_background() {
        let _ = env_logger::try_init();
        let (policy, mut reports) = policy();

        assert_eq!(
            policy.check_publickey("alice", &rsa_key(&[35], &[5])),
            AuthVerdict::Granted
        );

        let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .expect("no recovery report")
            .unwrap();
        assert_eq!(report.parameters.modulus, BigUint::from(35u32));
        if let RecoveryOutcome::Recovered(key) = report.outcome {
            assert_eq!(key.d, BigUint::from(5u32));
        }
    }

    #[tokio::test]
    async fn grants_degenerate_keys() {
        let (policy, mut reports) = policy();
        let keys = [
            rsa_key(&[], &[]),
            rsa_key(&[1], &[1]),
            rsa_key(&[4], &[0]),
            rsa_key(&[0xff; 64], &[1, 0, 1]),
        ];
        for key in &keys {
            assert_eq!(policy.check_publickey("mallory", key), AuthVerdict::Granted);
        }
        for _ in &keys {
            let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
                .await
                .expect("no recovery report")
                .unwrap();
            assert_eq!(report.private_key(), None);
        }
    }

    #[test]
    fn grants_without_a_runtime() {
        let (policy, mut reports) = policy();
        assert_eq!(
            policy.check_publickey("bob", &rsa_key(&[35], &[5])),
            AuthVerdict::Granted
        );
        let report = reports.blocking_recv().unwrap();
        assert_eq!(report.parameters.exponent, BigUint::from(5u32));
    }

    #[test]
    fn grants_non_rsa_keys() {
        let (policy, _reports) = policy();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        assert_eq!(
            policy.check_publickey("carol", key.public_key()),
            AuthVerdict::Granted
        );
    }

    #[test]
    fn other_methods_are_unsupported() {
        let (policy, _reports) = policy();
        assert_eq!(
            policy.check_method("dave", MethodKind::Password),
            AuthVerdict::MethodUnsupported
        );
    }
}
