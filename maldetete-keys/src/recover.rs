use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use num_bigint::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;

use crate::factor::{factor_with_rng, FactorizationConfig};

/// The numbers of an RSA public key, as offered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyParameters {
    pub modulus: BigUint,
    pub exponent: BigUint,
}

impl PublicKeyParameters {
    pub fn new(modulus: BigUint, exponent: BigUint) -> Self {
        PublicKeyParameters { modulus, exponent }
    }
}

impl fmt::Display for PublicKeyParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n = {}, e = {}", self.modulus, self.exponent)
    }
}

/// A private key rebuilt from a factorization of the public modulus.
///
/// `p` is always the larger prime. The CRT parameters follow PKCS #1:
/// `dmp1 = d mod (p-1)`, `dmq1 = d mod (q-1)` and `iqmp = q^-1 mod p`.
/// `iqmp` is `None` when `p == q`, since `q` has no inverse modulo itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPrivateKey {
    pub p: BigUint,
    pub q: BigUint,
    pub d: BigUint,
    pub dmp1: BigUint,
    pub dmq1: BigUint,
    pub iqmp: Option<BigUint>,
}

impl RecoveredPrivateKey {
    /// Derive the private numbers from a known factorization. Returns
    /// `None` if the factors do not multiply to the modulus or the
    /// exponent is not invertible modulo the totient. A missing CRT
    /// coefficient does not prevent recovery.
    pub fn from_factors(public: &PublicKeyParameters, p: BigUint, q: BigUint) -> Option<Self> {
        let (p, q) = if p >= q { (p, q) } else { (q, p) };
        if q <= BigUint::one() || &p * &q != public.modulus {
            return None;
        }
        let p1 = &p - 1u32;
        let q1 = &q - 1u32;
        let totient = &p1 * &q1;
        let d = mod_inverse(&public.exponent, &totient)?;
        let iqmp = mod_inverse(&q, &p);
        Some(RecoveredPrivateKey {
            dmp1: &d % &p1,
            dmq1: &d % &q1,
            iqmp,
            p,
            q,
            d,
        })
    }

    pub fn modulus(&self) -> BigUint {
        &self.p * &self.q
    }

    pub fn totient(&self) -> BigUint {
        (&self.p - 1u32) * (&self.q - 1u32)
    }
}

impl fmt::Display for RecoveredPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p = {}, q = {}, d = {}", self.p, self.q, self.d)
    }
}

/// Inverse of `a` modulo `m`, if `gcd(a, m) == 1`.
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    if m.is_zero() {
        return None;
    }
    let a = BigInt::from_biguint(Sign::Plus, a % m);
    let m = BigInt::from_biguint(Sign::Plus, m.clone());
    let egcd = a.extended_gcd(&m);
    if !egcd.gcd.is_one() {
        return None;
    }
    egcd.x.mod_floor(&m).to_biguint()
}

/// What happened to one offered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The modulus is wider than the configured gate.
    TooLarge { bits: u64 },
    /// No attempt split the modulus.
    NotFactored,
    /// The modulus split, but the exponent shares a factor with the totient.
    NoInverse { p: BigUint, q: BigUint },
    Recovered(RecoveredPrivateKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub parameters: PublicKeyParameters,
    pub outcome: RecoveryOutcome,
}

impl RecoveryReport {
    pub fn private_key(&self) -> Option<&RecoveredPrivateKey> {
        match self.outcome {
            RecoveryOutcome::Recovered(ref key) => Some(key),
            _ => None,
        }
    }
}

/// Destination of recovery reports. Reports arrive from many
/// connections at once.
pub trait RecoverySink: Send + Sync {
    fn report(&self, report: &RecoveryReport);
}

/// Writes every report to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl RecoverySink for LogSink {
    fn report(&self, report: &RecoveryReport) {
        let numbers = &report.parameters;
        match report.outcome {
            RecoveryOutcome::TooLarge { bits } => info!(
                "Not factoring a {} bit modulus ({}), that is likely going to take a long time",
                bits, numbers
            ),
            RecoveryOutcome::NotFactored => info!("Failed to factor {}", numbers.modulus),
            RecoveryOutcome::NoInverse { ref p, ref q } => info!(
                "Factored {} as {} * {}, but e = {} has no inverse",
                numbers.modulus, p, q, numbers.exponent
            ),
            RecoveryOutcome::Recovered(ref key) => {
                info!("Found private numbers for {}: {}", numbers, key)
            }
        }
    }
}

/// Recover the private key for `public`, using the thread RNG.
pub fn recover(
    public: &PublicKeyParameters,
    config: &FactorizationConfig,
) -> Option<RecoveredPrivateKey> {
    recover_with_rng(public, config, &mut rand::thread_rng())
}

pub fn recover_with_rng<R: Rng + ?Sized>(
    public: &PublicKeyParameters,
    config: &FactorizationConfig,
    rng: &mut R,
) -> Option<RecoveredPrivateKey> {
    match attempt(public, config, rng) {
        RecoveryOutcome::Recovered(key) => Some(key),
        _ => None,
    }
}

fn attempt<R: Rng + ?Sized>(
    public: &PublicKeyParameters,
    config: &FactorizationConfig,
    rng: &mut R,
) -> RecoveryOutcome {
    let bits = public.modulus.bits();
    if bits > config.max_modulus_bits {
        return RecoveryOutcome::TooLarge { bits };
    }
    debug!("Factoring public key with numbers {}", public);
    let Some((p, q)) = factor_with_rng(&public.modulus, config, rng) else {
        return RecoveryOutcome::NotFactored;
    };
    match RecoveredPrivateKey::from_factors(public, p.clone(), q.clone()) {
        Some(key) => RecoveryOutcome::Recovered(key),
        None => RecoveryOutcome::NoInverse { p, q },
    }
}

/// The recovery engine: a factorization budget and the sinks every
/// outcome is reported to.
#[derive(Clone)]
pub struct Recoverer {
    config: FactorizationConfig,
    sinks: Vec<Arc<dyn RecoverySink>>,
}

impl fmt::Debug for Recoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recoverer")
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Recoverer {
    /// A recoverer reporting to [`LogSink`].
    pub fn new(config: FactorizationConfig) -> Self {
        Recoverer {
            config,
            sinks: vec![Arc::new(LogSink)],
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecoverySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &FactorizationConfig {
        &self.config
    }

    pub fn recover(&self, public: &PublicKeyParameters) -> Option<RecoveredPrivateKey> {
        self.recover_with_rng(public, &mut rand::thread_rng())
    }

    pub fn recover_with_rng<R: Rng + ?Sized>(
        &self,
        public: &PublicKeyParameters,
        rng: &mut R,
    ) -> Option<RecoveredPrivateKey> {
        let report = RecoveryReport {
            parameters: public.clone(),
            outcome: attempt(public, &self.config, rng),
        };
        for sink in &self.sinks {
            sink.report(&report);
        }
        report.private_key().cloned()
    }
}

/// The smallest usable RSA key: `p = 7`, `q = 5`, `n = 35`, `e = 5`.
///
/// `(p-1)(q-1) = 24` and `5 * 5 = 25 ≡ 1 (mod 24)`, so `d = 5`; the CRT
/// parameters are `dmp1 = 5`, `dmq1 = 1` and `iqmp = 3`.
pub fn demo_key() -> (PublicKeyParameters, RecoveredPrivateKey) {
    let public = PublicKeyParameters::new(BigUint::from(35u32), BigUint::from(5u32));
    let private = RecoveredPrivateKey {
        p: BigUint::from(7u32),
        q: BigUint::from(5u32),
        d: BigUint::from(5u32),
        dmp1: BigUint::from(5u32),
        dmq1: BigUint::from(1u32),
        iqmp: Some(BigUint::from(3u32)),
    };
    (public, private)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
    use std::sync::Mutex;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn numbers(n: u32, e: u32) -> PublicKeyParameters {
        PublicKeyParameters::new(BigUint::from(n), BigUint::from(e))
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<RecoveryReport>>);

    impl RecoverySink for Collect {
        fn report(&self, report: &RecoveryReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    #[test]
    fn demo_key_is_recovered() {
        let _ = env_logger::try_init();
        let (public, expected) = demo_key();
        let mut rng = StdRng::seed_from_u64(5);
        let key = recover_with_rng(&public, &FactorizationConfig::default(), &mut rng).unwrap();
        assert_eq!(key, expected);
        assert_eq!(key.totient(), BigUint::from(24u32));
        assert_eq!(key.modulus(), public.modulus);
    }

    #[test]
    fn private_exponent_inverts_public_exponent() {
        let config = FactorizationConfig::default();
        let mut rng = StdRng::seed_from_u64(11);
        for (n, e) in [(35, 5), (55, 3), (77, 7), (143, 7), (221, 5), (247, 5)] {
            let public = numbers(n, e);
            if let Some(key) = recover_with_rng(&public, &config, &mut rng) {
                let totient = key.totient();
                assert_eq!((&public.exponent * &key.d) % &totient, BigUint::one());
                assert_eq!(&key.p * &key.q, public.modulus);
                assert!(key.p >= key.q);
            }
        }
    }

    #[test]
    fn non_invertible_exponent_is_not_an_error() {
        // gcd(3, 24) = 3
        let public = numbers(35, 3);
        let collect = Arc::new(Collect::default());
        let recoverer = Recoverer::new(FactorizationConfig::default()).with_sink(collect.clone());
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(recoverer.recover_with_rng(&public, &mut rng), None);
        let reports = collect.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].outcome,
            RecoveryOutcome::NoInverse { .. } | RecoveryOutcome::NotFactored
        ));
    }

    #[test]
    fn degenerate_numbers_are_silent() {
        let recoverer = Recoverer::new(FactorizationConfig::default());
        for (n, e) in [(0, 0), (1, 1), (2, 65537), (4, 0), (13, 5), (35, 0)] {
            assert_eq!(recoverer.recover(&numbers(n, e)), None);
        }
    }

    #[test]
    fn large_moduli_are_reported_too_large() {
        let collect = Arc::new(Collect::default());
        let recoverer = Recoverer::new(FactorizationConfig::default()).with_sink(collect.clone());
        let public = PublicKeyParameters::new(BigUint::from(u64::MAX), BigUint::from(65537u32));
        assert_eq!(recoverer.recover(&public), None);
        let reports = collect.0.lock().unwrap();
        assert_eq!(reports[0].outcome, RecoveryOutcome::TooLarge { bits: 64 });
    }

    #[test]
    fn crt_parameters() {
        let (public, expected) = demo_key();
        let key =
            RecoveredPrivateKey::from_factors(&public, BigUint::from(5u32), BigUint::from(7u32))
                .unwrap();
        assert_eq!(key, expected);
        assert_eq!(
            RecoveredPrivateKey::from_factors(&public, BigUint::from(3u32), BigUint::from(7u32)),
            None
        );
    }

    #[test]
    fn square_modulus_still_yields_the_exponent() {
        // 49 = 7 * 7, gcd(5, 36) = 1
        let public = numbers(49, 5);
        let key =
            RecoveredPrivateKey::from_factors(&public, BigUint::from(7u32), BigUint::from(7u32))
                .unwrap();
        assert_eq!(key.d, BigUint::from(29u32));
        assert_eq!(key.iqmp, None);
        assert_eq!(key.dmp1, BigUint::from(5u32));

        let collect = Arc::new(Collect::default());
        let recoverer = Recoverer::new(FactorizationConfig::default()).with_sink(collect.clone());
        let mut rng = StdRng::seed_from_u64(1);
        let recovered = recoverer.recover_with_rng(&public, &mut rng);
        let reports = collect.0.lock().unwrap();
        match reports[0].outcome {
            RecoveryOutcome::NotFactored => assert_eq!(recovered, None),
            RecoveryOutcome::Recovered(ref found) => {
                assert_eq!(found, &key);
                assert_eq!(recovered.as_ref(), Some(&key));
            }
            ref other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn modular_inverse() {
        let inv = |a: u32, m: u32| mod_inverse(&BigUint::from(a), &BigUint::from(m));
        assert_eq!(inv(5, 24), Some(BigUint::from(5u32)));
        assert_eq!(inv(3, 11), Some(BigUint::from(4u32)));
        assert_eq!(inv(17, 3120), Some(BigUint::from(2753u32)));
        assert_eq!(inv(6, 9), None);
        assert_eq!(inv(1, 0), None);
        assert_eq!(inv(0, 1), Some(BigUint::zero()));
    }
}
