#![deny(trivial_casts, unstable_features, unused_import_braces)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Recovery of RSA private keys from their public numbers.
//!
//! This crate holds the key mathematics used by `maldetete`: a bounded,
//! randomized factorization primitive for toy-sized moduli, and a
//! recovery engine that turns a factorization into a private exponent.
//! Neither ever fails loudly: an unfactorable modulus is the expected
//! outcome for any real key.
//!
//!```
//! use maldetete_keys::{recover, FactorizationConfig, PublicKeyParameters};
//! use num_bigint::BigUint;
//!
//! let public = PublicKeyParameters::new(BigUint::from(35u32), BigUint::from(5u32));
//! let private = recover(&public, &FactorizationConfig::default()).unwrap();
//! assert_eq!(private.p, BigUint::from(7u32));
//! assert_eq!(private.q, BigUint::from(5u32));
//! assert_eq!(private.d, BigUint::from(5u32));
//! ```

use thiserror::Error;

mod factor;
mod recover;

pub use factor::{factor, factor_with_rng, FactorizationConfig, MAX_SUPPORTED_MODULUS_BITS};
pub use recover::{
    demo_key, mod_inverse, recover, recover_with_rng, LogSink, PublicKeyParameters,
    RecoveredPrivateKey, Recoverer, RecoveryOutcome, RecoveryReport, RecoverySink,
};

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// The acceptance window must be a fraction strictly between 0 and 1.
    #[error("Tolerance {0} is outside (0, 1)")]
    InvalidTolerance(f64),
    #[error("At least one period sample is required")]
    NoPeriodSamples,
    #[error("At least one attempt is required")]
    NoAttempts,
    /// The primitive works on machine words; larger gates are refused.
    #[error("Modulus gate of {bits} bits exceeds the supported {max} bits")]
    GateTooWide { bits: u64, max: u64 },
}
