//! Order-finding factorization for small moduli.
//!
//! The search follows the classical skeleton of Shor's algorithm: pick a
//! random base, find its multiplicative order `r` modulo `n`, and split
//! `n` with `gcd(a^(r/2) ± 1, n)`. The order is estimated the way the
//! quantum period register would report it, from a handful of peak
//! measurements expanded into continued fractions, so the outcome is
//! probabilistic and bounded by the number of attempts.
use log::trace;
use num_bigint::BigUint;
use num_integer::Integer;
use rand::Rng;

use crate::Error;

/// Moduli wider than this are never attempted: the period register of a
/// `b`-bit modulus has `2^(2b)` states and must fit in 64 bits.
pub const MAX_SUPPORTED_MODULUS_BITS: u64 = 32;

/// Bounds on the work [`factor`] is allowed to do.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorizationConfig {
    /// Number of independent random bases tried before giving up.
    pub max_attempts: usize,
    /// Relative widening of the window in which a continued fraction
    /// convergent is accepted as the phase of a measured peak.
    pub tolerance: f64,
    /// Number of peak measurements combined into one period estimate.
    pub period_samples: usize,
    /// Moduli with more bits than this are refused outright. Order
    /// finding walks the powers of the base, so latency grows with `n`.
    pub max_modulus_bits: u64,
}

impl Default for FactorizationConfig {
    fn default() -> Self {
        FactorizationConfig {
            max_attempts: 20,
            tolerance: 0.01,
            period_samples: 2,
            max_modulus_bits: 8,
        }
    }
}

impl FactorizationConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.tolerance > 0.0 && self.tolerance < 1.0) {
            return Err(Error::InvalidTolerance(self.tolerance));
        }
        if self.period_samples == 0 {
            return Err(Error::NoPeriodSamples);
        }
        if self.max_attempts == 0 {
            return Err(Error::NoAttempts);
        }
        if self.max_modulus_bits > MAX_SUPPORTED_MODULUS_BITS {
            return Err(Error::GateTooWide {
                bits: self.max_modulus_bits,
                max: MAX_SUPPORTED_MODULUS_BITS,
            });
        }
        Ok(())
    }

    fn gate(&self) -> u64 {
        self.max_modulus_bits.min(MAX_SUPPORTED_MODULUS_BITS)
    }
}

/// Try to split `n` into two non-trivial factors, using the thread RNG.
///
/// Returns `None` when `n` is outside the configured gate, has no
/// non-trivial split, or every attempt was unlucky.
pub fn factor(n: &BigUint, config: &FactorizationConfig) -> Option<(BigUint, BigUint)> {
    factor_with_rng(n, config, &mut rand::thread_rng())
}

/// Same as [`factor`], drawing bases and measurements from `rng`. Runs are
/// deterministic for a seeded generator.
pub fn factor_with_rng<R: Rng + ?Sized>(
    n: &BigUint,
    config: &FactorizationConfig,
    rng: &mut R,
) -> Option<(BigUint, BigUint)> {
    if n.bits() > config.gate() {
        trace!("modulus of {} bits is outside the gate", n.bits());
        return None;
    }
    let n = u64::try_from(n).ok()?;
    let (p, q) = split(n, config, rng)?;
    debug_assert_eq!(u128::from(p) * u128::from(q), u128::from(n));
    Some((BigUint::from(p), BigUint::from(q)))
}

fn split<R: Rng + ?Sized>(n: u64, config: &FactorizationConfig, rng: &mut R) -> Option<(u64, u64)> {
    if n < 4 {
        return None;
    }
    if n.is_even() {
        return Some((2, n / 2));
    }
    for attempt in 0..config.max_attempts {
        let base = rng.gen_range(2..n - 1);
        let common = base.gcd(&n);
        if common > 1 {
            trace!("attempt {}: base {} shares factor {}", attempt, base, common);
            return Some((common, n / common));
        }
        let Some(period) = estimate_period(base, n, config, rng) else {
            trace!("attempt {}: no period estimate for base {}", attempt, base);
            continue;
        };
        if period.is_odd() {
            trace!("attempt {}: odd period {} for base {}", attempt, period, base);
            continue;
        }
        let half = pow_mod(base, period / 2, n);
        if half == n - 1 {
            trace!("attempt {}: trivial square root for base {}", attempt, base);
            continue;
        }
        for candidate in [(half + n - 1) % n, (half + 1) % n] {
            let factor = candidate.gcd(&n);
            if factor > 1 && factor < n {
                return Some((factor, n / factor));
            }
        }
    }
    None
}

/// Estimate the order of `base` modulo `n` from `period_samples` simulated
/// measurements of the period register.
fn estimate_period<R: Rng + ?Sized>(
    base: u64,
    n: u64,
    config: &FactorizationConfig,
    rng: &mut R,
) -> Option<u64> {
    let order = multiplicative_order(base, n)?;
    let register = 1u128 << (2 * bit_length(n));
    let mut estimate = 1u64;
    for _ in 0..config.period_samples {
        // Peaks sit at the multiples of register / order.
        let k = u128::from(rng.gen_range(0..order));
        let order = u128::from(order);
        let measured = (k * register + order / 2) / order;
        if let Some(denominator) = phase_denominator(measured, register, n, config.tolerance) {
            estimate = estimate.lcm(&denominator);
        }
    }
    (estimate > 1 && pow_mod(base, estimate, n) == 1).then_some(estimate)
}

/// Walk the powers of `base` until they cycle back to one.
fn multiplicative_order(base: u64, n: u64) -> Option<u64> {
    let mut value = base % n;
    let mut order = 1;
    while value != 1 {
        if value == 0 || order >= n {
            return None;
        }
        value = mul_mod(value, base, n);
        order += 1;
    }
    Some(order)
}

/// Expand `measured / register` into continued fractions and return the
/// denominator of the first convergent `h/s` (with `s < n`) that lies
/// within `(1 + tolerance) / (2 * register)` of the measured phase.
fn phase_denominator(measured: u128, register: u128, n: u64, tolerance: f64) -> Option<u64> {
    let limit = u128::from(n);
    let (mut num, mut den) = (measured, register);
    let (mut h_prev, mut h) = (0u128, 1u128);
    let (mut s_prev, mut s) = (1u128, 0u128);
    while den != 0 {
        let a = num / den;
        (h_prev, h) = (h, a * h + h_prev);
        (s_prev, s) = (s, a * s + s_prev);
        if s >= limit {
            return None;
        }
        let distance = (measured * s).abs_diff(h * register);
        if (2 * distance) as f64 <= (1.0 + tolerance) * s as f64 {
            return u64::try_from(s).ok();
        }
        (num, den) = (den, num - a * den);
    }
    None
}

fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

fn mul_mod(a: u64, b: u64, n: u64) -> u64 {
    (u128::from(a) * u128::from(b) % u128::from(n)) as u64
}

fn pow_mod(base: u64, mut exponent: u64, n: u64) -> u64 {
    let mut result = 1 % n;
    let mut base = base % n;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = mul_mod(result, base, n);
        }
        base = mul_mod(base, base, n);
        exponent >>= 1;
    }
    result
}
