//! Reference solutions for both challenge kinds.
//!
//! These are what an agent runs client-side; the engine uses the same
//! functions to compute expected answers.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `input`.
///
/// # Examples
///
/// ```
/// use botcha::challenge::sha256_hex;
///
/// assert_eq!(
///     sha256_hex("test"),
///     "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
/// );
/// ```
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Answer for one speed problem: first 8 hex chars of SHA-256 over the
/// decimal rendering of `n`.
#[must_use]
pub fn speed_answer(n: u64) -> String {
    let mut digest = sha256_hex(&n.to_string());
    digest.truncate(8);
    digest
}

/// Solves a whole speed challenge.
///
/// # Examples
///
/// ```
/// use botcha::challenge::solve_speed;
///
/// assert_eq!(solve_speed(&[123_456, 645_234]), ["8d969eef", "20ac4997"]);
/// ```
#[must_use]
pub fn solve_speed(problems: &[u64]) -> Vec<String> {
    problems.iter().copied().map(speed_answer).collect()
}

/// First `count` primes in ascending order, by trial division up to √n.
#[must_use]
pub fn generate_primes(count: usize) -> Vec<u64> {
    let mut primes: Vec<u64> = Vec::with_capacity(count);
    let mut candidate = 2u64;

    while primes.len() < count {
        let is_prime = primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0);
        if is_prime {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

/// Answer for a standard challenge: the first `prime_count` primes
/// concatenated, followed by `salt`, hashed, truncated to 16 hex chars.
#[must_use]
pub fn solve_standard(prime_count: usize, salt: &str) -> String {
    let mut input: String = generate_primes(prime_count).iter().map(u64::to_string).collect();
    input.push_str(salt);

    let mut digest = sha256_hex(&input);
    digest.truncate(16);
    digest
}
