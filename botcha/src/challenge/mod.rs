//! Time-boxed computational challenges.
//!
//! Two kinds are offered:
//!
//! - **Speed**: five six-digit numbers, each answered with the first 8 hex
//!   characters of its SHA-256. Trivial for code, impossible for a human in
//!   the 500ms window.
//! - **Standard**: generate the first N primes, concatenate them with a salt,
//!   hash. Difficulty trades N against the time limit.
//!
//! Every challenge is single-use: the first verification attempt consumes it,
//! whatever the verdict.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use botcha::{
//!     challenge::{ChallengeEngine, solve_speed},
//!     store::MemoryStore,
//! };
//!
//! # async fn example() -> botcha::error::Result<()> {
//! let engine = ChallengeEngine::new(Arc::new(MemoryStore::new()));
//!
//! let challenge = engine.issue_speed().await?;
//! let answers = solve_speed(&challenge.problems);
//! let solved = engine.verify_speed(&challenge.id, &answers).await?;
//! assert!(solved.solve_time_ms < 500);
//! # Ok(())
//! # }
//! ```

mod engine;
mod solver;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use engine::{
    CHALLENGE_TTL, ChallengeEngine, ChallengeSolved, NETWORK_GRACE_MS, SPEED_PROBLEM_COUNT,
    SPEED_TIME_LIMIT_MS, SpeedChallenge, StandardChallenge,
};
pub use solver::{generate_primes, sha256_hex, solve_speed, solve_standard, speed_answer};

use crate::error::BotchaError;

/// Which puzzle a stored challenge holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    /// Five hash lookups in 500ms.
    Speed,
    /// Prime generation plus hashing.
    Standard,
}

/// Standard challenge difficulty tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// 100 primes in 10s.
    Easy,
    /// 500 primes in 5s.
    #[default]
    Medium,
    /// 1000 primes in 3s.
    Hard,
}

impl Difficulty {
    /// Number of primes the solver must generate.
    #[must_use]
    pub const fn prime_count(self) -> usize {
        match self {
            Self::Easy => 100,
            Self::Medium => 500,
            Self::Hard => 1000,
        }
    }

    /// Advertised time limit in milliseconds.
    #[must_use]
    pub const fn time_limit_ms(self) -> u64 {
        match self {
            Self::Easy => 10_000,
            Self::Medium => 5_000,
            Self::Hard => 3_000,
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        })
    }
}

impl FromStr for Difficulty {
    type Err = BotchaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(BotchaError::InvalidInput(format!("unknown difficulty: {other}"))),
        }
    }
}
