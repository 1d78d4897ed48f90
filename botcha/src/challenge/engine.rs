//! Challenge issuance and single-use verification.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ChallengeKind, Difficulty, solver};
use crate::{
    clock::now_millis,
    error::{BotchaError, Result},
    reliability::fail_open_or_default,
    security::audit::{AuditEvent, AuditEventType, audit_log},
    store::{KvStore, get_json, put_json},
};

/// Problems per speed challenge.
pub const SPEED_PROBLEM_COUNT: usize = 5;

/// Advertised speed challenge time limit.
pub const SPEED_TIME_LIMIT_MS: u64 = 500;

/// Allowance for network latency on top of every time limit.
pub const NETWORK_GRACE_MS: u64 = 100;

/// How long an unanswered challenge stays in the store.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(300);

const SPEED_RANGE: std::ops::Range<u64> = 100_000..1_100_000;

/// A freshly issued speed challenge.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedChallenge {
    /// Challenge id, passed back on verification.
    pub id: String,
    /// The numbers to hash, in answer order.
    pub problems: Vec<u64>,
    /// Time limit in milliseconds.
    pub time_limit_ms: u64,
    /// Human-readable instructions.
    pub instructions: String,
    /// Issuance time, epoch milliseconds.
    pub issued_at: u64,
}

/// A freshly issued standard challenge.
#[derive(Debug, Clone, Serialize)]
pub struct StandardChallenge {
    /// Challenge id, passed back on verification.
    pub id: String,
    /// Puzzle text.
    pub puzzle: String,
    /// Solving hint.
    pub hint: String,
    /// Difficulty tier.
    pub difficulty: Difficulty,
    /// Number of primes to generate.
    pub prime_count: usize,
    /// Salt appended to the concatenated primes.
    pub salt: String,
    /// Time limit in milliseconds.
    pub time_limit_ms: u64,
    /// Issuance time, epoch milliseconds.
    pub issued_at: u64,
}

/// Successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChallengeSolved {
    /// Milliseconds between issuance and verification.
    pub solve_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChallengeRecord {
    kind: ChallengeKind,
    created_at: u64,
    time_limit_ms: u64,
    expected: Vec<String>,
}

fn challenge_key(id: &str) -> String {
    format!("challenge:{id}")
}

fn random_problems() -> Vec<u64> {
    let mut rng = rand::thread_rng();
    (0..SPEED_PROBLEM_COUNT).map(|_| rng.gen_range(SPEED_RANGE)).collect()
}

fn random_salt() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

fn normalize(answer: &str) -> String {
    answer.trim().to_ascii_lowercase()
}

/// Issues and verifies challenges against a shared store.
#[derive(Debug)]
pub struct ChallengeEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for ChallengeEngine<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: KvStore> ChallengeEngine<S> {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Issues a speed challenge: five random integers in `[100000, 1100000)`.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::StorageUnavailable`] if the challenge cannot be stored.
    #[instrument(skip(self))]
    pub async fn issue_speed(&self) -> Result<SpeedChallenge> {
        let id = Uuid::new_v4().to_string();
        let problems = random_problems();
        let created_at = now_millis();

        let record = ChallengeRecord {
            kind: ChallengeKind::Speed,
            created_at,
            time_limit_ms: SPEED_TIME_LIMIT_MS,
            expected: solver::solve_speed(&problems),
        };
        put_json(self.store.as_ref(), &challenge_key(&id), &record, Some(CHALLENGE_TTL)).await?;

        debug!(challenge_id = %id, "speed challenge issued");
        audit_log(
            &AuditEvent::new(AuditEventType::ChallengeIssued, "anonymous", Uuid::new_v4())
                .with_challenge_id(&id),
        );

        Ok(SpeedChallenge {
            id,
            problems,
            time_limit_ms: SPEED_TIME_LIMIT_MS,
            instructions: format!(
                "Compute SHA-256 of each number's decimal string and return the first 8 hex \
                 characters of each, in order. You have {SPEED_TIME_LIMIT_MS}ms."
            ),
            issued_at: created_at,
        })
    }

    /// Verifies a speed challenge. The challenge is consumed regardless of outcome.
    ///
    /// # Errors
    ///
    /// - [`BotchaError::ChallengeNotFound`]: unknown, expired, or already used
    /// - [`BotchaError::InvalidAnswerFormat`]: not exactly five answers
    /// - [`BotchaError::ChallengeTooSlow`]: past the limit plus grace
    /// - [`BotchaError::WrongAnswer`]: any mismatch
    /// - [`BotchaError::StorageUnavailable`]: the lookup itself failed
    #[instrument(skip(self, answers))]
    pub async fn verify_speed(&self, id: &str, answers: &[String]) -> Result<ChallengeSolved> {
        self.verify_at(id, ChallengeKind::Speed, answers, now_millis()).await
    }

    /// Issues a standard (prime) challenge at `difficulty`.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::StorageUnavailable`] if the challenge cannot be stored.
    #[instrument(skip(self))]
    pub async fn issue_standard(&self, difficulty: Difficulty) -> Result<StandardChallenge> {
        let id = Uuid::new_v4().to_string();
        let salt = random_salt();
        let prime_count = difficulty.prime_count();
        let time_limit_ms = difficulty.time_limit_ms();
        let created_at = now_millis();

        let record = ChallengeRecord {
            kind: ChallengeKind::Standard,
            created_at,
            time_limit_ms,
            expected: vec![solver::solve_standard(prime_count, &salt)],
        };
        put_json(self.store.as_ref(), &challenge_key(&id), &record, Some(CHALLENGE_TTL)).await?;

        debug!(challenge_id = %id, %difficulty, "standard challenge issued");
        audit_log(
            &AuditEvent::new(AuditEventType::ChallengeIssued, "anonymous", Uuid::new_v4())
                .with_challenge_id(&id),
        );

        Ok(StandardChallenge {
            puzzle: format!(
                "Compute the first {prime_count} prime numbers. Concatenate them in ascending \
                 order with no separator, append the salt \"{salt}\", and return the first 16 \
                 hex characters of the SHA-256 digest."
            ),
            hint: "2 is the first prime; the first five primes concatenate to \"235711\"."
                .to_owned(),
            id,
            difficulty,
            prime_count,
            salt,
            time_limit_ms,
            issued_at: created_at,
        })
    }

    /// Verifies a standard challenge answer. Consumed regardless of outcome.
    ///
    /// # Errors
    ///
    /// Same as [`verify_speed`](Self::verify_speed), with a single expected answer.
    #[instrument(skip(self, answer))]
    pub async fn verify_standard(&self, id: &str, answer: &str) -> Result<ChallengeSolved> {
        self.verify_at(id, ChallengeKind::Standard, &[answer.to_owned()], now_millis()).await
    }

    pub(crate) async fn verify_at(
        &self,
        id: &str,
        kind: ChallengeKind,
        answers: &[String],
        now: u64,
    ) -> Result<ChallengeSolved> {
        let outcome = self.check(id, kind, answers, now).await;

        let event_type = if outcome.is_ok() {
            AuditEventType::ChallengeSolved
        } else {
            AuditEventType::ChallengeFailed
        };
        let mut event =
            AuditEvent::new(event_type, "anonymous", Uuid::new_v4()).with_challenge_id(id);
        match &outcome {
            Ok(solved) => {
                info!(challenge_id = %id, solve_time_ms = solved.solve_time_ms, "challenge solved");
                event = event.with_duration(Duration::from_millis(solved.solve_time_ms));
            }
            Err(e) => {
                warn!(challenge_id = %id, reason = e.kind(), "challenge verification failed");
                event = event.with_error(e.to_string());
            }
        }
        audit_log(&event);

        outcome
    }

    async fn check(
        &self,
        id: &str,
        kind: ChallengeKind,
        answers: &[String],
        now: u64,
    ) -> Result<ChallengeSolved> {
        let key = challenge_key(id);
        let record: ChallengeRecord =
            get_json(self.store.as_ref(), &key).await?.ok_or(BotchaError::ChallengeNotFound)?;

        fail_open_or_default("challenge.consume", self.store.delete(&key)).await?;

        // an id minted for the other kind is as good as unknown
        if record.kind != kind {
            return Err(BotchaError::ChallengeNotFound);
        }

        if answers.len() != record.expected.len() {
            return Err(BotchaError::InvalidAnswerFormat(format!(
                "expected {} answers, got {}",
                record.expected.len(),
                answers.len()
            )));
        }

        let elapsed_ms = now.saturating_sub(record.created_at);
        if elapsed_ms > record.time_limit_ms + NETWORK_GRACE_MS {
            let limit_ms = record.time_limit_ms;
            return Err(BotchaError::ChallengeTooSlow { elapsed_ms, limit_ms });
        }

        let all_match =
            answers.iter().zip(&record.expected).all(|(given, want)| normalize(given) == *want);
        if !all_match {
            return Err(BotchaError::WrongAnswer);
        }

        Ok(ChallengeSolved { solve_time_ms: elapsed_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{challenge::solve_speed, store::MemoryStore};

    fn engine() -> (ChallengeEngine<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        (ChallengeEngine::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_issue_speed_shape() {
        let (engine, store) = engine();
        let challenge = engine.issue_speed().await.unwrap();

        assert_eq!(challenge.problems.len(), SPEED_PROBLEM_COUNT);
        assert!(challenge.problems.iter().all(|n| SPEED_RANGE.contains(n)));
        assert_eq!(challenge.time_limit_ms, 500);
        assert!(store.get(&challenge_key(&challenge.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_speed_succeeds_exactly_once() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let answers = solve_speed(&challenge.problems);

        let solved = engine.verify_speed(&challenge.id, &answers).await.unwrap();
        assert!(solved.solve_time_ms <= SPEED_TIME_LIMIT_MS + NETWORK_GRACE_MS);

        let again = engine.verify_speed(&challenge.id, &answers).await;
        assert!(matches!(again, Err(BotchaError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_speed_answers_are_case_and_space_insensitive() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let answers: Vec<String> =
            solve_speed(&challenge.problems)
                .iter()
                .map(|a| format!(" {} ", a.to_uppercase()))
                .collect();

        assert!(engine.verify_speed(&challenge.id, &answers).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (engine, _) = engine();
        let result = engine.verify_speed("nope", &[]).await;
        assert!(matches!(result, Err(BotchaError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_wrong_count_consumes() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let mut answers = solve_speed(&challenge.problems);
        answers.pop();

        let result = engine.verify_speed(&challenge.id, &answers).await;
        assert!(matches!(result, Err(BotchaError::InvalidAnswerFormat(_))));

        let full = solve_speed(&challenge.problems);
        let retry = engine.verify_speed(&challenge.id, &full).await;
        assert!(matches!(retry, Err(BotchaError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_wrong_answer() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let mut answers = solve_speed(&challenge.problems);
        answers[2] = "00000000".to_owned();

        let result = engine.verify_speed(&challenge.id, &answers).await;
        assert!(matches!(result, Err(BotchaError::WrongAnswer)));
    }

    #[tokio::test]
    async fn test_too_slow() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let answers = solve_speed(&challenge.problems);

        let late = challenge.issued_at + SPEED_TIME_LIMIT_MS + NETWORK_GRACE_MS + 1;
        let result = engine.verify_at(&challenge.id, ChallengeKind::Speed, &answers, late).await;
        assert!(matches!(
            result,
            Err(BotchaError::ChallengeTooSlow { elapsed_ms: 601, limit_ms: 500 })
        ));
    }

    #[tokio::test]
    async fn test_grace_window_accepted() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let answers = solve_speed(&challenge.problems);

        let edge = challenge.issued_at + SPEED_TIME_LIMIT_MS + NETWORK_GRACE_MS;
        let solved =
            engine.verify_at(&challenge.id, ChallengeKind::Speed, &answers, edge).await.unwrap();
        assert_eq!(solved.solve_time_ms, 600);
    }

    #[tokio::test]
    async fn test_standard_round() {
        let (engine, _) = engine();
        let challenge = engine.issue_standard(Difficulty::Easy).await.unwrap();
        assert_eq!(challenge.prime_count, 100);
        assert!(challenge.puzzle.contains(&challenge.salt));

        let answer = solver::solve_standard(challenge.prime_count, &challenge.salt);
        assert_eq!(answer.len(), 16);
        engine.verify_standard(&challenge.id, &answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_standard_incorrect() {
        let (engine, _) = engine();
        let challenge = engine.issue_standard(Difficulty::Hard).await.unwrap();
        let result = engine.verify_standard(&challenge.id, "0123456789abcdef").await;
        assert!(matches!(result, Err(BotchaError::WrongAnswer)));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_not_found() {
        let (engine, _) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        let result = engine.verify_standard(&challenge.id, "x").await;
        assert!(matches!(result, Err(BotchaError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_storage_down_on_lookup_surfaces() {
        let (engine, store) = engine();
        let challenge = engine.issue_speed().await.unwrap();
        store.set_unavailable(true);

        let result = engine.verify_speed(&challenge.id, &solve_speed(&challenge.problems)).await;
        assert!(matches!(result, Err(BotchaError::StorageUnavailable(_))));
    }
}
