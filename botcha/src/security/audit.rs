//! Audit logging for security-relevant events.
//!
//! Every challenge outcome, token decision, signature verdict, and fail-open
//! fallback is emitted as a structured event on the `audit` tracing target,
//! so deployments can route it separately from operational logs.

use std::{
    net::{IpAddr, Ipv4Addr},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// A challenge was generated and stored.
    ChallengeIssued,
    /// A challenge was answered correctly within its time limit.
    ChallengeSolved,
    /// A challenge verification was rejected.
    ChallengeFailed,
    /// An access/refresh token pair was minted.
    TokenIssued,
    /// A refresh token was exchanged for a new access token.
    TokenRefreshed,
    /// A bearer token failed verification.
    TokenRejected,
    /// A token identifier was added to the revocation list.
    TokenRevoked,
    /// A caller exceeded its hourly quota.
    RateLimitExceeded,
    /// An RFC 9421 signature verified successfully.
    SignatureVerified,
    /// An RFC 9421 signature was rejected.
    SignatureRejected,
    /// A TAP agent was registered.
    AgentRegistered,
    /// A capability-scoped session was created.
    SessionCreated,
    /// A session request was refused for lack of capability.
    SessionDenied,
    /// A storage or directory failure was swallowed and a fallback used.
    FailOpen,
}

/// Contextual fields for an audit entry. Unset fields are omitted when serialized.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditDetails {
    /// Calling application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Client address with the host part masked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Challenge identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    /// Token identifier (`jti`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Signature key identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Internal operation name (used for fail-open events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Error message with bearer tokens redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration of the operation in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Audit log entry.
///
/// # Examples
///
/// ```
/// use botcha::security::audit::{AuditEvent, AuditEventType, audit_log};
/// use uuid::Uuid;
///
/// let event = AuditEvent::new(AuditEventType::ChallengeSolved, "anonymous", Uuid::new_v4())
///     .with_challenge_id("6f1c...")
///     .with_client_ip("203.0.113.7");
///
/// audit_log(&event);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: SystemTime,
    /// What happened.
    pub event_type: AuditEventType,
    /// Who it happened to: token subject, agent id, or `anonymous`.
    pub subject: String,
    /// Correlation id.
    pub request_id: Uuid,
    /// Contextual fields.
    pub details: AuditDetails,
}

macro_rules! detail_setter {
    ($(#[$doc:meta])* $name:ident => $field:ident) => {
        $(#[$doc])*
        #[must_use]
        #[allow(
            clippy::impl_trait_in_params,
            reason = "impl Into<String> is idiomatic for builder methods"
        )]
        pub fn $name(mut self, value: impl Into<String>) -> Self {
            self.details.$field = Some(value.into());
            self
        }
    };
}

impl AuditEvent {
    /// Creates an event with empty details.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn new(event_type: AuditEventType, subject: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            subject: subject.into(),
            request_id,
            details: AuditDetails::default(),
        }
    }

    detail_setter!(
        /// Sets the calling application.
        with_app_id => app_id
    );
    detail_setter!(
        /// Sets the challenge id.
        with_challenge_id => challenge_id
    );
    detail_setter!(
        /// Sets the token id.
        with_token_id => token_id
    );
    detail_setter!(
        /// Sets the signature key id.
        with_key_id => key_id
    );
    detail_setter!(
        /// Sets the session id.
        with_session_id => session_id
    );
    detail_setter!(
        /// Sets the internal operation name.
        with_operation => operation
    );

    /// Sets the client address, masking its host part.
    #[must_use]
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.details.client_ip = Some(redact_ip(ip));
        self
    }

    /// Sets the error message, redacting anything that looks like a JWT.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.details.error = Some(redact_sensitive(&error.into()));
        self
    }

    /// Sets the duration.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "duration in ms fits u64 for practical values"
    )]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.details.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Emits the event on the `audit` target.
pub fn audit_log(event: &AuditEvent) {
    tracing::info!(
        target: "audit",
        timestamp = ?event.timestamp,
        event_type = ?event.event_type,
        subject = %event.subject,
        request_id = %event.request_id,
        details = ?event.details,
        "AUDIT"
    );
}

/// Replaces compact JWTs (three dot-separated base64url segments starting with
/// `eyJ`) with a short prefix followed by `[REDACTED]`.
///
/// # Examples
///
/// ```
/// use botcha::security::audit::redact_sensitive;
///
/// let msg = "rejected eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJ4In0.c2ln for caller";
/// let redacted = redact_sensitive(msg);
/// assert_eq!(redacted, "rejected eyJhbGci[REDACTED] for caller");
/// ```
#[must_use]
pub fn redact_sensitive(input: &str) -> String {
    input
        .split(' ')
        .map(|word| {
            if looks_like_jwt(word) {
                let prefix: String = word.chars().take(8).collect();
                format!("{prefix}[REDACTED]")
            } else {
                word.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_jwt(word: &str) -> bool {
    let segments: Vec<&str> = word.split('.').collect();
    segments.len() == 3
        && word.starts_with("eyJ")
        && segments.iter().all(|s| {
            !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Masks the host part of an address: last octet for IPv4, everything after
/// the first three groups for IPv6. IPv4-mapped IPv6 addresses are masked as
/// IPv4. Anything else is passed through.
///
/// # Examples
///
/// ```
/// use botcha::security::audit::redact_ip;
///
/// assert_eq!(redact_ip("203.0.113.7"), "203.0.113.x");
/// assert_eq!(redact_ip("2001:db8:85a3::8a2e:370:7334"), "2001:db8:85a3::x");
/// assert_eq!(redact_ip("::1"), "0:0:0::x");
/// assert_eq!(redact_ip("unknown"), "unknown");
/// ```
#[must_use]
pub fn redact_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => redact_v4(v4),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => redact_v4(v4),
            None => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}::x", s[0], s[1], s[2])
            }
        },
        Err(_) => ip.to_owned(),
    }
}

fn redact_v4(v4: Ipv4Addr) -> String {
    let [a, b, c, _] = v4.octets();
    format!("{a}.{b}.{c}.x")
}

/// Builds and logs an audit event in one expression.
///
/// # Examples
///
/// ```
/// use botcha::{audit, security::audit::AuditEventType};
/// use uuid::Uuid;
///
/// audit!(AuditEventType::TokenIssued, "challenge:abc", Uuid::new_v4());
///
/// audit!(
///     AuditEventType::SessionCreated,
///     "agent_0011223344556677",
///     Uuid::new_v4(),
///     with_app_id("app_demo"),
///     with_session_id("d9c2...")
/// );
/// ```
#[macro_export]
macro_rules! audit {
    ($event_type:expr, $subject:expr, $request_id:expr) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $subject, $request_id)
        )
    };
    ($event_type:expr, $subject:expr, $request_id:expr, $($method:ident($arg:expr)),+ $(,)?) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $subject, $request_id)
                $(.$method($arg))+
        )
    };
}
