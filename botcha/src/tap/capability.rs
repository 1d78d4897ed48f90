//! Capabilities and intent authorization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BotchaError, Result};

/// Constraints attached to a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRestrictions {
    /// Upper bound for any amount-bearing intent.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxAmount")]
    pub max_amount: Option<f64>,
    /// Other declared constraints, stored but not enforced.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A permission an agent declared at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Action tag, e.g. `browse` or `purchase`.
    pub action: String,
    /// Resources the action applies to.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Optional restrictions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<CapabilityRestrictions>,
}

impl Capability {
    /// A capability with no scope and no restrictions.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self { action: action.into(), scope: Vec::new(), restrictions: None }
    }

    /// Adds scope entries.
    #[must_use]
    pub fn with_scope<I, T>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.scope.extend(scope.into_iter().map(Into::into));
        self
    }

    /// Sets a maximum amount.
    #[must_use]
    pub fn with_max_amount(mut self, max_amount: f64) -> Self {
        self.restrictions.get_or_insert_with(CapabilityRestrictions::default).max_amount =
            Some(max_amount);
        self
    }

    fn violation(&self, intent: &SessionIntent) -> Option<String> {
        let restrictions = self.restrictions.as_ref()?;
        match (restrictions.max_amount, intent.amount) {
            (Some(max), Some(amount)) if amount > max => {
                Some(format!("{} amount {amount} exceeds maximum {max}", self.action))
            }
            _ => None,
        }
    }
}

/// What an agent intends to do during a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionIntent {
    /// Requested action.
    pub action: String,
    /// Target resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Requested scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
    /// Requested session length in seconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "durationSeconds",
        alias = "duration"
    )]
    pub duration_seconds: Option<i64>,
    /// Amount for amount-bearing actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl SessionIntent {
    /// An intent for `action` with nothing else set.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self { action: action.into(), ..Self::default() }
    }
}

/// Checks `intent` against `capabilities` and returns the capabilities that
/// grant it. The result is what a session snapshots.
///
/// # Errors
///
/// - [`BotchaError::InsufficientCapability`] if no capability has the intent's action
/// - [`BotchaError::RestrictionViolated`] if every matching capability forbids it
///
/// # Examples
///
/// ```
/// use botcha::tap::{Capability, SessionIntent, authorize};
///
/// let caps = vec![Capability::new("browse").with_scope(["products"])];
/// assert_eq!(authorize(&caps, &SessionIntent::new("browse")).unwrap().len(), 1);
/// assert!(authorize(&caps, &SessionIntent::new("purchase")).is_err());
/// ```
pub fn authorize(capabilities: &[Capability], intent: &SessionIntent) -> Result<Vec<Capability>> {
    let matching: Vec<&Capability> =
        capabilities.iter().filter(|c| c.action == intent.action).collect();
    if matching.is_empty() {
        return Err(BotchaError::InsufficientCapability(intent.action.clone()));
    }

    let mut first_violation = None;
    let mut granted = Vec::with_capacity(matching.len());
    for capability in matching {
        match capability.violation(intent) {
            Some(reason) => {
                first_violation.get_or_insert(reason);
            }
            None => granted.push(capability.clone()),
        }
    }

    match first_violation {
        Some(reason) if granted.is_empty() => Err(BotchaError::RestrictionViolated(reason)),
        _ => Ok(granted),
    }
}
