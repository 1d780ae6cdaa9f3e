//! Policy and consent gate guarding every mutating entry point.
//!
//! A request is allowed only if the account holds a granted consent record
//! for the request's category and is within its tier's rate quota. A denial
//! has no side effects: it does not consume quota and nothing downstream runs.

mod consent;
mod rate;

pub use consent::*;
pub use rate::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use world_engine::SharedClock;

use crate::config::PolicyConfig;
use crate::error::{MeshError, Result};

/// Category applied when the classifier has no label for a request.
pub const DEFAULT_CATEGORY: &str = "general";

/// Why the gate refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoConsent,
    RateLimited,
    /// The request targets something another account owns.
    NotOwner,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoConsent => f.write_str("no consent recorded for this category"),
            DenyReason::RateLimited => f.write_str("rate limit exceeded for this window"),
            DenyReason::NotOwner => f.write_str("owned by another account"),
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(MeshError::PolicyDenied(reason)),
        }
    }
}

/// Opaque labeler for requests that arrive without a category.
pub trait RequestClassifier: Send + Sync {
    /// Category label for the request kind, if the classifier knows one.
    fn classify(&self, request_kind: &str, payload: &Value) -> Option<String>;
}

/// Classifier that labels nothing, so every request lands in [`DEFAULT_CATEGORY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unclassified;

impl RequestClassifier for Unclassified {
    fn classify(&self, _request_kind: &str, _payload: &Value) -> Option<String> {
        None
    }
}

/// Consent, tier and rate state behind one check.
pub struct PolicyGate {
    consents: ConsentLedger,
    accounts: AccountDirectory,
    limiter: RateLimiter,
    classifier: Arc<dyn RequestClassifier>,
    clock: SharedClock,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig, clock: SharedClock) -> Self {
        Self {
            consents: ConsentLedger::new(),
            accounts: AccountDirectory::default(),
            limiter: RateLimiter::new(config),
            classifier: Arc::new(Unclassified),
            clock,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn RequestClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Authorize one request in `category` for `account`.
    pub fn check(&self, account: &AccountId, category: &str) -> Decision {
        let consented = self
            .consents
            .latest(account, category)
            .is_some_and(|record| record.granted);
        if !consented {
            info!(account = %account, category, "policy denied: no consent");
            return Decision::Deny(DenyReason::NoConsent);
        }

        let tier = self.accounts.tier(account);
        if !self.limiter.try_acquire(account, tier, self.clock.now()) {
            info!(account = %account, category, %tier, "policy denied: rate limited");
            return Decision::Deny(DenyReason::RateLimited);
        }

        debug!(account = %account, category, "policy allowed");
        Decision::Allow
    }

    /// Resolve a category through the classifier, then check it.
    pub fn check_request(&self, account: &AccountId, request_kind: &str, payload: &Value) -> Decision {
        let category = self.classify(request_kind, payload);
        self.check(account, &category)
    }

    pub fn classify(&self, request_kind: &str, payload: &Value) -> String {
        self.classifier
            .classify(request_kind, payload)
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }

    /// Append a consent record stamped with the current time.
    pub fn record_consent(
        &self,
        account: AccountId,
        consent_type: impl Into<String>,
        granted: bool,
        details: Value,
    ) -> ConsentRecord {
        let record = ConsentRecord {
            account_id: account,
            consent_type: consent_type.into(),
            granted,
            timestamp: self.clock.now(),
            details,
        };
        info!(
            account = %record.account_id,
            consent_type = %record.consent_type,
            granted,
            "consent recorded"
        );
        self.consents.append(record.clone());
        record
    }

    pub fn has_consent(&self, account: &AccountId, consent_type: &str) -> bool {
        self.consents
            .latest(account, consent_type)
            .is_some_and(|record| record.granted)
    }

    pub fn consent(&self, account: &AccountId, consent_type: &str) -> Option<ConsentRecord> {
        self.consents.latest(account, consent_type)
    }

    pub fn consent_history(&self, account: &AccountId) -> Vec<ConsentRecord> {
        self.consents.history(account)
    }

    pub fn set_tier(&self, account: AccountId, tier: Tier) {
        info!(account = %account, %tier, "account tier set");
        self.accounts.set_tier(account, tier);
    }

    pub fn tier(&self, account: &AccountId) -> Tier {
        self.accounts.tier(account)
    }

    pub fn rate_window(&self, account: &AccountId) -> Option<RateWindow> {
        self.limiter.window(account)
    }
}
