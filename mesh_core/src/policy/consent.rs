//! Append-only consent ledger.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use world_engine::Timestamp;

use crate::shard::ShardedMap;

/// Account identifier as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An account's grant or denial for one operation category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub account_id: AccountId,
    pub consent_type: String,
    pub granted: bool,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub details: Value,
}

/// Consent history per account. Records are never edited or removed.
#[derive(Debug, Default)]
pub struct ConsentLedger {
    records: ShardedMap<AccountId, Vec<ConsentRecord>>,
}

impl ConsentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ConsentRecord) {
        self.records
            .update(record.account_id.clone(), |history| {
                history.get_or_insert_with(Vec::new).push(record)
            });
    }

    /// Most recent record for `(account, consent_type)`. Among records with
    /// the same timestamp the one appended last wins.
    pub fn latest(&self, account: &AccountId, consent_type: &str) -> Option<ConsentRecord> {
        self.records.read(account, |history| {
            history?
                .iter()
                .filter(|r| r.consent_type == consent_type)
                .max_by_key(|r| r.timestamp)
                .cloned()
        })
    }

    /// Every record for an account in append order.
    pub fn history(&self, account: &AccountId) -> Vec<ConsentRecord> {
        self.records.get(account).unwrap_or_default()
    }
}
