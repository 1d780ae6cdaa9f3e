//! Fixed-window rate limiting per account tier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use world_engine::Timestamp;

use super::consent::AccountId;
use crate::config::PolicyConfig;
use crate::shard::ShardedMap;

/// Account classification controlling rate-limit quotas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// Requests allowed per window; `None` means unlimited.
    pub fn quota(&self, config: &PolicyConfig) -> Option<u32> {
        match self {
            Tier::Free => Some(config.free_quota),
            Tier::Pro => Some(config.pro_quota),
            Tier::Enterprise => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        };
        f.write_str(name)
    }
}

/// Tier assignments. Unknown accounts are Free.
#[derive(Debug, Default)]
pub struct AccountDirectory {
    tiers: ShardedMap<AccountId, Tier>,
}

impl AccountDirectory {
    pub fn set_tier(&self, account: AccountId, tier: Tier) {
        self.tiers.insert(account, tier);
    }

    pub fn tier(&self, account: &AccountId) -> Tier {
        self.tiers.get(account).unwrap_or_default()
    }
}

/// Request count for one account in the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub account_id: AccountId,
    pub tier: Tier,
    pub window_start: Timestamp,
    pub count: u32,
}

/// Fixed-window counters aligned to multiples of the window length.
#[derive(Debug)]
pub struct RateLimiter {
    windows: ShardedMap<AccountId, RateWindow>,
    config: PolicyConfig,
}

impl RateLimiter {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            windows: ShardedMap::default(),
            config,
        }
    }

    pub fn window_length(&self) -> Duration {
        self.config.window()
    }

    fn window_start(&self, now: Timestamp) -> Timestamp {
        let length = self.config.window().as_millis().max(1);
        let millis = u128::from(now.as_millis());
        Timestamp::from_millis(u64::try_from(millis - millis % length).unwrap_or(u64::MAX))
    }

    /// Count one request if the account is under quota.
    ///
    /// Check and increment happen under the account's shard lock, so
    /// concurrent callers can never push the count past the quota. Rejected
    /// requests are not counted.
    pub fn try_acquire(&self, account: &AccountId, tier: Tier, now: Timestamp) -> bool {
        let start = self.window_start(now);
        let quota = tier.quota(&self.config);

        self.windows.update(account.clone(), |slot| {
            let window = slot.get_or_insert_with(|| RateWindow {
                account_id: account.clone(),
                tier,
                window_start: start,
                count: 0,
            });
            if window.window_start < start {
                window.window_start = start;
                window.count = 0;
            }
            window.tier = tier;

            match quota {
                Some(limit) if window.count >= limit => false,
                _ => {
                    window.count = window.count.saturating_add(1);
                    true
                }
            }
        })
    }

    pub fn window(&self, account: &AccountId) -> Option<RateWindow> {
        self.windows.get(account)
    }
}
