use chrono::Utc;
use pledge_types::{AccountAddress, ActivityId, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Notification emitted after each successful state transition, for
/// external indexing. Delivery is the embedder's concern; the engine only
/// keeps a bounded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakeEvent {
    Deposit {
        depositor: AccountAddress,
        amount: TokenAmount,
    },
    Delegate {
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    },
    Undelegate {
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    },
    ClaimUndelegatedTokens {
        depositor: AccountAddress,
        amount: TokenAmount,
    },
    Allocate {
        caller: AccountAddress,
        depositor: AccountAddress,
        activity: ActivityId,
        amount: TokenAmount,
    },
    Unallocate {
        caller: AccountAddress,
        depositor: AccountAddress,
        activity: ActivityId,
        amount: TokenAmount,
    },
    ClaimUnallocatedTokens {
        depositor: AccountAddress,
        activity: ActivityId,
        amount: TokenAmount,
    },
    Reward {
        activity: ActivityId,
        amount: TokenAmount,
    },
    Slash {
        activity: ActivityId,
        percentage: u8,
        slashed: TokenAmount,
    },
    ClaimReward {
        depositor: AccountAddress,
        activity: ActivityId,
        amount: TokenAmount,
    },
    Withdraw {
        depositor: AccountAddress,
        amount: TokenAmount,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: StakeEvent,
    pub block: u64,
    pub timestamp: i64,
}

/// Bounded in-memory event history; the oldest entries are dropped once
/// capacity is reached.
pub struct EventLog {
    entries: RwLock<VecDeque<EventRecord>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, event: StakeEvent, block: u64) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(EventRecord {
            event,
            block,
            timestamp: Utc::now().timestamp(),
        });
    }

    /// Returns up to `limit` most recent records, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let entries = self.entries.read().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
