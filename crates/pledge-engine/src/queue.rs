use pledge_types::TokenAmount;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A delayed-release entry: tokens requested out of delegation or
/// allocation at `request_block`, claimable once the configured delay
/// has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub amount: TokenAmount,
    pub request_block: u64,
}

/// FIFO of delayed-release entries for one owner.
///
/// Entries are pushed in block order, so the matured portion is always a
/// prefix of the queue. A claim pops exactly that prefix; immature entries
/// stay queued for a later claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelayQueue {
    entries: VecDeque<QueueEntry>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, amount: TokenAmount, request_block: u64) {
        self.entries.push_back(QueueEntry {
            amount,
            request_block,
        });
    }

    /// Removes every entry matured at `current_block` and returns their sum.
    /// Returns zero when nothing has matured; the queue is left untouched.
    pub fn claim_matured(&mut self, current_block: u64, delay_blocks: u64) -> TokenAmount {
        let mut claimed = TokenAmount::ZERO;
        while let Some(front) = self.entries.front() {
            if front.request_block.saturating_add(delay_blocks) > current_block {
                break;
            }
            claimed = claimed.saturating_add(front.amount);
            self.entries.pop_front();
        }
        claimed
    }

    pub fn total(&self) -> TokenAmount {
        self.entries
            .iter()
            .fold(TokenAmount::ZERO, |acc, entry| {
                acc.saturating_add(entry.amount)
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
