use crate::balance::BalanceManager;
use crate::clock::BlockClock;
use crate::queue::{DelayQueue, QueueEntry};
use pledge_types::{AccountAddress, PledgeError, Result, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// One depositor-to-delegate entrustment. `amount == 0` implies
/// `active == false` once the undelegation path has drained it; a
/// delegation whose amount was consumed by allocation stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub amount: TokenAmount,
    pub active: bool,
}

/// Tracks which delegates may act on which depositors' stake, and the
/// delay queue undelegated funds pass through on their way back to free
/// balance.
pub struct DelegationManager {
    balances: Arc<BalanceManager>,
    clock: Arc<dyn BlockClock>,
    undelegate_delay_blocks: u64,
    delegations: Arc<RwLock<HashMap<(AccountAddress, AccountAddress), Delegation>>>,
    queues: Arc<RwLock<HashMap<AccountAddress, DelayQueue>>>,
}

impl DelegationManager {
    pub fn new(
        balances: Arc<BalanceManager>,
        clock: Arc<dyn BlockClock>,
        undelegate_delay_blocks: u64,
    ) -> Self {
        Self {
            balances,
            clock,
            undelegate_delay_blocks,
            delegations: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Moves `amount` out of the depositor's free balance into the
    /// delegation, activating it.
    pub async fn delegate(
        &self,
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "delegation amount must be positive".to_string(),
            ));
        }

        self.balances.debit(depositor, amount).await?;

        let mut delegations = self.delegations.write().await;
        let entry = delegations
            .entry((delegate, depositor))
            .or_insert(Delegation {
                amount: TokenAmount::ZERO,
                active: false,
            });
        entry.amount = entry
            .amount
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("delegation amount"))?;
        entry.active = true;

        info!(
            depositor = %depositor,
            delegate = %delegate,
            amount = %amount,
            delegated = %entry.amount,
            "🤝 Stake delegated"
        );
        Ok(())
    }

    /// Takes `amount` out of the delegation and queues it for the
    /// depositor behind the undelegation delay. Draining the delegation
    /// to zero deactivates it.
    pub async fn undelegate(
        &self,
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidUndelegationParameters);
        }

        let remaining = {
            let mut delegations = self.delegations.write().await;
            let entry = delegations
                .get_mut(&(delegate, depositor))
                .ok_or(PledgeError::InvalidUndelegationParameters)?;
            let remaining = entry
                .amount
                .checked_sub(amount)
                .ok_or(PledgeError::InvalidUndelegationParameters)?;
            entry.amount = remaining;
            if remaining.is_zero() {
                entry.active = false;
            }
            remaining
        };

        let request_block = self.clock.current_block();
        let mut queues = self.queues.write().await;
        queues
            .entry(depositor)
            .or_default()
            .push(amount, request_block);

        info!(
            depositor = %depositor,
            delegate = %delegate,
            amount = %amount,
            remaining = %remaining,
            available_at = request_block + self.undelegate_delay_blocks,
            "↩️ Undelegation queued"
        );
        Ok(())
    }

    /// Releases every matured undelegation entry back into the
    /// depositor's free balance. Fails when nothing has matured yet.
    pub async fn claim_undelegated(&self, depositor: AccountAddress) -> Result<TokenAmount> {
        let current_block = self.clock.current_block();
        let claimed = {
            let mut queues = self.queues.write().await;
            let queue = queues
                .get_mut(&depositor)
                .ok_or(PledgeError::FundsNotYetAvailable)?;
            let claimed = queue.claim_matured(current_block, self.undelegate_delay_blocks);
            if queue.is_empty() {
                queues.remove(&depositor);
            }
            claimed
        };

        if claimed.is_zero() {
            return Err(PledgeError::FundsNotYetAvailable);
        }

        self.balances.credit(depositor, claimed).await?;

        info!(
            depositor = %depositor,
            amount = %claimed,
            "🪙 Undelegated tokens claimed"
        );
        Ok(claimed)
    }

    /// Live authorization check: only an active delegation grants the
    /// delegate authority over the depositor's stake.
    pub async fn is_active_delegate(
        &self,
        delegate: AccountAddress,
        depositor: AccountAddress,
    ) -> bool {
        let delegations = self.delegations.read().await;
        delegations
            .get(&(delegate, depositor))
            .map(|d| d.active)
            .unwrap_or(false)
    }

    /// Consumes part of the delegation for an allocation made by the
    /// delegate. The delegation stays active even when drained this way.
    pub(crate) async fn debit_delegation(
        &self,
        delegate: AccountAddress,
        depositor: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        let mut delegations = self.delegations.write().await;
        let entry = delegations
            .get_mut(&(delegate, depositor))
            .filter(|d| d.active)
            .ok_or(PledgeError::Unauthorized)?;
        entry.amount = entry
            .amount
            .checked_sub(amount)
            .ok_or(PledgeError::InsufficientFunds {
                requested: amount,
                available: entry.amount,
            })?;
        Ok(())
    }

    pub async fn delegation(
        &self,
        delegate: AccountAddress,
        depositor: AccountAddress,
    ) -> Option<Delegation> {
        let delegations = self.delegations.read().await;
        delegations.get(&(delegate, depositor)).copied()
    }

    pub async fn queued_undelegations(&self, depositor: AccountAddress) -> Vec<QueueEntry> {
        let queues = self.queues.read().await;
        queues
            .get(&depositor)
            .map(|q| q.entries().copied().collect())
            .unwrap_or_default()
    }

    pub async fn total_delegated(&self) -> TokenAmount {
        let delegations = self.delegations.read().await;
        delegations
            .values()
            .fold(TokenAmount::ZERO, |acc, d| acc.saturating_add(d.amount))
    }

    pub async fn total_queued(&self) -> TokenAmount {
        let queues = self.queues.read().await;
        queues
            .values()
            .fold(TokenAmount::ZERO, |acc, q| acc.saturating_add(q.total()))
    }
}
