//! Per-activity stake accounting.
//!
//! Rewards and slashes touch only two per-activity scalars, so both are
//! O(1) no matter how many depositors hold stake. `reward_index`
//! accumulates reward-per-unit-stake, scaled by the configured precision;
//! `stake_index` starts at the precision constant and shrinks
//! multiplicatively on each slash. Every allocation record carries
//! snapshots of both; the record's current value is computed lazily the
//! next time it is touched.
//!
//! A record's effective stake is
//! `nominal_stake * stake_index / stake_index_snapshot`. Settling a
//! record banks accrued reward into `owed_reward`, re-bases the stake
//! fields to the current stake index, and advances both snapshots. Stake
//! allocated after a reward or slash event snapshots the post-event
//! indices and is untouched by that event.

use crate::balance::BalanceManager;
use crate::clock::BlockClock;
use crate::config::EngineConfig;
use crate::delegation::DelegationManager;
use crate::queue::{DelayQueue, QueueEntry};
use crate::token::TokenLedger;
use pledge_types::{AccountAddress, ActivityId, PledgeError, Result, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Widening multiply-then-divide; `None` on overflow or zero divisor.
pub(crate) fn mul_div(value: u128, multiplier: u128, divisor: u128) -> Option<u128> {
    if divisor == 0 {
        return None;
    }
    value.checked_mul(multiplier).map(|product| product / divisor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityState {
    pub total_stake: TokenAmount,
    pub reward_index: u128,
    pub stake_index: u128,
}

impl ActivityState {
    fn new(precision: u128) -> Self {
        Self {
            total_stake: TokenAmount::ZERO,
            reward_index: 0,
            stake_index: precision,
        }
    }
}

/// One depositor's position in one activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Stake denominated at `stake_index_snapshot`.
    pub nominal_stake: TokenAmount,
    /// Portion of `nominal_stake` placed through a delegation. Caps what
    /// a delegate may unallocate; never exceeds `nominal_stake`.
    pub delegated_stake: TokenAmount,
    pub reward_index_snapshot: u128,
    pub stake_index_snapshot: u128,
    /// Reward realized by a settle but not yet claimed.
    pub owed_reward: TokenAmount,
    pub allocated_at_block: u64,
}

/// Read-only view of one depositor's standing in one activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositorPosition {
    /// Pooled stake across all depositors of the activity.
    pub activity_stake: TokenAmount,
    /// The depositor's slash-adjusted stake.
    pub effective_stake: TokenAmount,
    /// Reward the depositor could claim right now.
    pub claimable_reward: TokenAmount,
}

/// `amount` re-denominated from the record's snapshot to `stake_index`.
/// The stake index never increases, so the result always fits the token
/// range.
fn rebase(amount: TokenAmount, record: &AllocationRecord, stake_index: u128) -> Result<TokenAmount> {
    if amount.is_zero() {
        return Ok(TokenAmount::ZERO);
    }
    let rebased = mul_div(
        amount.to_base_units() as u128,
        stake_index,
        record.stake_index_snapshot,
    )
    .ok_or(PledgeError::Overflow("effective stake"))?;
    let units = u64::try_from(rebased).map_err(|_| PledgeError::Overflow("effective stake"))?;
    Ok(TokenAmount::from_base_units(units))
}

/// The depositor's slash-adjusted stake at the given index.
fn effective_stake(record: &AllocationRecord, stake_index: u128) -> Result<TokenAmount> {
    rebase(record.nominal_stake, record, stake_index)
}

/// Reward accrued since the record's snapshot, given its effective stake.
fn accrued_reward(
    effective: TokenAmount,
    record: &AllocationRecord,
    activity: &ActivityState,
    precision: u128,
) -> Result<TokenAmount> {
    if effective.is_zero() || activity.reward_index <= record.reward_index_snapshot {
        return Ok(TokenAmount::ZERO);
    }
    let delta = activity.reward_index - record.reward_index_snapshot;
    let pending = mul_div(effective.to_base_units() as u128, delta, precision)
        .ok_or(PledgeError::Overflow("reward accrual"))?;
    let units = u64::try_from(pending).map_err(|_| PledgeError::Overflow("reward accrual"))?;
    Ok(TokenAmount::from_base_units(units))
}

/// Banks accrued reward into `owed_reward` and re-bases the record to the
/// activity's current indices. Observable state (effective stake plus
/// total claimable reward) is unchanged.
fn settle(record: &mut AllocationRecord, activity: &ActivityState, precision: u128) -> Result<()> {
    let effective = effective_stake(record, activity.stake_index)?;
    let delegated = rebase(record.delegated_stake, record, activity.stake_index)?;
    let pending = accrued_reward(effective, record, activity, precision)?;
    record.owed_reward = record
        .owed_reward
        .checked_add(pending)
        .ok_or(PledgeError::Overflow("owed reward"))?;
    record.reward_index_snapshot = activity.reward_index;
    record.nominal_stake = effective;
    record.delegated_stake = delegated;
    record.stake_index_snapshot = activity.stake_index;
    Ok(())
}

fn not_enough_staked(
    is_depositor: bool,
    requested: TokenAmount,
    available: TokenAmount,
) -> PledgeError {
    if is_depositor {
        PledgeError::NotEnoughStakedTokens {
            requested,
            available,
        }
    } else {
        PledgeError::NotEnoughDelegatedTokensWereStaked {
            requested,
            available,
        }
    }
}

/// Pooled per-activity stake, allocation records, reward accrual, and the
/// unallocation delay queue.
pub struct ActivityManager {
    balances: Arc<BalanceManager>,
    delegations: Arc<DelegationManager>,
    token: Arc<dyn TokenLedger>,
    clock: Arc<dyn BlockClock>,
    custody: AccountAddress,
    precision: u128,
    unallocate_delay_blocks: u64,
    reward_maturity_blocks: u64,
    activities: Arc<RwLock<HashMap<ActivityId, ActivityState>>>,
    records: Arc<RwLock<HashMap<(AccountAddress, ActivityId), AllocationRecord>>>,
    queues: Arc<RwLock<HashMap<(AccountAddress, ActivityId), DelayQueue>>>,
}

impl ActivityManager {
    pub fn new(
        balances: Arc<BalanceManager>,
        delegations: Arc<DelegationManager>,
        token: Arc<dyn TokenLedger>,
        clock: Arc<dyn BlockClock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            balances,
            delegations,
            token,
            clock,
            custody: config.custody,
            precision: config.precision,
            unallocate_delay_blocks: config.unallocate_delay_blocks,
            reward_maturity_blocks: config.reward_maturity_blocks,
            activities: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Commits `amount` of the depositor's stake to an activity. The
    /// caller must be the depositor (drawing from free balance) or an
    /// active delegate (drawing from the delegation).
    pub async fn allocate(
        &self,
        caller: AccountAddress,
        amount: TokenAmount,
        activity_id: ActivityId,
        depositor: AccountAddress,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "allocation amount must be positive".to_string(),
            ));
        }

        {
            let activities = self.activities.read().await;
            if let Some(activity) = activities.get(&activity_id) {
                if activity.stake_index == 0 {
                    return Err(PledgeError::InvalidParameters(
                        "activity stake index exhausted by slashing".to_string(),
                    ));
                }
            }
        }

        let via_delegation = caller != depositor;
        if via_delegation {
            if !self.delegations.is_active_delegate(caller, depositor).await {
                return Err(PledgeError::Unauthorized);
            }
            self.delegations
                .debit_delegation(caller, depositor, amount)
                .await?;
        } else {
            self.balances.debit(depositor, amount).await?;
        }

        let current_block = self.clock.current_block();
        let mut activities = self.activities.write().await;
        let activity = activities
            .entry(activity_id)
            .or_insert_with(|| ActivityState::new(self.precision));

        let mut records = self.records.write().await;
        let record = records
            .entry((depositor, activity_id))
            .or_insert_with(|| AllocationRecord {
                nominal_stake: TokenAmount::ZERO,
                delegated_stake: TokenAmount::ZERO,
                reward_index_snapshot: activity.reward_index,
                stake_index_snapshot: activity.stake_index,
                owed_reward: TokenAmount::ZERO,
                allocated_at_block: current_block,
            });

        settle(record, activity, self.precision)?;
        record.nominal_stake = record
            .nominal_stake
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("allocation"))?;
        if via_delegation {
            record.delegated_stake = record
                .delegated_stake
                .checked_add(amount)
                .ok_or(PledgeError::Overflow("allocation"))?;
        }
        record.allocated_at_block = current_block;
        activity.total_stake = activity
            .total_stake
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("total stake"))?;

        info!(
            caller = %caller,
            depositor = %depositor,
            activity = %activity_id,
            amount = %amount,
            total_stake = %activity.total_stake,
            via_delegation,
            "📌 Stake allocated"
        );
        Ok(())
    }

    /// Withdraws `amount` of slash-adjusted stake from an activity into
    /// the unallocation queue. The queued amount is fixed at request
    /// time; later rewards and slashes no longer touch it. A delegate may
    /// withdraw at most the delegate-placed portion of the record; the
    /// depositor may withdraw all of it.
    pub async fn unallocate(
        &self,
        caller: AccountAddress,
        amount: TokenAmount,
        activity_id: ActivityId,
        depositor: AccountAddress,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "unallocation amount must be positive".to_string(),
            ));
        }

        let via_delegation = caller != depositor;
        if via_delegation && !self.delegations.is_active_delegate(caller, depositor).await {
            return Err(PledgeError::Unauthorized);
        }

        let current_block = self.clock.current_block();
        let mut activities = self.activities.write().await;
        let mut records = self.records.write().await;

        let activity = activities
            .get_mut(&activity_id)
            .ok_or_else(|| not_enough_staked(!via_delegation, amount, TokenAmount::ZERO))?;
        let record = records
            .get_mut(&(depositor, activity_id))
            .ok_or_else(|| not_enough_staked(!via_delegation, amount, TokenAmount::ZERO))?;

        settle(record, activity, self.precision)?;
        let available = if via_delegation {
            record.delegated_stake
        } else {
            record.nominal_stake
        };
        if amount > available {
            return Err(not_enough_staked(!via_delegation, amount, available));
        }

        record.nominal_stake = record
            .nominal_stake
            .checked_sub(amount)
            .ok_or(PledgeError::Overflow("unallocation"))?;
        if via_delegation {
            record.delegated_stake = record
                .delegated_stake
                .checked_sub(amount)
                .ok_or(PledgeError::Overflow("unallocation"))?;
        } else {
            // A depositor exit may consume delegate-placed stake.
            record.delegated_stake = record.delegated_stake.min(record.nominal_stake);
        }
        activity.total_stake = activity
            .total_stake
            .checked_sub(amount)
            .ok_or(PledgeError::Overflow("total stake"))?;
        if record.nominal_stake.is_zero() && record.owed_reward.is_zero() {
            records.remove(&(depositor, activity_id));
        }

        let mut queues = self.queues.write().await;
        queues
            .entry((depositor, activity_id))
            .or_default()
            .push(amount, current_block);

        info!(
            caller = %caller,
            depositor = %depositor,
            activity = %activity_id,
            amount = %amount,
            available_at = current_block + self.unallocate_delay_blocks,
            "📤 Unallocation queued"
        );
        Ok(())
    }

    /// Releases matured unallocation entries into the depositor's free
    /// balance. Fails when nothing has matured yet.
    pub async fn claim_unallocated(
        &self,
        depositor: AccountAddress,
        activity_id: ActivityId,
    ) -> Result<TokenAmount> {
        let current_block = self.clock.current_block();
        let claimed = {
            let mut queues = self.queues.write().await;
            let queue = queues
                .get_mut(&(depositor, activity_id))
                .ok_or(PledgeError::FundsNotYetAvailable)?;
            let claimed = queue.claim_matured(current_block, self.unallocate_delay_blocks);
            if queue.is_empty() {
                queues.remove(&(depositor, activity_id));
            }
            claimed
        };

        if claimed.is_zero() {
            return Err(PledgeError::FundsNotYetAvailable);
        }

        self.balances.credit(depositor, claimed).await?;

        info!(
            depositor = %depositor,
            activity = %activity_id,
            amount = %claimed,
            "🪙 Unallocated tokens claimed"
        );
        Ok(claimed)
    }

    /// Pulls `amount` from the funder's token account and spreads it over
    /// all current stake by advancing the reward index.
    pub async fn reward(
        &self,
        funder: AccountAddress,
        activity_id: ActivityId,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "reward amount must be positive".to_string(),
            ));
        }

        {
            let activities = self.activities.read().await;
            let has_stake = activities
                .get(&activity_id)
                .map(|a| !a.total_stake.is_zero())
                .unwrap_or(false);
            if !has_stake {
                return Err(PledgeError::NoStakeOnActivity(activity_id));
            }
        }

        self.token
            .transfer_from(self.custody, funder, self.custody, amount)
            .await?;

        let mut activities = self.activities.write().await;
        let activity = activities
            .get_mut(&activity_id)
            .ok_or(PledgeError::NoStakeOnActivity(activity_id))?;
        let delta = mul_div(
            amount.to_base_units() as u128,
            self.precision,
            activity.total_stake.to_base_units() as u128,
        )
        .ok_or(PledgeError::Overflow("reward index"))?;
        activity.reward_index = activity
            .reward_index
            .checked_add(delta)
            .ok_or(PledgeError::Overflow("reward index"))?;

        debug!(
            activity = %activity_id,
            delta,
            reward_index = activity.reward_index,
            "Reward index advanced"
        );
        info!(
            activity = %activity_id,
            amount = %amount,
            total_stake = %activity.total_stake,
            "🎁 Activity rewarded"
        );
        Ok(())
    }

    /// Pays out everything the depositor has accrued in the activity.
    /// Only the depositor may claim their own reward.
    pub async fn claim_reward(
        &self,
        caller: AccountAddress,
        depositor: AccountAddress,
        activity_id: ActivityId,
    ) -> Result<TokenAmount> {
        if caller != depositor {
            return Err(PledgeError::InvalidCaller);
        }

        let current_block = self.clock.current_block();
        let owed = {
            let activities = self.activities.read().await;
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&(depositor, activity_id))
                .ok_or(PledgeError::NoRewardAvailable)?;

            if current_block
                < record
                    .allocated_at_block
                    .saturating_add(self.reward_maturity_blocks)
            {
                return Err(PledgeError::NoRewardAvailable);
            }

            let activity = activities
                .get(&activity_id)
                .ok_or(PledgeError::NoRewardAvailable)?;
            settle(record, activity, self.precision)?;

            let owed = record.owed_reward;
            if owed.is_zero() {
                return Err(PledgeError::NoRewardAvailable);
            }
            record.owed_reward = TokenAmount::ZERO;
            if record.nominal_stake.is_zero() {
                records.remove(&(depositor, activity_id));
            }
            owed
        };

        self.balances.credit(depositor, owed).await?;

        info!(
            depositor = %depositor,
            activity = %activity_id,
            amount = %owed,
            "🏆 Reward claimed"
        );
        Ok(owed)
    }

    /// Read-only view of the activity's pooled stake and the depositor's
    /// effective stake and claimable reward. Never mutates snapshots.
    pub async fn position(
        &self,
        activity_id: ActivityId,
        depositor: AccountAddress,
    ) -> Result<DepositorPosition> {
        let activities = self.activities.read().await;
        let records = self.records.read().await;

        let Some(activity) = activities.get(&activity_id) else {
            return Ok(DepositorPosition {
                activity_stake: TokenAmount::ZERO,
                effective_stake: TokenAmount::ZERO,
                claimable_reward: TokenAmount::ZERO,
            });
        };
        let Some(record) = records.get(&(depositor, activity_id)) else {
            return Ok(DepositorPosition {
                activity_stake: activity.total_stake,
                effective_stake: TokenAmount::ZERO,
                claimable_reward: TokenAmount::ZERO,
            });
        };

        let effective = effective_stake(record, activity.stake_index)?;
        let matured = self.clock.current_block()
            >= record
                .allocated_at_block
                .saturating_add(self.reward_maturity_blocks);
        let claimable = if matured {
            record
                .owed_reward
                .checked_add(accrued_reward(effective, record, activity, self.precision)?)
                .ok_or(PledgeError::Overflow("claimable reward"))?
        } else {
            TokenAmount::ZERO
        };

        Ok(DepositorPosition {
            activity_stake: activity.total_stake,
            effective_stake: effective,
            claimable_reward: claimable,
        })
    }

    fn slash_outcome(activity: &ActivityState, percentage: u8) -> Result<(TokenAmount, u128)> {
        let slashed = mul_div(
            activity.total_stake.to_base_units() as u128,
            percentage as u128,
            100,
        )
        .ok_or(PledgeError::Overflow("slash amount"))?;
        let slashed = u64::try_from(slashed).map_err(|_| PledgeError::Overflow("slash amount"))?;
        let index_after = mul_div(activity.stake_index, (100 - percentage) as u128, 100)
            .ok_or(PledgeError::Overflow("stake index"))?;
        Ok((TokenAmount::from_base_units(slashed), index_after))
    }

    /// The amount a slash of `percentage` would remove right now, without
    /// applying it.
    pub(crate) async fn preview_slash(
        &self,
        activity_id: ActivityId,
        percentage: u8,
    ) -> Result<TokenAmount> {
        if percentage > 100 {
            return Err(PledgeError::InvalidParameters(
                "slash percentage must be within 0..=100".to_string(),
            ));
        }
        let activities = self.activities.read().await;
        let activity = activities
            .get(&activity_id)
            .filter(|a| !a.total_stake.is_zero())
            .ok_or(PledgeError::NoStakeOnActivity(activity_id))?;
        let (slashed, _) = Self::slash_outcome(activity, percentage)?;
        Ok(slashed)
    }

    /// Removes `percentage` of the activity's pooled stake by shrinking
    /// the stake index; every allocation record shrinks proportionally on
    /// its next read. Returns the slashed amount.
    pub(crate) async fn apply_slash(
        &self,
        activity_id: ActivityId,
        percentage: u8,
    ) -> Result<TokenAmount> {
        if percentage > 100 {
            return Err(PledgeError::InvalidParameters(
                "slash percentage must be within 0..=100".to_string(),
            ));
        }
        let mut activities = self.activities.write().await;
        let activity = activities
            .get_mut(&activity_id)
            .filter(|a| !a.total_stake.is_zero())
            .ok_or(PledgeError::NoStakeOnActivity(activity_id))?;

        let (slashed, index_after) = Self::slash_outcome(activity, percentage)?;
        activity.total_stake = activity
            .total_stake
            .checked_sub(slashed)
            .ok_or(PledgeError::Overflow("slash"))?;
        activity.stake_index = index_after;

        warn!(
            activity = %activity_id,
            percentage,
            slashed = %slashed,
            total_stake = %activity.total_stake,
            stake_index = activity.stake_index,
            "⚔️ Activity slashed"
        );
        Ok(slashed)
    }

    pub async fn activity_stats(&self, activity_id: ActivityId) -> Option<ActivityState> {
        let activities = self.activities.read().await;
        activities.get(&activity_id).copied()
    }

    pub async fn allocation(
        &self,
        depositor: AccountAddress,
        activity_id: ActivityId,
    ) -> Option<AllocationRecord> {
        let records = self.records.read().await;
        records.get(&(depositor, activity_id)).copied()
    }

    pub async fn queued_unallocations(
        &self,
        depositor: AccountAddress,
        activity_id: ActivityId,
    ) -> Vec<QueueEntry> {
        let queues = self.queues.read().await;
        queues
            .get(&(depositor, activity_id))
            .map(|q| q.entries().copied().collect())
            .unwrap_or_default()
    }

    pub async fn total_staked(&self) -> TokenAmount {
        let activities = self.activities.read().await;
        activities
            .values()
            .fold(TokenAmount::ZERO, |acc, a| {
                acc.saturating_add(a.total_stake)
            })
    }

    pub async fn total_queued(&self) -> TokenAmount {
        let queues = self.queues.read().await;
        queues
            .values()
            .fold(TokenAmount::ZERO, |acc, q| acc.saturating_add(q.total()))
    }

    /// Banked plus accrued-but-unclaimed reward across all records.
    /// O(records); a diagnostic surface, not an operation.
    pub async fn total_reward_liability(&self) -> Result<TokenAmount> {
        let activities = self.activities.read().await;
        let records = self.records.read().await;

        let mut total = TokenAmount::ZERO;
        for ((_, activity_id), record) in records.iter() {
            total = total
                .checked_add(record.owed_reward)
                .ok_or(PledgeError::Overflow("reward liability"))?;
            if let Some(activity) = activities.get(activity_id) {
                let effective = effective_stake(record, activity.stake_index)?;
                total = total
                    .checked_add(accrued_reward(
                        effective,
                        record,
                        activity,
                        self.precision,
                    )?)
                    .ok_or(PledgeError::Overflow("reward liability"))?;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::token::MemoryToken;

    fn addr(byte: u8) -> AccountAddress {
        AccountAddress::from_bytes([byte; 32])
    }

    fn tokens(n: f64) -> TokenAmount {
        TokenAmount::from_tokens(n)
    }

    struct Env {
        token: Arc<MemoryToken>,
        balances: Arc<BalanceManager>,
        delegations: Arc<DelegationManager>,
        manager: ActivityManager,
        clock: Arc<ManualClock>,
        custody: AccountAddress,
    }

    async fn setup_with(config: EngineConfig) -> Env {
        let token = Arc::new(MemoryToken::new());
        let custody = config.custody;
        let clock = Arc::new(ManualClock::new(1));
        let balances = Arc::new(BalanceManager::new(token.clone(), custody));
        let delegations = Arc::new(DelegationManager::new(
            balances.clone(),
            clock.clone(),
            config.undelegate_delay_blocks,
        ));
        let manager = ActivityManager::new(
            balances.clone(),
            delegations.clone(),
            token.clone(),
            clock.clone(),
            &config,
        );
        Env {
            token,
            balances,
            delegations,
            manager,
            clock,
            custody,
        }
    }

    async fn setup() -> Env {
        setup_with(EngineConfig::default()).await
    }

    async fn fund(env: &Env, who: AccountAddress, amount: TokenAmount) {
        env.token.mint(who, amount).await.unwrap();
        env.token.approve(who, env.custody, amount).await.unwrap();
        env.balances.deposit(who, amount).await.unwrap();
    }

    #[tokio::test]
    async fn test_allocate_from_free_balance() {
        let env = setup().await;
        let alice = addr(1);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();

        assert_eq!(env.balances.free_balance(alice).await, TokenAmount::ZERO);
        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.activity_stake, tokens(10.0));
        assert_eq!(position.effective_stake, tokens(10.0));
        assert_eq!(position.claimable_reward, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_allocate_via_delegate_keeps_delegation_active() {
        let env = setup().await;
        let alice = addr(1);
        let bob = addr(2);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.delegations
            .delegate(alice, bob, tokens(10.0))
            .await
            .unwrap();
        env.manager
            .allocate(bob, tokens(10.0), act, alice)
            .await
            .unwrap();

        // Drained by allocation, not undelegation: authority survives.
        let delegation = env.delegations.delegation(bob, alice).await.unwrap();
        assert_eq!(delegation.amount, TokenAmount::ZERO);
        assert!(delegation.active);

        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.effective_stake, tokens(10.0));
    }

    #[tokio::test]
    async fn test_stranger_cannot_allocate() {
        let env = setup().await;
        let alice = addr(1);
        let mallory = addr(9);

        fund(&env, alice, tokens(10.0)).await;
        let err = env
            .manager
            .allocate(mallory, tokens(1.0), ActivityId::new(1), alice)
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::Unauthorized));
    }

    #[tokio::test]
    async fn test_allocate_beyond_available_fails() {
        let env = setup().await;
        let alice = addr(1);

        fund(&env, alice, tokens(5.0)).await;
        let err = env
            .manager
            .allocate(alice, tokens(6.0), ActivityId::new(1), alice)
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::InsufficientFunds { .. }));

        // Delegate ceiling is the live delegated amount.
        let bob = addr(2);
        env.delegations
            .delegate(alice, bob, tokens(3.0))
            .await
            .unwrap();
        let err = env
            .manager
            .allocate(bob, tokens(4.0), ActivityId::new(1), alice)
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_unallocate_and_claim_after_delay() {
        let env = setup().await;
        let alice = addr(1);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager
            .unallocate(alice, tokens(4.0), act, alice)
            .await
            .unwrap();

        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.effective_stake, tokens(6.0));
        assert_eq!(position.activity_stake, tokens(6.0));

        assert!(matches!(
            env.manager.claim_unallocated(alice, act).await,
            Err(PledgeError::FundsNotYetAvailable)
        ));

        env.clock.advance(60);
        let claimed = env.manager.claim_unallocated(alice, act).await.unwrap();
        assert_eq!(claimed, tokens(4.0));
        assert_eq!(env.balances.free_balance(alice).await, tokens(4.0));
    }

    #[tokio::test]
    async fn test_unallocate_beyond_stake_fails_by_caller_path() {
        let env = setup().await;
        let alice = addr(1);
        let bob = addr(2);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.delegations
            .delegate(alice, bob, tokens(5.0))
            .await
            .unwrap();
        env.manager
            .allocate(alice, tokens(5.0), act, alice)
            .await
            .unwrap();

        let err = env
            .manager
            .unallocate(alice, tokens(6.0), act, alice)
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::NotEnoughStakedTokens { .. }));

        let err = env
            .manager
            .unallocate(bob, tokens(6.0), act, alice)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PledgeError::NotEnoughDelegatedTokensWereStaked { .. }
        ));
    }

    #[tokio::test]
    async fn test_delegate_unallocates_only_delegate_placed_stake() {
        let env = setup().await;
        let alice = addr(1);
        let bob = addr(2);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(20.0)).await;
        env.delegations
            .delegate(alice, bob, tokens(10.0))
            .await
            .unwrap();
        env.manager
            .allocate(bob, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();

        // The record covers 20, but bob placed only 10 of it.
        let err = env
            .manager
            .unallocate(bob, tokens(20.0), act, alice)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PledgeError::NotEnoughDelegatedTokensWereStaked { .. }
        ));

        env.manager
            .unallocate(bob, tokens(4.0), act, alice)
            .await
            .unwrap();
        let err = env
            .manager
            .unallocate(bob, tokens(7.0), act, alice)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PledgeError::NotEnoughDelegatedTokensWereStaked { .. }
        ));

        // The depositor can always drain the whole record.
        env.manager
            .unallocate(alice, tokens(16.0), act, alice)
            .await
            .unwrap();
        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.effective_stake, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_slash_shrinks_delegate_placed_portion() {
        let env = setup().await;
        let alice = addr(1);
        let bob = addr(2);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(20.0)).await;
        env.delegations
            .delegate(alice, bob, tokens(10.0))
            .await
            .unwrap();
        env.manager
            .allocate(bob, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();

        env.manager.apply_slash(act, 50).await.unwrap();

        // Bob's ceiling is the slash-adjusted 5, not the original 10.
        let err = env
            .manager
            .unallocate(bob, tokens(6.0), act, alice)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PledgeError::NotEnoughDelegatedTokensWereStaked { .. }
        ));
        env.manager
            .unallocate(bob, tokens(5.0), act, alice)
            .await
            .unwrap();

        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.effective_stake, tokens(5.0));
    }

    #[tokio::test]
    async fn test_reward_requires_stake() {
        let env = setup().await;
        let funder = addr(7);
        let err = env
            .manager
            .reward(funder, ActivityId::new(1), tokens(5.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::NoStakeOnActivity(_)));
    }

    #[tokio::test]
    async fn test_reward_and_claim_cycle() {
        let env = setup().await;
        let alice = addr(1);
        let funder = addr(7);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();

        env.token.mint(funder, tokens(3.0)).await.unwrap();
        env.token
            .approve(funder, env.custody, tokens(3.0))
            .await
            .unwrap();
        env.manager.reward(funder, act, tokens(3.0)).await.unwrap();

        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.claimable_reward, tokens(3.0));

        let claimed = env.manager.claim_reward(alice, alice, act).await.unwrap();
        assert_eq!(claimed, tokens(3.0));
        assert_eq!(env.balances.free_balance(alice).await, tokens(3.0));

        // Nothing left to claim.
        assert!(matches!(
            env.manager.claim_reward(alice, alice, act).await,
            Err(PledgeError::NoRewardAvailable)
        ));
    }

    #[tokio::test]
    async fn test_claim_reward_requires_depositor_caller() {
        let env = setup().await;
        let err = env
            .manager
            .claim_reward(addr(2), addr(1), ActivityId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PledgeError::InvalidCaller));
    }

    #[tokio::test]
    async fn test_slash_shrinks_stake_proportionally() {
        let env = setup().await;
        let alice = addr(1);
        let bob = addr(2);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        fund(&env, bob, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager
            .allocate(bob, tokens(10.0), act, bob)
            .await
            .unwrap();

        let slashed = env.manager.apply_slash(act, 10).await.unwrap();
        assert_eq!(slashed, tokens(2.0));

        let stats = env.manager.activity_stats(act).await.unwrap();
        assert_eq!(stats.total_stake, tokens(18.0));

        let alice_position = env.manager.position(act, alice).await.unwrap();
        let bob_position = env.manager.position(act, bob).await.unwrap();
        assert_eq!(alice_position.effective_stake, tokens(9.0));
        assert_eq!(bob_position.effective_stake, tokens(9.0));
    }

    #[tokio::test]
    async fn test_allocation_after_slash_is_untouched_by_it() {
        let env = setup().await;
        let alice = addr(1);
        let carol = addr(3);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        fund(&env, carol, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager.apply_slash(act, 10).await.unwrap();

        env.manager
            .allocate(carol, tokens(10.0), act, carol)
            .await
            .unwrap();
        let carol_position = env.manager.position(act, carol).await.unwrap();
        assert_eq!(carol_position.effective_stake, tokens(10.0));

        // A later slash applies to everyone currently staked.
        env.manager.apply_slash(act, 50).await.unwrap();
        let carol_position = env.manager.position(act, carol).await.unwrap();
        assert_eq!(carol_position.effective_stake, tokens(5.0));
    }

    #[tokio::test]
    async fn test_slash_rejects_bad_percentage_and_empty_activity() {
        let env = setup().await;
        assert!(matches!(
            env.manager.apply_slash(ActivityId::new(1), 101).await,
            Err(PledgeError::InvalidParameters(_))
        ));
        assert!(matches!(
            env.manager.apply_slash(ActivityId::new(1), 10).await,
            Err(PledgeError::NoStakeOnActivity(_))
        ));
    }

    #[tokio::test]
    async fn test_reward_maturity_gate_defers_claims() {
        let config = EngineConfig {
            reward_maturity_blocks: 10,
            ..Default::default()
        };
        let env = setup_with(config).await;
        let alice = addr(1);
        let funder = addr(7);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();

        env.token.mint(funder, tokens(2.0)).await.unwrap();
        env.token
            .approve(funder, env.custody, tokens(2.0))
            .await
            .unwrap();
        env.manager.reward(funder, act, tokens(2.0)).await.unwrap();

        // The allocation is too young to claim; the reward is gated, not lost.
        assert!(matches!(
            env.manager.claim_reward(alice, alice, act).await,
            Err(PledgeError::NoRewardAvailable)
        ));
        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.claimable_reward, TokenAmount::ZERO);

        env.clock.advance(10);
        let claimed = env.manager.claim_reward(alice, alice, act).await.unwrap();
        assert_eq!(claimed, tokens(2.0));
    }

    #[tokio::test]
    async fn test_unallocated_queue_is_frozen_against_later_events() {
        let env = setup().await;
        let alice = addr(1);
        let funder = addr(7);
        let act = ActivityId::new(1);

        fund(&env, alice, tokens(10.0)).await;
        env.manager
            .allocate(alice, tokens(10.0), act, alice)
            .await
            .unwrap();
        env.manager
            .unallocate(alice, tokens(4.0), act, alice)
            .await
            .unwrap();

        // A slash after the request does not touch the queued amount.
        env.manager.apply_slash(act, 50).await.unwrap();

        // Nor does a reward accrue to it: only the remaining stake earns.
        env.token.mint(funder, tokens(3.0)).await.unwrap();
        env.token
            .approve(funder, env.custody, tokens(3.0))
            .await
            .unwrap();
        env.manager.reward(funder, act, tokens(3.0)).await.unwrap();

        env.clock.advance(60);
        let claimed = env.manager.claim_unallocated(alice, act).await.unwrap();
        assert_eq!(claimed, tokens(4.0));

        let position = env.manager.position(act, alice).await.unwrap();
        assert_eq!(position.effective_stake, tokens(3.0));
        assert_eq!(position.claimable_reward, tokens(3.0));
    }
}
