//! Pooled staking and delegation ledger.
//!
//! Depositors commit tokens into custody, optionally entrust stake to
//! delegates, and allocate it to activities that can be rewarded or
//! slashed proportionally in O(1). Funds leaving delegation or
//! allocation pass through FIFO delay queues before they return to the
//! free balance.

pub mod activity;
pub mod auth;
pub mod balance;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod events;
pub mod queue;
pub mod slash;
pub mod token;

pub use activity::{ActivityManager, ActivityState, AllocationRecord, DepositorPosition};
pub use auth::{Authorizer, StaticAuthorizer};
pub use balance::BalanceManager;
pub use clock::{BlockClock, ManualClock};
pub use config::{EngineConfig, DEFAULT_PRECISION};
pub use delegation::{Delegation, DelegationManager};
pub use events::{EventLog, EventRecord, StakeEvent, DEFAULT_EVENT_CAPACITY};
pub use queue::{DelayQueue, QueueEntry};
pub use slash::SlashProcessor;
pub use token::{MemoryToken, TokenLedger};

pub use pledge_types::{AccountAddress, ActivityId, PledgeError, Result, TokenAmount};

use std::sync::Arc;

/// Facade wiring the ledgers together behind one call surface. Every
/// mutating operation appends to the event log after it succeeds.
pub struct StakeEngine {
    config: EngineConfig,
    token: Arc<dyn TokenLedger>,
    clock: Arc<dyn BlockClock>,
    authorizer: Arc<dyn Authorizer>,
    pub balances: Arc<BalanceManager>,
    pub delegations: Arc<DelegationManager>,
    pub activities: Arc<ActivityManager>,
    pub slasher: Arc<SlashProcessor>,
    events: EventLog,
}

impl StakeEngine {
    pub fn new(
        config: EngineConfig,
        token: Arc<dyn TokenLedger>,
        clock: Arc<dyn BlockClock>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        config.validate()?;

        let balances = Arc::new(BalanceManager::new(token.clone(), config.custody));
        let delegations = Arc::new(DelegationManager::new(
            balances.clone(),
            clock.clone(),
            config.undelegate_delay_blocks,
        ));
        let activities = Arc::new(ActivityManager::new(
            balances.clone(),
            delegations.clone(),
            token.clone(),
            clock.clone(),
            &config,
        ));
        let slasher = Arc::new(SlashProcessor::new(
            activities.clone(),
            token.clone(),
            config.custody,
            config.treasury,
        ));

        Ok(Self {
            config,
            token,
            clock,
            authorizer,
            balances,
            delegations,
            activities,
            slasher,
            events: EventLog::default(),
        })
    }

    async fn authorize(&self, caller: AccountAddress) -> Result<()> {
        if self.authorizer.is_privileged(caller).await {
            Ok(())
        } else {
            Err(PledgeError::NotAuthorized)
        }
    }

    /// Pulls `amount` from the depositor's token account into custody
    /// and credits their free balance.
    pub async fn deposit(&self, depositor: AccountAddress, amount: TokenAmount) -> Result<()> {
        self.balances.deposit(depositor, amount).await?;
        self.events
            .record(
                StakeEvent::Deposit { depositor, amount },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    /// Earmarks `amount` of free balance for withdrawal. No delay is
    /// imposed here; funds leaving delegation or allocation already paid
    /// theirs.
    pub async fn request_withdraw(
        &self,
        depositor: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        self.balances.request_withdraw(depositor, amount).await
    }

    /// Sends the depositor's entire earmarked amount back to their token
    /// account.
    pub async fn withdraw(&self, depositor: AccountAddress) -> Result<TokenAmount> {
        let amount = self.balances.withdraw(depositor).await?;
        self.events
            .record(
                StakeEvent::Withdraw { depositor, amount },
                self.clock.current_block(),
            )
            .await;
        Ok(amount)
    }

    pub async fn delegate(
        &self,
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        self.delegations.delegate(depositor, delegate, amount).await?;
        self.events
            .record(
                StakeEvent::Delegate {
                    depositor,
                    delegate,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    pub async fn undelegate(
        &self,
        depositor: AccountAddress,
        delegate: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        self.delegations
            .undelegate(depositor, delegate, amount)
            .await?;
        self.events
            .record(
                StakeEvent::Undelegate {
                    depositor,
                    delegate,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    pub async fn claim_undelegated(&self, depositor: AccountAddress) -> Result<TokenAmount> {
        let amount = self.delegations.claim_undelegated(depositor).await?;
        self.events
            .record(
                StakeEvent::ClaimUndelegatedTokens { depositor, amount },
                self.clock.current_block(),
            )
            .await;
        Ok(amount)
    }

    /// Commits stake to an activity. The caller is either the depositor
    /// or an active delegate acting for them.
    pub async fn allocate(
        &self,
        caller: AccountAddress,
        amount: TokenAmount,
        activity: ActivityId,
        depositor: AccountAddress,
    ) -> Result<()> {
        self.activities
            .allocate(caller, amount, activity, depositor)
            .await?;
        self.events
            .record(
                StakeEvent::Allocate {
                    caller,
                    depositor,
                    activity,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    pub async fn unallocate(
        &self,
        caller: AccountAddress,
        amount: TokenAmount,
        activity: ActivityId,
        depositor: AccountAddress,
    ) -> Result<()> {
        self.activities
            .unallocate(caller, amount, activity, depositor)
            .await?;
        self.events
            .record(
                StakeEvent::Unallocate {
                    caller,
                    depositor,
                    activity,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    pub async fn claim_unallocated(
        &self,
        depositor: AccountAddress,
        activity: ActivityId,
    ) -> Result<TokenAmount> {
        let amount = self.activities.claim_unallocated(depositor, activity).await?;
        self.events
            .record(
                StakeEvent::ClaimUnallocatedTokens {
                    depositor,
                    activity,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(amount)
    }

    /// Privileged. Pulls `amount` from the caller's token account and
    /// spreads it over the activity's current stake.
    pub async fn reward_activity(
        &self,
        caller: AccountAddress,
        activity: ActivityId,
        amount: TokenAmount,
    ) -> Result<()> {
        self.authorize(caller).await?;
        self.activities.reward(caller, activity, amount).await?;
        self.events
            .record(
                StakeEvent::Reward { activity, amount },
                self.clock.current_block(),
            )
            .await;
        Ok(())
    }

    pub async fn claim_reward(
        &self,
        caller: AccountAddress,
        depositor: AccountAddress,
        activity: ActivityId,
    ) -> Result<TokenAmount> {
        let amount = self
            .activities
            .claim_reward(caller, depositor, activity)
            .await?;
        self.events
            .record(
                StakeEvent::ClaimReward {
                    depositor,
                    activity,
                    amount,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(amount)
    }

    /// Privileged. Removes `percentage` of the activity's pooled stake;
    /// the slashed tokens stay in custody until the next flush.
    pub async fn slash(
        &self,
        caller: AccountAddress,
        activity: ActivityId,
        percentage: u8,
    ) -> Result<TokenAmount> {
        self.authorize(caller).await?;
        let slashed = self.slasher.slash(activity, percentage).await?;
        self.events
            .record(
                StakeEvent::Slash {
                    activity,
                    percentage,
                    slashed,
                },
                self.clock.current_block(),
            )
            .await;
        Ok(slashed)
    }

    /// Flushes all pending slashed tokens to the treasury.
    pub async fn process_slashed_funds(&self) -> Result<TokenAmount> {
        self.slasher.process_slashed_funds().await
    }

    pub async fn free_balance(&self, depositor: AccountAddress) -> TokenAmount {
        self.balances.free_balance(depositor).await
    }

    pub async fn pending_withdrawal(&self, depositor: AccountAddress) -> TokenAmount {
        self.balances.pending_withdrawal(depositor).await
    }

    pub async fn delegation(
        &self,
        delegate: AccountAddress,
        depositor: AccountAddress,
    ) -> Option<Delegation> {
        self.delegations.delegation(delegate, depositor).await
    }

    pub async fn position(
        &self,
        activity: ActivityId,
        depositor: AccountAddress,
    ) -> Result<DepositorPosition> {
        self.activities.position(activity, depositor).await
    }

    pub async fn activity_stats(&self, activity: ActivityId) -> Option<ActivityState> {
        self.activities.activity_stats(activity).await
    }

    pub async fn pending_slash(&self) -> TokenAmount {
        self.slasher.pending_slash().await
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        self.events.recent(limit).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The custody account's token balance, for reconciliation against
    /// [`Self::total_custodied`].
    pub async fn custody_balance(&self) -> Result<TokenAmount> {
        self.token.balance_of(self.config.custody).await
    }

    /// Sum of every obligation the engine tracks internally: free
    /// balances, withdrawal earmarks, live delegations, both delay
    /// queues, pooled activity stake, pending slash, and unclaimed
    /// reward. The custody token balance is always at least this; equal
    /// whenever the index arithmetic produced no rounding remainder.
    pub async fn total_custodied(&self) -> Result<TokenAmount> {
        let mut total = self.balances.total_free().await;
        let parts = [
            self.balances.total_earmarked().await,
            self.delegations.total_delegated().await,
            self.delegations.total_queued().await,
            self.activities.total_staked().await,
            self.activities.total_queued().await,
            self.slasher.pending_slash().await,
            self.activities.total_reward_liability().await?,
        ];
        for part in parts {
            total = total
                .checked_add(part)
                .ok_or(PledgeError::Overflow("custodied total"))?;
        }
        Ok(total)
    }
}
