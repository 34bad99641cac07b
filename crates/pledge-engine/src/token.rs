//! Token ledger collaborator.
//!
//! The engine never holds token balances itself; every movement of real
//! funds goes through this trait. The token implementation is untrusted:
//! callers must finish their own bookkeeping before invoking it.

use async_trait::async_trait;
use pledge_types::{AccountAddress, PledgeError, Result, TokenAmount};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn mint(&self, to: AccountAddress, amount: TokenAmount) -> Result<()>;

    async fn transfer(
        &self,
        from: AccountAddress,
        to: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()>;

    /// Moves `amount` from `from` to `to` on behalf of `spender`, consuming
    /// an allowance `from` has granted to `spender`.
    async fn transfer_from(
        &self,
        spender: AccountAddress,
        from: AccountAddress,
        to: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()>;

    /// Sets (overwrites) the allowance `owner` grants to `spender`.
    async fn approve(
        &self,
        owner: AccountAddress,
        spender: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()>;

    async fn balance_of(&self, account: AccountAddress) -> Result<TokenAmount>;

    async fn allowance(
        &self,
        owner: AccountAddress,
        spender: AccountAddress,
    ) -> Result<TokenAmount>;
}

/// In-memory fungible token for tests and single-process embeddings.
pub struct MemoryToken {
    balances: Arc<RwLock<HashMap<AccountAddress, TokenAmount>>>,
    allowances: Arc<RwLock<HashMap<(AccountAddress, AccountAddress), TokenAmount>>>,
}

impl MemoryToken {
    pub fn new() -> Self {
        Self {
            balances: Arc::new(RwLock::new(HashMap::new())),
            allowances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn move_balance(
        &self,
        from: AccountAddress,
        to: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        let mut balances = self.balances.write().await;

        let from_balance = balances.get(&from).copied().unwrap_or(TokenAmount::ZERO);
        let remaining = from_balance
            .checked_sub(amount)
            .ok_or(PledgeError::InsufficientExternalBalance { account: from })?;

        if from == to {
            return Ok(());
        }

        let to_balance = balances.get(&to).copied().unwrap_or(TokenAmount::ZERO);
        let credited = to_balance
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("token transfer"))?;

        balances.insert(from, remaining);
        balances.insert(to, credited);
        Ok(())
    }
}

impl Default for MemoryToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenLedger for MemoryToken {
    async fn mint(&self, to: AccountAddress, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut balances = self.balances.write().await;
        let balance = balances.get(&to).copied().unwrap_or(TokenAmount::ZERO);
        let minted = balance
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("token mint"))?;
        balances.insert(to, minted);
        debug!(to = %to, amount = %amount, "Tokens minted");
        Ok(())
    }

    async fn transfer(
        &self,
        from: AccountAddress,
        to: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.move_balance(from, to, amount).await
    }

    async fn transfer_from(
        &self,
        spender: AccountAddress,
        from: AccountAddress,
        to: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }

        {
            let mut allowances = self.allowances.write().await;
            let granted = allowances
                .get(&(from, spender))
                .copied()
                .unwrap_or(TokenAmount::ZERO);
            let remaining = granted
                .checked_sub(amount)
                .ok_or(PledgeError::NotApproved {
                    owner: from,
                    spender,
                })?;
            allowances.insert((from, spender), remaining);
        }

        match self.move_balance(from, to, amount).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Restore the allowance consumed above; the transfer did not happen.
                let mut allowances = self.allowances.write().await;
                let granted = allowances
                    .get(&(from, spender))
                    .copied()
                    .unwrap_or(TokenAmount::ZERO);
                allowances.insert((from, spender), granted.saturating_add(amount));
                Err(e)
            }
        }
    }

    async fn approve(
        &self,
        owner: AccountAddress,
        spender: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        let mut allowances = self.allowances.write().await;
        allowances.insert((owner, spender), amount);
        debug!(owner = %owner, spender = %spender, amount = %amount, "Allowance set");
        Ok(())
    }

    async fn balance_of(&self, account: AccountAddress) -> Result<TokenAmount> {
        let balances = self.balances.read().await;
        Ok(balances.get(&account).copied().unwrap_or(TokenAmount::ZERO))
    }

    async fn allowance(
        &self,
        owner: AccountAddress,
        spender: AccountAddress,
    ) -> Result<TokenAmount> {
        let allowances = self.allowances.read().await;
        Ok(allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or(TokenAmount::ZERO))
    }
}
