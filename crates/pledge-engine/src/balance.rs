use crate::token::TokenLedger;
use pledge_types::{AccountAddress, PledgeError, Result, TokenAmount};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Per-depositor free balances and staged withdrawals.
///
/// Free balance is the only pool deposits land in and the only pool
/// delegation and allocation draw from. A withdrawal is staged as an
/// earmark first: the earmark is taken out of the ledger before the
/// outbound token call, so a reentrant call observes nothing left to
/// withdraw.
pub struct BalanceManager {
    token: Arc<dyn TokenLedger>,
    custody: AccountAddress,
    balances: Arc<RwLock<HashMap<AccountAddress, TokenAmount>>>,
    earmarks: Arc<RwLock<HashMap<AccountAddress, TokenAmount>>>,
}

impl BalanceManager {
    pub fn new(token: Arc<dyn TokenLedger>, custody: AccountAddress) -> Self {
        Self {
            token,
            custody,
            balances: Arc::new(RwLock::new(HashMap::new())),
            earmarks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pulls `amount` from the depositor's external token account into
    /// custody and credits their free balance.
    pub async fn deposit(&self, depositor: AccountAddress, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "deposit amount must be positive".to_string(),
            ));
        }

        self.token
            .transfer_from(self.custody, depositor, self.custody, amount)
            .await?;
        self.credit(depositor, amount).await?;

        info!(
            depositor = %depositor,
            amount = %amount,
            "💰 Deposit received"
        );
        Ok(())
    }

    pub(crate) async fn credit(&self, account: AccountAddress, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut balances = self.balances.write().await;
        let current = balances.get(&account).copied().unwrap_or(TokenAmount::ZERO);
        let updated = current
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("balance credit"))?;
        balances.insert(account, updated);
        Ok(())
    }

    pub(crate) async fn debit(&self, account: AccountAddress, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut balances = self.balances.write().await;
        let current = balances.get(&account).copied().unwrap_or(TokenAmount::ZERO);
        let updated = current
            .checked_sub(amount)
            .ok_or(PledgeError::InsufficientFunds {
                requested: amount,
                available: current,
            })?;
        balances.insert(account, updated);
        Ok(())
    }

    /// Moves `amount` from free balance into the withdrawal earmark.
    /// Repeated requests accumulate into a single earmark.
    pub async fn request_withdraw(
        &self,
        depositor: AccountAddress,
        amount: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "withdrawal amount must be positive".to_string(),
            ));
        }

        self.debit(depositor, amount).await?;

        let mut earmarks = self.earmarks.write().await;
        let current = earmarks.get(&depositor).copied().unwrap_or(TokenAmount::ZERO);
        let updated = current
            .checked_add(amount)
            .ok_or(PledgeError::Overflow("withdrawal earmark"))?;
        earmarks.insert(depositor, updated);

        info!(
            depositor = %depositor,
            amount = %amount,
            earmarked = %updated,
            "📤 Withdrawal staged"
        );
        Ok(())
    }

    /// Sends the earmarked amount back to the depositor's token account.
    /// The earmark is cleared before the transfer and restored if the
    /// token reports failure.
    pub async fn withdraw(&self, depositor: AccountAddress) -> Result<TokenAmount> {
        let amount = {
            let mut earmarks = self.earmarks.write().await;
            match earmarks.remove(&depositor) {
                Some(amount) if !amount.is_zero() => amount,
                _ => return Err(PledgeError::NothingToWithdraw),
            }
        };

        match self.token.transfer(self.custody, depositor, amount).await {
            Ok(()) => {
                info!(
                    depositor = %depositor,
                    amount = %amount,
                    "✅ Withdrawal sent"
                );
                Ok(amount)
            }
            Err(e) => {
                let mut earmarks = self.earmarks.write().await;
                let current = earmarks.get(&depositor).copied().unwrap_or(TokenAmount::ZERO);
                earmarks.insert(depositor, current.saturating_add(amount));
                warn!(
                    depositor = %depositor,
                    amount = %amount,
                    error = %e,
                    "Withdrawal transfer failed; earmark restored"
                );
                Err(e)
            }
        }
    }

    pub async fn free_balance(&self, account: AccountAddress) -> TokenAmount {
        let balances = self.balances.read().await;
        balances.get(&account).copied().unwrap_or(TokenAmount::ZERO)
    }

    pub async fn pending_withdrawal(&self, account: AccountAddress) -> TokenAmount {
        let earmarks = self.earmarks.read().await;
        earmarks.get(&account).copied().unwrap_or(TokenAmount::ZERO)
    }

    pub async fn total_free(&self) -> TokenAmount {
        let balances = self.balances.read().await;
        balances
            .values()
            .fold(TokenAmount::ZERO, |acc, b| acc.saturating_add(*b))
    }

    pub async fn total_earmarked(&self) -> TokenAmount {
        let earmarks = self.earmarks.read().await;
        earmarks
            .values()
            .fold(TokenAmount::ZERO, |acc, e| acc.saturating_add(*e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryToken;

    fn addr(byte: u8) -> AccountAddress {
        AccountAddress::from_bytes([byte; 32])
    }

    fn units(n: u64) -> TokenAmount {
        TokenAmount::from_base_units(n)
    }

    async fn setup() -> (Arc<MemoryToken>, BalanceManager, AccountAddress) {
        let token = Arc::new(MemoryToken::new());
        let custody = AccountAddress::custody();
        let manager = BalanceManager::new(token.clone(), custody);
        (token, manager, custody)
    }

    #[tokio::test]
    async fn test_deposit_pulls_tokens_into_custody() {
        let (token, manager, custody) = setup().await;
        let alice = addr(1);

        token.mint(alice, units(100)).await.unwrap();
        token.approve(alice, custody, units(100)).await.unwrap();

        manager.deposit(alice, units(60)).await.unwrap();

        assert_eq!(manager.free_balance(alice).await, units(60));
        assert_eq!(token.balance_of(alice).await.unwrap(), units(40));
        assert_eq!(token.balance_of(custody).await.unwrap(), units(60));
    }

    #[tokio::test]
    async fn test_deposit_without_approval_fails() {
        let (token, manager, _) = setup().await;
        let alice = addr(1);

        token.mint(alice, units(100)).await.unwrap();
        let err = manager.deposit(alice, units(10)).await.unwrap_err();
        assert!(matches!(err, PledgeError::NotApproved { .. }));
        assert_eq!(manager.free_balance(alice).await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_withdraw_roundtrip() {
        let (token, manager, custody) = setup().await;
        let alice = addr(1);

        token.mint(alice, units(50)).await.unwrap();
        token.approve(alice, custody, units(50)).await.unwrap();
        manager.deposit(alice, units(50)).await.unwrap();

        manager.request_withdraw(alice, units(20)).await.unwrap();
        assert_eq!(manager.free_balance(alice).await, units(30));
        assert_eq!(manager.pending_withdrawal(alice).await, units(20));

        let sent = manager.withdraw(alice).await.unwrap();
        assert_eq!(sent, units(20));
        assert_eq!(manager.pending_withdrawal(alice).await, TokenAmount::ZERO);
        assert_eq!(token.balance_of(alice).await.unwrap(), units(20));
    }

    #[tokio::test]
    async fn test_withdraw_without_earmark_fails() {
        let (_, manager, _) = setup().await;
        let err = manager.withdraw(addr(1)).await.unwrap_err();
        assert!(matches!(err, PledgeError::NothingToWithdraw));
    }

    #[tokio::test]
    async fn test_request_withdraw_beyond_balance_fails() {
        let (token, manager, custody) = setup().await;
        let alice = addr(1);

        token.mint(alice, units(10)).await.unwrap();
        token.approve(alice, custody, units(10)).await.unwrap();
        manager.deposit(alice, units(10)).await.unwrap();

        let err = manager.request_withdraw(alice, units(11)).await.unwrap_err();
        assert!(matches!(
            err,
            PledgeError::InsufficientFunds { requested, available }
                if requested == units(11) && available == units(10)
        ));
        assert_eq!(manager.free_balance(alice).await, units(10));
    }

    #[tokio::test]
    async fn test_repeated_requests_accumulate() {
        let (token, manager, custody) = setup().await;
        let alice = addr(1);

        token.mint(alice, units(30)).await.unwrap();
        token.approve(alice, custody, units(30)).await.unwrap();
        manager.deposit(alice, units(30)).await.unwrap();

        manager.request_withdraw(alice, units(10)).await.unwrap();
        manager.request_withdraw(alice, units(5)).await.unwrap();
        assert_eq!(manager.pending_withdrawal(alice).await, units(15));

        assert_eq!(manager.withdraw(alice).await.unwrap(), units(15));
    }
}
