//! Two-phase slashing.
//!
//! A slash removes stake from the activity immediately but leaves the
//! tokens in custody, accumulating in a pending bucket. A later flush
//! moves the whole bucket to the treasury in one pull-style transfer.
//! Each slash pre-approves the treasury for the updated bucket total, so
//! the flush consumes exactly the allowance the slashes granted. Slash
//! and flush are serialized against each other; the allowance and the
//! pending bucket always move together.

use crate::activity::ActivityManager;
use crate::token::TokenLedger;
use pledge_types::{AccountAddress, ActivityId, PledgeError, Result, TokenAmount};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub struct SlashProcessor {
    activities: Arc<ActivityManager>,
    token: Arc<dyn TokenLedger>,
    custody: AccountAddress,
    treasury: AccountAddress,
    pending_slash: Arc<RwLock<TokenAmount>>,
    /// Serializes slash against flush so the treasury allowance always
    /// covers the pending bucket.
    serial: Mutex<()>,
}

impl SlashProcessor {
    pub fn new(
        activities: Arc<ActivityManager>,
        token: Arc<dyn TokenLedger>,
        custody: AccountAddress,
        treasury: AccountAddress,
    ) -> Self {
        Self {
            activities,
            token,
            custody,
            treasury,
            pending_slash: Arc::new(RwLock::new(TokenAmount::ZERO)),
            serial: Mutex::new(()),
        }
    }

    /// Slashes `percentage` of the activity's pooled stake. The slashed
    /// tokens stay in custody as pending until the next flush. The
    /// treasury allowance is raised before any internal state changes, so
    /// a failed approval aborts the slash cleanly.
    pub async fn slash(&self, activity_id: ActivityId, percentage: u8) -> Result<TokenAmount> {
        let _serial = self.serial.lock().await;
        let slashed = self.activities.preview_slash(activity_id, percentage).await?;

        let approved = {
            let pending = self.pending_slash.read().await;
            pending
                .checked_add(slashed)
                .ok_or(PledgeError::Overflow("pending slash"))?
        };
        self.token
            .approve(self.custody, self.treasury, approved)
            .await?;

        let applied = self.activities.apply_slash(activity_id, percentage).await?;
        let mut pending = self.pending_slash.write().await;
        *pending = pending
            .checked_add(applied)
            .ok_or(PledgeError::Overflow("pending slash"))?;

        info!(
            activity = %activity_id,
            percentage,
            slashed = %applied,
            pending = %*pending,
            "🛡️ Slash executed"
        );
        Ok(applied)
    }

    /// Moves all pending slashed tokens from custody to the treasury.
    /// Pending is zeroed before the transfer and restored if it fails.
    pub async fn process_slashed_funds(&self) -> Result<TokenAmount> {
        let _serial = self.serial.lock().await;
        let amount = {
            let mut pending = self.pending_slash.write().await;
            let amount = *pending;
            if amount.is_zero() {
                return Err(PledgeError::NothingToProcess);
            }
            *pending = TokenAmount::ZERO;
            amount
        };

        match self
            .token
            .transfer_from(self.treasury, self.custody, self.treasury, amount)
            .await
        {
            Ok(()) => {
                info!(amount = %amount, treasury = %self.treasury, "🧹 Slashed funds flushed to treasury");
                Ok(amount)
            }
            Err(err) => {
                let mut pending = self.pending_slash.write().await;
                *pending = pending.saturating_add(amount);
                warn!(error = %err, amount = %amount, "Flush failed; pending slash restored");
                Err(err)
            }
        }
    }

    pub async fn pending_slash(&self) -> TokenAmount {
        *self.pending_slash.read().await
    }
}
