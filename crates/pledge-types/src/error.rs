use crate::amount::TokenAmount;
use crate::id::{AccountAddress, ActivityId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PledgeError {
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("insufficient external token balance for {account}")]
    InsufficientExternalBalance { account: AccountAddress },

    #[error("token transfer not approved: {owner} -> {spender}")]
    NotApproved {
        owner: AccountAddress,
        spender: AccountAddress,
    },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid undelegation parameters")]
    InvalidUndelegationParameters,

    #[error("invalid treasury")]
    InvalidTreasury,

    #[error("funds not yet available")]
    FundsNotYetAvailable,

    #[error("only the depositor or an active delegate may perform this operation")]
    Unauthorized,

    #[error("caller is not privileged for this operation")]
    NotAuthorized,

    #[error("invalid caller")]
    InvalidCaller,

    #[error("not enough staked tokens: requested {requested}, available {available}")]
    NotEnoughStakedTokens {
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("not enough delegated tokens were staked: requested {requested}, available {available}")]
    NotEnoughDelegatedTokensWereStaked {
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("no reward available for depositor")]
    NoRewardAvailable,

    #[error("cannot reward {0} without stake")]
    NoStakeOnActivity(ActivityId),

    #[error("nothing to withdraw")]
    NothingToWithdraw,

    #[error("nothing to process")]
    NothingToProcess,

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

pub type Result<T> = std::result::Result<T, PledgeError>;
