use async_trait::async_trait;
use pledge_types::AccountAddress;
use std::collections::HashSet;

/// Decides who may call the privileged operations (rewarding and
/// slashing). Ownership and governance live outside the engine; this is
/// the only question it ever asks.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_privileged(&self, caller: AccountAddress) -> bool;
}

/// Fixed set of privileged callers, decided at construction.
pub struct StaticAuthorizer {
    privileged: HashSet<AccountAddress>,
}

impl StaticAuthorizer {
    pub fn new(privileged: impl IntoIterator<Item = AccountAddress>) -> Self {
        Self {
            privileged: privileged.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn is_privileged(&self, caller: AccountAddress) -> bool {
        self.privileged.contains(&caller)
    }
}
