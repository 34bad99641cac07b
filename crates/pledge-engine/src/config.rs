use pledge_types::{AccountAddress, PledgeError, Result};
use serde::{Deserialize, Serialize};

/// Default fixed-point precision for the reward and stake indices.
pub const DEFAULT_PRECISION: u128 = 1_000_000_000_000; // 10^12

/// Engine parameters, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Blocks between an undelegation request and claimability.
    pub undelegate_delay_blocks: u64,
    /// Blocks between an unallocation request and claimability.
    pub unallocate_delay_blocks: u64,
    /// Minimum allocation age, in blocks, before rewards may be claimed.
    pub reward_maturity_blocks: u64,
    /// Destination for slashed funds.
    pub treasury: AccountAddress,
    /// Token account holding everything the engine custodies.
    pub custody: AccountAddress,
    /// Scaling constant for the reward and stake indices.
    pub precision: u128,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            undelegate_delay_blocks: 60,
            unallocate_delay_blocks: 60,
            reward_maturity_blocks: 0,
            treasury: AccountAddress::treasury(),
            custody: AccountAddress::custody(),
            precision: DEFAULT_PRECISION,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.treasury.is_zero() {
            return Err(PledgeError::InvalidTreasury);
        }
        if self.custody.is_zero() {
            return Err(PledgeError::InvalidParameters(
                "custody address must be set".to_string(),
            ));
        }
        if self.precision == 0 {
            return Err(PledgeError::InvalidParameters(
                "index precision must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_treasury_rejected() {
        let config = EngineConfig {
            treasury: AccountAddress::zero(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PledgeError::InvalidTreasury)
        ));
    }

    #[test]
    fn test_zero_precision_rejected() {
        let config = EngineConfig {
            precision: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PledgeError::InvalidParameters(_))
        ));
    }
}
