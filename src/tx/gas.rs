//! Gas limit policy for contract calls

use crate::config::GasConfig;

use ethers::types::U256;

/// Applies a safety buffer on top of node gas estimates
#[derive(Debug, Clone)]
pub struct GasPolicy {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
}

impl GasPolicy {
    pub fn new(gas_limit_buffer_percent: u64) -> Self {
        Self {
            gas_limit_buffer_percent,
        }
    }

    pub fn from_config(config: &GasConfig) -> Self {
        Self::new(config.gas_limit_buffer_percent)
    }

    /// Gas limit to use for an estimated call
    pub fn with_buffer(&self, estimate: U256) -> U256 {
        let buffer = estimate * self.gas_limit_buffer_percent / 100;
        estimate.saturating_add(buffer)
    }
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self::from_config(&GasConfig::default())
    }
}
