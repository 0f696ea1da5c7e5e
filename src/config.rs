//! Configuration management for the NiuNiu transaction coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub gas: GasConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub contracts: HashMap<String, String>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub poll_interval_ms: u64,
    pub send_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    /// Consecutive failed receipt polls before giving up on a transaction
    #[serde(default = "default_receipt_poll_failures")]
    pub receipt_poll_failures: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Buffer added on top of estimated gas, in percent
    pub gas_limit_buffer_percent: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Account connected at startup
    pub active: String,
    pub accounts: HashMap<String, AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_confirmation_blocks() -> u64 {
    1
}

fn default_receipt_poll_failures() -> u32 {
    5
}

impl Settings {
    /// Load settings from the file named by `NIUNIU_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("NIUNIU_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.iter().all(|u| u.trim().is_empty()) {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if !self.wallet.accounts.contains_key(&self.wallet.active) {
            anyhow::bail!(
                "Active account {} is not configured under [wallet.accounts]",
                self.wallet.active
            );
        }

        for alias in self.contracts.keys() {
            self.contract_address(alias)?;
        }

        if self.chain.poll_interval_ms == 0 {
            anyhow::bail!("chain.poll_interval_ms must be positive");
        }

        Ok(())
    }

    /// Resolve a contract alias to its address
    pub fn contract_address(&self, alias: &str) -> Result<Address> {
        let raw = self
            .contracts
            .get(alias)
            .with_context(|| format!("Contract {} is not configured", alias))?;

        raw.parse::<Address>()
            .with_context(|| format!("Invalid address for contract {}: {}", alias, raw))
    }

    /// All contract aliases with their parsed addresses
    pub fn contract_addresses(&self) -> Result<HashMap<String, Address>> {
        self.contracts
            .keys()
            .map(|alias| Ok((alias.clone(), self.contract_address(alias)?)))
            .collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[service]
instance_id = "table-7"
health_check_interval_secs = 30

[chain]
chain_id = 11155111
name = "sepolia"
rpc_urls = ["${NIUNIU_TEST_RPC}"]
poll_interval_ms = 500
send_timeout_secs = 30
receipt_timeout_secs = 120

[wallet]
active = "dealer"

[wallet.accounts.dealer]
private_key_env = "NIUNIU_DEALER_KEY"

[wallet.accounts.player]
private_key_env = "NIUNIU_PLAYER_KEY"

[contracts]
game = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("NIUNIU_TEST_VAR", "test_value");
        let input = "url = \"https://rpc.example.com/${NIUNIU_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://rpc.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample() {
        env::set_var("NIUNIU_TEST_RPC", "http://localhost:8545");
        let settings = Settings::parse(SAMPLE).unwrap();

        assert_eq!(settings.chain.rpc_urls, vec!["http://localhost:8545"]);
        assert_eq!(settings.chain.confirmation_blocks, 1);
        assert_eq!(settings.chain.receipt_poll_failures, 5);
        assert_eq!(settings.gas.gas_limit_buffer_percent, 20);
        assert_eq!(settings.wallet.accounts.len(), 2);

        let game = settings.contract_address("game").unwrap();
        assert_eq!(
            format!("{:?}", game),
            "0x5fbdb2315678afecb367f032d93f642f64180aa3"
        );
        assert!(settings.contract_address("lobby").is_err());
    }

    #[test]
    fn test_rejects_unknown_active_account() {
        env::set_var("NIUNIU_TEST_RPC", "http://localhost:8545");
        let broken = SAMPLE.replace("active = \"dealer\"", "active = \"ghost\"");
        let err = Settings::parse(&broken).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_bad_contract_address() {
        env::set_var("NIUNIU_TEST_RPC", "http://localhost:8545");
        let broken = SAMPLE.replace("0x5FbDB2315678afecb367f032d93F642f64180aa3", "0x1234");
        assert!(Settings::parse(&broken).is_err());
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("NIUNIU_TEST_RPC", "http://localhost:8545");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.service.instance_id, "table-7");
        assert_eq!(settings.api.port, 8080);
    }
}
