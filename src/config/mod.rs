use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::address::{serde_amount, Address, Amount, UNIT};

pub const DEFAULT_FACTORY_LABEL: &str = "room-factory";
pub const DEFAULT_ACCOUNT_BALANCE: Amount = 100 * UNIT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("account {0} is listed more than once")]
    DuplicateAccount(String),
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("genesis balances overflow the amount type at account {0}")]
    SupplyOverflow(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenesisAccount {
    pub label: String,
    /// Explicit address; derived from `label` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(with = "serde_amount")]
    pub balance: Amount,
}

impl GenesisAccount {
    pub fn new(label: &str, balance: Amount) -> Self {
        Self {
            label: label.to_string(),
            address: None,
            balance,
        }
    }

    pub fn address(&self) -> Address {
        self.address
            .unwrap_or_else(|| Address::from_label(&self.label))
    }
}

/// Initial chain state: where the factory lives and who holds what.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenesisConfig {
    #[serde(default = "default_factory_label")]
    pub factory_label: String,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

fn default_factory_label() -> String {
    DEFAULT_FACTORY_LABEL.to_string()
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            factory_label: default_factory_label(),
            accounts: ["owner", "alice", "bob", "carol"]
                .into_iter()
                .map(|label| GenesisAccount::new(label, DEFAULT_ACCOUNT_BALANCE))
                .collect(),
        }
    }
}

impl GenesisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GenesisConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        let mut supply: Amount = 0;
        for account in &self.accounts {
            if !seen.insert(account.address()) {
                return Err(ConfigError::DuplicateAccount(account.label.clone()));
            }
            // Value is conserved, so a bounded genesis bounds every later balance.
            supply = supply
                .checked_add(account.balance)
                .ok_or_else(|| ConfigError::SupplyOverflow(account.label.clone()))?;
        }
        Ok(())
    }

    pub fn factory_address(&self) -> Address {
        Address::from_label(&self.factory_label)
    }

    /// Resolves a genesis label, falling back to a literal hex address.
    pub fn resolve(&self, name: &str) -> Result<Address, ConfigError> {
        if let Some(account) = self.accounts.iter().find(|a| a.label == name) {
            return Ok(account.address());
        }
        name.parse()
            .map_err(|_| ConfigError::UnknownAccount(name.to_string()))
    }
}
