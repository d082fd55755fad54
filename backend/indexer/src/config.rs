//! Application configuration loaded from environment variables.

use crate::errors::{IndexerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC endpoint serving `circles_getLogs`
    pub rpc_url: String,
    /// The circles contract address (0x-prefixed hex)
    pub contract_address: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) to poll the RPC for new logs
    pub poll_interval_secs: u64,
    /// Maximum number of logs to fetch per RPC request
    pub events_per_page: u32,
    /// Block to start from if no cursor is saved
    pub start_block: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key).ok_or_else(|| IndexerError::Config(format!("Missing env var: {key}")))
        };

        let contract_address = var("CONTRACT_ADDRESS").map_err(|_| {
            IndexerError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
        })?;
        let digits = contract_address
            .strip_prefix("0x")
            .unwrap_or(&contract_address);
        if digits.is_empty() || hex::decode(digits).is_err() {
            return Err(IndexerError::Config(format!(
                "CONTRACT_ADDRESS is not a hex address: {contract_address}"
            )));
        }

        Ok(Config {
            rpc_url: var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),
            contract_address,
            database_url: var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./circles.db".to_string()),
            api_port: var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| IndexerError::Config("Invalid API_PORT".to_string()))?,
            poll_interval_secs: var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| IndexerError::Config("Invalid POLL_INTERVAL_SECS".to_string()))?,
            events_per_page: var("EVENTS_PER_PAGE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| IndexerError::Config("Invalid EVENTS_PER_PAGE".to_string()))?,
            start_block: var("START_BLOCK")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .map_err(|_| IndexerError::Config("Invalid START_BLOCK".to_string()))?,
        })
    }
}
