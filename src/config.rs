//! Configuration for the jobmarket client
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Address;
use crate::pipeline::PipelineConfig;
use crate::transport::TransportConfig;

/// jobmarket - denormalised job marketplace view
#[derive(Parser, Debug, Clone)]
#[command(name = "jobmarket")]
#[command(about = "Aggregates ledger and message-store state into one marketplace snapshot")]
pub struct Args {
    /// Base URL of the message/user backend
    #[arg(long, env = "API_URL", default_value = "http://localhost:3000")]
    pub api_url: String,

    /// Recorded ledger state (JSON) served as the read-only provider
    #[arg(long, env = "LEDGER_FIXTURE")]
    pub ledger_fixture: Option<PathBuf>,

    /// Connected wallet address; omit for unauthenticated browsing
    #[arg(long, env = "WALLET_ADDRESS")]
    pub address: Option<String>,

    /// Session token file (accessToken / refreshToken)
    #[arg(long, env = "TOKEN_STORE", default_value = "data/session.json")]
    pub token_store: PathBuf,

    /// Per-request timeout for backend calls
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Page size for chat thread history
    #[arg(long, env = "CHAT_PAGE_LIMIT", default_value = "50")]
    pub page_limit: u32,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let url = self.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("API_URL must be an http(s) URL, got {url:?}"));
        }

        self.wallet_address()?;

        if self.page_limit == 0 {
            return Err("CHAT_PAGE_LIMIT must be at least 1".to_string());
        }

        Ok(())
    }

    /// Parsed wallet address, if one was given.
    pub fn wallet_address(&self) -> Result<Option<Address>, String> {
        self.address
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|e| format!("WALLET_ADDRESS {raw:?} is invalid: {e}"))
            })
            .transpose()
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_url: self.api_url.trim().to_string(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chat_page_limit: self.page_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["jobmarket"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_are_valid() {
        let args = args(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.transport_config().request_timeout, Duration::from_secs(30));
        assert_eq!(args.pipeline_config().chat_page_limit, 50);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(args(&["--api-url", "localhost:3000"]).validate().is_err());
        assert!(args(&["--address", "0x1234"]).validate().is_err());
        assert!(args(&["--page-limit", "0"]).validate().is_err());
    }

    #[test]
    fn test_wallet_address_parses() {
        let args = args(&["--address", "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"]);
        assert_eq!(
            args.wallet_address().unwrap(),
            Some(Address::from_bytes([0xaa; 20]))
        );
    }
}
