use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::dispatch::{DispatchConfig, RetryConfig};
use crate::relay::{RelaySettings, Route};
use crate::types::ChainId;

/// Main configuration for the relayer
#[derive(Clone)]
pub struct Config {
    /// Signer for destination executions, shared by every chain
    pub private_key: String,
    pub chains: Vec<ChainConfig>,
    pub routes: Vec<RouteConfig>,
    pub relay: RelayConfig,
    pub api_addr: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("private_key", &"<redacted>")
            .field("chains", &self.chains)
            .field("routes", &self.routes)
            .field("relay", &self.relay)
            .field("api_addr", &self.api_addr)
            .finish()
    }
}

/// One gateway chain
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Chain identifier as emitted in `destinationChain`
    pub name: String,
    /// Primary RPC URL followed by fallbacks (tried in order)
    pub rpc_urls: Vec<String>,
    pub gateway_address: String,
    pub confirmations: u64,
    pub execution_confirmations: u64,
    pub start_height: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub source: String,
    pub dest: String,
    /// Source gateway to watch; defaults to the source chain's gateway
    pub gateway: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub tick_interval_ms: u64,
    pub max_retries: u32,
    pub submission_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_block_range: u64,
}

/// Default functions
fn default_tick_interval() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_submission_timeout() -> u64 {
    60_000
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_block_range() -> u64 {
    10_000
}

fn default_confirmations() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_api_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_hex_address(value: &str) -> bool {
    value.len() == 42 && value.starts_with("0x") && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            get(key).ok_or_else(|| eyre!("{} environment variable is required", key))
        };
        fn or_default<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let chains_count: usize = required("CHAINS_COUNT")?
            .trim()
            .parse()
            .wrap_err("CHAINS_COUNT must be a number")?;
        let mut chains = Vec::with_capacity(chains_count);
        for i in 1..=chains_count {
            let prefix = format!("CHAIN_{}", i);
            chains.push(ChainConfig {
                name: required(&format!("{}_NAME", prefix))?,
                rpc_urls: parse_rpc_urls(&required(&format!("{}_RPC_URL", prefix))?),
                gateway_address: required(&format!("{}_GATEWAY_ADDRESS", prefix))?,
                confirmations: or_default(
                    get(&format!("{}_CONFIRMATIONS", prefix)),
                    default_confirmations(),
                ),
                execution_confirmations: or_default(
                    get(&format!("{}_EXECUTION_CONFIRMATIONS", prefix)),
                    default_confirmations(),
                ),
                start_height: or_default(get(&format!("{}_START_HEIGHT", prefix)), 0),
                poll_interval_ms: or_default(
                    get(&format!("{}_POLL_INTERVAL_MS", prefix)),
                    default_poll_interval(),
                ),
            });
        }

        let routes_count: usize = required("ROUTES_COUNT")?
            .trim()
            .parse()
            .wrap_err("ROUTES_COUNT must be a number")?;
        let mut routes = Vec::with_capacity(routes_count);
        for i in 1..=routes_count {
            let prefix = format!("ROUTE_{}", i);
            routes.push(RouteConfig {
                source: required(&format!("{}_SOURCE", prefix))?,
                dest: required(&format!("{}_DEST", prefix))?,
                gateway: get(&format!("{}_GATEWAY", prefix)),
            });
        }

        let relay = RelayConfig {
            tick_interval_ms: or_default(get("RELAYER_TICK_INTERVAL_MS"), default_tick_interval()),
            max_retries: or_default(get("RELAYER_MAX_RETRIES"), default_max_retries()),
            submission_timeout_ms: or_default(
                get("RELAYER_SUBMISSION_TIMEOUT_MS"),
                default_submission_timeout(),
            ),
            initial_backoff_ms: or_default(
                get("RELAYER_INITIAL_BACKOFF_MS"),
                default_initial_backoff(),
            ),
            max_backoff_ms: or_default(get("RELAYER_MAX_BACKOFF_MS"), default_max_backoff()),
            backoff_multiplier: or_default(
                get("RELAYER_BACKOFF_MULTIPLIER"),
                default_backoff_multiplier(),
            ),
            max_block_range: or_default(get("RELAYER_MAX_BLOCK_RANGE"), default_max_block_range()),
        };

        let config = Config {
            private_key: required("RELAYER_PRIVATE_KEY")?,
            chains,
            routes,
            relay,
            api_addr: get("RELAYER_API_ADDR").unwrap_or_else(default_api_addr),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.private_key.len() != 66
            || !self.private_key.starts_with("0x")
            || !self.private_key[2..].chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(eyre!("RELAYER_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"));
        }

        if self.chains.len() < 2 {
            return Err(eyre!("At least two chains must be configured"));
        }
        let mut names = HashSet::new();
        for chain in &self.chains {
            if chain.name.trim().is_empty() {
                return Err(eyre!("Chain names cannot be empty"));
            }
            if !names.insert(chain.name.as_str()) {
                return Err(eyre!("Duplicate chain name: {}", chain.name));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("Chain {} has no RPC URL", chain.name));
            }
            if !is_hex_address(&chain.gateway_address) {
                return Err(eyre!(
                    "Invalid gateway address for chain {}: {} (expected 42 chars with 0x prefix)",
                    chain.name,
                    chain.gateway_address
                ));
            }
            if chain.poll_interval_ms == 0 {
                return Err(eyre!("Chain {} poll interval must be positive", chain.name));
            }
        }

        if self.routes.is_empty() {
            return Err(eyre!("At least one route must be configured"));
        }
        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            for name in [&route.source, &route.dest] {
                if !names.contains(name.as_str()) {
                    return Err(eyre!(
                        "Route {} -> {} references unknown chain {}",
                        route.source,
                        route.dest,
                        name
                    ));
                }
            }
            if route.source == route.dest {
                return Err(eyre!("Route from {} to itself", route.source));
            }
            if let Some(gateway) = &route.gateway {
                if !is_hex_address(gateway) {
                    return Err(eyre!(
                        "Invalid gateway address for route {} -> {}: {}",
                        route.source,
                        route.dest,
                        gateway
                    ));
                }
            }
            if !seen_routes.insert((route.source.as_str(), route.dest.as_str())) {
                return Err(eyre!("Duplicate route {} -> {}", route.source, route.dest));
            }
        }

        if self.relay.tick_interval_ms == 0 {
            return Err(eyre!("RELAYER_TICK_INTERVAL_MS must be positive"));
        }
        if self.relay.submission_timeout_ms == 0 {
            return Err(eyre!("RELAYER_SUBMISSION_TIMEOUT_MS must be positive"));
        }
        if self.relay.max_block_range == 0 {
            return Err(eyre!("RELAYER_MAX_BLOCK_RANGE must be positive"));
        }
        if self.relay.backoff_multiplier < 1.0 {
            return Err(eyre!("RELAYER_BACKOFF_MULTIPLIER cannot be below 1.0"));
        }

        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.name == name)
    }

    /// Relay routes with gateways resolved
    pub fn resolved_routes(&self) -> Result<Vec<Route>> {
        self.routes
            .iter()
            .map(|route| {
                let source = self
                    .chain(&route.source)
                    .ok_or_else(|| eyre!("Unknown route source {}", route.source))?;
                let gateway = route.gateway.as_deref().unwrap_or(&source.gateway_address);
                Ok(Route {
                    source: ChainId::new(route.source.clone()),
                    dest: ChainId::new(route.dest.clone()),
                    gateway: Address::from_str(gateway)
                        .wrap_err_with(|| format!("Invalid gateway address {}", gateway))?,
                })
            })
            .collect()
    }

    /// Gateways whose events are watched on `chain`
    pub fn watched_gateways(&self, chain: &str) -> Result<Vec<Address>> {
        let mut gateways: Vec<Address> = self
            .resolved_routes()?
            .into_iter()
            .filter(|route| route.source.as_str() == chain)
            .map(|route| route.gateway)
            .collect();
        gateways.sort();
        gateways.dedup();
        Ok(gateways)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            tick_interval: Duration::from_millis(self.relay.tick_interval_ms),
            max_block_range: self.relay.max_block_range,
            dispatch: DispatchConfig {
                retry: RetryConfig {
                    max_retries: self.relay.max_retries,
                    initial_backoff: Duration::from_millis(self.relay.initial_backoff_ms),
                    max_backoff: Duration::from_millis(self.relay.max_backoff_ms),
                    backoff_multiplier: self.relay.backoff_multiplier,
                },
                submission_timeout: Duration::from_millis(self.relay.submission_timeout_ms),
            },
        }
    }
}
