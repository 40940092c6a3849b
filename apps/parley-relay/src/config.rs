use std::env;
use std::time::Duration;

use crate::cli::ServeArgs;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// First connection id; `None` seeds from the wall clock.
    pub id_seed: Option<u64>,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env::var("PARLEY_RELAY_HOST")
                .ok()
                .filter(|host| !host.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: env::var("PARLEY_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            id_seed: env::var("PARLEY_RELAY_ID_SEED")
                .ok()
                .and_then(|seed| seed.parse().ok()),
            shutdown_grace: Duration::from_secs(
                env::var("PARLEY_RELAY_SHUTDOWN_GRACE_SECS")
                    .ok()
                    .and_then(|secs| secs.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
        }
    }

    /// Command-line flags win over the environment.
    pub fn with_overrides(mut self, args: &ServeArgs) -> Self {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(seed) = args.id_seed {
            self.id_seed = Some(seed);
        }
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            id_seed: None,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}
