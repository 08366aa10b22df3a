//! Precedence resolution for serve settings and the overseer identity.
//!
//! ## Serve Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Environment (`GT_HOST`, `GT_PORT`, `GT_POLL_INTERVAL`)
//! 3. `serve` node of `mayor/town.kdl`
//! 4. Built-in defaults
//!
//! ## Overseer
//!
//! `overseer` node of `town.kdl`, else the `USER` environment variable.

use crate::config::schema::{OverseerConfig, ServeConfig};
use std::time::Duration;

pub const HOST_ENV: &str = "GT_HOST";
pub const PORT_ENV: &str = "GT_PORT";
pub const POLL_INTERVAL_ENV: &str = "GT_POLL_INTERVAL";
pub const USER_ENV: &str = "USER";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll intervals below this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from `mayor/town.kdl`
    TownConfig,
    /// Value from CLI flag
    CliFlag,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::TownConfig => write!(f, "town.kdl"),
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// CLI overrides for `gt serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub poll_interval_secs: Option<u64>,
}

/// Fully resolved serve settings with source tracking.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub host: Resolved<String>,
    pub port: Resolved<u16>,
    pub poll_interval: Resolved<Duration>,
}

impl ServeSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host.value, self.port.value)
    }
}

fn env_value<F>(env: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn clamp_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).max(MIN_POLL_INTERVAL)
}

/// Resolve serve settings from the process environment.
pub fn resolve_serve(config: &ServeConfig, overrides: &ServeOverrides) -> ServeSettings {
    resolve_serve_with_env(config, overrides, |name| std::env::var(name).ok())
}

/// Resolve serve settings with an explicit environment lookup.
///
/// Unparsable environment values are skipped with a warning.
pub fn resolve_serve_with_env<F>(
    config: &ServeConfig,
    overrides: &ServeOverrides,
    env: F,
) -> ServeSettings
where
    F: Fn(&str) -> Option<String>,
{
    let host = if let Some(ref host) = overrides.host {
        Resolved::new(host.clone(), ValueSource::CliFlag)
    } else if let Some(host) = env_value(&env, HOST_ENV) {
        Resolved::new(host, ValueSource::EnvVar(HOST_ENV.to_string()))
    } else if let Some(ref host) = config.host {
        Resolved::new(host.clone(), ValueSource::TownConfig)
    } else {
        Resolved::new(DEFAULT_HOST.to_string(), ValueSource::Default)
    };

    let env_port = env_value(&env, PORT_ENV).and_then(|v| match v.parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!(value = %v, "ignoring invalid {}", PORT_ENV);
            None
        }
    });
    let port = if let Some(port) = overrides.port {
        Resolved::new(port, ValueSource::CliFlag)
    } else if let Some(port) = env_port {
        Resolved::new(port, ValueSource::EnvVar(PORT_ENV.to_string()))
    } else if let Some(port) = config.port {
        Resolved::new(port, ValueSource::TownConfig)
    } else {
        Resolved::new(DEFAULT_PORT, ValueSource::Default)
    };

    let env_interval = env_value(&env, POLL_INTERVAL_ENV).and_then(|v| match v.parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(value = %v, "ignoring invalid {}", POLL_INTERVAL_ENV);
            None
        }
    });
    let poll_interval = if let Some(secs) = overrides.poll_interval_secs {
        Resolved::new(clamp_interval(secs), ValueSource::CliFlag)
    } else if let Some(secs) = env_interval {
        Resolved::new(
            clamp_interval(secs),
            ValueSource::EnvVar(POLL_INTERVAL_ENV.to_string()),
        )
    } else if let Some(secs) = config.poll_interval_secs {
        Resolved::new(clamp_interval(secs), ValueSource::TownConfig)
    } else {
        Resolved::new(DEFAULT_POLL_INTERVAL, ValueSource::Default)
    };

    ServeSettings {
        host,
        port,
        poll_interval,
    }
}

/// Resolve the overseer identity from the process environment.
pub fn resolve_overseer(config: Option<&OverseerConfig>) -> Option<Resolved<OverseerConfig>> {
    resolve_overseer_with_env(config, |name| std::env::var(name).ok())
}

pub fn resolve_overseer_with_env<F>(
    config: Option<&OverseerConfig>,
    env: F,
) -> Option<Resolved<OverseerConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(overseer) = config.filter(|o| !o.is_empty()) {
        return Some(Resolved::new(overseer.clone(), ValueSource::TownConfig));
    }
    env_value(&env, USER_ENV).map(|user| {
        Resolved::new(
            OverseerConfig {
                name: Some(user.clone()),
                email: None,
                username: Some(user),
            },
            ValueSource::EnvVar(USER_ENV.to_string()),
        )
    })
}
