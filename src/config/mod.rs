use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{GatewayError, GatewayResult};
use crate::topology::{GraphDescription, RoutingTarget};

// host:port, where host is an IPv4 address, a bracketed IPv6 address or a DNS name
static ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9.-]+):\d{1,5}$")
        .expect("Invalid regex pattern for deployment address")
});

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_routing"))]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub gateway: Gateway,

    #[serde(default)]
    pub graph: GraphDescription,

    #[validate(custom(function = "Config::validate_deployments"))]
    #[serde(default)]
    pub deployments: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub routing: BTreeMap<String, RoutingTarget>,

    #[validate(nested)]
    #[serde(default)]
    pub pool: Pool,

    #[serde(default)]
    pub log: Log,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> GatewayResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).map_err(|e| {
            GatewayError::Configuration(format!("Unable to read conf file from {path}: {e}"))
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> GatewayResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> GatewayResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate_deployments(
        deployments: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), ValidationError> {
        for (name, addresses) in deployments {
            if name.is_empty() {
                return Err(ValidationError::new("deployment_name_required"));
            }
            for address in addresses {
                if !ADDRESS_REGEX.is_match(address) {
                    let mut err = ValidationError::new("invalid_deployment_address");
                    err.add_param("address".into(), &address.to_string());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn validate_routing(&self) -> Result<(), ValidationError> {
        for (node, target) in &self.routing {
            if target.deployment.is_empty() {
                let mut err = ValidationError::new("routing_deployment_required");
                err.add_param("node".into(), node);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Validates a single `host:port` replica address.
pub fn validate_address(address: &str) -> GatewayResult<()> {
    if ADDRESS_REGEX.is_match(address) {
        Ok(())
    } else {
        Err(GatewayError::Configuration(format!(
            "invalid deployment address '{address}', expected host:port"
        )))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    #[serde(default = "Gateway::default_name")]
    pub name: String,
    /// Deadline for every remote call, in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "Gateway::default_timeout_send")]
    pub timeout_send_ms: u64,
    /// Upper bound of requests in flight for one request stream
    #[validate(range(min = 1))]
    #[serde(default = "Gateway::default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "Gateway::default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            timeout_send_ms: Self::default_timeout_send(),
            prefetch: Self::default_prefetch(),
            shutdown_grace_ms: Self::default_shutdown_grace(),
        }
    }
}

impl Gateway {
    fn default_name() -> String {
        "gateway".to_string()
    }

    fn default_timeout_send() -> u64 {
        10_000
    }

    fn default_prefetch() -> usize {
        1000
    }

    fn default_shutdown_grace() -> u64 {
        5_000
    }

    pub fn timeout_send(&self) -> Duration {
        Duration::from_millis(self.timeout_send_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Pool {
    /// Retries after the first attempt of a send
    #[serde(default = "Pool::default_retries")]
    pub retries: u32,
    #[validate(nested)]
    #[serde(default)]
    pub backoff: Backoff,
    /// Time after which an unhealthy replica may be tried again by live traffic
    #[serde(default = "Pool::default_unhealthy_cooldown")]
    pub unhealthy_cooldown_ms: u64,
    /// Interval of the active health check of unhealthy replicas; disabled when absent
    pub health_check_interval_ms: Option<u64>,
    #[validate(range(min = 1))]
    #[serde(default = "Pool::default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    /// Bound on how long `close` waits for in-flight sends
    #[serde(default = "Pool::default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            retries: Self::default_retries(),
            backoff: Backoff::default(),
            unhealthy_cooldown_ms: Self::default_unhealthy_cooldown(),
            health_check_interval_ms: None,
            health_check_timeout_ms: Self::default_health_check_timeout(),
            drain_timeout_ms: Self::default_drain_timeout(),
        }
    }
}

impl Pool {
    fn default_retries() -> u32 {
        3
    }

    fn default_unhealthy_cooldown() -> u64 {
        5_000
    }

    fn default_health_check_timeout() -> u64 {
        1_000
    }

    fn default_drain_timeout() -> u64 {
        5_000
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_millis(self.unhealthy_cooldown_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Backoff::validate_bounds"))]
pub struct Backoff {
    #[serde(default = "Backoff::default_initial")]
    pub initial_ms: u64,
    #[serde(default = "Backoff::default_max")]
    pub max_ms: u64,
    #[validate(range(min = 1.0))]
    #[serde(default = "Backoff::default_multiplier")]
    pub multiplier: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default = "Backoff::default_jitter")]
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial(),
            max_ms: Self::default_max(),
            multiplier: Self::default_multiplier(),
            jitter: Self::default_jitter(),
        }
    }
}

impl Backoff {
    fn default_initial() -> u64 {
        50
    }

    fn default_max() -> u64 {
        1_000
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_jitter() -> f64 {
        0.1
    }

    fn validate_bounds(&self) -> Result<(), ValidationError> {
        if self.initial_ms > self.max_ms {
            Err(ValidationError::new("backoff_initial_exceeds_max"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "Log::default_level")]
    pub level: String,
    pub path: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            path: None,
        }
    }
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }
}
