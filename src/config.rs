//! Gateway configuration

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Operation resolution mode.
///
/// In `Dynamic` mode GraphQL operations are synthesized from RPC method names
/// the first time a method is invoked. In `Predefined` mode every operation is
/// loaded from a collection directory at startup and methods without a bound
/// operation fail the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dynamic,
    Predefined,
}

/// Configuration for the bridge.
///
/// `services_dir` and `graphql_endpoint` are mandatory; everything else has a
/// serviceable default. The struct deserializes from a config file but is
/// usually filled in through [`crate::GatewayBuilder`].
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Directory holding one subdirectory per service, each with a
    /// `service.proto` (and optionally a lockfile and mapping file)
    pub services_dir: PathBuf,

    /// Upstream GraphQL HTTP endpoint
    pub graphql_endpoint: String,

    /// Listen address for the inbound RPC listener
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Per-request deadline; merged with any inbound deadline by `min`
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Maximum inbound body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum concurrently handled requests; past it requests are rejected
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Operation resolution mode
    #[serde(default)]
    pub mode: Mode,

    /// Collection directory with `.graphql` documents, predefined mode only
    #[serde(default)]
    pub operations_dir: Option<PathBuf>,

    /// Accept unknown fields in JSON payloads instead of rejecting them
    #[serde(default)]
    pub permissive_fields: bool,

    /// Upstream connection pool size per host
    #[serde(default = "default_pool_size")]
    pub upstream_pool_size: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:4011".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_pool_size() -> usize {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::new(),
            graphql_endpoint: String::new(),
            listen_addr: default_listen_addr(),
            request_timeout: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_in_flight: default_max_in_flight(),
            mode: Mode::Dynamic,
            operations_dir: None,
            permissive_fields: false,
            upstream_pool_size: default_pool_size(),
        }
    }
}

impl GatewayConfig {
    /// Check that the mandatory options are present and coherent.
    pub fn validate(&self) -> Result<()> {
        if self.services_dir.as_os_str().is_empty() {
            return Err(Error::Config("services_dir is required".into()));
        }
        if self.graphql_endpoint.is_empty() {
            return Err(Error::Config("graphql_endpoint is required".into()));
        }
        reqwest::Url::parse(&self.graphql_endpoint)
            .map_err(|e| Error::Config(format!("graphql_endpoint is not a valid URL: {e}")))?;
        if self.mode == Mode::Predefined && self.operations_dir.is_none() {
            return Err(Error::Config(
                "operations_dir is required in predefined mode".into(),
            ));
        }
        if self.max_body_bytes == 0 || self.max_in_flight == 0 {
            return Err(Error::Config(
                "max_body_bytes and max_in_flight must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
