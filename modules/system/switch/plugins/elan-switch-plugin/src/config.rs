//! Configuration for the Elan switch plugin.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for configuration overrides, e.g.
/// `ELAN_SWITCH_REAPER__MAX_ATTEMPTS=8`.
pub const ENV_PREFIX: &str = "ELAN_SWITCH_";

/// Maximum number of virtual processes an Elan capability can describe.
pub const ELAN_MAX_VPS: u32 = 16_384;

/// First hardware context available to user programs.
pub const ELAN_USER_BASE_CONTEXT: u32 = 0x020;

/// Last hardware context available to user programs.
pub const ELAN_USER_TOP_CONTEXT: u32 = 0x7ff;

/// Plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElanSwitchConfig {
    /// File name of the recovery file inside the state directory.
    pub state_file: String,

    /// Hardware task capacity; also the node bitmap capacity.
    pub max_tasks: u32,

    /// Hardware contexts handed out to steps.
    pub context_range: ContextRange,

    /// Prefix of the identity variables exported to each task.
    pub env_prefix: String,

    /// Control device of the interconnect driver. When set, programming a
    /// capability fails with a missing-kernel-module cause if it is absent.
    pub control_device: Option<PathBuf>,

    /// Hostname to interconnect node ID table.
    pub hosts: Vec<HostEntry>,

    pub reaper: ReaperConfig,

    pub neterr: NeterrConfig,
}

impl Default for ElanSwitchConfig {
    fn default() -> Self {
        Self {
            state_file: "qsw_state".to_owned(),
            max_tasks: ELAN_MAX_VPS,
            context_range: ContextRange::default(),
            env_prefix: "RMS_".to_owned(),
            control_device: None,
            hosts: Vec::new(),
            reaper: ReaperConfig::default(),
            neterr: NeterrConfig::default(),
        }
    }
}

impl ElanSwitchConfig {
    /// Load configuration from defaults, an optional YAML file and
    /// `ELAN_SWITCH_*` environment overrides, in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns a figment error if a source cannot be parsed or a value has
    /// the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<figment::Error>> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)
    }
}

/// Inclusive range of hardware context numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextRange {
    pub low: u32,
    pub high: u32,
}

impl Default for ContextRange {
    fn default() -> Self {
        Self {
            low: ELAN_USER_BASE_CONTEXT,
            high: ELAN_USER_TOP_CONTEXT,
        }
    }
}

/// One line of the host table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub name: String,
    pub node_id: u32,
}

/// Process reaper tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    /// First back-off interval; each later interval doubles.
    pub backoff_unit_ms: u64,

    /// Give up after this many failed destroy attempts. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            backoff_unit_ms: 1_000,
            max_attempts: None,
        }
    }
}

impl ReaperConfig {
    #[must_use]
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

/// Fault resolver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NeterrConfig {
    /// Endpoint the fault resolver registers on.
    pub socket_path: PathBuf,

    /// How long `node_fini` waits for the worker to acknowledge a stop.
    pub cancel_grace_ms: u64,

    /// How often the service loop checks for a stop request.
    pub poll_interval_ms: u64,
}

impl Default for NeterrConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/qsw-neterr.sock"),
            cancel_grace_ms: 500,
            poll_interval_ms: 100,
        }
    }
}

impl NeterrConfig {
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
