//! Elan Switch Plugin
//!
//! Switch plugin for Quadrics Elan (`QsNet`) interconnects. On the controller
//! it builds per-step capability descriptors and keeps the allocation state
//! that must survive restarts; on compute nodes it runs the network error
//! resolver, programs capabilities and tears down leftover step processes.
//!
//! All hardware access goes through [`fabric::QswFabric`]. On Unix the
//! bundled [`fabric::LoopbackFabric`] drives the local host.
//!
//! ## Configuration
//!
//! ```yaml
//! state_file: qsw_state
//! max_tasks: 16384
//! context_range:
//!   low: 32
//!   high: 2047
//! env_prefix: RMS_
//! control_device: /dev/elan3/control0
//! hosts:
//!   - name: n1
//!     node_id: 1
//! reaper:
//!   backoff_unit_ms: 1000
//!   max_attempts: 8
//! neterr:
//!   socket_path: /var/run/qsw-neterr.sock
//!   cancel_grace_ms: 500
//!   poll_interval_ms: 100
//! ```
//!
//! Every key may be overridden from the environment, e.g.
//! `ELAN_SWITCH_REAPER__MAX_ATTEMPTS=8`.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod domain;
pub mod fabric;
pub mod plugin;

pub use config::ElanSwitchConfig;
pub use domain::jobinfo::ElanJobInfo;
pub use domain::neterr::ResolverState;
pub use plugin::{ElanSwitch, PLUGIN_NAME, PLUGIN_TYPE, PLUGIN_VERSION};
