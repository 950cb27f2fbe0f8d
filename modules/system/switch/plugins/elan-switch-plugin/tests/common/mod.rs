#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Common helpers for elan-switch-plugin integration tests

use std::path::Path;

use elan_switch_plugin::ElanSwitchConfig;
use elan_switch_plugin::config::HostEntry;

/// Config for a three node cluster `n1..n3` with node IDs `1..3`, the
/// resolver endpoint inside `dir` and short timings.
pub fn cluster_config(dir: &Path) -> ElanSwitchConfig {
    let mut config = ElanSwitchConfig {
        max_tasks: 64,
        hosts: (1..=3)
            .map(|id| HostEntry {
                name: format!("n{id}"),
                node_id: id,
            })
            .collect(),
        ..ElanSwitchConfig::default()
    };
    config.neterr.socket_path = dir.join("neterr.sock");
    config.neterr.poll_interval_ms = 5;
    config.neterr.cancel_grace_ms = 2_000;
    config.reaper.backoff_unit_ms = 20;
    config
}
