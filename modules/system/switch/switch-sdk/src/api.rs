//! Plugin API trait for interconnect switch implementations.
//!
//! The workload manager drives every switch plugin through this trait. The
//! per-step descriptor is an associated type, so each interconnect keeps its
//! own strongly typed capability record and callers never see a raw handle.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::error::SwitchError;
use crate::models::{HostList, PlacementMode, PluginInfo, TaskIdentity};

/// Plugin API trait for switch implementations.
///
/// Node-side operations (`node_*`, `job_*`) run inside the node daemon;
/// descriptor building and library state run inside the controller. Both
/// share one plugin value per process.
pub trait SwitchPluginClient: Send + Sync {
    /// Per-step capability descriptor.
    type JobInfo: Clone + fmt::Debug + PartialEq + Send;

    /// Plugin identification for the loader.
    fn plugin_info(&self) -> PluginInfo;

    /// Prepare the node for interconnect use. Blocks until the fault
    /// resolver has either started or failed.
    ///
    /// # Errors
    ///
    /// - `NodeInit` if the fault resolver could not be registered
    fn node_init(&self) -> Result<(), SwitchError>;

    /// Called just before the node daemon exits.
    ///
    /// # Errors
    ///
    /// Implementations log cancellation problems instead of failing.
    fn node_fini(&self) -> Result<(), SwitchError>;

    /// Fresh, unbuilt descriptor.
    fn alloc_jobinfo(&self) -> Self::JobInfo;

    /// Fill `jobinfo` for a step running `nprocs` processes on `hosts`.
    ///
    /// # Errors
    ///
    /// - `BadTaskCount` if `nprocs` is zero, above the hardware maximum, or
    ///   smaller than the number of nodes
    /// - `InterconnectResolution` naming every host without a node ID
    /// - `StateNotInitialized` / `ResourcesExhausted` from library state
    fn build_jobinfo(
        &self,
        jobinfo: &mut Self::JobInfo,
        hosts: &HostList,
        nprocs: u32,
        placement: PlacementMode,
    ) -> Result<(), SwitchError>;

    /// Independent copy of `jobinfo`.
    fn copy_jobinfo(&self, jobinfo: &Self::JobInfo) -> Self::JobInfo;

    /// Release `jobinfo` and the allocation it holds.
    fn free_jobinfo(&self, jobinfo: Self::JobInfo);

    /// Append the wire form of `jobinfo` to `buf`.
    ///
    /// # Errors
    ///
    /// - `Internal` if the descriptor cannot be encoded
    fn pack_jobinfo(&self, jobinfo: &Self::JobInfo, buf: &mut BytesMut)
    -> Result<(), SwitchError>;

    /// Read one packed descriptor from the front of `buf` into `jobinfo`.
    ///
    /// # Errors
    ///
    /// - `MalformedDescriptor` on truncated or inconsistent input
    fn unpack_jobinfo(&self, jobinfo: &mut Self::JobInfo, buf: &mut Bytes)
    -> Result<(), SwitchError>;

    /// Human-readable capability string. Diagnostics only.
    fn format_jobinfo(&self, jobinfo: &Self::JobInfo) -> String;

    /// Write the global allocation state under `dir`.
    ///
    /// # Errors
    ///
    /// - `StateSave` on I/O failure
    /// - `StateNotInitialized` if there is no state to save
    fn libstate_save(&self, dir: &Path) -> Result<(), SwitchError>;

    /// Load the global allocation state from `dir`, or start clean when
    /// `dir` is `None` or holds no usable recovery file.
    ///
    /// # Errors
    ///
    /// - `StateRestore` if the recovery file exists but cannot be read
    ///
    /// Missing or corrupt files are not errors; implementations fall back to
    /// fresh state.
    fn libstate_restore(&self, dir: Option<&Path>) -> Result<(), SwitchError>;

    /// Drop the in-memory allocation state. The recovery file is kept.
    fn libstate_teardown(&self);

    /// Whether steps must be placed on a contiguous node range.
    fn no_frag(&self) -> bool;

    /// Hook run before the step's privileges are dropped.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn job_preinit(&self, jobinfo: &Self::JobInfo) -> Result<(), SwitchError>;

    /// Program the local interconnect for the step owned by `uid`.
    ///
    /// # Errors
    ///
    /// - `InterconnectProgram` when the hardware rejects the capability
    fn job_init(&self, jobinfo: &Self::JobInfo, uid: u32) -> Result<(), SwitchError>;

    /// Undo `job_init` once the step's tasks have exited.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn job_fini(&self, jobinfo: &Self::JobInfo) -> Result<(), SwitchError>;

    /// Make sure no process remains bound to the step's interconnect context.
    ///
    /// # Errors
    ///
    /// - `StubbornProcesses` if a configured kill-attempt cap was reached
    fn job_postfini(
        &self,
        jobinfo: &Self::JobInfo,
        pgid: u32,
        job_id: u32,
        step_id: u32,
    ) -> Result<(), SwitchError>;

    /// Install the capability for one task and export its identity into
    /// `env` before the task executes.
    ///
    /// # Errors
    ///
    /// - `InterconnectProgram` when the capability cannot be set
    fn job_attach(
        &self,
        jobinfo: &Self::JobInfo,
        env: &mut HashMap<String, String>,
        task: &TaskIdentity,
    ) -> Result<(), SwitchError>;
}
