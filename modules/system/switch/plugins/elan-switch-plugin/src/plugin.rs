//! Elan implementation of [`SwitchPluginClient`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use switch_sdk::{
    HostList, PlacementMode, PluginInfo, SwitchError, SwitchPluginClient, TaskIdentity,
};
use tracing::{debug, error, info, warn};

use crate::config::ElanSwitchConfig;
use crate::domain::error::NeterrError;
use crate::domain::jobinfo::{ElanJobInfo, program_failure};
use crate::domain::libstate::{Allocation, LibraryState};
use crate::domain::neterr::{FaultResolver, ResolverState};
use crate::domain::nodeset::NodeSetBuilder;
use crate::domain::reaper::{ReapPolicy, reap};
use crate::domain::recovery::{self, RestoreOutcome};
use crate::fabric::QswFabric;

pub const PLUGIN_NAME: &str = "switch Quadrics Elan3 or Elan4 plugin";
pub const PLUGIN_TYPE: &str = "switch/elan";
pub const PLUGIN_VERSION: u32 = 90;

/// Switch plugin for Quadrics Elan interconnects.
///
/// Holds the process-wide allocation state and the fault resolver, so one
/// value serves either the controller or a node daemon.
pub struct ElanSwitch {
    config: ElanSwitchConfig,
    fabric: Arc<dyn QswFabric>,
    libstate: Mutex<Option<LibraryState>>,
    resolver: FaultResolver,
}

impl ElanSwitch {
    /// Plugin driving the local host through [`crate::fabric::LoopbackFabric`].
    #[cfg(unix)]
    #[must_use]
    pub fn new(config: ElanSwitchConfig) -> Self {
        let fabric = Arc::new(crate::fabric::LoopbackFabric::new(&config));
        Self::with_fabric(config, fabric)
    }

    #[must_use]
    pub fn with_fabric(config: ElanSwitchConfig, fabric: Arc<dyn QswFabric>) -> Self {
        let resolver = FaultResolver::new(config.neterr.cancel_grace());
        Self {
            config,
            fabric,
            libstate: Mutex::new(None),
            resolver,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ElanSwitchConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver_state(&self) -> ResolverState {
        self.resolver.state()
    }

    /// Allocations held by live steps, or `None` before `libstate_restore`.
    #[must_use]
    pub fn outstanding_allocations(&self) -> Option<Vec<Allocation>> {
        self.libstate
            .lock()
            .as_ref()
            .map(|state| state.outstanding().copied().collect())
    }

    /// Every node ID the fabric can name, for the fault service.
    fn known_nodes(&self) -> Vec<(u32, String)> {
        let Some(max) = self.fabric.max_node_id() else {
            return Vec::new();
        };
        (0..=max)
            .filter_map(|id| self.fabric.host_by_node_id(id).map(|host| (id, host)))
            .collect()
    }

    fn release(&self, allocation: &Allocation) {
        if let Some(state) = self.libstate.lock().as_mut() {
            state.release(allocation);
        }
    }
}

impl SwitchPluginClient for ElanSwitch {
    type JobInfo = ElanJobInfo;

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME,
            plugin_type: PLUGIN_TYPE,
            version: PLUGIN_VERSION,
        }
    }

    fn node_init(&self) -> Result<(), SwitchError> {
        let nodes = self.known_nodes();
        debug!(nodes = nodes.len(), "starting fault resolver");
        self.resolver.start(Arc::clone(&self.fabric), &nodes)?;
        Ok(())
    }

    fn node_fini(&self) -> Result<(), SwitchError> {
        match self.resolver.cancel() {
            Ok(()) => info!("fault resolver cancelled"),
            Err(NeterrError::NotRunning) => debug!("fault resolver was not running"),
            Err(e) => warn!(error = %e, "unable to cancel fault resolver"),
        }
        Ok(())
    }

    fn alloc_jobinfo(&self) -> ElanJobInfo {
        ElanJobInfo::default()
    }

    fn build_jobinfo(
        &self,
        jobinfo: &mut ElanJobInfo,
        hosts: &HostList,
        nprocs: u32,
        placement: PlacementMode,
    ) -> Result<(), SwitchError> {
        let nodeset = NodeSetBuilder::new(self.fabric.as_ref(), self.config.max_tasks)
            .build(hosts, nprocs)?;

        let mut guard = self.libstate.lock();
        let state = guard.as_mut().ok_or(SwitchError::StateNotInitialized)?;
        let built = ElanJobInfo::allocate(nprocs, nodeset, placement, state)?;
        if let Some((previous, true)) = jobinfo.take() {
            state.release(&previous.allocation());
        }
        *jobinfo = built;
        Ok(())
    }

    fn copy_jobinfo(&self, jobinfo: &ElanJobInfo) -> ElanJobInfo {
        jobinfo.clone()
    }

    fn free_jobinfo(&self, mut jobinfo: ElanJobInfo) {
        if let Some((step, true)) = jobinfo.take() {
            self.release(&step.allocation());
        }
    }

    fn pack_jobinfo(&self, jobinfo: &ElanJobInfo, buf: &mut BytesMut) -> Result<(), SwitchError> {
        jobinfo.pack(buf)?;
        Ok(())
    }

    fn unpack_jobinfo(&self, jobinfo: &mut ElanJobInfo, buf: &mut Bytes) -> Result<(), SwitchError> {
        *jobinfo = ElanJobInfo::unpack(buf)?;
        Ok(())
    }

    fn format_jobinfo(&self, jobinfo: &ElanJobInfo) -> String {
        jobinfo.to_string()
    }

    fn libstate_save(&self, dir: &Path) -> Result<(), SwitchError> {
        let guard = self.libstate.lock();
        let state = guard.as_ref().ok_or(SwitchError::StateNotInitialized)?;
        recovery::save(state, dir, &self.config.state_file).map_err(|e| {
            error!(error = %e, "can't save switch state");
            SwitchError::StateSave(e.to_string())
        })
    }

    fn libstate_restore(&self, dir: Option<&Path>) -> Result<(), SwitchError> {
        let contexts = self.config.context_range;
        let state = match dir {
            None => {
                info!("starting switch with clean state");
                LibraryState::fresh(contexts)
            }
            Some(dir) => {
                let (state, outcome) = recovery::restore(dir, &self.config.state_file, contexts)
                    .map_err(|e| {
                        error!(error = %e, "can't read switch state");
                        SwitchError::StateRestore(e.to_string())
                    })?;
                if let RestoreOutcome::Discarded(reason) = &outcome {
                    warn!(reason = %reason, "starting switch with clean state");
                }
                state
            }
        };
        *self.libstate.lock() = Some(state);
        Ok(())
    }

    fn libstate_teardown(&self) {
        if self.libstate.lock().take().is_some() {
            debug!("switch state released");
        }
    }

    fn no_frag(&self) -> bool {
        true
    }

    fn job_preinit(&self, _jobinfo: &ElanJobInfo) -> Result<(), SwitchError> {
        Ok(())
    }

    fn job_init(&self, jobinfo: &ElanJobInfo, uid: u32) -> Result<(), SwitchError> {
        debug!(pid = std::process::id(), "programming interconnect");
        info!(capability = %jobinfo, "elan capability");
        jobinfo
            .program_local(self.fabric.as_ref(), uid)
            .inspect_err(|e| error!(error = %e, capability = %jobinfo, "interconnect init failed"))
    }

    fn job_fini(&self, jobinfo: &ElanJobInfo) -> Result<(), SwitchError> {
        jobinfo.built()?;
        self.fabric.prog_fini(jobinfo);
        Ok(())
    }

    fn job_postfini(
        &self,
        jobinfo: &ElanJobInfo,
        pgid: u32,
        job_id: u32,
        step_id: u32,
    ) -> Result<(), SwitchError> {
        let prognum = jobinfo.built()?.prognum;
        let policy = ReapPolicy::from(&self.config.reaper);
        match reap(self.fabric.as_ref(), prognum, &policy) {
            Ok(report) => {
                if !report.escalations.is_empty() {
                    info!(
                        job_id,
                        step_id,
                        pgid,
                        prognum,
                        rounds = report.escalations.len(),
                        "killed processes left attached to step"
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!(job_id, step_id, pgid, prognum, error = %e, "step teardown failed");
                Err(e.into())
            }
        }
    }

    fn job_attach(
        &self,
        jobinfo: &ElanJobInfo,
        env: &mut HashMap<String, String>,
        task: &TaskIdentity,
    ) -> Result<(), SwitchError> {
        debug!(
            node_id = task.node_id,
            node_count = task.node_count,
            proc_id = task.proc_id,
            proc_count = task.proc_count,
            rank = task.rank,
            "attaching task"
        );
        jobinfo.built()?;
        let pid = std::process::id();
        self.fabric
            .set_capability(jobinfo, task.proc_id, pid)
            .map_err(|e| {
                error!(pid, error = %e, "can't set capability");
                program_failure(&e)
            })?;

        let prefix = &self.config.env_prefix;
        for (name, value) in [
            ("RANK", task.rank),
            ("NODEID", task.node_id),
            ("PROCID", task.proc_id),
            ("NNODES", task.node_count),
            ("NPROCS", task.proc_count),
        ] {
            env.insert(format!("{prefix}{name}"), value.to_string());
        }
        Ok(())
    }
}
