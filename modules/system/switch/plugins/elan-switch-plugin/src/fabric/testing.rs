//! Scripted fabric for unit tests. Records every call and replays queued
//! results.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{FabricError, QswFabric, TaskSignal};
use crate::domain::jobinfo::ElanJobInfo;

#[derive(Default)]
pub struct ScriptedFabric {
    hosts: Vec<(String, u32)>,
    calls: Mutex<Vec<String>>,
    init_error: Mutex<Option<FabricError>>,
    register: Mutex<VecDeque<Result<(), FabricError>>>,
    destroy: Mutex<VecDeque<Result<(), FabricError>>>,
    prog_init_error: Mutex<Option<FabricError>>,
    failing_loads: Vec<u32>,
    ignore_cancel: bool,
    release: CancellationToken,
}

impl ScriptedFabric {
    #[must_use]
    pub fn with_hosts(hosts: &[(&str, u32)]) -> Self {
        Self {
            hosts: hosts.iter().map(|&(h, id)| (h.to_owned(), id)).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail_init(self, err: FabricError) -> Self {
        *self.init_error.lock() = Some(err);
        self
    }

    #[must_use]
    pub fn fail_load(mut self, node_id: u32) -> Self {
        self.failing_loads.push(node_id);
        self
    }

    #[must_use]
    pub fn fail_prog_init(self, err: FabricError) -> Self {
        *self.prog_init_error.lock() = Some(err);
        self
    }

    #[must_use]
    pub fn script_register(self, results: Vec<Result<(), FabricError>>) -> Self {
        self.register.lock().extend(results);
        self
    }

    #[must_use]
    pub fn script_destroy(self, results: Vec<Result<(), FabricError>>) -> Self {
        self.destroy.lock().extend(results);
        self
    }

    /// Make `run_neterr_svc` block until [`ScriptedFabric::release`].
    #[must_use]
    pub fn ignore_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn release(&self) {
        self.release.cancel();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

fn prognum(jobinfo: &ElanJobInfo) -> u32 {
    jobinfo.step().map_or(0, |s| s.prognum)
}

impl QswFabric for ScriptedFabric {
    fn max_node_id(&self) -> Option<u32> {
        self.hosts.iter().map(|&(_, id)| id).max()
    }

    fn node_id_by_host(&self, host: &str) -> Option<u32> {
        self.hosts.iter().find(|(h, _)| h == host).map(|&(_, id)| id)
    }

    fn host_by_node_id(&self, node_id: u32) -> Option<String> {
        self.hosts
            .iter()
            .find(|&&(_, id)| id == node_id)
            .map(|(h, _)| h.clone())
    }

    fn prog_init(&self, jobinfo: &ElanJobInfo, uid: u32) -> Result<(), FabricError> {
        self.record(format!("prog_init {} {uid}", prognum(jobinfo)));
        self.prog_init_error.lock().take().map_or(Ok(()), Err)
    }

    fn prog_fini(&self, jobinfo: &ElanJobInfo) {
        self.record(format!("prog_fini {}", prognum(jobinfo)));
    }

    fn set_capability(
        &self,
        jobinfo: &ElanJobInfo,
        proc_id: u32,
        pid: u32,
    ) -> Result<(), FabricError> {
        self.record(format!("set_cap {} {proc_id} {pid}", prognum(jobinfo)));
        Ok(())
    }

    fn prg_destroy(&self, prognum: u32) -> Result<(), FabricError> {
        self.record(format!("destroy {prognum}"));
        self.destroy.lock().pop_front().unwrap_or(Ok(()))
    }

    fn prg_signal(&self, prognum: u32, signal: TaskSignal) -> Result<(), FabricError> {
        self.record(format!("signal {prognum} {signal}"));
        Ok(())
    }

    fn init_neterr_svc(&self) -> Result<(), FabricError> {
        self.record("init".to_owned());
        self.init_error.lock().take().map_or(Ok(()), Err)
    }

    fn load_neterr_svc(&self, node_id: u32, host: &str) -> Result<(), FabricError> {
        self.record(format!("load {node_id} {host}"));
        if self.failing_loads.contains(&node_id) {
            return Err(FabricError::Rejected(format!("node {node_id}")));
        }
        Ok(())
    }

    fn register_neterr_svc(&self) -> Result<(), FabricError> {
        self.record("register".to_owned());
        self.register.lock().pop_front().unwrap_or(Ok(()))
    }

    fn run_neterr_svc(&self, cancel: &CancellationToken) -> Result<(), FabricError> {
        self.record("run".to_owned());
        loop {
            if self.release.is_cancelled() || (cancel.is_cancelled() && !self.ignore_cancel) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}
