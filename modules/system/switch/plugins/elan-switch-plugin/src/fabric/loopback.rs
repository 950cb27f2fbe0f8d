//! Fabric backed by the local host instead of Elan hardware.
//!
//! Program descriptions are tracked in memory and processes bound to them are
//! real local PIDs, signalled with `kill(2)`. The fault resolver endpoint is a
//! Unix domain socket; each line received on it is a fault report of the form
//! `<node_id> <text>`.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FabricError, QswFabric, TaskSignal};
use crate::config::ElanSwitchConfig;
use crate::domain::jobinfo::ElanJobInfo;

#[derive(Debug)]
struct Program {
    uid: u32,
    nprocs: u32,
    capable: bool,
    /// Task index to PID.
    pids: BTreeMap<u32, u32>,
}

pub struct LoopbackFabric {
    node_ids: HashMap<String, u32>,
    control_device: Option<PathBuf>,
    socket_path: PathBuf,
    poll_interval: Duration,
    programs: Mutex<HashMap<u32, Program>>,
    neterr_names: Mutex<BTreeMap<u32, String>>,
    listener: Mutex<Option<UnixListener>>,
}

impl LoopbackFabric {
    #[must_use]
    pub fn new(config: &ElanSwitchConfig) -> Self {
        Self {
            node_ids: config
                .hosts
                .iter()
                .map(|h| (h.name.clone(), h.node_id))
                .collect(),
            control_device: config.control_device.clone(),
            socket_path: config.neterr.socket_path.clone(),
            poll_interval: config.neterr.poll_interval(),
            programs: Mutex::new(HashMap::new()),
            neterr_names: Mutex::new(BTreeMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// PIDs bound to `prognum`, ordered by task.
    #[must_use]
    pub fn attached_pids(&self, prognum: u32) -> Vec<u32> {
        self.programs
            .lock()
            .get(&prognum)
            .map(|p| p.pids.values().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_program(&self, prognum: u32) -> bool {
        self.programs.lock().contains_key(&prognum)
    }

    fn serve(&self, listener: &UnixListener, cancel: &CancellationToken) -> Result<(), FabricError> {
        listener.set_nonblocking(true)?;
        while !cancel.is_cancelled() {
            match listener.accept() {
                Ok((stream, _)) => self.read_reports(stream, cancel),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_reports(&self, stream: UnixStream, cancel: &CancellationToken) {
        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(self.poll_interval)))
        {
            warn!(error = %e, "can't configure fault report connection");
            return;
        }
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while !cancel.is_cancelled() {
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => {
                    self.log_report(line.trim_end());
                    line.clear();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!(error = %e, "fault report connection failed");
                    return;
                }
            }
        }
    }

    fn log_report(&self, report: &str) {
        let (node, text) = report.split_once(' ').unwrap_or((report, ""));
        let Ok(node_id) = node.parse::<u32>() else {
            warn!(report, "malformed fault report");
            return;
        };
        let host = self.neterr_names.lock().get(&node_id).cloned();
        warn!(
            node_id,
            host = host.as_deref().unwrap_or("unknown"),
            report = text,
            "interconnect fault reported"
        );
    }
}

fn pid_of(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().map(Pid::from_raw)
}

fn bind_error(e: std::io::Error) -> FabricError {
    if e.kind() == ErrorKind::AddrInUse {
        FabricError::AddressInUse
    } else {
        FabricError::Io(e)
    }
}

/// Zombies count as alive until their parent reaps them.
fn is_alive(pid: u32) -> bool {
    let Some(pid) = pid_of(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl QswFabric for LoopbackFabric {
    fn max_node_id(&self) -> Option<u32> {
        self.node_ids.values().copied().max()
    }

    fn node_id_by_host(&self, host: &str) -> Option<u32> {
        self.node_ids.get(host).copied()
    }

    fn host_by_node_id(&self, node_id: u32) -> Option<String> {
        self.node_ids
            .iter()
            .find(|&(_, &id)| id == node_id)
            .map(|(host, _)| host.clone())
    }

    fn prog_init(&self, jobinfo: &ElanJobInfo, uid: u32) -> Result<(), FabricError> {
        if let Some(device) = &self.control_device
            && !device.exists()
        {
            return Err(FabricError::DeviceUnavailable(format!(
                "{}: no such device",
                device.display()
            )));
        }
        let step = jobinfo
            .step()
            .ok_or_else(|| FabricError::Rejected("descriptor has not been built".to_owned()))?;

        let mut programs = self.programs.lock();
        let program = programs.entry(step.prognum).or_insert_with(|| Program {
            uid,
            nprocs: step.nprocs,
            capable: false,
            pids: BTreeMap::new(),
        });
        if program.uid != uid {
            return Err(FabricError::Rejected(format!(
                "program description {} belongs to uid {}",
                step.prognum, program.uid
            )));
        }
        program.capable = true;
        debug!(prognum = step.prognum, uid, "installed capability");
        Ok(())
    }

    fn prog_fini(&self, jobinfo: &ElanJobInfo) {
        let Some(step) = jobinfo.step() else {
            return;
        };
        if let Some(program) = self.programs.lock().get_mut(&step.prognum) {
            program.capable = false;
            debug!(prognum = step.prognum, "removed capability");
        }
    }

    fn set_capability(
        &self,
        jobinfo: &ElanJobInfo,
        proc_id: u32,
        pid: u32,
    ) -> Result<(), FabricError> {
        let step = jobinfo
            .step()
            .ok_or_else(|| FabricError::Rejected("descriptor has not been built".to_owned()))?;
        let mut programs = self.programs.lock();
        let program = programs
            .get_mut(&step.prognum)
            .ok_or(FabricError::UnknownProgram(step.prognum))?;
        if !program.capable {
            return Err(FabricError::Rejected(format!(
                "capability of program description {} was removed",
                step.prognum
            )));
        }
        if proc_id >= program.nprocs {
            return Err(FabricError::Rejected(format!(
                "process {proc_id} outside a step of {} processes",
                program.nprocs
            )));
        }
        program.pids.insert(proc_id, pid);
        Ok(())
    }

    fn prg_destroy(&self, prognum: u32) -> Result<(), FabricError> {
        let mut programs = self.programs.lock();
        let program = programs
            .get_mut(&prognum)
            .ok_or(FabricError::UnknownProgram(prognum))?;
        program.pids.retain(|_, pid| is_alive(*pid));
        if !program.pids.is_empty() {
            return Err(FabricError::ChildrenAttached { prognum });
        }
        programs.remove(&prognum);
        debug!(prognum, "destroyed program description");
        Ok(())
    }

    fn prg_signal(&self, prognum: u32, signal: TaskSignal) -> Result<(), FabricError> {
        let pids = {
            let programs = self.programs.lock();
            let program = programs
                .get(&prognum)
                .ok_or(FabricError::UnknownProgram(prognum))?;
            program.pids.values().copied().collect::<Vec<_>>()
        };
        let signal = match signal {
            TaskSignal::Terminate => Signal::SIGTERM,
            TaskSignal::Kill => Signal::SIGKILL,
        };
        for pid in pids.into_iter().filter_map(pid_of) {
            match kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
        Ok(())
    }

    fn init_neterr_svc(&self) -> Result<(), FabricError> {
        match self.socket_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.is_dir() => Err(FabricError::Io(
                std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("{} is not a directory", dir.display()),
                ),
            )),
            _ => Ok(()),
        }
    }

    fn load_neterr_svc(&self, node_id: u32, host: &str) -> Result<(), FabricError> {
        self.neterr_names.lock().insert(node_id, host.to_owned());
        Ok(())
    }

    fn register_neterr_svc(&self) -> Result<(), FabricError> {
        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                // A crashed resolver leaves its socket file behind; only a
                // path that still accepts connections is owned by someone.
                match UnixStream::connect(&self.socket_path) {
                    Ok(_) => return Err(FabricError::AddressInUse),
                    Err(e) if e.kind() == ErrorKind::ConnectionRefused => {}
                    Err(e) => return Err(FabricError::Io(e)),
                }
                warn!(path = %self.socket_path.display(), "removing stale fault resolver endpoint");
                std::fs::remove_file(&self.socket_path)?;
                UnixListener::bind(&self.socket_path).map_err(bind_error)?
            }
            Err(e) => return Err(FabricError::Io(e)),
        };
        info!(path = %self.socket_path.display(), "fault resolver endpoint bound");
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn run_neterr_svc(&self, cancel: &CancellationToken) -> Result<(), FabricError> {
        let Some(listener) = self.listener.lock().take() else {
            // Another resolver owns the endpoint.
            while !cancel.is_cancelled() {
                std::thread::sleep(self.poll_interval);
            }
            return Ok(());
        };
        let result = self.serve(&listener, cancel);
        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "can't remove fault resolver endpoint");
        }
        result
    }
}
