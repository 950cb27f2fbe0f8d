#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Step teardown against real local processes

mod common;

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use common::cluster_config;
use elan_switch_plugin::domain::reaper::{ReapPolicy, reap};
use elan_switch_plugin::fabric::{LoopbackFabric, QswFabric, TaskSignal};
use elan_switch_plugin::{ElanJobInfo, ElanSwitch, ElanSwitchConfig};
use switch_sdk::{HostList, PlacementMode, SwitchError, SwitchPluginClient};

const UNIT: Duration = Duration::from_millis(20);

/// Child that ignores `SIGTERM`. Returns once the trap is installed.
fn spawn_term_ignoring() -> Child {
    let mut child = Command::new("sh")
        .args(["-c", "trap '' TERM; echo ready; exec sleep 30"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line.trim(), "ready");
    child
}

fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .unwrap()
}

/// Reap the child as soon as it dies so it does not linger as a zombie.
fn waiter(mut child: Child) -> JoinHandle<()> {
    std::thread::spawn(move || {
        child.wait().unwrap();
    })
}

struct Step {
    plugin: ElanSwitch,
    fabric: Arc<LoopbackFabric>,
    jobinfo: ElanJobInfo,
    prognum: u32,
}

fn step(config: ElanSwitchConfig, nprocs: u32) -> Step {
    let fabric = Arc::new(LoopbackFabric::new(&config));
    let plugin = ElanSwitch::with_fabric(config, fabric.clone());
    plugin.libstate_restore(None).unwrap();

    let mut jobinfo = plugin.alloc_jobinfo();
    plugin
        .build_jobinfo(&mut jobinfo, &HostList::from_iter(["n1"]), nprocs, PlacementMode::Block)
        .unwrap();
    plugin.job_init(&jobinfo, 1000).unwrap();
    let prognum = jobinfo.step().unwrap().prognum;
    Step {
        plugin,
        fabric,
        jobinfo,
        prognum,
    }
}

#[test]
fn escalates_from_terminate_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let step = step(cluster_config(dir.path()), 2);

    let children = [spawn_term_ignoring(), spawn_term_ignoring()];
    for (proc_id, child) in (0u32..).zip(&children) {
        step.fabric
            .set_capability(&step.jobinfo, proc_id, child.id())
            .unwrap();
    }
    let waiters: Vec<_> = children.into_iter().map(waiter).collect();

    let policy = ReapPolicy {
        backoff_unit: UNIT,
        max_attempts: None,
    };
    let report = reap(step.fabric.as_ref(), step.prognum, &policy).unwrap();
    for handle in waiters {
        handle.join().unwrap();
    }

    let escalations = &report.escalations;
    assert!(escalations.len() >= 2, "{escalations:?}");
    assert_eq!(escalations[0].signal, TaskSignal::Terminate);
    assert_eq!(escalations[0].sleep, UNIT);
    assert_eq!(escalations[1].signal, TaskSignal::Kill);
    assert_eq!(escalations[1].sleep, UNIT * 2);
    assert!(escalations[2..].iter().all(|e| e.signal == TaskSignal::Kill));
    assert!(!step.fabric.has_program(step.prognum));
}

#[test]
fn postfini_terminates_leftover_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let step = step(cluster_config(dir.path()), 1);

    let child = spawn_sleeper();
    step.fabric
        .set_capability(&step.jobinfo, 0, child.id())
        .unwrap();
    let waiter = waiter(child);

    step.plugin.job_fini(&step.jobinfo).unwrap();
    step.plugin
        .job_postfini(&step.jobinfo, 0, 17, 0)
        .unwrap();
    waiter.join().unwrap();
    assert!(!step.fabric.has_program(step.prognum));
    assert!(step.fabric.attached_pids(step.prognum).is_empty());
}

#[test]
fn postfini_without_processes_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let step = step(cluster_config(dir.path()), 1);

    step.plugin
        .job_postfini(&step.jobinfo, 0, 17, 0)
        .unwrap();
    assert!(!step.fabric.has_program(step.prognum));

    // A second teardown of the same step finds nothing to do.
    step.plugin
        .job_postfini(&step.jobinfo, 0, 17, 0)
        .unwrap();
}

#[test]
fn capped_reaper_reports_stubborn_processes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cluster_config(dir.path());
    config.reaper.max_attempts = Some(1);
    let step = step(config, 1);

    let child = spawn_term_ignoring();
    step.fabric
        .set_capability(&step.jobinfo, 0, child.id())
        .unwrap();
    let waiter = waiter(child);

    let err = step
        .plugin
        .job_postfini(&step.jobinfo, 0, 17, 0)
        .unwrap_err();
    assert!(matches!(err, SwitchError::StubbornProcesses { attempts: 1 }));
    assert_eq!(step.fabric.attached_pids(step.prognum).len(), 1);

    step.fabric
        .prg_signal(step.prognum, TaskSignal::Kill)
        .unwrap();
    waiter.join().unwrap();
    step.fabric.prg_destroy(step.prognum).unwrap();
}
