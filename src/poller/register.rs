//! Periodic CPU register dumps.
//!
//! Every pass stores each live VM's `info registers` output as
//! `<debugdir>/vm_register_<vm>_<pid>/NNNN_<timestamp>`.

use super::{BackgroundTask, StopSignal};
use crate::config::Params;
use crate::env::Environment;
use crate::error::Result;
use crate::testrun::TestRun;
use crate::vm::Vm;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Thread name of the register poller.
pub const TASK_NAME: &str = "vm-register";

/// Local time formatted as `%Y-%m-%d-%H-%M-%S`.
pub fn local_timestamp() -> String {
    // SAFETY: time(NULL) only returns the current time.
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    // SAFETY: tm is plain data; localtime_r fills it and returns NULL on failure.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    if unsafe { libc::localtime_r(&now, &mut tm) }.is_null() {
        return now.to_string();
    }
    format!(
        "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

/// Write `vm`'s register state to `<prefix>_<timestamp>`.
///
/// Returns the file written, or `None` when the registers could not be
/// queried.
pub fn store_vm_register(vm: &dyn Vm, prefix: &Path) -> Result<Option<PathBuf>> {
    let output = match vm.query_registers() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(vm = %vm.name(), error = %e, "cannot query registers");
            return Ok(None);
        }
    };

    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{}", local_timestamp()));
    let path = PathBuf::from(name);
    std::fs::write(&path, output)?;
    Ok(Some(path))
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Files written.
    pub stored: Vec<PathBuf>,
    /// VMs a "not alive" warning was logged for.
    pub warned: Vec<String>,
}

/// Register dump state for one poller run.
pub struct RegisterPoller {
    test: Arc<TestRun>,
    env: Arc<Environment>,
    delay: Duration,
    /// Next file number by VM instance.
    sequence: HashMap<String, u32>,
    /// Current run of consecutive misses by VM instance.
    streak: HashMap<String, u32>,
    /// All misses by VM instance.
    misses: BTreeMap<String, u32>,
}

impl RegisterPoller {
    /// Create a poller; `vm_register_delay` defaults to 5 s.
    pub fn new(params: &Params, test: Arc<TestRun>, env: Arc<Environment>) -> Result<Self> {
        Ok(Self {
            test,
            env,
            delay: params.get_secs("vm_register_delay", 5.0)?,
            sequence: HashMap::new(),
            streak: HashMap::new(),
            misses: BTreeMap::new(),
        })
    }

    /// Dump every VM once.
    pub fn poll_once(&mut self) -> PassReport {
        let mut report = PassReport::default();
        for vm in self.env.get_all_vms() {
            self.poll_vm(vm.as_ref(), &mut report);
        }
        report
    }

    fn poll_vm(&mut self, vm: &dyn Vm, report: &mut PassReport) {
        let instance = vm.instance();
        let streak = self.streak.entry(instance.clone()).or_insert(0);
        self.misses.entry(instance.clone()).or_insert(0);

        if !vm.is_alive() {
            if *streak == 0 {
                tracing::warn!(vm = %vm.name(), "vm is not alive, can't query the register status");
                report.warned.push(vm.name().to_string());
            }
            *streak += 1;
            *self.misses.entry(instance).or_insert(0) += 1;
            return;
        }

        if *streak > 0 {
            tracing::debug!(
                vm = %vm.name(),
                misses = *streak,
                "vm alive now, register info was unavailable before"
            );
            *streak = 0;
        }

        let pid = vm
            .pid()
            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
        let dir = self
            .test
            .debugdir()
            .join(format!("vm_register_{}_{}", vm.name(), pid));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(vm = %vm.name(), error = %e, "cannot create register dir");
            return;
        }

        let sequence = self.sequence.entry(instance).or_insert(1);
        let prefix = dir.join(format!("{:04}", *sequence));
        match store_vm_register(vm, &prefix) {
            Ok(Some(path)) => {
                *sequence += 1;
                report.stored.push(path);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(vm = %vm.name(), error = %e, "cannot store registers"),
        }
    }

    /// Exit summary naming every VM instance that was ever missed.
    pub fn summary(&self) -> Option<String> {
        let mut msg = String::from("Thread quit.");
        let mut any = false;
        for (instance, count) in self.misses.iter().filter(|(_, count)| **count > 0) {
            msg.push_str(&format!(
                " Failed to get register info from guest {} for {} times.",
                instance, count
            ));
            any = true;
        }
        any.then_some(msg)
    }

    /// Dump until `signal` asks to stop, then log the summary.
    pub fn run(mut self, signal: Arc<StopSignal>) {
        loop {
            self.poll_once();
            if signal.should_exit(self.delay) {
                break;
            }
        }
        if let Some(summary) = self.summary() {
            tracing::debug!("{}", summary);
        }
    }
}

/// Start the register poller on a background thread.
pub fn spawn(params: &Params, test: Arc<TestRun>, env: Arc<Environment>) -> Result<BackgroundTask> {
    let poller = RegisterPoller::new(params, test, env)?;
    Ok(BackgroundTask::spawn(TASK_NAME, move |signal| poller.run(signal))?)
}
