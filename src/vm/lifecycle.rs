//! Bringing a VM into its requested state before a test, and tearing it down
//! afterwards.

use super::cmdline::verify_kernel_cmdline;
use super::{normalize_connect_uri, CreateMode, CreateRequest, Vm, VmType};
use crate::config::Params;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::testrun::TestRun;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default time allowed for VM creation, in seconds.
pub const DEFAULT_CREATE_TIMEOUT_SECS: f64 = 20.0;

/// Test types allowed to run against a libvirt domain that does not exist yet.
const INSTALL_TEST_TYPES: &[&str] = &["unattended_install", "svirt_install"];

const INSTALL_TEST: &str = "unattended_install.import.import.default_install.aio_native";
const REMOVE_TEST: &str = "remove_guest.without_disk";

/// Poll interval while waiting for a VM to die on its own.
const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resolve the handle for `name`, creating one when it is unknown or its
/// libvirt connection changed.
fn resolve_vm(
    test: &TestRun,
    params: &Params,
    env: &Environment,
    name: &str,
    vm_type: &VmType,
) -> Result<Arc<dyn Vm>> {
    let existing = env.get_vm(name).filter(|vm| {
        if *vm_type != VmType::Libvirt {
            return true;
        }
        let wanted = normalize_connect_uri(params.get("connect_uri"));
        let current = vm.connect_uri();
        if current.as_deref() != Some(wanted.as_str()) {
            tracing::debug!(vm = %name, ?current, %wanted, "connect uri changed, recreating vm");
            return false;
        }
        true
    });

    match existing {
        Some(vm) => Ok(vm),
        None => env.create_vm(vm_type, params.get("target"), name, params, test.bindir()),
    }
}

/// Bring VM `name` into the state `params` asks for.
///
/// Creates or starts the VM when requested, restarts it when its running
/// configuration no longer matches, destroys it when `kill_vm_before_test`
/// applies, pauses it on request, and finally verifies the kernel command
/// line over serial when `check_kernel_cmd_line_from_serial=yes`.
pub fn preprocess_vm(test: &TestRun, params: &Params, env: &Environment, name: &str) -> Result<()> {
    let vm_type = VmType::from_param(params.get("vm_type"));
    let vm = resolve_vm(test, params, env, name, &vm_type)?;
    let test_type = params.get("type");
    let is_install = test_type.is_some_and(|t| INSTALL_TEST_TYPES.contains(&t));

    if vm_type == VmType::Libvirt && !vm.exists() && !is_install {
        let mut message = format!("Test VM {} does not exist.", name);
        if params.get("main_vm") == Some(name) {
            message.push_str(&format!(
                " Consider adding '{}' test as the first one and '{}' test as last one \
                 to remove the guest after testing",
                INSTALL_TEST, REMOVE_TEST
            ));
            return Err(Error::test_error(message));
        }
        return Err(Error::skip(message));
    }

    if params.is_yes("force_remove_vm") {
        tracing::info!(vm = %name, "removing vm definition");
        vm.remove()?;
    }

    let gracefully = params.is_yes("kill_vm_gracefully");
    let mut start_vm = false;
    let mut update_virtnet = false;

    if params.has("migration_mode") {
        start_vm = true;
    } else if params.is_yes("start_vm") {
        if !vm.is_alive() {
            start_vm = true;
        }
        if !vm_type.is_managed_externally()
            && params.is_yes_or("check_vm_needs_restart", true)
            && vm.needs_restart(name, params, test.bindir())
        {
            tracing::info!(vm = %name, "vm configuration changed, restarting");
            vm.destroy(gracefully)?;
            start_vm = true;
            update_virtnet = true;
        }
    }

    if start_vm {
        start(test, params, vm.as_ref(), name, &vm_type, test_type, update_virtnet)?;
    } else if !vm.is_alive() {
        vm.set_params(params);
    } else if params.is_yes("kill_vm_before_test") && params.get("start_vm") == Some("no") {
        tracing::info!(vm = %name, "killing vm before test");
        vm.destroy(gracefully)?;
    } else {
        vm.create_serial_console()?;
    }

    if params.is_yes("paused_after_start_vm") && vm.is_alive() && !vm.is_paused() {
        tracing::info!(vm = %name, "pausing vm after start");
        vm.pause()?;
    }

    if params.is_yes("check_kernel_cmd_line_from_serial") {
        verify_kernel_cmdline(vm.as_ref(), params)?;
    }

    Ok(())
}

fn start(
    test: &TestRun,
    params: &Params,
    vm: &dyn Vm,
    name: &str,
    vm_type: &VmType,
    test_type: Option<&str>,
    update_virtnet: bool,
) -> Result<()> {
    let started_externally = match vm_type {
        VmType::Libvirt => test_type != Some("unattended_install"),
        VmType::V2v => true,
        _ => false,
    };

    if started_externally {
        tracing::info!(vm = %name, vm_type = %vm_type, "starting vm");
        vm.set_params(params);
        return vm.start();
    }

    if update_virtnet {
        vm.update_vm_id();
        vm.regenerate_virtnet(params);
    }

    let mode = if params.get_or("reuse_previous_config", "no") == "no" {
        CreateMode::Fresh {
            name: name.to_string(),
            params: params.clone(),
            basedir: test.bindir().to_path_buf(),
        }
    } else {
        CreateMode::ReusePrevious
    };

    let request = CreateRequest {
        mode,
        timeout: params.get_secs("vm_create_timeout", DEFAULT_CREATE_TIMEOUT_SECS)?,
        migration_mode: params.get("migration_mode").map(str::to_string),
        migration_fd: params.get("migration_fd").map(str::to_string),
        migration_exec_cmd: params.get("migration_exec_cmd_dst").map(str::to_string),
    };

    tracing::info!(vm = %name, timeout = ?request.timeout, "creating vm");
    vm.create(&request)
}

/// Tear VM `name` down after the test.
///
/// Remote sessions are closed; sessions that fail to close stay attached.
/// With `kill_vm=yes` the VM is given `kill_vm_timeout` seconds to shut
/// down by itself before it is destroyed.
pub fn postprocess_vm(params: &Params, env: &Environment, name: &str) -> Result<()> {
    let Some(vm) = env.get_vm(name) else {
        return Ok(());
    };

    for mut session in vm.take_remote_sessions() {
        if let Err(e) = session.close() {
            tracing::debug!(vm = %name, error = %e, "failed to close remote session");
            vm.keep_remote_session(session);
        }
    }

    if params.is_yes("kill_vm") {
        let timeout = params.get_secs("kill_vm_timeout", 0.0)?;
        if !timeout.is_zero() {
            tracing::debug!(vm = %name, ?timeout, "waiting for vm to shut down");
            wait_for_death(vm.as_ref(), timeout);
        }
        tracing::debug!(vm = %name, "killing vm");
        vm.destroy(params.is_yes("kill_vm_gracefully"))?;
    }

    Ok(())
}

/// Wait until `vm` is dead or `timeout` elapses.
fn wait_for_death(vm: &dyn Vm, timeout: Duration) -> bool {
    // Unrepresentable deadlines mean waiting without limit.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if vm.is_dead() {
            return true;
        }
        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => return false,
            Some(deadline) => DEATH_POLL_INTERVAL.min(deadline - now),
            None => DEATH_POLL_INTERVAL,
        };
        std::thread::sleep(pause);
    }
}
