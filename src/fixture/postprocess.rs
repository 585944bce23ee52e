use super::{process, Fixture, Phase};
use crate::artifacts::harvest_screendumps;
use crate::config::Params;
use crate::error::{Error, Result};
use crate::host::command::HookCommand;
use crate::host::Tuning;
use crate::kernel::restore_kernel_patch;
use crate::poller::{BackgroundTask, JOIN_TIMEOUT};
use crate::storage::StorageKind;
use crate::vm::{Vm, VmType};
use std::fmt::Display;

/// Failures of independent cleanup steps, reported together at the end.
#[derive(Debug, Default)]
struct Failures(String);

impl Failures {
    fn record(&mut self, label: &str, err: impl Display) {
        tracing::error!(step = label, error = %err, "postprocess step failed");
        let message = err.to_string().replace('\n', "\n  ");
        self.0.push_str(&format!("\n{}: {}", label, message));
    }

    fn check<T>(&mut self, label: &str, result: Result<T>) {
        if let Err(e) = result {
            self.record(label, e);
        }
    }

    fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Postprocess(self.0))
        }
    }
}

fn stop_task(task: Option<BackgroundTask>) {
    if let Some(task) = task {
        task.stop(JOIN_TIMEOUT);
    }
}

impl Fixture {
    /// Revert what [`Fixture::preprocess`] set up.
    ///
    /// Every cleanup step runs even when an earlier one failed; failures are
    /// collected into one [`Error::Postprocess`]. When nothing failed and
    /// `verify_host_dmesg` is not disabled, the host kernel log is checked
    /// last.
    pub fn postprocess(&mut self, params: Params) -> Result<()> {
        tracing::info!(test = %self.test.bindir().display(), "postprocessing");
        let mut failures = Failures::default();
        let vm_type = VmType::from_param(params.get("vm_type"));
        let host = std::sync::Arc::clone(&self.services.host);

        failures.check(
            "Postprocess",
            process(
                &self.test,
                &params,
                &self.env,
                self.services.images.as_ref(),
                Phase::Postprocess,
            ),
        );

        stop_task(self.screendump.take());
        stop_task(self.register.take());

        harvest_screendumps(
            &params,
            &self.test,
            self.services.codec.as_ref(),
            self.services.video.as_deref(),
        );

        if params.is_yes("kill_unresponsive_vms") {
            for vm in self.env.get_all_vms() {
                if vm.is_dead() || vm.is_paused() {
                    continue;
                }
                kill_if_unresponsive(vm.as_ref());
            }
        }

        for vm in self.env.get_all_vms() {
            if !vm.is_dead() && has_removed_image(&params, vm.name()) {
                tracing::debug!(vm = %vm.name(), "image of vm was removed, destroying it");
                if let Err(e) = vm.destroy(true) {
                    tracing::warn!(vm = %vm.name(), error = %e, "failed to destroy vm");
                }
            }
        }

        self.env.stop_tcpdump();
        host.kill_tail_threads();

        for vm in self.env.get_all_vms().into_iter().filter(|vm| vm.is_alive()) {
            for monitor in vm.monitors() {
                if let Err(e) = monitor.close() {
                    tracing::debug!(vm = %vm.name(), monitor = %monitor.name(), error = %e, "cannot close monitor");
                }
            }
            vm.cleanup_serial_console();
        }

        for tuning in [Tuning::HugePages, Tuning::TransparentHugePages, Tuning::Ksm, Tuning::Egd] {
            if !tuning.requested(&params) {
                continue;
            }
            if tuning == Tuning::Egd && !params.is_yes("kill_vm") {
                continue;
            }
            let label = format!("{} cleanup", tuning.label());
            let mut result = host.cleanup_tuning(tuning, &params);
            if result.is_ok() && tuning == Tuning::HugePages && vm_type == VmType::Libvirt {
                result = host.restart_libvirtd();
            }
            failures.check(&label, result);
        }

        if vm_type == VmType::Libvirt && Tuning::Polkit.requested(&params) {
            let result = host
                .cleanup_tuning(Tuning::Polkit, &params)
                .and_then(|()| host.restart_libvirtd());
            failures.check("Polkit cleanup", result);
        }

        if params.is_yes_or("restore_kernel_cmd", true) {
            if let Some(patch) = self.kernel_patch.take() {
                let result = restore_kernel_patch(self.services.disks.as_ref(), &patch, &self.env);
                if result.is_ok() {
                    tracing::debug!("restored the guest kernel command line after test");
                }
                failures.check("Kernel cmdline restore", result);
            }
        }

        match HookCommand::from_params(&params, "post") {
            Ok(Some(hook)) => failures.check("Postprocess command", hook.run(&params, self.test.bindir())),
            Ok(None) => {}
            Err(e) => failures.record("Postprocess command", e),
        }

        if let Some(kind) = StorageKind::from_params(&params) {
            let label = format!("{} cleanup", kind.label());
            failures.check(&label, self.cleanup_storage(kind, &params));
        }

        if let Some(bridge) = self.bridge.take() {
            failures.check("PB cleanup", host.cleanup_bridge(&bridge));
        }

        failures.into_result()?;

        if params.is_yes_or("verify_host_dmesg", true) {
            host.verify_host_dmesg()?;
        }
        Ok(())
    }

    /// Merge the `on_error` parameter view into `params` before
    /// postprocessing a failed test.
    pub fn postprocess_on_error(params: &mut Params) {
        let on_error = params.object_params("on_error");
        params.update(&on_error);
    }

    fn cleanup_storage(&self, kind: StorageKind, params: &Params) -> Result<()> {
        if kind == StorageKind::Lvm {
            let key = format!("lvm_{}", params.get_or("main_vm", ""));
            let result = self
                .env
                .with_lvmdev(&key, |device| device.cleanup())
                .unwrap_or_else(|| Err(Error::Storage(format!("no LVM device registered as {}", key))));
            self.env.unregister_lvmdev(&key);
            return result;
        }

        let base_dir = params.images_base_dir();
        let mut device = self.services.storage.device(kind, params, &base_dir)?;
        device.cleanup()
    }
}

/// Whether any image of VM `name` is marked `remove_image=yes`.
fn has_removed_image(params: &Params, name: &str) -> bool {
    params
        .object_params(name)
        .objects("images")
        .iter()
        .any(|image| params.object_params(image).is_yes("remove_image"))
}

/// Log into `vm`; destroy it when the login fails.
fn kill_if_unresponsive(vm: &dyn Vm) {
    let timeout = vm.login_timeout();
    let login = if vm.nic_count() > 0 {
        vm.wait_for_login(timeout)
    } else {
        vm.wait_for_serial_login(timeout)
    };

    match login {
        Ok(mut session) => {
            if let Err(e) = session.close() {
                tracing::debug!(vm = %vm.name(), error = %e, "failed to close login session");
            }
        }
        Err(e) => {
            tracing::warn!(vm = %vm.name(), error = %e, "vm is unresponsive, destroying it");
            if let Err(e) = vm.destroy(false) {
                tracing::warn!(vm = %vm.name(), error = %e, "failed to destroy unresponsive vm");
            }
        }
    }
}
