//! Test fixture orchestration.
//!
//! A [`Fixture`] owns everything one test run sets up around the test body:
//! running background pollers, the pending kernel command line patch and the
//! private bridge. [`Fixture::preprocess`] brings the host, images and VMs
//! into the state the parameters ask for; [`Fixture::postprocess`] reverts
//! it, collecting failures so that independent cleanup steps all run.

mod postprocess;
mod preprocess;

use crate::codec::{ImageCodec, VideoEncoder};
use crate::config::Params;
use crate::env::Environment;
use crate::error::Result;
use crate::host::{BridgeConfig, HostSetup};
use crate::kernel::{GuestDiskOpener, KernelPatch};
use crate::poller::BackgroundTask;
use crate::scheduler::process_images;
use crate::storage::image::{postprocess_image, prepare_image};
use crate::storage::{ImageBackend, ImageSpec, StorageProvider};
use crate::testrun::TestRun;
use crate::vm::lifecycle::{postprocess_vm, preprocess_vm};
use crate::vm::ProcessStatus;
use std::sync::Arc;

/// External services the fixture drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Image backend.
    pub images: Arc<dyn ImageBackend>,
    /// iSCSI/LVM/NFS storage.
    pub storage: Arc<dyn StorageProvider>,
    /// Host setup.
    pub host: Arc<dyn HostSetup>,
    /// Guest image editor for kernel command line patches.
    pub disks: Arc<dyn GuestDiskOpener>,
    /// Screen capture codec.
    pub codec: Arc<dyn ImageCodec>,
    /// Video encoder, if available.
    pub video: Option<Arc<dyn VideoEncoder>>,
}

/// Processing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the test: images first, then VMs.
    Preprocess,
    /// After the test: VMs first, then images.
    Postprocess,
}

/// Run the image and VM actions of `phase` for everything in `params`.
///
/// Images are processed per VM with that VM's scoped parameters. A running
/// VM is paused while its images are processed and resumed afterwards, even
/// on failure; leaked clusters found meanwhile are only warned about.
/// `skip_image_processing=yes` skips the image actions.
pub fn process(
    test: &TestRun,
    params: &Params,
    env: &Environment,
    images: &dyn ImageBackend,
    phase: Phase,
) -> Result<()> {
    if phase == Phase::Preprocess {
        process_all_images(params, env, images, phase)?;
    }

    for name in params.objects("vms") {
        let vm_params = params.object_params(&name);
        match phase {
            Phase::Preprocess => preprocess_vm(test, &vm_params, env, &name)?,
            Phase::Postprocess => postprocess_vm(&vm_params, env, &name)?,
        }
    }

    if phase == Phase::Postprocess {
        process_all_images(params, env, images, phase)?;
    }
    Ok(())
}

fn process_all_images(
    params: &Params,
    env: &Environment,
    backend: &dyn ImageBackend,
    phase: Phase,
) -> Result<()> {
    if params.is_yes("skip_image_processing") {
        return Ok(());
    }

    let action = |name: &str, image_params: &Params, status: Option<ProcessStatus>| {
        let image = ImageSpec::from_params(name, image_params.clone());
        match phase {
            Phase::Preprocess => prepare_image(backend, &image),
            Phase::Postprocess => postprocess_image(backend, &image, status),
        }
    };

    let vms = params.objects("vms");
    if vms.is_empty() {
        return process_images(params, None, action);
    }

    for name in vms {
        let mut vm_params = params.object_params(&name);
        let vm = env.get_vm(&name);
        let status = match &vm {
            Some(vm) if !vm.is_dead() => ProcessStatus::Running,
            _ => ProcessStatus::Dead,
        };

        let paused = match &vm {
            Some(vm) if vm.is_alive() && !vm.is_paused() => {
                vm.pause()?;
                vm_params.set("skip_cluster_leak_warn", "yes");
                Some(vm)
            }
            _ => None,
        };

        let result = process_images(&vm_params, Some(status), action);

        if let Some(vm) = paused {
            if let Err(e) = vm.resume() {
                tracing::warn!(vm = %name, error = %e, "failed to resume vm after image processing");
            }
        }
        result?;
    }
    Ok(())
}

/// Orchestration state of one test run.
pub struct Fixture {
    test: Arc<TestRun>,
    env: Arc<Environment>,
    services: Collaborators,
    screendump: Option<BackgroundTask>,
    register: Option<BackgroundTask>,
    kernel_patch: Option<KernelPatch>,
    bridge: Option<BridgeConfig>,
}

impl Fixture {
    /// Create the fixture for a test run.
    pub fn new(test: Arc<TestRun>, env: Arc<Environment>, services: Collaborators) -> Self {
        Self {
            test,
            env,
            services,
            screendump: None,
            register: None,
            kernel_patch: None,
            bridge: None,
        }
    }

    /// The test run.
    pub fn test(&self) -> &Arc<TestRun> {
        &self.test
    }

    /// The environment registry.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Kernel entry change waiting to be reverted.
    pub fn kernel_patch(&self) -> Option<&KernelPatch> {
        self.kernel_patch.as_ref()
    }

    /// Private bridge set up for the test.
    pub fn bridge(&self) -> Option<&BridgeConfig> {
        self.bridge.as_ref()
    }

    /// Names of the running pollers.
    pub fn running_pollers(&self) -> Vec<&str> {
        [&self.screendump, &self.register]
            .into_iter()
            .flatten()
            .filter(|task| task.is_running())
            .map(|task| task.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeImageBackend, FakeVmFactory};
    use crate::vm::{Vm, VmStatus};

    fn env() -> (Arc<FakeVmFactory>, Environment) {
        let factory = Arc::new(FakeVmFactory::default());
        let env = Environment::new(factory.clone());
        (factory, env)
    }

    #[test]
    fn test_images_without_vms_use_top_level_params() {
        let dir = tempfile::tempdir().unwrap();
        let (_, env) = env();
        let test = TestRun::new(dir.path(), dir.path(), 1);
        let backend = FakeImageBackend::default();
        let params: Params = [
            ("images", "image1 stg"),
            ("force_create_image", "yes"),
            ("images_base_dir", dir.path().to_str().unwrap()),
            ("image_name_stg", "storage"),
        ]
        .into_iter()
        .collect();

        process(&test, &params, &env, &backend, Phase::Preprocess).unwrap();
        assert_eq!(
            backend.calls(),
            vec!["prepare image1", "create image1", "prepare stg", "create stg"]
        );
        assert!(dir.path().join("storage.qcow2").exists());
    }

    #[test]
    fn test_running_vm_is_paused_for_image_processing() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, env) = env();
        let test = TestRun::new(dir.path(), dir.path(), 1);
        let vm = factory.vm_for(&env, "vm1");
        vm.set_status(VmStatus::Running);

        let backend = FakeImageBackend::default();
        backend.fail_check("Leaked clusters: 4");
        std::fs::write(dir.path().join("image.qcow2"), b"").unwrap();
        backend.set_info("lazy refcounts: false");
        let params: Params = [
            ("vms", "vm1"),
            ("images", "image1"),
            ("check_image", "yes"),
            ("images_base_dir", dir.path().to_str().unwrap()),
        ]
        .into_iter()
        .collect();

        // Leaked clusters are swallowed while the VM was paused.
        process(&test, &params, &env, &backend, Phase::Postprocess).unwrap();
        assert_eq!(vm.pause_calls(), 1);
        assert_eq!(vm.status(), VmStatus::Running);
        assert!(backend.calls().contains(&"check image1".to_string()));
    }

    #[test]
    fn test_vm_resumed_when_images_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, env) = env();
        let test = TestRun::new(dir.path(), dir.path(), 1);
        let vm = factory.vm_for(&env, "vm1");
        vm.set_status(VmStatus::Running);

        let backend = FakeImageBackend::default();
        backend.fail_prepare();
        backend.fail_create();
        let params: Params = [
            ("vms", "vm1"),
            ("images", "image1"),
            ("force_create_image", "yes"),
            ("images_base_dir", dir.path().to_str().unwrap()),
        ]
        .into_iter()
        .collect();

        assert!(process(&test, &params, &env, &backend, Phase::Preprocess).is_err());
        assert_eq!(vm.status(), VmStatus::Running);
        // The VM phase never ran.
        assert!(vm.create_requests().is_empty());
    }

    #[test]
    fn test_postprocess_runs_vms_before_images() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, env) = env();
        let test = TestRun::new(dir.path(), dir.path(), 1);
        let vm = factory.vm_for(&env, "vm1");
        vm.set_status(VmStatus::Running);

        let backend = FakeImageBackend::default();
        let params: Params = [
            ("vms", "vm1"),
            ("images", "image1"),
            ("kill_vm", "yes"),
            ("remove_image", "yes"),
            ("images_base_dir", dir.path().to_str().unwrap()),
        ]
        .into_iter()
        .collect();

        process(&test, &params, &env, &backend, Phase::Postprocess).unwrap();
        // Killed first, so the image phase saw a dead VM and did not pause it.
        assert!(vm.is_dead());
        assert_eq!(vm.pause_calls(), 0);
        assert_eq!(backend.calls(), vec!["remove image1"]);
    }

    #[test]
    fn test_skip_image_processing() {
        let dir = tempfile::tempdir().unwrap();
        let (_, env) = env();
        let test = TestRun::new(dir.path(), dir.path(), 1);
        let backend = FakeImageBackend::default();
        let params: Params = [
            ("images", "image1"),
            ("force_create_image", "yes"),
            ("skip_image_processing", "yes"),
        ]
        .into_iter()
        .collect();

        process(&test, &params, &env, &backend, Phase::Preprocess).unwrap();
        assert!(backend.calls().is_empty());
    }
}
