use super::{process, Fixture, Phase};
use crate::config::Params;
use crate::error::{Error, Result};
use crate::host::command::HookCommand;
use crate::host::{probe, BridgeConfig, Tuning};
use crate::kernel::apply_kernel_patch;
use crate::poller::{register, screendump};
use crate::storage::{ImageSpec, StorageKind};
use crate::vm::{normalize_connect_uri, VmType};
use std::path::Path;
use std::sync::Arc;

impl Fixture {
    /// Bring the host, images and VMs into the state `params` asks for.
    ///
    /// Returns the parameters with every derived key written back (bridge
    /// names, storage-backed image names, CPU model, memory size, kernel
    /// command line expectations, the merged VM list).
    pub fn preprocess(&mut self, mut params: Params) -> Result<Params> {
        tracing::info!(test = %self.test.bindir().display(), "preprocessing");

        if params.is_yes("requires_root") {
            probe::verify_running_as_root()?;
        }

        for command in params.objects("cmds_installed_host") {
            if probe::find_command(&command).is_none() {
                return Err(Error::skip(format!("Command '{}' could not be found", command)));
            }
        }

        let vm_type = VmType::from_param(params.get("vm_type"));

        self.setup_private_bridge(&mut params)?;
        self.setup_storage(&mut params)?;

        self.env.start_tcpdump(&params)?;

        let migrate_vms = params.objects("migrate_vms");
        if !migrate_vms.is_empty() {
            let mut vms = params.objects("vms");
            for vm in migrate_vms {
                if !vms.contains(&vm) {
                    vms.push(vm);
                }
            }
            params.set("vms", vms.join(" "));
        }

        let requested = params.objects("vms");
        for name in self.env.vm_names() {
            if requested.contains(&name) {
                continue;
            }
            if let Some(vm) = self.env.unregister_vm(&name) {
                tracing::debug!(vm = %name, "vm not requested by this test, destroying it");
                vm.destroy(true)?;
            }
        }

        if params.is_yes("auto_cpu_model") && vm_type == VmType::Qemu {
            let cpu_model = match self.env.get("cpu_model") {
                Some(model) => model,
                None => {
                    let model = self.services.host.best_cpu_model(&params)?;
                    self.env.set("cpu_model", model.as_str());
                    model
                }
            };
            params.set("cpu_model", cpu_model);
        }

        let versions = [
            ("kvm_version", probe::kvm_version(&params)),
            ("kvm_userspace_version", probe::kvm_userspace_version(&params)),
        ];
        for (key, version) in versions {
            tracing::debug!(key, version = %version, "recording hypervisor version");
            if let Err(e) = self.test.write_keyval(key, &version) {
                tracing::warn!(key, error = %e, "cannot record version");
            }
        }

        self.setup_tuning(&mut params, &vm_type)?;

        if vm_type == VmType::Libvirt {
            let uri = normalize_connect_uri(params.get("connect_uri"));
            std::env::set_var("LIBVIRT_DEFAULT_URI", &uri);
        }

        if let Some(hook) = HookCommand::from_params(&params, "pre")? {
            hook.run(&params, self.test.bindir())?;
        }

        if let Some(patch) = apply_kernel_patch(self.services.disks.as_ref(), &mut params, &self.env)? {
            self.kernel_patch = Some(patch);
        }

        if params.has("master_images_clone") {
            self.clone_master_images(&params)?;
        }

        if params.get_or("not_preprocess", "no") == "no" {
            process(
                &self.test,
                &params,
                &self.env,
                self.services.images.as_ref(),
                Phase::Preprocess,
            )?;
        }

        if params.is_yes("take_regular_screendumps") {
            self.screendump = Some(screendump::spawn(
                &params,
                Arc::clone(&self.test),
                Arc::clone(&self.env),
                Arc::clone(&self.services.codec),
            )?);
        }

        if params.is_yes("store_vm_register") && vm_type == VmType::Qemu {
            self.register = Some(register::spawn(
                &params,
                Arc::clone(&self.test),
                Arc::clone(&self.env),
            )?);
        }

        Ok(params)
    }

    /// Create a private bridge for NICs attached to `netdst=private`.
    fn setup_private_bridge(&mut self, params: &mut Params) -> Result<()> {
        let mut bridge = None;
        for nic in params.objects("nics") {
            let nic_params = params.object_params(&nic);
            if nic_params.get("netdst") != Some("private") {
                continue;
            }
            let config = BridgeConfig::from_nic_params(&nic_params);
            params.set(format!("netdst_{}", nic), config.name.as_str());
            bridge = Some(config);
        }

        if let Some(bridge) = bridge {
            tracing::info!(bridge = %bridge.name, kind = ?bridge.kind, "setting up private bridge");
            self.services.host.setup_bridge(&bridge)?;
            self.bridge = Some(bridge);
        }
        Ok(())
    }

    /// Set up iSCSI, LVM or NFS storage and point the images at it.
    fn setup_storage(&mut self, params: &mut Params) -> Result<()> {
        let Some(kind) = StorageKind::from_params(params) else {
            return Ok(());
        };
        let base_dir = params.images_base_dir();
        let mut device = self.services.storage.device(kind, params, &base_dir)?;
        let target = device.setup()?;
        tracing::info!(storage = kind.label(), target = %target, "storage set up");

        match kind {
            StorageKind::Iscsi => {
                params.set("image_name", target);
                params.set("image_raw_device", "yes");
            }
            StorageKind::Lvm => {
                params.set("image_name", target);
                params.set("image_raw_device", "yes");
                let key = format!("lvm_{}", params.get_or("main_vm", ""));
                self.env.register_lvmdev(&key, device);
            }
            StorageKind::Nfs => {
                let mount = Path::new(&target);
                let relocate = |name: &str| {
                    let file = Path::new(name).file_name().map(|f| f.to_os_string()).unwrap_or_default();
                    mount.join(file).to_string_lossy().into_owned()
                };
                let image_name = relocate(params.get_or("image_name", crate::storage::DEFAULT_IMAGE_NAME));
                params.set("image_name", image_name);
                for image in params.objects("images") {
                    let key = format!("image_name_{}", image);
                    if let Some(name) = params.get(&key).map(&relocate) {
                        params.set(key, name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply the requested host tuning steps.
    fn setup_tuning(&mut self, params: &mut Params, vm_type: &VmType) -> Result<()> {
        let host = Arc::clone(&self.services.host);

        for tuning in [Tuning::HugePages, Tuning::TransparentHugePages, Tuning::Ksm, Tuning::Egd] {
            if !tuning.requested(params) {
                continue;
            }
            tracing::debug!(step = tuning.label(), "applying host tuning");
            let suggested_mem = host.setup_tuning(tuning, params)?;
            if tuning == Tuning::HugePages {
                if let Some(mem) = suggested_mem {
                    params.set("mem", mem.to_string());
                }
                if *vm_type == VmType::Libvirt {
                    host.restart_libvirtd()?;
                }
            }
        }

        if *vm_type == VmType::Libvirt && Tuning::Polkit.requested(params) {
            if let Err(e) = host.setup_tuning(Tuning::Polkit, params) {
                tracing::error!(error = %e, "libvirt polkit setup failed");
            }
            host.restart_libvirtd()?;
        }
        Ok(())
    }

    /// Destroy the VMs and clone their master images.
    fn clone_master_images(&mut self, params: &Params) -> Result<()> {
        for vm_name in params.objects("vms") {
            if let Some(vm) = self.env.unregister_vm(&vm_name) {
                vm.destroy(true)?;
            }

            let vm_params = params.object_params(&vm_name);
            for image in vm_params.objects("master_images_clone") {
                let spec = ImageSpec::from_params(image.as_str(), vm_params.object_params(&image));
                tracing::info!(image = %image, vm = %vm_name, "cloning master image");
                self.services.images.clone_image(&spec, &vm_name)?;
            }
        }
        Ok(())
    }
}
